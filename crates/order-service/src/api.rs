//! 订单 HTTP 接口
//!
//! 顾客下单/取消/评分与厨师推进备餐进度的入口。
//! 错误按分类映射到 HTTP 状态码：校验 400、权限 403、
//! 不存在 404、业务冲突 409、其余 500。

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use flavory_shared::error::FlavoryError;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::OrderError;
use crate::model::{NewOrder, Order, OrderItem, OrderStatus};
use crate::service::OrderService;

pub fn router(service: Arc<OrderService>) -> Router {
    Router::new()
        .route("/orders", post(place_order))
        .route("/orders/{id}", get(get_order))
        .route("/orders/{id}/advance", post(advance_order))
        .route("/orders/{id}/cancel", post(cancel_order))
        .route("/orders/{id}/rating", post(rate_order))
        .route("/health", get(health))
        .with_state(service)
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// 请求/响应
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AdvanceRequest {
    cook_id: i64,
    target: OrderStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    customer_id: i64,
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RatingRequest {
    customer_id: i64,
    rating: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    #[serde(flatten)]
    order: Order,
    #[serde(skip_serializing_if = "Option::is_none")]
    items: Option<Vec<OrderItem>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// 错误到 HTTP 响应的映射
struct ApiError(OrderError);

impl From<OrderError> for ApiError {
    fn from(e: OrderError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            OrderError::NotRateable { .. } => (StatusCode::CONFLICT, "NOT_RATEABLE"),
            OrderError::Shared(shared) => {
                let status = match shared {
                    FlavoryError::NotFound { .. } => StatusCode::NOT_FOUND,
                    FlavoryError::Unauthorized => StatusCode::FORBIDDEN,
                    FlavoryError::Validation(_) | FlavoryError::InvalidAmount { .. } => {
                        StatusCode::BAD_REQUEST
                    }
                    e if e.is_conflict() => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, shared.code())
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "订单接口内部错误");
        }

        let body = ErrorBody {
            code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// 处理器
// ---------------------------------------------------------------------------

async fn place_order(
    State(service): State<Arc<OrderService>>,
    Json(new): Json<NewOrder>,
) -> Result<(StatusCode, Json<OrderResponse>), ApiError> {
    let order = service.place_order(&new).await?;
    Ok((
        StatusCode::CREATED,
        Json(OrderResponse { order, items: None }),
    ))
}

async fn get_order(
    State(service): State<Arc<OrderService>>,
    Path(order_id): Path<i64>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service.get_order(order_id).await?;
    let items = service.get_items(order_id).await?;
    Ok(Json(OrderResponse {
        order,
        items: Some(items),
    }))
}

async fn advance_order(
    State(service): State<Arc<OrderService>>,
    Path(order_id): Path<i64>,
    Json(req): Json<AdvanceRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service
        .advance_by_cook(order_id, req.cook_id, req.target)
        .await?;
    Ok(Json(OrderResponse { order, items: None }))
}

async fn cancel_order(
    State(service): State<Arc<OrderService>>,
    Path(order_id): Path<i64>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service
        .cancel_by_customer(order_id, req.customer_id, &req.reason)
        .await?;
    Ok(Json(OrderResponse { order, items: None }))
}

async fn rate_order(
    State(service): State<Arc<OrderService>>,
    Path(order_id): Path<i64>,
    Json(req): Json<RatingRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order = service
        .rate_order(order_id, req.customer_id, req.rating)
        .await?;
    Ok(Json(OrderResponse { order, items: None }))
}
