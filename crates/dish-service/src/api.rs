//! 菜品 HTTP 接口
//!
//! 厨师补货/上下架与顾客评分的入口。
//! 错误按分类映射到 HTTP 状态码：校验 400、不存在 404、
//! 业务冲突 409、其余 500。

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

use crate::error::DishError;
use crate::model::Dish;
use crate::service::DishService;

pub fn router(service: Arc<DishService>) -> Router {
    Router::new()
        .route("/dishes/{id}", get(get_dish))
        .route("/dishes/{id}/restock", post(restock))
        .route("/dishes/{id}/active", post(set_active))
        .route("/dishes/{id}/rating", post(add_rating))
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
struct RestockRequest {
    quantity: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveRequest {
    active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RatingRequest {
    rating: i32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DishResponse {
    #[serde(flatten)]
    dish: Dish,
    average_rating: Option<f64>,
}

impl From<Dish> for DishResponse {
    fn from(dish: Dish) -> Self {
        let average_rating = dish.average_rating();
        Self {
            dish,
            average_rating,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// 错误到 HTTP 响应的映射
struct ApiError(DishError);

impl From<DishError> for ApiError {
    fn from(e: DishError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            DishError::InvalidRating { .. } => (StatusCode::BAD_REQUEST, "INVALID_RATING"),
            DishError::Shared(shared) => {
                let status = match shared {
                    FlavoryError::NotFound { .. } => StatusCode::NOT_FOUND,
                    FlavoryError::Validation(_) => StatusCode::BAD_REQUEST,
                    e if e.is_conflict() => StatusCode::CONFLICT,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, shared.code())
            }
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self.0, "菜品接口内部错误");
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

async fn get_dish(
    State(service): State<Arc<DishService>>,
    Path(dish_id): Path<i64>,
) -> Result<Json<DishResponse>, ApiError> {
    let dish = service.get_dish(dish_id).await?;
    Ok(Json(dish.into()))
}

async fn restock(
    State(service): State<Arc<DishService>>,
    Path(dish_id): Path<i64>,
    Json(req): Json<RestockRequest>,
) -> Result<Json<DishResponse>, ApiError> {
    let dish = service.increase_stock(dish_id, req.quantity).await?;
    Ok(Json(dish.into()))
}

async fn set_active(
    State(service): State<Arc<DishService>>,
    Path(dish_id): Path<i64>,
    Json(req): Json<ActiveRequest>,
) -> Result<Json<DishResponse>, ApiError> {
    let dish = service.set_active(dish_id, req.active).await?;
    Ok(Json(dish.into()))
}

async fn add_rating(
    State(service): State<Arc<DishService>>,
    Path(dish_id): Path<i64>,
    Json(req): Json<RatingRequest>,
) -> Result<Json<DishResponse>, ApiError> {
    let dish = service.add_rating(dish_id, req.rating).await?;
    Ok(Json(dish.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shapes() {
        let req: RestockRequest = serde_json::from_str(r#"{"quantity": 10}"#).unwrap();
        assert_eq!(req.quantity, 10);

        let req: ActiveRequest = serde_json::from_str(r#"{"active": false}"#).unwrap();
        assert!(!req.active);
    }

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody {
            code: "INSUFFICIENT_STOCK",
            message: "库存不足".to_string(),
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"code\":\"INSUFFICIENT_STOCK\""));
    }
}
