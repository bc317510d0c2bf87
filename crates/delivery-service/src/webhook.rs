//! 骑手平台 webhook 接入
//!
//! 平台把任务状态变化推送到 `/webhooks/delivery`。
//! 负载必须携带 HMAC-SHA256 签名（`X-Webhook-Signature` 头，十六进制），
//! 校验失败一律 401，不进入业务处理。
//! 返回 2xx 表示已消化（包括按规则忽略的情况），5xx 让平台按自身策略重推。

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use flavory_shared::error::FlavoryError;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use flavory_shared::signature;

use crate::error::DeliveryError;
use crate::model::Delivery;
use crate::service::{CourierStatusUpdate, DeliveryService};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// webhook 路由的共享状态
pub struct WebhookState {
    pub service: Arc<DeliveryService>,
    pub secret: Vec<u8>,
}

/// 平台推送的事件外壳
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourierWebhookEvent {
    job_id: String,
    status: String,
    #[serde(default)]
    courier: Option<CourierContact>,
    #[serde(default)]
    tracking_url: Option<String>,
    #[serde(default)]
    cancel_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CourierContact {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    phone: Option<String>,
}

impl From<CourierWebhookEvent> for CourierStatusUpdate {
    fn from(event: CourierWebhookEvent) -> Self {
        let (courier_name, courier_phone) = match event.courier {
            Some(c) => (c.name, c.phone),
            None => (None, None),
        };
        Self {
            job_id: event.job_id,
            status: event.status,
            courier_name,
            courier_phone,
            tracking_url: event.tracking_url,
            cancel_reason: event.cancel_reason,
        }
    }
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/delivery", post(handle_webhook))
        .route("/deliveries/{id}/cancel", post(cancel_delivery))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

// ---------------------------------------------------------------------------
// 运营取消
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest {
    reason: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

/// 错误到 HTTP 响应的映射
struct ApiError(DeliveryError);

impl From<DeliveryError> for ApiError {
    fn from(e: DeliveryError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            DeliveryError::UnknownCourierJob { .. } => (StatusCode::NOT_FOUND, "UNKNOWN_JOB"),
            DeliveryError::UnrecognizedCourierStatus { .. } => {
                (StatusCode::BAD_REQUEST, "UNRECOGNIZED_STATUS")
            }
            DeliveryError::Shared(shared) => {
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
            error!(error = %self.0, "配送接口内部错误");
        }

        let body = ErrorBody {
            code,
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// 运营取消配送；骑手已接单的配送返回 409
async fn cancel_delivery(
    State(state): State<Arc<WebhookState>>,
    Path(delivery_id): Path<i64>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<Delivery>, ApiError> {
    let delivery = state
        .service
        .cancel_delivery(delivery_id, &req.reason)
        .await?;
    Ok(Json(delivery))
}

async fn handle_webhook(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let Some(sig) = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok()) else {
        warn!("webhook 缺少签名头，拒绝");
        return StatusCode::UNAUTHORIZED;
    };

    if let Err(e) = signature::verify(&state.secret, &body, sig) {
        warn!(error = %e, "webhook 签名校验失败，拒绝");
        return StatusCode::UNAUTHORIZED;
    }

    let event = match parse_webhook(&body) {
        Ok(event) => event,
        Err(e) => {
            warn!(error = %e, "webhook 负载解析失败");
            return StatusCode::BAD_REQUEST;
        }
    };

    info!(
        job_id = %event.job_id,
        status = %event.status,
        "收到骑手平台 webhook"
    );

    let update = CourierStatusUpdate::from(event);
    match state.service.apply_courier_update(&update).await {
        Ok(()) => StatusCode::OK,
        // 本地没有这个任务：可能属于其他环境，消化掉避免平台无限重推
        Err(DeliveryError::UnknownCourierJob { job_id }) => {
            warn!(job_id, "webhook 指向未知骑手任务，忽略");
            StatusCode::OK
        }
        Err(e) => {
            error!(error = %e, "webhook 处理失败");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn parse_webhook(body: &[u8]) -> Result<CourierWebhookEvent, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webhook_event() {
        let body = br#"{
            "jobId": "job-100",
            "status": "package_picked_up",
            "courier": {"name": "Ali K.", "phone": "+33633333333"},
            "trackingUrl": "https://track.example/job-100"
        }"#;

        let event = parse_webhook(body).unwrap();
        assert_eq!(event.job_id, "job-100");
        assert_eq!(event.status, "package_picked_up");

        let update = CourierStatusUpdate::from(event);
        assert_eq!(update.courier_name.as_deref(), Some("Ali K."));
        assert_eq!(update.courier_phone.as_deref(), Some("+33633333333"));
        assert!(update.tracking_url.is_some());
    }

    #[test]
    fn test_parse_webhook_without_courier() {
        let body = br#"{"jobId": "job-1", "status": "scheduled"}"#;
        let event = parse_webhook(body).unwrap();
        let update = CourierStatusUpdate::from(event);
        assert!(update.courier_name.is_none());
        assert!(update.cancel_reason.is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_webhook(b"not json").is_err());
        assert!(parse_webhook(br#"{"status":"delivered"}"#).is_err());
    }

    #[test]
    fn test_signature_round_trip_with_header_scheme() {
        let secret = b"whsec_courier";
        let body = br#"{"jobId":"job-1","status":"delivered"}"#;
        let sig = signature::sign(secret, body);
        assert!(signature::verify(secret, body, &sig).is_ok());
        assert!(signature::verify(secret, b"tampered", &sig).is_err());
    }
}
