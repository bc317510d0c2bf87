//! 支付网关 webhook 接入
//!
//! 网关把意向状态变化推送到 `/webhooks/payment`。
//! 负载必须携带 HMAC-SHA256 签名（`X-Webhook-Signature` 头，十六进制），
//! 校验失败一律 401，不进入业务处理。
//! 返回 2xx 表示已消化（包括按规则忽略的情况），5xx 让网关按自身策略重推。

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use serde::Deserialize;
use tracing::{error, info, warn};

use flavory_shared::signature;

use crate::error::PaymentError;
use crate::gateway::GatewayIntent;
use crate::service::PaymentService;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// webhook 路由的共享状态
pub struct WebhookState {
    pub service: Arc<PaymentService>,
    pub secret: Vec<u8>,
}

/// 网关推送的事件外壳
#[derive(Debug, Deserialize)]
struct GatewayWebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: GatewayWebhookData,
}

#[derive(Debug, Deserialize)]
struct GatewayWebhookData {
    object: GatewayIntent,
}

pub fn router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route("/webhooks/payment", post(handle_webhook))
        .route("/health", get(health))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
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
        event_type = %event.event_type,
        intent_id = %event.data.object.id,
        "收到网关 webhook"
    );

    match state.service.apply_gateway_update(&event.data.object).await {
        Ok(()) => StatusCode::OK,
        // 本地没有这笔意向：可能属于其他环境，消化掉避免网关无限重推
        Err(PaymentError::UnknownIntent { intent_id }) => {
            warn!(intent_id, "webhook 指向未知支付意向，忽略");
            StatusCode::OK
        }
        Err(e) => {
            error!(error = %e, "webhook 处理失败");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn parse_webhook(body: &[u8]) -> Result<GatewayWebhookEvent, serde_json::Error> {
    serde_json::from_slice(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webhook_event() {
        let body = br#"{
            "type": "payment_intent.succeeded",
            "data": {
                "object": {
                    "id": "pi_123",
                    "status": "succeeded",
                    "latest_charge": "ch_456"
                }
            }
        }"#;

        let event = parse_webhook(body).unwrap();
        assert_eq!(event.event_type, "payment_intent.succeeded");
        assert_eq!(event.data.object.id, "pi_123");
        assert_eq!(event.data.object.status, "succeeded");
        assert_eq!(event.data.object.latest_charge.as_deref(), Some("ch_456"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_webhook(b"not json").is_err());
        assert!(parse_webhook(br#"{"type":"x"}"#).is_err());
    }

    #[test]
    fn test_signature_round_trip_with_header_scheme() {
        let secret = b"whsec_payment";
        let body = br#"{"type":"payment_intent.succeeded"}"#;
        let sig = signature::sign(secret, body);
        assert!(signature::verify(secret, body, &sig).is_ok());
        assert!(signature::verify(secret, b"tampered", &sig).is_err());
    }
}
