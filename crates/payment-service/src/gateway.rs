//! 支付网关适配器
//!
//! 以 trait 形式抽象网关能力，业务层只依赖 trait，
//! 测试中用 mockall 替身验证调用序列。
//! 具体实现对接 Stripe 风格的 REST API（表单编码请求，JSON 响应）。

use async_trait::async_trait;
use bigdecimal::{BigDecimal, ToPrimitive};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

use flavory_shared::error::{FlavoryError, Result};

use crate::model::PaymentStatus;

const GATEWAY_NAME: &str = "stripe";
const REQUEST_TIMEOUT_SECS: u64 = 10;

// ---------------------------------------------------------------------------
// 数据类型
// ---------------------------------------------------------------------------

/// 网关侧的支付意向快照
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayIntent {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub latest_charge: Option<String>,
}

/// 网关侧的退款结果
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayRefund {
    pub id: String,
    pub status: String,
}

/// 网关错误响应体
#[derive(Debug, Deserialize)]
struct GatewayErrorBody {
    error: GatewayErrorDetail,
}

#[derive(Debug, Deserialize)]
struct GatewayErrorDetail {
    message: String,
}

// ---------------------------------------------------------------------------
// PaymentGateway trait
// ---------------------------------------------------------------------------

/// 支付网关能力抽象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// 创建支付意向，订单号写入 metadata 便于对账
    async fn create_intent(&self, order_id: i64, amount: &BigDecimal) -> Result<GatewayIntent>;

    /// 拉取意向最新状态（对账任务使用）
    async fn retrieve_intent(&self, intent_id: &str) -> Result<GatewayIntent>;

    /// 取消未完成的意向
    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayIntent>;

    /// 按金额退款
    async fn refund(&self, intent_id: &str, amount: &BigDecimal) -> Result<GatewayRefund>;
}

// ---------------------------------------------------------------------------
// 状态映射
// ---------------------------------------------------------------------------

/// 网关意向状态到本地支付状态的映射
///
/// `requires_payment_method` 出现在支付尝试失败后（意向回到待付款），
/// 本地视为失败。无法识别的状态返回 None，调用方忽略并记录日志，
/// 网关新增状态不会打挂消费链路。
pub fn map_intent_status(gateway_status: &str) -> Option<PaymentStatus> {
    match gateway_status {
        "succeeded" => Some(PaymentStatus::Succeeded),
        "requires_action" => Some(PaymentStatus::RequiresAction),
        "processing" => Some(PaymentStatus::Processing),
        "canceled" => Some(PaymentStatus::Cancelled),
        "requires_payment_method" | "payment_failed" => Some(PaymentStatus::Failed),
        _ => None,
    }
}

/// 创建意向时的幂等键，同一订单重试命中网关侧同一意向
///
/// 键只由订单号派生，创建请求超时重发或消息重投时，
/// 网关依据该键去重，不会为一张订单开出多个意向。
pub fn intent_idempotency_key(order_id: i64) -> String {
    format!("flavory-order-{order_id}-intent")
}

/// 退款请求的幂等键，每个意向只会全额退款一次
pub fn refund_idempotency_key(intent_id: &str) -> String {
    format!("flavory-refund-{intent_id}")
}

/// 金额转网关最小货币单位（分）
pub fn to_minor_units(amount: &BigDecimal) -> Result<i64> {
    (amount * BigDecimal::from(100))
        .with_scale(0)
        .to_i64()
        .ok_or_else(|| FlavoryError::InvalidAmount {
            amount: amount.clone(),
        })
}

// ---------------------------------------------------------------------------
// StripeGateway
// ---------------------------------------------------------------------------

/// Stripe 风格网关的 HTTP 实现
pub struct StripeGateway {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl StripeGateway {
    pub fn new(base_url: impl Into<String>, secret_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FlavoryError::Internal(format!("构造 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            secret_key: secret_key.into(),
        })
    }

    /// 发送表单请求并解析 JSON 响应
    ///
    /// 带幂等键的写请求在网关侧去重，重发不会重复扣款或重复开意向。
    async fn post_form<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        form: &[(&str, String)],
        idempotency_key: Option<&str>,
    ) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self
            .http
            .post(&url)
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .form(form);
        if let Some(key) = idempotency_key {
            request = request.header("Idempotency-Key", key);
        }
        let response = request.send().await.map_err(map_transport_error)?;

        parse_response(response).await
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .http
            .get(&url)
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .send()
            .await
            .map_err(map_transport_error)?;

        parse_response(response).await
    }
}

fn map_transport_error(e: reqwest::Error) -> FlavoryError {
    if e.is_timeout() {
        FlavoryError::ExternalGatewayTimeout {
            service: GATEWAY_NAME.to_string(),
        }
    } else {
        FlavoryError::ExternalGateway {
            service: GATEWAY_NAME.to_string(),
            message: e.to_string(),
        }
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(map_transport_error)?;

    if !status.is_success() {
        let message = serde_json::from_str::<GatewayErrorBody>(&body)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| format!("HTTP {status}"));
        return Err(FlavoryError::ExternalGateway {
            service: GATEWAY_NAME.to_string(),
            message,
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| FlavoryError::Serialization(format!("网关响应解析失败: {e}")))
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    #[instrument(skip(self, amount))]
    async fn create_intent(&self, order_id: i64, amount: &BigDecimal) -> Result<GatewayIntent> {
        let minor = to_minor_units(amount)?;
        let form = [
            ("amount", minor.to_string()),
            ("currency", "eur".to_string()),
            ("metadata[order_id]", order_id.to_string()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let intent: GatewayIntent = self
            .post_form(
                "/v1/payment_intents",
                &form,
                Some(&intent_idempotency_key(order_id)),
            )
            .await?;
        debug!(order_id, intent_id = %intent.id, "支付意向已创建");
        Ok(intent)
    }

    async fn retrieve_intent(&self, intent_id: &str) -> Result<GatewayIntent> {
        self.get(&format!("/v1/payment_intents/{intent_id}")).await
    }

    async fn cancel_intent(&self, intent_id: &str) -> Result<GatewayIntent> {
        self.post_form(&format!("/v1/payment_intents/{intent_id}/cancel"), &[], None)
            .await
    }

    async fn refund(&self, intent_id: &str, amount: &BigDecimal) -> Result<GatewayRefund> {
        let minor = to_minor_units(amount)?;
        let form = [
            ("payment_intent", intent_id.to_string()),
            ("amount", minor.to_string()),
        ];

        self.post_form("/v1/refunds", &form, Some(&refund_idempotency_key(intent_id)))
            .await
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_map_intent_status() {
        assert_eq!(
            map_intent_status("succeeded"),
            Some(PaymentStatus::Succeeded)
        );
        assert_eq!(
            map_intent_status("requires_action"),
            Some(PaymentStatus::RequiresAction)
        );
        assert_eq!(
            map_intent_status("processing"),
            Some(PaymentStatus::Processing)
        );
        assert_eq!(
            map_intent_status("canceled"),
            Some(PaymentStatus::Cancelled)
        );
        assert_eq!(
            map_intent_status("requires_payment_method"),
            Some(PaymentStatus::Failed)
        );
    }

    #[test]
    fn test_unknown_gateway_status_ignored() {
        assert_eq!(map_intent_status("requires_capture"), None);
        assert_eq!(map_intent_status(""), None);
    }

    #[test]
    fn test_to_minor_units() {
        let amount = BigDecimal::from_str("25.50").unwrap();
        assert_eq!(to_minor_units(&amount).unwrap(), 2550);

        let amount = BigDecimal::from_str("1.00").unwrap();
        assert_eq!(to_minor_units(&amount).unwrap(), 100);

        let amount = BigDecimal::from_str("10000.00").unwrap();
        assert_eq!(to_minor_units(&amount).unwrap(), 1_000_000);
    }

    #[test]
    fn test_idempotency_keys_stable_per_operation() {
        // 同一订单重试派生同一个键，不同订单互不串号
        assert_eq!(
            intent_idempotency_key(42),
            intent_idempotency_key(42)
        );
        assert_eq!(intent_idempotency_key(42), "flavory-order-42-intent");
        assert_ne!(intent_idempotency_key(42), intent_idempotency_key(43));

        assert_eq!(
            refund_idempotency_key("pi_123"),
            "flavory-refund-pi_123"
        );
    }

    #[test]
    fn test_intent_response_deserialization() {
        let json = r#"{
            "id": "pi_123",
            "status": "succeeded",
            "client_secret": "pi_123_secret",
            "latest_charge": "ch_456",
            "amount": 2550
        }"#;

        let intent: GatewayIntent = serde_json::from_str(json).unwrap();
        assert_eq!(intent.id, "pi_123");
        assert_eq!(intent.status, "succeeded");
        assert_eq!(intent.latest_charge.as_deref(), Some("ch_456"));
    }

    #[test]
    fn test_error_body_deserialization() {
        let json = r#"{"error": {"type": "card_error", "message": "Your card was declined."}}"#;
        let body: GatewayErrorBody = serde_json::from_str(json).unwrap();
        assert_eq!(body.error.message, "Your card was declined.");
    }
}
