//! 骑手平台适配器
//!
//! 以 trait 形式抽象骑手平台能力，业务层只依赖 trait，
//! 测试中用 mockall 替身验证调用序列。
//! 具体实现对接 Stuart 风格的 REST API：OAuth2 client_credentials
//! 获取短期访问令牌，JSON 请求创建配送任务。

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use flavory_shared::error::{FlavoryError, Result};
use flavory_shared::events::OrderReadyEvent;

use crate::model::DeliveryStatus;

const PROVIDER_NAME: &str = "stuart";
const REQUEST_TIMEOUT_SECS: u64 = 10;
/// 令牌到期前预留的安全余量，避免拿着临期令牌发请求
const TOKEN_EXPIRY_MARGIN_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// 数据类型
// ---------------------------------------------------------------------------

/// 提交给骑手平台的配送任务请求
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub client_reference: String,
    pub pickup_address: String,
    pub pickup_contact_firstname: String,
    pub pickup_contact_lastname: String,
    pub pickup_contact_phone: String,
    pub pickup_contact_company: String,
    pub dropoff_address: String,
    pub dropoff_contact_firstname: String,
    pub dropoff_contact_lastname: String,
    pub dropoff_contact_phone: String,
    pub package_description: String,
}

impl DispatchRequest {
    /// 从出餐就绪事件构造请求
    ///
    /// 平台要求联系人姓名拆成 first/last 两段；中文姓名没有
    /// 天然的空格分隔时整名落在 first，last 留空。
    pub fn from_ready_order(event: &OrderReadyEvent) -> Self {
        let (cook_first, cook_last) = split_contact_name(&event.cook_name);
        let (customer_first, customer_last) = split_contact_name(&event.customer_name);

        Self {
            client_reference: format!("ORDER_{}", event.order_id),
            pickup_address: event.pickup_address.clone(),
            pickup_contact_firstname: cook_first,
            pickup_contact_lastname: cook_last,
            pickup_contact_phone: event.cook_phone.clone(),
            pickup_contact_company: "Flavory Kitchen".to_string(),
            dropoff_address: event.delivery_address.clone(),
            dropoff_contact_firstname: customer_first,
            dropoff_contact_lastname: customer_last,
            dropoff_contact_phone: event.customer_phone.clone(),
            package_description: format!("Order #{} - Home-cooked meal", event.order_id),
        }
    }
}

/// 联系人姓名拆分：最后一个空格之前归 first，之后归 last
pub fn split_contact_name(full_name: &str) -> (String, String) {
    match full_name.trim().rsplit_once(' ') {
        Some((first, last)) => (first.to_string(), last.to_string()),
        None => (full_name.trim().to_string(), String::new()),
    }
}

/// 平台创建任务后返回的快照
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierJob {
    pub id: String,
    #[serde(default)]
    pub tracking_url: Option<String>,
    #[serde(default)]
    pub fee: Option<BigDecimal>,
    #[serde(default)]
    pub distance_meters: Option<i32>,
    #[serde(default)]
    pub estimated_pickup_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_delivery_at: Option<DateTime<Utc>>,
}

/// 平台错误响应体
#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    message: String,
}

// ---------------------------------------------------------------------------
// CourierDispatch trait
// ---------------------------------------------------------------------------

/// 骑手平台能力抽象
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CourierDispatch: Send + Sync {
    /// 创建配送任务
    async fn create_job(&self, request: &DispatchRequest) -> Result<CourierJob>;

    /// 取消配送任务
    async fn cancel_job(&self, job_id: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// 状态映射
// ---------------------------------------------------------------------------

/// 骑手平台 webhook 状态到本地配送状态的映射
///
/// 平台对同一阶段存在多个历史命名，全部兼容。
/// 无法识别的状态返回 None，调用方忽略并记录日志，
/// 平台新增状态不会打挂 webhook 链路。
pub fn map_courier_status(provider_status: &str) -> Option<DeliveryStatus> {
    match provider_status {
        "scheduled" => Some(DeliveryStatus::Scheduled),
        "courier_assigned" => Some(DeliveryStatus::CourierAssigned),
        "package_picked_up" => Some(DeliveryStatus::PickedUp),
        "package_picking_up" | "package_delivering" | "delivering" => {
            Some(DeliveryStatus::InTransit)
        }
        "package_delivered" | "delivered" => Some(DeliveryStatus::Delivered),
        "package_canceled" | "canceled" | "cancelled" => Some(DeliveryStatus::Cancelled),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// StuartDispatch
// ---------------------------------------------------------------------------

/// OAuth 访问令牌缓存
#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// 安全提前量已折算进 `expires_at`，到点即视为过期
    fn usable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    fn from_response(now: DateTime<Utc>, response: &TokenResponse) -> Self {
        Self {
            token: response.access_token.clone(),
            expires_at: now + Duration::seconds(response.expires_in - TOKEN_EXPIRY_MARGIN_SECS),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Stuart 风格骑手平台的 HTTP 实现
///
/// 访问令牌按实例缓存，临期前 5 分钟视为过期并重新申请。
pub struct StuartDispatch {
    http: reqwest::Client,
    base_url: String,
    client_id: String,
    client_secret: String,
    token: Mutex<Option<CachedToken>>,
}

impl StuartDispatch {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FlavoryError::Internal(format!("构造 HTTP 客户端失败: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token: Mutex::new(None),
        })
    }

    /// 取可用的访问令牌，缓存未过期时直接复用
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;

        if let Some(token) = cached.as_ref()
            && token.usable_at(Utc::now())
        {
            return Ok(token.token.clone());
        }

        let form = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("grant_type", "client_credentials"),
            ("scope", "api"),
        ];

        let response = self
            .http
            .post(format!("{}/oauth/token", self.base_url))
            .form(&form)
            .send()
            .await
            .map_err(map_transport_error)?;

        let response: TokenResponse = parse_response(response).await?;
        let refreshed = CachedToken::from_response(Utc::now(), &response);
        debug!(expires_at = %refreshed.expires_at, "骑手平台访问令牌已刷新");

        let access_token = refreshed.token.clone();
        *cached = Some(refreshed);
        Ok(access_token)
    }
}

fn map_transport_error(e: reqwest::Error) -> FlavoryError {
    if e.is_timeout() {
        FlavoryError::ExternalGatewayTimeout {
            service: PROVIDER_NAME.to_string(),
        }
    } else {
        FlavoryError::ExternalGateway {
            service: PROVIDER_NAME.to_string(),
            message: e.to_string(),
        }
    }
}

async fn parse_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await.map_err(map_transport_error)?;

    if !status.is_success() {
        let message = serde_json::from_str::<ProviderErrorBody>(&body)
            .map(|b| b.message)
            .unwrap_or_else(|_| format!("HTTP {status}"));
        return Err(FlavoryError::ExternalGateway {
            service: PROVIDER_NAME.to_string(),
            message,
        });
    }

    serde_json::from_str(&body)
        .map_err(|e| FlavoryError::Serialization(format!("骑手平台响应解析失败: {e}")))
}

#[async_trait]
impl CourierDispatch for StuartDispatch {
    #[instrument(skip(self, request), fields(client_reference = %request.client_reference))]
    async fn create_job(&self, request: &DispatchRequest) -> Result<CourierJob> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(format!("{}/v2/jobs", self.base_url))
            .bearer_auth(token)
            .json(request)
            .send()
            .await
            .map_err(map_transport_error)?;

        let job: CourierJob = parse_response(response).await?;
        debug!(job_id = %job.id, "骑手任务已创建");
        Ok(job)
    }

    async fn cancel_job(&self, job_id: &str) -> Result<()> {
        let token = self.access_token().await?;

        let response = self
            .http
            .post(format!("{}/v2/jobs/{job_id}/cancel", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ProviderErrorBody>(&body)
                .map(|b| b.message)
                .unwrap_or_else(|_| format!("HTTP {status}"));
            return Err(FlavoryError::ExternalGateway {
                service: PROVIDER_NAME.to_string(),
                message,
            });
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ready_event() -> OrderReadyEvent {
        OrderReadyEvent {
            order_id: 42,
            cook_id: 7,
            customer_id: 3,
            pickup_address: "12 Rue de la Paix, 75002 Paris".to_string(),
            delivery_address: "8 Avenue Foch, apt 5, 75116 Paris".to_string(),
            cook_name: "Marie Dubois".to_string(),
            cook_phone: "+33611111111".to_string(),
            customer_name: "Jean Paul Martin".to_string(),
            customer_phone: "+33622222222".to_string(),
        }
    }

    #[test]
    fn test_split_contact_name() {
        assert_eq!(
            split_contact_name("Marie Dubois"),
            ("Marie".to_string(), "Dubois".to_string())
        );
        // 多段姓名：最后一段归 last
        assert_eq!(
            split_contact_name("Jean Paul Martin"),
            ("Jean Paul".to_string(), "Martin".to_string())
        );
        // 无空格的姓名整体归 first
        assert_eq!(
            split_contact_name("王小明"),
            ("王小明".to_string(), String::new())
        );
    }

    #[test]
    fn test_dispatch_request_from_ready_order() {
        let request = DispatchRequest::from_ready_order(&ready_event());

        assert_eq!(request.client_reference, "ORDER_42");
        assert_eq!(request.pickup_contact_firstname, "Marie");
        assert_eq!(request.pickup_contact_lastname, "Dubois");
        assert_eq!(request.pickup_contact_company, "Flavory Kitchen");
        assert_eq!(request.dropoff_contact_firstname, "Jean Paul");
        assert_eq!(request.dropoff_contact_lastname, "Martin");
        assert_eq!(
            request.package_description,
            "Order #42 - Home-cooked meal"
        );
    }

    #[test]
    fn test_map_courier_status() {
        assert_eq!(
            map_courier_status("courier_assigned"),
            Some(DeliveryStatus::CourierAssigned)
        );
        assert_eq!(
            map_courier_status("package_picked_up"),
            Some(DeliveryStatus::PickedUp)
        );
        // 同一阶段的历史命名全部兼容
        for s in ["package_delivering", "delivering", "package_picking_up"] {
            assert_eq!(map_courier_status(s), Some(DeliveryStatus::InTransit));
        }
        for s in ["package_delivered", "delivered"] {
            assert_eq!(map_courier_status(s), Some(DeliveryStatus::Delivered));
        }
        for s in ["package_canceled", "canceled", "cancelled"] {
            assert_eq!(map_courier_status(s), Some(DeliveryStatus::Cancelled));
        }
    }

    #[test]
    fn test_unknown_courier_status_ignored() {
        assert_eq!(map_courier_status("searching"), None);
        assert_eq!(map_courier_status(""), None);
    }

    #[test]
    fn test_token_cache_applies_expiry_margin() {
        let now = Utc::now();
        let response = TokenResponse {
            access_token: "tok-1".to_string(),
            expires_in: 3600,
        };
        let cached = CachedToken::from_response(now, &response);

        // 有效期 1 小时，临期前 5 分钟即视为过期
        assert!(cached.usable_at(now + Duration::seconds(3299)));
        assert!(!cached.usable_at(now + Duration::seconds(3300)));
        assert_eq!(cached.token, "tok-1");
    }

    #[test]
    fn test_job_response_deserialization() {
        let json = r#"{
            "id": "job-100",
            "trackingUrl": "https://track.example/job-100",
            "fee": "6.50",
            "distanceMeters": 3200,
            "estimatedPickupAt": "2025-01-15T11:30:00Z",
            "estimatedDeliveryAt": "2025-01-15T12:00:00Z"
        }"#;

        let job: CourierJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.id, "job-100");
        assert_eq!(job.distance_meters, Some(3200));
        assert!(job.tracking_url.is_some());
    }

    #[test]
    fn test_job_response_with_minimal_fields() {
        let job: CourierJob = serde_json::from_str(r#"{"id": "job-1"}"#).unwrap();
        assert_eq!(job.id, "job-1");
        assert!(job.fee.is_none());
        assert!(job.estimated_pickup_at.is_none());
    }
}
