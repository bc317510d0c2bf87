//! 跨服务事件定义
//!
//! 定义 saga 流程中所有跨服务事件的统一信封与类型化负载。
//! 信封携带可选的 `event_id`（UUID v7）供消费方做幂等去重；
//! 历史生产者发出的事件可能缺失该字段，此时消费方跳过去重直接处理。
//!
//! 线上格式为 camelCase JSON，与既有消费方保持兼容。

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{BusProducer, topics};
use crate::error::{FlavoryError, Result};

// ---------------------------------------------------------------------------
// EventKind — 事件类型与路由
// ---------------------------------------------------------------------------

/// 事件类型
///
/// 序列化为点分路由键（如 `order.placed`），同时决定事件发布到哪个 topic。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "order.placed")]
    OrderPlaced,
    #[serde(rename = "order.ready")]
    OrderReady,
    #[serde(rename = "order.completed")]
    OrderCompleted,
    #[serde(rename = "order.cancelled")]
    OrderCancelled,

    #[serde(rename = "payment.created")]
    PaymentCreated,
    #[serde(rename = "payment.succeeded")]
    PaymentSucceeded,
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    #[serde(rename = "payment.cancelled")]
    PaymentCancelled,
    #[serde(rename = "payment.refunded")]
    PaymentRefunded,

    #[serde(rename = "delivery.started")]
    DeliveryStarted,
    #[serde(rename = "delivery.picked_up")]
    DeliveryPickedUp,
    #[serde(rename = "delivery.completed")]
    DeliveryCompleted,

    #[serde(rename = "dish.availability.changed")]
    DishAvailabilityChanged,

    #[serde(rename = "user.updated")]
    UserUpdated,
}

impl EventKind {
    /// 事件的路由键，写入消息 header 供消费方过滤
    pub fn routing_key(&self) -> &'static str {
        match self {
            Self::OrderPlaced => "order.placed",
            Self::OrderReady => "order.ready",
            Self::OrderCompleted => "order.completed",
            Self::OrderCancelled => "order.cancelled",
            Self::PaymentCreated => "payment.created",
            Self::PaymentSucceeded => "payment.succeeded",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentCancelled => "payment.cancelled",
            Self::PaymentRefunded => "payment.refunded",
            Self::DeliveryStarted => "delivery.started",
            Self::DeliveryPickedUp => "delivery.picked_up",
            Self::DeliveryCompleted => "delivery.completed",
            Self::DishAvailabilityChanged => "dish.availability.changed",
            Self::UserUpdated => "user.updated",
        }
    }

    /// 事件所属的业务域 topic
    pub fn topic(&self) -> &'static str {
        match self {
            Self::OrderPlaced | Self::OrderReady | Self::OrderCompleted | Self::OrderCancelled => {
                topics::ORDER_EVENTS
            }
            Self::PaymentCreated
            | Self::PaymentSucceeded
            | Self::PaymentFailed
            | Self::PaymentCancelled
            | Self::PaymentRefunded => topics::PAYMENT_EVENTS,
            Self::DeliveryStarted | Self::DeliveryPickedUp | Self::DeliveryCompleted => {
                topics::DELIVERY_EVENTS
            }
            Self::DishAvailabilityChanged => topics::DISH_EVENTS,
            Self::UserUpdated => topics::USER_EVENTS,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.routing_key())
    }
}

// ---------------------------------------------------------------------------
// EventEnvelope — 统一事件信封
// ---------------------------------------------------------------------------

/// 事件信封
///
/// 统一包装所有跨服务事件：`event_id` 用于消费端去重（可能缺失），
/// `kind` 决定路由，`payload` 为类型化的业务负载。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope<T> {
    /// 事件唯一标识（UUID v7，按时间有序）；历史生产者可能不携带
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: T,
}

impl<T: Serialize> EventEnvelope<T> {
    /// 构造携带新 UUID v7 事件标识的信封
    pub fn new(kind: EventKind, payload: T) -> Self {
        Self {
            event_id: Some(Uuid::now_v7().to_string()),
            kind,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// 序列化为线上 JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| FlavoryError::Serialization(format!("事件序列化失败: {e}")))
    }

    /// 发布到事件类型对应的 topic
    ///
    /// `key` 取业务实体标识（如订单 ID），保证同一实体的事件有序。
    pub async fn publish(&self, producer: &BusProducer, key: &str) -> Result<()> {
        producer
            .send_json(self.kind.topic(), self.kind.routing_key(), key, self)
            .await
            .map(|_| ())
    }
}

impl<T: DeserializeOwned> EventEnvelope<T> {
    /// 从线上 JSON 反序列化
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| FlavoryError::Serialization(format!("事件反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// 订单域事件负载
// ---------------------------------------------------------------------------

/// 订单中的一行菜品
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLineItem {
    pub dish_id: i64,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlacedEvent {
    pub order_id: i64,
    pub customer_id: i64,
    pub cook_id: i64,
    pub total_amount: BigDecimal,
    pub items: Vec<OrderLineItem>,
}

/// 出餐就绪事件
///
/// 携带配送服务创建骑手任务所需的全部快照：
/// 地址与联系人在下单时刻定格，后续用户资料变更不影响在途订单。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderReadyEvent {
    pub order_id: i64,
    pub cook_id: i64,
    pub customer_id: i64,
    pub pickup_address: String,
    pub delivery_address: String,
    pub cook_name: String,
    pub cook_phone: String,
    pub customer_name: String,
    pub customer_phone: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCompletedEvent {
    pub order_id: i64,
    pub customer_id: i64,
    pub cook_id: i64,
    pub items: Vec<OrderLineItem>,
}

/// 订单取消事件
///
/// 携带订单明细，供菜品服务回补已扣减的库存。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelledEvent {
    pub order_id: i64,
    pub reason: String,
    #[serde(default)]
    pub items: Vec<OrderLineItem>,
}

// ---------------------------------------------------------------------------
// 支付域事件负载
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCreatedEvent {
    pub payment_id: i64,
    pub order_id: i64,
    pub amount: BigDecimal,
    pub gateway_intent_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSucceededEvent {
    pub payment_id: i64,
    pub order_id: i64,
    pub amount: BigDecimal,
    pub paid_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailedEvent {
    pub payment_id: i64,
    pub order_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentCancelledEvent {
    pub payment_id: i64,
    pub order_id: i64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRefundedEvent {
    pub payment_id: i64,
    pub order_id: i64,
    pub amount: BigDecimal,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// 配送域事件负载
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStartedEvent {
    pub delivery_id: i64,
    pub order_id: i64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPickedUpEvent {
    pub delivery_id: i64,
    pub order_id: i64,
    pub picked_up_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryCompletedEvent {
    pub delivery_id: i64,
    pub order_id: i64,
    pub delivered_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 菜品域与用户域事件负载
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DishAvailabilityChangedEvent {
    pub dish_id: i64,
    pub available: bool,
    pub stock: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdatedEvent {
    pub user_id: i64,
    pub display_name: Option<String>,
    pub phone: Option<String>,
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_routing_key_matches_serde_rename() {
        for kind in [
            EventKind::OrderPlaced,
            EventKind::PaymentSucceeded,
            EventKind::DeliveryCompleted,
            EventKind::DishAvailabilityChanged,
            EventKind::UserUpdated,
        ] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.routing_key()));
        }
    }

    #[test]
    fn test_topic_mapping() {
        assert_eq!(EventKind::OrderPlaced.topic(), topics::ORDER_EVENTS);
        assert_eq!(EventKind::OrderCancelled.topic(), topics::ORDER_EVENTS);
        assert_eq!(EventKind::PaymentRefunded.topic(), topics::PAYMENT_EVENTS);
        assert_eq!(EventKind::DeliveryStarted.topic(), topics::DELIVERY_EVENTS);
        assert_eq!(
            EventKind::DishAvailabilityChanged.topic(),
            topics::DISH_EVENTS
        );
        assert_eq!(EventKind::UserUpdated.topic(), topics::USER_EVENTS);
    }

    #[test]
    fn test_envelope_new_assigns_event_id() {
        let envelope = EventEnvelope::new(
            EventKind::OrderCancelled,
            OrderCancelledEvent {
                order_id: 7,
                reason: "支付失败".to_string(),
                items: Vec::new(),
            },
        );

        let event_id = envelope.event_id.as_deref().unwrap();
        // UUID v7 可解析
        assert!(Uuid::from_str(event_id).is_ok());
        assert_eq!(envelope.kind, EventKind::OrderCancelled);
    }

    #[test]
    fn test_envelope_camel_case_wire_format() {
        let envelope = EventEnvelope::new(
            EventKind::PaymentSucceeded,
            PaymentSucceededEvent {
                payment_id: 11,
                order_id: 42,
                amount: BigDecimal::from_str("25.50").unwrap(),
                paid_at: Utc::now(),
            },
        );

        let json = String::from_utf8(envelope.to_json().unwrap()).unwrap();
        assert!(json.contains("\"eventId\""));
        assert!(json.contains("\"occurredAt\""));
        assert!(json.contains("\"kind\":\"payment.succeeded\""));
        assert!(json.contains("\"paymentId\":11"));
        assert!(json.contains("\"orderId\":42"));
    }

    #[test]
    fn test_envelope_without_event_id_deserializes() {
        // 历史生产者不携带 eventId 字段
        let json = br#"{
            "kind": "order.placed",
            "occurredAt": "2025-01-15T10:00:00Z",
            "payload": {
                "orderId": 1,
                "customerId": 2,
                "cookId": 3,
                "totalAmount": "30.00",
                "items": [{"dishId": 5, "quantity": 2, "unitPrice": "15.00"}]
            }
        }"#;

        let envelope: EventEnvelope<OrderPlacedEvent> = EventEnvelope::from_json(json).unwrap();
        assert!(envelope.event_id.is_none());
        assert_eq!(envelope.payload.order_id, 1);
        assert_eq!(envelope.payload.items.len(), 1);
    }

    #[test]
    fn test_cancelled_event_without_items_deserializes() {
        // 旧生产者的取消事件不携带 items 字段
        let json = r#"{
            "kind": "order.cancelled",
            "occurredAt": "2025-01-15T10:00:00Z",
            "payload": {"orderId": 7, "reason": "支付失败"}
        }"#
        .as_bytes();

        let envelope: EventEnvelope<OrderCancelledEvent> = EventEnvelope::from_json(json).unwrap();
        assert!(envelope.payload.items.is_empty());
        assert_eq!(envelope.payload.order_id, 7);
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = EventEnvelope::new(
            EventKind::DeliveryCompleted,
            DeliveryCompletedEvent {
                delivery_id: 3,
                order_id: 9,
                delivered_at: Utc::now(),
            },
        );

        let bytes = envelope.to_json().unwrap();
        let restored: EventEnvelope<DeliveryCompletedEvent> =
            EventEnvelope::from_json(&bytes).unwrap();

        assert_eq!(restored.event_id, envelope.event_id);
        assert_eq!(restored.payload.delivery_id, 3);
        assert_eq!(restored.payload.order_id, 9);
    }
}
