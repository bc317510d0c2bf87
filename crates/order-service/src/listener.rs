//! 支付与配送事件监听
//!
//! 订单是 saga 的汇聚点：同一个消费者订阅支付、配送两个 topic，
//! 按事件类型把状态变化折叠进订单生命周期。
//! 处理失败的消息进入死信队列按预算重投。

use flavory_shared::broker::{BusConsumer, ConsumerMessage, topics};
use flavory_shared::config::AppConfig;
use flavory_shared::dlq::DlqProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{
    DeliveryCompletedEvent, DeliveryPickedUpEvent, DeliveryStartedEvent, EventEnvelope, EventKind,
    PaymentCancelledEvent, PaymentFailedEvent, PaymentRefundedEvent, PaymentSucceededEvent,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::OrderError;
use crate::service::OrderService;

pub struct SagaEventListener {
    consumer: BusConsumer,
    service: Arc<OrderService>,
    dlq: DlqProducer,
}

impl SagaEventListener {
    pub fn new(
        config: &AppConfig,
        service: Arc<OrderService>,
        dlq: DlqProducer,
    ) -> Result<Self, OrderError> {
        let consumer = BusConsumer::new(&config.broker, Some("order-service"))?;
        Ok(Self {
            consumer,
            service,
            dlq,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), OrderError> {
        self.consumer
            .subscribe(&[topics::PAYMENT_EVENTS, topics::DELIVERY_EVENTS])?;
        info!(
            payment_topic = topics::PAYMENT_EVENTS,
            delivery_topic = topics::DELIVERY_EVENTS,
            "订单服务事件监听已启动"
        );

        let service = self.service;
        let dlq = self.dlq;

        self.consumer
            .start(shutdown, |msg| {
                let service = Arc::clone(&service);
                let dlq = &dlq;
                async move {
                    if let Err(e) = handle_message(&service, &msg).await {
                        error!(
                            error = %e,
                            topic = %msg.topic,
                            offset = msg.offset,
                            "处理 saga 事件失败，发送到死信队列"
                        );
                        let message_id = message_id_of(&msg);
                        if let Err(dlq_err) =
                            dlq.send_to_dlq(&msg, &message_id, &e.to_string()).await
                        {
                            error!(error = %dlq_err, "写入死信队列失败，消息可能丢失");
                        }
                    }
                    Ok(())
                }
            })
            .await;

        info!("订单服务事件监听已停止");
        Ok(())
    }
}

/// 支付、配送事件到订单生命周期的折叠
pub async fn handle_message(
    service: &OrderService,
    msg: &ConsumerMessage,
) -> Result<(), OrderError> {
    let envelope: EventEnvelope<serde_json::Value> = msg.deserialize_payload()?;
    let event_id = envelope.event_id.as_deref();

    match envelope.kind {
        EventKind::PaymentSucceeded => {
            let payload: PaymentSucceededEvent = decode(envelope.payload)?;
            service.apply_payment_succeeded(event_id, &payload).await
        }
        EventKind::PaymentFailed => {
            let payload: PaymentFailedEvent = decode(envelope.payload)?;
            service.apply_payment_failed(event_id, &payload).await
        }
        EventKind::PaymentCancelled => {
            let payload: PaymentCancelledEvent = decode(envelope.payload)?;
            service.apply_payment_cancelled(event_id, &payload).await
        }
        EventKind::PaymentRefunded => {
            let payload: PaymentRefundedEvent = decode(envelope.payload)?;
            service.apply_payment_refunded(event_id, &payload).await
        }
        EventKind::DeliveryPickedUp => {
            let payload: DeliveryPickedUpEvent = decode(envelope.payload)?;
            service
                .apply_delivery_underway(event_id, payload.order_id)
                .await
        }
        EventKind::DeliveryStarted => {
            let payload: DeliveryStartedEvent = decode(envelope.payload)?;
            service
                .apply_delivery_underway(event_id, payload.order_id)
                .await
        }
        EventKind::DeliveryCompleted => {
            let payload: DeliveryCompletedEvent = decode(envelope.payload)?;
            service.apply_delivery_completed(event_id, &payload).await
        }
        other => {
            debug!(kind = %other, "与订单生命周期无关的事件，跳过");
            Ok(())
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: serde_json::Value) -> Result<T, OrderError> {
    serde_json::from_value(payload).map_err(|e| {
        OrderError::Shared(FlavoryError::Serialization(format!("负载解析失败: {e}")))
    })
}

fn message_id_of(msg: &ConsumerMessage) -> String {
    serde_json::from_slice::<EventEnvelope<serde_json::Value>>(&msg.payload)
        .ok()
        .and_then(|e| e.event_id)
        .or_else(|| msg.key.clone())
        .unwrap_or_else(|| Uuid::now_v7().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashMap;

    #[test]
    fn test_message_id_extraction() {
        let json = br#"{"eventId":"evt-11","kind":"payment.succeeded","occurredAt":"2025-01-15T10:00:00Z","payload":{}}"#;
        let msg = ConsumerMessage {
            topic: topics::PAYMENT_EVENTS.to_string(),
            partition: 0,
            offset: 0,
            key: Some("order-9".to_string()),
            payload: json.to_vec(),
            timestamp: Some(Utc::now().timestamp_millis()),
            headers: HashMap::new(),
        };
        assert_eq!(message_id_of(&msg), "evt-11");
    }

    #[test]
    fn test_decode_typed_payload() {
        let value = serde_json::json!({
            "paymentId": 3,
            "orderId": 9,
            "amount": "40.00",
            "paidAt": "2025-01-15T10:05:00Z"
        });
        let payload: PaymentSucceededEvent = decode(value).unwrap();
        assert_eq!(payload.order_id, 9);

        let garbage = serde_json::json!({"orderId": "not-a-number"});
        assert!(decode::<PaymentSucceededEvent>(garbage).is_err());
    }
}
