//! 订单事件监听
//!
//! 消费 order.placed，为新订单创建支付意向。
//! 处理失败的消息进入死信队列按预算重投。

use flavory_shared::broker::{BusConsumer, ConsumerMessage, topics};
use flavory_shared::config::AppConfig;
use flavory_shared::dlq::DlqProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{EventEnvelope, EventKind, OrderPlacedEvent};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::service::PaymentService;

pub struct OrderEventListener {
    consumer: BusConsumer,
    service: Arc<PaymentService>,
    dlq: DlqProducer,
}

impl OrderEventListener {
    pub fn new(
        config: &AppConfig,
        service: Arc<PaymentService>,
        dlq: DlqProducer,
    ) -> Result<Self, PaymentError> {
        let consumer = BusConsumer::new(&config.broker, Some("payment-service"))?;
        Ok(Self {
            consumer,
            service,
            dlq,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), PaymentError> {
        self.consumer.subscribe(&[topics::ORDER_EVENTS])?;
        info!(topic = topics::ORDER_EVENTS, "支付服务订单事件监听已启动");

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
                            "处理订单事件失败，发送到死信队列"
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

        info!("支付服务订单事件监听已停止");
        Ok(())
    }
}

/// 只关心 order.placed，其余订单事件跳过
pub async fn handle_message(
    service: &PaymentService,
    msg: &ConsumerMessage,
) -> Result<(), PaymentError> {
    let envelope: EventEnvelope<serde_json::Value> = msg.deserialize_payload()?;
    let event_id = envelope.event_id.as_deref();

    match envelope.kind {
        EventKind::OrderPlaced => {
            let payload: OrderPlacedEvent =
                serde_json::from_value(envelope.payload).map_err(|e| {
                    PaymentError::Shared(FlavoryError::Serialization(format!(
                        "负载解析失败: {e}"
                    )))
                })?;
            service.create_for_order(event_id, &payload).await
        }
        other => {
            debug!(kind = %other, "与支付服务无关的事件，跳过");
            Ok(())
        }
    }
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
        let json = br#"{"eventId":"evt-9","kind":"order.placed","occurredAt":"2025-01-15T10:00:00Z","payload":{}}"#;
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 0,
            key: Some("order-5".to_string()),
            payload: json.to_vec(),
            timestamp: Some(Utc::now().timestamp_millis()),
            headers: HashMap::new(),
        };
        assert_eq!(message_id_of(&msg), "evt-9");
    }
}
