//! 订单事件监听
//!
//! 消费 order.ready，为出餐就绪的订单创建骑手任务。
//! 处理失败的消息进入死信队列按预算重投。

use flavory_shared::broker::{BusConsumer, ConsumerMessage, topics};
use flavory_shared::config::AppConfig;
use flavory_shared::dlq::DlqProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{EventEnvelope, EventKind, OrderReadyEvent};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::service::DeliveryService;

pub struct OrderEventListener {
    consumer: BusConsumer,
    service: Arc<DeliveryService>,
    dlq: DlqProducer,
}

impl OrderEventListener {
    pub fn new(
        config: &AppConfig,
        service: Arc<DeliveryService>,
        dlq: DlqProducer,
    ) -> Result<Self, DeliveryError> {
        let consumer = BusConsumer::new(&config.broker, Some("delivery-service"))?;
        Ok(Self {
            consumer,
            service,
            dlq,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), DeliveryError> {
        self.consumer.subscribe(&[topics::ORDER_EVENTS])?;
        info!(topic = topics::ORDER_EVENTS, "配送服务订单事件监听已启动");

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

        info!("配送服务订单事件监听已停止");
        Ok(())
    }
}

/// 只关心 order.ready，其余订单事件跳过
pub async fn handle_message(
    service: &DeliveryService,
    msg: &ConsumerMessage,
) -> Result<(), DeliveryError> {
    let envelope: EventEnvelope<serde_json::Value> = msg.deserialize_payload()?;
    let event_id = envelope.event_id.as_deref();

    match envelope.kind {
        EventKind::OrderReady => {
            let payload: OrderReadyEvent =
                serde_json::from_value(envelope.payload).map_err(|e| {
                    DeliveryError::Shared(FlavoryError::Serialization(format!(
                        "负载解析失败: {e}"
                    )))
                })?;
            service.create_for_ready_order(event_id, &payload).await
        }
        other => {
            debug!(kind = %other, "与配送服务无关的事件，跳过");
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
        let json = br#"{"eventId":"evt-3","kind":"order.ready","occurredAt":"2025-01-15T10:00:00Z","payload":{}}"#;
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 0,
            key: Some("order-5".to_string()),
            payload: json.to_vec(),
            timestamp: Some(Utc::now().timestamp_millis()),
            headers: HashMap::new(),
        };
        assert_eq!(message_id_of(&msg), "evt-3");
    }

    #[test]
    fn test_message_id_falls_back_to_key() {
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 0,
            key: Some("order-5".to_string()),
            payload: b"not json".to_vec(),
            timestamp: None,
            headers: HashMap::new(),
        };
        assert_eq!(message_id_of(&msg), "order-5");
    }
}
