//! 订单事件监听
//!
//! 消费订单域事件流并路由到 DishService：
//! - order.placed  -> 扣减库存
//! - order.completed -> 累计销量
//! - order.cancelled -> 回补库存
//!
//! 处理失败的消息进入死信队列，由 DLQ 消费者按预算重投。

use flavory_shared::broker::{BusConsumer, ConsumerMessage, topics};
use flavory_shared::config::AppConfig;
use flavory_shared::dlq::DlqProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{EventEnvelope, EventKind};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::error::DishError;
use crate::service::DishService;

pub struct DishEventListener {
    consumer: BusConsumer,
    service: Arc<DishService>,
    dlq: DlqProducer,
}

impl DishEventListener {
    pub fn new(
        config: &AppConfig,
        service: Arc<DishService>,
        dlq: DlqProducer,
    ) -> Result<Self, DishError> {
        let consumer = BusConsumer::new(&config.broker, Some("dish-service"))?;
        Ok(Self {
            consumer,
            service,
            dlq,
        })
    }

    /// 启动消费循环，直到收到 shutdown 信号
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), DishError> {
        self.consumer.subscribe(&[topics::ORDER_EVENTS])?;
        info!(topic = topics::ORDER_EVENTS, "菜品服务订单事件监听已启动");

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

        info!("菜品服务订单事件监听已停止");
        Ok(())
    }
}

/// 处理单条消息：解析信封并按事件类型分发
///
/// 与本服务无关的事件类型直接跳过，不算失败。
pub async fn handle_message(service: &DishService, msg: &ConsumerMessage) -> Result<(), DishError> {
    let envelope: EventEnvelope<serde_json::Value> = msg.deserialize_payload()?;
    let event_id = envelope.event_id.as_deref();

    match envelope.kind {
        EventKind::OrderPlaced => {
            let payload = decode(envelope.payload)?;
            service.apply_order_placed(event_id, &payload).await
        }
        EventKind::OrderCompleted => {
            let payload = decode(envelope.payload)?;
            service.apply_order_completed(event_id, &payload).await
        }
        EventKind::OrderCancelled => {
            let payload = decode(envelope.payload)?;
            service.apply_order_cancelled(event_id, &payload).await
        }
        other => {
            debug!(kind = %other, "与菜品服务无关的事件，跳过");
            Ok(())
        }
    }
}

/// 将信封里的 JSON 负载转为具体事件类型
fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, DishError> {
    serde_json::from_value(value)
        .map_err(|e| DishError::Shared(FlavoryError::Serialization(format!("负载解析失败: {e}"))))
}

/// 死信消息标识：优先用事件 ID，缺失时退回消息 key，再不行合成一个
fn message_id_of(msg: &ConsumerMessage) -> String {
    serde_json::from_slice::<EventEnvelope<serde_json::Value>>(&msg.payload)
        .ok()
        .and_then(|e| e.event_id)
        .or_else(|| msg.key.clone())
        .unwrap_or_else(|| Uuid::now_v7().to_string())
}
