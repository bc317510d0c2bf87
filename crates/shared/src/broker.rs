//! 事件总线基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和优雅关闭语义，避免各服务重复编写样板代码。
//!
//! 拓扑约定：每个业务域一个持久化 topic（对应逻辑上的 topic exchange），
//! 事件的路由键（如 `order.placed`）写入消息 header，消费方按需过滤。
//! 投递保证为 at-least-once，配合幂等台账（`idempotency` 模块）
//! 在业务视角上收敛为 effectively-once。

use std::collections::HashMap;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;
use crate::error::FlavoryError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 集中管理所有事件总线 topic 名称，防止字符串散落在各服务中导致拼写不一致
///
/// 每个 topic 对应一个业务域的事件流，由该域的服务独占写入。
pub mod topics {
    pub const ORDER_EVENTS: &str = "order.events";
    pub const PAYMENT_EVENTS: &str = "payment.events";
    pub const DELIVERY_EVENTS: &str = "delivery.events";
    pub const DISH_EVENTS: &str = "dish.events";
    pub const USER_EVENTS: &str = "user.events";
    /// 重试耗尽的毒消息统一落入此 topic，等待人工排查
    pub const DEAD_LETTER_QUEUE: &str = "dlx.exchange";
}

/// 路由键写入的消息 header 名
pub const ROUTING_KEY_HEADER: &str = "routingKey";

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        let timestamp = msg.timestamp().to_millis();

        let mut headers = HashMap::new();
        if let Some(h) = msg.headers() {
            for idx in 0..h.count() {
                let header = h.get(idx);
                if let Some(raw) = header.value
                    && let Ok(value) = std::str::from_utf8(raw)
                {
                    headers.insert(header.key.to_string(), value.to_string());
                }
            }
        }

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
            timestamp,
            headers,
        }
    }

    /// 消息携带的路由键（如 `order.placed`），缺失时返回 None
    pub fn routing_key(&self) -> Option<&str> {
        self.headers.get(ROUTING_KEY_HEADER).map(String::as_str)
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, FlavoryError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| FlavoryError::Serialization(format!("负载反序列化失败: {e}")))
    }
}

// ---------------------------------------------------------------------------
// BusProducer
// ---------------------------------------------------------------------------

/// 面向业务的事件总线生产者
///
/// 封装 `FutureProducer` 并提供类型安全的 JSON 发送方法，
/// 内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct BusProducer {
    producer: FutureProducer,
}

impl BusProducer {
    /// 根据配置创建生产者
    ///
    /// 设置 `message.timeout.ms` 为 5 秒——本地事务已提交而事件 5 秒内
    /// 仍无法投递时，应交由上层重试策略处理，而非无限等待。
    pub fn new(config: &BrokerConfig) -> Result<Self, FlavoryError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| FlavoryError::Broker(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "事件总线生产者已初始化");
        Ok(Self { producer })
    }

    /// 发送原始字节消息，路由键写入 header
    pub async fn send(
        &self,
        topic: &str,
        routing_key: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(i32, i64), FlavoryError> {
        self.send_with_headers(topic, routing_key, key, payload, &HashMap::new())
            .await
    }

    /// 发送原始字节消息并附加额外的 header
    ///
    /// DLQ 重投用它把重投预算元数据送回原始 topic。
    pub async fn send_with_headers(
        &self,
        topic: &str,
        routing_key: &str,
        key: &str,
        payload: &[u8],
        extra_headers: &HashMap<String, String>,
    ) -> Result<(i32, i64), FlavoryError> {
        let mut headers = OwnedHeaders::new().insert(Header {
            key: ROUTING_KEY_HEADER,
            value: Some(routing_key),
        });
        for (name, value) in extra_headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value),
            });
        }

        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload)
            .headers(headers);

        let delivery = self
            .producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| FlavoryError::Broker(format!("发送消息失败: {e}")))?;

        debug!(
            topic,
            routing_key,
            key,
            partition = delivery.partition,
            offset = delivery.offset,
            "消息已发送"
        );
        Ok((delivery.partition, delivery.offset))
    }

    /// 将值序列化为 JSON 后发送
    ///
    /// 序列化与网络发送拆分为两步，便于独立定位故障原因。
    pub async fn send_json<T: Serialize>(
        &self,
        topic: &str,
        routing_key: &str,
        key: &str,
        value: &T,
    ) -> Result<(i32, i64), FlavoryError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| FlavoryError::Serialization(format!("序列化失败: {e}")))?;

        self.send(topic, routing_key, key, &payload).await
    }
}

// ---------------------------------------------------------------------------
// BusConsumer
// ---------------------------------------------------------------------------

/// 面向业务的事件总线消费者
///
/// 封装 `StreamConsumer` 并提供基于 `watch` channel 的优雅关闭语义，
/// 确保进程退出时不会丢失正在处理的消息。
pub struct BusConsumer {
    consumer: StreamConsumer,
}

impl BusConsumer {
    /// 创建消费者
    ///
    /// `group_id_suffix` 允许同一服务内不同消费逻辑使用独立的消费组，
    /// 例如 "order-service.payment" 和 "order-service.dlq"。
    pub fn new(config: &BrokerConfig, group_id_suffix: Option<&str>) -> Result<Self, FlavoryError> {
        let group_id = match group_id_suffix {
            Some(suffix) => format!("{}.{}", config.consumer_group, suffix),
            None => config.consumer_group.clone(),
        };

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &group_id)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "true")
            .create()
            .map_err(|e| FlavoryError::Broker(format!("创建消费者失败: {e}")))?;

        info!(brokers = %config.brokers, group_id, "事件总线消费者已初始化");
        Ok(Self { consumer })
    }

    /// 订阅指定的 topic 列表
    pub fn subscribe(&self, topics: &[&str]) -> Result<(), FlavoryError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| FlavoryError::Broker(format!("订阅 topic 失败: {e}")))?;

        info!(?topics, "已订阅事件总线 topics");
        Ok(())
    }

    /// 启动消费循环
    ///
    /// 使用 `tokio::select!` 同时监听消息流和关闭信号：
    /// - 收到消息时调用 handler 处理；handler 返回错误只记录日志而不中断循环，
    ///   重试与死信路由由 handler 内部的策略决定。
    /// - 关闭信号变为 `true` 时退出循环，确保正在执行的 handler 能自然完成。
    pub async fn start<F, Fut>(self, mut shutdown: watch::Receiver<bool>, handler: F)
    where
        F: Fn(ConsumerMessage) -> Fut,
        Fut: std::future::Future<Output = Result<(), FlavoryError>>,
    {
        use futures::StreamExt;

        let stream = self.consumer.stream();
        futures::pin_mut!(stream);

        info!("事件总线消费循环已启动");

        loop {
            tokio::select! {
                // 偏向关闭信号，保证收到关闭时能尽快退出
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("收到关闭信号，消费循环退出");
                        break;
                    }
                }

                msg_result = stream.next() => {
                    let Some(msg_result) = msg_result else {
                        warn!("消息流意外结束");
                        break;
                    };

                    match msg_result {
                        Ok(borrowed_msg) => {
                            let msg = ConsumerMessage::from_borrowed(&borrowed_msg);
                            debug!(
                                topic = %msg.topic,
                                partition = msg.partition,
                                offset = msg.offset,
                                routing_key = msg.routing_key().unwrap_or("-"),
                                "收到事件总线消息"
                            );

                            if let Err(e) = handler(msg).await {
                                error!(error = %e, "处理事件总线消息失败");
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "接收事件总线消息出错");
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_constants() {
        assert_eq!(topics::ORDER_EVENTS, "order.events");
        assert_eq!(topics::PAYMENT_EVENTS, "payment.events");
        assert_eq!(topics::DELIVERY_EVENTS, "delivery.events");
        assert_eq!(topics::DISH_EVENTS, "dish.events");
        assert_eq!(topics::USER_EVENTS, "user.events");
        assert_eq!(topics::DEAD_LETTER_QUEUE, "dlx.exchange");
    }

    #[test]
    fn test_consumer_message_routing_key() {
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 42,
            key: Some("order-1".to_string()),
            payload: b"{}".to_vec(),
            timestamp: Some(1_700_000_000_000),
            headers: HashMap::from([(
                ROUTING_KEY_HEADER.to_string(),
                "order.placed".to_string(),
            )]),
        };

        assert_eq!(msg.routing_key(), Some("order.placed"));
    }

    #[test]
    fn test_consumer_message_routing_key_missing() {
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: vec![],
            timestamp: None,
            headers: HashMap::new(),
        };

        assert_eq!(msg.routing_key(), None);
    }

    #[test]
    fn test_consumer_message_deserialize() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct Event {
            order_id: String,
        }

        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 1,
            offset: 100,
            key: None,
            payload: br#"{"order_id":"o-001"}"#.to_vec(),
            timestamp: None,
            headers: HashMap::new(),
        };

        let event: Event = msg.deserialize_payload().unwrap();
        assert_eq!(event.order_id, "o-001");
    }

    #[test]
    fn test_consumer_message_deserialize_invalid_json() {
        let msg = ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: b"not json".to_vec(),
            timestamp: None,
            headers: HashMap::new(),
        };

        let result: Result<serde_json::Value, _> = msg.deserialize_payload();
        assert!(result.is_err());
    }
}
