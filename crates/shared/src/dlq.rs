//! 死信队列
//!
//! 事件处理失败后，消息被包装为死信信封写入 DLQ topic。
//! DLQ 消费者按退避时间表把尚有预算的消息重新投回原始 topic，
//! 并通过消息 header 把重投次数与首次失败时间一并送回；
//! 重投后再次失败时，信封以 header 里的进度续算预算，
//! 而不是每轮从零开始。彻底耗尽预算的消息记录完整上下文等待人工介入。
//! 这样瞬时故障不会造成消息永久丢失，毒消息也不会无限循环。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::broker::{BusConsumer, BusProducer, ConsumerMessage, topics};
use crate::config::BrokerConfig;
use crate::error::FlavoryError;
use crate::retry::RetryPolicy;

/// 重投消息携带的已重投次数 header
pub const RETRY_COUNT_HEADER: &str = "dlqRetryCount";
/// 重投消息携带的首次失败时间 header（RFC 3339）
pub const FIRST_FAILED_AT_HEADER: &str = "dlqFirstFailedAt";

// ---------------------------------------------------------------------------
// DeadLetterMessage
// ---------------------------------------------------------------------------

/// 死信信封
///
/// 包装原始消息并附加失败元数据，DLQ 消费时据此决定重投或归档。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterMessage {
    /// 原始事件标识（缺失 event_id 的事件用合成标识代替）
    pub message_id: String,
    /// 原始 topic
    pub source_topic: String,
    /// 原始路由键，重投时需要原样写回 header
    pub routing_key: String,
    /// 原始消息内容（JSON 字符串）
    pub payload: String,
    /// 最近一次失败原因
    pub error: String,
    /// 已重投次数
    pub retry_count: u32,
    /// 最大重投次数
    pub max_retries: u32,
    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,
    /// 下次重投时间（None 表示预算耗尽）
    pub next_retry_at: Option<DateTime<Utc>>,
    /// 失败发生的服务
    pub source_service: String,
}

impl DeadLetterMessage {
    /// 构造新的死信信封
    ///
    /// `next_retry_at` 初始为当前时间，DLQ 消费者首轮扫描即可尝试重投。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        message_id: impl Into<String>,
        source_topic: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<String>,
        error: impl Into<String>,
        max_retries: u32,
        source_service: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            message_id: message_id.into(),
            source_topic: source_topic.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            error: error.into(),
            retry_count: 0,
            max_retries,
            first_failed_at: now,
            last_failed_at: now,
            next_retry_at: Some(now),
            source_service: source_service.into(),
        }
    }

    /// 重投预算尚未耗尽
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 记一次重投失败并安排下一次
    ///
    /// 预算耗尽时 `next_retry_at` 置 None。
    pub fn increment_retry(&mut self, error: &str, retry_policy: &RetryPolicy) {
        self.retry_count += 1;
        self.error = error.to_string();
        self.last_failed_at = Utc::now();

        if self.should_retry() {
            let delay = retry_policy.delay_for_attempt(self.retry_count);
            self.next_retry_at =
                Some(self.last_failed_at + chrono::Duration::from_std(delay).unwrap_or_default());
        } else {
            self.next_retry_at = None;
        }
    }

    /// 重投后再次失败：以 header 带回的进度续算预算
    ///
    /// 第 n 次重投失败后，下一次重投按第 n 档退避排期；
    /// 预算耗尽时不再排期，DLQ 消费者据此归档。
    pub fn resume_redelivery_history(
        &mut self,
        prior_redeliveries: u32,
        first_failed_at: Option<DateTime<Utc>>,
        error: &str,
        retry_policy: &RetryPolicy,
    ) {
        if prior_redeliveries == 0 {
            return;
        }

        self.retry_count = prior_redeliveries - 1;
        self.increment_retry(error, retry_policy);

        if let Some(first) = first_failed_at {
            self.first_failed_at = first;
        }
    }
}

// ---------------------------------------------------------------------------
// DlqProducer
// ---------------------------------------------------------------------------

/// 将处理失败的消息写入死信队列
pub struct DlqProducer {
    producer: BusProducer,
    source_service: String,
    retry_policy: RetryPolicy,
}

impl DlqProducer {
    pub fn new(producer: BusProducer, source_service: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            producer,
            source_service: source_service.to_string(),
            retry_policy,
        }
    }

    /// 把一条消费失败的消息连同失败原因送入 DLQ
    ///
    /// DLQ 重投回流的消息带有预算 header，信封从中续算重投进度。
    pub async fn send_to_dlq(
        &self,
        msg: &ConsumerMessage,
        message_id: &str,
        error: &str,
    ) -> Result<(), FlavoryError> {
        let dlq_msg = build_dead_letter(
            msg,
            message_id,
            error,
            &self.retry_policy,
            &self.source_service,
        );

        self.producer
            .send_json(
                topics::DEAD_LETTER_QUEUE,
                "dead-letter",
                message_id,
                &dlq_msg,
            )
            .await?;

        warn!(
            message_id,
            source_topic = %msg.topic,
            retry_count = dlq_msg.retry_count,
            max_retries = dlq_msg.max_retries,
            error,
            "消息已发送到死信队列"
        );

        Ok(())
    }
}

/// 由失败消息构造死信信封
///
/// 首次失败的消息立即可重投；重投回流的消息按 header 里的
/// 重投次数与首次失败时间续算预算。
fn build_dead_letter(
    msg: &ConsumerMessage,
    message_id: &str,
    error: &str,
    retry_policy: &RetryPolicy,
    source_service: &str,
) -> DeadLetterMessage {
    let payload = String::from_utf8_lossy(&msg.payload).into_owned();
    let mut dlq_msg = DeadLetterMessage::new(
        message_id,
        &msg.topic,
        msg.routing_key().unwrap_or_default(),
        payload,
        error,
        retry_policy.max_retries,
        source_service,
    );

    let prior_redeliveries = msg
        .headers
        .get(RETRY_COUNT_HEADER)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let first_failed_at = msg
        .headers
        .get(FIRST_FAILED_AT_HEADER)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc));

    dlq_msg.resume_redelivery_history(prior_redeliveries, first_failed_at, error, retry_policy);
    dlq_msg
}

// ---------------------------------------------------------------------------
// DlqConsumer
// ---------------------------------------------------------------------------

/// 死信队列消费者
///
/// 对尚有预算且到达重投时间的消息，将原始 payload 发回 source_topic；
/// 预算耗尽的消息输出完整上下文日志，由值班人员排查。
pub struct DlqConsumer {
    consumer: BusConsumer,
    retry_producer: BusProducer,
}

impl DlqConsumer {
    /// 使用独立的 `.dlq` 消费组，与业务消费者互不干扰
    pub fn new(config: &BrokerConfig, retry_producer: BusProducer) -> Result<Self, FlavoryError> {
        let consumer = BusConsumer::new(config, Some("dlq"))?;
        consumer.subscribe(&[topics::DEAD_LETTER_QUEUE])?;

        info!(topic = topics::DEAD_LETTER_QUEUE, "DLQ 消费者已创建");

        Ok(Self {
            consumer,
            retry_producer,
        })
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let retry_producer = self.retry_producer.clone();

        self.consumer
            .start(shutdown, move |msg| {
                let producer = retry_producer.clone();
                async move { handle_dlq_message(&msg, &producer).await }
            })
            .await;

        info!("DLQ 消费循环已退出");
    }
}

/// 处理单条死信
async fn handle_dlq_message(
    msg: &ConsumerMessage,
    retry_producer: &BusProducer,
) -> Result<(), FlavoryError> {
    let dlq_msg: DeadLetterMessage = msg.deserialize_payload()?;

    if !dlq_msg.should_retry() {
        error!(
            message_id = %dlq_msg.message_id,
            source_topic = %dlq_msg.source_topic,
            source_service = %dlq_msg.source_service,
            retry_count = dlq_msg.retry_count,
            max_retries = dlq_msg.max_retries,
            first_failed_at = %dlq_msg.first_failed_at,
            last_failed_at = %dlq_msg.last_failed_at,
            error = %dlq_msg.error,
            "死信消息已耗尽重投预算，需人工介入"
        );
        return Ok(());
    }

    // 偏移量自动提交，跳过即丢失；重投时间未到时原地等到期，
    // 等待时长受退避上限约束
    if let Some(next_retry) = dlq_msg.next_retry_at {
        let wait = (next_retry - Utc::now()).to_std().unwrap_or_default();
        if !wait.is_zero() {
            info!(
                message_id = %dlq_msg.message_id,
                wait_ms = wait.as_millis() as u64,
                "死信消息重投时间未到，等待退避到期"
            );
            tokio::time::sleep(wait).await;
        }
    }

    info!(
        message_id = %dlq_msg.message_id,
        source_topic = %dlq_msg.source_topic,
        retry_count = dlq_msg.retry_count,
        max_retries = dlq_msg.max_retries,
        "重投死信消息到原始 topic"
    );

    retry_producer
        .send_with_headers(
            &dlq_msg.source_topic,
            &dlq_msg.routing_key,
            &dlq_msg.message_id,
            dlq_msg.payload.as_bytes(),
            &redelivery_headers(&dlq_msg),
        )
        .await?;

    Ok(())
}

/// 重投消息携带的预算 header
///
/// 本次重投计入次数；再次失败时 `send_to_dlq` 据此续算预算。
fn redelivery_headers(dlq_msg: &DeadLetterMessage) -> HashMap<String, String> {
    HashMap::from([
        (
            RETRY_COUNT_HEADER.to_string(),
            (dlq_msg.retry_count + 1).to_string(),
        ),
        (
            FIRST_FAILED_AT_HEADER.to_string(),
            dlq_msg.first_failed_at.to_rfc3339(),
        ),
    ])
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample() -> DeadLetterMessage {
        DeadLetterMessage::new(
            "evt-001",
            topics::ORDER_EVENTS,
            "order.placed",
            r#"{"orderId":1}"#,
            "数据库连接失败",
            3,
            "dish-service",
        )
    }

    #[test]
    fn test_dead_letter_message_creation() {
        let msg = sample();

        assert_eq!(msg.message_id, "evt-001");
        assert_eq!(msg.source_topic, "order.events");
        assert_eq!(msg.routing_key, "order.placed");
        assert_eq!(msg.retry_count, 0);
        assert_eq!(msg.max_retries, 3);
        assert!(msg.next_retry_at.is_some());
        assert_eq!(msg.first_failed_at, msg.last_failed_at);
    }

    #[test]
    fn test_should_retry_boundary() {
        let mut msg = sample();
        assert!(msg.should_retry());

        msg.retry_count = 2;
        assert!(msg.should_retry());

        msg.retry_count = 3;
        assert!(!msg.should_retry());
    }

    #[test]
    fn test_increment_retry_schedules_backoff() {
        let mut msg = sample();
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        };
        let first_failed = msg.first_failed_at;

        msg.increment_retry("第二次失败", &policy);
        assert_eq!(msg.retry_count, 1);
        assert_eq!(msg.error, "第二次失败");
        assert!(msg.next_retry_at.is_some());
        // 首次失败时间保持不变
        assert_eq!(msg.first_failed_at, first_failed);

        msg.increment_retry("第三次失败", &policy);
        msg.increment_retry("最终失败", &policy);
        assert_eq!(msg.retry_count, 3);
        // 预算耗尽后不再安排重投
        assert!(msg.next_retry_at.is_none());
        assert!(!msg.should_retry());
    }

    fn failed_message(headers: HashMap<String, String>) -> ConsumerMessage {
        ConsumerMessage {
            topic: topics::ORDER_EVENTS.to_string(),
            partition: 0,
            offset: 7,
            key: Some("order-1".to_string()),
            payload: br#"{"orderId":1}"#.to_vec(),
            timestamp: None,
            headers,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_budget_consumed_across_redelivery_cycles() {
        // 监听失败 -> 入 DLQ -> 重投 -> 再失败 的完整循环：
        // 每轮信封都要续上一轮的重投次数，而不是从零开始
        let first_failure = failed_message(HashMap::new());
        let mut envelope = build_dead_letter(
            &first_failure,
            "evt-1",
            "数据库连接失败",
            &policy(),
            "dish-service",
        );
        assert_eq!(envelope.retry_count, 0);
        assert!(envelope.should_retry());

        for expected_count in 1..=3 {
            let redelivered = failed_message(redelivery_headers(&envelope));
            envelope = build_dead_letter(
                &redelivered,
                "evt-1",
                "数据库连接失败",
                &policy(),
                "dish-service",
            );
            assert_eq!(envelope.retry_count, expected_count);
        }

        // 3 次重投全部失败后预算耗尽，消息归档而非继续重投
        assert!(!envelope.should_retry());
        assert!(envelope.next_retry_at.is_none());
    }

    #[test]
    fn test_redelivery_is_backed_off_not_immediate() {
        let first_failure = failed_message(HashMap::new());
        let first = build_dead_letter(&first_failure, "evt-2", "超时", &policy(), "order-service");
        // 首轮立即可重投
        assert_eq!(first.next_retry_at, Some(first.last_failed_at));

        let redelivered = failed_message(redelivery_headers(&first));
        let second =
            build_dead_letter(&redelivered, "evt-2", "超时", &policy(), "order-service");
        // 第二轮起按退避排期
        let next = second.next_retry_at.unwrap();
        assert!(next > second.last_failed_at);
        assert_eq!(
            (next - second.last_failed_at).num_seconds(),
            policy().delay_for_attempt(1).as_secs() as i64
        );
    }

    #[test]
    fn test_first_failed_at_survives_redelivery_cycles() {
        let first_failure = failed_message(HashMap::new());
        let first = build_dead_letter(&first_failure, "evt-3", "失败", &policy(), "dish-service");

        let redelivered = failed_message(redelivery_headers(&first));
        let second = build_dead_letter(&redelivered, "evt-3", "失败", &policy(), "dish-service");

        // RFC 3339 往返有亚秒精度损失，比较到秒
        assert_eq!(
            second.first_failed_at.timestamp(),
            first.first_failed_at.timestamp()
        );
        assert!(second.last_failed_at >= first.last_failed_at);
    }

    #[test]
    fn test_garbage_budget_header_starts_fresh() {
        let msg = failed_message(HashMap::from([(
            RETRY_COUNT_HEADER.to_string(),
            "not-a-number".to_string(),
        )]));
        let envelope = build_dead_letter(&msg, "evt-4", "失败", &policy(), "dish-service");
        assert_eq!(envelope.retry_count, 0);
        assert!(envelope.should_retry());
    }

    #[test]
    fn test_wire_format_is_camel_case() {
        let msg = sample();
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("messageId"));
        assert!(json.contains("sourceTopic"));
        assert!(json.contains("routingKey"));
        assert!(json.contains("retryCount"));
        assert!(json.contains("nextRetryAt"));
        assert!(json.contains("sourceService"));

        let restored: DeadLetterMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.message_id, "evt-001");
        assert_eq!(restored.routing_key, "order.placed");
    }
}
