//! 消费端幂等台账
//!
//! 消息总线的投递保证是 at-least-once，重复投递不可避免。
//! 每个消费者在处理事件时，把事件标识写入 `processed_events` 表，
//! 且必须与业务状态变更在同一个数据库事务中提交——
//! 事务回滚时台账记录一并消失，消息重投后可以重新处理；
//! 事务提交后重复投递会命中台账而被跳过。
//!
//! 事件缺失 `event_id`（历史生产者）时无法去重，调用方应跳过台账直接处理。

use sqlx::{Postgres, Transaction};
use tracing::debug;

use crate::error::Result;

/// 查询事件是否已被当前消费者处理过
///
/// 在调用方打开的事务内执行，保证读到的状态与后续写入一致。
pub async fn already_processed(
    tx: &mut Transaction<'_, Postgres>,
    event_id: &str,
    consumer: &str,
) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1 AND consumer = $2)",
    )
    .bind(event_id)
    .bind(consumer)
    .fetch_one(&mut **tx)
    .await?;

    if exists {
        debug!(event_id, consumer, "事件已处理过，跳过");
    }

    Ok(exists)
}

/// 将事件标记为已处理
///
/// 与业务状态变更同事务提交。并发消费同一事件时依赖主键冲突兜底：
/// `ON CONFLICT DO NOTHING` 返回 false 表示另一事务已抢先登记。
pub async fn mark_processed(
    tx: &mut Transaction<'_, Postgres>,
    event_id: &str,
    consumer: &str,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO processed_events (event_id, consumer, processed_at) \
         VALUES ($1, $2, NOW()) \
         ON CONFLICT (event_id, consumer) DO NOTHING",
    )
    .bind(event_id)
    .bind(consumer)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::database::Database;

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_mark_then_check() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let mut tx = db.pool().begin().await.unwrap();

        let event_id = uuid::Uuid::now_v7().to_string();
        assert!(!already_processed(&mut tx, &event_id, "order-service").await.unwrap());
        assert!(mark_processed(&mut tx, &event_id, "order-service").await.unwrap());
        assert!(already_processed(&mut tx, &event_id, "order-service").await.unwrap());

        // 重复登记被主键冲突挡下
        assert!(!mark_processed(&mut tx, &event_id, "order-service").await.unwrap());

        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_rollback_clears_ledger() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let event_id = uuid::Uuid::now_v7().to_string();

        let mut tx = db.pool().begin().await.unwrap();
        mark_processed(&mut tx, &event_id, "dish-service").await.unwrap();
        tx.rollback().await.unwrap();

        // 回滚后台账无记录，消息重投可重新处理
        let mut tx = db.pool().begin().await.unwrap();
        assert!(!already_processed(&mut tx, &event_id, "dish-service").await.unwrap());
        tx.rollback().await.unwrap();
    }
}
