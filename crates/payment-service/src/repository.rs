//! 支付数据访问层
//!
//! 状态写入统一走乐观锁（`WHERE id = $1 AND version = $2`）：
//! webhook 回调与定时对账可能并发推进同一笔支付，
//! 落后的写入会得到 StaleVersion，由调用方重读后决定是否重试。

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use flavory_shared::error::FlavoryError;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;
use crate::model::{Payment, PaymentStatus};

const PAYMENT_COLUMNS: &str = "id, order_id, customer_id, amount, platform_fee, cook_payout, \
     status, gateway_intent_id, gateway_charge_id, failure_reason, refunded_amount, \
     paid_at, refunded_at, version, created_at, updated_at";

/// 新建支付记录的字段
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub order_id: i64,
    pub customer_id: i64,
    pub amount: BigDecimal,
    pub platform_fee: BigDecimal,
    pub cook_payout: BigDecimal,
    pub gateway_intent_id: String,
}

/// 状态写入时一并落库的字段，None 表示保持原值
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub gateway_charge_id: Option<String>,
    pub failure_reason: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_amount: Option<BigDecimal>,
    pub refunded_at: Option<DateTime<Utc>>,
}

#[derive(Clone)]
pub struct PaymentRepository {
    pool: PgPool,
}

impl PaymentRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 插入新支付记录
    ///
    /// `payments.order_id` 上的 UNIQUE 约束是一单一付的最终防线，
    /// 冲突映射为 DuplicatePayment。
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: &NewPayment,
    ) -> Result<Payment> {
        let result = sqlx::query_as::<_, Payment>(&format!(
            "INSERT INTO payments \
             (order_id, customer_id, amount, platform_fee, cook_payout, status, gateway_intent_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(new.order_id)
        .bind(new.customer_id)
        .bind(&new.amount)
        .bind(&new.platform_fee)
        .bind(&new.cook_payout)
        .bind(PaymentStatus::Pending)
        .bind(&new.gateway_intent_id)
        .fetch_one(&mut **tx)
        .await;

        match result {
            Ok(payment) => Ok(payment),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(FlavoryError::DuplicatePayment {
                    order_id: new.order_id.to_string(),
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn find_by_id(&self, payment_id: i64) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            FlavoryError::NotFound {
                entity: "Payment".to_string(),
                id: payment_id.to_string(),
            }
            .into()
        })
    }

    pub async fn find_by_order(&self, order_id: i64) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    pub async fn find_by_intent(&self, intent_id: &str) -> Result<Option<Payment>> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE gateway_intent_id = $1"
        ))
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    /// 乐观锁状态写入
    ///
    /// 版本不匹配返回 StaleVersion，说明另一条链路已经先行推进。
    pub async fn update_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payment: &Payment,
        new_status: PaymentStatus,
        patch: &StatusPatch,
    ) -> Result<Payment> {
        sqlx::query_as::<_, Payment>(&format!(
            "UPDATE payments \
             SET status = $3, \
                 gateway_charge_id = COALESCE($4, gateway_charge_id), \
                 failure_reason = COALESCE($5, failure_reason), \
                 paid_at = COALESCE($6, paid_at), \
                 refunded_amount = COALESCE($7, refunded_amount), \
                 refunded_at = COALESCE($8, refunded_at), \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(payment.id)
        .bind(payment.version)
        .bind(new_status)
        .bind(&patch.gateway_charge_id)
        .bind(&patch.failure_reason)
        .bind(patch.paid_at)
        .bind(&patch.refunded_amount)
        .bind(patch.refunded_at)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            FlavoryError::StaleVersion {
                entity: "Payment".to_string(),
                id: payment.id.to_string(),
            }
            .into()
        })
    }

    /// 创建超过给定时刻仍停留在 PENDING 的支付（超时清理任务用）
    pub async fn find_expired_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments \
             WHERE status = $1 AND created_at < $2 \
             ORDER BY created_at"
        ))
        .bind(PaymentStatus::Pending)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }

    /// 停留在 PROCESSING 的支付（夜间对账任务用）
    pub async fn find_processing(&self) -> Result<Vec<Payment>> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE status = $1 ORDER BY created_at"
        ))
        .bind(PaymentStatus::Processing)
        .fetch_all(&self.pool)
        .await?;

        Ok(payments)
    }
}
