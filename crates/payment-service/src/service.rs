//! 支付业务逻辑
//!
//! 入口有三类：order.placed 事件（创建支付意向）、网关回调/对账
//! （推进支付状态）、退款请求。所有状态写入都经过迁移表校验与乐观锁，
//! webhook 与对账并发推进同一笔支付时落后者自动重读重试。

use std::sync::Arc;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use flavory_shared::broker::BusProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{
    EventEnvelope, EventKind, OrderPlacedEvent, PaymentCancelledEvent, PaymentCreatedEvent,
    PaymentFailedEvent, PaymentRefundedEvent, PaymentSucceededEvent,
};
use flavory_shared::idempotency;
use flavory_shared::retry::{RetryPolicy, retry_with_policy};
use flavory_shared::state_machine::Transition;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::error::{PaymentError, Result};
use crate::gateway::{GatewayIntent, PaymentGateway, map_intent_status};
use crate::model::{self, FeeConfig, Payment, PaymentStatus, transitions};
use crate::repository::{NewPayment, PaymentRepository, StatusPatch};

/// 幂等台账中的消费者标识
pub const CONSUMER: &str = "payment-service";

/// 乐观锁冲突时的重读次数
const STALE_RETRY_ATTEMPTS: u32 = 3;

pub struct PaymentService {
    pool: PgPool,
    repo: PaymentRepository,
    gateway: Arc<dyn PaymentGateway>,
    producer: BusProducer,
    retry_policy: RetryPolicy,
    fee_config: FeeConfig,
}

impl PaymentService {
    pub fn new(
        pool: PgPool,
        repo: PaymentRepository,
        gateway: Arc<dyn PaymentGateway>,
        producer: BusProducer,
        retry_policy: RetryPolicy,
        fee_config: FeeConfig,
    ) -> Self {
        Self {
            pool,
            repo,
            gateway,
            producer,
            retry_policy,
            fee_config,
        }
    }

    // -----------------------------------------------------------------------
    // 创建支付
    // -----------------------------------------------------------------------

    /// 处理 order.placed：为订单创建支付意向与本地支付记录
    ///
    /// 先查网关后写库。写库撞上一单一付约束（并发重复投递的缝隙）时，
    /// 取消刚创建的意向避免网关侧留下孤儿，然后按已处理对待。
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn create_for_order(
        &self,
        event_id: Option<&str>,
        event: &OrderPlacedEvent,
    ) -> Result<()> {
        self.fee_config.validate_amount(&event.total_amount)?;

        // 一单一付：先查后插，网关调用前就挡下重复（不产生多余意向）
        if self.repo.find_by_order(event.order_id).await?.is_some() {
            info!(order_id = event.order_id, "订单已有支付记录，跳过");
            return Ok(());
        }

        let fee = self.fee_config.platform_fee(&event.total_amount);
        let payout = self.fee_config.cook_payout(&event.total_amount, &fee);

        let intent =
            create_intent_with_retry(&*self.gateway, &self.retry_policy, event.order_id, &event.total_amount)
                .await?;

        let mut tx = self.pool.begin().await.map_err(PaymentError::from)?;

        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(PaymentError::from)?;
            self.abandon_intent(&intent.id).await;
            return Ok(());
        }

        let new = NewPayment {
            order_id: event.order_id,
            customer_id: event.customer_id,
            amount: event.total_amount.clone(),
            platform_fee: fee,
            cook_payout: payout,
            gateway_intent_id: intent.id.clone(),
        };

        let payment = match self.repo.insert(&mut tx, &new).await {
            Ok(p) => p,
            Err(PaymentError::Shared(FlavoryError::DuplicatePayment { .. })) => {
                tx.rollback().await.map_err(PaymentError::from)?;
                self.abandon_intent(&intent.id).await;
                info!(order_id = event.order_id, "并发创建被唯一约束挡下，跳过");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(PaymentError::from)?;

        info!(
            order_id = event.order_id,
            payment_id = payment.id,
            intent_id = %intent.id,
            "支付记录已创建"
        );

        let envelope = EventEnvelope::new(
            EventKind::PaymentCreated,
            PaymentCreatedEvent {
                payment_id: payment.id,
                order_id: payment.order_id,
                amount: payment.amount.clone(),
                gateway_intent_id: intent.id,
            },
        );
        self.publish(envelope, payment.order_id).await;

        Ok(())
    }

    /// 多余意向的善后，失败只记日志（对账任务会兜底）
    async fn abandon_intent(&self, intent_id: &str) {
        if let Err(e) = self.gateway.cancel_intent(intent_id).await {
            warn!(intent_id, error = %e, "取消多余支付意向失败");
        }
    }

    // -----------------------------------------------------------------------
    // 网关状态推进
    // -----------------------------------------------------------------------

    /// 以网关意向快照推进本地支付状态
    ///
    /// webhook 与对账共用此入口。无法识别的网关状态忽略；
    /// 乱序送达的旧状态被迁移表拒绝后按过期消息忽略；
    /// 状态实际变化时才对外广播。
    #[instrument(skip(self, intent), fields(intent_id = %intent.id))]
    pub async fn apply_gateway_update(&self, intent: &GatewayIntent) -> Result<()> {
        let Some(new_status) = map_intent_status(&intent.status) else {
            warn!(status = %intent.status, "无法识别的网关状态，忽略");
            return Ok(());
        };

        for attempt in 0..STALE_RETRY_ATTEMPTS {
            match self.try_apply_status(intent, new_status).await {
                Err(PaymentError::Shared(FlavoryError::StaleVersion { .. }))
                    if attempt + 1 < STALE_RETRY_ATTEMPTS =>
                {
                    warn!(intent_id = %intent.id, attempt, "并发写入冲突，重读后重试");
                }
                other => return other,
            }
        }
        unreachable!("重试循环总是在最后一轮返回");
    }

    async fn try_apply_status(
        &self,
        intent: &GatewayIntent,
        new_status: PaymentStatus,
    ) -> Result<()> {
        let payment = self
            .repo
            .find_by_intent(&intent.id)
            .await?
            .ok_or_else(|| PaymentError::UnknownIntent {
                intent_id: intent.id.clone(),
            })?;

        match transitions().check(payment.status, new_status) {
            Ok(Transition::NoOp) => return Ok(()),
            Ok(Transition::Apply) => {}
            Err(e) => {
                // 网关回调乱序（如成功之后才到的 processing），忽略
                warn!(
                    payment_id = payment.id,
                    from = %payment.status,
                    to = %new_status,
                    error = %e,
                    "过期的网关状态更新，忽略"
                );
                return Ok(());
            }
        }

        let now = Utc::now();
        let patch = match new_status {
            PaymentStatus::Succeeded => StatusPatch {
                gateway_charge_id: intent.latest_charge.clone(),
                paid_at: Some(now),
                ..StatusPatch::default()
            },
            PaymentStatus::Failed => StatusPatch {
                failure_reason: Some(format!("网关状态: {}", intent.status)),
                ..StatusPatch::default()
            },
            _ => StatusPatch::default(),
        };

        let mut tx = self.pool.begin().await.map_err(PaymentError::from)?;
        let updated = self
            .repo
            .update_status(&mut tx, &payment, new_status, &patch)
            .await?;
        tx.commit().await.map_err(PaymentError::from)?;

        info!(
            payment_id = updated.id,
            order_id = updated.order_id,
            from = %payment.status,
            to = %new_status,
            "支付状态已推进"
        );

        self.publish_status_event(&updated, now).await;
        Ok(())
    }

    /// 状态对应的领域事件；中间状态（REQUIRES_ACTION、PROCESSING）不广播
    async fn publish_status_event(&self, payment: &Payment, now: DateTime<Utc>) {
        match payment.status {
            PaymentStatus::Succeeded => {
                let envelope = EventEnvelope::new(
                    EventKind::PaymentSucceeded,
                    PaymentSucceededEvent {
                        payment_id: payment.id,
                        order_id: payment.order_id,
                        amount: payment.amount.clone(),
                        paid_at: payment.paid_at.unwrap_or(now),
                    },
                );
                self.publish(envelope, payment.order_id).await;
            }
            PaymentStatus::Failed => {
                let envelope = EventEnvelope::new(
                    EventKind::PaymentFailed,
                    PaymentFailedEvent {
                        payment_id: payment.id,
                        order_id: payment.order_id,
                        reason: payment
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "支付失败".to_string()),
                    },
                );
                self.publish(envelope, payment.order_id).await;
            }
            PaymentStatus::Cancelled => {
                let envelope = EventEnvelope::new(
                    EventKind::PaymentCancelled,
                    PaymentCancelledEvent {
                        payment_id: payment.id,
                        order_id: payment.order_id,
                        reason: payment
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| "支付已取消".to_string()),
                    },
                );
                self.publish(envelope, payment.order_id).await;
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // 退款
    // -----------------------------------------------------------------------

    /// 退款
    ///
    /// 仅限成功且未退款的支付，窗口 30 天，金额不超过原支付。
    #[instrument(skip(self, amount))]
    pub async fn refund(&self, payment_id: i64, amount: &BigDecimal, reason: &str) -> Result<()> {
        let payment = self.repo.find_by_id(payment_id).await?;
        let now = Utc::now();

        validate_refund(&payment, amount, now)?;

        let intent_id = payment
            .gateway_intent_id
            .clone()
            .ok_or_else(|| FlavoryError::Internal("成功的支付缺少网关意向标识".to_string()))?;

        let gateway = Arc::clone(&self.gateway);
        let refund_amount = amount.clone();
        retry_with_policy(
            &self.retry_policy,
            "gateway_refund",
            |e| e.is_retryable(),
            move || {
                let gateway = Arc::clone(&gateway);
                let intent_id = intent_id.clone();
                let amount = refund_amount.clone();
                async move { gateway.refund(&intent_id, &amount).await }
            },
        )
        .await?;

        let patch = StatusPatch {
            refunded_amount: Some(amount.clone()),
            refunded_at: Some(now),
            failure_reason: Some(reason.to_string()),
            ..StatusPatch::default()
        };

        let mut tx = self.pool.begin().await.map_err(PaymentError::from)?;
        let updated = self
            .repo
            .update_status(&mut tx, &payment, PaymentStatus::Refunded, &patch)
            .await?;
        tx.commit().await.map_err(PaymentError::from)?;

        info!(
            payment_id,
            order_id = updated.order_id,
            "退款完成"
        );

        let envelope = EventEnvelope::new(
            EventKind::PaymentRefunded,
            PaymentRefundedEvent {
                payment_id: updated.id,
                order_id: updated.order_id,
                amount: amount.clone(),
                reason: reason.to_string(),
            },
        );
        self.publish(envelope, updated.order_id).await;

        Ok(())
    }

    // -----------------------------------------------------------------------
    // 定时任务入口
    // -----------------------------------------------------------------------

    /// 取消超时未支付的记录，返回处理条数
    ///
    /// 单条失败不影响其余：下一轮扫描会再次覆盖。
    pub async fn expire_stale_pending(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - chrono::Duration::minutes(model::PENDING_EXPIRY_MINUTES);
        let stale = self.repo.find_expired_pending(cutoff).await?;
        let mut expired = 0;

        for payment in &stale {
            if let Err(e) = self.expire_one(payment).await {
                warn!(payment_id = payment.id, error = %e, "取消超时支付失败，留待下轮");
                continue;
            }
            expired += 1;
        }

        if expired > 0 {
            info!(expired, scanned = stale.len(), "超时支付清理完成");
        }
        Ok(expired)
    }

    async fn expire_one(&self, payment: &Payment) -> Result<()> {
        if let Some(intent_id) = &payment.gateway_intent_id {
            self.gateway.cancel_intent(intent_id).await?;
        }

        let patch = StatusPatch {
            failure_reason: Some("支付超时自动取消".to_string()),
            ..StatusPatch::default()
        };

        let mut tx = self.pool.begin().await.map_err(PaymentError::from)?;
        let updated = self
            .repo
            .update_status(&mut tx, payment, PaymentStatus::Cancelled, &patch)
            .await?;
        tx.commit().await.map_err(PaymentError::from)?;

        self.publish_status_event(&updated, Utc::now()).await;
        Ok(())
    }

    /// 对停留在 PROCESSING 的支付重新拉取网关状态，返回扫描条数
    pub async fn reconcile_processing(&self) -> Result<usize> {
        let processing = self.repo.find_processing().await?;

        for payment in &processing {
            let Some(intent_id) = &payment.gateway_intent_id else {
                continue;
            };

            match self.gateway.retrieve_intent(intent_id).await {
                Ok(intent) => {
                    if let Err(e) = self.apply_gateway_update(&intent).await {
                        warn!(payment_id = payment.id, error = %e, "对账推进失败");
                    }
                }
                Err(e) => {
                    warn!(payment_id = payment.id, error = %e, "拉取网关意向失败");
                }
            }
        }

        info!(scanned = processing.len(), "PROCESSING 对账完成");
        Ok(processing.len())
    }

    /// 广播事件，失败只记日志（本地状态以数据库为准）
    async fn publish<T: serde::Serialize>(&self, envelope: EventEnvelope<T>, order_id: i64) {
        if let Err(e) = envelope.publish(&self.producer, &order_id.to_string()).await {
            warn!(order_id, error = %e, "广播支付事件失败");
        }
    }
}

/// 带退避重试的意向创建
///
/// 抽成自由函数便于用网关替身单测重试行为。
pub async fn create_intent_with_retry(
    gateway: &dyn PaymentGateway,
    policy: &RetryPolicy,
    order_id: i64,
    amount: &BigDecimal,
) -> std::result::Result<GatewayIntent, FlavoryError> {
    retry_with_policy(
        policy,
        "gateway_create_intent",
        |e| e.is_retryable(),
        || async move { gateway.create_intent(order_id, amount).await },
    )
    .await
}

/// 退款前置校验
fn validate_refund(payment: &Payment, amount: &BigDecimal, now: DateTime<Utc>) -> Result<()> {
    match payment.status {
        PaymentStatus::Refunded => {
            return Err(FlavoryError::RefundNotAllowed {
                reason: "该支付已退款".to_string(),
            }
            .into());
        }
        PaymentStatus::Succeeded => {}
        other => {
            return Err(FlavoryError::RefundNotAllowed {
                reason: format!("仅成功的支付可退款，当前状态: {other}"),
            }
            .into());
        }
    }

    if !payment.within_refund_window(now) {
        return Err(FlavoryError::RefundNotAllowed {
            reason: format!("超出 {} 天退款窗口", model::REFUND_WINDOW_DAYS),
        }
        .into());
    }

    if amount <= &BigDecimal::from(0) || amount > &payment.amount {
        return Err(FlavoryError::RefundNotAllowed {
            reason: format!("退款金额 {amount} 超出原支付金额 {}", payment.amount),
        }
        .into());
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
