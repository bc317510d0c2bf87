//! 配送业务逻辑
//!
//! 入口有两类：order.ready 事件（创建骑手任务）与骑手平台 webhook
//! （推进配送状态）。所有状态写入都经过迁移表校验与乐观锁，
//! 并发到达的 webhook 落后者自动重读重试。

use std::sync::Arc;

use chrono::Utc;
use flavory_shared::broker::BusProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{
    DeliveryCompletedEvent, DeliveryPickedUpEvent, DeliveryStartedEvent, EventEnvelope, EventKind,
    OrderReadyEvent,
};
use flavory_shared::idempotency;
use flavory_shared::retry::{RetryPolicy, retry_with_policy};
use flavory_shared::state_machine::Transition;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::dispatch::{CourierDispatch, CourierJob, DispatchRequest, map_courier_status};
use crate::error::{DeliveryError, Result};
use crate::model::{Delivery, DeliveryStatus, transitions};
use crate::repository::{DeliveryRepository, StatusPatch};

/// 幂等台账中的消费者标识
pub const CONSUMER: &str = "delivery-service";

/// 乐观锁冲突时的重读次数
const STALE_RETRY_ATTEMPTS: u32 = 3;

/// 骑手平台 webhook 解析后的状态更新
#[derive(Debug, Clone)]
pub struct CourierStatusUpdate {
    pub job_id: String,
    pub status: String,
    pub courier_name: Option<String>,
    pub courier_phone: Option<String>,
    pub tracking_url: Option<String>,
    pub cancel_reason: Option<String>,
}

pub struct DeliveryService {
    pool: PgPool,
    repo: DeliveryRepository,
    dispatch: Arc<dyn CourierDispatch>,
    producer: BusProducer,
    retry_policy: RetryPolicy,
}

impl DeliveryService {
    pub fn new(
        pool: PgPool,
        repo: DeliveryRepository,
        dispatch: Arc<dyn CourierDispatch>,
        producer: BusProducer,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            repo,
            dispatch,
            producer,
            retry_policy,
        }
    }

    // -----------------------------------------------------------------------
    // 创建配送任务
    // -----------------------------------------------------------------------

    /// 处理 order.ready：创建本地配送记录并向骑手平台下单
    ///
    /// 先落库 PENDING 再调平台：即便进程在外呼前崩溃，
    /// 消息重投也能从 PENDING 记录继续。平台下单失败时记录转入
    /// FAILED 并向上抛错，由消息层按退避重投/死信，不静默吞掉。
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn create_for_ready_order(
        &self,
        event_id: Option<&str>,
        event: &OrderReadyEvent,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DeliveryError::from)?;

        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(DeliveryError::from)?;
            return Ok(());
        }

        let delivery = match self
            .repo
            .insert(
                &mut tx,
                event.order_id,
                &event.pickup_address,
                &event.delivery_address,
            )
            .await?
        {
            Some(delivery) => {
                tx.commit().await.map_err(DeliveryError::from)?;
                delivery
            }
            // 一单一送约束挡下了重复投递；仍停在 PENDING 的记录继续走下单
            None => {
                tx.rollback().await.map_err(DeliveryError::from)?;
                let existing = self.repo.find_by_order(event.order_id).await?.ok_or_else(
                    || FlavoryError::NotFound {
                        entity: "Delivery".to_string(),
                        id: format!("order:{}", event.order_id),
                    },
                )?;
                if existing.status != DeliveryStatus::Pending {
                    info!(
                        order_id = event.order_id,
                        status = %existing.status,
                        "订单配送记录已存在，跳过"
                    );
                    return Ok(());
                }
                existing
            }
        };

        let request = DispatchRequest::from_ready_order(event);
        let job =
            match create_job_with_retry(&*self.dispatch, &self.retry_policy, &request).await {
                Ok(job) => job,
                Err(e) => {
                    self.mark_dispatch_failed(&delivery, &e).await;
                    return Err(e.into());
                }
            };

        let mut tx = self.pool.begin().await.map_err(DeliveryError::from)?;
        let updated = self
            .repo
            .record_scheduled_job(&mut tx, &delivery, &job)
            .await?;
        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(DeliveryError::from)?;

        info!(
            order_id = event.order_id,
            delivery_id = updated.id,
            job_id = %job.id,
            "骑手任务已创建，配送进入 SCHEDULED"
        );
        Ok(())
    }

    /// 下单失败的善后：转入 FAILED 留痕，写入失败只记日志
    ///
    /// 调用方随后抛出原始错误，消息层据此重投或死信。
    async fn mark_dispatch_failed(&self, delivery: &Delivery, error: &FlavoryError) {
        let patch = StatusPatch {
            cancel_reason: Some(format!("骑手任务创建失败: {error}")),
            ..StatusPatch::default()
        };

        let result = async {
            let mut tx = self.pool.begin().await.map_err(DeliveryError::from)?;
            self.repo
                .update_status(&mut tx, delivery, DeliveryStatus::Failed, &patch)
                .await?;
            tx.commit().await.map_err(DeliveryError::from)
        }
        .await;

        if let Err(e) = result {
            warn!(delivery_id = delivery.id, error = %e, "配送记录转入 FAILED 失败");
        }
    }

    // -----------------------------------------------------------------------
    // 取消配送
    // -----------------------------------------------------------------------

    /// 运营取消配送，只允许骑手尚未接单的阶段（PENDING / SCHEDULED）
    ///
    /// 平台侧任务尽力取消：平台报错只记日志，本地记录照常转入
    /// CANCELLED，平台侧残留状态由后续 webhook 对账。
    #[instrument(skip(self))]
    pub async fn cancel_delivery(&self, delivery_id: i64, reason: &str) -> Result<Delivery> {
        let delivery = self.repo.find_by_id(delivery_id).await?;

        if !matches!(
            delivery.status,
            DeliveryStatus::Pending | DeliveryStatus::Scheduled
        ) {
            return Err(FlavoryError::InvalidTransition {
                entity: "Delivery".to_string(),
                from: delivery.status.to_string(),
                to: DeliveryStatus::Cancelled.to_string(),
            }
            .into());
        }

        if let Some(job_id) = delivery.courier_job_id.as_deref()
            && let Err(e) = self.dispatch.cancel_job(job_id).await
        {
            warn!(delivery_id, job_id, error = %e, "骑手平台任务取消失败，等待 webhook 对账");
        }

        let patch = StatusPatch {
            cancel_reason: Some(reason.to_string()),
            ..StatusPatch::default()
        };
        let mut tx = self.pool.begin().await.map_err(DeliveryError::from)?;
        let updated = self
            .repo
            .update_status(&mut tx, &delivery, DeliveryStatus::Cancelled, &patch)
            .await?;
        tx.commit().await.map_err(DeliveryError::from)?;

        info!(delivery_id, reason, "配送已取消");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // 骑手状态推进
    // -----------------------------------------------------------------------

    /// 以骑手平台 webhook 推进本地配送状态
    ///
    /// 无法识别的平台状态忽略；乱序送达的旧状态被迁移表拒绝后
    /// 按过期消息忽略；状态实际变化时才对外广播。
    #[instrument(skip(self, update), fields(job_id = %update.job_id))]
    pub async fn apply_courier_update(&self, update: &CourierStatusUpdate) -> Result<()> {
        let Some(new_status) = map_courier_status(&update.status) else {
            warn!(status = %update.status, "无法识别的骑手状态，忽略");
            return Ok(());
        };

        for attempt in 0..STALE_RETRY_ATTEMPTS {
            match self.try_apply_status(update, new_status).await {
                Err(DeliveryError::Shared(FlavoryError::StaleVersion { .. }))
                    if attempt + 1 < STALE_RETRY_ATTEMPTS =>
                {
                    warn!(job_id = %update.job_id, attempt, "并发写入冲突，重读后重试");
                }
                other => return other,
            }
        }
        unreachable!("重试循环总是在最后一轮返回");
    }

    async fn try_apply_status(
        &self,
        update: &CourierStatusUpdate,
        new_status: DeliveryStatus,
    ) -> Result<()> {
        let delivery = self
            .repo
            .find_by_job_id(&update.job_id)
            .await?
            .ok_or_else(|| DeliveryError::UnknownCourierJob {
                job_id: update.job_id.clone(),
            })?;

        match transitions().check(delivery.status, new_status) {
            Ok(Transition::NoOp) => return Ok(()),
            Ok(Transition::Apply) => {}
            Err(e) => {
                // 平台 webhook 乱序（如取件之后才到的 courier_assigned），忽略
                warn!(
                    delivery_id = delivery.id,
                    from = %delivery.status,
                    to = %new_status,
                    error = %e,
                    "过期的骑手状态更新，忽略"
                );
                return Ok(());
            }
        }

        let now = Utc::now();
        let mut patch = StatusPatch {
            courier_name: update.courier_name.clone(),
            courier_phone: update.courier_phone.clone(),
            tracking_url: update.tracking_url.clone(),
            ..StatusPatch::default()
        };
        match new_status {
            DeliveryStatus::PickedUp => patch.actual_pickup_at = Some(now),
            DeliveryStatus::Delivered => patch.actual_delivery_at = Some(now),
            DeliveryStatus::Cancelled => {
                patch.cancel_reason = Some(
                    update
                        .cancel_reason
                        .clone()
                        .unwrap_or_else(|| "骑手平台取消".to_string()),
                );
            }
            _ => {}
        }

        let mut tx = self.pool.begin().await.map_err(DeliveryError::from)?;
        let updated = self
            .repo
            .update_status(&mut tx, &delivery, new_status, &patch)
            .await?;
        tx.commit().await.map_err(DeliveryError::from)?;

        info!(
            delivery_id = updated.id,
            order_id = updated.order_id,
            from = %delivery.status,
            to = %new_status,
            "配送状态已推进"
        );

        self.publish_status_event(&updated).await;
        Ok(())
    }

    /// 状态对应的领域事件；SCHEDULED、COURIER_ASSIGNED 等中间状态不广播
    async fn publish_status_event(&self, delivery: &Delivery) {
        let now = Utc::now();
        match delivery.status {
            DeliveryStatus::PickedUp => {
                let envelope = EventEnvelope::new(
                    EventKind::DeliveryPickedUp,
                    DeliveryPickedUpEvent {
                        delivery_id: delivery.id,
                        order_id: delivery.order_id,
                        picked_up_at: delivery.actual_pickup_at.unwrap_or(now),
                    },
                );
                self.publish(envelope, delivery.order_id).await;
            }
            DeliveryStatus::InTransit => {
                let envelope = EventEnvelope::new(
                    EventKind::DeliveryStarted,
                    DeliveryStartedEvent {
                        delivery_id: delivery.id,
                        order_id: delivery.order_id,
                        started_at: now,
                    },
                );
                self.publish(envelope, delivery.order_id).await;
            }
            DeliveryStatus::Delivered => {
                let envelope = EventEnvelope::new(
                    EventKind::DeliveryCompleted,
                    DeliveryCompletedEvent {
                        delivery_id: delivery.id,
                        order_id: delivery.order_id,
                        delivered_at: delivery.actual_delivery_at.unwrap_or(now),
                    },
                );
                self.publish(envelope, delivery.order_id).await;
            }
            _ => {}
        }
    }

    /// 广播事件，失败只记日志（本地状态以数据库为准）
    async fn publish<T: serde::Serialize>(&self, envelope: EventEnvelope<T>, order_id: i64) {
        if let Err(e) = envelope.publish(&self.producer, &order_id.to_string()).await {
            warn!(order_id, error = %e, "广播配送事件失败");
        }
    }
}

/// 带退避重试的骑手任务创建
///
/// 抽成自由函数便于用平台替身单测重试行为。
pub async fn create_job_with_retry(
    dispatch: &dyn CourierDispatch,
    policy: &RetryPolicy,
    request: &DispatchRequest,
) -> std::result::Result<CourierJob, FlavoryError> {
    retry_with_policy(
        policy,
        "courier_create_job",
        |e| e.is_retryable(),
        || async move { dispatch.create_job(request).await },
    )
    .await
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MockCourierDispatch;
    use std::time::Duration;

    fn request() -> DispatchRequest {
        DispatchRequest {
            client_reference: "ORDER_42".to_string(),
            pickup_address: "12 Rue de la Paix, 75002 Paris".to_string(),
            pickup_contact_firstname: "Marie".to_string(),
            pickup_contact_lastname: "Dubois".to_string(),
            pickup_contact_phone: "+33611111111".to_string(),
            pickup_contact_company: "Flavory Kitchen".to_string(),
            dropoff_address: "8 Avenue Foch, 75116 Paris".to_string(),
            dropoff_contact_firstname: "Jean".to_string(),
            dropoff_contact_lastname: "Martin".to_string(),
            dropoff_contact_phone: "+33622222222".to_string(),
            package_description: "Order #42 - Home-cooked meal".to_string(),
        }
    }

    fn job(id: &str) -> CourierJob {
        CourierJob {
            id: id.to_string(),
            tracking_url: Some("https://track.example/job".to_string()),
            fee: None,
            distance_meters: Some(2500),
            estimated_pickup_at: None,
            estimated_delivery_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_job_retries_transient_failures() {
        let mut mock = MockCourierDispatch::new();
        let mut calls = 0;
        mock.expect_create_job().times(2).returning(move |_| {
            calls += 1;
            if calls < 2 {
                Err(FlavoryError::ExternalGatewayTimeout {
                    service: "stuart".to_string(),
                })
            } else {
                Ok(job("job-retry"))
            }
        });

        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        };

        let job = create_job_with_retry(&mock, &policy, &request()).await.unwrap();
        assert_eq!(job.id, "job-retry");
    }

    #[tokio::test]
    async fn test_create_job_gives_up_after_budget() {
        let mut mock = MockCourierDispatch::new();
        // 首次执行 + 2 次重试
        mock.expect_create_job().times(3).returning(|_| {
            Err(FlavoryError::ExternalGateway {
                service: "stuart".to_string(),
                message: "503".to_string(),
            })
        });

        let policy = RetryPolicy {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        };

        let result = create_job_with_retry(&mock, &policy, &request()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_create_job_does_not_retry_validation_errors() {
        let mut mock = MockCourierDispatch::new();
        mock.expect_create_job().times(1).returning(|_| {
            Err(FlavoryError::Validation("地址缺失".to_string()))
        });

        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        };

        let result = create_job_with_retry(&mock, &policy, &request()).await;
        assert!(matches!(result, Err(FlavoryError::Validation(_))));
    }
}
