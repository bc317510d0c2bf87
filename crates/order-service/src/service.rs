//! 订单业务逻辑
//!
//! 写入入口有三类：顾客下单/取消/评分（HTTP）、厨师推进备餐进度
//! （HTTP）、支付与配送事件（消息）。所有状态写入都经过迁移表校验
//! 与乐观锁，两侧事件并发推进同一订单时落后者自动重读重试。

use flavory_shared::broker::BusProducer;
use flavory_shared::error::FlavoryError;
use flavory_shared::events::{
    DeliveryCompletedEvent, EventEnvelope, EventKind, OrderCancelledEvent, OrderCompletedEvent,
    OrderLineItem, OrderPlacedEvent, OrderReadyEvent, PaymentCancelledEvent, PaymentFailedEvent,
    PaymentRefundedEvent, PaymentSucceededEvent,
};
use flavory_shared::idempotency;
use flavory_shared::state_machine::Transition;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::error::{OrderError, Result};
use crate::model::{NewOrder, Order, OrderItem, OrderStatus, transitions};
use crate::repository::{OrderRepository, StatusPatch};

/// 幂等台账中的消费者标识
pub const CONSUMER: &str = "order-service";

/// 乐观锁冲突时的重读次数
const STALE_RETRY_ATTEMPTS: u32 = 3;

pub struct OrderService {
    pool: PgPool,
    repo: OrderRepository,
    producer: BusProducer,
}

impl OrderService {
    pub fn new(pool: PgPool, repo: OrderRepository, producer: BusProducer) -> Self {
        Self {
            pool,
            repo,
            producer,
        }
    }

    // -----------------------------------------------------------------------
    // 下单
    // -----------------------------------------------------------------------

    /// 顾客下单：落库 PENDING 订单并广播 order.placed
    ///
    /// order.placed 同时驱动菜品服务扣库存与支付服务创建支付意向。
    #[instrument(skip(self, new), fields(customer_id = new.customer_id))]
    pub async fn place_order(&self, new: &NewOrder) -> Result<Order> {
        new.validate()?;

        let mut tx = self.pool.begin().await.map_err(OrderError::from)?;
        let order = self.repo.insert(&mut tx, new).await?;
        tx.commit().await.map_err(OrderError::from)?;

        info!(
            order_id = order.id,
            total_amount = %order.total_amount,
            "订单已创建"
        );

        let items = new
            .items
            .iter()
            .map(|item| OrderLineItem {
                dish_id: item.dish_id,
                quantity: item.quantity,
                unit_price: item.unit_price.clone(),
            })
            .collect();

        let envelope = EventEnvelope::new(
            EventKind::OrderPlaced,
            OrderPlacedEvent {
                order_id: order.id,
                customer_id: order.customer_id,
                cook_id: order.cook_id,
                total_amount: order.total_amount.clone(),
                items,
            },
        );
        self.publish(envelope, order.id).await;

        Ok(order)
    }

    pub async fn get_order(&self, order_id: i64) -> Result<Order> {
        self.repo.find_by_id(order_id).await
    }

    pub async fn get_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        self.repo.find_items(order_id).await
    }

    // -----------------------------------------------------------------------
    // 厨师推进
    // -----------------------------------------------------------------------

    /// 厨师推进备餐进度：PAID → CONFIRMED → PREPARING → READY
    ///
    /// 只有订单所属的厨师可以操作。推进到 READY 时广播 order.ready，
    /// 触发配送服务创建骑手任务。
    #[instrument(skip(self))]
    pub async fn advance_by_cook(
        &self,
        order_id: i64,
        cook_id: i64,
        target: OrderStatus,
    ) -> Result<Order> {
        if !matches!(
            target,
            OrderStatus::Confirmed | OrderStatus::Preparing | OrderStatus::Ready
        ) {
            return Err(FlavoryError::Validation(format!(
                "厨师不能把订单推进到 {target}"
            ))
            .into());
        }

        let order = self.repo.find_by_id(order_id).await?;
        if order.cook_id != cook_id {
            return Err(FlavoryError::Unauthorized.into());
        }

        let updated = match transitions().check(order.status, target)? {
            Transition::NoOp => return Ok(order),
            Transition::Apply => {
                let mut tx = self.pool.begin().await.map_err(OrderError::from)?;
                let updated = self
                    .repo
                    .update_status(&mut tx, &order, target, &StatusPatch::default())
                    .await?;
                tx.commit().await.map_err(OrderError::from)?;
                updated
            }
        };

        info!(
            order_id,
            from = %order.status,
            to = %target,
            "备餐进度已推进"
        );

        if updated.status == OrderStatus::Ready {
            let envelope = EventEnvelope::new(
                EventKind::OrderReady,
                OrderReadyEvent {
                    order_id: updated.id,
                    cook_id: updated.cook_id,
                    customer_id: updated.customer_id,
                    pickup_address: updated.pickup_address.clone(),
                    delivery_address: updated.delivery_address.clone(),
                    cook_name: updated.cook_name.clone(),
                    cook_phone: updated.cook_phone.clone(),
                    customer_name: updated.customer_name.clone(),
                    customer_phone: updated.customer_phone.clone(),
                },
            );
            self.publish(envelope, updated.id).await;
        }

        Ok(updated)
    }

    /// 顾客取消订单
    ///
    /// 迁移表决定可取消的窗口（READY 之前）；窗口外返回冲突错误。
    #[instrument(skip(self))]
    pub async fn cancel_by_customer(
        &self,
        order_id: i64,
        customer_id: i64,
        reason: &str,
    ) -> Result<Order> {
        let order = self.repo.find_by_id(order_id).await?;
        if order.customer_id != customer_id {
            return Err(FlavoryError::Unauthorized.into());
        }

        let updated = self
            .cancel_internal(&order, reason)
            .await?
            .unwrap_or(order);
        Ok(updated)
    }

    /// 已送达订单的评分，取值范围 1 到 5
    pub async fn rate_order(&self, order_id: i64, customer_id: i64, rating: i32) -> Result<Order> {
        if !(1..=5).contains(&rating) {
            return Err(FlavoryError::Validation(format!("评分必须在 1 到 5 之间: {rating}")).into());
        }

        let order = self.repo.find_by_id(order_id).await?;
        if order.customer_id != customer_id {
            return Err(FlavoryError::Unauthorized.into());
        }
        if order.status != OrderStatus::Delivered {
            return Err(OrderError::NotRateable {
                order_id,
                status: order.status.to_string(),
            });
        }

        self.repo.set_rating(order_id, rating).await
    }

    // -----------------------------------------------------------------------
    // 支付事件
    // -----------------------------------------------------------------------

    /// 处理 payment.succeeded：PENDING → PAID
    ///
    /// 订单已离开 PENDING（如超时取消与支付成功赛跑）时按过期消息忽略，
    /// 退款流程会兜底。
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_payment_succeeded(
        &self,
        event_id: Option<&str>,
        event: &PaymentSucceededEvent,
    ) -> Result<()> {
        self.apply_transition(event_id, event.order_id, OrderStatus::Paid, StatusPatch::default())
            .await
            .map(|_| ())
    }

    /// 处理 payment.failed：订单取消
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_payment_failed(
        &self,
        event_id: Option<&str>,
        event: &PaymentFailedEvent,
    ) -> Result<()> {
        self.cancel_from_event(event_id, event.order_id, &format!("支付失败: {}", event.reason))
            .await
    }

    /// 处理 payment.cancelled（超时自动取消等）：订单取消
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_payment_cancelled(
        &self,
        event_id: Option<&str>,
        event: &PaymentCancelledEvent,
    ) -> Result<()> {
        self.cancel_from_event(event_id, event.order_id, &event.reason)
            .await
    }

    /// 处理 payment.refunded
    ///
    /// 未送达的订单随退款取消；已送达的订单状态不动，只做退款留痕。
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_payment_refunded(
        &self,
        event_id: Option<&str>,
        event: &PaymentRefundedEvent,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(OrderError::from)?;
        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(OrderError::from)?;
            return Ok(());
        }

        let order = self.repo.find_by_id(event.order_id).await?;

        if order.status == OrderStatus::Delivered {
            self.repo.mark_refunded(&mut tx, &order).await?;
            if let Some(id) = event_id {
                idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
            }
            tx.commit().await.map_err(OrderError::from)?;
            info!(order_id = order.id, "已送达订单完成退款留痕");
            return Ok(());
        }

        let reason = format!("退款: {}", event.reason);
        let patch = StatusPatch {
            cancel_reason: Some(reason.clone()),
            refunded: Some(true),
        };
        let mut cancelled = false;
        match transitions().check(order.status, OrderStatus::Cancelled) {
            Ok(Transition::NoOp) => {}
            Ok(Transition::Apply) => {
                let updated = self
                    .repo
                    .update_status(&mut tx, &order, OrderStatus::Cancelled, &patch)
                    .await?;
                info!(order_id = updated.id, "订单随退款取消");
                cancelled = true;
            }
            Err(e) => {
                warn!(order_id = order.id, status = %order.status, error = %e, "退款订单不可取消，仅留痕");
                self.repo.mark_refunded(&mut tx, &order).await?;
            }
        }

        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(OrderError::from)?;

        if cancelled {
            match self.order_line_items(order.id).await {
                Ok(items) => self.publish_cancelled(order.id, &reason, items).await,
                Err(e) => {
                    warn!(order_id = order.id, error = %e, "读取订单明细失败，取消事件未广播");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 配送事件
    // -----------------------------------------------------------------------

    /// 处理 delivery.picked_up / delivery.started：READY → IN_DELIVERY
    ///
    /// 两个事件都可能先到，后到的那个被同状态 NoOp 吸收。
    #[instrument(skip(self))]
    pub async fn apply_delivery_underway(
        &self,
        event_id: Option<&str>,
        order_id: i64,
    ) -> Result<()> {
        self.apply_transition(
            event_id,
            order_id,
            OrderStatus::InDelivery,
            StatusPatch::default(),
        )
        .await
        .map(|_| ())
    }

    /// 处理 delivery.completed：IN_DELIVERY → DELIVERED，随后广播 order.completed
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_delivery_completed(
        &self,
        event_id: Option<&str>,
        event: &DeliveryCompletedEvent,
    ) -> Result<()> {
        let advanced = self
            .apply_transition(
                event_id,
                event.order_id,
                OrderStatus::Delivered,
                StatusPatch::default(),
            )
            .await?;

        // 重复投递或过期消息不触发二次广播
        if !advanced {
            return Ok(());
        }

        let order = self.repo.find_by_id(event.order_id).await?;
        let items = self.order_line_items(order.id).await?;

        let envelope = EventEnvelope::new(
            EventKind::OrderCompleted,
            OrderCompletedEvent {
                order_id: order.id,
                customer_id: order.customer_id,
                cook_id: order.cook_id,
                items,
            },
        );
        self.publish(envelope, order.id).await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // 内部工具
    // -----------------------------------------------------------------------

    /// 事件驱动的状态推进通用路径
    ///
    /// 幂等台账与状态写入同事务提交；乱序送达的旧状态被迁移表
    /// 拒绝后按过期消息忽略；乐观锁冲突重读重试。
    /// 返回 true 表示状态实际发生了推进。
    async fn apply_transition(
        &self,
        event_id: Option<&str>,
        order_id: i64,
        target: OrderStatus,
        patch: StatusPatch,
    ) -> Result<bool> {
        for attempt in 0..STALE_RETRY_ATTEMPTS {
            match self
                .try_apply_transition(event_id, order_id, target, &patch)
                .await
            {
                Err(OrderError::Shared(FlavoryError::StaleVersion { .. }))
                    if attempt + 1 < STALE_RETRY_ATTEMPTS =>
                {
                    warn!(order_id, attempt, "并发写入冲突，重读后重试");
                }
                other => return other,
            }
        }
        unreachable!("重试循环总是在最后一轮返回");
    }

    async fn try_apply_transition(
        &self,
        event_id: Option<&str>,
        order_id: i64,
        target: OrderStatus,
        patch: &StatusPatch,
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(OrderError::from)?;
        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(OrderError::from)?;
            return Ok(false);
        }

        let order = self.repo.find_by_id(order_id).await?;

        let advanced = match transitions().check(order.status, target) {
            Ok(Transition::NoOp) => false,
            Ok(Transition::Apply) => {
                let updated = self
                    .repo
                    .update_status(&mut tx, &order, target, patch)
                    .await?;
                info!(
                    order_id,
                    from = %order.status,
                    to = %updated.status,
                    "订单状态已推进"
                );
                true
            }
            Err(e) => {
                // 事件乱序（如超时取消后才到的支付成功），忽略
                warn!(
                    order_id,
                    from = %order.status,
                    to = %target,
                    error = %e,
                    "过期的订单状态更新，忽略"
                );
                false
            }
        };

        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(OrderError::from)?;
        Ok(advanced)
    }

    /// 事件驱动的取消通用路径
    ///
    /// 取消实际生效时广播 order.cancelled（携带明细供菜品服务回补库存）。
    /// 明细在状态写入前读取，读取失败时事务尚未开启，消息可安全重投。
    async fn cancel_from_event(
        &self,
        event_id: Option<&str>,
        order_id: i64,
        reason: &str,
    ) -> Result<()> {
        let items = self.order_line_items(order_id).await?;
        let patch = StatusPatch {
            cancel_reason: Some(reason.to_string()),
            refunded: None,
        };
        let advanced = self
            .apply_transition(event_id, order_id, OrderStatus::Cancelled, patch)
            .await?;

        if advanced {
            self.publish_cancelled(order_id, reason, items).await;
        }
        Ok(())
    }

    /// 取消的落库与广播；NoOp 时返回 None
    async fn cancel_internal(&self, order: &Order, reason: &str) -> Result<Option<Order>> {
        match transitions().check(order.status, OrderStatus::Cancelled)? {
            Transition::NoOp => return Ok(None),
            Transition::Apply => {}
        }

        let items = self.order_line_items(order.id).await?;
        let patch = StatusPatch {
            cancel_reason: Some(reason.to_string()),
            refunded: None,
        };
        let mut tx = self.pool.begin().await.map_err(OrderError::from)?;
        let updated = self
            .repo
            .update_status(&mut tx, order, OrderStatus::Cancelled, &patch)
            .await?;
        tx.commit().await.map_err(OrderError::from)?;

        info!(order_id = updated.id, reason, "订单已取消");
        self.publish_cancelled(updated.id, reason, items).await;

        Ok(Some(updated))
    }

    /// 订单明细转为事件行项目
    async fn order_line_items(&self, order_id: i64) -> Result<Vec<OrderLineItem>> {
        let items = self
            .repo
            .find_items(order_id)
            .await?
            .into_iter()
            .map(|item| OrderLineItem {
                dish_id: item.dish_id,
                quantity: item.quantity,
                unit_price: item.unit_price,
            })
            .collect();
        Ok(items)
    }

    async fn publish_cancelled(&self, order_id: i64, reason: &str, items: Vec<OrderLineItem>) {
        let envelope = EventEnvelope::new(
            EventKind::OrderCancelled,
            OrderCancelledEvent {
                order_id,
                reason: reason.to_string(),
                items,
            },
        );
        self.publish(envelope, order_id).await;
    }

    /// 广播事件，失败只记日志（本地状态以数据库为准）
    async fn publish<T: serde::Serialize>(&self, envelope: EventEnvelope<T>, order_id: i64) {
        if let Err(e) = envelope.publish(&self.producer, &order_id.to_string()).await {
            warn!(order_id, error = %e, "广播订单事件失败");
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::transitions;

    #[test]
    fn test_payment_success_only_applies_from_pending() {
        let t = transitions();
        // PENDING 的订单可以进入 PAID
        assert!(t.check(OrderStatus::Pending, OrderStatus::Paid).is_ok());
        // 已取消的订单拒绝 PAID，消费链路按过期消息忽略
        assert!(t.check(OrderStatus::Cancelled, OrderStatus::Paid).is_err());
        // 重复投递吸收为 NoOp
        assert_eq!(
            t.check(OrderStatus::Paid, OrderStatus::Paid).unwrap(),
            Transition::NoOp
        );
    }

    #[test]
    fn test_delivery_events_race_is_absorbed() {
        let t = transitions();
        // picked_up 与 started 谁先到都一样：第一个推进，第二个 NoOp
        assert_eq!(
            t.check(OrderStatus::Ready, OrderStatus::InDelivery).unwrap(),
            Transition::Apply
        );
        assert_eq!(
            t.check(OrderStatus::InDelivery, OrderStatus::InDelivery)
                .unwrap(),
            Transition::NoOp
        );
    }
}
