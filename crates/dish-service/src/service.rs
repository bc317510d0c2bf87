//! 菜品业务逻辑
//!
//! 事件驱动的写入（下单扣减、取消回补、完单统计）在一个数据库事务内
//! 同时完成业务变更与幂等台账登记；可售状态发生变化时，
//! 在事务提交后对外广播 `dish.availability.changed`。

use bigdecimal::BigDecimal;
use flavory_shared::broker::BusProducer;
use flavory_shared::events::{
    DishAvailabilityChangedEvent, EventEnvelope, EventKind, OrderCancelledEvent,
    OrderCompletedEvent, OrderPlacedEvent,
};
use flavory_shared::idempotency;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use crate::error::{DishError, Result};
use crate::model::Dish;
use crate::repository::DishRepository;

/// 幂等台账中的消费者标识
pub const CONSUMER: &str = "dish-service";

pub struct DishService {
    pool: PgPool,
    repo: DishRepository,
    producer: BusProducer,
}

impl DishService {
    pub fn new(pool: PgPool, repo: DishRepository, producer: BusProducer) -> Self {
        Self {
            pool,
            repo,
            producer,
        }
    }

    pub async fn get_dish(&self, dish_id: i64) -> Result<Dish> {
        self.repo.find_by_id(dish_id).await
    }

    /// 处理 order.placed：逐项扣减库存
    ///
    /// 任意一项库存不足都会使整个事务回滚，订单侧收到冲突错误。
    /// 扣减到 0 的菜品在提交后广播售罄。
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_order_placed(
        &self,
        event_id: Option<&str>,
        event: &OrderPlacedEvent,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DishError::from)?;

        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(DishError::from)?;
            return Ok(());
        }

        let mut sold_out = Vec::new();
        for item in &event.items {
            let dish = self
                .repo
                .decrease_stock(&mut tx, item.dish_id, item.quantity)
                .await?;
            if dish.stock == 0 {
                sold_out.push(dish);
            }
        }

        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(DishError::from)?;

        info!(
            order_id = event.order_id,
            items = event.items.len(),
            sold_out = sold_out.len(),
            "订单库存扣减完成"
        );

        for dish in &sold_out {
            self.publish_availability(dish).await;
        }

        Ok(())
    }

    /// 处理 order.completed：累计各菜品销量
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_order_completed(
        &self,
        event_id: Option<&str>,
        event: &OrderCompletedEvent,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DishError::from)?;

        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(DishError::from)?;
            return Ok(());
        }

        for item in &event.items {
            let line_total = &item.unit_price * BigDecimal::from(item.quantity);
            self.repo
                .record_completed_order(&mut tx, item.dish_id, item.quantity, &line_total)
                .await?;
        }

        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(DishError::from)?;

        info!(order_id = event.order_id, "订单销量统计完成");
        Ok(())
    }

    /// 处理 order.cancelled：回补已扣减的库存
    ///
    /// 回补受单日上限约束；菜品仍在架且库存从 0 恢复时重新可售并广播。
    #[instrument(skip(self, event), fields(order_id = event.order_id))]
    pub async fn apply_order_cancelled(
        &self,
        event_id: Option<&str>,
        event: &OrderCancelledEvent,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DishError::from)?;

        if let Some(id) = event_id
            && idempotency::already_processed(&mut tx, id, CONSUMER).await?
        {
            tx.rollback().await.map_err(DishError::from)?;
            return Ok(());
        }

        let mut restored = Vec::new();
        for item in &event.items {
            let (dish, previous_stock) = self
                .repo
                .increase_stock(&mut tx, item.dish_id, item.quantity)
                .await?;
            if dish.available && previous_stock == 0 {
                restored.push(dish);
            }
        }

        if let Some(id) = event_id {
            idempotency::mark_processed(&mut tx, id, CONSUMER).await?;
        }
        tx.commit().await.map_err(DishError::from)?;

        info!(
            order_id = event.order_id,
            reason = %event.reason,
            items = event.items.len(),
            "订单取消，库存已回补"
        );

        for dish in &restored {
            self.publish_availability(dish).await;
        }
        Ok(())
    }

    /// 厨师补货
    ///
    /// 从 0 补到正数且菜品上架时恢复可售并广播。
    #[instrument(skip(self))]
    pub async fn increase_stock(&self, dish_id: i64, quantity: i32) -> Result<Dish> {
        if quantity <= 0 {
            return Err(DishError::Shared(
                flavory_shared::error::FlavoryError::Validation(format!(
                    "补货数量必须为正数: {quantity}"
                )),
            ));
        }

        let mut tx = self.pool.begin().await.map_err(DishError::from)?;
        let (dish, previous_stock) = self.repo.increase_stock(&mut tx, dish_id, quantity).await?;
        tx.commit().await.map_err(DishError::from)?;

        // 补货前库存为 0 说明可售状态刚刚翻转
        if dish.available && previous_stock == 0 {
            self.publish_availability(&dish).await;
        }

        Ok(dish)
    }

    /// 上架/下架菜品
    #[instrument(skip(self))]
    pub async fn set_active(&self, dish_id: i64, active: bool) -> Result<Dish> {
        let dish = self.repo.set_active(dish_id, active).await?;
        self.publish_availability(&dish).await;
        Ok(dish)
    }

    /// 追加评分，取值范围 1 到 5
    pub async fn add_rating(&self, dish_id: i64, rating: i32) -> Result<Dish> {
        validate_rating(rating)?;
        self.repo.add_rating(dish_id, rating).await
    }

    /// 广播可售状态变更
    ///
    /// 广播失败只记录日志：本地事务已提交，状态以数据库为准，
    /// 下游可以通过查询接口兜底。
    async fn publish_availability(&self, dish: &Dish) {
        let envelope = EventEnvelope::new(
            EventKind::DishAvailabilityChanged,
            DishAvailabilityChangedEvent {
                dish_id: dish.id,
                available: dish.available,
                stock: dish.stock,
            },
        );

        if let Err(e) = envelope.publish(&self.producer, &dish.id.to_string()).await {
            warn!(dish_id = dish.id, error = %e, "广播菜品可售状态失败");
        }
    }
}

/// 评分取值校验
fn validate_rating(rating: i32) -> Result<()> {
    if (1..=5).contains(&rating) {
        Ok(())
    } else {
        Err(DishError::InvalidRating { rating })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flavory_shared::config::{BrokerConfig, DatabaseConfig};
    use flavory_shared::database::Database;
    use flavory_shared::events::OrderLineItem;

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_duplicate_order_placed_decrements_once() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let repo = DishRepository::new(db.pool().clone());
        let producer = BusProducer::new(&BrokerConfig::default()).unwrap();
        let service = DishService::new(db.pool().clone(), repo, producer);

        let dish_id: i64 = sqlx::query_scalar(
            "INSERT INTO dishes (cook_id, name, price, stock, available, active) \
             VALUES (1, '幂等测试菜品', 18.00, 5, TRUE, TRUE) \
             RETURNING id",
        )
        .fetch_one(db.pool())
        .await
        .unwrap();

        let event_id = uuid::Uuid::now_v7().to_string();
        let event = OrderPlacedEvent {
            order_id: 9001,
            customer_id: 1,
            cook_id: 1,
            total_amount: BigDecimal::from(36),
            items: vec![OrderLineItem {
                dish_id,
                quantity: 2,
                unit_price: BigDecimal::from(18),
            }],
        };

        // 同一事件重投两次，库存只扣减一次
        service
            .apply_order_placed(Some(&event_id), &event)
            .await
            .unwrap();
        service
            .apply_order_placed(Some(&event_id), &event)
            .await
            .unwrap();

        let stock: i32 = sqlx::query_scalar("SELECT stock FROM dishes WHERE id = $1")
            .bind(dish_id)
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(stock, 3);

        sqlx::query("DELETE FROM dishes WHERE id = $1")
            .bind(dish_id)
            .execute(db.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM processed_events WHERE event_id = $1")
            .bind(&event_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    #[test]
    fn test_rating_bounds() {
        assert!(validate_rating(1).is_ok());
        assert!(validate_rating(5).is_ok());
        assert!(matches!(
            validate_rating(0),
            Err(DishError::InvalidRating { rating: 0 })
        ));
        assert!(matches!(
            validate_rating(6),
            Err(DishError::InvalidRating { rating: 6 })
        ));
    }
}
