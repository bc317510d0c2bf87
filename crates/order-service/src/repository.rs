//! 订单数据访问层
//!
//! 状态写入统一走乐观锁（`WHERE id = $1 AND version = $2`）：
//! 支付与配送两侧的事件可能并发推进同一订单，
//! 落后的写入会得到 StaleVersion，由调用方重读后决定是否重试。

use flavory_shared::error::FlavoryError;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;
use crate::model::{NewOrder, Order, OrderItem, OrderStatus};

const ORDER_COLUMNS: &str = "id, customer_id, cook_id, status, subtotal, delivery_fee, \
     total_amount, delivery_address, pickup_address, customer_name, customer_phone, \
     cook_name, cook_phone, cancel_reason, refunded, rating, version, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, order_id, dish_id, dish_name, quantity, unit_price, line_total";

/// 状态写入时一并落库的字段，None 表示保持原值
#[derive(Debug, Clone, Default)]
pub struct StatusPatch {
    pub cancel_reason: Option<String>,
    pub refunded: Option<bool>,
}

#[derive(Clone)]
pub struct OrderRepository {
    pool: PgPool,
}

impl OrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 插入订单与订单行
    ///
    /// 金额在插入前由服务层算好：`subtotal + delivery_fee == total_amount`。
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        new: &NewOrder,
    ) -> Result<Order> {
        let subtotal = new.subtotal();
        let total = new.total_amount();

        let order = sqlx::query_as::<_, Order>(&format!(
            "INSERT INTO orders \
             (customer_id, cook_id, status, subtotal, delivery_fee, total_amount, \
              delivery_address, pickup_address, customer_name, customer_phone, \
              cook_name, cook_phone) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(new.customer_id)
        .bind(new.cook_id)
        .bind(OrderStatus::Pending)
        .bind(&subtotal)
        .bind(&new.delivery_fee)
        .bind(&total)
        .bind(&new.delivery_address)
        .bind(&new.pickup_address)
        .bind(&new.customer_name)
        .bind(&new.customer_phone)
        .bind(&new.cook_name)
        .bind(&new.cook_phone)
        .fetch_one(&mut **tx)
        .await?;

        for item in &new.items {
            sqlx::query(
                "INSERT INTO order_items \
                 (order_id, dish_id, dish_name, quantity, unit_price, line_total) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(order.id)
            .bind(item.dish_id)
            .bind(&item.dish_name)
            .bind(item.quantity)
            .bind(&item.unit_price)
            .bind(item.line_total())
            .execute(&mut **tx)
            .await?;
        }

        Ok(order)
    }

    pub async fn find_by_id(&self, order_id: i64) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            FlavoryError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            }
            .into()
        })
    }

    pub async fn find_items(&self, order_id: i64) -> Result<Vec<OrderItem>> {
        let items = sqlx::query_as::<_, OrderItem>(&format!(
            "SELECT {ITEM_COLUMNS} FROM order_items WHERE order_id = $1 ORDER BY id"
        ))
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(items)
    }

    /// 乐观锁状态写入
    ///
    /// 版本不匹配返回 StaleVersion，说明另一条链路已经先行推进。
    pub async fn update_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
        new_status: OrderStatus,
        patch: &StatusPatch,
    ) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders \
             SET status = $3, \
                 cancel_reason = COALESCE($4, cancel_reason), \
                 refunded = COALESCE($5, refunded), \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order.id)
        .bind(order.version)
        .bind(new_status)
        .bind(&patch.cancel_reason)
        .bind(patch.refunded)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            FlavoryError::StaleVersion {
                entity: "Order".to_string(),
                id: order.id.to_string(),
            }
            .into()
        })
    }

    /// 已送达订单的退款标记（状态不变，只做账务留痕）
    pub async fn mark_refunded(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        order: &Order,
    ) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders \
             SET refunded = TRUE, version = version + 1, updated_at = NOW() \
             WHERE id = $1 AND version = $2 \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order.id)
        .bind(order.version)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| {
            FlavoryError::StaleVersion {
                entity: "Order".to_string(),
                id: order.id.to_string(),
            }
            .into()
        })
    }

    /// 已送达订单的评分
    pub async fn set_rating(&self, order_id: i64, rating: i32) -> Result<Order> {
        sqlx::query_as::<_, Order>(&format!(
            "UPDATE orders \
             SET rating = $2, version = version + 1, updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {ORDER_COLUMNS}"
        ))
        .bind(order_id)
        .bind(rating)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            FlavoryError::NotFound {
                entity: "Order".to_string(),
                id: order_id.to_string(),
            }
            .into()
        })
    }

}
