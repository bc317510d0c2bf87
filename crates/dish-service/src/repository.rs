//! 菜品数据访问层
//!
//! 库存写入全部走条件 UPDATE（`WHERE active AND available AND stock >= 需求量`），
//! 由数据库保证并发扣减不会把库存写成负数，也不会卖出已下架的菜品。
//! 参与事件消费的方法接收调用方事务，与幂等台账同事务提交。

use bigdecimal::BigDecimal;
use flavory_shared::error::FlavoryError;
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;
use crate::model::Dish;

const DISH_COLUMNS: &str = "id, cook_id, name, price, stock, max_daily_stock, available, active, \
     order_count, revenue, rating_sum, rating_count, version, created_at, updated_at";

#[derive(Clone)]
pub struct DishRepository {
    pool: PgPool,
}

impl DishRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, dish_id: i64) -> Result<Dish> {
        let dish = sqlx::query_as::<_, Dish>(&format!(
            "SELECT {DISH_COLUMNS} FROM dishes WHERE id = $1"
        ))
        .bind(dish_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| FlavoryError::NotFound {
            entity: "Dish".to_string(),
            id: dish_id.to_string(),
        })?;

        Ok(dish)
    }

    /// 扣减库存
    ///
    /// 只有上架且可售的菜品能被扣减。条件 UPDATE 未命中时再查一次，
    /// 用 [`Dish::try_decrement`] 归类失败原因：不存在、已下架/不可售、
    /// 或库存不足。扣减到 0 时 `available` 同步置为 false。
    pub async fn decrease_stock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dish_id: i64,
        quantity: i32,
    ) -> Result<Dish> {
        let updated = sqlx::query_as::<_, Dish>(&format!(
            "UPDATE dishes \
             SET stock = stock - $2, \
                 available = active AND (stock - $2) > 0, \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 AND active AND available AND stock >= $2 \
             RETURNING {DISH_COLUMNS}"
        ))
        .bind(dish_id)
        .bind(quantity)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some(dish) = updated {
            return Ok(dish);
        }

        let current = sqlx::query_as::<_, Dish>(&format!(
            "SELECT {DISH_COLUMNS} FROM dishes WHERE id = $1"
        ))
        .bind(dish_id)
        .fetch_optional(&mut **tx)
        .await?;

        match current {
            Some(mut dish) => match dish.try_decrement(quantity) {
                Err(e) => Err(e.into()),
                // 条件更新未命中但复读又可扣减，说明读到了并发补货，按版本冲突重投
                Ok(()) => Err(FlavoryError::StaleVersion {
                    entity: "Dish".to_string(),
                    id: dish_id.to_string(),
                }
                .into()),
            },
            None => Err(FlavoryError::NotFound {
                entity: "Dish".to_string(),
                id: dish_id.to_string(),
            }
            .into()),
        }
    }

    /// 增加库存（厨师补货）
    ///
    /// 上架中的菜品补货后恢复可售；设置了单日上限的菜品补货不超过上限。
    /// 先锁行读出补货前库存，调用方据此判断可售状态是否翻转。
    pub async fn increase_stock(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dish_id: i64,
        quantity: i32,
    ) -> Result<(Dish, i32)> {
        let previous_stock: i32 =
            sqlx::query_scalar("SELECT stock FROM dishes WHERE id = $1 FOR UPDATE")
                .bind(dish_id)
                .fetch_optional(&mut **tx)
                .await?
                .ok_or_else(|| FlavoryError::NotFound {
                    entity: "Dish".to_string(),
                    id: dish_id.to_string(),
                })?;

        let dish = sqlx::query_as::<_, Dish>(&format!(
            "UPDATE dishes \
             SET stock = CASE WHEN max_daily_stock > 0 \
                              THEN LEAST(stock + $2, max_daily_stock) \
                              ELSE stock + $2 END, \
                 available = active, \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {DISH_COLUMNS}"
        ))
        .bind(dish_id)
        .bind(quantity)
        .fetch_one(&mut **tx)
        .await?;

        Ok((dish, previous_stock))
    }

    /// 订单完成后累计销量与流水
    pub async fn record_completed_order(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        dish_id: i64,
        quantity: i32,
        line_total: &BigDecimal,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE dishes \
             SET order_count = order_count + $2, \
                 revenue = revenue + $3, \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(dish_id)
        .bind(quantity)
        .bind(line_total)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    /// 追加一条评分
    pub async fn add_rating(&self, dish_id: i64, rating: i32) -> Result<Dish> {
        sqlx::query_as::<_, Dish>(&format!(
            "UPDATE dishes \
             SET rating_sum = rating_sum + $2, \
                 rating_count = rating_count + 1, \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {DISH_COLUMNS}"
        ))
        .bind(dish_id)
        .bind(rating)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            FlavoryError::NotFound {
                entity: "Dish".to_string(),
                id: dish_id.to_string(),
            }
            .into()
        })
    }

    /// 上架/下架
    ///
    /// 下架即不可售；重新上架时仅在有库存的情况下恢复可售。
    pub async fn set_active(&self, dish_id: i64, active: bool) -> Result<Dish> {
        sqlx::query_as::<_, Dish>(&format!(
            "UPDATE dishes \
             SET active = $2, \
                 available = $2 AND stock > 0, \
                 version = version + 1, \
                 updated_at = NOW() \
             WHERE id = $1 \
             RETURNING {DISH_COLUMNS}"
        ))
        .bind(dish_id)
        .bind(active)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            FlavoryError::NotFound {
                entity: "Dish".to_string(),
                id: dish_id.to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DishError;
    use flavory_shared::config::DatabaseConfig;
    use flavory_shared::database::Database;

    async fn seed_dish(
        tx: &mut Transaction<'_, Postgres>,
        stock: i32,
        active: bool,
    ) -> i64 {
        sqlx::query_scalar(
            "INSERT INTO dishes (cook_id, name, price, stock, available, active) \
             VALUES (1, '测试菜品', 18.00, $1, $2 AND $1 > 0, $2) \
             RETURNING id",
        )
        .bind(stock)
        .bind(active)
        .fetch_one(&mut **tx)
        .await
        .unwrap()
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_decrease_to_zero_flips_availability() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let repo = DishRepository::new(db.pool().clone());
        let mut tx = db.pool().begin().await.unwrap();

        let dish_id = seed_dish(&mut tx, 2, true).await;
        let dish = repo.decrease_stock(&mut tx, dish_id, 2).await.unwrap();

        assert_eq!(dish.stock, 0);
        assert!(!dish.available, "售罄后应不可售");

        // 售罄后继续下单被拒绝
        let err = repo.decrease_stock(&mut tx, dish_id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            DishError::Shared(FlavoryError::DishNotAvailable { .. })
        ));

        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_insufficient_stock_leaves_row_untouched() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let repo = DishRepository::new(db.pool().clone());
        let mut tx = db.pool().begin().await.unwrap();

        let dish_id = seed_dish(&mut tx, 1, true).await;
        let err = repo.decrease_stock(&mut tx, dish_id, 3).await.unwrap_err();
        assert!(matches!(
            err,
            DishError::Shared(FlavoryError::InsufficientStock {
                available: 1,
                requested: 3,
                ..
            })
        ));

        let (stock, version): (i32, i64) =
            sqlx::query_as("SELECT stock, version FROM dishes WHERE id = $1")
                .bind(dish_id)
                .fetch_one(&mut *tx)
                .await
                .unwrap();
        assert_eq!(stock, 1, "拒绝后库存不变");
        assert_eq!(version, 0, "拒绝后版本号不变");

        tx.rollback().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // 需要数据库连接
    async fn test_decrease_rejects_inactive_dish() {
        let db = Database::connect(&DatabaseConfig::default()).await.unwrap();
        let repo = DishRepository::new(db.pool().clone());
        let mut tx = db.pool().begin().await.unwrap();

        // 有库存但已下架
        let dish_id = seed_dish(&mut tx, 5, false).await;
        let err = repo.decrease_stock(&mut tx, dish_id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            DishError::Shared(FlavoryError::DishNotAvailable { .. })
        ));

        tx.rollback().await.unwrap();
    }
}
