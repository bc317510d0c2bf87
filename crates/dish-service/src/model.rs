//! 菜品数据模型

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use flavory_shared::error::FlavoryError;
use serde::Serialize;
use sqlx::FromRow;

/// 菜品
///
/// `available` 是派生状态：`active && stock > 0`。
/// 所有库存写入都必须同步维护该字段，读路径直接使用而不再推导。
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dish {
    pub id: i64,
    pub cook_id: i64,
    pub name: String,
    pub price: BigDecimal,
    pub stock: i32,
    /// 单日库存上限，0 表示不限制；补货不会超过该值
    pub max_daily_stock: i32,
    pub available: bool,
    /// 厨师是否将菜品上架；下架菜品即使有库存也不可售
    pub active: bool,
    pub order_count: i32,
    /// 已完成订单的累计流水
    pub revenue: BigDecimal,
    pub rating_sum: i32,
    pub rating_count: i32,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Dish {
    /// 按下单语义扣减库存
    ///
    /// 与仓储层条件 UPDATE 是同一套规则：下架或不可售拒绝、库存不足拒绝、
    /// 扣减到 0 时同步置为不可售。条件 UPDATE 未命中后的失败归类复用
    /// 此方法，保证两条路径判定一致。失败时不修改任何字段。
    pub fn try_decrement(&mut self, quantity: i32) -> Result<(), FlavoryError> {
        if !self.active {
            return Err(FlavoryError::DishNotAvailable {
                dish_id: self.id.to_string(),
                reason: "已下架".to_string(),
            });
        }
        if !self.available {
            return Err(FlavoryError::DishNotAvailable {
                dish_id: self.id.to_string(),
                reason: "暂不可售".to_string(),
            });
        }
        if self.stock < quantity {
            return Err(FlavoryError::InsufficientStock {
                dish_id: self.id.to_string(),
                available: self.stock,
                requested: quantity,
            });
        }
        self.stock -= quantity;
        self.available = self.active && self.stock > 0;
        Ok(())
    }

    /// 平均评分，保留一位小数；无评分时返回 None
    pub fn average_rating(&self) -> Option<f64> {
        if self.rating_count == 0 {
            return None;
        }
        let avg = f64::from(self.rating_sum) / f64::from(self.rating_count);
        Some((avg * 10.0).round() / 10.0)
    }
}
