//! 订单数据模型

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use flavory_shared::error::{FlavoryError, Result};
use flavory_shared::state_machine::TransitionTable;
use flavory_shared::text_status;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// 订单状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Paid,
    Confirmed,
    Preparing,
    Ready,
    InDelivery,
    Delivered,
    Cancelled,
    Failed,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Paid => "PAID",
            Self::Confirmed => "CONFIRMED",
            Self::Preparing => "PREPARING",
            Self::Ready => "READY",
            Self::InDelivery => "IN_DELIVERY",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "PAID" => Ok(Self::Paid),
            "CONFIRMED" => Ok(Self::Confirmed),
            "PREPARING" => Ok(Self::Preparing),
            "READY" => Ok(Self::Ready),
            "IN_DELIVERY" => Ok(Self::InDelivery),
            "DELIVERED" => Ok(Self::Delivered),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("未知的订单状态: {other}")),
        }
    }
}

text_status!(OrderStatus);

/// 订单状态迁移表
///
/// READY 之后不可取消（骑手可能已在路上）；
/// DELIVERED、CANCELLED、FAILED 为终态。
pub fn transitions() -> &'static TransitionTable<OrderStatus> {
    static TABLE: OnceLock<TransitionTable<OrderStatus>> = OnceLock::new();
    TABLE.get_or_init(|| {
        TransitionTable::new(
            "Order",
            &[
                (
                    OrderStatus::Pending,
                    &[
                        OrderStatus::Paid,
                        OrderStatus::Cancelled,
                        OrderStatus::Failed,
                    ],
                ),
                (
                    OrderStatus::Paid,
                    &[OrderStatus::Confirmed, OrderStatus::Cancelled],
                ),
                (
                    OrderStatus::Confirmed,
                    &[OrderStatus::Preparing, OrderStatus::Cancelled],
                ),
                (
                    OrderStatus::Preparing,
                    &[OrderStatus::Ready, OrderStatus::Cancelled],
                ),
                (OrderStatus::Ready, &[OrderStatus::InDelivery]),
                (
                    OrderStatus::InDelivery,
                    &[OrderStatus::Delivered, OrderStatus::Failed],
                ),
            ],
        )
    })
}

// ---------------------------------------------------------------------------
// Order
// ---------------------------------------------------------------------------

/// 订单
///
/// 金额不变式：`subtotal + delivery_fee == total_amount`，
/// 地址与联系人是下单时刻的快照。`version` 用于乐观并发控制，
/// 支付与配送两侧的事件可能并发推进同一订单。
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    pub customer_id: i64,
    pub cook_id: i64,
    pub status: OrderStatus,
    pub subtotal: BigDecimal,
    pub delivery_fee: BigDecimal,
    pub total_amount: BigDecimal,
    pub delivery_address: String,
    pub pickup_address: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub cook_name: String,
    pub cook_phone: String,
    pub cancel_reason: Option<String>,
    pub refunded: bool,
    pub rating: Option<i32>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 订单行
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub id: i64,
    pub order_id: i64,
    pub dish_id: i64,
    pub dish_name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
    pub line_total: BigDecimal,
}

// ---------------------------------------------------------------------------
// 下单请求
// ---------------------------------------------------------------------------

/// 下单请求的订单行
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrderItem {
    pub dish_id: i64,
    pub dish_name: String,
    pub quantity: i32,
    pub unit_price: BigDecimal,
}

impl NewOrderItem {
    pub fn line_total(&self) -> BigDecimal {
        &self.unit_price * BigDecimal::from(self.quantity)
    }
}

/// 下单请求
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub customer_id: i64,
    pub cook_id: i64,
    pub items: Vec<NewOrderItem>,
    pub delivery_fee: BigDecimal,
    pub delivery_address: String,
    pub pickup_address: String,
    pub customer_name: String,
    pub customer_phone: String,
    pub cook_name: String,
    pub cook_phone: String,
}

impl NewOrder {
    /// 下单校验
    ///
    /// 至少一行、每行数量为正、单价非负、地址非空。
    pub fn validate(&self) -> Result<()> {
        if self.items.is_empty() {
            return Err(FlavoryError::Validation("订单至少包含一个菜品".to_string()));
        }
        for item in &self.items {
            if item.quantity < 1 {
                return Err(FlavoryError::Validation(format!(
                    "菜品数量必须为正数: dish_id={}, quantity={}",
                    item.dish_id, item.quantity
                )));
            }
            if item.unit_price < BigDecimal::from(0) {
                return Err(FlavoryError::Validation(format!(
                    "菜品单价不能为负: dish_id={}",
                    item.dish_id
                )));
            }
        }
        if self.delivery_fee < BigDecimal::from(0) {
            return Err(FlavoryError::Validation("配送费不能为负".to_string()));
        }
        if self.delivery_address.trim().is_empty() || self.pickup_address.trim().is_empty() {
            return Err(FlavoryError::Validation("取送地址不能为空".to_string()));
        }
        Ok(())
    }

    /// 菜品小计：各行 line_total 之和
    pub fn subtotal(&self) -> BigDecimal {
        self.items
            .iter()
            .map(NewOrderItem::line_total)
            .sum::<BigDecimal>()
    }

    /// 订单总额 = 小计 + 配送费
    pub fn total_amount(&self) -> BigDecimal {
        self.subtotal() + &self.delivery_fee
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flavory_shared::state_machine::Transition;
    use std::str::FromStr;

    fn decimal(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn new_order() -> NewOrder {
        NewOrder {
            customer_id: 1,
            cook_id: 2,
            items: vec![
                NewOrderItem {
                    dish_id: 10,
                    dish_name: "红烧肉".to_string(),
                    quantity: 2,
                    unit_price: decimal("14.00"),
                },
                NewOrderItem {
                    dish_id: 11,
                    dish_name: "清炒时蔬".to_string(),
                    quantity: 1,
                    unit_price: decimal("8.50"),
                },
            ],
            delivery_fee: decimal("3.50"),
            delivery_address: "8 Avenue Foch, 75116 Paris".to_string(),
            pickup_address: "12 Rue de la Paix, 75002 Paris".to_string(),
            customer_name: "Jean Martin".to_string(),
            customer_phone: "+33622222222".to_string(),
            cook_name: "Marie Dubois".to_string(),
            cook_phone: "+33611111111".to_string(),
        }
    }

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::InDelivery,
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            let parsed: OrderStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("UNKNOWN".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let t = transitions();
        let chain = [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
            OrderStatus::Ready,
            OrderStatus::InDelivery,
            OrderStatus::Delivered,
        ];
        for pair in chain.windows(2) {
            assert_eq!(t.check(pair[0], pair[1]).unwrap(), Transition::Apply);
        }
    }

    #[test]
    fn test_cancel_window_closes_at_ready() {
        let t = transitions();
        // READY 之前（含 PREPARING）都可取消
        for from in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Confirmed,
            OrderStatus::Preparing,
        ] {
            assert_eq!(
                t.check(from, OrderStatus::Cancelled).unwrap(),
                Transition::Apply
            );
        }
        // READY 之后不能取消
        assert!(t.check(OrderStatus::Ready, OrderStatus::Cancelled).is_err());
        assert!(t
            .check(OrderStatus::InDelivery, OrderStatus::Cancelled)
            .is_err());
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let t = transitions();
        for terminal in [
            OrderStatus::Delivered,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert!(t.is_terminal(terminal));
            assert!(t.check(terminal, OrderStatus::Paid).is_err());
            assert_eq!(t.check(terminal, terminal).unwrap(), Transition::NoOp);
        }
    }

    #[test]
    fn test_delivered_order_cannot_regress() {
        let t = transitions();
        assert!(t
            .check(OrderStatus::Delivered, OrderStatus::InDelivery)
            .is_err());
        assert!(t.check(OrderStatus::Paid, OrderStatus::Pending).is_err());
    }

    #[test]
    fn test_new_order_money_invariant() {
        let order = new_order();
        assert!(order.validate().is_ok());
        // 2×14.00 + 1×8.50 = 36.50
        assert_eq!(order.subtotal(), decimal("36.50"));
        // 36.50 + 3.50 = 40.00
        assert_eq!(order.total_amount(), decimal("40.00"));
        assert_eq!(order.subtotal() + &order.delivery_fee, order.total_amount());
    }

    #[test]
    fn test_new_order_rejects_empty_items() {
        let mut order = new_order();
        order.items.clear();
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_new_order_rejects_bad_quantity_and_price() {
        let mut order = new_order();
        order.items[0].quantity = 0;
        assert!(order.validate().is_err());

        let mut order = new_order();
        order.items[0].unit_price = decimal("-1.00");
        assert!(order.validate().is_err());
    }

    #[test]
    fn test_new_order_rejects_blank_address() {
        let mut order = new_order();
        order.delivery_address = "  ".to_string();
        assert!(order.validate().is_err());
    }
}
