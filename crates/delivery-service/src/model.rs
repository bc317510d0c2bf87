//! 配送数据模型

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use flavory_shared::state_machine::TransitionTable;
use flavory_shared::text_status;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ---------------------------------------------------------------------------
// DeliveryStatus
// ---------------------------------------------------------------------------

/// 配送状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Scheduled,
    CourierAssigned,
    PickedUp,
    InTransit,
    Delivered,
    Cancelled,
    Failed,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Scheduled => "SCHEDULED",
            Self::CourierAssigned => "COURIER_ASSIGNED",
            Self::PickedUp => "PICKED_UP",
            Self::InTransit => "IN_TRANSIT",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SCHEDULED" => Ok(Self::Scheduled),
            "COURIER_ASSIGNED" => Ok(Self::CourierAssigned),
            "PICKED_UP" => Ok(Self::PickedUp),
            "IN_TRANSIT" => Ok(Self::InTransit),
            "DELIVERED" => Ok(Self::Delivered),
            "CANCELLED" => Ok(Self::Cancelled),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("未知的配送状态: {other}")),
        }
    }
}

text_status!(DeliveryStatus);

/// 配送状态迁移表
///
/// 主链严格单向推进：PENDING → SCHEDULED → COURIER_ASSIGNED →
/// PICKED_UP → IN_TRANSIT → DELIVERED；任何非终态都可以走向
/// CANCELLED 或 FAILED。DELIVERED、CANCELLED、FAILED 为终态。
pub fn transitions() -> &'static TransitionTable<DeliveryStatus> {
    static TABLE: OnceLock<TransitionTable<DeliveryStatus>> = OnceLock::new();
    TABLE.get_or_init(|| {
        TransitionTable::new(
            "Delivery",
            &[
                (
                    DeliveryStatus::Pending,
                    &[
                        DeliveryStatus::Scheduled,
                        DeliveryStatus::Cancelled,
                        DeliveryStatus::Failed,
                    ],
                ),
                (
                    DeliveryStatus::Scheduled,
                    &[
                        DeliveryStatus::CourierAssigned,
                        DeliveryStatus::Cancelled,
                        DeliveryStatus::Failed,
                    ],
                ),
                (
                    DeliveryStatus::CourierAssigned,
                    &[
                        DeliveryStatus::PickedUp,
                        DeliveryStatus::Cancelled,
                        DeliveryStatus::Failed,
                    ],
                ),
                (
                    DeliveryStatus::PickedUp,
                    &[
                        DeliveryStatus::InTransit,
                        DeliveryStatus::Cancelled,
                        DeliveryStatus::Failed,
                    ],
                ),
                (
                    DeliveryStatus::InTransit,
                    &[
                        DeliveryStatus::Delivered,
                        DeliveryStatus::Cancelled,
                        DeliveryStatus::Failed,
                    ],
                ),
            ],
        )
    })
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// 配送记录
///
/// 每个订单至多一条（数据库 UNIQUE 约束兜底）。
/// 地址是下单时刻的快照；`version` 用于乐观并发控制，
/// 骑手 webhook 可能乱序或并发到达。
#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub id: i64,
    pub order_id: i64,
    pub status: DeliveryStatus,
    pub courier_job_id: Option<String>,
    pub courier_name: Option<String>,
    pub courier_phone: Option<String>,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub tracking_url: Option<String>,
    pub fee: Option<BigDecimal>,
    pub distance_meters: Option<i32>,
    pub estimated_pickup_at: Option<DateTime<Utc>>,
    pub estimated_delivery_at: Option<DateTime<Utc>>,
    pub actual_pickup_at: Option<DateTime<Utc>>,
    pub actual_delivery_at: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use flavory_shared::state_machine::Transition;

    #[test]
    fn test_status_parse_round_trip() {
        for status in [
            DeliveryStatus::Pending,
            DeliveryStatus::Scheduled,
            DeliveryStatus::CourierAssigned,
            DeliveryStatus::PickedUp,
            DeliveryStatus::InTransit,
            DeliveryStatus::Delivered,
            DeliveryStatus::Cancelled,
            DeliveryStatus::Failed,
        ] {
            let parsed: DeliveryStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("UNKNOWN".parse::<DeliveryStatus>().is_err());
    }

    #[test]
    fn test_main_chain_advances_in_order() {
        let t = transitions();
        let chain = [
            DeliveryStatus::Pending,
            DeliveryStatus::Scheduled,
            DeliveryStatus::CourierAssigned,
            DeliveryStatus::PickedUp,
            DeliveryStatus::InTransit,
            DeliveryStatus::Delivered,
        ];
        for pair in chain.windows(2) {
            assert_eq!(t.check(pair[0], pair[1]).unwrap(), Transition::Apply);
        }
    }

    #[test]
    fn test_no_skipping_ahead() {
        let t = transitions();
        // PENDING 不能直接到 DELIVERED，必须逐级推进
        assert!(t
            .check(DeliveryStatus::Pending, DeliveryStatus::Delivered)
            .is_err());
        assert!(t
            .check(DeliveryStatus::Scheduled, DeliveryStatus::InTransit)
            .is_err());
        // 也不能回退
        assert!(t
            .check(DeliveryStatus::InTransit, DeliveryStatus::PickedUp)
            .is_err());
    }

    #[test]
    fn test_cancel_and_fail_reachable_from_all_non_terminal() {
        let t = transitions();
        for from in [
            DeliveryStatus::Pending,
            DeliveryStatus::Scheduled,
            DeliveryStatus::CourierAssigned,
            DeliveryStatus::PickedUp,
            DeliveryStatus::InTransit,
        ] {
            assert_eq!(
                t.check(from, DeliveryStatus::Cancelled).unwrap(),
                Transition::Apply
            );
            assert_eq!(
                t.check(from, DeliveryStatus::Failed).unwrap(),
                Transition::Apply
            );
        }
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let t = transitions();
        for terminal in [
            DeliveryStatus::Delivered,
            DeliveryStatus::Cancelled,
            DeliveryStatus::Failed,
        ] {
            assert!(t.is_terminal(terminal));
            assert!(t.check(terminal, DeliveryStatus::Scheduled).is_err());
            // 同状态重放仍是 NoOp
            assert_eq!(t.check(terminal, terminal).unwrap(), Transition::NoOp);
        }
    }
}
