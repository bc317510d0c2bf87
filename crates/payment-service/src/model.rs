//! 支付数据模型与金额规则

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use bigdecimal::{BigDecimal, RoundingMode};
use chrono::{DateTime, Utc};
use flavory_shared::error::{FlavoryError, Result};
use flavory_shared::state_machine::TransitionTable;
use flavory_shared::text_status;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 待支付超时时间，超过后由清理任务取消
pub const PENDING_EXPIRY_MINUTES: i64 = 30;
/// 退款窗口：支付成功后 30 天内可退
pub const REFUND_WINDOW_DAYS: i64 = 30;

// ---------------------------------------------------------------------------
// PaymentStatus
// ---------------------------------------------------------------------------

/// 支付状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    RequiresAction,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    Refunded,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::RequiresAction => "REQUIRES_ACTION",
            Self::Processing => "PROCESSING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Refunded => "REFUNDED",
        };
        f.write_str(s)
    }
}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "REQUIRES_ACTION" => Ok(Self::RequiresAction),
            "PROCESSING" => Ok(Self::Processing),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "REFUNDED" => Ok(Self::Refunded),
            other => Err(format!("未知的支付状态: {other}")),
        }
    }
}

text_status!(PaymentStatus);

/// 支付状态迁移表
///
/// FAILED、CANCELLED、REFUNDED 为终态；成功的支付只能走向退款。
pub fn transitions() -> &'static TransitionTable<PaymentStatus> {
    static TABLE: OnceLock<TransitionTable<PaymentStatus>> = OnceLock::new();
    TABLE.get_or_init(|| {
        TransitionTable::new(
            "Payment",
            &[
                (
                    PaymentStatus::Pending,
                    &[
                        PaymentStatus::RequiresAction,
                        PaymentStatus::Processing,
                        PaymentStatus::Succeeded,
                        PaymentStatus::Failed,
                        PaymentStatus::Cancelled,
                    ],
                ),
                (
                    PaymentStatus::RequiresAction,
                    &[
                        PaymentStatus::Processing,
                        PaymentStatus::Succeeded,
                        PaymentStatus::Failed,
                        PaymentStatus::Cancelled,
                    ],
                ),
                (
                    PaymentStatus::Processing,
                    &[
                        PaymentStatus::Succeeded,
                        PaymentStatus::Failed,
                        PaymentStatus::Cancelled,
                    ],
                ),
                (PaymentStatus::Succeeded, &[PaymentStatus::Refunded]),
            ],
        )
    })
}

// ---------------------------------------------------------------------------
// Payment
// ---------------------------------------------------------------------------

/// 支付记录
///
/// 每个订单至多一条（数据库 UNIQUE 约束兜底）。
/// `version` 用于乐观并发控制，webhook 与定时对账可能同时写入。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Payment {
    pub id: i64,
    pub order_id: i64,
    pub customer_id: i64,
    pub amount: BigDecimal,
    pub platform_fee: BigDecimal,
    pub cook_payout: BigDecimal,
    pub status: PaymentStatus,
    pub gateway_intent_id: Option<String>,
    pub gateway_charge_id: Option<String>,
    pub failure_reason: Option<String>,
    pub refunded_amount: Option<BigDecimal>,
    pub paid_at: Option<DateTime<Utc>>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// 退款是否还在窗口期内
    pub fn within_refund_window(&self, now: DateTime<Utc>) -> bool {
        match self.paid_at {
            Some(paid_at) => now - paid_at <= chrono::Duration::days(REFUND_WINDOW_DAYS),
            None => false,
        }
    }
}

// ---------------------------------------------------------------------------
// 金额规则
// ---------------------------------------------------------------------------

fn decimal(s: &str) -> BigDecimal {
    BigDecimal::from_str(s).expect("字面量必然合法")
}

/// 金额与分账规则配置
#[derive(Debug, Clone)]
pub struct FeeConfig {
    /// 允许的最小支付金额
    pub min_amount: BigDecimal,
    /// 允许的最大支付金额
    pub max_amount: BigDecimal,
    /// 平台服务费比例
    pub fee_percentage: BigDecimal,
    /// 服务费下限
    pub min_fee: BigDecimal,
    /// 服务费上限
    pub max_fee: BigDecimal,
}

impl Default for FeeConfig {
    /// 默认：金额区间 [1.00, 10000.00]，费率 10%，服务费夹到 [1.00, 50.00]
    fn default() -> Self {
        Self {
            min_amount: decimal("1.00"),
            max_amount: decimal("10000.00"),
            fee_percentage: decimal("0.10"),
            min_fee: decimal("1.00"),
            max_fee: decimal("50.00"),
        }
    }
}

impl FeeConfig {
    /// 校验支付金额在配置区间内
    pub fn validate_amount(&self, amount: &BigDecimal) -> Result<()> {
        if *amount < self.min_amount || *amount > self.max_amount {
            return Err(FlavoryError::InvalidAmount {
                amount: amount.clone(),
            });
        }
        Ok(())
    }

    /// 平台服务费
    ///
    /// 金额 × 费率，四舍五入（half-up）到分，再夹到 [min_fee, max_fee]。
    pub fn platform_fee(&self, amount: &BigDecimal) -> BigDecimal {
        let fee = (amount * &self.fee_percentage).with_scale_round(2, RoundingMode::HalfUp);

        if fee < self.min_fee {
            self.min_fee.clone()
        } else if fee > self.max_fee {
            self.max_fee.clone()
        } else {
            fee
        }
    }

    /// 厨师分账金额 = 支付金额 - 平台服务费
    ///
    /// 两者之和必须精确等于支付金额。
    pub fn cook_payout(&self, amount: &BigDecimal, fee: &BigDecimal) -> BigDecimal {
        (amount - fee).with_scale_round(2, RoundingMode::HalfUp)
    }
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
            PaymentStatus::Pending,
            PaymentStatus::RequiresAction,
            PaymentStatus::Processing,
            PaymentStatus::Succeeded,
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
            PaymentStatus::Refunded,
        ] {
            let parsed: PaymentStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
        assert!("UNKNOWN".parse::<PaymentStatus>().is_err());
    }

    #[test]
    fn test_happy_path_transitions() {
        let t = transitions();
        assert_eq!(
            t.check(PaymentStatus::Pending, PaymentStatus::Processing)
                .unwrap(),
            Transition::Apply
        );
        assert_eq!(
            t.check(PaymentStatus::Processing, PaymentStatus::Succeeded)
                .unwrap(),
            Transition::Apply
        );
        assert_eq!(
            t.check(PaymentStatus::Succeeded, PaymentStatus::Refunded)
                .unwrap(),
            Transition::Apply
        );
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let t = transitions();
        for terminal in [
            PaymentStatus::Failed,
            PaymentStatus::Cancelled,
            PaymentStatus::Refunded,
        ] {
            assert!(t.is_terminal(terminal));
            assert!(t.check(terminal, PaymentStatus::Succeeded).is_err());
            // 同状态重放仍是 NoOp
            assert_eq!(t.check(terminal, terminal).unwrap(), Transition::NoOp);
        }
    }

    #[test]
    fn test_succeeded_cannot_fail() {
        let t = transitions();
        assert!(t
            .check(PaymentStatus::Succeeded, PaymentStatus::Failed)
            .is_err());
        assert!(t
            .check(PaymentStatus::Succeeded, PaymentStatus::Pending)
            .is_err());
    }

    #[test]
    fn test_amount_bounds() {
        let config = FeeConfig::default();
        assert!(config.validate_amount(&decimal("1.00")).is_ok());
        assert!(config.validate_amount(&decimal("10000.00")).is_ok());
        assert!(config.validate_amount(&decimal("0.99")).is_err());
        assert!(config.validate_amount(&decimal("10000.01")).is_err());
    }

    #[test]
    fn test_platform_fee_ten_percent() {
        let config = FeeConfig::default();
        // 金额 100.00，费率 10% -> 服务费 10.00，分账 90.00
        let fee = config.platform_fee(&decimal("100.00"));
        assert_eq!(fee, decimal("10.00"));
        assert_eq!(config.cook_payout(&decimal("100.00"), &fee), decimal("90.00"));
    }

    #[test]
    fn test_platform_fee_clamped_to_min() {
        let config = FeeConfig::default();
        // 金额 5.00，10% = 0.50，夹到下限 1.00，分账 4.00
        let fee = config.platform_fee(&decimal("5.00"));
        assert_eq!(fee, decimal("1.00"));
        assert_eq!(config.cook_payout(&decimal("5.00"), &fee), decimal("4.00"));
    }

    #[test]
    fn test_platform_fee_clamped_to_max() {
        let config = FeeConfig::default();
        assert_eq!(config.platform_fee(&decimal("600.00")), decimal("50.00"));
        assert_eq!(config.platform_fee(&decimal("10000.00")), decimal("50.00"));
    }

    #[test]
    fn test_platform_fee_half_up_rounding() {
        let config = FeeConfig::default();
        // 25.55 * 10% = 2.555 -> 2.56
        assert_eq!(config.platform_fee(&decimal("25.55")), decimal("2.56"));
        // 25.54 * 10% = 2.554 -> 2.55
        assert_eq!(config.platform_fee(&decimal("25.54")), decimal("2.55"));
    }

    #[test]
    fn test_fee_and_payout_reconcile_exactly() {
        let config = FeeConfig::default();
        for raw in ["1.00", "5.00", "25.55", "100.00", "9999.99"] {
            let amount = decimal(raw);
            let fee = config.platform_fee(&amount);
            let payout = config.cook_payout(&amount, &fee);
            assert_eq!(&fee + &payout, amount);
        }
    }

    #[test]
    fn test_refund_window() {
        let now = Utc::now();
        let payment = Payment {
            id: 1,
            order_id: 1,
            customer_id: 1,
            amount: decimal("30.00"),
            platform_fee: decimal("3.00"),
            cook_payout: decimal("27.00"),
            status: PaymentStatus::Succeeded,
            gateway_intent_id: Some("pi_1".to_string()),
            gateway_charge_id: Some("ch_1".to_string()),
            failure_reason: None,
            refunded_amount: None,
            paid_at: Some(now - chrono::Duration::days(29)),
            refunded_at: None,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        assert!(payment.within_refund_window(now));

        let expired = Payment {
            paid_at: Some(now - chrono::Duration::days(31)),
            ..payment.clone()
        };
        assert!(!expired.within_refund_window(now));

        // 未支付成功的记录没有窗口可言
        let unpaid = Payment {
            paid_at: None,
            ..payment
        };
        assert!(!unpaid.within_refund_window(now));
    }
}
