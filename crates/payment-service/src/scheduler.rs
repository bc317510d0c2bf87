//! 支付定时任务
//!
//! 两个后台循环：
//! - 每 10 分钟清理超时未支付的记录（取消网关意向并置为 CANCELLED）
//! - 每天 03:00 对停留在 PROCESSING 的支付重新拉取网关状态对账
//!
//! 单条记录的失败只记日志，不会中断整轮任务。

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::service::PaymentService;

/// 超时清理扫描间隔
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// 夜间对账 cron 表达式（秒 分 时 日 月 星期）
const RECONCILIATION_CRON: &str = "0 0 3 * * *";

/// 每 10 分钟一轮的超时支付清理
pub async fn run_expiry_sweep(service: Arc<PaymentService>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    info!(
        interval_secs = EXPIRY_SWEEP_INTERVAL.as_secs(),
        "超时支付清理任务已启动"
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("超时支付清理任务退出");
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = service.expire_stale_pending(Utc::now()).await {
                    error!(error = %e, "超时支付清理轮次失败");
                }
            }
        }
    }
}

/// 每天 03:00 的 PROCESSING 对账
///
/// 用 cron 表达式计算下一次执行时刻再 sleep，
/// 避免 interval 漂移导致执行时间逐渐偏离凌晨低峰。
pub async fn run_nightly_reconciliation(
    service: Arc<PaymentService>,
    mut shutdown: watch::Receiver<bool>,
) {
    let schedule = Schedule::from_str(RECONCILIATION_CRON).expect("cron 表达式为编译期常量");
    info!(cron = RECONCILIATION_CRON, "夜间对账任务已启动");

    loop {
        let Some(next) = schedule.upcoming(Utc).next() else {
            warn!("cron 计划没有后续执行时刻，对账任务退出");
            break;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("夜间对账任务退出");
                    break;
                }
            }
            _ = tokio::time::sleep(wait) => {
                info!(scheduled_at = %next, "开始夜间对账");
                if let Err(e) = service.reconcile_processing().await {
                    error!(error = %e, "夜间对账轮次失败");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliation_cron_parses() {
        let schedule = Schedule::from_str(RECONCILIATION_CRON).unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        // 执行时刻总是凌晨 3 点整
        use chrono::Timelike;
        assert_eq!(next.hour(), 3);
        assert_eq!(next.minute(), 0);
        assert_eq!(next.second(), 0);
    }
}
