//! 指数退避重试执行器
//!
//! 对外部支付网关、配送调度 API 和数据库的瞬时故障提供自动恢复能力。
//! 是否重试由调用方传入的 `is_retryable` 闭包决定：业务冲突
//! （重复支付、库存不足等）无论重试多少次结果不变，不应进入重试循环。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::FlavoryError;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// 重试策略配置
///
/// 采用指数退避防止对故障中的下游造成重试风暴：
/// 第 1 次重试等 1 秒，第 2 次等 2 秒，第 3 次等 4 秒，直到上限。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间
    pub initial_delay: Duration,
    /// 退避时间上限
    pub max_delay: Duration,
    /// 每轮退避的倍数
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 默认策略：最多重试 3 次，初始 1 秒，上限 30 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 计算第 N 轮重试的等待时间（attempt 从 0 开始）
    ///
    /// 公式: initial_delay * multiplier^attempt，封顶于 max_delay。
    /// f64 运算带来的微秒级精度损失对秒级退避可忽略。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// attempt 为已失败的轮次，小于 max_retries 时允许继续
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

// ---------------------------------------------------------------------------
// retry_with_policy
// ---------------------------------------------------------------------------

/// 对任意异步操作应用重试策略
///
/// 仅当 `is_retryable` 判定错误为瞬时故障时才进入退避重试，
/// 其余错误直接向上传播。
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&FlavoryError) -> bool,
    mut operation: F,
) -> Result<T, FlavoryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FlavoryError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "操作失败且不可重试，直接返回错误"
                    );
                    return Err(err);
                }

                if !policy.should_retry(attempt) {
                    warn!(
                        operation = operation_name,
                        attempt,
                        max_retries = policy.max_retries,
                        error = %err,
                        "已达最大重试次数，放弃重试"
                    );
                    return Err(err);
                }

                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，将在退避后重试"
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// 单元测试
// ---------------------------------------------------------------------------
