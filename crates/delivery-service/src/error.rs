//! 配送服务专用错误类型

use flavory_shared::error::FlavoryError;

/// 配送服务错误
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// webhook 携带的任务 ID 在本地没有对应配送记录
    #[error("未知的骑手任务: {job_id}")]
    UnknownCourierJob { job_id: String },

    /// 骑手平台返回了无法识别的状态，忽略处理但记录日志
    #[error("无法识别的骑手状态: {status}")]
    UnrecognizedCourierStatus { status: String },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] FlavoryError),
}

impl From<sqlx::Error> for DeliveryError {
    fn from(e: sqlx::Error) -> Self {
        Self::Shared(FlavoryError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, DeliveryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeliveryError::UnknownCourierJob {
            job_id: "job-77".to_string(),
        };
        assert_eq!(err.to_string(), "未知的骑手任务: job-77");

        let err = DeliveryError::Shared(FlavoryError::InvalidTransition {
            entity: "Delivery".to_string(),
            from: "PENDING".to_string(),
            to: "DELIVERED".to_string(),
        });
        assert_eq!(err.to_string(), "非法状态迁移: Delivery PENDING -> DELIVERED");
    }
}
