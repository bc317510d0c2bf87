//! 订单服务专用错误类型

use flavory_shared::error::FlavoryError;

/// 订单服务错误
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// 评分只能打给已送达的订单
    #[error("订单尚未送达，不能评分: order_id={order_id}, 当前状态 {status}")]
    NotRateable { order_id: i64, status: String },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] FlavoryError),
}

impl From<sqlx::Error> for OrderError {
    fn from(e: sqlx::Error) -> Self {
        Self::Shared(FlavoryError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, OrderError>;
