//! 支付服务专用错误类型

use flavory_shared::error::FlavoryError;

/// 支付服务错误
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// webhook 携带的 intent 在本地没有对应支付记录
    #[error("未知的支付意向: {intent_id}")]
    UnknownIntent { intent_id: String },

    /// 网关返回了无法识别的意向状态，忽略处理但记录日志
    #[error("无法识别的网关状态: {status}")]
    UnrecognizedGatewayStatus { status: String },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] FlavoryError),
}

impl From<sqlx::Error> for PaymentError {
    fn from(e: sqlx::Error) -> Self {
        Self::Shared(FlavoryError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, PaymentError>;
