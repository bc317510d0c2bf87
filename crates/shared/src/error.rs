//! 统一错误处理模块
//!
//! 定义 saga 流程中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 错误分类直接决定消息层的处理策略：本地业务冲突不可盲目重试，
//! 基础设施故障可按退避策略重试，重试耗尽后进入死信队列。

use bigdecimal::BigDecimal;
use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum FlavoryError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("记录未找到: {entity} id={id}")]
    NotFound { entity: String, id: String },

    /// 基于乐观锁版本号的写入被拒绝，调用方应重读后重试
    #[error("并发写入冲突: {entity} id={id}")]
    StaleVersion { entity: String, id: String },

    // ==================== 消息总线错误 ====================
    #[error("消息总线错误: {0}")]
    Broker(String),

    #[error("负载序列化失败: {0}")]
    Serialization(String),

    // ==================== 业务冲突错误 ====================
    /// 同一订单只允许存在一条支付记录
    #[error("订单已存在支付记录: order_id={order_id}")]
    DuplicatePayment { order_id: String },

    #[error("库存不足: dish_id={dish_id}, 现有 {available}, 需要 {requested}")]
    InsufficientStock {
        dish_id: String,
        available: i32,
        requested: i32,
    },

    /// 状态机拒绝的非法状态迁移
    #[error("非法状态迁移: {entity} {from} -> {to}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("菜品不可下单: {dish_id} - {reason}")]
    DishNotAvailable { dish_id: String, reason: String },

    #[error("退款不允许: {reason}")]
    RefundNotAllowed { reason: String },

    // ==================== 验证错误 ====================
    #[error("参数验证失败: {0}")]
    Validation(String),

    #[error("无效的金额: {amount}")]
    InvalidAmount { amount: BigDecimal },

    // ==================== 权限错误 ====================
    #[error("未授权访问")]
    Unauthorized,

    /// Webhook 签名校验失败，负载不可信
    #[error("Webhook 签名校验失败: {0}")]
    InvalidSignature(String),

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalGateway { service: String, message: String },

    #[error("外部服务超时: {service}")]
    ExternalGatewayTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, FlavoryError>;

impl FlavoryError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::StaleVersion { .. } => "STALE_VERSION",
            Self::Broker(_) => "BROKER_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::DuplicatePayment { .. } => "DUPLICATE_PAYMENT",
            Self::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::DishNotAvailable { .. } => "DISH_NOT_AVAILABLE",
            Self::RefundNotAllowed { .. } => "REFUND_NOT_ALLOWED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::InvalidSignature(_) => "INVALID_SIGNATURE",
            Self::ExternalGateway { .. } => "EXTERNAL_GATEWAY_ERROR",
            Self::ExternalGatewayTimeout { .. } => "EXTERNAL_GATEWAY_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 仅基础设施层的瞬时故障可重试；业务冲突（重复支付、库存不足、
    /// 非法迁移）重试多少次结果都一样，应直接进入死信队列等待人工处理。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::Broker(_)
                | Self::StaleVersion { .. }
                | Self::ExternalGateway { .. }
                | Self::ExternalGatewayTimeout { .. }
        )
    }

    /// 是否为本地业务冲突
    ///
    /// 消费者捕获到冲突错误时不应无限重试消息，而是在有限次投递后
    /// 路由到死信队列。
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::DuplicatePayment { .. }
                | Self::InsufficientStock { .. }
                | Self::InvalidTransition { .. }
                | Self::DishNotAvailable { .. }
                | Self::RefundNotAllowed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = FlavoryError::NotFound {
            entity: "Order".to_string(),
            id: "42".to_string(),
        };
        assert_eq!(err.code(), "NOT_FOUND");

        let err = FlavoryError::DuplicatePayment {
            order_id: "42".to_string(),
        };
        assert_eq!(err.code(), "DUPLICATE_PAYMENT");
    }

    #[test]
    fn test_is_retryable() {
        let db_err = FlavoryError::Database(sqlx::Error::PoolTimedOut);
        assert!(db_err.is_retryable());

        let gateway_err = FlavoryError::ExternalGateway {
            service: "stripe".to_string(),
            message: "502".to_string(),
        };
        assert!(gateway_err.is_retryable());

        let stock_err = FlavoryError::InsufficientStock {
            dish_id: "d-1".to_string(),
            available: 2,
            requested: 5,
        };
        assert!(!stock_err.is_retryable());
    }

    #[test]
    fn test_is_conflict() {
        let transition_err = FlavoryError::InvalidTransition {
            entity: "Order".to_string(),
            from: "DELIVERED".to_string(),
            to: "PAID".to_string(),
        };
        assert!(transition_err.is_conflict());
        assert!(!transition_err.is_retryable());

        let not_found = FlavoryError::NotFound {
            entity: "Payment".to_string(),
            id: "1".to_string(),
        };
        assert!(!not_found.is_conflict());
    }
}
