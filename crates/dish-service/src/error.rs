//! 菜品服务专用错误类型

use flavory_shared::error::FlavoryError;

/// 菜品服务错误
#[derive(Debug, thiserror::Error)]
pub enum DishError {
    /// 评分必须在 1 到 5 之间
    #[error("无效的评分: {rating}")]
    InvalidRating { rating: i32 },

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] FlavoryError),
}

impl From<sqlx::Error> for DishError {
    fn from(e: sqlx::Error) -> Self {
        Self::Shared(FlavoryError::Database(e))
    }
}

pub type Result<T> = std::result::Result<T, DishError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DishError::InvalidRating { rating: 6 };
        assert_eq!(err.to_string(), "无效的评分: 6");

        let err = DishError::Shared(FlavoryError::InsufficientStock {
            dish_id: "3".to_string(),
            available: 1,
            requested: 2,
        });
        assert_eq!(err.to_string(), "库存不足: dish_id=3, 现有 1, 需要 2");
    }
}
