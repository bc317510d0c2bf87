//! 数据驱动的状态机
//!
//! 订单、支付、配送各自的状态迁移规则以邻接表数据的形式声明，
//! 由统一的 `TransitionTable` 执行合法性检查。
//! 约定：目标状态与当前状态相同视为幂等重放，返回 NoOp 而非错误；
//! 没有任何出边的状态即终态。

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;

use crate::error::{FlavoryError, Result};

/// 迁移检查的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 目标状态与当前状态相同，调用方应跳过写入
    NoOp,
    /// 合法迁移，调用方可执行状态写入
    Apply,
}

/// 状态迁移表
///
/// `S` 为具体的状态枚举。表在服务启动时构造一次，之后只读。
pub struct TransitionTable<S> {
    entity: &'static str,
    allowed: HashMap<S, Vec<S>>,
}

impl<S> TransitionTable<S>
where
    S: Copy + Eq + Hash + Display,
{
    /// 从邻接表构造迁移表
    ///
    /// `edges` 中未出现的状态视为终态（无出边）。
    pub fn new(entity: &'static str, edges: &[(S, &[S])]) -> Self {
        let allowed = edges
            .iter()
            .map(|(from, tos)| (*from, tos.to_vec()))
            .collect();
        Self { entity, allowed }
    }

    /// 当前状态允许迁往的状态集合
    pub fn allowed_from(&self, from: S) -> &[S] {
        self.allowed.get(&from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 是否为终态（没有任何出边）
    pub fn is_terminal(&self, status: S) -> bool {
        self.allowed_from(status).is_empty()
    }

    /// 检查一次迁移是否合法
    ///
    /// 返回 `NoOp` 表示重复投递的同状态写入，调用方应当静默跳过；
    /// 非法迁移返回 `InvalidTransition` 错误。
    pub fn check(&self, from: S, to: S) -> Result<Transition> {
        if from == to {
            return Ok(Transition::NoOp);
        }

        if self.allowed_from(from).contains(&to) {
            Ok(Transition::Apply)
        } else {
            Err(FlavoryError::InvalidTransition {
                entity: self.entity.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// 为状态枚举生成 TEXT 列的 sqlx 编解码实现
///
/// 状态在数据库中以大写文本存储（如 `REQUIRES_ACTION`），
/// 依赖枚举自身的 `Display` 与 `FromStr`。
/// 不使用 Postgres 原生枚举类型，避免每次加状态都要改数据库 schema。
#[macro_export]
macro_rules! text_status {
    ($ty:ty) => {
        impl sqlx::Type<sqlx::Postgres> for $ty {
            fn type_info() -> sqlx::postgres::PgTypeInfo {
                <&str as sqlx::Type<sqlx::Postgres>>::type_info()
            }

            fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
                <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Postgres> for $ty {
            fn encode_by_ref(
                &self,
                buf: &mut sqlx::postgres::PgArgumentBuffer,
            ) -> ::std::result::Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
                let text = self.to_string();
                <String as sqlx::Encode<'q, sqlx::Postgres>>::encode_by_ref(&text, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Postgres> for $ty {
            fn decode(
                value: sqlx::postgres::PgValueRef<'r>,
            ) -> ::std::result::Result<Self, sqlx::error::BoxDynError> {
                let text = <&str as sqlx::Decode<'r, sqlx::Postgres>>::decode(value)?;
                text.parse::<$ty>().map_err(Into::into)
            }
        }
    };
}
