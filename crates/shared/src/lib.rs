//! 共享库
//!
//! 包含四个服务（订单、支付、配送、菜品）共用的基础设施代码：
//! 配置加载、错误分类、数据库连接、事件总线、幂等台账、状态机与重试策略。

pub mod broker;
pub mod config;
pub mod database;
pub mod dlq;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod observability;
pub mod retry;
pub mod signature;
pub mod state_machine;
