//! 支付服务
//!
//! 负责订单支付全流程：收到 order.placed 后在支付网关创建支付意向，
//! 通过网关 webhook 与定时对账推进支付状态，并对外广播支付结果事件。
//! 退款遵循 30 天窗口且金额不超过原支付。

pub mod error;
pub mod gateway;
pub mod listener;
pub mod model;
pub mod repository;
pub mod scheduler;
pub mod service;
pub mod webhook;
