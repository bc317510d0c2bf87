//! 配送服务
//!
//! 消费 order.ready 事件创建骑手配送任务，接收骑手平台的状态 webhook，
//! 并把配送进度以事件的形式广播给订单服务。

pub mod dispatch;
pub mod error;
pub mod listener;
pub mod model;
pub mod repository;
pub mod service;
pub mod webhook;
