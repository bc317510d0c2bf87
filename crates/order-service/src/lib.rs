//! 订单服务
//!
//! 订单是 saga 的发起方与终点：下单后广播 order.placed 驱动扣库存与
//! 创建支付，随后被支付、配送两侧的事件推着走完整个生命周期，
//! 厨师通过 HTTP 接口推进备餐进度。

pub mod api;
pub mod error;
pub mod listener;
pub mod model;
pub mod repository;
pub mod service;
