//! 菜品服务
//!
//! 维护菜品库存与可售状态：订单创建时扣减库存（不足即拒绝），
//! 订单取消时回补，订单完成时累计销量与评分，
//! 库存或上架状态变化时对外广播。

pub mod api;
pub mod error;
pub mod listener;
pub mod model;
pub mod repository;
pub mod service;
