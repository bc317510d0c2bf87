//! 日志初始化
//!
//! 统一各服务的 tracing 订阅器配置：开发环境输出 pretty 格式便于阅读，
//! 生产环境输出 JSON 供日志采集系统解析。
//! 过滤规则优先读取 RUST_LOG，未设置时落回配置文件中的 log_level。

use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

/// 初始化全局日志订阅器
///
/// 进程生命周期内只能调用一次，重复调用会 panic（tracing 的全局订阅器限制）。
pub fn init(config: &ObservabilityConfig, service_name: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .json()
                .with_current_span(true)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .pretty()
                .init();
        }
    }

    tracing::info!(service = service_name, format = %config.log_format, "日志系统已初始化");
}
