//! 菜品服务入口
//!
//! 启动三个部件：订单事件监听、菜品 HTTP 接口、DLQ 重投消费。
//! Ctrl-C 触发优雅关闭。

use std::sync::Arc;

use dish_service::api;
use dish_service::listener::DishEventListener;
use dish_service::repository::DishRepository;
use dish_service::service::DishService;
use flavory_shared::broker::BusProducer;
use flavory_shared::config::AppConfig;
use flavory_shared::database::Database;
use flavory_shared::dlq::{DlqConsumer, DlqProducer};
use flavory_shared::observability;
use flavory_shared::retry::RetryPolicy;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("dish-service")?;
    observability::init(&config.observability, &config.service_name);

    info!(environment = %config.environment, "dish-service 启动中");

    let db = Database::connect(&config.database).await?;
    let producer = BusProducer::new(&config.broker)?;

    let retry_policy = RetryPolicy {
        max_retries: config.broker.max_delivery_attempts,
        ..RetryPolicy::default()
    };

    let repo = DishRepository::new(db.pool().clone());
    let service = Arc::new(DishService::new(db.pool().clone(), repo, producer.clone()));
    let dlq_producer = DlqProducer::new(producer.clone(), "dish-service", retry_policy);

    let listener = DishEventListener::new(&config, Arc::clone(&service), dlq_producer)?;
    let dlq_consumer = DlqConsumer::new(&config.broker, producer.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_handle = tokio::spawn(listener.run(shutdown_rx.clone()));
    let dlq_handle = tokio::spawn(dlq_consumer.run(shutdown_rx));

    let app = api::router(Arc::clone(&service));
    let addr = config.server_addr();
    let http_listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "菜品 HTTP 接口已监听");

    let server = axum::serve(http_listener, app);

    tokio::select! {
        result = server => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到退出信号，开始优雅关闭");
        }
    }

    shutdown_tx.send(true)?;
    let _ = listener_handle.await;
    let _ = dlq_handle.await;
    db.close().await;

    info!("dish-service 已退出");
    Ok(())
}
