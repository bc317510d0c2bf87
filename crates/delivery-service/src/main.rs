//! 配送服务入口
//!
//! 启动三个部件：订单事件监听、骑手平台 webhook HTTP 端点、
//! DLQ 重投消费。Ctrl-C 触发优雅关闭。

use std::sync::Arc;

use delivery_service::dispatch::StuartDispatch;
use delivery_service::listener::OrderEventListener;
use delivery_service::repository::DeliveryRepository;
use delivery_service::service::DeliveryService;
use delivery_service::webhook::{self, WebhookState};
use flavory_shared::broker::BusProducer;
use flavory_shared::config::AppConfig;
use flavory_shared::database::Database;
use flavory_shared::dlq::{DlqConsumer, DlqProducer};
use flavory_shared::observability;
use flavory_shared::retry::RetryPolicy;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("delivery-service")?;
    observability::init(&config.observability, &config.service_name);

    info!(environment = %config.environment, "delivery-service 启动中");

    let db = Database::connect(&config.database).await?;
    let producer = BusProducer::new(&config.broker)?;

    // 骑手平台凭据只从环境变量注入，生产环境缺失即启动失败
    let courier_client_id = std::env::var("COURIER_CLIENT_ID").unwrap_or_else(|_| {
        if config.is_production() {
            panic!("生产环境必须设置 COURIER_CLIENT_ID");
        }
        warn!("使用开发环境默认骑手平台凭据");
        "dev_client".to_string()
    });
    let courier_client_secret =
        std::env::var("COURIER_CLIENT_SECRET").unwrap_or_else(|_| "dev_secret".to_string());
    let courier_url = std::env::var("COURIER_BASE_URL")
        .unwrap_or_else(|_| "https://api.stuart.com".to_string());
    let webhook_secret = std::env::var("COURIER_WEBHOOK_SECRET").unwrap_or_else(|_| {
        if config.is_production() {
            panic!("生产环境必须设置 COURIER_WEBHOOK_SECRET");
        }
        warn!("使用开发环境默认 webhook 密钥");
        "whsec_dev".to_string()
    });

    let retry_policy = RetryPolicy {
        max_retries: config.broker.max_delivery_attempts,
        ..RetryPolicy::default()
    };

    let dispatch = Arc::new(StuartDispatch::new(
        courier_url,
        courier_client_id,
        courier_client_secret,
    )?);
    let repo = DeliveryRepository::new(db.pool().clone());
    let service = Arc::new(DeliveryService::new(
        db.pool().clone(),
        repo,
        dispatch,
        producer.clone(),
        retry_policy.clone(),
    ));

    let dlq_producer = DlqProducer::new(producer.clone(), "delivery-service", retry_policy);
    let listener = OrderEventListener::new(&config, Arc::clone(&service), dlq_producer)?;
    let dlq_consumer = DlqConsumer::new(&config.broker, producer.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_handle = tokio::spawn(listener.run(shutdown_rx.clone()));
    let dlq_handle = tokio::spawn(dlq_consumer.run(shutdown_rx));

    let webhook_state = Arc::new(WebhookState {
        service: Arc::clone(&service),
        secret: webhook_secret.into_bytes(),
    });
    let app = webhook::router(webhook_state);
    let addr = config.server_addr();
    let http_listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "webhook HTTP 端点已监听");

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

    info!("delivery-service 已退出");
    Ok(())
}
