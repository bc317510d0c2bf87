//! 支付服务入口
//!
//! 启动四个部件：订单事件监听、网关 webhook HTTP 端点、
//! 定时清理/对账任务、DLQ 重投消费。Ctrl-C 触发优雅关闭。

use std::sync::Arc;

use flavory_shared::broker::BusProducer;
use flavory_shared::config::AppConfig;
use flavory_shared::database::Database;
use flavory_shared::dlq::{DlqConsumer, DlqProducer};
use flavory_shared::observability;
use flavory_shared::retry::RetryPolicy;
use payment_service::gateway::StripeGateway;
use payment_service::listener::OrderEventListener;
use payment_service::model::FeeConfig;
use payment_service::repository::PaymentRepository;
use payment_service::scheduler;
use payment_service::service::PaymentService;
use payment_service::webhook::{self, WebhookState};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("payment-service")?;
    observability::init(&config.observability, &config.service_name);

    info!(environment = %config.environment, "payment-service 启动中");

    let db = Database::connect(&config.database).await?;
    let producer = BusProducer::new(&config.broker)?;

    // 网关凭据只从环境变量注入，生产环境缺失即启动失败
    let gateway_key = std::env::var("PAYMENT_GATEWAY_SECRET_KEY").unwrap_or_else(|_| {
        if config.is_production() {
            panic!("生产环境必须设置 PAYMENT_GATEWAY_SECRET_KEY");
        }
        warn!("使用开发环境默认网关密钥");
        "sk_test_dev".to_string()
    });
    let gateway_url = std::env::var("PAYMENT_GATEWAY_BASE_URL")
        .unwrap_or_else(|_| "https://api.stripe.com".to_string());
    let webhook_secret = std::env::var("PAYMENT_WEBHOOK_SECRET").unwrap_or_else(|_| {
        if config.is_production() {
            panic!("生产环境必须设置 PAYMENT_WEBHOOK_SECRET");
        }
        warn!("使用开发环境默认 webhook 密钥");
        "whsec_dev".to_string()
    });

    let retry_policy = RetryPolicy {
        max_retries: config.broker.max_delivery_attempts,
        ..RetryPolicy::default()
    };

    let gateway = Arc::new(StripeGateway::new(gateway_url, gateway_key)?);
    let repo = PaymentRepository::new(db.pool().clone());
    let service = Arc::new(PaymentService::new(
        db.pool().clone(),
        repo,
        gateway,
        producer.clone(),
        retry_policy.clone(),
        FeeConfig::default(),
    ));

    let dlq_producer = DlqProducer::new(producer.clone(), "payment-service", retry_policy);
    let listener = OrderEventListener::new(&config, Arc::clone(&service), dlq_producer)?;
    let dlq_consumer = DlqConsumer::new(&config.broker, producer.clone())?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_handle = tokio::spawn(listener.run(shutdown_rx.clone()));
    let dlq_handle = tokio::spawn(dlq_consumer.run(shutdown_rx.clone()));
    let sweep_handle = tokio::spawn(scheduler::run_expiry_sweep(
        Arc::clone(&service),
        shutdown_rx.clone(),
    ));
    let reconcile_handle = tokio::spawn(scheduler::run_nightly_reconciliation(
        Arc::clone(&service),
        shutdown_rx,
    ));

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
    let _ = sweep_handle.await;
    let _ = reconcile_handle.await;
    db.close().await;

    info!("payment-service 已退出");
    Ok(())
}
