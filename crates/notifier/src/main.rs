use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::redis_pool::create_redis_pool;
use herald_engine::queue_redis::RedisDispatchQueue;
use herald_engine::store_postgres::PgTaskStore;
use herald_engine::sweeper::{RecoverySweeper, SweepSettings};
use herald_engine::{DispatchQueue, RetryPolicy, TaskStore};
use herald_notifier::{DeliveryWorker, MessageSender, TelegramSender, WorkerSettings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_notifier=info,herald_engine=info".into()),
        )
        .json()
        .init();

    tracing::info!("Herald notifier starting...");

    let config = AppConfig::from_env()?;
    let bot_token = config
        .telegram_bot_token
        .clone()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_BOT_TOKEN environment variable is required"))?;

    let pool = db::create_pool(&config.database_url, config.db_max_connections).await?;
    db::run_migrations(&pool).await?;
    let redis = create_redis_pool(&config.redis_url).await?;

    let store: Arc<dyn TaskStore> = Arc::new(PgTaskStore::new(pool));
    let queue: Arc<dyn DispatchQueue> = Arc::new(RedisDispatchQueue::new(
        redis,
        &config.queue_key_prefix,
        Duration::from_secs(config.queue_visibility_timeout_secs),
    ));
    let sender: Arc<dyn MessageSender> = Arc::new(TelegramSender::new(
        &config.telegram_api_url,
        &bot_token,
        Duration::from_millis(config.send_timeout_ms),
    )?);

    let policy = RetryPolicy::from_config(&config);
    let settings = WorkerSettings::from_config(&config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::with_capacity(config.worker_concurrency + 1);
    for id in 0..config.worker_concurrency {
        let worker = DeliveryWorker::new(
            id,
            store.clone(),
            queue.clone(),
            sender.clone(),
            policy,
            settings,
        );
        let rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(rx).await }));
    }

    let sweeper = RecoverySweeper::new(store, queue, SweepSettings::from_config(&config));
    handles.push(tokio::spawn(async move { sweeper.run(shutdown_rx).await }));

    tracing::info!(
        workers = config.worker_concurrency,
        max_attempts = policy.max_attempts,
        "Delivery workers running"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping gracefully...");
    shutdown_tx.send(true)?;

    // Workers finish the entry they hold before observing the signal.
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    tracing::info!("Herald notifier stopped.");
    Ok(())
}
