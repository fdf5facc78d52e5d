use anyhow::Context;
use mailgate::{
    config::{DeliveryMode, Settings},
    delivery::{AsyncDelivery, DeliveryService, SyncDelivery},
    handler::DeliveryHandler,
    metrics::Metrics,
    resolver::ProviderResolver,
};
use std::{path::PathBuf, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config_path = std::env::var("SMTP_PROXY_CONFIG").ok().map(PathBuf::from);
    let settings =
        Settings::load(config_path.as_deref()).context("failed to load configuration")?;

    mailgate::init_tracing(&settings.logging.level);

    let pool = mailgate::connect_pool(&settings)
        .await
        .context("failed to connect to database")?;

    let metrics = Metrics::default();
    let shutdown = CancellationToken::new();

    let store = mailgate::build_store(&settings)
        .await
        .context("failed to initialize message store")?;
    let queue = mailgate::build_queue(&settings, metrics.clone(), shutdown.clone())
        .await
        .context("failed to connect to queue")?;

    let delivery: Arc<dyn DeliveryService> = match settings.delivery.mode {
        DeliveryMode::Async => Arc::new(AsyncDelivery::new(queue.clone())),
        DeliveryMode::Sync => {
            let resolver = Arc::new(ProviderResolver::new(pool.clone()));
            let handler = DeliveryHandler::new(pool.clone(), store.clone(), resolver);
            Arc::new(SyncDelivery::new(Arc::new(handler)))
        }
    };

    mailgate::run_ingress(
        pool.clone(),
        &settings,
        store.clone(),
        delivery,
        metrics.clone(),
        shutdown.clone(),
    );
    let workers = mailgate::run_workers(
        pool.clone(),
        &settings,
        queue,
        store,
        metrics,
        shutdown.clone(),
    );
    mailgate::run_health_checker(pool, shutdown.clone()).await;

    mailgate::shutdown_signal(shutdown.clone()).await;
    info!("received shutdown signal, stopping services");
    shutdown.cancel();

    workers.stop().await;

    Ok(())
}
