use sqlx::{PgPool, postgres::PgPoolOptions};
use std::{sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod config;
pub mod delivery;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod mime;
pub mod models;
pub mod providers;
pub mod queue;
pub mod resolver;
pub mod router;
pub mod smtp;
pub mod store;
pub mod worker;

use crate::{
    config::{QueueKind, Settings, StorageKind},
    delivery::DeliveryService,
    handler::DeliveryHandler,
    health::HealthChecker,
    metrics::Metrics,
    models::GroupRepository,
    queue::{MessageQueue, QueueError, RedisQueue, SqsQueue},
    resolver::ProviderResolver,
    smtp::{LoginThrottle, SmtpBackend, SmtpServer},
    store::{LocalStore, MessageStore, S3Store, StoreError},
    worker::{TenantSource, WorkerPool, WorkerPoolHandle},
};

pub fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}={level},info", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

pub async fn connect_pool(settings: &Settings) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .min_connections(settings.database.pool_min)
        .max_connections(settings.database.pool_max)
        .acquire_timeout(Duration::from_secs(settings.database.connect_timeout_secs))
        .connect(&settings.database.url)
        .await
}

pub async fn build_store(settings: &Settings) -> Result<Arc<dyn MessageStore>, StoreError> {
    let store: Arc<dyn MessageStore> = match settings.storage.kind {
        StorageKind::Local => Arc::new(LocalStore::new(settings.storage.path.clone()).await?),
        StorageKind::S3 => Arc::new(
            S3Store::new(
                settings
                    .storage
                    .bucket
                    .clone()
                    .ok_or_else(|| StoreError::Backend("s3 storage requires a bucket".into()))?,
                settings.storage.prefix.clone(),
                settings.storage.region.clone(),
                settings.storage.endpoint.clone(),
            )
            .await,
        ),
    };

    Ok(store)
}

pub async fn build_queue(
    settings: &Settings,
    metrics: Metrics,
    shutdown: CancellationToken,
) -> Result<Arc<dyn MessageQueue>, QueueError> {
    let consumer_name = format!("{}-{}", settings.queue.group_name, uuid::Uuid::new_v4());

    let queue: Arc<dyn MessageQueue> = match settings.queue.kind {
        QueueKind::Redis => Arc::new(
            RedisQueue::connect(
                &settings.queue.url,
                settings.queue.group_name.clone(),
                consumer_name,
                metrics,
                shutdown,
            )
            .await?,
        ),
        QueueKind::Sqs => Arc::new(
            SqsQueue::new(
                settings
                    .queue
                    .queue_url
                    .clone()
                    .ok_or(QueueError::Protocol("sqs queue requires queue_url"))?,
                settings
                    .queue
                    .dlq_url
                    .clone()
                    .ok_or(QueueError::Protocol("sqs queue requires dlq_url"))?,
                settings.queue.region.clone(),
                settings.queue.endpoint.clone(),
                metrics,
            )
            .await,
        ),
    };

    Ok(queue)
}

/// Spawn the SMTP ingress.
pub fn run_ingress(
    pool: PgPool,
    settings: &Settings,
    store: Arc<dyn MessageStore>,
    delivery: Arc<dyn DeliveryService>,
    metrics: Metrics,
    shutdown: CancellationToken,
) {
    let throttle = LoginThrottle::new(
        settings.rate_limit.login_attempts_limit,
        settings.login_lockout(),
    );
    let backend = Arc::new(SmtpBackend::new(
        pool,
        store,
        delivery,
        throttle,
        metrics,
        settings.smtp.max_connections,
    ));

    SmtpServer::new(backend, Arc::new(settings.smtp_config()), shutdown).spawn();
}

/// Spawn the queue consumers and, once per process, the provider health
/// checker feeding them.
pub fn run_workers(
    pool: PgPool,
    settings: &Settings,
    queue: Arc<dyn MessageQueue>,
    store: Arc<dyn MessageStore>,
    metrics: Metrics,
    shutdown: CancellationToken,
) -> WorkerPoolHandle {
    let resolver = Arc::new(ProviderResolver::new(pool.clone()));
    let handler = Arc::new(DeliveryHandler::new(pool.clone(), store, resolver));

    let tenant_source = match settings.queue.kind {
        QueueKind::Redis => TenantSource::Repository(GroupRepository::new(pool)),
        QueueKind::Sqs => TenantSource::Static(Vec::new()),
    };

    WorkerPool::new(
        queue,
        handler,
        tenant_source,
        metrics,
        settings.worker_pool_config(),
        shutdown,
    )
    .spawn()
}

/// Register every enabled provider, plus the dev sink, and start polling.
pub async fn run_health_checker(
    pool: PgPool,
    shutdown: CancellationToken,
) -> Arc<HealthChecker> {
    let checker = Arc::new(HealthChecker::default());

    checker
        .register(Arc::new(providers::StdoutProvider))
        .await;

    match models::ProviderRepository::new(pool).list_enabled().await {
        Ok(records) => {
            for record in records {
                match providers::build(&record).await {
                    Ok(provider) => checker.register(provider).await,
                    Err(e) => {
                        tracing::warn!(provider = record.name, "skipping unbuildable provider: {e}")
                    }
                }
            }
        }
        Err(e) => tracing::error!("failed to list providers for health checking: {e}"),
    }

    checker.clone().spawn(shutdown);

    checker
}

pub async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = token.cancelled() => {},
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
