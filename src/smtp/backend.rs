use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};

use crate::{
    delivery::DeliveryService,
    metrics::Metrics,
    models::{AccountRepository, AuditLogRepository, MessageRepository},
    smtp::LoginThrottle,
    store::MessageStore,
};

/// State shared by every SMTP session: repositories, the body store, the
/// wired delivery service and the active-connection counter.
pub struct SmtpBackend {
    pub(crate) accounts: AccountRepository,
    pub(crate) messages: MessageRepository,
    pub(crate) audit: AuditLogRepository,
    pub(crate) store: Arc<dyn MessageStore>,
    pub(crate) delivery: Arc<dyn DeliveryService>,
    pub(crate) throttle: LoginThrottle,
    pub(crate) metrics: Metrics,
    active: AtomicU32,
    max_connections: u32,
}

impl SmtpBackend {
    pub fn new(
        pool: sqlx::PgPool,
        store: Arc<dyn MessageStore>,
        delivery: Arc<dyn DeliveryService>,
        throttle: LoginThrottle,
        metrics: Metrics,
        max_connections: u32,
    ) -> Self {
        Self {
            accounts: AccountRepository::new(pool.clone()),
            messages: MessageRepository::new(pool.clone()),
            audit: AuditLogRepository::new(pool),
            store,
            delivery,
            throttle,
            metrics,
            active: AtomicU32::new(0),
            max_connections,
        }
    }

    /// Claim a connection slot. The counter never exceeds `max_connections`;
    /// the slot is released when the returned guard drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max_connections {
                return None;
            }
            match self.active.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(ConnectionGuard {
                        backend: self.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn active_connections(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }
}

pub struct ConnectionGuard {
    backend: Arc<SmtpBackend>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.backend.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{
        delivery::{DeliveryError, DeliveryRequest},
        smtp::LoginThrottle,
        store::LocalStore,
    };
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Delivery service that records requests and fails on demand.
    pub(crate) struct RecordingDelivery {
        pub requests: Mutex<Vec<DeliveryRequest>>,
        pub failures_left: Mutex<u32>,
    }

    impl RecordingDelivery {
        pub(crate) fn new() -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                failures_left: Mutex::new(0),
            }
        }
    }

    #[async_trait]
    impl DeliveryService for RecordingDelivery {
        async fn deliver(&self, request: DeliveryRequest) -> Result<(), DeliveryError> {
            let mut left = self.failures_left.lock().await;
            if *left > 0 {
                *left -= 1;
                return Err(DeliveryError::Queue(crate::queue::QueueError::Protocol(
                    "queue unavailable",
                )));
            }
            self.requests.lock().await.push(request);
            Ok(())
        }
    }

    pub(crate) async fn test_backend(max_connections: u32) -> Arc<SmtpBackend> {
        // connect_lazy never touches the network; sessions that stay off the
        // database can be exercised without one
        let pool = sqlx::PgPool::connect_lazy("postgres://localhost/mailgate-test")
            .expect("lazy pool");
        let base = std::env::temp_dir().join(format!("mailgate-smtp-{}", uuid::Uuid::new_v4()));
        let store = Arc::new(LocalStore::new(base).await.unwrap());

        Arc::new(SmtpBackend::new(
            pool,
            store,
            Arc::new(RecordingDelivery::new()),
            LoginThrottle::new(5, Duration::from_secs(60)),
            Metrics::default(),
            max_connections,
        ))
    }

    #[tokio::test]
    async fn connection_counter_never_exceeds_max() {
        let backend = test_backend(2).await;

        let first = backend.try_acquire().unwrap();
        let _second = backend.try_acquire().unwrap();
        assert!(backend.try_acquire().is_none());
        assert_eq!(backend.active_connections(), 2);

        drop(first);
        assert_eq!(backend.active_connections(), 1);
        assert!(backend.try_acquire().is_some());
    }
}
