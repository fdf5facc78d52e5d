use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::providers::Provider;

/// Consecutive failed checks before a provider is taken out of rotation. A
/// single successful check brings it back.
const UNHEALTHY_THRESHOLD: u32 = 3;

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        // a freshly registered provider is assumed usable until checks say
        // otherwise
        Self {
            healthy: true,
            consecutive_failures: 0,
            last_check: None,
            last_error: None,
        }
    }
}

pub struct HealthChecker {
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    statuses: RwLock<HashMap<String, HealthStatus>>,
    check_interval: Duration,
    check_timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_CHECK_INTERVAL, DEFAULT_CHECK_TIMEOUT)
    }
}

impl HealthChecker {
    pub fn new(check_interval: Duration, check_timeout: Duration) -> Self {
        Self {
            providers: RwLock::new(HashMap::new()),
            statuses: RwLock::new(HashMap::new()),
            check_interval,
            check_timeout,
        }
    }

    pub async fn register(&self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        self.providers.write().await.insert(name.clone(), provider);
        self.statuses
            .write()
            .await
            .entry(name)
            .or_default();
    }

    /// Unknown providers are reported unhealthy.
    pub async fn is_healthy(&self, name: &str) -> bool {
        self.statuses
            .read()
            .await
            .get(name)
            .is_some_and(|status| status.healthy)
    }

    /// An isolated snapshot; mutating the returned map does not affect the
    /// checker.
    pub async fn get_all_statuses(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn check_all(&self) {
        let providers: Vec<(String, Arc<dyn Provider>)> = self
            .providers
            .read()
            .await
            .iter()
            .map(|(name, provider)| (name.clone(), provider.clone()))
            .collect();

        for (name, provider) in providers {
            let result = match tokio::time::timeout(self.check_timeout, provider.health_check())
                .await
            {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(_) => Err(format!(
                    "health check timed out after {:?}",
                    self.check_timeout
                )),
            };

            let mut statuses = self.statuses.write().await;
            let status = statuses.entry(name.clone()).or_default();
            status.last_check = Some(Utc::now());

            match result {
                Ok(()) => {
                    if !status.healthy {
                        info!(provider = name, "provider recovered");
                    }
                    status.healthy = true;
                    status.consecutive_failures = 0;
                    status.last_error = None;
                }
                Err(error) => {
                    status.consecutive_failures += 1;
                    status.last_error = Some(error.clone());
                    if status.consecutive_failures >= UNHEALTHY_THRESHOLD && status.healthy {
                        warn!(
                            provider = name,
                            failures = status.consecutive_failures,
                            "provider marked unhealthy: {error}"
                        );
                    }
                    if status.consecutive_failures >= UNHEALTHY_THRESHOLD {
                        status.healthy = false;
                    }
                    debug!(provider = name, "health check failed: {error}");
                }
            }
        }
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.check_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("shutting down health checker");
                        return;
                    }
                    _ = interval.tick() => {
                        self.check_all().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::providers::{OutboundEmail, ProviderError, SendOutcome};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Provider whose health flips with a switch.
    pub(crate) struct SwitchableProvider {
        name: String,
        pub healthy: Arc<AtomicBool>,
    }

    impl SwitchableProvider {
        pub(crate) fn new(name: &str, healthy: bool) -> Self {
            Self {
                name: name.to_string(),
                healthy: Arc::new(AtomicBool::new(healthy)),
            }
        }
    }

    #[async_trait]
    impl crate::providers::Provider for SwitchableProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
            Ok(SendOutcome::default())
        }

        async fn health_check(&self) -> Result<(), ProviderError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ProviderError::transport(&self.name, "unreachable"))
            }
        }
    }

    fn checker() -> HealthChecker {
        HealthChecker::new(Duration::from_millis(10), Duration::from_millis(100))
    }

    #[tokio::test]
    async fn unknown_provider_is_unhealthy() {
        assert!(!checker().is_healthy("nope").await);
    }

    #[tokio::test]
    async fn three_strikes_then_recovery() {
        let checker = checker();
        let provider = Arc::new(SwitchableProvider::new("sendgrid", false));
        let switch = provider.healthy.clone();
        checker.register(provider).await;

        // registered providers start out healthy
        assert!(checker.is_healthy("sendgrid").await);

        checker.check_all().await;
        checker.check_all().await;
        assert!(checker.is_healthy("sendgrid").await);

        checker.check_all().await;
        assert!(!checker.is_healthy("sendgrid").await);

        let status = &checker.get_all_statuses().await["sendgrid"];
        assert_eq!(status.consecutive_failures, 3);
        assert!(status.last_error.is_some());

        // one success brings it back
        switch.store(true, Ordering::SeqCst);
        checker.check_all().await;

        assert!(checker.is_healthy("sendgrid").await);
        let status = &checker.get_all_statuses().await["sendgrid"];
        assert_eq!(status.consecutive_failures, 0);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn snapshot_is_isolated() {
        let checker = checker();
        checker
            .register(Arc::new(SwitchableProvider::new("ses", true)))
            .await;
        checker.check_all().await;

        let mut snapshot = checker.get_all_statuses().await;
        snapshot.get_mut("ses").unwrap().healthy = false;
        snapshot.clear();

        assert!(checker.is_healthy("ses").await);
    }
}
