use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{
    models::{AccountId, AccountRepository, ProviderRepository},
    providers::{self, Provider, StdoutProvider},
};

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Repository(#[from] crate::models::Error),
    #[error(transparent)]
    Build(#[from] providers::BuildError),
    #[error("account {0} has no active group")]
    NoActiveGroup(AccountId),
}

struct CachedProvider {
    provider: Arc<dyn Provider>,
    expires_at: Instant,
}

/// Per-account provider selection with a TTL cache. A tenant without an
/// enabled provider resolves to the shared stdout sink; that is not an error.
pub struct ProviderResolver {
    accounts: AccountRepository,
    providers: ProviderRepository,
    cache: RwLock<HashMap<AccountId, CachedProvider>>,
    ttl: Duration,
    stdout: Arc<dyn Provider>,
}

impl ProviderResolver {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self::with_ttl(pool, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(pool: sqlx::PgPool, ttl: Duration) -> Self {
        Self {
            accounts: AccountRepository::new(pool.clone()),
            providers: ProviderRepository::new(pool),
            cache: RwLock::new(HashMap::new()),
            ttl,
            stdout: Arc::new(StdoutProvider),
        }
    }

    pub async fn resolve(&self, account_id: AccountId) -> Result<Arc<dyn Provider>, ResolveError> {
        {
            let cache = self.cache.read().await;
            if let Some(hit) = cache.get(&account_id)
                && hit.expires_at > Instant::now()
            {
                return Ok(hit.provider.clone());
            }
        }

        let group_id = self
            .accounts
            .primary_group(account_id)
            .await?
            .ok_or(ResolveError::NoActiveGroup(account_id))?;

        let provider = match self.providers.enabled_for_group(group_id).await? {
            Some(record) => {
                debug!(
                    account_id = account_id.to_string(),
                    provider = record.name,
                    kind = record.kind.to_string(),
                    "resolved provider"
                );
                providers::build(&record).await?
            }
            None => {
                debug!(
                    account_id = account_id.to_string(),
                    "no enabled provider, using stdout sink"
                );
                self.stdout.clone()
            }
        };

        self.cache.write().await.insert(
            account_id,
            CachedProvider {
                provider: provider.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        Ok(provider)
    }

    /// Drop every cached entry; selection falls back to the database on the
    /// next resolve.
    pub async fn clear_cache(&self) {
        self.cache.write().await.clear();
    }
}
