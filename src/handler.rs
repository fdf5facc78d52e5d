use async_trait::async_trait;
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    mime,
    models::{
        DeliveryLogRepository, DeliveryStatus, Message, MessageId, MessageRepository,
        MessageStatus, NewDeliveryLog,
    },
    providers::OutboundEmail,
    queue::QueueMessage,
    resolver::{ProviderResolver, ResolveError},
    store::{MessageStore, StoreError},
};

/// Delays between attempts to fetch a body from the message store.
const BODY_FETCH_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(100),
    Duration::from_millis(500),
    Duration::from_secs(2),
];

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Repository(#[from] crate::models::Error),
    #[error("message body unavailable: {0}")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Provider(#[from] crate::providers::ProviderError),
}

/// Seam between the worker pool and the delivery logic.
#[async_trait]
pub trait HandleDelivery: Send + Sync {
    async fn handle(&self, queued: &QueueMessage) -> Result<(), HandlerError>;
}

/// Takes one queue entry through load → parse → resolve → send, recording the
/// outcome on the message row and in the delivery log. Errors bubble up to
/// the worker pool, which owns retry and dead-letter policy.
pub struct DeliveryHandler {
    messages: MessageRepository,
    delivery_logs: DeliveryLogRepository,
    store: Arc<dyn MessageStore>,
    resolver: Arc<ProviderResolver>,
}

impl DeliveryHandler {
    pub fn new(
        pool: sqlx::PgPool,
        store: Arc<dyn MessageStore>,
        resolver: Arc<ProviderResolver>,
    ) -> Self {
        Self {
            messages: MessageRepository::new(pool.clone()),
            delivery_logs: DeliveryLogRepository::new(pool),
            store,
            resolver,
        }
    }

    async fn fetch_body(&self, id: MessageId) -> Result<Vec<u8>, StoreError> {
        let mut last_error = None;
        for (attempt, delay) in BODY_FETCH_SCHEDULE.iter().enumerate() {
            match self.store.get(id).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    debug!(
                        message_id = id.to_string(),
                        attempt = attempt + 1,
                        "body fetch failed: {e}"
                    );
                    last_error = Some(e);
                }
            }
            if attempt + 1 < BODY_FETCH_SCHEDULE.len() {
                tokio::time::sleep(*delay).await;
            }
        }

        Err(last_error.unwrap_or(StoreError::NotFound))
    }

    async fn record_attempt(
        &self,
        queued: &QueueMessage,
        provider: &str,
        provider_message_id: Option<String>,
        status: DeliveryStatus,
        duration_ms: i64,
        last_error: Option<String>,
    ) {
        let log = NewDeliveryLog {
            message_id: queued.id,
            attempt_number: queued.retry_count as i32 + 1,
            provider: provider.to_string(),
            provider_message_id,
            status,
            duration_ms,
            last_error,
        };
        if let Err(e) = self.delivery_logs.append(&log).await {
            warn!(message_id = queued.id.to_string(), "failed to append delivery log: {e}");
        }
    }

    async fn fail(&self, queued: &QueueMessage, status: MessageStatus, provider: &str, error: &str) {
        if let Err(e) = self.messages.set_status(queued.id, status).await {
            warn!(message_id = queued.id.to_string(), "failed to update message status: {e}");
        }
        self.record_attempt(queued, provider, None, DeliveryStatus::Failed, 0, Some(error.into()))
            .await;
    }

    fn assemble_email(&self, queued: &QueueMessage, stored: &Message, raw: Vec<u8>) -> OutboundEmail {
        let mut email = OutboundEmail {
            id: queued.id,
            tenant_id: stored.group_id,
            from: stored.sender.clone(),
            to: stored.recipients.clone(),
            subject: stored.subject.clone().unwrap_or_default(),
            headers: stored
                .headers
                .as_object()
                .cloned()
                .unwrap_or_default(),
            ..Default::default()
        };

        match mime::parse(&raw) {
            Ok(parsed) => {
                // the parsed subject wins over whatever the ingress stored
                if let Some(subject) = parsed.subject {
                    email.subject = subject;
                }
                for (name, value) in parsed.headers {
                    email.headers.insert(name, value);
                }
                email.text_body = parsed.text_body;
                email.html_body = parsed.html_body;
                email.attachments = parsed.attachments;
            }
            Err(e) => {
                warn!(
                    message_id = queued.id.to_string(),
                    "failed to parse message body, sending as plain text: {e}"
                );
                email.text_body = Some(String::from_utf8_lossy(&raw).into_owned());
            }
        }

        email.raw_body = raw;
        email
    }
}

#[async_trait]
impl HandleDelivery for DeliveryHandler {
    #[tracing::instrument(
        skip(self, queued),
        fields(
            message_id = queued.id.to_string(),
            tenant_id = queued.tenant_id.to_string(),
            attempt = queued.retry_count + 1,
        ))]
    async fn handle(&self, queued: &QueueMessage) -> Result<(), HandlerError> {
        self.messages
            .set_status(queued.id, MessageStatus::Processing)
            .await?;
        if queued.retry_count > 0 {
            self.messages
                .set_retry_count(queued.id, queued.retry_count as i32)
                .await?;
        }

        let stored = match self.messages.find_by_id(queued.id).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                // an orphan reference; acknowledge and move on
                info!("queue entry references a missing message, dropping");
                return Ok(());
            }
            Err(e) => {
                self.fail(queued, MessageStatus::Failed, "none", &e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        let raw = if let Some(inline) = queued.inline_body() {
            inline
        } else if let Some(inline) = stored.body.clone() {
            inline
        } else if stored.storage_ref.is_some() {
            match self.fetch_body(queued.id).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    self.fail(queued, MessageStatus::StorageError, "none", &e.to_string())
                        .await;
                    return Err(e.into());
                }
            }
        } else {
            self.fail(
                queued,
                MessageStatus::StorageError,
                "none",
                "message row has neither body nor storage ref",
            )
            .await;
            return Err(StoreError::NotFound.into());
        };

        let email = self.assemble_email(queued, &stored, raw);

        let provider = match self.resolver.resolve(queued.account_id).await {
            Ok(provider) => provider,
            Err(e) => {
                self.fail(queued, MessageStatus::Failed, "none", &e.to_string())
                    .await;
                return Err(e.into());
            }
        };

        let started = std::time::Instant::now();
        let outcome = provider.send(&email).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match outcome {
            Ok(result) => {
                self.messages
                    .set_status(queued.id, MessageStatus::Delivered)
                    .await?;
                self.record_attempt(
                    queued,
                    provider.name(),
                    result.provider_message_id,
                    DeliveryStatus::Delivered,
                    duration_ms,
                    None,
                )
                .await;
                info!(provider = provider.name(), duration_ms, "message delivered");
                Ok(())
            }
            Err(e) => {
                self.messages
                    .set_status(queued.id, MessageStatus::Failed)
                    .await?;
                self.record_attempt(
                    queued,
                    provider.name(),
                    None,
                    DeliveryStatus::Failed,
                    duration_ms,
                    Some(e.to_string()),
                )
                .await;
                warn!(
                    provider = provider.name(),
                    permanent = e.is_permanent(),
                    "delivery failed: {e}"
                );
                Err(e.into())
            }
        }
    }
}
