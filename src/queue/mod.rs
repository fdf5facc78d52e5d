use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{AccountId, GroupId, MessageId};

mod redis_queue;
mod sqs;

pub use redis_queue::RedisQueue;
pub use sqs::SqsQueue;

pub const DEFAULT_MAX_RETRIES: u32 = 5;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("sqs error: {0}")]
    Sqs(String),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Protocol(&'static str),
}

/// Wire envelope of a queued delivery. New producers emit the ID-only form;
/// the legacy inline form (sender, recipients and body carried in the entry
/// itself) is still accepted on the consuming side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: MessageId,
    pub account_id: AccountId,
    pub tenant_id: GroupId,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

impl QueueMessage {
    pub fn id_only(id: MessageId, account_id: AccountId, tenant_id: GroupId) -> Self {
        Self {
            id,
            account_id,
            tenant_id,
            retry_count: 0,
            created_at: Utc::now(),
            sender: None,
            recipients: Vec::new(),
            body: None,
        }
    }

    pub fn has_inline_body(&self) -> bool {
        self.body.is_some()
    }

    pub fn inline_body(&self) -> Option<Vec<u8>> {
        self.body
            .as_ref()
            .and_then(|b| Base64::decode_vec(b).ok())
    }

    pub fn set_inline_body(&mut self, bytes: &[u8]) {
        self.body = Some(Base64::encode_string(bytes));
    }
}

/// Envelope written to the dead-letter stream once the retry budget is
/// exhausted. Immutable once written; a reprocess re-enqueues the wrapped
/// message with its retry count reset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqMessage {
    pub message: QueueMessage,
    pub failure_reason: String,
    pub final_error: String,
    pub moved_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_history: Vec<String>,
}

/// One entry handed to a worker. `entry_id` is the backend token used to
/// acknowledge it (stream entry id for redis, receipt handle for SQS).
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tenant: Option<GroupId>,
    pub entry_id: String,
    pub payload: String,
}

/// At-least-once tenant-partitioned message queue with one consumer group
/// and a sibling dead-letter queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Append to the tenant's stream. Increments `messages_enqueued_total`.
    async fn enqueue(&self, msg: &QueueMessage) -> Result<String, QueueError>;

    /// Re-enqueue after a delay. The delay must not outlive the owning
    /// worker pool's shutdown.
    async fn enqueue_after(&self, msg: QueueMessage, delay: Duration) -> Result<(), QueueError>;

    /// Block up to `block` for one new entry on any of the given tenants.
    async fn read(
        &self,
        tenants: &[GroupId],
        block: Duration,
    ) -> Result<Option<Delivery>, QueueError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    async fn dead_letter(
        &self,
        msg: &QueueMessage,
        failure_reason: &str,
        final_error: &str,
    ) -> Result<(), QueueError>;

    /// Move dead-lettered entries back onto the main queue with
    /// `retry_count` reset. Returns how many were re-enqueued; aborts on the
    /// first re-enqueue failure.
    async fn reprocess(&self, tenant: GroupId, entry_ids: &[String]) -> Result<usize, QueueError>;
}

const RETRY_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
];

fn backoff_base(retry: u32) -> Duration {
    let index = (retry as usize).min(RETRY_SCHEDULE.len() - 1);
    RETRY_SCHEDULE[index]
}

fn apply_jitter(base: Duration, unit: f64) -> Duration {
    // uniform in [base/2, base]
    base.mul_f64(0.5 + unit * 0.5)
}

/// Backoff before redelivery attempt `retry + 1`.
pub fn next_backoff(retry: u32) -> Duration {
    apply_jitter(backoff_base(retry), rand::random::<f64>())
}
