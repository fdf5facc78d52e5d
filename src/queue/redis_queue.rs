use async_trait::async_trait;
use chrono::Utc;
use redis::{
    AsyncCommands,
    aio::ConnectionManager,
    streams::{StreamRangeReply, StreamReadOptions, StreamReadReply},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use crate::{
    metrics::Metrics,
    models::GroupId,
    queue::{Delivery, DlqMessage, MessageQueue, QueueError, QueueMessage},
};

/// Redis-streams backend: one stream `queue:<tenant>` per tenant, a single
/// consumer group shared by all workers, and a sibling `dlq:<tenant>` stream.
#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
    group_name: String,
    consumer_name: String,
    metrics: Metrics,
    shutdown: CancellationToken,
    groups_created: Arc<Mutex<HashSet<GroupId>>>,
}

fn stream_key(tenant: GroupId) -> String {
    format!("queue:{tenant}")
}

fn dlq_key(tenant: GroupId) -> String {
    format!("dlq:{tenant}")
}

impl RedisQueue {
    pub async fn connect(
        url: &str,
        group_name: String,
        consumer_name: String,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        Ok(Self {
            conn,
            group_name,
            consumer_name,
            metrics,
            shutdown,
            groups_created: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Create-if-absent; a BUSYGROUP reply means another worker won the race
    /// and is swallowed.
    async fn ensure_group(&self, tenant: GroupId) -> Result<(), QueueError> {
        if self.groups_created.lock().unwrap().contains(&tenant) {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(stream_key(tenant), &self.group_name, "$")
            .await;

        match created {
            Ok(()) => {}
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }

        self.groups_created.lock().unwrap().insert(tenant);
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RedisQueue {
    async fn enqueue(&self, msg: &QueueMessage) -> Result<String, QueueError> {
        self.ensure_group(msg.tenant_id).await?;

        let payload = serde_json::to_string(msg)?;
        let mut conn = self.conn.clone();
        let entry_id: String = conn
            .xadd(
                stream_key(msg.tenant_id),
                "*",
                &[("data", payload.as_str())],
            )
            .await?;

        self.metrics.inc_enqueued();
        trace!(
            message_id = msg.id.to_string(),
            tenant_id = msg.tenant_id.to_string(),
            entry_id,
            "enqueued message"
        );

        Ok(entry_id)
    }

    async fn enqueue_after(&self, msg: QueueMessage, delay: Duration) -> Result<(), QueueError> {
        // the timer task is bounded by pool shutdown; on cancellation the
        // entry stays unacknowledged nowhere (it was acked) and the message
        // row keeps its failed status for a later reprocess
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {
                    trace!(message_id = msg.id.to_string(), "dropping scheduled retry on shutdown");
                }
                _ = tokio::time::sleep(delay) => {
                    if let Err(e) = queue.enqueue(&msg).await {
                        error!(message_id = msg.id.to_string(), "failed to re-enqueue message: {e}");
                    }
                }
            }
        });

        Ok(())
    }

    async fn read(
        &self,
        tenants: &[GroupId],
        block: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        if tenants.is_empty() {
            tokio::time::sleep(block).await;
            return Ok(None);
        }

        for &tenant in tenants {
            self.ensure_group(tenant).await?;
        }

        let keys: Vec<String> = tenants.iter().map(|&t| stream_key(t)).collect();
        let ids: Vec<&str> = tenants.iter().map(|_| ">").collect();
        let options = StreamReadOptions::default()
            .group(&self.group_name, &self.consumer_name)
            .count(1)
            .block(block.as_millis() as usize);

        let mut conn = self.conn.clone();
        let reply: StreamReadReply = conn.xread_options(&keys, &ids, &options).await?;

        for stream in reply.keys {
            let tenant = stream
                .key
                .strip_prefix("queue:")
                .and_then(|raw| raw.parse().ok());
            if let Some(entry) = stream.ids.into_iter().next() {
                let payload: String = entry.get("data").unwrap_or_default();
                return Ok(Some(Delivery {
                    tenant,
                    entry_id: entry.id,
                    payload,
                }));
            }
        }

        Ok(None)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let tenant = delivery
            .tenant
            .ok_or(QueueError::Protocol("delivery without tenant stream"))?;

        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(
                stream_key(tenant),
                &self.group_name,
                &[delivery.entry_id.as_str()],
            )
            .await?;

        Ok(())
    }

    async fn dead_letter(
        &self,
        msg: &QueueMessage,
        failure_reason: &str,
        final_error: &str,
    ) -> Result<(), QueueError> {
        let envelope = DlqMessage {
            message: msg.clone(),
            failure_reason: failure_reason.to_string(),
            final_error: final_error.to_string(),
            moved_at: Utc::now(),
            retry_history: vec![final_error.to_string()],
        };
        let payload = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(dlq_key(msg.tenant_id), "*", &[("data", payload.as_str())])
            .await?;

        self.metrics.inc_dead_lettered();

        Ok(())
    }

    async fn reprocess(&self, tenant: GroupId, entry_ids: &[String]) -> Result<usize, QueueError> {
        let key = dlq_key(tenant);
        let mut reprocessed = 0;

        for entry_id in entry_ids {
            let mut conn = self.conn.clone();
            let range: StreamRangeReply = conn.xrange(&key, entry_id, entry_id).await?;
            let Some(entry) = range.ids.into_iter().next() else {
                continue;
            };

            let payload: String = entry.get("data").unwrap_or_default();
            let envelope: DlqMessage = serde_json::from_str(&payload)?;

            let mut msg = envelope.message;
            msg.retry_count = 0;

            if let Err(e) = self.enqueue(&msg).await {
                error!(entry_id, "aborting dead-letter reprocess: {e}");
                return Ok(reprocessed);
            }

            let _: i64 = conn.xdel(&key, &[entry_id.as_str()]).await?;
            reprocessed += 1;
        }

        Ok(reprocessed)
    }
}
