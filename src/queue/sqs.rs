use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;
use chrono::Utc;
use std::time::Duration;
use tracing::error;

use crate::{
    metrics::Metrics,
    models::GroupId,
    queue::{Delivery, DlqMessage, MessageQueue, QueueError, QueueMessage},
};

/// SQS delays are capped by the service.
const MAX_DELAY: Duration = Duration::from_secs(900);

/// SQS backend: one queue carrying the JSON envelope as the message body,
/// with a sibling dead-letter queue URL. Tenant partitioning collapses to a
/// single queue here; the envelope still carries the tenant.
pub struct SqsQueue {
    client: Client,
    queue_url: String,
    dlq_url: String,
    metrics: Metrics,
}

impl SqsQueue {
    pub async fn new(
        queue_url: String,
        dlq_url: String,
        region: Option<String>,
        endpoint: Option<String>,
        metrics: Metrics,
    ) -> Self {
        let region = Region::new(region.unwrap_or_else(|| "us-east-1".to_string()));
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Self {
            client: Client::new(&config),
            queue_url,
            dlq_url,
            metrics,
        }
    }

    fn sqs_err(err: impl std::fmt::Display) -> QueueError {
        QueueError::Sqs(err.to_string())
    }

    async fn send_to(&self, url: &str, body: String, delay: Option<Duration>) -> Result<String, QueueError> {
        let mut request = self.client.send_message().queue_url(url).message_body(body);
        if let Some(delay) = delay {
            request = request.delay_seconds(delay.min(MAX_DELAY).as_secs() as i32);
        }

        let output = request.send().await.map_err(Self::sqs_err)?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }
}

#[async_trait]
impl MessageQueue for SqsQueue {
    async fn enqueue(&self, msg: &QueueMessage) -> Result<String, QueueError> {
        let payload = serde_json::to_string(msg)?;
        let id = self.send_to(&self.queue_url, payload, None).await?;

        self.metrics.inc_enqueued();

        Ok(id)
    }

    async fn enqueue_after(&self, msg: QueueMessage, delay: Duration) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&msg)?;
        self.send_to(&self.queue_url, payload, Some(delay)).await?;

        self.metrics.inc_enqueued();

        Ok(())
    }

    async fn read(
        &self,
        _tenants: &[GroupId],
        block: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(block.as_secs().min(20) as i32)
            .send()
            .await
            .map_err(Self::sqs_err)?;

        let Some(message) = output.messages().first() else {
            return Ok(None);
        };

        let Some(receipt) = message.receipt_handle() else {
            return Ok(None);
        };

        Ok(Some(Delivery {
            tenant: None,
            entry_id: receipt.to_string(),
            payload: message.body().unwrap_or_default().to_string(),
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(&delivery.entry_id)
            .send()
            .await
            .map_err(Self::sqs_err)?;

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

        self.send_to(&self.dlq_url, serde_json::to_string(&envelope)?, None)
            .await?;
        self.metrics.inc_dead_lettered();

        Ok(())
    }

    /// Best effort: SQS cannot address entries by id, so poll up to
    /// `min(len, 10)` messages off the dead-letter queue and re-enqueue them.
    async fn reprocess(&self, _tenant: GroupId, entry_ids: &[String]) -> Result<usize, QueueError> {
        let batch = entry_ids.len().min(10);
        if batch == 0 {
            return Ok(0);
        }

        let output = self
            .client
            .receive_message()
            .queue_url(&self.dlq_url)
            .max_number_of_messages(batch as i32)
            .send()
            .await
            .map_err(Self::sqs_err)?;

        let mut reprocessed = 0;
        for message in output.messages() {
            let Some(body) = message.body() else {
                continue;
            };
            let envelope: DlqMessage = serde_json::from_str(body)?;

            let mut msg = envelope.message;
            msg.retry_count = 0;

            if let Err(e) = self.enqueue(&msg).await {
                error!("aborting dead-letter reprocess: {e}");
                return Ok(reprocessed);
            }

            if let Some(receipt) = message.receipt_handle() {
                self.client
                    .delete_message()
                    .queue_url(&self.dlq_url)
                    .receipt_handle(receipt)
                    .send()
                    .await
                    .map_err(Self::sqs_err)?;
            }
            reprocessed += 1;
        }

        Ok(reprocessed)
    }
}
