use std::{sync::Arc, time::Duration};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::{
    handler::HandleDelivery,
    metrics::Metrics,
    models::{GroupId, GroupRepository},
    queue::{self, Delivery, MessageQueue, QueueMessage},
};

const TENANT_REFRESH_INTERVAL: Duration = Duration::from_secs(15);
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct WorkerPoolConfig {
    pub workers: usize,
    pub block_timeout: Duration,
    pub process_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub max_retries: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            block_timeout: Duration::from_secs(5),
            process_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_retries: queue::DEFAULT_MAX_RETRIES,
        }
    }
}

/// Where the pool learns which tenant streams to consume.
pub enum TenantSource {
    /// Poll the metadata store for active groups (redis streams deployment).
    Repository(GroupRepository),
    /// A fixed set; the SQS backend reads a single queue and ignores it.
    Static(Vec<GroupId>),
}

pub struct WorkerPool {
    queue: Arc<dyn MessageQueue>,
    handler: Arc<dyn HandleDelivery>,
    tenant_source: TenantSource,
    metrics: Metrics,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
}

pub struct WorkerPoolHandle {
    shutdown: CancellationToken,
    shutdown_timeout: Duration,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Cancel all workers and wait up to the shutdown timeout. A timeout is
    /// reported but the workers are not killed.
    pub async fn stop(self) {
        self.shutdown.cancel();

        let join_all = async {
            for worker in self.workers {
                worker.await.ok();
            }
        };

        if tokio::time::timeout(self.shutdown_timeout, join_all)
            .await
            .is_err()
        {
            warn!("worker pool did not drain within {:?}", self.shutdown_timeout);
        } else {
            info!("worker pool stopped");
        }
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        handler: Arc<dyn HandleDelivery>,
        tenant_source: TenantSource,
        metrics: Metrics,
        config: WorkerPoolConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            handler,
            tenant_source,
            metrics,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> WorkerPoolHandle {
        let initial = match &self.tenant_source {
            TenantSource::Static(tenants) => tenants.clone(),
            TenantSource::Repository(_) => Vec::new(),
        };
        let tenants = Arc::new(RwLock::new(initial));

        let shutdown = self.shutdown.clone();
        let shutdown_timeout = self.config.shutdown_timeout;

        if let TenantSource::Repository(ref groups) = self.tenant_source {
            let groups = groups.clone();
            let tenants = tenants.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(TENANT_REFRESH_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = interval.tick() => {
                            match groups.active_ids().await {
                                Ok(ids) => *tenants.write().await = ids,
                                Err(e) => error!("failed to refresh tenant list: {e}"),
                            }
                        }
                    }
                }
            });
        }

        let shared = Arc::new(self);
        let mut workers = Vec::with_capacity(shared.config.workers);
        for worker_id in 0..shared.config.workers {
            let pool = shared.clone();
            let tenants = tenants.clone();
            workers.push(tokio::spawn(async move {
                pool.worker_loop(worker_id, tenants).await;
            }));
        }

        WorkerPoolHandle {
            shutdown,
            shutdown_timeout,
            workers,
        }
    }

    async fn worker_loop(&self, worker_id: usize, tenants: Arc<RwLock<Vec<GroupId>>>) {
        trace!(worker_id, "worker started");

        loop {
            let current_tenants = tenants.read().await.clone();

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    trace!(worker_id, "worker stopping");
                    return;
                }
                read = self.queue.read(&current_tenants, self.config.block_timeout) => {
                    match read {
                        Ok(Some(delivery)) => self.process(delivery).await,
                        Ok(None) => {}
                        Err(e) => {
                            error!(worker_id, "queue read failed: {e}");
                            tokio::time::sleep(READ_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, delivery: Delivery) {
        let mut msg: QueueMessage = match serde_json::from_str(&delivery.payload) {
            Ok(msg) => msg,
            Err(e) => {
                // nothing can be done with an unreadable entry; drop it
                error!(entry_id = delivery.entry_id, "malformed queue payload, dropping: {e}");
                self.ack(&delivery).await;
                return;
            }
        };

        let handled =
            match tokio::time::timeout(self.config.process_timeout, self.handler.handle(&msg))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "processing timed out after {:?}",
                    self.config.process_timeout
                )),
            };

        match handled {
            Ok(()) => {
                self.metrics.inc_sent();
            }
            Err(error) => {
                msg.retry_count += 1;

                if msg.retry_count < self.config.max_retries {
                    let delay = queue::next_backoff(msg.retry_count - 1);
                    trace!(
                        message_id = msg.id.to_string(),
                        retry_count = msg.retry_count,
                        "scheduling redelivery in {delay:?}"
                    );
                    if let Err(e) = self.queue.enqueue_after(msg, delay).await {
                        error!("failed to schedule redelivery: {e}");
                    }
                    self.metrics.inc_failed();
                } else {
                    warn!(
                        message_id = msg.id.to_string(),
                        retry_count = msg.retry_count,
                        "retry budget exhausted, dead-lettering"
                    );
                    if let Err(e) = self
                        .queue
                        .dead_letter(&msg, "retry budget exhausted", &error)
                        .await
                    {
                        error!("failed to dead-letter message: {e}");
                    }
                }
            }
        }

        // always acknowledge the original entry so it is never redelivered
        self.ack(&delivery).await;
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            error!(entry_id = delivery.entry_id, "failed to acknowledge entry: {e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        handler::HandlerError,
        models::{AccountId, MessageId},
        providers::ProviderError,
        queue::{DlqMessage, QueueError},
    };
    use async_trait::async_trait;
    use chrono::Utc;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicU32, AtomicU64, Ordering},
    };
    use tokio::sync::Mutex;

    struct MockQueue {
        tenant: GroupId,
        entries: Mutex<VecDeque<(String, String)>>,
        acked: Mutex<Vec<String>>,
        dead: Mutex<Vec<DlqMessage>>,
        next_entry: AtomicU64,
        metrics: Metrics,
    }

    impl MockQueue {
        fn new(tenant: GroupId, metrics: Metrics) -> Self {
            Self {
                tenant,
                entries: Mutex::new(VecDeque::new()),
                acked: Mutex::new(Vec::new()),
                dead: Mutex::new(Vec::new()),
                next_entry: AtomicU64::new(0),
                metrics,
            }
        }

        async fn push_raw(&self, payload: String) -> String {
            let entry_id = format!("{}-0", self.next_entry.fetch_add(1, Ordering::SeqCst));
            self.entries
                .lock()
                .await
                .push_back((entry_id.clone(), payload));
            entry_id
        }
    }

    #[async_trait]
    impl MessageQueue for MockQueue {
        async fn enqueue(&self, msg: &QueueMessage) -> Result<String, QueueError> {
            let entry_id = self.push_raw(serde_json::to_string(msg)?).await;
            self.metrics.inc_enqueued();
            Ok(entry_id)
        }

        async fn enqueue_after(
            &self,
            msg: QueueMessage,
            _delay: Duration,
        ) -> Result<(), QueueError> {
            // tests skip the timer
            self.enqueue(&msg).await?;
            Ok(())
        }

        async fn read(
            &self,
            _tenants: &[GroupId],
            block: Duration,
        ) -> Result<Option<Delivery>, QueueError> {
            if let Some((entry_id, payload)) = self.entries.lock().await.pop_front() {
                return Ok(Some(Delivery {
                    tenant: Some(self.tenant),
                    entry_id,
                    payload,
                }));
            }
            tokio::time::sleep(block).await;
            Ok(None)
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
            self.acked.lock().await.push(delivery.entry_id.clone());
            Ok(())
        }

        async fn dead_letter(
            &self,
            msg: &QueueMessage,
            failure_reason: &str,
            final_error: &str,
        ) -> Result<(), QueueError> {
            self.dead.lock().await.push(DlqMessage {
                message: msg.clone(),
                failure_reason: failure_reason.to_string(),
                final_error: final_error.to_string(),
                moved_at: Utc::now(),
                retry_history: vec![final_error.to_string()],
            });
            self.metrics.inc_dead_lettered();
            Ok(())
        }

        async fn reprocess(
            &self,
            _tenant: GroupId,
            _entry_ids: &[String],
        ) -> Result<usize, QueueError> {
            let dead: Vec<DlqMessage> = self.dead.lock().await.drain(..).collect();
            let mut count = 0;
            for envelope in dead {
                let mut msg = envelope.message;
                msg.retry_count = 0;
                self.enqueue(&msg).await?;
                count += 1;
            }
            Ok(count)
        }
    }

    /// Handler that fails a scripted number of times, then succeeds.
    struct FlakyHandler {
        failures_left: AtomicU32,
    }

    impl FlakyHandler {
        fn failing(times: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(times),
            }
        }
    }

    #[async_trait]
    impl HandleDelivery for FlakyHandler {
        async fn handle(&self, _queued: &QueueMessage) -> Result<(), HandlerError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HandlerError::Provider(ProviderError::transport(
                    "mock", "connection reset",
                )));
            }
            Ok(())
        }
    }

    fn test_config(max_retries: u32) -> WorkerPoolConfig {
        WorkerPoolConfig {
            workers: 2,
            block_timeout: Duration::from_millis(20),
            process_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            max_retries,
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn pool_with(
        queue: Arc<MockQueue>,
        handler: Arc<dyn HandleDelivery>,
        metrics: Metrics,
        max_retries: u32,
        tenant: GroupId,
    ) -> WorkerPoolHandle {
        WorkerPool::new(
            queue,
            handler,
            TenantSource::Static(vec![tenant]),
            metrics,
            test_config(max_retries),
            CancellationToken::new(),
        )
        .spawn()
    }

    #[tokio::test]
    async fn retry_then_success() {
        let tenant = GroupId::new();
        let metrics = Metrics::default();
        let queue = Arc::new(MockQueue::new(tenant, metrics.clone()));
        let handler = Arc::new(FlakyHandler::failing(1));

        let msg = QueueMessage::id_only(MessageId::new(), AccountId::new(), tenant);
        queue.enqueue(&msg).await.unwrap();

        let handle = pool_with(queue.clone(), handler, metrics.clone(), 5, tenant);

        let probe = metrics.clone();
        wait_until(move || probe.snapshot().messages_sent_total == 1).await;
        handle.stop().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_failed_total, 1);
        assert_eq!(snapshot.messages_dead_lettered_total, 0);
        // the original entry and the redelivered one were both acknowledged
        assert_eq!(queue.acked.lock().await.len(), 2);
        assert!(queue.dead.lock().await.is_empty());
    }

    #[tokio::test]
    async fn dead_letter_on_exhaustion() {
        let tenant = GroupId::new();
        let metrics = Metrics::default();
        let queue = Arc::new(MockQueue::new(tenant, metrics.clone()));
        let handler = Arc::new(FlakyHandler::failing(u32::MAX));

        let msg = QueueMessage::id_only(MessageId::new(), AccountId::new(), tenant);
        queue.enqueue(&msg).await.unwrap();

        let handle = pool_with(queue.clone(), handler, metrics.clone(), 2, tenant);

        let probe = metrics.clone();
        wait_until(move || probe.snapshot().messages_dead_lettered_total == 1).await;
        handle.stop().await;

        let dead = queue.dead.lock().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].failure_reason, "retry budget exhausted");
        assert_eq!(dead[0].message.retry_count, 2);
        assert!(dead[0].final_error.contains("connection reset"));

        // two attempts, two acknowledged entries, nothing left to redeliver
        assert_eq!(queue.acked.lock().await.len(), 2);
        assert!(queue.entries.lock().await.is_empty());
        assert_eq!(metrics.snapshot().messages_sent_total, 0);
    }

    #[tokio::test]
    async fn malformed_payload_is_acked_and_dropped() {
        let tenant = GroupId::new();
        let metrics = Metrics::default();
        let queue = Arc::new(MockQueue::new(tenant, metrics.clone()));
        let handler = Arc::new(FlakyHandler::failing(0));

        queue.push_raw("{not json".to_string()).await;

        let handle = pool_with(queue.clone(), handler, metrics.clone(), 5, tenant);

        let probe = queue.clone();
        wait_until(move || probe.acked.try_lock().map(|a| a.len() == 1).unwrap_or(false)).await;
        handle.stop().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages_sent_total, 0);
        assert_eq!(snapshot.messages_failed_total, 0);
        assert_eq!(snapshot.messages_dead_lettered_total, 0);
    }

    #[tokio::test]
    async fn reprocess_resets_retry_count() {
        let tenant = GroupId::new();
        let metrics = Metrics::default();
        let queue = Arc::new(MockQueue::new(tenant, metrics.clone()));

        let mut msg = QueueMessage::id_only(MessageId::new(), AccountId::new(), tenant);
        msg.retry_count = 5;
        queue
            .dead_letter(&msg, "retry budget exhausted", "boom")
            .await
            .unwrap();

        let count = queue.reprocess(tenant, &["0-0".to_string()]).await.unwrap();
        assert_eq!(count, 1);

        let (_, payload) = queue.entries.lock().await.pop_front().unwrap();
        let requeued: QueueMessage = serde_json::from_str(&payload).unwrap();
        assert_eq!(requeued.retry_count, 0);
        assert_eq!(requeued.id, msg.id);
    }
}
