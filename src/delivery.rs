use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::{
    handler::{HandleDelivery, HandlerError},
    models::{AccountId, GroupId, MessageId},
    queue::{MessageQueue, QueueError, QueueMessage},
};

#[derive(Debug, Clone, Copy)]
pub struct DeliveryRequest {
    pub message_id: MessageId,
    pub account_id: AccountId,
    pub tenant_id: GroupId,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
}

/// The SMTP session hands accepted messages to one of these; whether delivery
/// happens inline or via the queue is a deployment decision it does not see.
#[async_trait]
pub trait DeliveryService: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> Result<(), DeliveryError>;
}

/// Enqueue an ID-only reference; the worker pool does the rest.
pub struct AsyncDelivery {
    queue: Arc<dyn MessageQueue>,
}

impl AsyncDelivery {
    pub fn new(queue: Arc<dyn MessageQueue>) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl DeliveryService for AsyncDelivery {
    async fn deliver(&self, request: DeliveryRequest) -> Result<(), DeliveryError> {
        let msg = QueueMessage::id_only(request.message_id, request.account_id, request.tenant_id);
        self.queue.enqueue(&msg).await?;

        Ok(())
    }
}

/// Resolve and send inline, on the ingress path.
pub struct SyncDelivery {
    handler: Arc<dyn HandleDelivery>,
}

impl SyncDelivery {
    pub fn new(handler: Arc<dyn HandleDelivery>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl DeliveryService for SyncDelivery {
    async fn deliver(&self, request: DeliveryRequest) -> Result<(), DeliveryError> {
        let msg = QueueMessage::id_only(request.message_id, request.account_id, request.tenant_id);
        self.handler.handle(&msg).await?;

        Ok(())
    }
}
