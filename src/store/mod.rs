use async_trait::async_trait;
use thiserror::Error;

use crate::models::MessageId;

mod local;
mod s3;

pub use local::LocalStore;
pub use s3::S3Store;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("message body not found")]
    NotFound,
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound)
    }
}

/// Content store for raw message bodies, keyed by message id.
///
/// `put` must be atomic under crash: a reader either sees the whole body or
/// nothing. `delete` of a missing key succeeds. Implementations must be safe
/// under parallel calls on disjoint ids and must not assume the caller
/// serializes operations on the same id.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn put(&self, id: MessageId, bytes: &[u8]) -> Result<(), StoreError>;

    async fn get(&self, id: MessageId) -> Result<Vec<u8>, StoreError>;

    async fn delete(&self, id: MessageId) -> Result<(), StoreError>;
}
