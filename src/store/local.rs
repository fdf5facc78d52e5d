use async_trait::async_trait;
use std::{io, path::PathBuf};
use tokio::fs;
use uuid::Uuid;

use crate::{
    models::MessageId,
    store::{MessageStore, StoreError},
};

/// Filesystem-backed store. Bodies land at `<base>/<message_id>`; writes go
/// to a sibling temp file first and are moved into place with a rename, which
/// is atomic on POSIX filesystems.
pub struct LocalStore {
    base: PathBuf,
}

impl LocalStore {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base = base.into();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    fn path_for(&self, id: MessageId) -> PathBuf {
        self.base.join(id.to_string())
    }
}

#[async_trait]
impl MessageStore for LocalStore {
    async fn put(&self, id: MessageId, bytes: &[u8]) -> Result<(), StoreError> {
        let target = self.path_for(id);
        let tmp = self.base.join(format!(".{id}.{}.tmp", Uuid::new_v4()));

        fs::write(&tmp, bytes).await?;
        if let Err(e) = fs::rename(&tmp, &target).await {
            fs::remove_file(&tmp).await.ok();
            return Err(e.into());
        }

        Ok(())
    }

    async fn get(&self, id: MessageId) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_for(id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, id: MessageId) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    async fn scratch_store() -> LocalStore {
        let base = std::env::temp_dir().join(format!("mailgate-store-{}", Uuid::new_v4()));
        LocalStore::new(base).await.unwrap()
    }

    #[tokio::test]
    async fn put_then_get_roundtrip() {
        let store = scratch_store().await;
        let id = MessageId::new();

        store.put(id, b"Subject: Hi\r\n\r\nhello").await.unwrap();
        let body = store.get(id).await.unwrap();

        assert_eq!(body, b"Subject: Hi\r\n\r\nhello");
    }

    #[tokio::test]
    async fn put_overwrites_existing_body() {
        let store = scratch_store().await;
        let id = MessageId::new();

        store.put(id, b"first").await.unwrap();
        store.put(id, b"second").await.unwrap();

        assert_eq!(store.get(id).await.unwrap(), b"second");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = scratch_store().await;

        let err = store.get(MessageId::new()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = scratch_store().await;
        let id = MessageId::new();

        store.put(id, b"body").await.unwrap();
        store.delete(id).await.unwrap();
        store.delete(id).await.unwrap();

        assert!(store.get(id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let store = scratch_store().await;
        store.put(MessageId::new(), b"body").await.unwrap();

        let mut entries = fs::read_dir(&store.base).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name();
            assert!(!name.to_string_lossy().ends_with(".tmp"));
        }
    }

    #[tokio::test]
    async fn parallel_puts_on_disjoint_ids() {
        let store = std::sync::Arc::new(scratch_store().await);

        let ids: Vec<MessageId> = (0..16).map(|_| MessageId::new()).collect();
        let mut handles = Vec::new();
        for id in &ids {
            let store = store.clone();
            let id = *id;
            handles.push(tokio::spawn(async move {
                store.put(id, id.to_string().as_bytes()).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        for id in ids {
            assert_eq!(store.get(id).await.unwrap(), id.to_string().as_bytes());
        }
    }
}
