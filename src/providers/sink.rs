use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::providers::{OutboundEmail, Provider, ProviderError, SendOutcome};

/// Development sink that logs the message and reports success. Also serves as
/// the fallback when a tenant has no enabled provider.
#[derive(Debug, Default)]
pub struct StdoutProvider;

#[async_trait]
impl Provider for StdoutProvider {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
        info!(
            message_id = email.id.to_string(),
            tenant_id = email.tenant_id.to_string(),
            from = email.from,
            to = email.to.join(","),
            subject = email.subject,
            attachments = email.attachments.len(),
            "stdout sink delivered message"
        );

        Ok(SendOutcome::default())
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Development sink that appends one JSON line per message to a local file.
pub struct FileProvider {
    path: PathBuf,
}

impl FileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Provider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
        let line = json!({
            "id": email.id,
            "tenant_id": email.tenant_id,
            "from": email.from,
            "to": email.to,
            "subject": email.subject,
            "text_body": email.text_body,
            "html_body": email.html_body,
            "attachments": email.attachments.len(),
        });

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| ProviderError::transport(self.name(), e))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| ProviderError::transport(self.name(), e))?;

        Ok(SendOutcome::default())
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::models::{GroupId, MessageId};

    #[tokio::test]
    async fn file_sink_appends_one_line_per_message() {
        let path = std::env::temp_dir().join(format!("mailgate-sink-{}.jsonl", uuid::Uuid::new_v4()));
        let provider = FileProvider::new(&path);

        let email = OutboundEmail {
            id: MessageId::new(),
            tenant_id: GroupId::new(),
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: "Hi".into(),
            ..Default::default()
        };

        provider.send(&email).await.unwrap();
        provider.send(&email).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("a@example.com"));

        tokio::fs::remove_file(&path).await.ok();
    }
}
