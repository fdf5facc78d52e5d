use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::{
    mime::MailAttachment,
    models::{GroupId, MessageId, ProviderKind, ProviderRecord},
};

mod mailgun;
mod msgraph;
mod sendgrid;
mod ses;
mod sink;

pub use mailgun::MailgunProvider;
pub use msgraph::MsGraphProvider;
pub use sendgrid::SendgridProvider;
pub use ses::SesProvider;
pub use sink::{FileProvider, StdoutProvider};

/// A fully assembled outbound message, ready for any ESP adapter.
#[derive(Debug, Default)]
pub struct OutboundEmail {
    pub id: MessageId,
    pub tenant_id: GroupId,
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub headers: serde_json::Map<String, serde_json::Value>,
    pub raw_body: Vec<u8>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<MailAttachment>,
}

impl OutboundEmail {
    /// Body to fall back on when parsing produced neither a text nor an HTML
    /// part.
    pub fn text_or_raw(&self) -> String {
        self.text_body
            .clone()
            .unwrap_or_else(|| String::from_utf8_lossy(&self.raw_body).into_owned())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendOutcome {
    pub provider_message_id: Option<String>,
}

#[derive(Debug, Clone, Error)]
#[error("{provider}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub status_code: Option<u16>,
    pub message: String,
    pub permanent: bool,
}

impl ProviderError {
    /// Classify a non-2xx HTTP response per the shared ESP error taxonomy.
    pub fn classified(provider: impl Into<String>, status: u16, body: &str) -> Self {
        Self {
            provider: provider.into(),
            status_code: Some(status),
            message: body.to_string(),
            permanent: is_permanent_status(status, body),
        }
    }

    /// Network, TLS and serialization failures: unknown, so retryable.
    pub fn transport(provider: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            provider: provider.into(),
            status_code: None,
            message: err.to_string(),
            permanent: false,
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.permanent
    }

    pub fn is_transient(&self) -> bool {
        !self.permanent
    }
}

const PERMANENT_400_MARKERS: &[&str] = &[
    "invalid recipient",
    "invalid email",
    "does not exist",
    "mailbox not found",
    "recipient rejected",
    "bad request",
    "validation error",
    "invalid address",
];

const PERMANENT_5XX_MARKERS: &[&str] = &[
    "invalid api key",
    "authentication failed",
    "account suspended",
    "account disabled",
    "unauthorized",
];

fn body_matches(body: &str, markers: &[&str]) -> bool {
    let body = body.to_lowercase();
    markers.iter().any(|marker| body.contains(marker))
}

pub fn is_permanent_status(status: u16, body: &str) -> bool {
    match status {
        200..=299 => false,
        400 => body_matches(body, PERMANENT_400_MARKERS),
        401 | 403 | 404 => true,
        429 => false,
        500..=599 => body_matches(body, PERMANENT_5XX_MARKERS),
        402..=499 => true,
        _ => false,
    }
}

/// The capability set every ESP must offer. Implementations are cheap to
/// share behind an `Arc` and safe for concurrent sends.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError>;

    async fn health_check(&self) -> Result<(), ProviderError>;
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("provider {0} requires an api key")]
    MissingApiKey(ProviderKind),
    #[error("provider {kind} requires the `{field}` setting")]
    MissingSetting {
        kind: ProviderKind,
        field: &'static str,
    },
    #[error("invalid provider settings: {0}")]
    Settings(#[from] serde_json::Error),
    #[error("failed to construct http client: {0}")]
    Http(#[from] reqwest::Error),
}

/// Instantiate the adapter described by a provider row.
pub async fn build(record: &ProviderRecord) -> Result<Arc<dyn Provider>, BuildError> {
    let settings = record.settings()?;
    let require = |field: &'static str, value: &Option<String>| {
        value.clone().ok_or(BuildError::MissingSetting {
            kind: record.kind,
            field,
        })
    };
    let api_key = || {
        record
            .api_key
            .clone()
            .ok_or(BuildError::MissingApiKey(record.kind))
    };

    let provider: Arc<dyn Provider> = match record.kind {
        ProviderKind::Sendgrid => {
            Arc::new(SendgridProvider::new(record.name.clone(), api_key()?)?)
        }
        ProviderKind::Ses => Arc::new(
            SesProvider::new(
                record.name.clone(),
                settings.region.clone(),
                settings.endpoint.clone(),
            )
            .await,
        ),
        ProviderKind::Mailgun => Arc::new(MailgunProvider::new(
            record.name.clone(),
            api_key()?,
            require("domain", &settings.domain)?,
        )?),
        ProviderKind::Msgraph => Arc::new(MsGraphProvider::new(
            record.name.clone(),
            require("tenant_id", &settings.tenant_id)?,
            require("client_id", &settings.client_id)?,
            require("client_secret", &settings.client_secret)?,
            require("user_id", &settings.user_id)?,
        )?),
        ProviderKind::Stdout => Arc::new(StdoutProvider::default()),
        // the file sink reuses the endpoint setting as its target path
        ProviderKind::File => Arc::new(FileProvider::new(
            settings.endpoint.clone().unwrap_or_else(|| "mailgate-outbox.jsonl".into()),
        )),
    };

    Ok(provider)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn two_xx_is_never_an_error() {
        assert!(!is_permanent_status(200, "ok"));
        assert!(!is_permanent_status(202, ""));
    }

    #[test]
    fn bad_request_is_permanent_only_with_recipient_markers() {
        assert!(is_permanent_status(400, "Invalid Recipient address"));
        assert!(is_permanent_status(400, "mailbox not found for user"));
        assert!(is_permanent_status(400, "VALIDATION ERROR: to field"));
        assert!(!is_permanent_status(400, "temporarily out of capacity"));
    }

    #[test]
    fn auth_and_missing_are_permanent() {
        assert!(is_permanent_status(401, ""));
        assert!(is_permanent_status(403, "forbidden"));
        assert!(is_permanent_status(404, ""));
    }

    #[test]
    fn rate_limit_is_transient() {
        assert!(!is_permanent_status(429, "slow down"));
    }

    #[test]
    fn five_xx_is_permanent_only_with_account_markers() {
        assert!(is_permanent_status(500, "Invalid API key supplied"));
        assert!(is_permanent_status(503, "account suspended pending review"));
        assert!(!is_permanent_status(500, "internal error"));
        assert!(!is_permanent_status(502, "upstream timeout"));
    }

    #[test]
    fn other_4xx_is_permanent() {
        assert!(is_permanent_status(410, "gone"));
        assert!(is_permanent_status(422, "unprocessable"));
    }

    #[test]
    fn transport_errors_are_transient() {
        let err = ProviderError::transport("sendgrid", "connection reset");
        assert!(err.is_transient());
        assert_eq!(err.status_code, None);
    }
}
