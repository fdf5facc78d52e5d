use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sesv2::{
    Client,
    error::{ProvideErrorMetadata, SdkError},
    primitives::Blob,
    types::{Body, Content, Destination, EmailContent, Message, RawMessage},
};
use mail_builder::MessageBuilder;

use crate::providers::{OutboundEmail, Provider, ProviderError, SendOutcome};

pub struct SesProvider {
    name: String,
    client: Client,
}

impl SesProvider {
    pub async fn new(name: String, region: Option<String>, endpoint: Option<String>) -> Self {
        let region = Region::new(region.unwrap_or_else(|| "us-east-1".to_string()));
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);
        if let Some(endpoint) = endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Self {
            name,
            client: Client::new(&config),
        }
    }

    fn classify_sdk_error<E>(&self, err: &SdkError<E>) -> ProviderError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let message = err
            .as_service_error()
            .and_then(|service| service.message())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());

        match err.raw_response().map(|r| r.status().as_u16()) {
            Some(status) => ProviderError::classified(&self.name, status, &message),
            None => ProviderError::transport(&self.name, message),
        }
    }

    fn internal(&self, err: impl std::fmt::Display) -> ProviderError {
        ProviderError::transport(&self.name, err)
    }

    fn utf8_content(&self, data: &str) -> Result<Content, ProviderError> {
        Content::builder()
            .data(data)
            .charset("UTF-8")
            .build()
            .map_err(|e| self.internal(e))
    }

    /// Simple structured content; only usable without attachments.
    fn simple_content(&self, email: &OutboundEmail) -> Result<EmailContent, ProviderError> {
        let mut body = Body::builder();
        match (&email.text_body, &email.html_body) {
            (None, None) => body = body.text(self.utf8_content(&email.text_or_raw())?),
            (text, html) => {
                if let Some(text) = text {
                    body = body.text(self.utf8_content(text)?);
                }
                if let Some(html) = html {
                    body = body.html(self.utf8_content(html)?);
                }
            }
        }

        let message = Message::builder()
            .subject(self.utf8_content(&email.subject)?)
            .body(body.build())
            .build();

        Ok(EmailContent::builder().simple(message).build())
    }

    fn raw_content(&self, email: &OutboundEmail) -> Result<EmailContent, ProviderError> {
        let mime = build_raw_mime(email).map_err(|e| self.internal(e))?;

        let raw = RawMessage::builder()
            .data(Blob::new(mime))
            .build()
            .map_err(|e| self.internal(e))?;

        Ok(EmailContent::builder().raw(raw).build())
    }
}

/// Multipart/mixed MIME for the raw SES path; `mail_builder` applies
/// quoted-printable to the text parts and base64 to the attachments.
fn build_raw_mime(email: &OutboundEmail) -> std::io::Result<Vec<u8>> {
    let mut builder = MessageBuilder::new()
        .from(email.from.as_str())
        .to(email
            .to
            .iter()
            .map(|a| a.as_str())
            .collect::<Vec<&str>>())
        .subject(email.subject.as_str());

    match (&email.text_body, &email.html_body) {
        (None, None) => builder = builder.text_body(email.text_or_raw()),
        (text, html) => {
            if let Some(text) = text {
                builder = builder.text_body(text.as_str());
            }
            if let Some(html) = html {
                builder = builder.html_body(html.as_str());
            }
        }
    }

    for attachment in &email.attachments {
        let filename = attachment
            .filename
            .clone()
            .unwrap_or_else(|| "attachment".to_string());
        builder = match (&attachment.content_id, attachment.is_inline) {
            (Some(cid), true) => builder.inline(
                attachment.content_type.clone(),
                cid.clone(),
                attachment.content.clone(),
            ),
            _ => builder.attachment(
                attachment.content_type.clone(),
                filename,
                attachment.content.clone(),
            ),
        };
    }

    builder.write_to_vec()
}

#[async_trait]
impl Provider for SesProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
        let content = if email.attachments.is_empty() {
            self.simple_content(email)?
        } else {
            self.raw_content(email)?
        };

        let destination = Destination::builder()
            .set_to_addresses(Some(email.to.clone()))
            .build();

        let output = self
            .client
            .send_email()
            .from_email_address(&email.from)
            .destination(destination)
            .content(content)
            .send()
            .await
            .map_err(|e| self.classify_sdk_error(&e))?;

        Ok(SendOutcome {
            provider_message_id: output.message_id().map(str::to_string),
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        self.client
            .get_account()
            .send()
            .await
            .map_err(|e| self.classify_sdk_error(&e))?;

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        mime::MailAttachment,
        models::{GroupId, MessageId},
    };

    #[test]
    fn raw_mime_carries_all_logical_parts() {
        let email = OutboundEmail {
            id: MessageId::new(),
            tenant_id: GroupId::new(),
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: "Report".into(),
            raw_body: Vec::new(),
            text_body: Some("plain part".into()),
            html_body: Some("<p>html part</p>".into()),
            attachments: vec![MailAttachment {
                filename: Some("report.pdf".into()),
                content_type: "application/pdf".into(),
                content: b"%PDF-1.4".to_vec(),
                content_id: None,
                is_inline: false,
            }],
            ..Default::default()
        };

        let mime = build_raw_mime(&email).unwrap();
        let rendered = String::from_utf8_lossy(&mime);

        assert!(rendered.contains("multipart/mixed"));
        assert!(rendered.contains("report.pdf"));
        assert!(rendered.contains("Subject: Report"));

        // and the whole thing parses back into the same three components
        let parsed = crate::mime::parse(&mime).unwrap();
        assert_eq!(parsed.text_body.as_deref(), Some("plain part"));
        assert_eq!(parsed.html_body.as_deref(), Some("<p>html part</p>"));
        assert_eq!(parsed.attachments.len(), 1);
        assert_eq!(parsed.attachments[0].content, b"%PDF-1.4");
    }
}
