use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use serde_json::json;
use std::time::Duration;

use crate::providers::{OutboundEmail, Provider, ProviderError, SendOutcome};

const DEFAULT_BASE_URL: &str = "https://api.sendgrid.com";

pub struct SendgridProvider {
    name: String,
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl SendgridProvider {
    pub fn new(name: String, api_key: String) -> Result<Self, reqwest::Error> {
        Self::with_base_url(name, api_key, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(
        name: String,
        api_key: String,
        base_url: String,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            api_key,
            base_url,
        })
    }

    fn payload(&self, email: &OutboundEmail) -> serde_json::Value {
        let to: Vec<_> = email.to.iter().map(|a| json!({ "email": a })).collect();

        // prefer the parsed text and html parts; SendGrid requires at least
        // one content entry
        let mut content = Vec::new();
        if let Some(text) = &email.text_body {
            content.push(json!({ "type": "text/plain", "value": text }));
        }
        if let Some(html) = &email.html_body {
            content.push(json!({ "type": "text/html", "value": html }));
        }
        if content.is_empty() {
            content.push(json!({ "type": "text/plain", "value": email.text_or_raw() }));
        }

        let mut payload = json!({
            "personalizations": [{ "to": to }],
            "from": { "email": email.from },
            "subject": email.subject,
            "content": content,
        });

        if !email.attachments.is_empty() {
            let attachments: Vec<_> = email
                .attachments
                .iter()
                .map(|a| {
                    let mut entry = json!({
                        "content": Base64::encode_string(&a.content),
                        "type": a.content_type,
                        "filename": a.filename.as_deref().unwrap_or("attachment"),
                        "disposition": if a.is_inline { "inline" } else { "attachment" },
                    });
                    if let Some(cid) = &a.content_id {
                        entry["content_id"] = json!(cid);
                    }
                    entry
                })
                .collect();
            payload["attachments"] = json!(attachments);
        }

        payload
    }
}

#[async_trait]
impl Provider for SendgridProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
        let response = self
            .http
            .post(format!("{}/v3/mail/send", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&self.payload(email))
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classified(&self.name, status.as_u16(), &body));
        }

        let provider_message_id = response
            .headers()
            .get("x-message-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(SendOutcome {
            provider_message_id,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .http
            .get(format!("{}/v3/user/profile", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classified(&self.name, status.as_u16(), &body));
        }

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
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, header, method, path},
    };

    fn test_email() -> OutboundEmail {
        OutboundEmail {
            id: MessageId::new(),
            tenant_id: GroupId::new(),
            from: "a@example.com".into(),
            to: vec!["b@example.com".into()],
            subject: "Hi".into(),
            raw_body: b"hello".to_vec(),
            text_body: Some("hello".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_posts_expected_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .and(header("authorization", "Bearer sg-key"))
            .and(body_partial_json(serde_json::json!({
                "from": { "email": "a@example.com" },
                "subject": "Hi",
                "content": [{ "type": "text/plain", "value": "hello" }],
            })))
            .respond_with(ResponseTemplate::new(202).insert_header("x-message-id", "msg-1"))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            SendgridProvider::with_base_url("sendgrid".into(), "sg-key".into(), server.uri())
                .unwrap();
        let outcome = provider.send(&test_email()).await.unwrap();

        assert_eq!(outcome.provider_message_id.as_deref(), Some("msg-1"));
    }

    #[tokio::test]
    async fn attachments_are_base64_with_disposition() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .and(body_partial_json(serde_json::json!({
                "attachments": [{
                    "content": "JVBERi0xLjQ=",
                    "type": "application/pdf",
                    "filename": "report.pdf",
                    "disposition": "attachment",
                }],
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let mut email = test_email();
        email.attachments.push(MailAttachment {
            filename: Some("report.pdf".into()),
            content_type: "application/pdf".into(),
            content: b"%PDF-1.4".to_vec(),
            content_id: None,
            is_inline: false,
        });

        let provider =
            SendgridProvider::with_base_url("sendgrid".into(), "sg-key".into(), server.uri())
                .unwrap();
        provider.send(&email).await.unwrap();
    }

    #[tokio::test]
    async fn four_hundred_with_recipient_marker_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid recipient"))
            .mount(&server)
            .await;

        let provider =
            SendgridProvider::with_base_url("sendgrid".into(), "sg-key".into(), server.uri())
                .unwrap();
        let err = provider.send(&test_email()).await.unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(err.status_code, Some(400));
    }

    #[tokio::test]
    async fn five_hundred_without_marker_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mail/send"))
            .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
            .mount(&server)
            .await;

        let provider =
            SendgridProvider::with_base_url("sendgrid".into(), "sg-key".into(), server.uri())
                .unwrap();
        let err = provider.send(&test_email()).await.unwrap_err();

        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn health_check_hits_profile_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v3/user/profile"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let provider =
            SendgridProvider::with_base_url("sendgrid".into(), "sg-key".into(), server.uri())
                .unwrap();
        provider.health_check().await.unwrap();
    }
}
