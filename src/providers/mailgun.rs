use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;

use crate::providers::{OutboundEmail, Provider, ProviderError, SendOutcome};

const DEFAULT_BASE_URL: &str = "https://api.mailgun.net";

pub struct MailgunProvider {
    name: String,
    http: reqwest::Client,
    api_key: String,
    domain: String,
    base_url: String,
}

#[derive(serde::Deserialize)]
struct MailgunResponse {
    id: Option<String>,
}

impl MailgunProvider {
    pub fn new(name: String, api_key: String, domain: String) -> Result<Self, reqwest::Error> {
        Self::with_base_url(name, api_key, domain, DEFAULT_BASE_URL.to_string())
    }

    pub fn with_base_url(
        name: String,
        api_key: String,
        domain: String,
        base_url: String,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            api_key,
            domain,
            base_url,
        })
    }

    fn fields(&self, email: &OutboundEmail) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("from", email.from.clone()),
            ("to", email.to.join(",")),
            ("subject", email.subject.clone()),
        ];
        match (&email.text_body, &email.html_body) {
            (None, None) => fields.push(("text", email.text_or_raw())),
            (text, html) => {
                if let Some(text) = text {
                    fields.push(("text", text.clone()));
                }
                if let Some(html) = html {
                    fields.push(("html", html.clone()));
                }
            }
        }
        fields
    }

    fn multipart(&self, email: &OutboundEmail) -> Result<Form, ProviderError> {
        let mut form = Form::new();
        for (key, value) in self.fields(email) {
            form = form.text(key, value);
        }

        for attachment in &email.attachments {
            let field = if attachment.is_inline {
                "inline"
            } else {
                "attachment"
            };
            let part = Part::bytes(attachment.content.clone())
                .file_name(
                    attachment
                        .filename
                        .clone()
                        .unwrap_or_else(|| "attachment".into()),
                )
                .mime_str(&attachment.content_type)
                .map_err(|e| ProviderError::transport(&self.name, e))?;
            form = form.part(field, part);
        }

        Ok(form)
    }
}

#[async_trait]
impl Provider for MailgunProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
        let url = format!("{}/v3/{}/messages", self.base_url, self.domain);
        let request = self
            .http
            .post(url)
            .basic_auth("api", Some(&self.api_key));

        // plain form without attachments, multipart with them
        let request = if email.attachments.is_empty() {
            request.form(&self.fields(email))
        } else {
            request.multipart(self.multipart(email)?)
        };

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classified(&self.name, status.as_u16(), &body));
        }

        let provider_message_id = response
            .json::<MailgunResponse>()
            .await
            .ok()
            .and_then(|r| r.id);

        Ok(SendOutcome {
            provider_message_id,
        })
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let response = self
            .http
            .get(format!("{}/v3/domains/{}", self.base_url, self.domain))
            .basic_auth("api", Some(&self.api_key))
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
        matchers::{body_string_contains, header_exists, method, path},
    };

    fn test_email() -> OutboundEmail {
        OutboundEmail {
            id: MessageId::new(),
            tenant_id: GroupId::new(),
            from: "a@example.com".into(),
            to: vec!["b@example.com".into(), "c@example.com".into()],
            subject: "Hi".into(),
            raw_body: b"hello".to_vec(),
            text_body: Some("hello".into()),
            html_body: Some("<p>hello</p>".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn send_without_attachments_is_urlencoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mg.example.com/messages"))
            .and(header_exists("authorization"))
            .and(body_string_contains("from=a%40example.com"))
            .and(body_string_contains("to=b%40example.com%2Cc%40example.com"))
            .and(body_string_contains("html=%3Cp%3Ehello%3C%2Fp%3E"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "<mg-1@mg.example.com>",
                "message": "Queued. Thank you.",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = MailgunProvider::with_base_url(
            "mailgun".into(),
            "key".into(),
            "mg.example.com".into(),
            server.uri(),
        )
        .unwrap();
        let outcome = provider.send(&test_email()).await.unwrap();

        assert_eq!(
            outcome.provider_message_id.as_deref(),
            Some("<mg-1@mg.example.com>")
        );
    }

    #[tokio::test]
    async fn send_with_attachments_is_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mg.example.com/messages"))
            .and(body_string_contains("filename=\"notes.txt\""))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "<mg-2@mg.example.com>",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut email = test_email();
        email.attachments.push(MailAttachment {
            filename: Some("notes.txt".into()),
            content_type: "text/plain".into(),
            content: b"notes".to_vec(),
            content_id: None,
            is_inline: false,
        });

        let provider = MailgunProvider::with_base_url(
            "mailgun".into(),
            "key".into(),
            "mg.example.com".into(),
            server.uri(),
        )
        .unwrap();
        provider.send(&email).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v3/mg.example.com/messages"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Forbidden"))
            .mount(&server)
            .await;

        let provider = MailgunProvider::with_base_url(
            "mailgun".into(),
            "key".into(),
            "mg.example.com".into(),
            server.uri(),
        )
        .unwrap();
        let err = provider.send(&test_email()).await.unwrap_err();

        assert!(err.is_permanent());
    }
}
