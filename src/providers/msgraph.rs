use async_trait::async_trait;
use base64ct::{Base64, Encoding};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

use crate::providers::{OutboundEmail, Provider, ProviderError, SendOutcome};

const DEFAULT_LOGIN_BASE_URL: &str = "https://login.microsoftonline.com";
const DEFAULT_GRAPH_BASE_URL: &str = "https://graph.microsoft.com";
const TOKEN_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Refresh this long before the token actually expires.
const PRE_EXPIRY: Duration = Duration::from_secs(5 * 60);

pub struct MsGraphProvider {
    name: String,
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    user_id: String,
    token_url: String,
    graph_base_url: String,
    token: RwLock<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Instant::now() + PRE_EXPIRY < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

impl MsGraphProvider {
    pub fn new(
        name: String,
        tenant_id: String,
        client_id: String,
        client_secret: String,
        user_id: String,
    ) -> Result<Self, reqwest::Error> {
        Self::with_endpoints(
            name,
            format!("{DEFAULT_LOGIN_BASE_URL}/{tenant_id}/oauth2/v2.0/token"),
            DEFAULT_GRAPH_BASE_URL.to_string(),
            client_id,
            client_secret,
            user_id,
        )
    }

    pub fn with_endpoints(
        name: String,
        token_url: String,
        graph_base_url: String,
        client_id: String,
        client_secret: String,
        user_id: String,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            name,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            client_id,
            client_secret,
            user_id,
            token_url,
            graph_base_url,
            token: RwLock::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.token.read().await.as_ref()
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        let mut cached = self.token.write().await;
        // another task may have refreshed while we waited for the write lock
        if let Some(token) = cached.as_ref()
            && token.is_fresh()
        {
            return Ok(token.access_token.clone());
        }

        debug!(provider = self.name, "refreshing oauth token");

        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", &self.client_id),
                ("client_secret", &self.client_secret),
                ("scope", TOKEN_SCOPE),
            ])
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classified(&self.name, status.as_u16(), &body));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(&self.name, e))?;

        let fresh = CachedToken {
            access_token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        };
        *cached = Some(fresh);

        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    fn payload(&self, email: &OutboundEmail) -> serde_json::Value {
        let to_recipients: Vec<_> = email
            .to
            .iter()
            .map(|a| json!({ "emailAddress": { "address": a } }))
            .collect();

        let (content_type, content) = match &email.html_body {
            Some(html) => ("HTML", html.clone()),
            None => ("Text", email.text_or_raw()),
        };

        let attachments: Vec<_> = email
            .attachments
            .iter()
            .map(|a| {
                let mut entry = json!({
                    "@odata.type": "#microsoft.graph.fileAttachment",
                    "name": a.filename.as_deref().unwrap_or("attachment"),
                    "contentType": a.content_type,
                    "contentBytes": Base64::encode_string(&a.content),
                    "isInline": a.is_inline,
                });
                if let Some(cid) = &a.content_id {
                    entry["contentId"] = json!(cid);
                }
                entry
            })
            .collect();

        let mut message = json!({
            "subject": email.subject,
            "body": { "contentType": content_type, "content": content },
            "toRecipients": to_recipients,
        });
        if !attachments.is_empty() {
            message["attachments"] = json!(attachments);
        }

        json!({ "message": message, "saveToSentItems": false })
    }

    async fn post_send(
        &self,
        token: &str,
        payload: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        self.http
            .post(format!(
                "{}/v1.0/users/{}/sendMail",
                self.graph_base_url, self.user_id
            ))
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| ProviderError::transport(&self.name, e))
    }
}

#[async_trait]
impl Provider for MsGraphProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, email: &OutboundEmail) -> Result<SendOutcome, ProviderError> {
        let payload = self.payload(email);

        let token = self.access_token().await?;
        let mut response = self.post_send(&token, &payload).await?;

        // a 401 means our cached token was revoked early; refresh and retry once
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            debug!(provider = self.name, "send unauthorized, refreshing token");
            self.invalidate_token().await;
            let token = self.access_token().await?;
            response = self.post_send(&token, &payload).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::classified(&self.name, status.as_u16(), &body));
        }

        // Graph replies 202 Accepted with no body
        Ok(SendOutcome::default())
    }

    async fn health_check(&self) -> Result<(), ProviderError> {
        let token = self.access_token().await?;

        let response = self
            .http
            .get(format!(
                "{}/v1.0/users/{}",
                self.graph_base_url, self.user_id
            ))
            .bearer_auth(token)
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
    use crate::models::{GroupId, MessageId};
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::{
        Mock, MockServer, Request, Respond, ResponseTemplate,
        matchers::{body_partial_json, body_string_contains, method, path},
    };

    fn graph_provider(server: &MockServer) -> MsGraphProvider {
        MsGraphProvider::with_endpoints(
            "msgraph".into(),
            format!("{}/token", server.uri()),
            server.uri(),
            "client".into(),
            "secret".into(),
            "noreply@contoso.com".into(),
        )
        .unwrap()
    }

    fn test_email() -> OutboundEmail {
        OutboundEmail {
            id: MessageId::new(),
            tenant_id: GroupId::new(),
            from: "a@contoso.com".into(),
            to: vec!["b@example.com".into()],
            subject: "Hi".into(),
            raw_body: b"hello".to_vec(),
            text_body: Some("hello".into()),
            ..Default::default()
        }
    }

    async fn mount_token(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": token,
                "token_type": "Bearer",
                "expires_in": 3600,
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn send_uses_text_content_without_html() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1").await;
        Mock::given(method("POST"))
            .and(path("/v1.0/users/noreply@contoso.com/sendMail"))
            .and(body_partial_json(serde_json::json!({
                "message": {
                    "subject": "Hi",
                    "body": { "contentType": "Text", "content": "hello" },
                    "toRecipients": [{ "emailAddress": { "address": "b@example.com" } }],
                },
                "saveToSentItems": false,
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        graph_provider(&server).send(&test_email()).await.unwrap();
    }

    #[tokio::test]
    async fn html_body_switches_content_type() {
        let server = MockServer::start().await;
        mount_token(&server, "tok-1").await;
        Mock::given(method("POST"))
            .and(path("/v1.0/users/noreply@contoso.com/sendMail"))
            .and(body_partial_json(serde_json::json!({
                "message": { "body": { "contentType": "HTML" } },
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let mut email = test_email();
        email.html_body = Some("<p>hello</p>".into());
        graph_provider(&server).send(&email).await.unwrap();
    }

    #[tokio::test]
    async fn token_is_cached_between_sends() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tok-1",
                "expires_in": 3600,
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1.0/users/noreply@contoso.com/sendMail"))
            .respond_with(ResponseTemplate::new(202))
            .expect(2)
            .mount(&server)
            .await;

        let provider = graph_provider(&server);
        provider.send(&test_email()).await.unwrap();
        provider.send(&test_email()).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_send_refreshes_token_and_retries_once() {
        let server = MockServer::start().await;
        mount_token(&server, "tok").await;

        struct FailFirst(AtomicU32);
        impl Respond for FailFirst {
            fn respond(&self, _request: &Request) -> ResponseTemplate {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    ResponseTemplate::new(401).set_body_string("token expired")
                } else {
                    ResponseTemplate::new(202)
                }
            }
        }

        Mock::given(method("POST"))
            .and(path("/v1.0/users/noreply@contoso.com/sendMail"))
            .respond_with(FailFirst(AtomicU32::new(0)))
            .expect(2)
            .mount(&server)
            .await;

        graph_provider(&server).send(&test_email()).await.unwrap();
    }

    #[tokio::test]
    async fn token_endpoint_failure_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid client"))
            .mount(&server)
            .await;

        let err = graph_provider(&server)
            .send(&test_email())
            .await
            .unwrap_err();

        assert!(err.is_permanent());
        assert_eq!(err.status_code, Some(401));
    }
}
