use base64ct::Encoding;
use email_address::EmailAddress;
use smtp_proto::{
    AUTH_PLAIN, EXT_8BIT_MIME, EXT_AUTH, EXT_ENHANCED_STATUS_CODES, EXT_SMTP_UTF8, EhloResponse,
    Request,
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::{
    delivery::DeliveryRequest,
    mime,
    models::{AccountId, GroupId, MessageStatus, NewMessage},
    smtp::SmtpBackend,
};

/// Delays between attempts to hand an accepted message to the delivery
/// service.
const DELIVER_RETRY_SCHEDULE: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_secs(1),
];

pub struct SmtpSession {
    backend: Arc<SmtpBackend>,
    peer_addr: SocketAddr,
    peer_name: Option<String>,
    correlation_id: Uuid,
    max_message_size: usize,
    auth: Option<AuthenticatedAccount>,
    envelope: Option<Envelope>,
}

pub(crate) struct AuthenticatedAccount {
    pub account_id: AccountId,
    pub group_id: GroupId,
    pub username: String,
    /// Empty means the account may send from any domain.
    pub allowed_domains: Vec<String>,
}

struct Envelope {
    sender: EmailAddress,
    recipients: Vec<EmailAddress>,
    buffer: Vec<u8>,
}

pub enum SessionReply {
    ReplyAndContinue(u16, String),
    ReplyAndStop(u16, String),
    RawReply(Vec<u8>),
    IngestData(u16, String),
    IngestAuth(u16, String),
}

pub enum DataReply {
    ReplyAndContinue(u16, String),
    ContinueIngest,
}

struct AttemptedAuth<'a> {
    username: &'a str,
    password: &'a str,
}

enum AttemptedAuthError {
    SyntaxError,
    Utf8Error,
}

impl SmtpSession {
    const RESPONSE_OK: &str = "2.0.0 Ok";
    const RESPONSE_FROM_OK: &str = "2.1.0 Originator <[email]> ok";
    const RESPONSE_TO_OK: &str = "2.1.5 Recipient <[email]> ok";
    const RESPONSE_SYNTAX_ERROR: &str = "5.5.2 Syntax error";
    const RESPONSE_AUTH_SUCCESS: &str = "2.7.0 Authentication succeeded.";
    const RESPONSE_START_DATA: &str = "3.5.4 Start mail input; end with <CRLF>.<CRLF>";
    const RESPONSE_BYE: &str = "2.0.0 Goodbye";
    const RESPONSE_MESSAGE_ACCEPTED: &str = "2.6.0 Message queued for delivery";
    const RESPONSE_MESSAGE_TOO_BIG: &str = "5.3.4 Message exceeds maximum size";
    const RESPONSE_TEMPORARY_FAILURE: &str = "4.3.0 Temporary failure, try again later";
    const RESPONSE_BAD_SEQUENCE: &str = "5.5.1 Bad sequence of commands";
    const RESPONSE_MAIL_FIRST: &str = "5.5.1 Use MAIL first";
    const RESPONSE_HELLO_FIRST: &str = "5.5.1 Be nice and say EHLO first";
    const RESPONSE_NO_RECIPIENTS: &str = "5.5.1 No valid recipients";
    const RESPONSE_INVALID_SENDER: &str = "5.1.7 This sender address is not valid";
    const RESPONSE_INVALID_EMAIL: &str = "5.1.3 This email address is not valid";
    const RESPONSE_SENDER_DOMAIN_REJECTED: &str =
        "5.7.1 Sender domain not permitted for this account";
    const RESPONSE_NESTED_MAIL: &str = "5.5.1 Error: nested MAIL command";
    const RESPONSE_ALREADY_AUTHENTICATED: &str = "5.5.1 Already authenticated";
    const RESPONSE_AUTH_ERROR: &str = "5.7.8 Authentication credentials invalid";
    const RESPONSE_AUTHENTICATION_REQUIRED: &str = "5.7.1 Authentication required";
    const RESPONSE_ALREADY_TLS: &str = "5.7.4 Already in TLS mode";
    const RESPONSE_COMMAND_NOT_IMPLEMENTED: &str = "5.5.1 Command not implemented";
    const RESPONSE_MUST_USE_ESMTP: &str = "5.5.1 Must use EHLO";
    const RESPONSE_NO_VRFY: &str = "5.5.1 VRFY command is disabled";

    pub fn new(peer_addr: SocketAddr, backend: Arc<SmtpBackend>, max_message_size: usize) -> Self {
        Self {
            backend,
            peer_addr,
            peer_name: None,
            correlation_id: Uuid::new_v4(),
            max_message_size,
            auth: None,
            envelope: None,
        }
    }

    pub fn peer(&self) -> &SocketAddr {
        &self.peer_addr
    }

    /// Propagated into every log line of this session for joining.
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub async fn handle(
        &mut self,
        request: Result<Request<String>, smtp_proto::Error>,
    ) -> SessionReply {
        let request = match request {
            Ok(r) => r,
            Err(e) => {
                debug!("failed to parse request: {e}");

                // RFC 4409, 4.1
                return SessionReply::ReplyAndContinue(554, e.to_string());
            }
        };

        if let Request::Auth { mechanism, .. } = request {
            // the Debug impl of Request would print the credential material
            trace!(
                "received AUTH with mechanism {mechanism} request from {}",
                self.peer_addr
            );
        } else {
            trace!("received request: {request:?} from {}", self.peer_addr);
        }

        match request {
            Request::Ehlo { host } => {
                // RFC 5321, 4.1.1.1
                let mut response = EhloResponse::new(&host);
                response.capabilities =
                    EXT_ENHANCED_STATUS_CODES | EXT_8BIT_MIME | EXT_SMTP_UTF8 | EXT_AUTH;

                response.auth_mechanisms = AUTH_PLAIN;

                let mut buf = Vec::with_capacity(64);
                response.write(&mut buf).ok();

                self.peer_name = Some(host);

                SessionReply::RawReply(buf)
            }
            Request::Lhlo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Helo { host: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_MUST_USE_ESMTP.into())
            }
            Request::Auth {
                mechanism,
                initial_response,
            } => {
                // RFC 4954
                if self.auth.is_some() {
                    return SessionReply::ReplyAndContinue(
                        503,
                        Self::RESPONSE_ALREADY_AUTHENTICATED.into(),
                    );
                }

                if mechanism == AUTH_PLAIN {
                    if initial_response.is_empty() {
                        return SessionReply::IngestAuth(334, "Tell me your secret.".into());
                    }

                    let (code, message) = self
                        .handle_plain_auth(&mut initial_response.into_bytes())
                        .await;

                    SessionReply::ReplyAndContinue(code, message)
                } else {
                    debug!("received unsupported AUTH request");
                    SessionReply::ReplyAndContinue(535, Self::RESPONSE_AUTH_ERROR.into())
                }
            }
            Request::Quit => {
                // RFC 5321, 4.1.1.10
                SessionReply::ReplyAndStop(221, Self::RESPONSE_BYE.into())
            }
            // ask for EHLO before processing anything below
            _ignored_command if self.peer_name.is_none() => {
                SessionReply::ReplyAndContinue(503, Self::RESPONSE_HELLO_FIRST.into())
            }
            Request::Mail { from } => {
                // RFC 5321, 4.1.1.2
                debug!("received MAIL FROM: {}", from.address);

                let Some(auth) = self.auth.as_ref() else {
                    return SessionReply::ReplyAndContinue(
                        530,
                        Self::RESPONSE_AUTHENTICATION_REQUIRED.into(),
                    );
                };

                if self.envelope.is_some() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NESTED_MAIL.into());
                }

                let Ok(sender) = from.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_SENDER.into(),
                    );
                };

                // the per-account domain gate
                let domain = sender.domain();
                if !auth.allowed_domains.is_empty()
                    && !auth
                        .allowed_domains
                        .iter()
                        .any(|allowed| allowed.eq_ignore_ascii_case(domain))
                {
                    warn!(
                        username = auth.username,
                        domain, "rejected sender domain not in allow list"
                    );
                    return SessionReply::ReplyAndContinue(
                        550,
                        Self::RESPONSE_SENDER_DOMAIN_REJECTED.into(),
                    );
                }

                self.envelope = Some(Envelope {
                    sender,
                    recipients: Vec::new(),
                    buffer: Vec::new(),
                });

                let response_message = Self::RESPONSE_FROM_OK.replace("[email]", &from.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Rcpt { to } => {
                // RFC 5321, 4.1.1.3
                debug!("received RCPT TO: {}", to.address);

                if self.auth.is_none() {
                    return SessionReply::ReplyAndContinue(
                        530,
                        Self::RESPONSE_AUTHENTICATION_REQUIRED.into(),
                    );
                }

                let Ok(to_address) = to.address.parse::<EmailAddress>() else {
                    return SessionReply::ReplyAndContinue(
                        553,
                        Self::RESPONSE_INVALID_EMAIL.into(),
                    );
                };

                let Some(envelope) = self.envelope.as_mut() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_MAIL_FIRST.into());
                };

                envelope.recipients.push(to_address);

                let response_message = Self::RESPONSE_TO_OK.replace("[email]", &to.address);
                SessionReply::ReplyAndContinue(250, response_message)
            }
            Request::Bdat { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Noop { value: _ } => {
                // RFC 5321, 4.1.1.9
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::StartTls => {
                SessionReply::ReplyAndContinue(504, Self::RESPONSE_ALREADY_TLS.into())
            }
            Request::Data => {
                // RFC 5321, 4.1.1.4
                if self.auth.is_none() {
                    return SessionReply::ReplyAndContinue(
                        530,
                        Self::RESPONSE_AUTHENTICATION_REQUIRED.into(),
                    );
                }

                let Some(Envelope { recipients, .. }) = self.envelope.as_ref() else {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
                };

                if recipients.is_empty() {
                    return SessionReply::ReplyAndContinue(503, Self::RESPONSE_NO_RECIPIENTS.into());
                }

                SessionReply::IngestData(354, Self::RESPONSE_START_DATA.into())
            }
            Request::Rset => {
                // RFC 5321, 4.1.1.5: clears the envelope, keeps AUTH and EHLO
                // state
                self.envelope = None;
                SessionReply::ReplyAndContinue(250, Self::RESPONSE_OK.into())
            }
            Request::Vrfy { value: _ } => {
                // RFC 5321, 4.1.1.6
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_NO_VRFY.into())
            }
            Request::Expn { value: _ } | Request::Help { value: _ } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
            Request::Etrn { .. } | Request::Atrn { .. } | Request::Burl { .. } => {
                SessionReply::ReplyAndContinue(502, Self::RESPONSE_COMMAND_NOT_IMPLEMENTED.into())
            }
        }
    }

    fn decode_plain_auth(data: &mut [u8]) -> Result<AttemptedAuth<'_>, AttemptedAuthError> {
        // we may need to trim off a trailing CR/LF
        let ascii_len = data.trim_ascii_end().len();
        let data = &mut data[..ascii_len];

        let Ok(decoded) = base64ct::Base64::decode_in_place(data) else {
            return Err(AttemptedAuthError::SyntaxError);
        };

        let mut parts = decoded.split(|&b| b == 0);

        let Some(authcid) = parts.next() else {
            return Err(AttemptedAuthError::SyntaxError);
        };
        if authcid != b"" {
            trace!(
                "ignoring received authentication identity (authcid): {}",
                String::from_utf8_lossy(authcid)
            );
        }
        let username = parts.next().ok_or(AttemptedAuthError::SyntaxError)?;
        let password = parts.next().ok_or(AttemptedAuthError::SyntaxError)?;
        if parts.count() != 0 {
            return Err(AttemptedAuthError::SyntaxError);
        }

        let username = std::str::from_utf8(username).map_err(|_| AttemptedAuthError::Utf8Error)?;
        let password = std::str::from_utf8(password).map_err(|_| AttemptedAuthError::Utf8Error)?;

        Ok(AttemptedAuth { username, password })
    }

    async fn reject_auth(&self, username: &str, reason: &str) -> (u16, String) {
        debug!(username, "authentication rejected: {reason}");

        self.backend.throttle.record_failure(username);
        self.backend.metrics.inc_auth_failures();
        self.backend
            .audit
            .record(
                None,
                None,
                "smtp.auth.failed",
                &format!("{username} from {}: {reason}", self.peer_addr),
            )
            .await
            .ok();

        (535, Self::RESPONSE_AUTH_ERROR.into())
    }

    pub(super) async fn handle_plain_auth(&mut self, data: &mut [u8]) -> (u16, String) {
        let Ok(AttemptedAuth { username, password }) = Self::decode_plain_auth(data) else {
            return (501, Self::RESPONSE_SYNTAX_ERROR.into());
        };

        trace!(
            "decoded credentials, username: {username} password ({} characters)",
            password.len()
        );

        // locked usernames are turned away before any lookup happens
        if self.backend.throttle.is_locked(username) {
            debug!(username, "rejecting login attempt for locked username");
            self.backend.metrics.inc_auth_failures();
            return (535, Self::RESPONSE_AUTH_ERROR.into());
        }

        let account = match self.backend.accounts.find_by_username(username).await {
            Ok(Some(account)) => account,
            Ok(None) => return self.reject_auth(username, "unknown username").await,
            Err(e) => {
                error!("failed to look up account: {e}");
                return self.reject_auth(username, "lookup failed").await;
            }
        };

        if !account.can_authenticate_smtp() {
            return self
                .reject_auth(username, "account not usable for smtp ingest")
                .await;
        }

        if !account.verify_password(password) {
            return self.reject_auth(username, "bad password").await;
        }

        let memberships = match self.backend.accounts.active_memberships(account.id()).await {
            Ok(memberships) => memberships,
            Err(e) => {
                error!("failed to load group memberships: {e}");
                return self.reject_auth(username, "membership lookup failed").await;
            }
        };
        let Some(membership) = memberships.first() else {
            return self.reject_auth(username, "no active group").await;
        };

        self.backend.throttle.record_success(username);
        self.backend
            .audit
            .record(
                Some(account.id()),
                Some(membership.group_id),
                "smtp.auth",
                &format!("{username} authenticated from {}", self.peer_addr),
            )
            .await
            .ok();

        self.auth = Some(AuthenticatedAccount {
            account_id: account.id(),
            group_id: membership.group_id,
            username: account.username.clone(),
            allowed_domains: account.allowed_domains.clone(),
        });

        (235, Self::RESPONSE_AUTH_SUCCESS.into())
    }

    pub async fn handle_data(&mut self, data: &[u8]) -> DataReply {
        let Some(Envelope { buffer, .. }) = self.envelope.as_mut() else {
            return DataReply::ReplyAndContinue(503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        buffer.extend_from_slice(data);

        if buffer.len() > self.max_message_size {
            debug!("failed to read message: message too big");
            self.envelope = None;

            return DataReply::ReplyAndContinue(552, Self::RESPONSE_MESSAGE_TOO_BIG.into());
        }

        const DATA_END: &[u8] = b"\r\n.\r\n";

        if buffer.ends_with(DATA_END) || buffer == &DATA_END[2..] {
            buffer.truncate(buffer.len() - DATA_END.len());

            let (code, message) = self.finalize_message().await;
            return DataReply::ReplyAndContinue(code, message);
        }

        DataReply::ContinueIngest
    }

    /// Persist the received message (body store first, inline fallback) and
    /// hand it to the delivery service with a short bounded retry.
    async fn finalize_message(&mut self) -> (u16, String) {
        let Some(auth) = self.auth.as_ref() else {
            return (530, Self::RESPONSE_AUTHENTICATION_REQUIRED.into());
        };
        let Some(envelope) = self.envelope.take() else {
            return (503, Self::RESPONSE_BAD_SEQUENCE.into());
        };

        let raw = envelope.buffer;
        trace!("received message ({} bytes)", raw.len());

        let mut new_message = NewMessage::new(
            auth.account_id,
            auth.group_id,
            envelope.sender.to_string(),
        );
        let message_id = new_message.id;
        new_message.recipients = envelope
            .recipients
            .iter()
            .map(|r| r.to_string())
            .collect();

        // subject and headers are captured best-effort at ingest; the worker
        // re-parses the authoritative body anyway
        if let Ok(parsed) = mime::parse(&raw) {
            new_message.subject = parsed.subject;
            new_message.headers = serde_json::Value::Object(parsed.headers);
        }

        match self.backend.store.put(message_id, &raw).await {
            Ok(()) => new_message.storage_ref = Some(message_id.to_string()),
            Err(e) => {
                // degraded mode: carry the body inline through the metadata
                // store
                warn!("message store unavailable, storing body inline: {e}");
                new_message.body = Some(raw.clone());
            }
        }

        if let Err(e) = self.backend.messages.create(&new_message).await {
            error!("failed to store message metadata: {e}");
            return (451, Self::RESPONSE_TEMPORARY_FAILURE.into());
        }

        let request = DeliveryRequest {
            message_id,
            account_id: auth.account_id,
            tenant_id: auth.group_id,
        };

        let mut last_error = None;
        for (attempt, delay) in DELIVER_RETRY_SCHEDULE.iter().enumerate() {
            match self.backend.delivery.deliver(request).await {
                Ok(()) => {
                    debug!(
                        message_id = message_id.to_string(),
                        "message accepted for delivery"
                    );
                    return (250, Self::RESPONSE_MESSAGE_ACCEPTED.into());
                }
                Err(e) => {
                    warn!(
                        message_id = message_id.to_string(),
                        attempt = attempt + 1,
                        "failed to hand off message: {e}"
                    );
                    last_error = Some(e);
                }
            }
            if attempt + 1 < DELIVER_RETRY_SCHEDULE.len() {
                tokio::time::sleep(*delay).await;
            }
        }

        error!(
            message_id = message_id.to_string(),
            "giving up on delivery hand-off: {}",
            last_error.map(|e| e.to_string()).unwrap_or_default()
        );
        self.backend
            .messages
            .set_status(message_id, MessageStatus::EnqueueFailed)
            .await
            .ok();

        (451, Self::RESPONSE_TEMPORARY_FAILURE.into())
    }
}
