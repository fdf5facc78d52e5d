use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{AccountId, Error, GroupId};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    From,
    Display,
    Deref,
    FromStr,
    sqlx::Type,
)]
#[sqlx(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// `queued → processing → {delivered | failed | storage_error | enqueue_failed}`.
///
/// `enqueue_failed` and `storage_error` are terminal; `failed` may be driven
/// back through `processing` by a dead-letter reprocess.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "message_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
    StorageError,
    EnqueueFailed,
}

/// Message metadata. The raw body lives either inline in `body` or in the
/// message store under `storage_ref`; exactly one of the two is set.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Message {
    id: MessageId,
    pub account_id: AccountId,
    pub group_id: GroupId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub headers: serde_json::Value,
    pub body: Option<Vec<u8>>,
    pub storage_ref: Option<String>,
    pub status: MessageStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn id(&self) -> MessageId {
        self.id
    }
}

#[derive(Debug)]
pub struct NewMessage {
    pub id: MessageId,
    pub account_id: AccountId,
    pub group_id: GroupId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub headers: serde_json::Value,
    pub body: Option<Vec<u8>>,
    pub storage_ref: Option<String>,
}

impl NewMessage {
    pub fn new(account_id: AccountId, group_id: GroupId, sender: String) -> Self {
        Self {
            id: MessageId::new(),
            account_id,
            group_id,
            sender,
            recipients: Vec::new(),
            subject: None,
            headers: serde_json::Value::Null,
            body: None,
            storage_ref: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageRepository {
    pool: sqlx::PgPool,
}

impl MessageRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, message: &NewMessage) -> Result<Message, Error> {
        let created = sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages (id, account_id, group_id, sender, recipients, subject, headers,
                                  body, storage_ref, status, retry_count)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', 0)
            RETURNING id, account_id, group_id, sender, recipients, subject, headers,
                      body, storage_ref, status, retry_count, created_at, updated_at
            "#,
        )
        .bind(message.id)
        .bind(message.account_id)
        .bind(message.group_id)
        .bind(&message.sender)
        .bind(&message.recipients)
        .bind(&message.subject)
        .bind(&message.headers)
        .bind(&message.body)
        .bind(&message.storage_ref)
        .fetch_one(&self.pool)
        .await?;

        Ok(created)
    }

    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, Error> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            SELECT id, account_id, group_id, sender, recipients, subject, headers,
                   body, storage_ref, status, retry_count, created_at, updated_at
            FROM messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(message)
    }

    pub async fn set_status(&self, id: MessageId, status: MessageStatus) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages SET status = $2, updated_at = now() WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_retry_count(&self, id: MessageId, retry_count: i32) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE messages SET retry_count = $2, updated_at = now() WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(retry_count)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
