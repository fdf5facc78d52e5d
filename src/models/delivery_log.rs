use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};

use crate::models::{Error, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "delivery_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Failed,
}

/// One append-only row per send attempt, success or failure.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DeliveryLog {
    pub message_id: MessageId,
    pub attempt_number: i32,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
    pub duration_ms: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct NewDeliveryLog {
    pub message_id: MessageId,
    pub attempt_number: i32,
    pub provider: String,
    pub provider_message_id: Option<String>,
    pub status: DeliveryStatus,
    pub duration_ms: i64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DeliveryLogRepository {
    pool: sqlx::PgPool,
}

impl DeliveryLogRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn append(&self, log: &NewDeliveryLog) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO delivery_logs (message_id, attempt_number, provider, provider_message_id,
                                       status, duration_ms, last_error)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(log.message_id)
        .bind(log.attempt_number)
        .bind(&log.provider)
        .bind(&log.provider_message_id)
        .bind(log.status)
        .bind(log.duration_ms)
        .bind(&log.last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn for_message(&self, message_id: MessageId) -> Result<Vec<DeliveryLog>, Error> {
        let logs = sqlx::query_as::<_, DeliveryLog>(
            r#"
            SELECT message_id, attempt_number, provider, provider_message_id,
                   status, duration_ms, last_error, created_at
            FROM delivery_logs
            WHERE message_id = $1
            ORDER BY attempt_number
            "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }
}
