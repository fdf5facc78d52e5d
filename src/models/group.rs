use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::Error;

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
pub struct GroupId(Uuid);

impl GroupId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for GroupId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "group_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    Active,
    Suspended,
}

/// A tenant. Every message, account membership and provider configuration
/// belongs to exactly one group.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub status: GroupStatus,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn is_active(&self) -> bool {
        matches!(self.status, GroupStatus::Active)
    }
}

#[derive(Debug, Clone)]
pub struct GroupRepository {
    pool: sqlx::PgPool,
}

impl GroupRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: GroupId) -> Result<Option<Group>, Error> {
        let group = sqlx::query_as::<_, Group>(
            r#"
            SELECT id, name, status, created_at FROM groups WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(group)
    }

    /// Ids of all active groups, used by the queue consumers to discover
    /// which tenant streams to read.
    pub async fn active_ids(&self) -> Result<Vec<GroupId>, Error> {
        let ids = sqlx::query_scalar::<_, GroupId>(
            r#"
            SELECT id FROM groups WHERE status = 'active' ORDER BY created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }
}
