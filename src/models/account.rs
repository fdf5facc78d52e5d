use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::types::chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Error, GroupId};

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
pub struct AccountId(Uuid);

impl AccountId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AccountId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "account_type", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    /// May only authenticate on the SMTP ingress.
    Smtp,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "account_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Account {
    id: AccountId,
    pub username: String,
    #[serde(skip)]
    password_hash: String,
    pub account_type: AccountType,
    pub status: AccountStatus,
    /// Sender domains this account may use in MAIL FROM. Empty means
    /// unrestricted.
    pub allowed_domains: Vec<String>,
    created_at: DateTime<Utc>,
}

impl Account {
    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn verify_password(&self, password: &str) -> bool {
        password_auth::verify_password(password.as_bytes(), &self.password_hash).is_ok()
    }

    pub fn can_authenticate_smtp(&self) -> bool {
        matches!(self.account_type, AccountType::Smtp)
            && matches!(self.status, AccountStatus::Active)
    }

    pub fn may_send_from(&self, domain: &str) -> bool {
        self.allowed_domains.is_empty()
            || self
                .allowed_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(domain))
    }
}

/// An account's membership of a group, joined with the group status so the
/// session can require an active group in one query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct GroupMembership {
    pub group_id: GroupId,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: sqlx::PgPool,
}

impl AccountRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        username: &str,
        password: &str,
        account_type: AccountType,
        allowed_domains: &[String],
    ) -> Result<Account, Error> {
        let password_hash = password_auth::generate_hash(password.as_bytes());

        let account = sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (id, username, password_hash, account_type, status, allowed_domains)
            VALUES (gen_random_uuid(), $1, $2, $3, 'active', $4)
            RETURNING id, username, password_hash, account_type, status, allowed_domains, created_at
            "#,
        )
        .bind(username)
        .bind(password_hash)
        .bind(account_type)
        .bind(allowed_domains)
        .fetch_one(&self.pool)
        .await?;

        Ok(account)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<Account>, Error> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, username, password_hash, account_type, status, allowed_domains, created_at
            FROM accounts
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    /// Memberships of active groups only. An account with no row here must
    /// not authenticate.
    pub async fn active_memberships(
        &self,
        account_id: AccountId,
    ) -> Result<Vec<GroupMembership>, Error> {
        let memberships = sqlx::query_as::<_, GroupMembership>(
            r#"
            SELECT m.group_id, m.role
            FROM group_members m
                JOIN groups g ON g.id = m.group_id
            WHERE m.account_id = $1
              AND g.status = 'active'
            ORDER BY g.created_at
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(memberships)
    }

    /// The group a message from this account is billed to: the first active
    /// membership.
    pub async fn primary_group(&self, account_id: AccountId) -> Result<Option<GroupId>, Error> {
        Ok(self
            .active_memberships(account_id)
            .await?
            .first()
            .map(|m| m.group_id))
    }
}
