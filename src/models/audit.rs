use crate::models::{AccountId, Error, GroupId};

/// Append-only audit trail. Writes are best-effort from the caller's point of
/// view; an audit failure must never fail the audited operation.
#[derive(Debug, Clone)]
pub struct AuditLogRepository {
    pool: sqlx::PgPool,
}

impl AuditLogRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        account_id: Option<AccountId>,
        group_id: Option<GroupId>,
        action: &str,
        detail: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, account_id, group_id, action, detail)
            VALUES (gen_random_uuid(), $1, $2, $3, $4)
            "#,
        )
        .bind(account_id)
        .bind(group_id)
        .bind(action)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
