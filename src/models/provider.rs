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
pub struct ProviderId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "provider_kind", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[display(rename_all = "lowercase")]
pub enum ProviderKind {
    Sendgrid,
    Ses,
    Mailgun,
    Msgraph,
    Stdout,
    File,
}

/// The escape-hatch JSON blob on a provider row, parsed into a typed struct
/// at the boundary. Which fields matter depends on the provider kind.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub region: Option<String>,
    pub domain: Option<String>,
    pub tenant_id: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProviderRecord {
    pub id: ProviderId,
    pub group_id: GroupId,
    pub name: String,
    pub kind: ProviderKind,
    pub api_key: Option<String>,
    pub settings: serde_json::Value,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl ProviderRecord {
    pub fn settings(&self) -> Result<ProviderSettings, serde_json::Error> {
        if self.settings.is_null() {
            return Ok(ProviderSettings::default());
        }
        serde_json::from_value(self.settings.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRepository {
    pool: sqlx::PgPool,
}

impl ProviderRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// The provider the group currently sends through: the most recently
    /// created enabled row, or `None` when the group has no enabled provider.
    pub async fn enabled_for_group(
        &self,
        group_id: GroupId,
    ) -> Result<Option<ProviderRecord>, Error> {
        let record = sqlx::query_as::<_, ProviderRecord>(
            r#"
            SELECT id, group_id, name, kind, api_key, settings, enabled, created_at
            FROM esp_providers
            WHERE group_id = $1
              AND enabled
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn list_enabled(&self) -> Result<Vec<ProviderRecord>, Error> {
        let records = sqlx::query_as::<_, ProviderRecord>(
            r#"
            SELECT id, group_id, name, kind, api_key, settings, enabled, created_at
            FROM esp_providers
            WHERE enabled
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn settings_parse_ignores_missing_fields() {
        let record = ProviderRecord {
            id: ProviderId::from(Uuid::new_v4()),
            group_id: GroupId::new(),
            name: "graph-eu".into(),
            kind: ProviderKind::Msgraph,
            api_key: None,
            settings: serde_json::json!({
                "tenant_id": "contoso",
                "client_id": "app",
                "client_secret": "s3cret",
                "user_id": "noreply@contoso.com"
            }),
            enabled: true,
            created_at: Utc::now(),
        };

        let settings = record.settings().unwrap();
        assert_eq!(settings.tenant_id.as_deref(), Some("contoso"));
        assert_eq!(settings.region, None);
    }

    #[test]
    fn settings_parse_handles_null_blob() {
        let record = ProviderRecord {
            id: ProviderId::from(Uuid::new_v4()),
            group_id: GroupId::new(),
            name: "dev".into(),
            kind: ProviderKind::Stdout,
            api_key: None,
            settings: serde_json::Value::Null,
            enabled: true,
            created_at: Utc::now(),
        };

        assert!(record.settings().unwrap().region.is_none());
    }

    #[test]
    fn provider_kind_display_is_lowercase() {
        assert_eq!(ProviderKind::Sendgrid.to_string(), "sendgrid");
        assert_eq!(ProviderKind::Msgraph.to_string(), "msgraph");
    }
}
