use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::{health::HealthChecker, models::GroupId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRule {
    pub primary_provider: String,
    pub fallback_order: Vec<String>,
}

#[derive(Debug, Error, PartialEq)]
pub enum RoutingError {
    #[error("no routing rule configured for tenant")]
    NoRule,
    #[error("no healthy provider available")]
    NoHealthyProvider,
}

/// Name-based provider selection with health-gated fallback: the tenant rule
/// wins over the global default, the primary wins over the fallback chain,
/// and unhealthy providers are skipped.
pub struct RoutingEngine {
    health: Arc<HealthChecker>,
    default_rule: RwLock<Option<RoutingRule>>,
    tenant_rules: RwLock<HashMap<GroupId, RoutingRule>>,
}

impl RoutingEngine {
    pub fn new(health: Arc<HealthChecker>) -> Self {
        Self {
            health,
            default_rule: RwLock::new(None),
            tenant_rules: RwLock::new(HashMap::new()),
        }
    }

    pub async fn set_default_rule(&self, rule: RoutingRule) {
        *self.default_rule.write().await = Some(rule);
    }

    pub async fn set_rule(&self, tenant_id: GroupId, rule: RoutingRule) {
        self.tenant_rules.write().await.insert(tenant_id, rule);
    }

    pub async fn resolve_provider(&self, tenant_id: GroupId) -> Result<String, RoutingError> {
        let rule = match self.tenant_rules.read().await.get(&tenant_id) {
            Some(rule) => rule.clone(),
            None => self
                .default_rule
                .read()
                .await
                .clone()
                .ok_or(RoutingError::NoRule)?,
        };

        if self.health.is_healthy(&rule.primary_provider).await {
            return Ok(rule.primary_provider);
        }

        for fallback in &rule.fallback_order {
            if self.health.is_healthy(fallback).await {
                return Ok(fallback.clone());
            }
        }

        Err(RoutingError::NoHealthyProvider)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::health::test::SwitchableProvider;
    use std::time::Duration;

    async fn engine_with(providers: &[(&str, bool)]) -> RoutingEngine {
        let health = Arc::new(HealthChecker::new(
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));
        for (name, healthy) in providers {
            let provider = Arc::new(SwitchableProvider::new(name, *healthy));
            health.register(provider).await;
        }
        // three failed rounds take the unhealthy ones out of rotation
        for _ in 0..3 {
            health.check_all().await;
        }
        RoutingEngine::new(health)
    }

    fn default_rule() -> RoutingRule {
        RoutingRule {
            primary_provider: "sendgrid".into(),
            fallback_order: vec!["ses".into(), "mailgun".into()],
        }
    }

    #[tokio::test]
    async fn healthy_primary_wins() {
        let engine = engine_with(&[("sendgrid", true), ("ses", true)]).await;
        engine.set_default_rule(default_rule()).await;

        let name = engine.resolve_provider(GroupId::new()).await.unwrap();
        assert_eq!(name, "sendgrid");
    }

    #[tokio::test]
    async fn unhealthy_primary_falls_back_in_order() {
        let engine =
            engine_with(&[("sendgrid", false), ("ses", true), ("mailgun", true)]).await;
        engine.set_default_rule(default_rule()).await;

        let name = engine.resolve_provider(GroupId::new()).await.unwrap();
        assert_eq!(name, "ses");
    }

    #[tokio::test]
    async fn no_healthy_provider_errors() {
        let engine = engine_with(&[("sendgrid", false), ("ses", false)]).await;
        engine.set_default_rule(default_rule()).await;

        let err = engine.resolve_provider(GroupId::new()).await.unwrap_err();
        assert_eq!(err, RoutingError::NoHealthyProvider);
    }

    #[tokio::test]
    async fn unknown_fallback_names_are_skipped() {
        let engine = engine_with(&[("mailgun", true)]).await;
        engine.set_default_rule(default_rule()).await;

        // sendgrid and ses were never registered, so they count as unhealthy
        let name = engine.resolve_provider(GroupId::new()).await.unwrap();
        assert_eq!(name, "mailgun");
    }

    #[tokio::test]
    async fn tenant_rule_takes_precedence_over_default() {
        let engine = engine_with(&[("sendgrid", true), ("mailgun", true)]).await;
        engine.set_default_rule(default_rule()).await;

        let tenant = GroupId::new();
        engine
            .set_rule(
                tenant,
                RoutingRule {
                    primary_provider: "mailgun".into(),
                    fallback_order: vec![],
                },
            )
            .await;

        assert_eq!(engine.resolve_provider(tenant).await.unwrap(), "mailgun");
        assert_eq!(
            engine.resolve_provider(GroupId::new()).await.unwrap(),
            "sendgrid"
        );
    }

    #[tokio::test]
    async fn missing_rules_error() {
        let engine = engine_with(&[("sendgrid", true)]).await;
        let err = engine.resolve_provider(GroupId::new()).await.unwrap_err();
        assert_eq!(err, RoutingError::NoRule);
    }
}
