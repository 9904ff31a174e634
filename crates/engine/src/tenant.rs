//! Tenant id resolution for new case instances.
//!
//! A new root takes the first tenant found in this order: the id passed by
//! the caller, the definition's tenant, the tenant of the calling execution
//! (for sub-instances), and finally the configured [`TenantIdProvider`].

use std::collections::BTreeMap;
use std::fmt;

use arbor_core::CaseDefinition;
use arbor_storage::ExecutionRecord;
use async_trait::async_trait;

// ──────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TenantProviderError {
    Provider(String),
}

impl fmt::Display for TenantProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TenantProviderError::Provider(msg) => write!(f, "tenant provider error: {}", msg),
        }
    }
}

impl std::error::Error for TenantProviderError {}

// ──────────────────────────────────────────────
// Trait
// ──────────────────────────────────────────────

/// What a provider sees when asked for a tenant.
pub struct TenantContext<'a> {
    pub definition: &'a CaseDefinition,
    /// Variables the instance is being created with.
    pub variables: &'a BTreeMap<String, serde_json::Value>,
    /// The case or process task starting this instance, if any.
    pub super_execution: Option<&'a ExecutionRecord>,
}

#[async_trait]
pub trait TenantIdProvider: Send + Sync {
    /// Return `None` to leave the instance without a tenant.
    async fn provide_tenant_id(
        &self,
        context: &TenantContext<'_>,
    ) -> Result<Option<String>, TenantProviderError>;
}

/// Assigns the same tenant to every instance it is asked about.
pub struct StaticTenantIdProvider {
    tenant_id: Option<String>,
}

impl StaticTenantIdProvider {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: Some(tenant_id.into()),
        }
    }

    pub fn none() -> Self {
        Self { tenant_id: None }
    }
}

#[async_trait]
impl TenantIdProvider for StaticTenantIdProvider {
    async fn provide_tenant_id(
        &self,
        _context: &TenantContext<'_>,
    ) -> Result<Option<String>, TenantProviderError> {
        Ok(self.tenant_id.clone())
    }
}

/// Apply the resolution order. The provider is only consulted when nothing
/// earlier in the chain supplies a tenant.
pub(crate) async fn resolve_tenant_id(
    explicit: Option<&str>,
    context: &TenantContext<'_>,
    provider: Option<&dyn TenantIdProvider>,
) -> Result<Option<String>, TenantProviderError> {
    if let Some(tenant) = explicit {
        return Ok(Some(tenant.to_string()));
    }
    if let Some(tenant) = context.definition.tenant_id() {
        return Ok(Some(tenant.to_string()));
    }
    if let Some(tenant) = context.super_execution.and_then(|s| s.tenant_id.as_deref()) {
        return Ok(Some(tenant.to_string()));
    }
    match provider {
        Some(provider) => provider.provide_tenant_id(context).await,
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::CaseDefinition;

    fn definition(tenant: Option<&str>) -> CaseDefinition {
        let tenant = tenant
            .map(|t| format!(r#""tenant_id": "{t}","#))
            .unwrap_or_default();
        CaseDefinition::from_json(&format!(
            r#"{{"id": "loan:1", "key": "loan", {tenant}
                "plan_model": {{"id": "plan", "type": "case_plan_model"}}}}"#
        ))
        .unwrap()
    }

    struct FailingProvider;

    #[async_trait]
    impl TenantIdProvider for FailingProvider {
        async fn provide_tenant_id(
            &self,
            _context: &TenantContext<'_>,
        ) -> Result<Option<String>, TenantProviderError> {
            Err(TenantProviderError::Provider("directory offline".to_string()))
        }
    }

    #[tokio::test]
    async fn explicit_tenant_wins() {
        let def = definition(Some("t-def"));
        let vars = BTreeMap::new();
        let ctx = TenantContext {
            definition: &def,
            variables: &vars,
            super_execution: None,
        };
        let provider = StaticTenantIdProvider::new("t-provider");
        let tenant = resolve_tenant_id(Some("t-explicit"), &ctx, Some(&provider))
            .await
            .unwrap();
        assert_eq!(tenant.as_deref(), Some("t-explicit"));
    }

    #[tokio::test]
    async fn definition_tenant_before_provider() {
        let def = definition(Some("t-def"));
        let vars = BTreeMap::new();
        let ctx = TenantContext {
            definition: &def,
            variables: &vars,
            super_execution: None,
        };
        let tenant = resolve_tenant_id(None, &ctx, Some(&FailingProvider))
            .await
            .unwrap();
        assert_eq!(tenant.as_deref(), Some("t-def"));
    }

    #[tokio::test]
    async fn provider_consulted_last() {
        let def = definition(None);
        let vars = BTreeMap::new();
        let ctx = TenantContext {
            definition: &def,
            variables: &vars,
            super_execution: None,
        };
        let provider = StaticTenantIdProvider::new("t-provider");
        let tenant = resolve_tenant_id(None, &ctx, Some(&provider)).await.unwrap();
        assert_eq!(tenant.as_deref(), Some("t-provider"));

        let err = resolve_tenant_id(None, &ctx, Some(&FailingProvider))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "tenant provider error: directory offline");
    }

    #[tokio::test]
    async fn no_provider_means_no_tenant() {
        let def = definition(None);
        let vars = BTreeMap::new();
        let ctx = TenantContext {
            definition: &def,
            variables: &vars,
            super_execution: None,
        };
        assert_eq!(resolve_tenant_id(None, &ctx, None).await.unwrap(), None);
    }
}
