//! Tenant Security & Audit (spec.md §4.8): authorization, data
//! sanitization at tenant boundaries, and an append-only audit trail.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::persistence::{Namespace, Persistence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigurationInheritance {
    None,
    DefaultOnly,
    Full,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditSettings {
    pub enabled: bool,
    pub log_data_access: bool,
    pub log_config_changes: bool,
    pub log_theme_changes: bool,
    pub retention_days: u32,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            log_data_access: true,
            log_config_changes: true,
            log_theme_changes: true,
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SecurityPolicy {
    pub allow_cross_tenant_access: bool,
    pub data_retention_days: u32,
    pub configuration_inheritance: ConfigurationInheritance,
    pub allow_theme_customize: bool,
    pub allow_module_configure: bool,
    pub allow_data_export: bool,
    pub allow_data_import: bool,
    pub max_active_modules: u32,
    pub max_storage_mb: u64,
    pub audit: AuditSettings,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            allow_cross_tenant_access: false,
            data_retention_days: 90,
            configuration_inheritance: ConfigurationInheritance::DefaultOnly,
            allow_theme_customize: true,
            allow_module_configure: true,
            allow_data_export: true,
            allow_data_import: true,
            max_active_modules: 50,
            max_storage_mb: 1024,
            audit: AuditSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ResourceType {
    Theme,
    Config,
    Module,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuditAction {
    Read,
    Write,
    Delete,
    Activate,
    Deactivate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Operation {
    ModuleActivate,
    ModuleDeactivate,
    ModuleConfigure,
    ThemeCustomize,
    DataExport,
    DataImport,
}

impl Operation {
    fn allowed_by(self, policy: &SecurityPolicy) -> bool {
        match self {
            Self::ModuleActivate | Self::ModuleDeactivate => true,
            Self::ModuleConfigure => policy.allow_module_configure,
            Self::ThemeCustomize => policy.allow_theme_customize,
            Self::DataExport => policy.allow_data_export,
            Self::DataImport => policy.allow_data_import,
        }
    }

    fn action(self) -> AuditAction {
        match self {
            Self::ModuleActivate => AuditAction::Activate,
            Self::ModuleDeactivate => AuditAction::Deactivate,
            Self::ModuleConfigure | Self::ThemeCustomize | Self::DataImport => AuditAction::Write,
            Self::DataExport => AuditAction::Read,
        }
    }

    fn resource_type(self) -> ResourceType {
        match self {
            Self::ModuleActivate | Self::ModuleDeactivate | Self::ModuleConfigure => ResourceType::Module,
            Self::ThemeCustomize => ResourceType::Theme,
            Self::DataExport | Self::DataImport => ResourceType::Data,
        }
    }
}

/// The identity and request metadata an authorization check is evaluated
/// against.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub actor_id: String,
    pub session_id: String,
    pub source: String,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor_id: String,
    pub operation: String,
    pub resource_type: ResourceType,
    pub resource_id: Option<String>,
    pub action: AuditAction,
    pub details: Value,
    pub success: bool,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub source: String,
}

const SENSITIVE_KEY_DENYLIST: &[&str] = &["password", "secret", "token", "apikey", "api_key", "credential"];
const INTERNAL_FIELDS: &[&str] = &["_internal", "__raw", "__meta"];
const MAX_STRING_LEN: usize = 1000;
const REDACTED: &str = "***redacted***";

/// Recursively sanitizes a JSON value at a tenant boundary (spec.md §4.8).
#[must_use]
pub fn sanitize_value(tenant_id: &str, value: &Value, allow_cross_tenant: bool) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            if let Some(owner) = map.get("tenantId").and_then(Value::as_str) {
                if owner != tenant_id && !allow_cross_tenant {
                    return Value::Null;
                }
            }
            for (k, v) in map {
                if INTERNAL_FIELDS.contains(&k.as_str()) {
                    continue;
                }
                if SENSITIVE_KEY_DENYLIST.iter().any(|d| k.to_lowercase().contains(d)) {
                    out.insert(k.clone(), Value::String(REDACTED.to_owned()));
                    continue;
                }
                out.insert(k.clone(), sanitize_value(tenant_id, v, allow_cross_tenant));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| sanitize_value(tenant_id, v, allow_cross_tenant))
                .filter(|v| !v.is_null())
                .collect(),
        ),
        Value::String(s) if s.len() > MAX_STRING_LEN => {
            Value::String(format!("{}...", &s[..MAX_STRING_LEN]))
        }
        other => other.clone(),
    }
}

pub struct TenantSecurity {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    policies: DashMap<String, SecurityPolicy>,
    active_module_counts: DashMap<String, u32>,
    audit_cap: usize,
    audit_ring: RwLock<VecDeque<AuditEntry>>,
    default_audit: AuditSettings,
}

impl TenantSecurity {
    #[must_use]
    pub fn new(
        persistence: Arc<dyn Persistence>,
        clock: Arc<dyn Clock>,
        audit_cap: usize,
        default_audit: AuditSettings,
    ) -> Self {
        Self {
            persistence,
            clock,
            policies: DashMap::new(),
            active_module_counts: DashMap::new(),
            audit_cap,
            audit_ring: RwLock::new(VecDeque::new()),
            default_audit,
        }
    }

    pub fn set_policy(&self, tenant_id: &str, policy: SecurityPolicy) {
        self.policies.insert(tenant_id.to_owned(), policy);
    }

    /// A tenant without an explicit policy falls back to
    /// `SecurityPolicy::default()` with its `audit` section replaced by the
    /// deployment-wide default from `CoreConfig.audit` (spec.md §6).
    #[must_use]
    pub fn policy_for(&self, tenant_id: &str) -> SecurityPolicy {
        self.policies.get(tenant_id).map(|p| p.clone()).unwrap_or_else(|| SecurityPolicy {
            audit: self.default_audit.clone(),
            ..SecurityPolicy::default()
        })
    }

    pub fn set_active_module_count(&self, tenant_id: &str, count: u32) {
        self.active_module_counts.insert(tenant_id.to_owned(), count);
    }

    async fn record(&self, entry: AuditEntry) -> CoreResult<()> {
        self.persistence
            .append_log(
                Namespace::Audit,
                serde_json::to_value(&entry).map_err(|e| CoreError::Internal(e.into()))?,
            )
            .await
            .map_err(CoreError::Internal)?;
        let tenant_id = entry.tenant_id.clone();
        {
            let mut ring = self.audit_ring.write();
            ring.push_back(entry);
            while ring.len() > self.audit_cap {
                ring.pop_front();
            }
        }
        self.evict_expired(&tenant_id);
        Ok(())
    }

    /// Authorizes `operation` against `target_tenant` on behalf of `ctx`,
    /// emitting an audit entry regardless of outcome (spec.md §4.8).
    ///
    /// # Errors
    /// Returns `CoreError::PermissionDenied` when cross-tenant access is
    /// forbidden or the policy's allow flag for `operation` is off.
    pub async fn authorize(
        &self,
        ctx: &AuthContext,
        target_tenant: &str,
        operation: Operation,
    ) -> CoreResult<()> {
        let policy = self.policy_for(target_tenant);
        let mut warnings = vec![];

        let result = if ctx.tenant_id != target_tenant && !policy.allow_cross_tenant_access {
            Err(CoreError::PermissionDenied {
                reason: format!(
                    "tenant '{}' may not access resources of tenant '{target_tenant}'",
                    ctx.tenant_id
                ),
            })
        } else if !operation.allowed_by(&policy) {
            Err(CoreError::PermissionDenied {
                reason: format!("operation {operation:?} is disabled by tenant policy"),
            })
        } else {
            if matches!(operation, Operation::ModuleActivate) {
                let current = self.active_module_counts.get(target_tenant).map_or(0, |c| *c);
                if current + 1 >= policy.max_active_modules {
                    warnings.push("approaching max_active_modules".to_owned());
                }
            }
            Ok(())
        };

        self.record(AuditEntry {
            id: Uuid::new_v4(),
            tenant_id: target_tenant.to_owned(),
            actor_id: ctx.actor_id.clone(),
            operation: format!("{operation:?}"),
            resource_type: operation.resource_type(),
            resource_id: None,
            action: operation.action(),
            details: serde_json::json!({ "warnings": warnings }),
            success: result.is_ok(),
            error_message: result.as_ref().err().map(std::string::ToString::to_string),
            timestamp: self.clock.now(),
            session_id: ctx.session_id.clone(),
            source: ctx.source.clone(),
        })
        .await?;

        result
    }

    /// Sanitizes `data` (owned by `tenant_id`) relative to the requesting
    /// `ctx.tenant_id`'s boundary, dropping any nested object tagged for a
    /// different tenant unless cross-tenant access is both policy-allowed
    /// and actually being exercised by the same tenant as the owner.
    #[must_use]
    pub fn sanitize(&self, tenant_id: &str, data: &Value, ctx: &AuthContext) -> Value {
        let policy = self.policy_for(tenant_id);
        let allow = policy.allow_cross_tenant_access && ctx.tenant_id == tenant_id;
        sanitize_value(&ctx.tenant_id, data, allow)
    }

    /// Rejects configuration writes whose inheritance pointer is
    /// incompatible with the tenant's `configurationInheritance` policy.
    ///
    /// # Errors
    /// Returns `CoreError::PermissionDenied` when the declared
    /// `inherit_from_tenant` is not the default tenant under `DefaultOnly`,
    /// or any inheritance is declared under `None`.
    pub fn validate_inheritance_pointer(
        &self,
        tenant_id: &str,
        inherit_from_tenant: Option<&str>,
    ) -> CoreResult<()> {
        let policy = self.policy_for(tenant_id);
        match (policy.configuration_inheritance, inherit_from_tenant) {
            (ConfigurationInheritance::None, Some(_)) => Err(CoreError::PermissionDenied {
                reason: "tenant's configurationInheritance policy is 'none'".to_owned(),
            }),
            (ConfigurationInheritance::DefaultOnly, Some(parent)) if parent != "default" => {
                Err(CoreError::PermissionDenied {
                    reason: "tenant's configurationInheritance policy allows only 'default'".to_owned(),
                })
            }
            _ => Ok(()),
        }
    }

    #[must_use]
    pub fn recent_audit_entries(&self) -> Vec<AuditEntry> {
        self.audit_ring.read().iter().cloned().collect()
    }

    /// Evicts ring entries older than the tenant's retention cutoff.
    pub fn evict_expired(&self, tenant_id: &str) {
        let policy = self.policy_for(tenant_id);
        let cutoff = self.clock.now() - chrono::Duration::days(i64::from(policy.data_retention_days));
        self.audit_ring
            .write()
            .retain(|e| e.tenant_id != tenant_id || e.timestamp >= cutoff);
    }

    /// Returns a 0-100 security health score with deductions for risky
    /// policy combinations (spec.md §4.8).
    #[must_use]
    pub fn health_check(&self, tenant_id: &str) -> (u8, Vec<String>) {
        let policy = self.policy_for(tenant_id);
        let mut score: i32 = 100;
        let mut recommendations = vec![];

        if policy.allow_cross_tenant_access {
            score -= 30;
            recommendations.push("disable cross-tenant access unless explicitly required".to_owned());
        }
        if !policy.audit.enabled {
            score -= 15;
            recommendations.push("enable audit logging".to_owned());
        }
        if policy.data_retention_days > 3650 {
            score -= 15;
            recommendations.push("data retention period is unusually long".to_owned());
        }
        if policy.data_retention_days < 7 {
            score -= 5;
            recommendations.push("data retention period is shorter than 7 days".to_owned());
        }

        (score.clamp(0, 100) as u8, recommendations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::testing::InMemoryPersistence;

    fn security() -> TenantSecurity {
        TenantSecurity::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(SystemClock),
            10_000,
            AuditSettings::default(),
        )
    }

    fn ctx(tenant: &str) -> AuthContext {
        AuthContext {
            tenant_id: tenant.to_owned(),
            actor_id: "actor1".to_owned(),
            session_id: "sess1".to_owned(),
            source: "api".to_owned(),
        }
    }

    #[tokio::test]
    async fn cross_tenant_denied_by_default() {
        let sec = security();
        let err = sec
            .authorize(&ctx("tB"), "tA", Operation::DataExport)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermissionDenied);
    }

    #[tokio::test]
    async fn same_tenant_allowed() {
        let sec = security();
        sec.authorize(&ctx("tA"), "tA", Operation::ModuleActivate)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_operation_denied() {
        let sec = security();
        let mut policy = SecurityPolicy::default();
        policy.allow_theme_customize = false;
        sec.set_policy("tA", policy);
        let err = sec
            .authorize(&ctx("tA"), "tA", Operation::ThemeCustomize)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PermissionDenied);
    }

    #[test]
    fn sanitize_drops_foreign_tenant_data() {
        let sec = security();
        let data = serde_json::json!({ "tenantId": "tB", "value": 1 });
        let out = sec.sanitize("tA", &data, &ctx("tA"));
        assert!(out.is_null());
    }

    #[test]
    fn sanitize_redacts_sensitive_keys() {
        let sec = security();
        let data = serde_json::json!({ "password": "hunter2", "name": "ok" });
        let out = sec.sanitize("tA", &data, &ctx("tA"));
        assert_eq!(out["password"], serde_json::json!(REDACTED));
        assert_eq!(out["name"], serde_json::json!("ok"));
    }

    #[tokio::test]
    async fn policy_for_unset_tenant_uses_configured_default_audit() {
        let sec = TenantSecurity::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(SystemClock),
            10_000,
            AuditSettings { retention_days: 3, ..AuditSettings::default() },
        );
        assert_eq!(sec.policy_for("tA").audit.retention_days, 3);
    }

    #[test]
    fn health_check_penalizes_cross_tenant_access() {
        let sec = security();
        let mut policy = SecurityPolicy::default();
        policy.allow_cross_tenant_access = true;
        sec.set_policy("tA", policy);
        let (score, recs) = sec.health_check("tA");
        assert!(score <= 70);
        assert!(!recs.is_empty());
    }
}
