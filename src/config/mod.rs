//! Tenant Configuration Manager (spec.md §4.7): namespaced, versioned,
//! schema-validated, sanitized, inheriting configuration.

pub mod inheritance;
pub mod sanitize;
pub mod schema;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::persistence::{Namespace, Persistence};
use crate::registry::model::ConfigFieldSchema;

pub use inheritance::{InheritancePolicy, InheritanceStrategy, ParentScope, ParentScopeRef};
pub use sanitize::{SanitizeRule, SanitizeStep};
pub use schema::CustomValidator;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_editor: Option<String>,
    pub tags: Vec<String>,
    pub environment: Option<String>,
    pub locked: bool,
    pub encrypted: bool,
}

impl ConfigMetadata {
    fn fresh(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            updated_at: now,
            last_editor: None,
            tags: vec![],
            environment: None,
            locked: false,
            encrypted: false,
        }
    }
}

/// An immutable configuration snapshot, hash-chained to its predecessor
/// (spec.md I5).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConfigVersion {
    pub id: Uuid,
    pub tenant_id: String,
    pub module_id: String,
    pub number: u64,
    pub value: Map<String, Value>,
    pub checksum: String,
    pub previous_version_id: Option<Uuid>,
    pub metadata: ConfigMetadata,
}

fn checksum(value: &Map<String, Value>) -> CoreResult<String> {
    let bytes = serde_json::to_vec(value).map_err(|e| CoreError::Internal(e.into()))?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn scope_key(tenant_id: &str, module_id: &str) -> String {
    format!("{tenant_id}::{module_id}")
}

fn version_key(tenant_id: &str, module_id: &str, number: u64) -> String {
    format!("{tenant_id}::{module_id}::{number:020}")
}

/// Per-tenant, per-module configuration store.
pub struct TenantConfigManager {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    current: DashMap<(String, String), ConfigVersion>,
    policies: DashMap<String, InheritancePolicy>,
    custom_validators: schema::CustomValidators,
    history_cap: usize,
}

impl TenantConfigManager {
    #[must_use]
    pub fn new(persistence: Arc<dyn Persistence>, clock: Arc<dyn Clock>, history_cap: usize) -> Self {
        Self {
            persistence,
            clock,
            current: DashMap::new(),
            policies: DashMap::new(),
            custom_validators: DashMap::new(),
            history_cap,
        }
    }

    pub fn set_policy(&self, tenant_id: &str, policy: InheritancePolicy) {
        self.policies.insert(tenant_id.to_owned(), policy);
    }

    /// Registers a named custom field validator (spec.md §4.7 constraint
    /// shape `{min, max, pattern, enum, custom}`); referenced from
    /// `FieldConstraints::custom` by name.
    pub fn register_custom_validator(&self, name: &str, validator: Arc<dyn CustomValidator>) {
        self.custom_validators.insert(name.to_owned(), validator);
    }

    #[must_use]
    pub fn policy_for(&self, tenant_id: &str) -> InheritancePolicy {
        self.policies
            .get(tenant_id)
            .map(|p| p.clone())
            .unwrap_or_else(InheritancePolicy::default_only)
    }

    /// Validates a candidate map against a module's declared schema.
    ///
    /// # Errors
    /// Returns `CoreError::ConfigValidationError` on the first violation.
    pub fn validate(
        &self,
        map: &Map<String, Value>,
        field_schema: &HashMap<String, ConfigFieldSchema>,
    ) -> CoreResult<()> {
        for (field, fs) in field_schema {
            if let Some(value) = map.get(field) {
                schema::validate_field(field, fs, value, &self.custom_validators)?;
            }
        }
        Ok(())
    }

    fn sanitized(map: &Map<String, Value>, steps: &[SanitizeStep]) -> Map<String, Value> {
        let mut out = map.clone();
        sanitize::sanitize_map(&mut out, steps);
        out
    }

    async fn load_current(&self, tenant_id: &str, module_id: &str) -> CoreResult<Option<ConfigVersion>> {
        if let Some(v) = self.current.get(&(tenant_id.to_owned(), module_id.to_owned())) {
            return Ok(Some(v.clone()));
        }
        let raw = self
            .persistence
            .get(Namespace::Config, &scope_key(tenant_id, module_id))
            .await
            .map_err(CoreError::Internal)?;
        match raw {
            Some(v) => {
                let version: ConfigVersion =
                    serde_json::from_value(v).map_err(|e| CoreError::Internal(e.into()))?;
                self.current.insert(
                    (tenant_id.to_owned(), module_id.to_owned()),
                    version.clone(),
                );
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    /// Returns the single field, falling back to `default` when unset.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub async fn get(
        &self,
        tenant_id: &str,
        module_id: &str,
        key: &str,
        default: Option<Value>,
    ) -> CoreResult<Option<Value>> {
        let current = self.load_current(tenant_id, module_id).await?;
        Ok(current
            .and_then(|v| v.value.get(key).cloned())
            .or(default))
    }

    /// Returns the full effective configuration map.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub async fn get_all(&self, tenant_id: &str, module_id: &str) -> CoreResult<Map<String, Value>> {
        Ok(self
            .load_current(tenant_id, module_id)
            .await?
            .map(|v| v.value)
            .unwrap_or_default())
    }

    /// Writes a single key, validating and sanitizing it against the
    /// module's schema, then emitting a new version (spec.md I5).
    ///
    /// # Errors
    /// Returns `CoreError::ConfigValidationError` if the field violates its
    /// schema, or a prior `CoreError::Internal` from persistence.
    pub async fn set(
        &self,
        tenant_id: &str,
        module_id: &str,
        key: &str,
        value: Value,
        field_schema: &HashMap<String, ConfigFieldSchema>,
        sanitize_steps: &[SanitizeStep],
    ) -> CoreResult<ConfigVersion> {
        let mut map = self.get_all(tenant_id, module_id).await?;
        map.insert(key.to_owned(), value);
        self.update(tenant_id, module_id, map, field_schema, sanitize_steps)
            .await
    }

    /// Deletes a single key by writing a new version without it.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub async fn delete(&self, tenant_id: &str, module_id: &str, key: &str) -> CoreResult<ConfigVersion> {
        let mut map = self.get_all(tenant_id, module_id).await?;
        map.remove(key);
        self.update(tenant_id, module_id, map, &HashMap::new(), &[]).await
    }

    /// Atomically replaces the full map: either the whole batch produces a
    /// single new version, or (on validation failure) nothing changes
    /// (spec.md §4.7 "update is atomic"). Every call that reaches the write
    /// path produces a new immutable version, even when the candidate is
    /// identical to the current one (spec.md I5) — callers that want to
    /// skip a genuine no-op write should use `reuse_if_unchanged` instead.
    ///
    /// # Errors
    /// Returns `CoreError::ConfigValidationError` if any field violates the
    /// schema; the pre-update state is left untouched.
    pub async fn update(
        &self,
        tenant_id: &str,
        module_id: &str,
        candidate: Map<String, Value>,
        field_schema: &HashMap<String, ConfigFieldSchema>,
        sanitize_steps: &[SanitizeStep],
    ) -> CoreResult<ConfigVersion> {
        let snapshot = self.load_current(tenant_id, module_id).await?;
        let sanitized = Self::sanitized(&candidate, sanitize_steps);
        if let Err(e) = self.validate(&sanitized, field_schema) {
            // Snapshot/restore: nothing was written yet, so restoring just
            // means returning the error without touching `self.current`.
            return Err(e);
        }

        let now = self.clock.now();
        let number = snapshot.as_ref().map_or(1, |v| v.number + 1);
        let version = ConfigVersion {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_owned(),
            module_id: module_id.to_owned(),
            number,
            checksum: checksum(&sanitized)?,
            value: sanitized,
            previous_version_id: snapshot.as_ref().map(|v| v.id),
            metadata: snapshot.map_or_else(
                || ConfigMetadata::fresh(now),
                |v| {
                    let mut m = v.metadata;
                    m.updated_at = now;
                    m
                },
            ),
        };

        self.persistence
            .put(
                Namespace::Config,
                &scope_key(tenant_id, module_id),
                serde_json::to_value(&version).map_err(|e| CoreError::Internal(e.into()))?,
            )
            .await
            .map_err(CoreError::Internal)?;
        self.persistence
            .put(
                Namespace::ConfigHistory,
                &version_key(tenant_id, module_id, number),
                serde_json::to_value(&version).map_err(|e| CoreError::Internal(e.into()))?,
            )
            .await
            .map_err(CoreError::Internal)?;

        self.prune_history(tenant_id, module_id).await?;

        self.current
            .insert((tenant_id.to_owned(), module_id.to_owned()), version.clone());
        Ok(version)
    }

    /// Like `update`, but returns the existing version unchanged when
    /// `candidate` sanitizes to the same checksum as the current one,
    /// instead of minting a new version. Reserved for the Activation
    /// Orchestrator's re-activation path, where re-merging an unchanged
    /// effective config on every activate would otherwise grow the history
    /// without bound; every other writer (`set`, `delete`, `import_config`)
    /// goes through `update` so every explicit write stays a new version
    /// (spec.md I5).
    ///
    /// # Errors
    /// Returns `CoreError::ConfigValidationError` if `candidate` violates
    /// the schema.
    pub async fn reuse_if_unchanged(
        &self,
        tenant_id: &str,
        module_id: &str,
        candidate: Map<String, Value>,
        field_schema: &HashMap<String, ConfigFieldSchema>,
        sanitize_steps: &[SanitizeStep],
    ) -> CoreResult<ConfigVersion> {
        let snapshot = self.load_current(tenant_id, module_id).await?;
        let sanitized = Self::sanitized(&candidate, sanitize_steps);
        self.validate(&sanitized, field_schema)?;
        if let Some(current) = &snapshot {
            if current.checksum == checksum(&sanitized)? {
                return Ok(current.clone());
            }
        }
        self.update(tenant_id, module_id, candidate, field_schema, sanitize_steps).await
    }

    async fn prune_history(&self, tenant_id: &str, module_id: &str) -> CoreResult<()> {
        let prefix = format!("{tenant_id}::{module_id}::");
        let mut entries = self
            .persistence
            .list(Namespace::ConfigHistory, &prefix)
            .await
            .map_err(CoreError::Internal)?;
        if entries.len() <= self.history_cap {
            return Ok(());
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        let excess = entries.len() - self.history_cap;
        for (key, _) in entries.into_iter().take(excess) {
            self.persistence
                .delete(Namespace::ConfigHistory, &key)
                .await
                .map_err(CoreError::Internal)?;
        }
        Ok(())
    }

    /// Returns the retained version history, oldest first.
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub async fn history(&self, tenant_id: &str, module_id: &str) -> CoreResult<Vec<ConfigVersion>> {
        let prefix = format!("{tenant_id}::{module_id}::");
        let entries = self
            .persistence
            .list(Namespace::ConfigHistory, &prefix)
            .await
            .map_err(CoreError::Internal)?;
        entries
            .into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(|e| CoreError::Internal(e.into())))
            .collect()
    }

    /// Restores a historical version's payload as a new forward version
    /// (history stays append-only; spec.md §4.7 rollback).
    ///
    /// # Errors
    /// Returns `CoreError::ConfigNotFoundError` if `version_id` is absent
    /// from the retained history.
    pub async fn rollback(
        &self,
        tenant_id: &str,
        module_id: &str,
        version_id: Uuid,
    ) -> CoreResult<ConfigVersion> {
        let history = self.history(tenant_id, module_id).await?;
        let target = history
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or_else(|| CoreError::ConfigNotFoundError {
                tenant_id: tenant_id.to_owned(),
                module_id: module_id.to_owned(),
                key: version_id.to_string(),
            })?;
        self.update(tenant_id, module_id, target.value, &HashMap::new(), &[]).await
    }

    /// Serializes the effective configuration. Only `"json"` is implemented
    /// at the core layer; other formats plug in at a format-adapter hook
    /// the caller supplies (spec.md §1 non-goals: "wire format ... an
    /// implementer's choice").
    ///
    /// # Errors
    /// Returns `CoreError::ValidationError` for an unsupported format tag.
    pub async fn export_config(&self, tenant_id: &str, module_id: &str, format: &str) -> CoreResult<String> {
        if format != "json" {
            return Err(CoreError::ValidationError {
                message: format!("unsupported export format '{format}'"),
                context: "config.export_config".to_owned(),
            });
        }
        let map = self.get_all(tenant_id, module_id).await?;
        serde_json::to_string_pretty(&map).map_err(|e| CoreError::Internal(e.into()))
    }

    /// Runs the full validate+sanitize pipeline over imported data and
    /// commits it atomically; any error rejects the whole import
    /// (spec.md §4.7).
    ///
    /// # Errors
    /// Returns `CoreError::ValidationError` for an unsupported format, or
    /// `CoreError::ConfigValidationError` if the parsed map fails schema.
    pub async fn import_config(
        &self,
        tenant_id: &str,
        module_id: &str,
        data: &str,
        format: &str,
        field_schema: &HashMap<String, ConfigFieldSchema>,
        sanitize_steps: &[SanitizeStep],
    ) -> CoreResult<ConfigVersion> {
        if format != "json" {
            return Err(CoreError::ValidationError {
                message: format!("unsupported import format '{format}'"),
                context: "config.import_config".to_owned(),
            });
        }
        let map: Map<String, Value> = serde_json::from_str(data).map_err(|e| CoreError::Internal(e.into()))?;
        self.update(tenant_id, module_id, map, field_schema, sanitize_steps)
            .await
    }
}
