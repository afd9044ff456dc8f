//! Module Registry & Contract Validation (spec.md §4.2).
//!
//! Single source of truth for module definitions and ownership of
//! integration points. Conflict detection is performed before a
//! registration is committed; secondary indexes are rebuilt on every
//! successful write (registrations are rare relative to reads).

pub mod model;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::persistence::{Namespace, Persistence};

pub use model::{
    IntegrationPoint, IntegrationPointKind, ModuleDefinition, RegistrationSource, RegistryEntry,
    RegistryStatistics, RegistryStatus, StatusTransition,
};

/// How a registration conflict should be resolved by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Replace the prior owner outright.
    Override,
    /// Caller has renamed the conflicting path/id before retrying; unused
    /// here directly, but kept so call sites can express intent.
    Rename,
    /// Refuse; surfaces as `ConflictError`.
    Manual,
}

/// Contract requirements checked at registration time (spec.md §4.2).
fn check_contract(def: &ModuleDefinition) -> CoreResult<()> {
    if def.id.trim().is_empty() {
        return Err(CoreError::ValidationError {
            message: "module id must not be empty".to_owned(),
            context: "registry.register".to_owned(),
        });
    }
    if def.name.trim().is_empty() {
        return Err(CoreError::ValidationError {
            message: "module name must not be empty".to_owned(),
            context: "registry.register".to_owned(),
        });
    }
    if semver::Version::parse(&def.version).is_err() {
        return Err(CoreError::ValidationError {
            message: format!("module version '{}' is not valid semver", def.version),
            context: "registry.register".to_owned(),
        });
    }
    for m in &def.migrations {
        for op in m.forward_ops.iter().chain(m.reverse_ops.iter()) {
            if op.is_destructive() {
                return Err(CoreError::ValidationError {
                    message: format!(
                        "migration '{}' declares a destructive operation kind {op:?}; \
                         destructive changes must be expressed as a new additive migration",
                        m.id
                    ),
                    context: "registry.register".to_owned(),
                });
            }
        }
    }
    Ok(())
}

pub struct ModuleRegistry {
    persistence: Arc<dyn Persistence>,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, RegistryEntry>,
    by_capability: DashMap<String, Vec<String>>,
    // integration path -> owning module id
    path_owner: RwLock<HashMap<(model::IntegrationPointKind, String), String>>,
}

impl ModuleRegistry {
    #[must_use]
    pub fn new(persistence: Arc<dyn Persistence>, clock: Arc<dyn Clock>) -> Self {
        Self {
            persistence,
            clock,
            entries: DashMap::new(),
            by_capability: DashMap::new(),
            path_owner: RwLock::new(HashMap::new()),
        }
    }

    /// Finds the current owner of any of `def`'s declared integration points,
    /// excluding `def.id` itself (idempotent re-registration is allowed).
    fn find_conflict(&self, def: &ModuleDefinition) -> Option<(IntegrationPoint, String)> {
        let owners = self.path_owner.read();
        for point in &def.integration_points {
            if let Some(owner) = owners.get(&(point.kind, point.path.clone())) {
                if owner != &def.id {
                    return Some((point.clone(), owner.clone()));
                }
            }
        }
        None
    }

    /// Registers a module definition (spec.md §4.2).
    ///
    /// # Errors
    /// Returns `CoreError::ValidationError` if the contract is malformed,
    /// `CoreError::ConflictError` if `def.id` or any integration point is
    /// already owned and `resolution` is `Manual`.
    pub async fn register(
        &self,
        def: ModuleDefinition,
        source: RegistrationSource,
        resolution: ConflictResolution,
    ) -> CoreResult<()> {
        check_contract(&def)?;

        if self.entries.contains_key(&def.id) && resolution == ConflictResolution::Manual {
            return Err(CoreError::ConflictError {
                message: format!("module '{}' is already registered", def.id),
                owner: Some(def.id.clone()),
            });
        }

        if let Some((point, owner)) = self.find_conflict(&def) {
            if resolution == ConflictResolution::Manual {
                return Err(CoreError::ConflictError {
                    message: format!(
                        "integration point {:?}:'{}' already owned",
                        point.kind, point.path
                    ),
                    owner: Some(owner),
                });
            }
            // Override: revoke the prior owner's reservation of this exact point.
            if resolution == ConflictResolution::Override {
                self.path_owner
                    .write()
                    .remove(&(point.kind, point.path.clone()));
            }
        }

        let now = self.clock.now();
        let entry = RegistryEntry {
            definition: def.clone(),
            registered_at: now,
            source,
            status: RegistryStatus::Registered,
            transitions: vec![StatusTransition {
                from: RegistryStatus::Unregistered,
                to: RegistryStatus::Registered,
                at: now,
                reason: None,
            }],
            integrations: def.integration_points.clone(),
            metrics: model::RegistryMetrics {
                registration_count: 1,
                access_count: 0,
            },
        };

        // Commit integration reservations as a group (spec.md §5 shared-resource policy).
        {
            let mut owners = self.path_owner.write();
            for point in &def.integration_points {
                owners.insert((point.kind, point.path.clone()), def.id.clone());
            }
        }

        for cap in &def.capabilities {
            self.by_capability
                .entry(cap.id.clone())
                .or_default()
                .push(def.id.clone());
        }

        self.persistence
            .put(
                Namespace::Registry,
                &def.id,
                serde_json::to_value(&entry).map_err(|e| CoreError::Internal(e.into()))?,
            )
            .await
            .map_err(CoreError::Internal)?;

        tracing::info!(module_id = %def.id, "registration");
        self.entries.insert(def.id.clone(), entry);
        Ok(())
    }

    /// Unregisters a module: revokes all owned reservations; does not
    /// delete audit history (spec.md §4.2).
    ///
    /// # Errors
    /// Returns `CoreError::StateError` if the module is not registered.
    pub async fn unregister(&self, module_id: &str) -> CoreResult<()> {
        let Some((_, entry)) = self.entries.remove(module_id) else {
            return Err(CoreError::StateError {
                message: format!("module '{module_id}' is not registered"),
            });
        };

        self.path_owner
            .write()
            .retain(|_, owner| owner != module_id);

        for cap in &entry.definition.capabilities {
            if let Some(mut v) = self.by_capability.get_mut(&cap.id) {
                v.retain(|m| m != module_id);
            }
        }

        self.persistence
            .delete(Namespace::Registry, module_id)
            .await
            .map_err(CoreError::Internal)?;

        tracing::info!(module_id, "unregistration");
        Ok(())
    }

    #[must_use]
    pub fn get(&self, module_id: &str) -> Option<RegistryEntry> {
        self.entries.get(module_id).map(|e| {
            let mut entry = e.clone();
            entry.metrics.access_count += 1;
            entry
        })
    }

    #[must_use]
    pub fn list_by_capability(&self, capability_id: &str) -> Vec<String> {
        self.by_capability
            .get(capability_id)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn list_by_status(&self, status: RegistryStatus) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.status == status)
            .map(|e| e.key().clone())
            .collect()
    }

    /// Transitions a module's registry status, appending to its transition log.
    pub fn set_status(&self, module_id: &str, to: RegistryStatus, reason: Option<String>) {
        if let Some(mut e) = self.entries.get_mut(module_id) {
            let from = e.status;
            e.status = to;
            e.transitions.push(StatusTransition {
                from,
                to,
                at: self.clock.now(),
                reason,
            });
        }
    }

    #[must_use]
    pub fn statistics(&self) -> RegistryStatistics {
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut total_integrations = 0;
        for e in &self.entries {
            *by_status.entry(format!("{:?}", e.status)).or_insert(0) += 1;
            total_integrations += e.integrations.len();
        }
        RegistryStatistics {
            total_modules: self.entries.len(),
            by_status,
            total_integrations,
        }
    }

    /// Pulls candidate manifests from a caller-supplied source and feeds
    /// each through `register` as `Automatic`. Discovery never activates
    /// (spec.md §4.2).
    ///
    /// # Errors
    /// Propagates the first registration failure encountered.
    pub async fn discover(&self, candidates: Vec<ModuleDefinition>) -> CoreResult<Vec<String>> {
        let mut registered = Vec::new();
        for def in candidates {
            let id = def.id.clone();
            self.register(def, RegistrationSource::Automatic, ConflictResolution::Manual)
                .await?;
            registered.push(id);
        }
        Ok(registered)
    }
}

#[cfg(test)]
mod tests {
    use super::model::*;
    use super::*;
    use crate::clock::SystemClock;
    use crate::testing::InMemoryPersistence;

    fn def(id: &str) -> ModuleDefinition {
        ModuleDefinition {
            id: id.to_owned(),
            version: "1.0.0".to_owned(),
            name: id.to_owned(),
            description: String::new(),
            author: String::new(),
            license: "MIT".to_owned(),
            capabilities: vec![],
            dependencies: vec![],
            integration_points: vec![],
            config_schema: HashMap::new(),
            default_config: HashMap::new(),
            migrations: vec![],
            rollback_operations: vec![],
        }
    }

    fn registry() -> ModuleRegistry {
        ModuleRegistry::new(Arc::new(InMemoryPersistence::new()), Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn register_then_get_returns_same_definition() {
        let reg = registry();
        reg.register(def("m1"), RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap();
        let entry = reg.get("m1").unwrap();
        assert_eq!(entry.definition.id, "m1");
        assert_eq!(entry.status, RegistryStatus::Registered);
    }

    #[tokio::test]
    async fn duplicate_id_is_conflict() {
        let reg = registry();
        reg.register(def("m1"), RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap();
        let err = reg
            .register(def("m1"), RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConflictError);
    }

    #[tokio::test]
    async fn route_collision_names_current_owner() {
        let reg = registry();
        let mut a = def("m1");
        a.integration_points.push(IntegrationPoint {
            kind: IntegrationPointKind::Route,
            path: "/foo".to_owned(),
        });
        reg.register(a, RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap();

        let mut b = def("m2");
        b.integration_points.push(IntegrationPoint {
            kind: IntegrationPointKind::Route,
            path: "/foo".to_owned(),
        });
        let err = reg
            .register(b, RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap_err();
        match err {
            CoreError::ConflictError { owner, .. } => assert_eq!(owner.as_deref(), Some("m1")),
            other => panic!("expected ConflictError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn destructive_migration_kind_is_rejected() {
        let reg = registry();
        let mut m = def("m1");
        m.migrations.push(MigrationDefinition {
            id: "mig1".to_owned(),
            version: "1".to_owned(),
            dependencies: vec![],
            forward_ops: vec![OperationKind::DropTable],
            reverse_ops: vec![],
            performance: PerformanceEnvelope::default(),
            automatic_rollback: false,
        });
        let err = reg
            .register(m, RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }

    #[tokio::test]
    async fn unregister_revokes_reservations() {
        let reg = registry();
        let mut a = def("m1");
        a.integration_points.push(IntegrationPoint {
            kind: IntegrationPointKind::Route,
            path: "/foo".to_owned(),
        });
        reg.register(a, RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap();
        reg.unregister("m1").await.unwrap();
        assert!(reg.get("m1").is_none());

        // Path is free again.
        let mut b = def("m2");
        b.integration_points.push(IntegrationPoint {
            kind: IntegrationPointKind::Route,
            path: "/foo".to_owned(),
        });
        reg.register(b, RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn list_by_capability_and_status() {
        let reg = registry();
        let mut a = def("m1");
        a.capabilities.push(ModuleCapability {
            id: "cap.x".to_owned(),
            category: "misc".to_owned(),
            required_capabilities: vec![],
            signatures: vec![],
        });
        reg.register(a, RegistrationSource::Manual, ConflictResolution::Manual)
            .await
            .unwrap();

        assert_eq!(reg.list_by_capability("cap.x"), vec!["m1".to_owned()]);
        assert_eq!(
            reg.list_by_status(RegistryStatus::Registered),
            vec!["m1".to_owned()]
        );
    }
}
