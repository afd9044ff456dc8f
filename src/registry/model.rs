//! Data model for module definitions and registry entries (spec.md §3).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DependencyKind {
    Required,
    Optional,
    Conflicting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDependency {
    pub module_id: String,
    pub version_req: String,
    pub kind: DependencyKind,
}

impl ModuleDependency {
    /// Parses the declared constraint; falls back to "any version" on a
    /// malformed requirement rather than rejecting registration outright,
    /// matching the spec's silence on malformed-constraint handling.
    #[must_use]
    pub fn requirement(&self) -> VersionReq {
        VersionReq::parse(&self.version_req).unwrap_or(VersionReq::STAR)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitySignature {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleCapability {
    pub id: String,
    pub category: String,
    pub required_capabilities: Vec<String>,
    pub signatures: Vec<CapabilitySignature>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntegrationPointKind {
    Route,
    Api,
    Component,
    Nav,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationPoint {
    pub kind: IntegrationPointKind,
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Date,
    Url,
    Email,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FieldConstraints {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<String>,
    pub enum_values: Option<Vec<Value>>,
    /// Name of a `CustomValidator` registered with the owning
    /// `TenantConfigManager` (spec.md §4.7 constraint shape
    /// `{min, max, pattern, enum, custom}`).
    pub custom: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFieldSchema {
    pub field_type: FieldType,
    #[serde(default)]
    pub constraints: FieldConstraints,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub inheritable: bool,
    pub default: Option<Value>,
}

/// Forward migration operation kinds. Destructive kinds are rejected at
/// registration time (spec.md §9 Open Questions, stricter-than-source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    CreateTable,
    AddColumn,
    AddIndex,
    AddConstraint,
    CreateView,
    CreateFunction,
    CreateTrigger,
    InsertRows,
    UpdateRows,
    Custom,
    // Destructive kinds: rejected by the registry's additive-discipline check.
    DropTable,
    DropColumn,
    NarrowType,
    DeleteRows,
}

impl OperationKind {
    #[must_use]
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            Self::DropTable | Self::DropColumn | Self::NarrowType | Self::DeleteRows
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDependency {
    pub migration_id: String,
    pub kind: DependencyKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceEnvelope {
    pub max_execution_ms: u64,
    pub max_lock_ms: u64,
}

impl Default for PerformanceEnvelope {
    fn default() -> Self {
        Self {
            max_execution_ms: 30_000,
            max_lock_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationDefinition {
    pub id: String,
    pub version: String,
    pub dependencies: Vec<MigrationDependency>,
    pub forward_ops: Vec<OperationKind>,
    pub reverse_ops: Vec<OperationKind>,
    #[serde(default)]
    pub performance: PerformanceEnvelope,
    /// When set, a failure in any of the migration execution sequence's
    /// later steps (data-integrity or post-migration validation) triggers
    /// a best-effort rollback of this migration's own completed steps
    /// before the error is returned (spec.md §4.4 `automaticRollback`).
    #[serde(default)]
    pub automatic_rollback: bool,
}

/// Immutable descriptor for a pluggable module (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    pub id: String,
    pub version: String,
    pub name: String,
    pub description: String,
    pub author: String,
    pub license: String,
    #[serde(default)]
    pub capabilities: Vec<ModuleCapability>,
    #[serde(default)]
    pub dependencies: Vec<ModuleDependency>,
    #[serde(default)]
    pub integration_points: Vec<IntegrationPoint>,
    #[serde(default)]
    pub config_schema: HashMap<String, ConfigFieldSchema>,
    #[serde(default)]
    pub default_config: HashMap<String, Value>,
    #[serde(default)]
    pub migrations: Vec<MigrationDefinition>,
    #[serde(default)]
    pub rollback_operations: Vec<String>,
}

impl ModuleDefinition {
    /// Parsed semver; falls back to `0.0.0` for a malformed version string
    /// rather than rejecting registration (constraint mismatches still
    /// surface as `DependencyError` during the orchestrator's dependency gate).
    #[must_use]
    pub fn semver(&self) -> Version {
        Version::parse(&self.version).unwrap_or(Version::new(0, 0, 0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationSource {
    Manual,
    Automatic,
    Marketplace,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistryStatus {
    Registered,
    Validating,
    Ready,
    Active,
    Error,
    Unregistered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: RegistryStatus,
    pub to: RegistryStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub registration_count: u64,
    pub access_count: u64,
}

/// Mutable pairing of a `ModuleDefinition` with its registration metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub definition: ModuleDefinition,
    pub registered_at: DateTime<Utc>,
    pub source: RegistrationSource,
    pub status: RegistryStatus,
    pub transitions: Vec<StatusTransition>,
    pub integrations: Vec<IntegrationPoint>,
    pub metrics: RegistryMetrics,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStatistics {
    pub total_modules: usize,
    pub by_status: HashMap<String, usize>,
    pub total_integrations: usize,
}
