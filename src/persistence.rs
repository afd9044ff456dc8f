//! The opaque key/value + append-log collaborator the core consumes.
//!
//! The core never assumes a concrete storage engine; it only relies on the
//! per-key atomicity and append-only guarantees described in spec.md §6.

use async_trait::async_trait;
use serde_json::Value;

/// Namespaces the core writes into. Kept as a closed enum (rather than a
/// free-form string) so a persistence implementation can map each to a
/// dedicated table/bucket without guessing at naming conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Registry,
    Activation,
    Config,
    ConfigHistory,
    OperationState,
    MigrationState,
    Audit,
}

impl Namespace {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::Activation => "activation",
            Self::Config => "config",
            Self::ConfigHistory => "config_history",
            Self::OperationState => "operation_state",
            Self::MigrationState => "migration_state",
            Self::Audit => "audit",
        }
    }
}

/// Durable key/value and append-log collaborator.
///
/// Implementations must guarantee per-key atomicity for `put`/`delete`. If
/// `txn` is unavailable, the core simulates atomic multi-key updates via
/// snapshot/restore (see `TenantConfigManager::update`).
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get(&self, ns: Namespace, key: &str) -> anyhow::Result<Option<Value>>;
    async fn put(&self, ns: Namespace, key: &str, value: Value) -> anyhow::Result<()>;
    async fn delete(&self, ns: Namespace, key: &str) -> anyhow::Result<()>;
    async fn list(&self, ns: Namespace, prefix: &str) -> anyhow::Result<Vec<(String, Value)>>;
    async fn append_log(&self, ns: Namespace, entry: Value) -> anyhow::Result<()>;
    async fn read_log(&self, ns: Namespace) -> anyhow::Result<Vec<Value>>;
}
