//! Lifecycle event sink: a typed variant dispatched to an injected consumer,
//! never a dynamic string-keyed emitter (spec.md §9).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Canonical event kinds. Snake_case per the Open Question resolution in
/// DESIGN.md — no legacy alias set is carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EventKind {
    BeforeActivate,
    AfterActivate,
    BeforeDeactivate,
    AfterDeactivate,
    ConfigChanged,
    DependencyResolved,
    Error,
}

/// A single lifecycle event, with a module/tenant scope and opaque payload.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub module_id: String,
    pub tenant_id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

/// Receives lifecycle events for audit/telemetry purposes.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: Event);
}

/// Discards every event; used where no sink was configured.
#[derive(Debug, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: Event) {}
}
