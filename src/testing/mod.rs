//! In-process fakes for the four external collaborators, so higher-level
//! tests can assemble a full `Core` without a real store.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

use crate::clock::Clock;
use crate::events::{Event, EventSink};
use crate::persistence::{Namespace, Persistence};
use crate::probe::{
    CheckResult, HealthStatus, NetworkStatus, ResourceUsage, SecurityStatus, StorageStatus,
    SystemProbe, SystemSnapshot,
};

/// Clock whose wall-clock time can be advanced deterministically by tests.
pub struct FixedClock {
    millis: AtomicI64,
    started: Instant,
}

impl FixedClock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            millis: AtomicI64::new(0),
            started: Instant::now(),
        }
    }

    pub fn advance_ms(&self, ms: i64) {
        self.millis.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Default for FixedClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.millis.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms).single().unwrap_or(Utc::now())
    }

    fn monotonic_now(&self) -> Instant {
        self.started
    }
}

/// Flat key/value + append-log store backed by `DashMap`, scoped per namespace.
#[derive(Default)]
pub struct InMemoryPersistence {
    maps: DashMap<&'static str, DashMap<String, Value>>,
    logs: DashMap<&'static str, Mutex<Vec<Value>>>,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, ns: Namespace) -> dashmap::mapref::one::Ref<'_, &'static str, DashMap<String, Value>> {
        self.maps.entry(ns.as_str()).or_default();
        self.maps.get(ns.as_str()).expect("just inserted")
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn get(&self, ns: Namespace, key: &str) -> anyhow::Result<Option<Value>> {
        Ok(self.map(ns).get(key).map(|v| v.clone()))
    }

    async fn put(&self, ns: Namespace, key: &str, value: Value) -> anyhow::Result<()> {
        self.map(ns).insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, ns: Namespace, key: &str) -> anyhow::Result<()> {
        self.map(ns).remove(key);
        Ok(())
    }

    async fn list(&self, ns: Namespace, prefix: &str) -> anyhow::Result<Vec<(String, Value)>> {
        let mut out: Vec<(String, Value)> = self
            .map(ns)
            .iter()
            .filter(|kv| kv.key().starts_with(prefix))
            .map(|kv| (kv.key().clone(), kv.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    async fn append_log(&self, ns: Namespace, entry: Value) -> anyhow::Result<()> {
        self.logs
            .entry(ns.as_str())
            .or_default()
            .lock()
            .push(entry);
        Ok(())
    }

    async fn read_log(&self, ns: Namespace) -> anyhow::Result<Vec<Value>> {
        Ok(self
            .logs
            .get(ns.as_str())
            .map(|l| l.lock().clone())
            .unwrap_or_default())
    }
}

/// Event sink that records everything emitted, for assertions in tests.
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: Event) {
        self.events.lock().push(event);
    }
}

/// Probe that always reports a healthy, idle system.
#[derive(Debug, Default)]
pub struct StaticSystemProbe;

#[async_trait]
impl SystemProbe for StaticSystemProbe {
    async fn snapshot(&self) -> anyhow::Result<SystemSnapshot> {
        Ok(SystemSnapshot {
            resources: ResourceUsage {
                memory_pct: 20.0,
                cpu_pct: 10.0,
                disk_pct: 30.0,
                network_pct: 5.0,
                db_connections: 2,
                active_processes: 10,
            },
            health: HealthStatus {
                status: "healthy".to_owned(),
                score: 100,
                checks: vec![CheckResult {
                    name: "baseline".to_owned(),
                    passed: true,
                    detail: "ok".to_owned(),
                }],
            },
            network: NetworkStatus {
                connected: true,
                latency_ms: 5.0,
                bandwidth_mbps: 1000.0,
            },
            storage: StorageStatus { devices: vec![] },
            security: SecurityStatus {
                active_threats: 0,
                policies_enforced: true,
            },
        })
    }
}
