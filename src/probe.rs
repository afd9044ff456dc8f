//! System Probe: resource usage, health, network/storage status consumed
//! only by the Pre-Activation Validator (spec.md §6).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_pct: f64,
    pub cpu_pct: f64,
    pub disk_pct: f64,
    pub network_pct: f64,
    pub db_connections: u32,
    pub active_processes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub score: u8,
    pub checks: Vec<CheckResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub connected: bool,
    pub latency_ms: f64,
    pub bandwidth_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageDevice {
    pub name: String,
    pub capacity_pct: f64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub devices: Vec<StorageDevice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub active_threats: u32,
    pub policies_enforced: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSnapshot {
    pub resources: ResourceUsage,
    pub health: HealthStatus,
    pub network: NetworkStatus,
    pub storage: StorageStatus,
    pub security: SecurityStatus,
}

/// Reports resource usage, health, network/storage/security status.
#[async_trait]
pub trait SystemProbe: Send + Sync {
    async fn snapshot(&self) -> anyhow::Result<SystemSnapshot>;
}
