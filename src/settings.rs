//! Ambient tunables recognized by the core (spec.md §6), deserialized via
//! `serde` following the module-local `FooConfig` +
//! `#[serde(deny_unknown_fields)]` + `default_*()` convention.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActivationStrategy {
    Gradual,
    Instant,
    BlueGreen,
}

fn default_activation_strategy() -> ActivationStrategy {
    ActivationStrategy::Instant
}

fn default_activation_timeout_ms() -> u64 {
    30_000
}

fn default_validation_parallelism() -> usize {
    4
}

fn default_retry_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay_ms() -> u64 {
    5_000
}

fn default_audit_retention_days() -> u32 {
    90
}

fn default_config_history_max_per_tenant() -> usize {
    100
}

fn default_operation_cache_ttl_ms() -> u64 {
    60_000
}

fn default_max_audit_log_size() -> usize {
    10_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            delay_ms: default_retry_delay_ms(),
            multiplier: default_retry_multiplier(),
            max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub retention_days: u32,
    pub log_data_access: bool,
    pub log_config_changes: bool,
    pub log_theme_changes: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            retention_days: default_audit_retention_days(),
            log_data_access: true,
            log_config_changes: true,
            log_theme_changes: true,
        }
    }
}

/// Ambient settings recognized by the core (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CoreConfig {
    #[serde(default = "default_activation_strategy")]
    pub activation_strategy: ActivationStrategy,
    #[serde(default = "default_activation_timeout_ms")]
    pub activation_timeout_ms: u64,
    #[serde(default = "default_validation_parallelism")]
    pub validation_parallelism: usize,
    pub validation_retry: RetryConfig,
    pub audit: AuditConfig,
    #[serde(default = "default_config_history_max_per_tenant")]
    pub config_history_max_per_tenant: usize,
    #[serde(default = "default_operation_cache_ttl_ms")]
    pub operation_cache_default_ttl_ms: u64,
    #[serde(default = "default_max_audit_log_size")]
    pub security_max_audit_log_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            activation_strategy: default_activation_strategy(),
            activation_timeout_ms: default_activation_timeout_ms(),
            validation_parallelism: default_validation_parallelism(),
            validation_retry: RetryConfig::default(),
            audit: AuditConfig::default(),
            config_history_max_per_tenant: default_config_history_max_per_tenant(),
            operation_cache_default_ttl_ms: default_operation_cache_ttl_ms(),
            security_max_audit_log_size: default_max_audit_log_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_values() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.activation_timeout_ms, 30_000);
        assert_eq!(cfg.validation_parallelism, 4);
        assert_eq!(cfg.security_max_audit_log_size, 10_000);
    }

    #[test]
    fn deserializes_partial_overrides_with_remaining_defaults() {
        let cfg: CoreConfig = serde_json::from_str(r#"{"activation_timeout_ms": 5000}"#).unwrap();
        assert_eq!(cfg.activation_timeout_ms, 5000);
        assert_eq!(cfg.validation_parallelism, 4);
    }
}
