//! `Core`: the single composed value wiring every sub-component to its
//! injected collaborators (spec.md §9 "ambient globals → explicit
//! composition").

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::TenantConfigManager;
use crate::events::EventSink;
use crate::migrations::MigrationManager;
use crate::operations::OperationEngine;
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::probe::SystemProbe;
use crate::registry::ModuleRegistry;
use crate::rollback::RollbackEngine;
use crate::security::TenantSecurity;
use crate::settings::CoreConfig;
use crate::validator::{Rule, Validator};

/// The externally-injected collaborators (spec.md §1 "External
/// collaborators").
pub struct Collaborators {
    pub persistence: Arc<dyn Persistence>,
    pub clock: Arc<dyn Clock>,
    pub probe: Arc<dyn SystemProbe>,
    pub events: Arc<dyn EventSink>,
}

/// The fully composed platform core. Construct once at startup; every
/// sub-component is reached through this value rather than an ambient
/// singleton.
pub struct Core {
    pub registry: Arc<ModuleRegistry>,
    pub security: Arc<TenantSecurity>,
    pub config: Arc<TenantConfigManager>,
    pub validator: Arc<Validator>,
    pub operations: Arc<OperationEngine>,
    pub migrations: Arc<MigrationManager>,
    pub rollback: Arc<RollbackEngine>,
    pub orchestrator: Arc<Orchestrator>,
}

impl Core {
    /// Unregisters `module_id` and transitions every tenant's still-open
    /// activation for it to `error` (spec.md §4.2: unregistering an owner
    /// must not leave dependents believing the module is still live).
    ///
    /// # Errors
    /// Propagates `ModuleRegistry::unregister`'s error if the module is not
    /// registered.
    pub async fn unregister_module(&self, module_id: &str) -> crate::error::CoreResult<()> {
        self.registry.unregister(module_id).await?;
        self.orchestrator.mark_owner_unregistered(module_id).await;
        Ok(())
    }

    /// Wires every sub-component from `collaborators` and `settings`,
    /// honoring the dependency order from spec.md §2: Clock, Persistence,
    /// Event Sink → Audit → Tenant Security → Tenant Config Manager →
    /// Registry → Validator → Operation Engine → Rollback Engine →
    /// Migration Manager → Activation Orchestrator. The Rollback Engine is
    /// built before the Migration Manager because the latter now depends on
    /// it for automatic rollback of a failed migration's own steps.
    #[must_use]
    pub fn new(collaborators: Collaborators, settings: &CoreConfig, validation_rules: Vec<Rule>) -> Self {
        let Collaborators { persistence, clock, probe, events } = collaborators;

        let default_audit = crate::security::AuditSettings {
            enabled: settings.audit.enabled,
            log_data_access: settings.audit.log_data_access,
            log_config_changes: settings.audit.log_config_changes,
            log_theme_changes: settings.audit.log_theme_changes,
            retention_days: settings.audit.retention_days,
        };
        let security = Arc::new(TenantSecurity::new(
            Arc::clone(&persistence),
            Arc::clone(&clock),
            settings.security_max_audit_log_size,
            default_audit,
        ));
        let config = Arc::new(TenantConfigManager::new(
            Arc::clone(&persistence),
            Arc::clone(&clock),
            settings.config_history_max_per_tenant,
        ));
        let registry = Arc::new(ModuleRegistry::new(Arc::clone(&persistence), Arc::clone(&clock)));
        let validator = Arc::new(Validator::new(validation_rules, settings.validation_parallelism, 50));
        let operations = Arc::new(OperationEngine::new(Arc::clone(&clock), 50));
        let rollback = Arc::new(RollbackEngine::new(Arc::clone(&operations)));
        let migrations = Arc::new(MigrationManager::new(
            Arc::clone(&persistence),
            Arc::clone(&operations),
            Arc::clone(&rollback),
            Arc::clone(&clock),
        ));
        let retry_policy = crate::rollback::RetryPolicy {
            max_attempts: settings.validation_retry.max_attempts,
            initial_delay: std::time::Duration::from_millis(settings.validation_retry.delay_ms),
            multiplier: settings.validation_retry.multiplier,
            max_delay: std::time::Duration::from_millis(settings.validation_retry.max_delay_ms),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&registry),
            Arc::clone(&security),
            Arc::clone(&config),
            Arc::clone(&validator),
            Arc::clone(&migrations),
            Arc::clone(&rollback),
            probe,
            events,
            clock,
            settings.activation_strategy,
            settings.activation_timeout_ms,
            retry_policy,
        ));

        Self {
            registry,
            security,
            config,
            validator,
            operations,
            migrations,
            rollback,
            orchestrator,
        }
    }

    /// Exposes the tenant's security health score and recommendations
    /// (spec.md §4.8).
    #[must_use]
    pub fn security_health(&self, tenant_id: &str) -> (u8, Vec<String>) {
        self.security.health_check(tenant_id)
    }
}
