//! Activation Orchestrator (spec.md §4.1): drives a module through its
//! per-tenant lifecycle state machine via the 9-phase activation sequence
//! (and its mirrored deactivation), guarded by per-(module,tenant) mutual
//! exclusion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;

use crate::clock::Clock;
use crate::config::{ParentScope, SanitizeStep, TenantConfigManager};
use crate::error::{CoreError, CoreResult, ErrorDetail};
use crate::events::{Event, EventKind, EventSink};
use crate::migrations::{MigrationExecutor, MigrationManager, MigrationScope};
use crate::probe::{SystemProbe, SystemSnapshot};
use crate::registry::model::{DependencyKind, RegistryStatus};
use crate::registry::ModuleRegistry;
use crate::rollback::{
    build_plan, CompletedStep, ReverseStep, RetryPolicy, RollbackEngine, RollbackOutcome, SafetyCheck,
    SafetyCheckKind,
};
use crate::security::{AuthContext, Operation as SecurityOperation, TenantSecurity};
use crate::settings::ActivationStrategy;
use crate::validator::{ValidationContext, Validator, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ActivationState {
    Unregistered,
    Registered,
    Validating,
    Ready,
    Activating,
    Active,
    Deactivating,
    Inactive,
    Error,
    RollbackRequired,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActivationTransition {
    pub from: ActivationState,
    pub to: ActivationState,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ActivationRecord {
    pub module_id: String,
    pub tenant_id: String,
    pub state: ActivationState,
    pub transitions: Vec<ActivationTransition>,
}

impl ActivationRecord {
    fn new(module_id: &str, tenant_id: &str) -> Self {
        Self {
            module_id: module_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            state: ActivationState::Unregistered,
            transitions: vec![],
        }
    }
}

/// Structured outcome returned from `activate`/`deactivate` (spec.md §7).
#[derive(Debug, Clone)]
pub struct ActivationResult {
    pub success: bool,
    pub state: ActivationState,
    pub errors: Vec<ErrorDetail>,
    pub warnings: Vec<String>,
}

struct ReverseAdapter {
    executor: Arc<dyn MigrationExecutor>,
    module_id: String,
    migration_id: String,
    kind: crate::registry::model::OperationKind,
}

#[async_trait::async_trait]
impl ReverseStep for ReverseAdapter {
    async fn execute(&self, _ctx: &crate::operations::OperationContext) -> CoreResult<Value> {
        self.executor
            .execute_op(&self.module_id, &self.migration_id, self.kind, crate::migrations::Direction::Reverse)
            .await
    }
}

/// Derives the rollback engine's pre-flight safety checks from a live
/// system snapshot (spec.md §4.5). Only checks with a genuine signal in
/// `SystemSnapshot` are produced; there is no backup-presence signal here,
/// so `DataBackupPresent` is never fabricated.
fn safety_checks_from(snapshot: &SystemSnapshot) -> Vec<SafetyCheck> {
    vec![
        SafetyCheck {
            kind: SafetyCheckKind::ServiceHealthWithinRange,
            critical: true,
            passed: snapshot.health.score >= 50,
        },
        SafetyCheck {
            kind: SafetyCheckKind::ResourceAvailability,
            critical: true,
            passed: snapshot.resources.disk_pct < 95.0 && snapshot.resources.memory_pct < 95.0,
        },
        SafetyCheck {
            kind: SafetyCheckKind::DependencyCheck,
            critical: false,
            passed: snapshot.security.policies_enforced,
        },
    ]
}

pub struct Orchestrator {
    registry: Arc<ModuleRegistry>,
    security: Arc<TenantSecurity>,
    config: Arc<TenantConfigManager>,
    validator: Arc<Validator>,
    migrations: Arc<MigrationManager>,
    rollback: Arc<RollbackEngine>,
    probe: Arc<dyn SystemProbe>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    activation_strategy: ActivationStrategy,
    activation_timeout_ms: u64,
    retry_policy: RetryPolicy,
    records: DashMap<(String, String), ActivationRecord>,
    locks: DashMap<(String, String), Arc<AsyncMutex<()>>>,
}

impl Orchestrator {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ModuleRegistry>,
        security: Arc<TenantSecurity>,
        config: Arc<TenantConfigManager>,
        validator: Arc<Validator>,
        migrations: Arc<MigrationManager>,
        rollback: Arc<RollbackEngine>,
        probe: Arc<dyn SystemProbe>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        activation_strategy: ActivationStrategy,
        activation_timeout_ms: u64,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            security,
            config,
            validator,
            migrations,
            rollback,
            probe,
            events,
            clock,
            activation_strategy,
            activation_timeout_ms,
            retry_policy,
            records: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    #[must_use]
    pub fn status(&self, module_id: &str, tenant_id: &str) -> ActivationState {
        self.records
            .get(&(module_id.to_owned(), tenant_id.to_owned()))
            .map_or(ActivationState::Unregistered, |r| r.state)
    }

    fn lock_for(&self, module_id: &str, tenant_id: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .entry((module_id.to_owned(), tenant_id.to_owned()))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    fn transition(&self, module_id: &str, tenant_id: &str, to: ActivationState, reason: Option<String>) {
        let mut rec = self
            .records
            .entry((module_id.to_owned(), tenant_id.to_owned()))
            .or_insert_with(|| ActivationRecord::new(module_id, tenant_id));
        let from = rec.state;
        rec.state = to;
        rec.transitions.push(ActivationTransition { from, to, at: self.clock.now(), reason });
    }

    async fn emit(&self, kind: EventKind, module_id: &str, tenant_id: &str, payload: Value) {
        self.events
            .emit(Event { kind, module_id: module_id.to_owned(), tenant_id: tenant_id.to_owned(), timestamp: self.clock.now(), payload })
            .await;
    }

    fn is_active(&self, module_id: &str, tenant_id: &str) -> bool {
        self.status(module_id, tenant_id) == ActivationState::Active
    }

    /// Recomputes and publishes `tenant_id`'s active-module count to
    /// `TenantSecurity`, which uses it to warn as a tenant nears
    /// `max_active_modules` (spec.md §4.8).
    fn refresh_active_module_count(&self, tenant_id: &str) {
        let count = self
            .records
            .iter()
            .filter(|e| e.key().1 == tenant_id && e.state == ActivationState::Active)
            .count();
        self.security
            .set_active_module_count(tenant_id, u32::try_from(count).unwrap_or(u32::MAX));
    }

    /// Transitions every still-open per-tenant activation of `module_id` to
    /// `error`, called when the module's registration is revoked (spec.md
    /// §4.2: unregistering an owner must not leave dependents believing it
    /// is still live).
    pub async fn mark_owner_unregistered(&self, module_id: &str) {
        let open_tenants: Vec<String> = self
            .records
            .iter()
            .filter(|e| {
                e.key().0 == module_id
                    && !matches!(e.state, ActivationState::Inactive | ActivationState::Unregistered)
            })
            .map(|e| e.key().1.clone())
            .collect();

        for tenant_id in open_tenants {
            self.transition(
                module_id,
                &tenant_id,
                ActivationState::Error,
                Some("owner unregistered".to_owned()),
            );
            self.refresh_active_module_count(&tenant_id);
            self.emit(
                EventKind::Error,
                module_id,
                &tenant_id,
                serde_json::json!({ "reason": "owner unregistered" }),
            )
            .await;
        }
    }

    /// Drives the 9-phase activation sequence (spec.md §4.1), bounded by
    /// `activation_timeout_ms`. A cooperative `CancellationToken` is
    /// signaled once the deadline elapses; `activate_inner` checks it at
    /// the declared suspension point between migration steps, and the
    /// surrounding `select!` is the hard backstop if that check is never
    /// reached.
    pub async fn activate(
        &self,
        module_id: &str,
        tenant_id: &str,
        overlay: Map<String, Value>,
        ctx: &AuthContext,
        sanitize_steps: &[SanitizeStep],
        executor: Arc<dyn MigrationExecutor>,
    ) -> ActivationResult {
        let lock = self.lock_for(module_id, tenant_id);
        let _guard = lock.lock().await;

        let cancel = CancellationToken::new();
        let deadline_ms = self.activation_timeout_ms;
        let timer_token = cancel.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(deadline_ms)).await;
            timer_token.cancel();
        });

        let outcome = tokio::select! {
            result = self.activate_inner(module_id, tenant_id, overlay, ctx, sanitize_steps, executor, &cancel) => result,
            () = cancel.cancelled() => Err(CoreError::TimeoutError { elapsed_ms: deadline_ms, deadline_ms }),
        };
        timer.abort();

        match outcome {
            Ok(result) => result,
            Err(e) => {
                self.transition(module_id, tenant_id, ActivationState::Error, Some(e.to_string()));
                ActivationResult {
                    success: false,
                    state: ActivationState::Error,
                    errors: vec![ErrorDetail::from(&e)],
                    warnings: vec![],
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn activate_inner(
        &self,
        module_id: &str,
        tenant_id: &str,
        overlay: Map<String, Value>,
        ctx: &AuthContext,
        sanitize_steps: &[SanitizeStep],
        executor: Arc<dyn MigrationExecutor>,
        cancel: &CancellationToken,
    ) -> CoreResult<ActivationResult> {
        let mut overlay = overlay;
        let mut warnings = vec![];
        self.emit(EventKind::BeforeActivate, module_id, tenant_id, Value::Null).await;

        // 1. Resolution
        let entry = self.registry.get(module_id).ok_or_else(|| CoreError::StateError {
            message: format!("module '{module_id}' is not registered"),
        })?;
        if matches!(entry.status, RegistryStatus::Error | RegistryStatus::Unregistered) {
            return Err(CoreError::StateError {
                message: format!("module '{module_id}' is in status {:?}", entry.status),
            });
        }
        self.transition(module_id, tenant_id, ActivationState::Registered, None);

        // 2. Authorization
        self.security.authorize(ctx, tenant_id, SecurityOperation::ModuleActivate).await?;

        // 3. Config merge: an explicit `_inheritFromTenant` pointer is checked
        // against the tenant's security policy before any value is read, then
        // the declared inheritance policy resolves the module's own defaults
        // as the `ModuleDefault` parent scope (spec.md §4.7).
        let inherit_from_tenant = overlay
            .remove("_inheritFromTenant")
            .and_then(|v| v.as_str().map(str::to_owned));
        self.security
            .validate_inheritance_pointer(tenant_id, inherit_from_tenant.as_deref())?;

        let mut child = self.config.get_all(tenant_id, module_id).await?;
        for (k, v) in overlay {
            child.insert(k, v);
        }
        let default_map: Map<String, Value> = entry
            .definition
            .default_config
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let policy = self.config.policy_for(tenant_id);
        let effective = crate::config::inheritance::resolve(
            &policy,
            &child,
            &[(ParentScope::ModuleDefault, &default_map)],
        );
        let version = self
            .config
            .reuse_if_unchanged(tenant_id, module_id, effective, &entry.definition.config_schema, sanitize_steps)
            .await?;
        self.emit(EventKind::ConfigChanged, module_id, tenant_id, serde_json::json!({ "version": version.number })).await;

        // 4. Pre-activation validation
        self.transition(module_id, tenant_id, ActivationState::Validating, None);
        let snapshot = self.probe.snapshot().await.map_err(CoreError::Internal)?;
        let vctx = ValidationContext {
            module_id: module_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            config: version.value.clone(),
            snapshot,
        };
        let report = self.validator.validate(&vctx, true).await;
        if report.verdict == Verdict::Fail {
            return Err(CoreError::ValidationError {
                message: "pre-activation validation failed".to_owned(),
                context: module_id.to_owned(),
            });
        }

        // 5. Dependency gate
        let mut missing = vec![];
        for dep in &entry.definition.dependencies {
            let active = self.is_active(&dep.module_id, tenant_id);
            match dep.kind {
                DependencyKind::Required if !active => missing.push(format!("{} (not active)", dep.module_id)),
                DependencyKind::Conflicting if active => missing.push(format!("{} (conflicting, active)", dep.module_id)),
                DependencyKind::Optional if !active => warnings.push(format!("optional dependency '{}' is not active", dep.module_id)),
                _ => {}
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::DependencyError {
                message: format!("module '{module_id}' has unmet dependencies"),
                missing,
            });
        }
        self.emit(EventKind::DependencyResolved, module_id, tenant_id, Value::Null).await;
        self.transition(module_id, tenant_id, ActivationState::Ready, None);

        // 6 & 7. Plan construction + execution
        self.transition(module_id, tenant_id, ActivationState::Activating, None);
        let mut completed_forward: Vec<CompletedStep> = vec![];
        let mut forward_err = None;
        for migration in &entry.definition.migrations {
            if cancel.is_cancelled() {
                forward_err = Some(CoreError::TimeoutError {
                    elapsed_ms: self.activation_timeout_ms,
                    deadline_ms: self.activation_timeout_ms,
                });
                break;
            }
            match self
                .migrations
                .run_forward(migration, module_id, &MigrationScope::Tenant(tenant_id.to_owned()), Arc::clone(&executor))
                .await
            {
                Ok(outcome) => {
                    warnings.extend(outcome.warnings);
                    for (i, step_id) in outcome.completed_steps.iter().enumerate() {
                        let reverse = migration.reverse_ops.get(i).map(|kind| {
                            Arc::new(ReverseAdapter {
                                executor: Arc::clone(&executor),
                                module_id: module_id.to_owned(),
                                migration_id: migration.id.clone(),
                                kind: *kind,
                            }) as Arc<dyn ReverseStep>
                        });
                        completed_forward.push(CompletedStep { step_id: step_id.clone(), reverse });
                    }
                }
                Err(e) => {
                    forward_err = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = forward_err {
            self.emit(EventKind::Error, module_id, tenant_id, serde_json::json!({ "phase": "execution" })).await;
            return self.roll_back(module_id, tenant_id, completed_forward, e, version.value.clone()).await;
        }

        // 8. Post-activation validation
        let snapshot = self.probe.snapshot().await.map_err(CoreError::Internal)?;
        let vctx = ValidationContext {
            module_id: module_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            config: version.value.clone(),
            snapshot,
        };
        let post_report = self.validator.validate(&vctx, true).await;
        // BlueGreen activation flips live traffic onto the new instance, so
        // a mere warning is treated as blocking; Gradual/Instant proceed
        // through warnings as before (spec.md §6 `activationStrategy`).
        let post_fails = post_report.verdict == Verdict::Fail
            || (self.activation_strategy == ActivationStrategy::BlueGreen && post_report.verdict == Verdict::Warning);
        if post_fails {
            let e = CoreError::ValidationError {
                message: "post-activation validation failed".to_owned(),
                context: module_id.to_owned(),
            };
            return self.roll_back(module_id, tenant_id, completed_forward, e, version.value.clone()).await;
        }

        // 9. Commit
        self.transition(module_id, tenant_id, ActivationState::Active, None);
        self.registry.set_status(module_id, RegistryStatus::Active, None);
        self.refresh_active_module_count(tenant_id);
        self.emit(EventKind::AfterActivate, module_id, tenant_id, Value::Null).await;

        Ok(ActivationResult {
            success: true,
            state: ActivationState::Active,
            errors: vec![],
            warnings,
        })
    }

    /// Executes the rollback engine's plan with safety checks drawn from a
    /// live system snapshot, bracketed by pre- and post-rollback validation
    /// against the same config/snapshot pair the forward pass used
    /// (spec.md §4.5: pre/post-rollback validation is the orchestrator's
    /// responsibility as the party holding forward-state context).
    async fn roll_back(
        &self,
        module_id: &str,
        tenant_id: &str,
        completed: Vec<CompletedStep>,
        cause: CoreError,
        config: Map<String, Value>,
    ) -> CoreResult<ActivationResult> {
        let snapshot = self.probe.snapshot().await.map_err(CoreError::Internal)?;
        let pre_vctx = ValidationContext {
            module_id: module_id.to_owned(),
            tenant_id: tenant_id.to_owned(),
            config: config.clone(),
            snapshot: snapshot.clone(),
        };
        let pre_report = self.validator.validate(&pre_vctx, false).await;
        if pre_report.verdict == Verdict::Fail {
            tracing::warn!(module_id, tenant_id, "pre-rollback validation reported failures; proceeding best-effort");
        }

        let plan = build_plan(completed);
        let safety = safety_checks_from(&snapshot);
        let outcome = self
            .rollback
            .execute(&plan, &safety, self.retry_policy, module_id, tenant_id)
            .await;

        match outcome {
            RollbackOutcome::Restored => {
                let post_snapshot = self.probe.snapshot().await.map_err(CoreError::Internal)?;
                let post_vctx = ValidationContext {
                    module_id: module_id.to_owned(),
                    tenant_id: tenant_id.to_owned(),
                    config,
                    snapshot: post_snapshot,
                };
                let post_report = self.validator.validate(&post_vctx, false).await;
                if post_report.verdict == Verdict::Fail {
                    tracing::warn!(module_id, tenant_id, "post-rollback validation reported failures");
                }

                self.transition(module_id, tenant_id, ActivationState::Inactive, Some(cause.to_string()));
                self.refresh_active_module_count(tenant_id);
                Ok(ActivationResult {
                    success: false,
                    state: ActivationState::Inactive,
                    errors: vec![ErrorDetail::from(&cause)],
                    warnings: vec![],
                })
            }
            RollbackOutcome::RollbackRequired { reason } => {
                let err = CoreError::RollbackRequired {
                    module_id: module_id.to_owned(),
                    tenant_id: tenant_id.to_owned(),
                    reason,
                };
                self.transition(module_id, tenant_id, ActivationState::RollbackRequired, Some(err.to_string()));
                Err(err)
            }
            RollbackOutcome::Unsafe { reason } => {
                let err = CoreError::RollbackError { message: reason };
                self.transition(module_id, tenant_id, ActivationState::Error, Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Mirrors activation: rejects if a currently-active module declares
    /// this one as a required dependency for the tenant, then transitions
    /// the pair to `inactive`. Integration-point reservations are left
    /// alone — those are released only when the module itself is
    /// unregistered (`ModuleRegistry::unregister`).
    pub async fn deactivate(&self, module_id: &str, tenant_id: &str, ctx: &AuthContext) -> ActivationResult {
        let lock = self.lock_for(module_id, tenant_id);
        let _guard = lock.lock().await;

        match self.deactivate_inner(module_id, tenant_id, ctx).await {
            Ok(result) => result,
            Err(e) => ActivationResult {
                success: false,
                state: self.status(module_id, tenant_id),
                errors: vec![ErrorDetail::from(&e)],
                warnings: vec![],
            },
        }
    }

    async fn deactivate_inner(&self, module_id: &str, tenant_id: &str, ctx: &AuthContext) -> CoreResult<ActivationResult> {
        self.emit(EventKind::BeforeDeactivate, module_id, tenant_id, Value::Null).await;
        self.security.authorize(ctx, tenant_id, SecurityOperation::ModuleDeactivate).await?;

        let dependents: Vec<String> = self
            .registry
            .list_by_status(RegistryStatus::Active)
            .into_iter()
            .filter(|other| other != module_id)
            .filter(|other| {
                self.registry.get(other).is_some_and(|e| {
                    e.definition
                        .dependencies
                        .iter()
                        .any(|d| d.module_id == module_id && d.kind == DependencyKind::Required)
                })
            })
            .filter(|other| self.is_active(other, tenant_id))
            .collect();

        if !dependents.is_empty() {
            return Err(CoreError::DependencyError {
                message: format!("module '{module_id}' is a required dependency for active modules"),
                missing: dependents,
            });
        }

        self.transition(module_id, tenant_id, ActivationState::Deactivating, None);
        self.transition(module_id, tenant_id, ActivationState::Inactive, None);
        self.refresh_active_module_count(tenant_id);
        self.emit(EventKind::AfterDeactivate, module_id, tenant_id, Value::Null).await;

        Ok(ActivationResult {
            success: true,
            state: ActivationState::Inactive,
            errors: vec![],
            warnings: vec![],
        })
    }
}
