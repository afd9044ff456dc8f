//! Additive Migration Manager (spec.md §4.4): ordered, dependency-aware,
//! additive-only schema/data transformations driven through the
//! Idempotent Operation Engine.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};
use crate::operations::{Operation, OperationContext, OperationEngine, OperationState};
use crate::persistence::{Namespace, Persistence};
use crate::registry::model::{DependencyKind, MigrationDefinition, OperationKind};
use crate::rollback::{build_plan, CompletedStep, RetryPolicy, ReverseStep, RollbackEngine, RollbackOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// The actual effect of a declared operation kind lives in module code; the
/// core only coordinates ordering, dependency gating, and idempotent
/// re-entry (spec.md §1 non-goals: "does NOT execute arbitrary module
/// business logic").
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    async fn execute_op(
        &self,
        module_id: &str,
        migration_id: &str,
        kind: OperationKind,
        direction: Direction,
    ) -> CoreResult<Value>;

    /// Step 1 of the execution sequence: pre-migration validation. Default
    /// passes; executors with genuine preconditions (schema compatibility,
    /// required extensions) should override.
    async fn pre_migration_validate(&self, module_id: &str, def: &MigrationDefinition) -> CoreResult<()> {
        let _ = (module_id, def);
        Ok(())
    }

    /// Step 4: data-integrity check after all forward ops have run.
    /// Default reports full tolerance; executors that can compare row
    /// counts or checksums should override.
    async fn check_data_integrity(&self, module_id: &str, def: &MigrationDefinition) -> CoreResult<IntegrityReport> {
        let _ = (module_id, def);
        Ok(IntegrityReport { within_tolerance: true, detail: "no integrity checks declared".to_owned() })
    }

    /// Step 5: post-migration validation. Default passes.
    async fn post_migration_validate(&self, module_id: &str, def: &MigrationDefinition) -> CoreResult<()> {
        let _ = (module_id, def);
        Ok(())
    }
}

/// Outcome of a migration's data-integrity check (spec.md §4.4 step 4).
#[derive(Debug, Clone)]
pub struct IntegrityReport {
    pub within_tolerance: bool,
    pub detail: String,
}

/// The scope a migration's completion is tracked under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MigrationScope {
    Global,
    Tenant(String),
    Module,
}

impl MigrationScope {
    fn as_key(&self) -> String {
        match self {
            Self::Global => "global".to_owned(),
            Self::Tenant(t) => format!("tenant:{t}"),
            Self::Module => "module".to_owned(),
        }
    }
}

struct MigrationOp {
    executor: Arc<dyn MigrationExecutor>,
    migration_id: String,
    kind: OperationKind,
    direction: Direction,
    step_id: String,
}

#[async_trait]
impl Operation for MigrationOp {
    fn id(&self) -> &str {
        &self.step_id
    }

    async fn execute(&self, ctx: &OperationContext) -> CoreResult<Value> {
        self.executor
            .execute_op(&ctx.module_id, &self.migration_id, self.kind, self.direction)
            .await
    }

    async fn check_state(&self, _ctx: &OperationContext) -> CoreResult<OperationState> {
        Ok(OperationState::NotExecuted)
    }
}

struct MigrationReverseStep {
    executor: Arc<dyn MigrationExecutor>,
    migration_id: String,
    kind: OperationKind,
}

#[async_trait]
impl ReverseStep for MigrationReverseStep {
    async fn execute(&self, ctx: &OperationContext) -> CoreResult<Value> {
        self.executor.execute_op(&ctx.module_id, &self.migration_id, self.kind, Direction::Reverse).await
    }
}

/// Result of running a single migration.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub migration_id: String,
    pub completed_steps: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct MigrationManager {
    persistence: Arc<dyn Persistence>,
    operations: Arc<OperationEngine>,
    rollback: Arc<RollbackEngine>,
    #[allow(dead_code)]
    clock: Arc<dyn Clock>,
    completed: DashMap<(String, String), bool>,
}

impl MigrationManager {
    #[must_use]
    pub fn new(
        persistence: Arc<dyn Persistence>,
        operations: Arc<OperationEngine>,
        rollback: Arc<RollbackEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            operations,
            rollback,
            clock,
            completed: DashMap::new(),
        }
    }

    /// Best-effort automatic rollback of a migration's own completed steps
    /// (spec.md §4.4 `automaticRollback`), invoked when data-integrity or
    /// post-migration validation fails after the forward pass committed.
    /// Failures here are logged, not propagated — the caller already has a
    /// `MigrationError` to return and this is a secondary remediation.
    async fn auto_rollback(
        &self,
        module_id: &str,
        scope: &MigrationScope,
        def: &MigrationDefinition,
        completed_steps: &[String],
        executor: &Arc<dyn MigrationExecutor>,
    ) {
        let steps: Vec<CompletedStep> = completed_steps
            .iter()
            .enumerate()
            .map(|(i, step_id)| {
                let reverse = def.reverse_ops.get(i).map(|kind| {
                    Arc::new(MigrationReverseStep {
                        executor: Arc::clone(executor),
                        migration_id: def.id.clone(),
                        kind: *kind,
                    }) as Arc<dyn ReverseStep>
                });
                CompletedStep { step_id: step_id.clone(), reverse }
            })
            .collect();
        let plan = build_plan(steps);
        let outcome = self
            .rollback
            .execute(&plan, &[], RetryPolicy::default(), module_id, &scope.as_key())
            .await;
        match outcome {
            RollbackOutcome::Restored => {
                tracing::info!(migration_id = %def.id, "automatic rollback restored prior state");
            }
            RollbackOutcome::RollbackRequired { reason } => {
                tracing::error!(migration_id = %def.id, reason, "automatic rollback failed, manual intervention required");
            }
            RollbackOutcome::Unsafe { reason } => {
                tracing::error!(migration_id = %def.id, reason, "automatic rollback deemed unsafe, skipped");
            }
        }
    }

    fn is_completed(&self, scope: &MigrationScope, migration_id: &str) -> bool {
        self.completed
            .get(&(scope.as_key(), migration_id.to_owned()))
            .map(|v| *v)
            .unwrap_or(false)
    }

    async fn mark_completed(&self, scope: &MigrationScope, migration_id: &str) -> CoreResult<()> {
        self.completed.insert((scope.as_key(), migration_id.to_owned()), true);
        self.persistence
            .put(
                Namespace::MigrationState,
                &format!("{}::{}", scope.as_key(), migration_id),
                serde_json::json!({ "completed": true }),
            )
            .await
            .map_err(CoreError::Internal)
    }

    /// Restores completion state from persistence (called once at startup).
    ///
    /// # Errors
    /// Propagates persistence failures.
    pub async fn hydrate(&self, scope: &MigrationScope) -> CoreResult<()> {
        let entries = self
            .persistence
            .list(Namespace::MigrationState, &format!("{}::", scope.as_key()))
            .await
            .map_err(CoreError::Internal)?;
        for (key, value) in entries {
            if value.get("completed").and_then(Value::as_bool) == Some(true) {
                if let Some(migration_id) = key.strip_prefix(&format!("{}::", scope.as_key())) {
                    self.completed.insert((scope.as_key(), migration_id.to_owned()), true);
                }
            }
        }
        Ok(())
    }

    /// Runs the declared dependency check for `def` against `scope`
    /// (spec.md §4.4).
    ///
    /// # Errors
    /// Returns `CoreError::DependencyError` if a required dependency is
    /// incomplete, or a conflicting one has already run.
    pub fn check_dependencies(&self, def: &MigrationDefinition, scope: &MigrationScope) -> CoreResult<Vec<String>> {
        let mut warnings = vec![];
        let mut missing = vec![];
        for dep in &def.dependencies {
            let completed = self.is_completed(scope, &dep.migration_id);
            match dep.kind {
                DependencyKind::Required if !completed => missing.push(dep.migration_id.clone()),
                DependencyKind::Optional if !completed => {
                    warnings.push(format!("optional dependency '{}' has not run", dep.migration_id));
                }
                DependencyKind::Conflicting if completed => {
                    missing.push(format!("conflicting migration '{}' has already run", dep.migration_id));
                }
                _ => {}
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::DependencyError {
                message: format!("migration '{}' has unmet dependencies", def.id),
                missing,
            });
        }
        Ok(warnings)
    }

    /// Runs `def`'s full 5-step execution sequence through the Operation
    /// Engine (spec.md §4.4): pre-migration validation, dependency
    /// resolution, forward-op execution, data-integrity check, then
    /// post-migration validation. Re-applying a completed version is a
    /// no-op. A failure at step 4 or 5 triggers a best-effort automatic
    /// rollback of this migration's own completed steps when
    /// `def.automatic_rollback` is set.
    ///
    /// # Errors
    /// Returns `CoreError::MigrationError` if pre/post-migration validation,
    /// a forward operation, or the data-integrity check fails, or
    /// `CoreError::DependencyError` from `check_dependencies`.
    pub async fn run_forward(
        &self,
        def: &MigrationDefinition,
        module_id: &str,
        scope: &MigrationScope,
        executor: Arc<dyn MigrationExecutor>,
    ) -> CoreResult<MigrationOutcome> {
        if self.is_completed(scope, &def.id) {
            return Ok(MigrationOutcome {
                migration_id: def.id.clone(),
                completed_steps: vec![],
                warnings: vec!["already completed; no-op".to_owned()],
            });
        }

        // 1. Pre-migration validation
        executor.pre_migration_validate(module_id, def).await.map_err(|e| CoreError::MigrationError {
            migration_id: def.id.clone(),
            message: format!("pre-migration validation failed: {e}"),
        })?;

        // 2. Dependency resolution
        let warnings = self.check_dependencies(def, scope)?;

        // 3. Forward-op execution
        let mut completed_steps = Vec::new();
        for (i, kind) in def.forward_ops.iter().enumerate() {
            let step_id = format!("{}::fwd::{i}", def.id);
            let op = MigrationOp {
                executor: Arc::clone(&executor),
                migration_id: def.id.clone(),
                kind: *kind,
                direction: Direction::Forward,
                step_id: step_id.clone(),
            };
            let ctx = OperationContext {
                operation_id: step_id.clone(),
                module_id: module_id.to_owned(),
                tenant_id: scope.as_key(),
                params: Value::Null,
            };
            if let Err(e) = self.operations.run(&op, &ctx).await {
                if def.automatic_rollback {
                    self.auto_rollback(module_id, scope, def, &completed_steps, &executor).await;
                }
                return Err(CoreError::MigrationError { migration_id: def.id.clone(), message: e.to_string() });
            }
            completed_steps.push(step_id);
        }

        // 4. Data-integrity check
        let integrity = executor.check_data_integrity(module_id, def).await.map_err(|e| CoreError::MigrationError {
            migration_id: def.id.clone(),
            message: format!("data integrity check errored: {e}"),
        })?;
        if !integrity.within_tolerance {
            if def.automatic_rollback {
                self.auto_rollback(module_id, scope, def, &completed_steps, &executor).await;
            }
            return Err(CoreError::MigrationError {
                migration_id: def.id.clone(),
                message: format!("data integrity check failed: {}", integrity.detail),
            });
        }

        // 5. Post-migration validation
        if let Err(e) = executor.post_migration_validate(module_id, def).await {
            if def.automatic_rollback {
                self.auto_rollback(module_id, scope, def, &completed_steps, &executor).await;
            }
            return Err(CoreError::MigrationError {
                migration_id: def.id.clone(),
                message: format!("post-migration validation failed: {e}"),
            });
        }

        self.mark_completed(scope, &def.id).await?;

        Ok(MigrationOutcome {
            migration_id: def.id.clone(),
            completed_steps,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::registry::model::{MigrationDependency, PerformanceEnvelope};
    use crate::testing::InMemoryPersistence;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExecutor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl MigrationExecutor for CountingExecutor {
        async fn execute_op(
            &self,
            _module_id: &str,
            _migration_id: &str,
            _kind: OperationKind,
            _direction: Direction,
        ) -> CoreResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn manager() -> MigrationManager {
        let persistence = Arc::new(InMemoryPersistence::new());
        let ops = Arc::new(OperationEngine::new(Arc::new(SystemClock), 10));
        let rollback = Arc::new(RollbackEngine::new(Arc::clone(&ops)));
        MigrationManager::new(persistence, ops, rollback, Arc::new(SystemClock))
    }

    fn def(id: &str, deps: Vec<MigrationDependency>) -> MigrationDefinition {
        MigrationDefinition {
            id: id.to_owned(),
            version: "1".to_owned(),
            dependencies: deps,
            forward_ops: vec![OperationKind::CreateTable, OperationKind::AddIndex],
            reverse_ops: vec![],
            performance: PerformanceEnvelope::default(),
            automatic_rollback: false,
        }
    }

    #[tokio::test]
    async fn forward_runs_each_op_once() {
        let mgr = manager();
        let executor = Arc::new(CountingExecutor { calls: AtomicU32::new(0) });
        let outcome = mgr
            .run_forward(&def("mig1", vec![]), "M1", &MigrationScope::Global, executor.clone())
            .await
            .unwrap();
        assert_eq!(outcome.completed_steps.len(), 2);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn rerunning_completed_migration_is_a_no_op() {
        let mgr = manager();
        let executor = Arc::new(CountingExecutor { calls: AtomicU32::new(0) });
        mgr.run_forward(&def("mig1", vec![]), "M1", &MigrationScope::Global, executor.clone())
            .await
            .unwrap();
        let second = mgr
            .run_forward(&def("mig1", vec![]), "M1", &MigrationScope::Global, executor.clone())
            .await
            .unwrap();
        assert!(second.completed_steps.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_required_dependency_blocks_migration() {
        let mgr = manager();
        let executor = Arc::new(CountingExecutor { calls: AtomicU32::new(0) });
        let deps = vec![MigrationDependency { migration_id: "mig0".to_owned(), kind: DependencyKind::Required }];
        let err = mgr
            .run_forward(&def("mig1", deps), "M1", &MigrationScope::Global, executor)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyError);
    }

    struct IntegrityFailingExecutor;

    #[async_trait]
    impl MigrationExecutor for IntegrityFailingExecutor {
        async fn execute_op(
            &self,
            _module_id: &str,
            _migration_id: &str,
            _kind: OperationKind,
            _direction: Direction,
        ) -> CoreResult<Value> {
            Ok(Value::Null)
        }

        async fn check_data_integrity(&self, _module_id: &str, _def: &MigrationDefinition) -> CoreResult<IntegrityReport> {
            Ok(IntegrityReport { within_tolerance: false, detail: "row count mismatch".to_owned() })
        }
    }

    #[tokio::test]
    async fn data_integrity_failure_blocks_completion_and_triggers_auto_rollback() {
        let mgr = manager();
        let mut migration = def("mig1", vec![]);
        migration.automatic_rollback = true;
        let err = mgr
            .run_forward(&migration, "M1", &MigrationScope::Global, Arc::new(IntegrityFailingExecutor))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MigrationError);
        assert!(!mgr.is_completed(&MigrationScope::Global, "mig1"));
    }

    struct PreValidationFailingExecutor;

    #[async_trait]
    impl MigrationExecutor for PreValidationFailingExecutor {
        async fn execute_op(
            &self,
            _module_id: &str,
            _migration_id: &str,
            _kind: OperationKind,
            _direction: Direction,
        ) -> CoreResult<Value> {
            Ok(Value::Null)
        }

        async fn pre_migration_validate(&self, _module_id: &str, _def: &MigrationDefinition) -> CoreResult<()> {
            Err(CoreError::ValidationError { message: "precondition unmet".to_owned(), context: "mig1".to_owned() })
        }
    }

    #[tokio::test]
    async fn pre_migration_validation_failure_stops_before_any_op_runs() {
        let mgr = manager();
        let err = mgr
            .run_forward(&def("mig1", vec![]), "M1", &MigrationScope::Global, Arc::new(PreValidationFailingExecutor))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::MigrationError);
        assert!(!mgr.is_completed(&MigrationScope::Global, "mig1"));
    }
}
