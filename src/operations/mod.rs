//! Idempotent Operation Engine (spec.md §4.3): operations that can be
//! re-run safely, with state-based short-circuiting and result caching.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::clock::Clock;
use crate::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OperationState {
    NotExecuted,
    Executing,
    Completed,
    Failed,
    Skipped,
    Cached,
    RollbackRequired,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct StateRecord {
    pub state: OperationState,
    pub checksum: String,
    pub timestamp: DateTime<Utc>,
    pub last_output: Option<Value>,
}

/// Result of a single operation invocation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OperationResult {
    pub operation_id: String,
    pub module_id: String,
    pub success: bool,
    pub was_idempotent: bool,
    pub was_cached: bool,
    pub output: Option<Value>,
    pub warnings: Vec<String>,
}

/// Context passed to an operation's lifecycle methods.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_id: String,
    pub module_id: String,
    pub tenant_id: String,
    pub params: Value,
}

/// Caching policy for an operation's result.
#[derive(Debug, Clone, Copy)]
pub struct CachePolicy {
    pub ttl: Duration,
}

/// A declared dependency: another operation that must already be in the
/// given state for the same module before this one may run.
#[derive(Debug, Clone)]
pub struct OperationDependency {
    pub operation_id: String,
    pub required_state: OperationState,
}

/// Result of a pre- or post-validation hook (spec.md §4.3 steps 2 and 7).
/// A `critical_failure` aborts the operation with a `ValidationError`;
/// `warnings` are non-fatal and surface on the returned `OperationResult`.
#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub warnings: Vec<String>,
    pub critical_failure: Option<String>,
}

/// An idempotent unit of work (spec.md §4.3 contract).
#[async_trait]
pub trait Operation: Send + Sync {
    fn id(&self) -> &str;

    /// Validates `ctx.params` against the operation's declared schema.
    fn validate_params(&self, ctx: &OperationContext) -> CoreResult<()> {
        let _ = ctx;
        Ok(())
    }

    /// Step 2: runs before state inspection, e.g. preconditions that must
    /// hold for this module/tenant before the operation is even considered.
    async fn pre_validate(&self, ctx: &OperationContext) -> CoreResult<ValidationOutcome> {
        let _ = ctx;
        Ok(ValidationOutcome::default())
    }

    /// Performs the change.
    async fn execute(&self, ctx: &OperationContext) -> CoreResult<Value>;

    /// Returns the operation's current observable state.
    async fn check_state(&self, ctx: &OperationContext) -> CoreResult<OperationState>;

    /// Step 7: runs after a successful `execute`, given its output.
    async fn post_validate(&self, ctx: &OperationContext, output: &Value) -> CoreResult<ValidationOutcome> {
        let _ = (ctx, output);
        Ok(ValidationOutcome::default())
    }

    /// Reclaims partial work on failure. Runs even if `execute` failed.
    async fn cleanup(&self, ctx: &OperationContext) -> CoreResult<()> {
        let _ = ctx;
        Ok(())
    }

    fn dependencies(&self) -> Vec<OperationDependency> {
        vec![]
    }

    fn cache_policy(&self) -> Option<CachePolicy> {
        None
    }
}

struct CacheEntry {
    output: Value,
    expires_at: DateTime<Utc>,
}

/// Drives operations through the execute/check-state/cache/history
/// pipeline described in spec.md §4.3.
pub struct OperationEngine {
    clock: Arc<dyn Clock>,
    states: DashMap<(String, String), StateRecord>,
    cache: DashMap<(String, String), CacheEntry>,
    history: DashMap<String, VecDeque<OperationResult>>,
    history_cap: usize,
}

fn checksum_of(value: &Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

impl OperationEngine {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>, history_cap: usize) -> Self {
        Self {
            clock,
            states: DashMap::new(),
            cache: DashMap::new(),
            history: DashMap::new(),
            history_cap,
        }
    }

    #[must_use]
    pub fn state_of(&self, operation_id: &str, module_id: &str) -> Option<StateRecord> {
        self.states
            .get(&(operation_id.to_owned(), module_id.to_owned()))
            .map(|r| r.clone())
    }

    /// Runs the 9-step algorithm from spec.md §4.3.
    ///
    /// # Errors
    /// Returns `CoreError::DependencyError` if a required dependency isn't
    /// in its declared state, or propagates `op.execute`'s error.
    pub async fn run(&self, op: &dyn Operation, ctx: &OperationContext) -> CoreResult<OperationResult> {
        op.validate_params(ctx)?;

        let pre = op.pre_validate(ctx).await?;
        if let Some(reason) = pre.critical_failure {
            return Err(CoreError::ValidationError { message: reason, context: ctx.operation_id.clone() });
        }
        let mut warnings = pre.warnings;

        let current_state = op.check_state(ctx).await?;
        if matches!(current_state, OperationState::Completed | OperationState::Skipped) {
            let key = (ctx.operation_id.clone(), ctx.module_id.clone());
            let output = self.states.get(&key).and_then(|r| r.last_output.clone());
            let result = OperationResult {
                operation_id: ctx.operation_id.clone(),
                module_id: ctx.module_id.clone(),
                success: true,
                was_idempotent: true,
                was_cached: false,
                output,
                warnings,
            };
            self.push_history(&ctx.module_id, result.clone());
            return Ok(result);
        }

        if let Some(policy) = op.cache_policy() {
            let cache_key = (ctx.operation_id.clone(), ctx.module_id.clone());
            if let Some(entry) = self.cache.get(&cache_key) {
                if entry.expires_at > self.clock.now() {
                    let result = OperationResult {
                        operation_id: ctx.operation_id.clone(),
                        module_id: ctx.module_id.clone(),
                        success: true,
                        was_idempotent: false,
                        was_cached: true,
                        output: Some(entry.output.clone()),
                        warnings,
                    };
                    self.push_history(&ctx.module_id, result.clone());
                    return Ok(result);
                }
            }
            let _ = policy;
        }

        let mut missing = vec![];
        for dep in op.dependencies() {
            let dep_state = self
                .states
                .get(&(dep.operation_id.clone(), ctx.module_id.clone()))
                .map_or(OperationState::NotExecuted, |r| r.state);
            if dep_state != dep.required_state {
                missing.push(format!("{} (wanted {:?}, got {dep_state:?})", dep.operation_id, dep.required_state));
            }
        }
        if !missing.is_empty() {
            return Err(CoreError::DependencyError {
                message: format!("operation '{}' has unmet dependencies", ctx.operation_id),
                missing,
            });
        }

        self.set_state(ctx, OperationState::Executing, String::new(), None);

        let exec_result = op.execute(ctx).await;
        let output = match exec_result {
            Ok(output) => output,
            Err(e) => {
                op.cleanup(ctx).await.ok();
                self.set_state(ctx, OperationState::Failed, String::new(), None);
                let result = OperationResult {
                    operation_id: ctx.operation_id.clone(),
                    module_id: ctx.module_id.clone(),
                    success: false,
                    was_idempotent: false,
                    was_cached: false,
                    output: None,
                    warnings,
                };
                self.push_history(&ctx.module_id, result);
                return Err(e);
            }
        };

        let post = op.post_validate(ctx, &output).await?;
        if let Some(reason) = post.critical_failure {
            op.cleanup(ctx).await.ok();
            self.set_state(ctx, OperationState::Failed, String::new(), None);
            let result = OperationResult {
                operation_id: ctx.operation_id.clone(),
                module_id: ctx.module_id.clone(),
                success: false,
                was_idempotent: false,
                was_cached: false,
                output: Some(output),
                warnings: warnings.clone(),
            };
            self.push_history(&ctx.module_id, result);
            return Err(CoreError::ValidationError { message: reason, context: ctx.operation_id.clone() });
        }
        warnings.extend(post.warnings);

        let final_state = op.check_state(ctx).await?;
        let checksum = checksum_of(&output);
        self.set_state(ctx, final_state, checksum, Some(output.clone()));

        if let Some(policy) = op.cache_policy() {
            self.cache.insert(
                (ctx.operation_id.clone(), ctx.module_id.clone()),
                CacheEntry {
                    output: output.clone(),
                    expires_at: self.clock.now() + chrono::Duration::from_std(policy.ttl).unwrap_or_default(),
                },
            );
        }

        let result = OperationResult {
            operation_id: ctx.operation_id.clone(),
            module_id: ctx.module_id.clone(),
            success: true,
            was_idempotent: false,
            was_cached: false,
            output: Some(output),
            warnings,
        };
        self.push_history(&ctx.module_id, result.clone());
        Ok(result)
    }

    fn set_state(&self, ctx: &OperationContext, state: OperationState, checksum: String, output: Option<Value>) {
        self.states.insert(
            (ctx.operation_id.clone(), ctx.module_id.clone()),
            StateRecord {
                state,
                checksum,
                timestamp: self.clock.now(),
                last_output: output,
            },
        );
    }

    fn push_history(&self, module_id: &str, result: OperationResult) {
        let mut hist = self.history.entry(module_id.to_owned()).or_default();
        hist.push_back(result);
        while hist.len() > self.history_cap {
            hist.pop_front();
        }
    }

    #[must_use]
    pub fn history(&self, module_id: &str) -> Vec<OperationResult> {
        self.history.get(module_id).map(|h| h.iter().cloned().collect()).unwrap_or_default()
    }
}

impl std::fmt::Debug for OperationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationEngine")
            .field("states", &self.states.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingOp {
        calls: AtomicU32,
    }

    #[async_trait]
    impl Operation for CountingOp {
        fn id(&self) -> &str {
            "counting"
        }

        async fn execute(&self, _ctx: &OperationContext) -> CoreResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({ "ran": true }))
        }

        async fn check_state(&self, _ctx: &OperationContext) -> CoreResult<OperationState> {
            if self.calls.load(Ordering::SeqCst) > 0 {
                Ok(OperationState::Completed)
            } else {
                Ok(OperationState::NotExecuted)
            }
        }
    }

    fn ctx() -> OperationContext {
        OperationContext {
            operation_id: "counting".to_owned(),
            module_id: "M1".to_owned(),
            tenant_id: "tA".to_owned(),
            params: Value::Null,
        }
    }

    #[tokio::test]
    async fn second_run_short_circuits_as_idempotent() {
        let engine = OperationEngine::new(Arc::new(SystemClock), 10);
        let op = CountingOp { calls: AtomicU32::new(0) };
        let c = ctx();

        let r1 = engine.run(&op, &c).await.unwrap();
        assert!(!r1.was_idempotent);
        let r2 = engine.run(&op, &c).await.unwrap();
        assert!(r2.was_idempotent);
        assert_eq!(op.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn repeated_execution_same_checksum() {
        let engine = OperationEngine::new(Arc::new(SystemClock), 10);
        let op = CountingOp { calls: AtomicU32::new(0) };
        let c = ctx();
        engine.run(&op, &c).await.unwrap();
        let checksum1 = engine.state_of("counting", "M1").unwrap().checksum;
        // Force back to not_executed to allow a second real execution.
        engine.states.remove(&("counting".to_owned(), "M1".to_owned()));
        op.calls.store(0, Ordering::SeqCst);
        engine.run(&op, &c).await.unwrap();
        let checksum2 = engine.state_of("counting", "M1").unwrap().checksum;
        assert_eq!(checksum1, checksum2);
    }

    struct DependentOp;

    #[async_trait]
    impl Operation for DependentOp {
        fn id(&self) -> &str {
            "dependent"
        }
        async fn execute(&self, _ctx: &OperationContext) -> CoreResult<Value> {
            Ok(Value::Null)
        }
        async fn check_state(&self, _ctx: &OperationContext) -> CoreResult<OperationState> {
            Ok(OperationState::NotExecuted)
        }
        fn dependencies(&self) -> Vec<OperationDependency> {
            vec![OperationDependency {
                operation_id: "missing_dep".to_owned(),
                required_state: OperationState::Completed,
            }]
        }
    }

    #[tokio::test]
    async fn unmet_dependency_yields_dependency_error() {
        let engine = OperationEngine::new(Arc::new(SystemClock), 10);
        let op = DependentOp;
        let c = OperationContext {
            operation_id: "dependent".to_owned(),
            module_id: "M1".to_owned(),
            tenant_id: "tA".to_owned(),
            params: Value::Null,
        };
        let err = engine.run(&op, &c).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DependencyError);
    }

    struct PostValidationFailsOp;

    #[async_trait]
    impl Operation for PostValidationFailsOp {
        fn id(&self) -> &str {
            "post_fails"
        }
        async fn execute(&self, _ctx: &OperationContext) -> CoreResult<Value> {
            Ok(Value::Null)
        }
        async fn check_state(&self, _ctx: &OperationContext) -> CoreResult<OperationState> {
            Ok(OperationState::NotExecuted)
        }
        async fn post_validate(&self, _ctx: &OperationContext, _output: &Value) -> CoreResult<ValidationOutcome> {
            Ok(ValidationOutcome { warnings: vec![], critical_failure: Some("output failed post-check".to_owned()) })
        }
    }

    #[tokio::test]
    async fn post_validate_critical_failure_aborts_as_validation_error() {
        let engine = OperationEngine::new(Arc::new(SystemClock), 10);
        let op = PostValidationFailsOp;
        let c = OperationContext {
            operation_id: "post_fails".to_owned(),
            module_id: "M1".to_owned(),
            tenant_id: "tA".to_owned(),
            params: Value::Null,
        };
        let err = engine.run(&op, &c).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ValidationError);
    }
}
