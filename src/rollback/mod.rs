//! Rollback Engine (spec.md §4.5): composes and executes a compensating
//! plan that returns the system to an equivalent of its pre-forward state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::CoreResult;
use crate::operations::{Operation, OperationContext, OperationEngine, OperationState};

/// A completed forward step, as recorded by the caller (Orchestrator or
/// Migration Manager) during the forward pass.
#[derive(Clone)]
pub struct CompletedStep {
    pub step_id: String,
    /// `None` when the step declared no reverse — rollback can still
    /// proceed in best-effort mode but "partial rollback possible" is
    /// surfaced to the caller.
    pub reverse: Option<Arc<dyn ReverseStep>>,
}

impl std::fmt::Debug for CompletedStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletedStep")
            .field("step_id", &self.step_id)
            .field("reverse", &self.reverse.as_ref().map(|_| "<reverse step>"))
            .finish()
    }
}

/// A single compensating action.
#[async_trait]
pub trait ReverseStep: Send + Sync {
    async fn execute(&self, ctx: &OperationContext) -> CoreResult<Value>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyCheckKind {
    DataBackupPresent,
    ServiceHealthWithinRange,
    ResourceAvailability,
    DependencyCheck,
}

#[derive(Debug, Clone)]
pub struct SafetyCheck {
    pub kind: SafetyCheckKind,
    pub critical: bool,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

/// The topologically-reverse ordering of completed forward steps, each
/// mapped to its declared reverse (spec.md §4.5).
pub struct RollbackPlan {
    pub steps: Vec<CompletedStep>,
    pub partial: bool,
}

/// Constructs the plan: reverse of completion order, flagging `partial`
/// when any step lacks a declared reverse.
#[must_use]
pub fn build_plan(completed: Vec<CompletedStep>) -> RollbackPlan {
    let partial = completed.iter().any(|s| s.reverse.is_none());
    let mut steps = completed;
    steps.reverse();
    RollbackPlan { steps, partial }
}

struct ReverseOp {
    step: Arc<dyn ReverseStep>,
    step_id: String,
}

#[async_trait]
impl Operation for ReverseOp {
    fn id(&self) -> &str {
        &self.step_id
    }

    async fn execute(&self, ctx: &OperationContext) -> CoreResult<Value> {
        self.step.execute(ctx).await
    }

    async fn check_state(&self, _ctx: &OperationContext) -> CoreResult<OperationState> {
        Ok(OperationState::NotExecuted)
    }
}

#[derive(Debug, Clone)]
pub enum RollbackOutcome {
    /// System restored; caller should transition to `inactive`/`ready`.
    Restored,
    /// A compensating step itself failed; the pair is pinned
    /// `rollback_required` and refuses further activation.
    RollbackRequired { reason: String },
    /// A required critical safety check failed before any step ran.
    Unsafe { reason: String },
}

pub struct RollbackEngine {
    operations: Arc<OperationEngine>,
}

impl RollbackEngine {
    #[must_use]
    pub fn new(operations: Arc<OperationEngine>) -> Self {
        Self { operations }
    }

    /// Runs the full rollback: pre-rollback validation is the caller's
    /// responsibility (it has the forward-state context); this engine runs
    /// safety checks, executes the plan with retry, and reports outcome.
    pub async fn execute(
        &self,
        plan: &RollbackPlan,
        safety_checks: &[SafetyCheck],
        retry: RetryPolicy,
        module_id: &str,
        tenant_id: &str,
    ) -> RollbackOutcome {
        if let Some(failed) = safety_checks.iter().find(|c| c.critical && !c.passed) {
            return RollbackOutcome::Unsafe {
                reason: format!("critical safety check {:?} failed", failed.kind),
            };
        }

        for step in &plan.steps {
            let Some(reverse) = &step.reverse else {
                continue;
            };
            let ctx = OperationContext {
                operation_id: step.step_id.clone(),
                module_id: module_id.to_owned(),
                tenant_id: tenant_id.to_owned(),
                params: Value::Null,
            };
            let op = ReverseOp {
                step: Arc::clone(reverse),
                step_id: step.step_id.clone(),
            };

            let mut attempt = 0;
            let mut delay = retry.initial_delay;
            loop {
                attempt += 1;
                match self.operations.run(&op, &ctx).await {
                    Ok(_) => break,
                    Err(e) if attempt >= retry.max_attempts => {
                        return RollbackOutcome::RollbackRequired {
                            reason: format!("step '{}' failed after {attempt} attempts: {e}", step.step_id),
                        };
                    }
                    Err(_) => {
                        tokio::time::sleep(delay).await;
                        delay = delay.mul_f64(retry.multiplier).min(retry.max_delay);
                    }
                }
            }
        }

        RollbackOutcome::Restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::error::CoreError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct OkReverse;
    #[async_trait]
    impl ReverseStep for OkReverse {
        async fn execute(&self, _ctx: &OperationContext) -> CoreResult<Value> {
            Ok(Value::Null)
        }
    }

    struct FailingReverse {
        calls: AtomicU32,
    }
    #[async_trait]
    impl ReverseStep for FailingReverse {
        async fn execute(&self, _ctx: &OperationContext) -> CoreResult<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::StateError { message: "boom".to_owned() })
        }
    }

    fn engine() -> RollbackEngine {
        RollbackEngine::new(Arc::new(OperationEngine::new(Arc::new(SystemClock), 10)))
    }

    #[tokio::test]
    async fn plan_reverses_completion_order() {
        let completed = vec![
            CompletedStep { step_id: "a".to_owned(), reverse: Some(Arc::new(OkReverse)) },
            CompletedStep { step_id: "b".to_owned(), reverse: Some(Arc::new(OkReverse)) },
        ];
        let plan = build_plan(completed);
        assert_eq!(plan.steps[0].step_id, "b");
        assert_eq!(plan.steps[1].step_id, "a");
        assert!(!plan.partial);
    }

    #[tokio::test]
    async fn missing_reverse_flags_partial() {
        let completed = vec![CompletedStep { step_id: "a".to_owned(), reverse: None }];
        let plan = build_plan(completed);
        assert!(plan.partial);
    }

    #[tokio::test]
    async fn successful_plan_restores() {
        let completed = vec![CompletedStep { step_id: "a".to_owned(), reverse: Some(Arc::new(OkReverse)) }];
        let plan = build_plan(completed);
        let eng = engine();
        let outcome = eng.execute(&plan, &[], RetryPolicy::default(), "M1", "tA").await;
        assert!(matches!(outcome, RollbackOutcome::Restored));
    }

    #[tokio::test]
    async fn failing_step_pins_rollback_required() {
        let completed = vec![CompletedStep {
            step_id: "a".to_owned(),
            reverse: Some(Arc::new(FailingReverse { calls: AtomicU32::new(0) })),
        }];
        let plan = build_plan(completed);
        let eng = engine();
        let outcome = eng.execute(&plan, &[], RetryPolicy::default(), "M1", "tA").await;
        assert!(matches!(outcome, RollbackOutcome::RollbackRequired { .. }));
    }

    #[tokio::test]
    async fn critical_safety_check_failure_aborts_as_unsafe() {
        let plan = build_plan(vec![]);
        let eng = engine();
        let checks = [SafetyCheck { kind: SafetyCheckKind::DataBackupPresent, critical: true, passed: false }];
        let outcome = eng.execute(&plan, &checks, RetryPolicy::default(), "M1", "tA").await;
        assert!(matches!(outcome, RollbackOutcome::Unsafe { .. }));
    }
}
