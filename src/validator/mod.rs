//! Pre-Activation Validator (spec.md §4.6): a declarative rule engine run
//! against an activation context and a system snapshot.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};

use crate::probe::SystemSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum RuleCategory {
    Compatibility,
    Resources,
    Security,
    Performance,
    Dependencies,
    Configuration,
    DataIntegrity,
    Network,
    Storage,
    Permissions,
}

/// The assembled context a rule evaluates against.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub module_id: String,
    pub tenant_id: String,
    pub config: Map<String, Value>,
    pub snapshot: SystemSnapshot,
}

#[derive(Debug, Clone)]
pub struct RuleOutcome {
    pub passed: bool,
    pub message: String,
}

/// A rule's evaluation logic. Implementors should complete within the
/// rule's declared timeout; the engine itself enforces the bound.
#[async_trait]
pub trait RuleEvaluator: Send + Sync {
    async fn evaluate(&self, ctx: &ValidationContext) -> RuleOutcome;
}

/// A pure-function rule, for the common case of synchronous checks.
pub struct FnRule<F>(pub F);

#[async_trait]
impl<F> RuleEvaluator for FnRule<F>
where
    F: Fn(&ValidationContext) -> RuleOutcome + Send + Sync,
{
    async fn evaluate(&self, ctx: &ValidationContext) -> RuleOutcome {
        (self.0)(ctx)
    }
}

pub struct Rule {
    pub id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub dependencies: Vec<String>,
    pub timeout: Duration,
    pub required: bool,
    pub evaluator: Arc<dyn RuleEvaluator>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleResult {
    pub rule_id: String,
    pub category: RuleCategory,
    pub severity: Severity,
    pub passed: bool,
    pub message: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum Verdict {
    Pass,
    Warning,
    Fail,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ValidationReport {
    pub verdict: Verdict,
    pub score: u8,
    pub results: Vec<RuleResult>,
    pub by_category: HashMap<String, usize>,
    pub by_severity: HashMap<String, usize>,
}

/// Groups rules into dependency levels: a rule is in level `N` if the
/// longest dependency chain beneath it has length `N`. Rules with no
/// resolvable dependency (a cycle) are forced into the next level in
/// lexicographic id order, which deterministically breaks the cycle
/// (spec.md §4.6, Open Question #2 in DESIGN.md).
fn dependency_levels(rules: &[Rule]) -> Vec<Vec<usize>> {
    let by_id: HashMap<&str, usize> = rules.iter().enumerate().map(|(i, r)| (r.id.as_str(), i)).collect();
    let mut remaining: HashSet<usize> = (0..rules.len()).collect();
    let mut levels = Vec::new();

    while !remaining.is_empty() {
        let mut ready: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&i| {
                rules[i]
                    .dependencies
                    .iter()
                    .filter_map(|d| by_id.get(d.as_str()))
                    .all(|d| !remaining.contains(d))
            })
            .collect();

        if ready.is_empty() {
            // Cycle: force the lexicographically smallest remaining id.
            let forced = remaining
                .iter()
                .copied()
                .min_by(|&a, &b| rules[a].id.cmp(&rules[b].id))
                .expect("remaining is non-empty");
            ready.push(forced);
        }

        ready.sort_by(|&a, &b| rules[a].id.cmp(&rules[b].id));
        for i in &ready {
            remaining.remove(i);
        }
        levels.push(ready);
    }
    levels
}

pub struct Validator {
    rules: ArcSwap<Vec<Rule>>,
    parallelism: usize,
    history: DashMap<String, VecDeque<ValidationReport>>,
    history_cap: usize,
}

impl Validator {
    #[must_use]
    pub fn new(rules: Vec<Rule>, parallelism: usize, history_cap: usize) -> Self {
        Self {
            rules: ArcSwap::from_pointee(rules),
            parallelism: parallelism.max(1),
            history: DashMap::new(),
            history_cap,
        }
    }

    /// Hot-swaps the rule set validation runs against, without requiring a
    /// write lock or a fresh `Validator` (spec.md §4.6: rules are a
    /// deployment-time configuration surface, not compiled-in).
    pub fn set_rules(&self, rules: Vec<Rule>) {
        self.rules.store(Arc::new(rules));
    }

    /// Runs the full rule set against `ctx`. If `abort_on_critical` is set,
    /// remaining rules after a critical failure are skipped (recorded as
    /// non-passed with a skip message) rather than evaluated.
    pub async fn validate(&self, ctx: &ValidationContext, abort_on_critical: bool) -> ValidationReport {
        let rules = self.rules.load();
        if rules.is_empty() {
            return ValidationReport {
                verdict: Verdict::Pass,
                score: 100,
                results: vec![],
                by_category: HashMap::new(),
                by_severity: HashMap::new(),
            };
        }

        let levels = dependency_levels(&rules);
        let mut results: Vec<RuleResult> = Vec::with_capacity(rules.len());
        let mut seen = vec![false; rules.len()];
        let mut aborted = false;

        for level in levels {
            for chunk in level.chunks(self.parallelism) {
                let mut handles = Vec::new();
                for &idx in chunk {
                    if aborted {
                        continue;
                    }
                    let rule = &rules[idx];
                    let evaluator = Arc::clone(&rule.evaluator);
                    let ctx_clone = ctx.clone();
                    let timeout = rule.timeout;
                    handles.push(async move {
                        let started = std::time::Instant::now();
                        let outcome = tokio::time::timeout(timeout, evaluator.evaluate(&ctx_clone)).await;
                        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                        match outcome {
                            Ok(o) => (idx, o.passed, o.message, duration_ms),
                            Err(_) => (idx, false, "rule timed out".to_owned(), duration_ms),
                        }
                    });
                }
                for (idx, passed, message, duration_ms) in join_all(handles).await {
                    let rule = &rules[idx];
                    seen[idx] = true;
                    results.push(RuleResult {
                        rule_id: rule.id.clone(),
                        category: rule.category,
                        severity: rule.severity,
                        passed,
                        message,
                        duration_ms,
                    });
                    if !passed && rule.severity == Severity::Critical && abort_on_critical {
                        aborted = true;
                    }
                }
            }
            if aborted {
                break;
            }
        }

        for (idx, was_seen) in seen.into_iter().enumerate() {
            if !was_seen {
                results.push(RuleResult {
                    rule_id: rules[idx].id.clone(),
                    category: rules[idx].category,
                    severity: rules[idx].severity,
                    passed: false,
                    message: "skipped after critical abort".to_owned(),
                    duration_ms: 0,
                });
            }
        }

        let total = results.len();
        let passed_count = results.iter().filter(|r| r.passed).count();
        let score = u8::try_from((passed_count * 100) / total.max(1)).unwrap_or(100);

        let has_critical_failure = results
            .iter()
            .any(|r| !r.passed && r.severity == Severity::Critical);
        let has_error_failure = results.iter().any(|r| !r.passed && r.severity == Severity::Error);
        let has_warning = results.iter().any(|r| !r.passed && r.severity == Severity::Warning);

        let verdict = if has_critical_failure || has_error_failure {
            Verdict::Fail
        } else if has_warning {
            Verdict::Warning
        } else {
            Verdict::Pass
        };

        let mut by_category = HashMap::new();
        let mut by_severity = HashMap::new();
        for r in &results {
            *by_category.entry(format!("{:?}", r.category)).or_insert(0) += 1;
            *by_severity.entry(format!("{:?}", r.severity)).or_insert(0) += 1;
        }

        let report = ValidationReport {
            verdict,
            score,
            results,
            by_category,
            by_severity,
        };

        let mut hist = self.history.entry(ctx.module_id.clone()).or_default();
        hist.push_back(report.clone_for_history());
        while hist.len() > self.history_cap {
            hist.pop_front();
        }

        report
    }

    #[must_use]
    pub fn history(&self, module_id: &str) -> Vec<ValidationReport> {
        self.history
            .get(module_id)
            .map(|h| h.iter().map(ValidationReport::clone_for_history).collect())
            .unwrap_or_default()
    }
}

impl ValidationReport {
    fn clone_for_history(&self) -> Self {
        Self {
            verdict: self.verdict,
            score: self.score,
            results: self.results.clone(),
            by_category: self.by_category.clone(),
            by_severity: self.by_severity.clone(),
        }
    }
}

/// Runs a batch of rule-evaluation futures concurrently; a chunk is already
/// bounded to `parallelism`.
async fn join_all<F: std::future::Future>(futs: Vec<F>) -> Vec<F::Output> {
    futures::future::join_all(futs).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{CheckResult, HealthStatus, NetworkStatus, ResourceUsage, SecurityStatus, StorageStatus};

    fn ctx() -> ValidationContext {
        ValidationContext {
            module_id: "M1".to_owned(),
            tenant_id: "tA".to_owned(),
            config: Map::new(),
            snapshot: SystemSnapshot {
                resources: ResourceUsage {
                    memory_pct: 10.0,
                    cpu_pct: 5.0,
                    disk_pct: 20.0,
                    network_pct: 1.0,
                    db_connections: 1,
                    active_processes: 1,
                },
                health: HealthStatus {
                    status: "healthy".to_owned(),
                    score: 100,
                    checks: vec![CheckResult { name: "x".to_owned(), passed: true, detail: String::new() }],
                },
                network: NetworkStatus { connected: true, latency_ms: 1.0, bandwidth_mbps: 100.0 },
                storage: StorageStatus { devices: vec![] },
                security: SecurityStatus { active_threats: 0, policies_enforced: true },
            },
        }
    }

    fn pass_rule(id: &str, deps: &[&str]) -> Rule {
        Rule {
            id: id.to_owned(),
            category: RuleCategory::Compatibility,
            severity: Severity::Error,
            dependencies: deps.iter().map(|s| (*s).to_owned()).collect(),
            timeout: Duration::from_secs(1),
            required: true,
            evaluator: Arc::new(FnRule(|_: &ValidationContext| RuleOutcome {
                passed: true,
                message: "ok".to_owned(),
            })),
        }
    }

    #[tokio::test]
    async fn empty_rule_set_passes_with_score_100() {
        let v = Validator::new(vec![], 4, 10);
        let report = v.validate(&ctx(), true).await;
        assert_eq!(report.verdict, Verdict::Pass);
        assert_eq!(report.score, 100);
    }

    #[tokio::test]
    async fn dependency_order_holds_regardless_of_parallelism() {
        let rules = vec![pass_rule("b", &["a"]), pass_rule("a", &[])];
        let v = Validator::new(rules, 8, 10);
        let report = v.validate(&ctx(), true).await;
        let pos_a = report.results.iter().position(|r| r.rule_id == "a").unwrap();
        let pos_b = report.results.iter().position(|r| r.rule_id == "b").unwrap();
        assert!(pos_a < pos_b);
        assert_eq!(report.verdict, Verdict::Pass);
    }

    #[tokio::test]
    async fn critical_failure_yields_fail_verdict() {
        let mut failing = pass_rule("c", &[]);
        failing.severity = Severity::Critical;
        failing.evaluator = Arc::new(FnRule(|_: &ValidationContext| RuleOutcome {
            passed: false,
            message: "boom".to_owned(),
        }));
        let v = Validator::new(vec![failing], 4, 10);
        let report = v.validate(&ctx(), true).await;
        assert_eq!(report.verdict, Verdict::Fail);
    }

    #[tokio::test]
    async fn cyclic_dependency_breaks_deterministically() {
        let rules = vec![pass_rule("z", &["y"]), pass_rule("y", &["z"])];
        let v = Validator::new(rules, 4, 10);
        let report = v.validate(&ctx(), true).await;
        // Both still run; "y" (lexicographically smaller) is forced first.
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn set_rules_hot_swaps_the_active_rule_set() {
        let v = Validator::new(vec![pass_rule("a", &[])], 4, 10);
        let report = v.validate(&ctx(), true).await;
        assert_eq!(report.results.len(), 1);

        v.set_rules(vec![pass_rule("a", &[]), pass_rule("b", &[])]);
        let report = v.validate(&ctx(), true).await;
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn history_is_capped() {
        let v = Validator::new(vec![pass_rule("a", &[])], 4, 2);
        for _ in 0..5 {
            v.validate(&ctx(), true).await;
        }
        assert_eq!(v.history("M1").len(), 2);
    }
}
