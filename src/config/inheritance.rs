//! Configuration inheritance strategies and parent-scope resolution
//! (spec.md §4.7).

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum InheritanceStrategy {
    /// Child overrides parent field-by-field.
    Cascade,
    /// Deep merge of maps.
    Merge,
    /// Parent values only; child writes rejected.
    Strict,
    /// No inheritance.
    Isolated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ParentScope {
    Global,
    TenantGroup,
    ModuleDefault,
    Environment,
}

/// A conditional filter gating whether a parent scope's value applies.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ScopeFilter {
    pub field: String,
    pub equals: Option<Value>,
    pub one_of: Option<Vec<Value>>,
}

impl ScopeFilter {
    fn matches(&self, child: &Map<String, Value>) -> bool {
        let Some(actual) = child.get(&self.field) else {
            return false;
        };
        if let Some(expected) = &self.equals {
            return actual == expected;
        }
        if let Some(options) = &self.one_of {
            return options.contains(actual);
        }
        true
    }
}

/// An ordered, prioritized parent scope reference with an optional filter.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ParentScopeRef {
    pub scope: ParentScope,
    pub filter: Option<ScopeFilter>,
}

/// A tenant's inheritance policy: the strategy plus its prioritized parent
/// list. The default for a tenant derived from `"default"` is
/// `default-only` — a single `ModuleDefault` parent reference.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InheritancePolicy {
    pub strategy: InheritanceStrategy,
    pub parents: Vec<ParentScopeRef>,
}

impl InheritancePolicy {
    #[must_use]
    pub fn default_only() -> Self {
        Self {
            strategy: InheritanceStrategy::Cascade,
            parents: vec![ParentScopeRef {
                scope: ParentScope::ModuleDefault,
                filter: None,
            }],
        }
    }

    #[must_use]
    pub fn isolated() -> Self {
        Self {
            strategy: InheritanceStrategy::Isolated,
            parents: vec![],
        }
    }
}

fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (k, v) in overlay {
        match (base.get_mut(k), v) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(k.clone(), v.clone());
            }
        }
    }
}

/// Resolves the effective configuration for `child` given its declared
/// `policy` and the ordered list of parent scope maps (lowest priority
/// first; later entries in `parent_maps` override earlier ones before the
/// child is applied).
#[must_use]
pub fn resolve(
    policy: &InheritancePolicy,
    child: &Map<String, Value>,
    parent_maps: &[(ParentScope, &Map<String, Value>)],
) -> Map<String, Value> {
    match policy.strategy {
        InheritanceStrategy::Isolated => child.clone(),
        InheritanceStrategy::Strict => {
            let mut effective = Map::new();
            for scope_ref in &policy.parents {
                if let Some((_, m)) = parent_maps.iter().find(|(s, _)| *s == scope_ref.scope) {
                    if scope_ref.filter.as_ref().is_none_or(|f| f.matches(child)) {
                        deep_merge(&mut effective, m);
                    }
                }
            }
            effective
        }
        InheritanceStrategy::Cascade => {
            let mut effective = Map::new();
            for scope_ref in &policy.parents {
                if let Some((_, m)) = parent_maps.iter().find(|(s, _)| *s == scope_ref.scope) {
                    if scope_ref.filter.as_ref().is_none_or(|f| f.matches(child)) {
                        for (k, v) in m.iter() {
                            effective.insert(k.clone(), v.clone());
                        }
                    }
                }
            }
            for (k, v) in child {
                effective.insert(k.clone(), v.clone());
            }
            effective
        }
        InheritanceStrategy::Merge => {
            let mut effective = Map::new();
            for scope_ref in &policy.parents {
                if let Some((_, m)) = parent_maps.iter().find(|(s, _)| *s == scope_ref.scope) {
                    if scope_ref.filter.as_ref().is_none_or(|f| f.matches(child)) {
                        deep_merge(&mut effective, m);
                    }
                }
            }
            deep_merge(&mut effective, child);
            effective
        }
    }
}
