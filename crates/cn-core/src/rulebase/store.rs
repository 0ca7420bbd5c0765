use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cn_lang::{CmpOp, Fragment, NodeKind};

use crate::token::WorkflowVersion;

// ---------------------------------------------------------------------------
// RuleBase — one committed, immutable version
// ---------------------------------------------------------------------------

/// Guard clause from a `meetsCondition` rule.
#[derive(Debug, Clone, PartialEq)]
pub(super) struct GuardClause {
    pub(super) attribute: String,
    pub(super) op: CmpOp,
    pub(super) value: String,
}

/// Canonical binding of one operation: required input, produced output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Binding {
    pub(super) required: String,
    /// Empty for sink operations (nothing flows downstream).
    pub(super) produced: String,
}

/// The complete, indexed fact/rule set for one workflow version. Built once
/// at commit time and never mutated afterwards; every query the façade
/// answers reads these indexes.
#[derive(Debug)]
pub struct RuleBase {
    version: WorkflowVersion,
    pub(super) node_types: HashMap<(String, String), NodeKind>,
    pub(super) bindings: HashMap<String, Vec<Binding>>,
    pub(super) addresses: HashMap<(String, String), (String, u16)>,
    pub(super) decisions: HashMap<(String, String), String>,
    pub(super) guards: HashMap<String, Vec<GuardClause>>,
}

impl RuleBase {
    /// Index a fragment list into a queryable rule base.
    pub fn build(version: WorkflowVersion, fragments: &[Fragment]) -> Self {
        let mut base = Self {
            version,
            node_types: HashMap::new(),
            bindings: HashMap::new(),
            addresses: HashMap::new(),
            decisions: HashMap::new(),
            guards: HashMap::new(),
        };

        for fragment in fragments {
            match fragment {
                Fragment::NodeType {
                    service,
                    operation,
                    kind,
                } => {
                    base.node_types
                        .insert((service.clone(), operation.clone()), *kind);
                }
                Fragment::CanonicalBinding {
                    operation,
                    produced,
                    required,
                } => {
                    let binding = Binding {
                        required: required.clone(),
                        produced: produced.clone(),
                    };
                    let entry = base.bindings.entry(operation.clone()).or_default();
                    if !entry.contains(&binding) {
                        entry.push(binding);
                    }
                }
                Fragment::ActiveService {
                    service,
                    operation,
                    host,
                    port,
                } => {
                    base.addresses.insert(
                        (service.clone(), operation.clone()),
                        (host.clone(), *port),
                    );
                }
                Fragment::DecisionValue {
                    service,
                    operation,
                    value,
                } => {
                    base.decisions
                        .insert((service.clone(), operation.clone()), value.clone());
                }
                Fragment::MeetsCondition {
                    guard,
                    attribute,
                    op,
                    value,
                } => {
                    base.guards.entry(guard.clone()).or_default().push(GuardClause {
                        attribute: attribute.clone(),
                        op: *op,
                        value: value.clone(),
                    });
                }
            }
        }

        base
    }

    pub fn version(&self) -> WorkflowVersion {
        self.version
    }
}

// ---------------------------------------------------------------------------
// RuleStore — versioned staged/active registry
// ---------------------------------------------------------------------------

/// Registry of rule-base versions known to this control node.
///
/// A version is *staged* from the first fragment received until commitment,
/// and *active* after the distribution agent promotes it. Promotion is a
/// single pointer swap; readers take an `Arc` snapshot per query and never
/// observe a partially built base.
#[derive(Debug, Default)]
pub struct RuleStore {
    active: HashMap<WorkflowVersion, Arc<RuleBase>>,
    staged: HashSet<WorkflowVersion>,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that fragments for `version` have started arriving.
    pub fn mark_staged(&mut self, version: WorkflowVersion) {
        if !self.active.contains_key(&version) {
            self.staged.insert(version);
        }
    }

    /// Atomically promote a fully received version to active.
    pub fn promote(&mut self, base: RuleBase) -> Arc<RuleBase> {
        let version = base.version();
        self.staged.remove(&version);
        let base = Arc::new(base);
        self.active.insert(version, Arc::clone(&base));
        base
    }

    /// Snapshot of the active base for `version`, if committed.
    pub fn active(&self, version: WorkflowVersion) -> Option<Arc<RuleBase>> {
        self.active.get(&version).cloned()
    }

    pub fn is_active(&self, version: WorkflowVersion) -> bool {
        self.active.contains_key(&version)
    }

    pub fn is_staged(&self, version: WorkflowVersion) -> bool {
        self.staged.contains(&version)
    }

    /// Drop a version entirely. Intended for operator-driven decommissioning
    /// once no live token references the version.
    pub fn retire(&mut self, version: WorkflowVersion) {
        self.active.remove(&version);
        self.staged.remove(&version);
    }

    /// Versions currently active, in ascending order.
    pub fn active_versions(&self) -> Vec<WorkflowVersion> {
        let mut versions: Vec<_> = self.active.keys().copied().collect();
        versions.sort();
        versions
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use cn_lang::parse_fragments;

    fn v(n: u32) -> WorkflowVersion {
        WorkflowVersion::new(n)
    }

    #[test]
    fn build_indexes_fragments() {
        let fragments = parse_fragments(
            r#"
NodeType("triage", "assess", decision).
activeService("triage", "assess", "127.0.0.1", 9401).
canonicalBinding("assess", "severity", "vitals").
DecisionValue("radiology", "scan", "urgent").
meetsCondition("scan", "severity", ge, "7").
"#,
        )
        .unwrap();
        let base = RuleBase::build(v(1), &fragments);

        assert_eq!(
            base.node_types
                .get(&("triage".to_string(), "assess".to_string())),
            Some(&NodeKind::Decision)
        );
        assert_eq!(base.bindings["assess"].len(), 1);
        assert_eq!(
            base.addresses[&("triage".to_string(), "assess".to_string())],
            ("127.0.0.1".to_string(), 9401)
        );
        assert_eq!(base.guards["scan"].len(), 1);
    }

    #[test]
    fn duplicate_bindings_collapse() {
        let fragments = parse_fragments(
            r#"
canonicalBinding("assess", "severity", "vitals").
canonicalBinding("assess", "severity", "vitals").
"#,
        )
        .unwrap();
        let base = RuleBase::build(v(1), &fragments);
        assert_eq!(base.bindings["assess"].len(), 1);
    }

    #[test]
    fn store_staged_then_promoted() {
        let mut store = RuleStore::new();
        store.mark_staged(v(1));
        assert!(store.is_staged(v(1)));
        assert!(!store.is_active(v(1)));
        assert!(store.active(v(1)).is_none());

        store.promote(RuleBase::build(v(1), &[]));
        assert!(store.is_active(v(1)));
        assert!(!store.is_staged(v(1)));
        assert!(store.active(v(1)).is_some());
    }

    #[test]
    fn multiple_versions_active_concurrently() {
        let mut store = RuleStore::new();
        store.promote(RuleBase::build(v(2), &[]));
        store.promote(RuleBase::build(v(1), &[]));
        assert_eq!(store.active_versions(), vec![v(1), v(2)]);
    }

    #[test]
    fn retire_removes_version() {
        let mut store = RuleStore::new();
        store.promote(RuleBase::build(v(1), &[]));
        store.retire(v(1));
        assert!(!store.is_active(v(1)));
    }
}
