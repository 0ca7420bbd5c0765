use std::collections::BTreeMap;
use std::sync::Arc;

use cn_lang::NodeKind;

use super::store::RuleBase;
use super::TERMINATE;

// ---------------------------------------------------------------------------
// RouteTarget
// ---------------------------------------------------------------------------

/// One routing destination. `address` is `None` only for the terminal
/// marker target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub service: String,
    pub operation: String,
    pub address: Option<(String, u16)>,
}

impl RouteTarget {
    pub fn is_terminate(&self) -> bool {
        self.operation == TERMINATE
    }
}

// ---------------------------------------------------------------------------
// RuleEngine — the fixed query surface over one immutable rule base
// ---------------------------------------------------------------------------

/// Façade over one committed rule base. The rest of the control node never
/// writes raw rule queries; it goes through these four entry points.
///
/// The engine is purely functional: given the same snapshot and the same
/// input tuple it always returns the same answer, which is what makes
/// routing decisions replayable across nodes.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    base: Arc<RuleBase>,
}

impl RuleEngine {
    pub fn new(base: Arc<RuleBase>) -> Self {
        Self { base }
    }

    /// Structural node type of (service, operation), or `None` if unknown.
    pub fn node_type(&self, service: &str, operation: &str) -> Option<NodeKind> {
        self.base
            .node_types
            .get(&(service.to_string(), operation.to_string()))
            .copied()
    }

    /// Declared (required, produced) pairs of an operation. Empty means the
    /// operation is a pass-through.
    pub fn canonical_bindings(&self, operation: &str) -> Vec<(String, String)> {
        self.base
            .bindings
            .get(operation)
            .map(|bindings| {
                bindings
                    .iter()
                    .map(|b| (b.required.clone(), b.produced.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Attributes an operation requires as service input.
    pub fn required_attributes(&self, operation: &str) -> Vec<String> {
        self.base
            .bindings
            .get(operation)
            .map(|bindings| bindings.iter().map(|b| b.required.clone()).collect())
            .unwrap_or_default()
    }

    /// Attributes an operation declares as produced output.
    pub fn produced_attributes(&self, operation: &str) -> Vec<String> {
        self.base
            .bindings
            .get(operation)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|b| !b.produced.is_empty())
                    .map(|b| b.produced.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Routing destinations for a completed operation, derived by chaining
    /// canonical bindings: every operation whose required attribute is among
    /// this operation's produced (or, for pass-throughs, result) attributes
    /// is a candidate, resolved to an address via its `activeService` fact.
    ///
    /// Ordering is lexicographic on (service, operation) so two nodes
    /// evaluating the same fragments produce the same list.
    pub fn route_targets(
        &self,
        operation: &str,
        result_attributes: &BTreeMap<String, String>,
    ) -> Vec<RouteTarget> {
        let declared = self.produced_attributes(operation);
        let produced: Vec<&str> = if declared.is_empty() {
            result_attributes.keys().map(String::as_str).collect()
        } else {
            declared.iter().map(String::as_str).collect()
        };

        let mut targets = Vec::new();

        for (op, bindings) in &self.base.bindings {
            if op == operation {
                continue;
            }
            let feeds = bindings
                .iter()
                .any(|b| produced.contains(&b.required.as_str()));
            if !feeds {
                continue;
            }
            if op == TERMINATE {
                targets.push(RouteTarget {
                    service: String::new(),
                    operation: TERMINATE.to_string(),
                    address: None,
                });
                continue;
            }
            for ((svc, svc_op), (host, port)) in &self.base.addresses {
                if svc_op == op {
                    targets.push(RouteTarget {
                        service: svc.clone(),
                        operation: svc_op.clone(),
                        address: Some((host.clone(), *port)),
                    });
                }
            }
        }

        targets.sort_by(|a, b| (&a.service, &a.operation).cmp(&(&b.service, &b.operation)));
        targets.dedup();
        targets
    }

    /// Evaluate the guard named `name`: the conjunction of all
    /// `meetsCondition` clauses sharing that name, vacuously true when none
    /// are declared.
    pub fn evaluate_guard(&self, name: &str, bindings: &BTreeMap<String, String>) -> bool {
        let Some(clauses) = self.base.guards.get(name) else {
            return true;
        };
        clauses.iter().all(|clause| {
            bindings
                .get(&clause.attribute)
                .is_some_and(|value| clause.op.apply(value, &clause.value))
        })
    }

    /// Declared decision value for a target (service, operation), if any.
    pub fn decision_value(&self, service: &str, operation: &str) -> Option<&str> {
        self.base
            .decisions
            .get(&(service.to_string(), operation.to_string()))
            .map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::WorkflowVersion;
    use cn_lang::parse_fragments;

    fn engine(fragments: &str) -> RuleEngine {
        let fragments = parse_fragments(fragments).unwrap();
        RuleEngine::new(Arc::new(RuleBase::build(WorkflowVersion::new(1), &fragments)))
    }

    fn attrs(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    const LINEAR: &str = r#"
NodeType("intake", "admit", pass).
NodeType("triage", "assess", pass).
activeService("intake", "admit", "127.0.0.1", 9400).
activeService("triage", "assess", "127.0.0.1", 9401).
canonicalBinding("admit", "vitals", "patientId").
canonicalBinding("assess", "severity", "vitals").
canonicalBinding("TERMINATE", "", "severity").
"#;

    #[test]
    fn node_type_lookup() {
        let engine = engine(LINEAR);
        assert_eq!(engine.node_type("intake", "admit"), Some(cn_lang::NodeKind::Pass));
        assert_eq!(engine.node_type("intake", "discharge"), None);
    }

    #[test]
    fn bindings_split_required_produced() {
        let engine = engine(LINEAR);
        assert_eq!(engine.required_attributes("assess"), vec!["vitals"]);
        assert_eq!(engine.produced_attributes("assess"), vec!["severity"]);
        // TERMINATE produces nothing
        assert!(engine.produced_attributes(TERMINATE).is_empty());
        // undeclared operation is a pass-through
        assert!(engine.canonical_bindings("unknown").is_empty());
    }

    #[test]
    fn route_follows_binding_chain() {
        let engine = engine(LINEAR);
        let targets = engine.route_targets("admit", &attrs(&[("vitals", "stable")]));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].service, "triage");
        assert_eq!(targets[0].operation, "assess");
        assert_eq!(targets[0].address, Some(("127.0.0.1".to_string(), 9401)));
    }

    #[test]
    fn route_reaches_terminate() {
        let engine = engine(LINEAR);
        let targets = engine.route_targets("assess", &attrs(&[("severity", "3")]));
        assert_eq!(targets.len(), 1);
        assert!(targets[0].is_terminate());
        assert!(targets[0].address.is_none());
    }

    #[test]
    fn route_order_is_deterministic() {
        let engine = engine(
            r#"
activeService("zeta", "zop", "127.0.0.1", 9501).
activeService("alpha", "aop", "127.0.0.1", 9502).
canonicalBinding("split", "load", "raw").
canonicalBinding("zop", "z", "load").
canonicalBinding("aop", "a", "load").
"#,
        );
        let targets = engine.route_targets("split", &attrs(&[("load", "1")]));
        let names: Vec<&str> = targets.iter().map(|t| t.service.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn pass_through_routes_on_result_attributes() {
        let engine = engine(
            r#"
activeService("triage", "assess", "127.0.0.1", 9401).
canonicalBinding("assess", "severity", "vitals").
"#,
        );
        // "relay" has no declared bindings: candidates come from the result map.
        let targets = engine.route_targets("forward", &attrs(&[("vitals", "ok")]));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].operation, "assess");
    }

    #[test]
    fn guard_conjunction() {
        let engine = engine(
            r#"
meetsCondition("escalate", "severity", ge, "7").
meetsCondition("escalate", "ward", eq, "er").
"#,
        );
        assert!(engine.evaluate_guard("escalate", &attrs(&[("severity", "8"), ("ward", "er")])));
        assert!(!engine.evaluate_guard("escalate", &attrs(&[("severity", "8"), ("ward", "icu")])));
        assert!(!engine.evaluate_guard("escalate", &attrs(&[("ward", "er")])));
        // undeclared guard is vacuously true
        assert!(engine.evaluate_guard("nonexistent", &attrs(&[])));
    }

    #[test]
    fn decision_value_lookup() {
        let engine = engine(r#"DecisionValue("radiology", "scan", "urgent")."#);
        assert_eq!(engine.decision_value("radiology", "scan"), Some("urgent"));
        assert_eq!(engine.decision_value("radiology", "other"), None);
    }

    #[test]
    fn replaying_same_inputs_gives_same_routes() {
        let engine = engine(LINEAR);
        let input = attrs(&[("vitals", "stable")]);
        let first = engine.route_targets("admit", &input);
        let second = engine.route_targets("admit", &input);
        assert_eq!(first, second);
    }
}
