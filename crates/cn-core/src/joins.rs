use std::collections::{BTreeMap, BTreeSet, HashMap};

use orion_error::prelude::*;

use crate::error::{CoreReason, CoreResult};
use crate::payload::JoinAttribute;
use crate::token::TokenId;

// ---------------------------------------------------------------------------
// Join records
// ---------------------------------------------------------------------------

/// Key of one join synchronization: which join transition, which workflow
/// instance (the decoded fork parent).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JoinKey {
    pub transition: String,
    pub parent: TokenId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinStatus {
    Waiting,
    Complete,
    Expired,
}

/// Per-(joinTransitionId, parent) synchronization state.
///
/// Siblings are discovered purely by id decoding; the record never holds a
/// reference to another token.
#[derive(Debug)]
struct JoinRecord {
    expected: u32,
    observed: BTreeSet<TokenId>,
    merged: BTreeMap<String, JoinAttribute>,
    /// Minimum of the arriving siblings' `notAfter` deadlines.
    deadline: Option<u64>,
    status: JoinStatus,
}

/// Outcome of one sibling arrival.
#[derive(Debug)]
pub enum JoinOutcome {
    /// Sibling consumed; more are expected.
    Pending { observed: u32, expected: u32 },
    /// Last sibling arrived: the continuation carries the parent id and the
    /// merged attribute map.
    Complete {
        parent: TokenId,
        expected: u32,
        attributes: Vec<JoinAttribute>,
    },
    /// Arrival after the record reached a terminal state; drop the token.
    AfterTerminal { status: JoinStatus },
    /// The same sibling id was already observed; drop the duplicate.
    Duplicate,
    /// A merged attribute collided with a different value; the sibling goes
    /// to the error sink and is not counted as observed.
    Conflict { detail: String },
}

/// A join that ran out of time, reported by [`JoinTable::sweep`].
#[derive(Debug)]
pub struct ExpiredJoin {
    pub key: JoinKey,
    pub observed: u32,
    pub expected: u32,
    pub deadline: u64,
}

// ---------------------------------------------------------------------------
// JoinTable
// ---------------------------------------------------------------------------

/// All live join records of one control node. Terminal records are kept as
/// tombstones (with their attribute state dropped) so late siblings are
/// recognized and discarded instead of re-opening the join.
#[derive(Debug, Default)]
pub struct JoinTable {
    records: HashMap<JoinKey, JoinRecord>,
}

impl JoinTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sibling arrival at `transition`.
    ///
    /// The record is created on first arrival with the expected count
    /// decoded from the child id. Attribute merge is commutative on
    /// distinct keys; a key collision with a different value yields
    /// [`JoinOutcome::Conflict`]. `Err` is reserved for violated fork/join
    /// invariants (no lineage, inconsistent join counts), which are fatal.
    pub fn arrive(
        &mut self,
        transition: &str,
        child: TokenId,
        attributes: &[JoinAttribute],
    ) -> CoreResult<JoinOutcome> {
        let Some(lineage) = child.lineage() else {
            return StructError::from(CoreReason::Coordination)
                .with_detail(format!("token {child} at join {transition} has no fork lineage"))
                .err();
        };

        let key = JoinKey {
            transition: transition.to_string(),
            parent: lineage.parent,
        };

        let record = self.records.entry(key).or_insert_with(|| JoinRecord {
            expected: lineage.join_count,
            observed: BTreeSet::new(),
            merged: BTreeMap::new(),
            deadline: None,
            status: JoinStatus::Waiting,
        });

        if record.status != JoinStatus::Waiting {
            return Ok(JoinOutcome::AfterTerminal {
                status: record.status,
            });
        }
        if record.expected != lineage.join_count {
            return StructError::from(CoreReason::Coordination)
                .with_detail(format!(
                    "sibling {child} decodes join count {} but record expects {}",
                    lineage.join_count, record.expected
                ))
                .err();
        }
        if !record.observed.insert(child) {
            return Ok(JoinOutcome::Duplicate);
        }

        for attr in attributes {
            match record.merged.get(&attr.name) {
                None => {
                    record.merged.insert(attr.name.clone(), attr.clone());
                }
                Some(existing) if existing.value == attr.value => {
                    // Same key, same value: commutative merge, keep the
                    // tighter deadline.
                    let tighter = match (existing.not_after, attr.not_after) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    record
                        .merged
                        .get_mut(&attr.name)
                        .expect("attribute just looked up")
                        .not_after = tighter;
                }
                Some(existing) => {
                    let detail = format!(
                        "join {} attribute {:?}: {:?} vs {:?}",
                        transition, attr.name, existing.value, attr.value
                    );
                    record.observed.remove(&child);
                    return Ok(JoinOutcome::Conflict { detail });
                }
            }
        }

        let sibling_deadline = attributes.iter().filter_map(|a| a.not_after).min();
        record.deadline = match (record.deadline, sibling_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        let observed = record.observed.len() as u32;
        if observed == record.expected {
            record.status = JoinStatus::Complete;
            let attributes = std::mem::take(&mut record.merged).into_values().collect();
            Ok(JoinOutcome::Complete {
                parent: lineage.parent,
                expected: record.expected,
                attributes,
            })
        } else {
            Ok(JoinOutcome::Pending {
                observed,
                expected: record.expected,
            })
        }
    }

    /// Expire all waiting records whose deadline (plus `skew_millis`) has
    /// passed. Expired siblings are consumed; no continuation is emitted.
    pub fn sweep(&mut self, now_millis: u64, skew_millis: u64) -> Vec<ExpiredJoin> {
        let mut expired = Vec::new();
        for (key, record) in &mut self.records {
            if record.status != JoinStatus::Waiting {
                continue;
            }
            let Some(deadline) = record.deadline else {
                continue;
            };
            if now_millis >= deadline.saturating_add(skew_millis) {
                record.status = JoinStatus::Expired;
                record.merged.clear();
                expired.push(ExpiredJoin {
                    key: key.clone(),
                    observed: record.observed.len() as u32,
                    expected: record.expected,
                    deadline,
                });
            }
        }
        expired
    }

    /// Status of a record, if one exists for the key.
    pub fn status(&self, key: &JoinKey) -> Option<JoinStatus> {
        self.records.get(key).map(|r| r.status)
    }

    /// Number of non-terminal records (waiting joins).
    pub fn waiting(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == JoinStatus::Waiting)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn attr(name: &str, value: &str, not_after: Option<u64>) -> JoinAttribute {
        JoinAttribute {
            name: name.into(),
            value: value.into(),
            not_after,
        }
    }

    fn children_of(parent: u64, arity: u32) -> Vec<TokenId> {
        TokenId::new(parent).fork_children(arity).unwrap()
    }

    #[test]
    fn two_siblings_complete_in_either_order() {
        for reverse in [false, true] {
            let mut table = JoinTable::new();
            let mut kids = children_of(1_000_000, 2);
            if reverse {
                kids.reverse();
            }

            let first = table
                .arrive("merge.results", kids[0], &[attr("left", "1", None)])
                .unwrap();
            assert!(matches!(
                first,
                JoinOutcome::Pending {
                    observed: 1,
                    expected: 2
                }
            ));

            let second = table
                .arrive("merge.results", kids[1], &[attr("right", "2", None)])
                .unwrap();
            match second {
                JoinOutcome::Complete {
                    parent, attributes, ..
                } => {
                    assert_eq!(parent, TokenId::new(1_000_000));
                    let names: Vec<&str> =
                        attributes.iter().map(|a| a.name.as_str()).collect();
                    // merge is order-independent
                    assert_eq!(names, vec!["left", "right"]);
                }
                other => panic!("expected Complete, got {other:?}"),
            }
        }
    }

    #[test]
    fn duplicate_sibling_is_flagged() {
        let mut table = JoinTable::new();
        let kids = children_of(1_000_000, 2);
        table.arrive("j", kids[0], &[]).unwrap();
        assert!(matches!(
            table.arrive("j", kids[0], &[]).unwrap(),
            JoinOutcome::Duplicate
        ));
    }

    #[test]
    fn arrival_after_complete_is_dropped() {
        let mut table = JoinTable::new();
        let kids = children_of(1_000_000, 2);
        table.arrive("j", kids[0], &[]).unwrap();
        table.arrive("j", kids[1], &[]).unwrap();
        assert!(matches!(
            table.arrive("j", kids[0], &[]).unwrap(),
            JoinOutcome::AfterTerminal {
                status: JoinStatus::Complete
            }
        ));
    }

    #[test]
    fn colliding_attribute_values_conflict() {
        let mut table = JoinTable::new();
        let kids = children_of(1_000_000, 2);
        table
            .arrive("j", kids[0], &[attr("x", "1", None)])
            .unwrap();
        let outcome = table
            .arrive("j", kids[1], &[attr("x", "2", None)])
            .unwrap();
        assert!(matches!(outcome, JoinOutcome::Conflict { .. }));
        // the conflicting sibling was not counted; the join can still settle
        assert_eq!(table.waiting(), 1);
    }

    #[test]
    fn same_value_collision_merges() {
        let mut table = JoinTable::new();
        let kids = children_of(1_000_000, 2);
        table
            .arrive("j", kids[0], &[attr("x", "1", Some(200))])
            .unwrap();
        let outcome = table
            .arrive("j", kids[1], &[attr("x", "1", Some(100))])
            .unwrap();
        match outcome {
            JoinOutcome::Complete { attributes, .. } => {
                assert_eq!(attributes.len(), 1);
                assert_eq!(attributes[0].not_after, Some(100));
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[test]
    fn token_without_lineage_is_a_coordination_error() {
        let mut table = JoinTable::new();
        assert!(table.arrive("j", TokenId::new(1_000_001), &[]).is_err());
    }

    #[test]
    fn deadline_expiry_with_missing_sibling() {
        let mut table = JoinTable::new();
        let kids = children_of(1_000_000, 2);
        table
            .arrive("j", kids[0], &[attr("x", "1", Some(5_000))])
            .unwrap();

        // Before the deadline nothing expires.
        assert!(table.sweep(4_999, 0).is_empty());

        let expired = table.sweep(5_000, 0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].observed, 1);
        assert_eq!(expired[0].expected, 2);
        assert_eq!(expired[0].deadline, 5_000);

        // The late sibling is consumed, not re-joined.
        assert!(matches!(
            table.arrive("j", kids[1], &[]).unwrap(),
            JoinOutcome::AfterTerminal {
                status: JoinStatus::Expired
            }
        ));
    }

    #[test]
    fn skew_tolerance_delays_expiry() {
        let mut table = JoinTable::new();
        let kids = children_of(1_000_000, 2);
        table
            .arrive("j", kids[0], &[attr("x", "1", Some(5_000))])
            .unwrap();
        assert!(table.sweep(5_500, 1_000).is_empty());
        assert_eq!(table.sweep(6_000, 1_000).len(), 1);
    }

    #[test]
    fn joins_for_different_parents_are_independent() {
        let mut table = JoinTable::new();
        let a = children_of(1_000_000, 2);
        let b = children_of(1_001_000, 2);
        table.arrive("j", a[0], &[]).unwrap();
        table.arrive("j", b[0], &[]).unwrap();
        assert_eq!(table.waiting(), 2);

        let outcome = table.arrive("j", a[1], &[]).unwrap();
        assert!(matches!(outcome, JoinOutcome::Complete { parent, .. }
            if parent == TokenId::new(1_000_000)));
        assert_eq!(table.waiting(), 1);
    }
}
