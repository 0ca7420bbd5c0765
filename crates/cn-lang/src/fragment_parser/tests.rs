use winnow::prelude::*;

use super::parse_fragments;
use crate::ast::{CmpOp, Fragment, NodeKind};
use crate::parse_utils::{ident, nonneg_integer, quoted_string};

// -----------------------------------------------------------------------
// Primitive parsers
// -----------------------------------------------------------------------

#[test]
fn parse_ident_simple() {
    assert_eq!(ident.parse("activeService").unwrap(), "activeService");
}

#[test]
fn parse_ident_rejects_leading_digit() {
    assert!(ident.parse("1abc").is_err());
}

#[test]
fn parse_quoted_string_plain() {
    assert_eq!(quoted_string.parse("\"triage\"").unwrap(), "triage");
}

#[test]
fn parse_quoted_string_empty() {
    assert_eq!(quoted_string.parse("\"\"").unwrap(), "");
}

#[test]
fn parse_integer() {
    assert_eq!(nonneg_integer.parse("9401").unwrap(), 9401);
}

// -----------------------------------------------------------------------
// Fact forms
// -----------------------------------------------------------------------

#[test]
fn parse_active_service() {
    let fragments =
        parse_fragments(r#"activeService("triage", "assess", "127.0.0.1", 9401)."#).unwrap();
    assert_eq!(
        fragments,
        vec![Fragment::ActiveService {
            service: "triage".into(),
            operation: "assess".into(),
            host: "127.0.0.1".into(),
            port: 9401,
        }]
    );
}

#[test]
fn parse_canonical_binding() {
    let fragments =
        parse_fragments(r#"canonicalBinding("assess", "severity", "vitals")."#).unwrap();
    assert_eq!(
        fragments,
        vec![Fragment::CanonicalBinding {
            operation: "assess".into(),
            produced: "severity".into(),
            required: "vitals".into(),
        }]
    );
}

#[test]
fn parse_terminate_binding_has_empty_produced() {
    let fragments =
        parse_fragments(r#"canonicalBinding("TERMINATE", "", "report")."#).unwrap();
    match &fragments[0] {
        Fragment::CanonicalBinding { produced, required, .. } => {
            assert!(produced.is_empty());
            assert_eq!(required, "report");
        }
        other => panic!("unexpected fragment {other:?}"),
    }
}

#[test]
fn parse_node_type_all_kinds() {
    for (text, kind) in [
        ("pass", NodeKind::Pass),
        ("gateway", NodeKind::Gateway),
        ("decision", NodeKind::Decision),
        ("fork", NodeKind::Fork),
        ("join", NodeKind::Join),
        ("merge", NodeKind::Merge),
    ] {
        let input = format!(r#"NodeType("s", "o", {text})."#);
        let fragments = parse_fragments(&input).unwrap();
        assert_eq!(
            fragments,
            vec![Fragment::NodeType {
                service: "s".into(),
                operation: "o".into(),
                kind,
            }]
        );
    }
}

#[test]
fn parse_decision_value() {
    let fragments = parse_fragments(r#"DecisionValue("triage", "escalate", "urgent")."#).unwrap();
    assert_eq!(
        fragments,
        vec![Fragment::DecisionValue {
            service: "triage".into(),
            operation: "escalate".into(),
            value: "urgent".into(),
        }]
    );
}

#[test]
fn parse_meets_condition() {
    let fragments =
        parse_fragments(r#"meetsCondition("escalate", "severity", ge, "7")."#).unwrap();
    assert_eq!(
        fragments,
        vec![Fragment::MeetsCondition {
            guard: "escalate".into(),
            attribute: "severity".into(),
            op: CmpOp::Ge,
            value: "7".into(),
        }]
    );
}

// -----------------------------------------------------------------------
// Files: comments, whitespace, multiple fragments
// -----------------------------------------------------------------------

#[test]
fn parse_file_with_comments() {
    let input = r#"
% topology for v001
NodeType("triage", "assess", decision).
activeService("triage", "assess", "127.0.0.1", 9401).

% guard for the urgent branch
meetsCondition("escalate", "severity", ge, "7").
"#;
    let fragments = parse_fragments(input).unwrap();
    assert_eq!(fragments.len(), 3);
}

#[test]
fn parse_empty_file() {
    assert!(parse_fragments("").unwrap().is_empty());
    assert!(parse_fragments("  % nothing here\n").unwrap().is_empty());
}

#[test]
fn missing_terminator_is_an_error() {
    let err = parse_fragments(r#"NodeType("s", "o", pass)"#).unwrap_err();
    assert!(err.to_string().contains("parse error"), "{err}");
}

#[test]
fn unknown_functor_is_an_error() {
    assert!(parse_fragments(r#"frobnicate("a")."#).is_err());
}

#[test]
fn bad_node_kind_is_an_error() {
    assert!(parse_fragments(r#"NodeType("s", "o", spline)."#).is_err());
}

#[test]
fn port_out_of_range_is_an_error() {
    assert!(parse_fragments(r#"activeService("s", "o", "h", 70000)."#).is_err());
}

// -----------------------------------------------------------------------
// Semantic validation
// -----------------------------------------------------------------------

#[test]
fn conflicting_node_types_rejected() {
    let input = r#"
NodeType("s", "o", fork).
NodeType("s", "o", join).
"#;
    let err = parse_fragments(input).unwrap_err();
    assert!(err.to_string().contains("conflicting NodeType"), "{err}");
}

#[test]
fn duplicate_identical_node_type_allowed() {
    let input = r#"
NodeType("s", "o", fork).
NodeType("s", "o", fork).
"#;
    assert_eq!(parse_fragments(input).unwrap().len(), 2);
}

#[test]
fn conflicting_addresses_rejected() {
    let input = r#"
activeService("s", "o", "10.0.0.1", 9000).
activeService("s", "o", "10.0.0.2", 9000).
"#;
    assert!(parse_fragments(input).is_err());
}

#[test]
fn conflicting_decision_values_rejected() {
    let input = r#"
DecisionValue("s", "o", "a").
DecisionValue("s", "o", "b").
"#;
    assert!(parse_fragments(input).is_err());
}

#[test]
fn cmp_op_numeric_vs_lexicographic() {
    assert!(CmpOp::Ge.apply("10", "9"));
    assert!(!CmpOp::Ge.apply("a10", "a9"));
    assert!(CmpOp::Eq.apply("7.0", "7"));
    assert!(CmpOp::Ne.apply("high", "low"));
}
