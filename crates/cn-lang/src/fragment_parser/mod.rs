use winnow::combinator::{alt, cut_err, repeat};
use winnow::error::{StrContext, StrContextValue};
use winnow::prelude::*;
use winnow::token::literal;

mod validate;

use crate::ast::{CmpOp, Fragment, NodeKind};
use crate::parse_utils::{kw, nonneg_integer, quoted_string, ws_skip};

#[cfg(test)]
mod tests;

// ---------------------------------------------------------------------------
// Public entry point
// ---------------------------------------------------------------------------

/// Parse rule-fragment text containing zero or more facts/rules, each
/// terminated by `.`. Line comments start with `%`.
///
/// Returns the parsed [`Fragment`] list after semantic validation:
/// - At most one `NodeType` per (service, operation).
/// - At most one `activeService` address per (service, operation).
/// - At most one `DecisionValue` per (service, operation).
/// - `meetsCondition` guard names must be non-empty.
pub fn parse_fragments(input: &str) -> anyhow::Result<Vec<Fragment>> {
    let fragments = fragment_file
        .parse(input)
        .map_err(|e| anyhow::anyhow!("parse error: {e}"))?;
    validate::validate_fragments(&fragments)?;
    Ok(fragments)
}

// ---------------------------------------------------------------------------
// Top-level grammar
// ---------------------------------------------------------------------------

fn fragment_file(input: &mut &str) -> ModalResult<Vec<Fragment>> {
    ws_skip.parse_next(input)?;
    let fragments: Vec<Fragment> = repeat(0.., fragment_decl).parse_next(input)?;
    ws_skip.parse_next(input)?;
    Ok(fragments)
}

fn fragment_decl(input: &mut &str) -> ModalResult<Fragment> {
    ws_skip.parse_next(input)?;
    let fragment = alt((
        active_service,
        canonical_binding,
        node_type,
        decision_value,
        meets_condition,
    ))
    .parse_next(input)?;
    ws_skip.parse_next(input)?;
    cut_err(literal("."))
        .context(StrContext::Expected(StrContextValue::Description(
            "terminating '.'",
        )))
        .parse_next(input)?;
    Ok(fragment)
}

// ---------------------------------------------------------------------------
// Individual fact/rule forms
// ---------------------------------------------------------------------------

/// `activeService("svc", "op", "host", port)`
fn active_service(input: &mut &str) -> ModalResult<Fragment> {
    kw("activeService").parse_next(input)?;
    open_paren(input)?;
    let service = arg_string(input)?;
    comma(input)?;
    let operation = arg_string(input)?;
    comma(input)?;
    let host = arg_string(input)?;
    comma(input)?;
    ws_skip.parse_next(input)?;
    let port = cut_err(nonneg_integer)
        .context(StrContext::Expected(StrContextValue::Description(
            "port number",
        )))
        .parse_next(input)?;
    let port = u16::try_from(port).map_err(|_| {
        winnow::error::ErrMode::Cut(winnow::error::ContextError::new())
    })?;
    close_paren(input)?;
    Ok(Fragment::ActiveService {
        service,
        operation,
        host,
        port,
    })
}

/// `canonicalBinding("op", "produced", "required")`
fn canonical_binding(input: &mut &str) -> ModalResult<Fragment> {
    kw("canonicalBinding").parse_next(input)?;
    open_paren(input)?;
    let operation = arg_string(input)?;
    comma(input)?;
    let produced = arg_string(input)?;
    comma(input)?;
    let required = arg_string(input)?;
    close_paren(input)?;
    Ok(Fragment::CanonicalBinding {
        operation,
        produced,
        required,
    })
}

/// `NodeType("svc", "op", fork)`
fn node_type(input: &mut &str) -> ModalResult<Fragment> {
    kw("NodeType").parse_next(input)?;
    open_paren(input)?;
    let service = arg_string(input)?;
    comma(input)?;
    let operation = arg_string(input)?;
    comma(input)?;
    ws_skip.parse_next(input)?;
    let kind = cut_err(node_kind)
        .context(StrContext::Expected(StrContextValue::Description(
            "node type (pass|gateway|decision|fork|join|merge)",
        )))
        .parse_next(input)?;
    close_paren(input)?;
    Ok(Fragment::NodeType {
        service,
        operation,
        kind,
    })
}

/// `DecisionValue("svc", "op", "value")`
fn decision_value(input: &mut &str) -> ModalResult<Fragment> {
    kw("DecisionValue").parse_next(input)?;
    open_paren(input)?;
    let service = arg_string(input)?;
    comma(input)?;
    let operation = arg_string(input)?;
    comma(input)?;
    let value = arg_string(input)?;
    close_paren(input)?;
    Ok(Fragment::DecisionValue {
        service,
        operation,
        value,
    })
}

/// `meetsCondition("guard", "attr", ge, "42")`
fn meets_condition(input: &mut &str) -> ModalResult<Fragment> {
    kw("meetsCondition").parse_next(input)?;
    open_paren(input)?;
    let guard = arg_string(input)?;
    comma(input)?;
    let attribute = arg_string(input)?;
    comma(input)?;
    ws_skip.parse_next(input)?;
    let op = cut_err(cmp_op)
        .context(StrContext::Expected(StrContextValue::Description(
            "comparison op (eq|ne|lt|le|gt|ge)",
        )))
        .parse_next(input)?;
    comma(input)?;
    let value = arg_string(input)?;
    close_paren(input)?;
    Ok(Fragment::MeetsCondition {
        guard,
        attribute,
        op,
        value,
    })
}

// ---------------------------------------------------------------------------
// Primitive pieces
// ---------------------------------------------------------------------------

fn node_kind(input: &mut &str) -> ModalResult<NodeKind> {
    alt((
        kw("pass").value(NodeKind::Pass),
        kw("gateway").value(NodeKind::Gateway),
        kw("decision").value(NodeKind::Decision),
        kw("fork").value(NodeKind::Fork),
        kw("join").value(NodeKind::Join),
        kw("merge").value(NodeKind::Merge),
    ))
    .parse_next(input)
}

fn cmp_op(input: &mut &str) -> ModalResult<CmpOp> {
    alt((
        kw("eq").value(CmpOp::Eq),
        kw("ne").value(CmpOp::Ne),
        kw("lt").value(CmpOp::Lt),
        kw("le").value(CmpOp::Le),
        kw("gt").value(CmpOp::Gt),
        kw("ge").value(CmpOp::Ge),
    ))
    .parse_next(input)
}

fn arg_string(input: &mut &str) -> ModalResult<String> {
    ws_skip.parse_next(input)?;
    cut_err(quoted_string)
        .context(StrContext::Expected(StrContextValue::Description(
            "quoted string argument",
        )))
        .parse_next(input)
}

fn open_paren(input: &mut &str) -> ModalResult<()> {
    ws_skip.parse_next(input)?;
    cut_err(literal("("))
        .context(StrContext::Expected(StrContextValue::Description("'('")))
        .parse_next(input)?;
    Ok(())
}

fn close_paren(input: &mut &str) -> ModalResult<()> {
    ws_skip.parse_next(input)?;
    cut_err(literal(")"))
        .context(StrContext::Expected(StrContextValue::Description("')'")))
        .parse_next(input)?;
    Ok(())
}

fn comma(input: &mut &str) -> ModalResult<()> {
    ws_skip.parse_next(input)?;
    cut_err(literal(","))
        .context(StrContext::Expected(StrContextValue::Description("','")))
        .parse_next(input)?;
    Ok(())
}
