use std::collections::HashMap;

use crate::ast::{Fragment, NodeKind};

/// Semantic validation over a parsed fragment list.
///
/// The checks here catch authoring mistakes that would otherwise surface as
/// nondeterministic routing at runtime: conflicting node types, conflicting
/// service addresses, and conflicting decision values for the same target.
pub(super) fn validate_fragments(fragments: &[Fragment]) -> anyhow::Result<()> {
    let mut node_types: HashMap<(&str, &str), NodeKind> = HashMap::new();
    let mut addresses: HashMap<(&str, &str), (&str, u16)> = HashMap::new();
    let mut decisions: HashMap<(&str, &str), &str> = HashMap::new();

    for fragment in fragments {
        match fragment {
            Fragment::NodeType {
                service,
                operation,
                kind,
            } => {
                if let Some(prev) = node_types.insert((service.as_str(), operation.as_str()), *kind)
                {
                    if prev != *kind {
                        anyhow::bail!(
                            "conflicting NodeType for {service}/{operation}: {prev} vs {kind}"
                        );
                    }
                }
            }
            Fragment::ActiveService {
                service,
                operation,
                host,
                port,
            } => {
                if let Some((prev_host, prev_port)) = addresses
                    .insert((service.as_str(), operation.as_str()), (host.as_str(), *port))
                {
                    if prev_host != host.as_str() || prev_port != *port {
                        anyhow::bail!(
                            "conflicting activeService address for {service}/{operation}: \
                             {prev_host}:{prev_port} vs {host}:{port}"
                        );
                    }
                }
            }
            Fragment::DecisionValue {
                service,
                operation,
                value,
            } => {
                if let Some(prev) =
                    decisions.insert((service.as_str(), operation.as_str()), value.as_str())
                {
                    if prev != value.as_str() {
                        anyhow::bail!(
                            "conflicting DecisionValue for {service}/{operation}: \
                             {prev:?} vs {value:?}"
                        );
                    }
                }
            }
            Fragment::MeetsCondition { guard, .. } => {
                if guard.is_empty() {
                    anyhow::bail!("meetsCondition with empty guard name");
                }
            }
            Fragment::CanonicalBinding { operation, .. } => {
                if operation.is_empty() {
                    anyhow::bail!("canonicalBinding with empty operation name");
                }
            }
        }
    }

    Ok(())
}
