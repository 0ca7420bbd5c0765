mod facade;
mod store;

pub use facade::{RouteTarget, RuleEngine};
pub use store::{RuleBase, RuleStore};

/// Reserved operation name that marks the end of a workflow. A
/// `canonicalBinding` whose operation is this name declares which attribute
/// terminates the flow; route targets resolving to it carry no address.
pub const TERMINATE: &str = "TERMINATE";
