pub mod capture;
pub mod error;
pub mod joins;
pub mod payload;
pub mod rulebase;
pub mod token;

pub use capture::{
    CaptureRecord, CaptureSink, FileCaptureSink, MemoryCaptureSink, TransitionType,
    transition_in, transition_out,
};
pub use error::{CoreError, CoreReason, CoreResult};
pub use joins::{ExpiredJoin, JoinKey, JoinOutcome, JoinStatus, JoinTable};
pub use payload::{JoinAttribute, MonitorEntry, Payload, ServiceRef};
pub use rulebase::{RouteTarget, RuleBase, RuleEngine, RuleStore};
pub use token::{Lineage, TokenId, WorkflowVersion};

/// Current wall-clock time as epoch milliseconds.
///
/// All deadlines and capture timestamps in the wire protocol are epoch
/// millis; this is the single place they are read from.
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
