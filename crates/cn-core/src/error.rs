use derive_more::From;
use orion_error::{ErrorCode, StructError, UvsReason};

/// Token-level and rule-base-level failure kinds.
///
/// Everything here is a tagged outcome local to one token or one rule-base
/// version; `Coordination` is the one fatal class (fork/join internal
/// invariant violated) and is escalated to a node abort by the runtime.
#[derive(Debug, Clone, PartialEq, thiserror::Error, From)]
pub enum CoreReason {
    #[error("malformed payload")]
    MalformedPayload,
    #[error("rule base not active")]
    RuleBaseNotActive,
    #[error("binding violation")]
    BindingViolation,
    #[error("routing ambiguous")]
    RoutingAmbiguous,
    #[error("coordination invariant violated")]
    Coordination,
    #[error("token expired")]
    Expired,
    #[error("rule version conflict")]
    RuleVersionConflict,
    #[error("join attribute conflict")]
    BindingConflict,
    #[error("{0}")]
    Uvs(UvsReason),
}

impl ErrorCode for CoreReason {
    fn error_code(&self) -> i32 {
        match self {
            Self::MalformedPayload => 1001,
            Self::RuleBaseNotActive => 1002,
            Self::BindingViolation => 1003,
            Self::RoutingAmbiguous => 1004,
            Self::Coordination => 1005,
            Self::Expired => 1006,
            Self::RuleVersionConflict => 1007,
            Self::BindingConflict => 1008,
            Self::Uvs(u) => u.error_code(),
        }
    }
}

pub type CoreError = StructError<CoreReason>;
pub type CoreResult<T> = Result<T, CoreError>;
