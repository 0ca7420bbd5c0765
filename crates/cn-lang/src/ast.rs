use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// NodeKind — the closed set of routing node types
// ---------------------------------------------------------------------------

/// Structural role of a service operation inside a workflow topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Pass,
    Gateway,
    Decision,
    Fork,
    Join,
    Merge,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "pass",
            Self::Gateway => "gateway",
            Self::Decision => "decision",
            Self::Fork => "fork",
            Self::Join => "join",
            Self::Merge => "merge",
        };
        f.write_str(s)
    }
}

impl FromStr for NodeKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "pass" => Ok(Self::Pass),
            "gateway" => Ok(Self::Gateway),
            "decision" => Ok(Self::Decision),
            "fork" => Ok(Self::Fork),
            "join" => Ok(Self::Join),
            "merge" => Ok(Self::Merge),
            other => anyhow::bail!("unknown node type {other:?}"),
        }
    }
}

// ---------------------------------------------------------------------------
// CmpOp — comparison operators usable in meetsCondition guards
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    /// Apply the operator to two attribute values. Both sides are compared
    /// numerically when both parse as f64, lexicographically otherwise.
    pub fn apply(&self, lhs: &str, rhs: &str) -> bool {
        if let (Ok(a), Ok(b)) = (lhs.parse::<f64>(), rhs.parse::<f64>()) {
            match self {
                Self::Eq => a == b,
                Self::Ne => a != b,
                Self::Lt => a < b,
                Self::Le => a <= b,
                Self::Gt => a > b,
                Self::Ge => a >= b,
            }
        } else {
            match self {
                Self::Eq => lhs == rhs,
                Self::Ne => lhs != rhs,
                Self::Lt => lhs < rhs,
                Self::Le => lhs <= rhs,
                Self::Gt => lhs > rhs,
                Self::Ge => lhs >= rhs,
            }
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Lt => "lt",
            Self::Le => "le",
            Self::Gt => "gt",
            Self::Ge => "ge",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Fragment — one unit of routing knowledge
// ---------------------------------------------------------------------------

/// A parsed rule fragment. Each fragment belongs to exactly one rule-base
/// version; the version is carried by the delivery envelope, not the text.
#[derive(Debug, Clone, PartialEq)]
pub enum Fragment {
    /// `activeService("svc", "op", "host", port).`
    ActiveService {
        service: String,
        operation: String,
        host: String,
        port: u16,
    },
    /// `canonicalBinding("op", "producedAttr", "requiredAttr").`
    ///
    /// An empty `produced` string declares a sink operation (it consumes
    /// `required` and produces nothing downstream).
    CanonicalBinding {
        operation: String,
        produced: String,
        required: String,
    },
    /// `NodeType("svc", "op", fork).`
    NodeType {
        service: String,
        operation: String,
        kind: NodeKind,
    },
    /// `DecisionValue("svc", "op", "value").`
    DecisionValue {
        service: String,
        operation: String,
        value: String,
    },
    /// `meetsCondition("guard", "attr", ge, "42").`
    MeetsCondition {
        guard: String,
        attribute: String,
        op: CmpOp,
        value: String,
    },
}
