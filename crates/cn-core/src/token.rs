use std::fmt;
use std::str::FromStr;

use orion_error::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{CoreReason, CoreResult};

/// Width of one workflow version's token-id partition.
pub const VERSION_BASE: u64 = 1_000_000;

/// Fork lineage is packed into the low three decimal digits of a child id:
/// `childId = parentId + joinCount × 100 + branchNumber`.
const LINEAGE_SPAN: u64 = 1_000;

// ---------------------------------------------------------------------------
// WorkflowVersion
// ---------------------------------------------------------------------------

/// A workflow (rule-base) version. Displayed as `v001`, `v002`, …; lower
/// numbers schedule with higher priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowVersion(u32);

impl WorkflowVersion {
    pub fn new(number: u32) -> Self {
        Self(number)
    }

    pub fn number(&self) -> u32 {
        self.0
    }

    /// The numeric anchor of this version's token-id partition.
    pub fn base(&self) -> u64 {
        u64::from(self.0) * VERSION_BASE
    }
}

impl fmt::Display for WorkflowVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{:03}", self.0)
    }
}

impl FromStr for WorkflowVersion {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let digits = s
            .strip_prefix('v')
            .ok_or_else(|| anyhow::anyhow!("workflow version {s:?} must start with 'v'"))?;
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            anyhow::bail!("workflow version {s:?} must be 'v' followed by digits");
        }
        let number: u32 = digits
            .parse()
            .map_err(|_| anyhow::anyhow!("workflow version number out of range in {s:?}"))?;
        Ok(Self(number))
    }
}

// ---------------------------------------------------------------------------
// TokenId
// ---------------------------------------------------------------------------

/// Identity of one in-flight workflow instance. The id encodes both the
/// version partition and, for forked children, the fork lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(u64);

/// Decoded fork lineage of a child token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lineage {
    pub parent: TokenId,
    pub join_count: u32,
    pub branch: u32,
}

impl TokenId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The version partition this id falls into.
    pub fn version(&self) -> WorkflowVersion {
        WorkflowVersion((self.0 / VERSION_BASE) as u32)
    }

    /// Derive the child ids of a fork of arity `join_count`.
    ///
    /// The encoding packs `joinCount × 100 + branch` into the low three
    /// digits, so it is only well-defined for `2 ≤ joinCount ≤ 9` and a
    /// parent aligned to 1000 (workflow bases and join continuations are;
    /// an unaligned fork parent is a workflow-design bug).
    pub fn fork_children(&self, join_count: u32) -> CoreResult<Vec<TokenId>> {
        if !(2..=9).contains(&join_count) {
            return Err(StructError::from(CoreReason::Coordination)
                .with_detail(format!("fork arity {join_count} outside 2..=9")));
        }
        if !self.0.is_multiple_of(LINEAGE_SPAN) {
            return Err(StructError::from(CoreReason::Coordination)
                .with_detail(format!("fork parent {} not aligned to {LINEAGE_SPAN}", self.0)));
        }
        Ok((1..=join_count)
            .map(|branch| TokenId(self.0 + u64::from(join_count) * 100 + u64::from(branch)))
            .collect())
    }

    /// Decode the fork lineage of this id, if it is a forked child.
    ///
    /// Returns `None` for ids whose low digits do not form a valid
    /// `joinCount/branch` pair (roots, continuations, plain tokens).
    pub fn lineage(&self) -> Option<Lineage> {
        let low = self.0 % LINEAGE_SPAN;
        let join_count = (low / 100) as u32;
        let branch = (low % 100) as u32;
        if join_count < 2 || branch == 0 || branch > join_count {
            return None;
        }
        Some(Lineage {
            parent: TokenId(self.0 - low),
            join_count,
            branch,
        })
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
