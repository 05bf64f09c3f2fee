//! Op ids and the replicate/commit messages carried by the log.

use serde::{Deserialize, Serialize};
use strata_util::clock::Timestamp;
use strata_util::ErrorCode;

/// Position in the replicated log: `(term, index)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct OpId {
    pub term: u64,
    pub index: u64,
}

impl OpId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.term, self.index)
    }
}

/// Kind of operation a replicate or commit message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    NoOp,
    Write,
    AlterSchema,
    /// Commit-only marker: the replicated operation was aborted after
    /// replication, and followers must drop it the same way.
    OpAbort,
}

/// An operation accepted into the replicated log.
///
/// The payload is opaque to consensus; the tablet layer encodes the actual
/// write or alter-schema request into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicateMsg {
    pub id: OpId,
    pub op_type: OperationType,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// Commit record written once an operation has been applied locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMsg {
    pub committed_op_id: OpId,
    pub op_type: OperationType,
    pub timestamp: Timestamp,
    /// Per-operation result, opaque to consensus. Aborts carry the error
    /// that caused them.
    pub result: Vec<u8>,
    pub error: Option<(ErrorCode, String)>,
}

impl CommitMsg {
    pub fn is_abort(&self) -> bool {
        self.op_type == OperationType::OpAbort
    }
}
