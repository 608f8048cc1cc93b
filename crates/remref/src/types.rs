//! Core types for cluster identity and remote references.
//!
//! This module defines the identity records used across the system:
//! worker identities, remote-reference identifiers, fork envelopes,
//! and the shared error taxonomy.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dynamic value model for call arguments and results.
///
/// Payload marshaling is an external concern; values travel as
/// self-describing JSON values framed by the transport codec.
pub type Value = serde_json::Value;

/// Unique identifier for a worker in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Create a new worker identifier.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the underlying worker number.
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Immutable identity record for a cluster member.
///
/// Uniqueness of both the id and the name is enforced when the roster
/// is constructed; `WorkerInfo` is usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// The worker's stable integer identity.
    pub id: WorkerId,
    /// The worker's stable name.
    pub name: String,
}

impl WorkerInfo {
    /// Create a new worker identity record.
    pub fn new(id: WorkerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for WorkerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.id)
    }
}

/// Globally unique identifier for a remote reference.
///
/// The id is minted by the worker that creates the reference, which for
/// the `remote` call shape is the caller rather than the eventual owner;
/// the owning worker is carried separately in handles and fork envelopes.
/// Ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RRefId {
    /// The worker that minted this id.
    pub created_on: WorkerId,
    /// Per-worker monotonic sequence number.
    pub local_seq: u64,
}

impl RRefId {
    /// Create a new remote-reference identifier.
    pub fn new(created_on: WorkerId, local_seq: u64) -> Self {
        Self {
            created_on,
            local_seq,
        }
    }
}

impl std::fmt::Display for RRefId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rref-{}.{}", self.created_on.0, self.local_seq)
    }
}

/// Identifier for one fork of a remote reference.
///
/// A fork is created each time a handle crosses a process boundary and is
/// tracked individually by the owner. `(forked_by, local_seq)` makes the
/// fork globally unique even when two workers fork the same reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForkId {
    /// The reference this fork belongs to.
    pub rref_id: RRefId,
    /// The worker that minted the fork.
    pub forked_by: WorkerId,
    /// Per-worker monotonic sequence number.
    pub local_seq: u64,
}

impl ForkId {
    /// Create a new fork identifier.
    pub fn new(rref_id: RRefId, forked_by: WorkerId, local_seq: u64) -> Self {
        Self {
            rref_id,
            forked_by,
            local_seq,
        }
    }
}

impl std::fmt::Display for ForkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/fork-{}.{}", self.rref_id, self.forked_by.0, self.local_seq)
    }
}

/// Serialized fork envelope.
///
/// This is the only valid representation of a handle crossing a process
/// boundary: importing it re-enters the fork protocol on the receiving
/// side. Copying the bytes without running the protocol produces a
/// dangling reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RRefForkData {
    /// The reference being forked.
    pub rref_id: RRefId,
    /// The freshly minted fork.
    pub fork_id: ForkId,
    /// The worker that holds the referenced value.
    pub owner: WorkerInfo,
}

/// Errors that can occur in RPC and remote-reference operations.
///
/// The enum is serializable so remote-side failures can cross the wire
/// inside a response envelope and surface to the caller unchanged.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcError {
    #[error("unknown destination worker {0}")]
    UnknownDestination(WorkerId),

    #[error("unknown worker name '{0}'")]
    UnknownWorker(String),

    #[error("request timed out after {0} ms")]
    Timeout(u64),

    #[error("argument mismatch: {0}")]
    ArgumentMismatch(String),

    #[error("remote execution failed: {0}")]
    RemoteExecution(String),

    #[error("remote reference {0} not found on owner")]
    RRefNotFound(RRefId),

    #[error("worker {0} does not own the referenced value")]
    NotOwner(WorkerId),

    #[error("remote-reference context has been destroyed")]
    ContextDestroyed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("agent has been joined and sends no more messages")]
    Shutdown,
}

/// Result type for RPC and remote-reference operations.
pub type RpcResult<T> = Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_id() {
        let id = WorkerId::new(3);
        assert_eq!(id.as_u32(), 3);
        assert_eq!(format!("{}", id), "worker-3");
    }

    #[test]
    fn test_worker_info_display() {
        let info = WorkerInfo::new(WorkerId::new(0), "trainer");
        assert_eq!(format!("{}", info), "trainer(worker-0)");
    }

    #[test]
    fn test_rref_id_display() {
        let id = RRefId::new(WorkerId::new(1), 7);
        assert_eq!(format!("{}", id), "rref-1.7");
    }

    #[test]
    fn test_fork_id_uniqueness_fields() {
        let rref = RRefId::new(WorkerId::new(1), 7);
        let a = ForkId::new(rref, WorkerId::new(2), 0);
        let b = ForkId::new(rref, WorkerId::new(3), 0);
        assert_ne!(a, b);
        assert_eq!(a.rref_id, b.rref_id);
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::UnknownWorker("ps0".to_string());
        assert_eq!(format!("{}", err), "unknown worker name 'ps0'");

        let err = RpcError::Timeout(50);
        assert_eq!(format!("{}", err), "request timed out after 50 ms");
    }
}
