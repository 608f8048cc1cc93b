//! Request and response envelopes for worker-to-worker RPC.
//!
//! Every exchange between workers is one of these typed messages: value
//! calls, remote (reference-creating) calls, reference fetches, and the
//! fork/delete control messages of the distributed refcounting protocol.

use crate::types::{ForkId, RRefForkData, RRefId, RpcError, Value, WorkerId};
use serde::{Deserialize, Serialize};

/// A request sent from one worker to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Invoke a builtin operator and return its value.
    CallOp {
        /// Operator name, dispatched by the callee's runtime.
        op: String,
        /// Positional arguments.
        args: Vec<Value>,
    },

    /// Invoke an opaque user function and return its value.
    CallUdf {
        /// Serialized closure/blob, interpreted by the callee's executor.
        payload: Vec<u8>,
        /// Positional tensor arguments, already marshaled.
        tensors: Vec<Vec<u8>>,
    },

    /// Invoke a named registered function and return its value.
    ///
    /// Arguments are already bound to the registered signature on the
    /// caller, so a mismatch never reaches the wire.
    CallFunction {
        /// Qualified function name resolved against the shared registry.
        name: String,
        /// Arguments in positional order.
        args: Vec<Value>,
    },

    /// Invoke a builtin operator, binding the result to a new owner-role
    /// reference on the callee.
    RemoteOp {
        op: String,
        args: Vec<Value>,
        /// The caller-minted reference and its initial fork.
        rref: RRefForkData,
    },

    /// Invoke an opaque user function, binding the result to a new
    /// owner-role reference on the callee.
    RemoteUdf {
        payload: Vec<u8>,
        tensors: Vec<Vec<u8>>,
        rref: RRefForkData,
    },

    /// Invoke a named registered function, binding the result to a new
    /// owner-role reference on the callee.
    RemoteFunction {
        name: String,
        args: Vec<Value>,
        rref: RRefForkData,
    },

    /// Fetch the value behind an owned reference (user-side `to_here`).
    FetchValue {
        /// The reference to materialize.
        rref_id: RRefId,
    },

    /// Notify the owner that a fork of one of its references is now held
    /// by another worker.
    ForkNotify {
        /// The fork envelope.
        fork: RRefForkData,
        /// The worker holding the fork.
        held_by: WorkerId,
    },

    /// Notify the owner that a fork has been dropped.
    DeleteFork {
        /// The fork being released.
        fork_id: ForkId,
    },
}

impl Request {
    /// Short human-readable label for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::CallOp { .. } => "call_op",
            Request::CallUdf { .. } => "call_udf",
            Request::CallFunction { .. } => "call_function",
            Request::RemoteOp { .. } => "remote_op",
            Request::RemoteUdf { .. } => "remote_udf",
            Request::RemoteFunction { .. } => "remote_function",
            Request::FetchValue { .. } => "fetch_value",
            Request::ForkNotify { .. } => "fork_notify",
            Request::DeleteFork { .. } => "delete_fork",
        }
    }

    /// Whether this is a refcounting control message (subject to the
    /// per-pair ordering requirement).
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            Request::ForkNotify { .. } | Request::DeleteFork { .. }
        )
    }
}

/// A response returned by the callee.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// The call's result value.
    Value(Value),

    /// A remote-shape request was accepted and the owner-side reference
    /// was created; the value completes asynchronously.
    RemoteAccepted {
        /// The reference the request minted.
        rref_id: RRefId,
    },

    /// A control message was processed.
    Ack,

    /// The request failed on the callee.
    Error(RpcError),
}

impl Response {
    /// Unwrap a `Value` response, mapping every other variant to an error.
    pub fn into_value(self) -> Result<Value, RpcError> {
        match self {
            Response::Value(v) => Ok(v),
            Response::Error(e) => Err(e),
            other => Err(RpcError::Transport(format!(
                "unexpected response variant: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RpcError, WorkerId};

    #[test]
    fn test_request_kind_labels() {
        let req = Request::CallOp {
            op: "add".to_string(),
            args: vec![],
        };
        assert_eq!(req.kind(), "call_op");
        assert!(!req.is_control());

        let req = Request::DeleteFork {
            fork_id: crate::types::ForkId::new(
                crate::types::RRefId::new(WorkerId::new(0), 0),
                WorkerId::new(1),
                0,
            ),
        };
        assert_eq!(req.kind(), "delete_fork");
        assert!(req.is_control());
    }

    #[test]
    fn test_response_into_value() {
        let v = Response::Value(serde_json::json!(5)).into_value().unwrap();
        assert_eq!(v, serde_json::json!(5));

        let err = Response::Error(RpcError::ContextDestroyed)
            .into_value()
            .unwrap_err();
        assert_eq!(err, RpcError::ContextDestroyed);

        assert!(Response::Ack.into_value().is_err());
    }
}
