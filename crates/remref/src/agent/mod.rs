//! RPC agent abstraction.
//!
//! An agent owns a worker's outbound and inbound message processing. The
//! crate ships two implementations:
//!
//! - [`network::NetworkAgent`]: tarpc-over-TCP transport for real clusters
//! - [`local::LocalCluster`] / [`local::LocalAgent`]: in-process transport
//!   with per-pair FIFO delivery, used for single-process clusters and
//!   tests
//!
//! Agents are constructed, then [`RpcAgent::start`]ed with the inbound
//! [`RequestHandler`], serve requests until [`RpcAgent::join`], and are
//! terminal afterwards.

pub mod local;
pub mod network;

use crate::future::FutureCell;
use crate::message::{Request, Response};
use crate::types::{RpcResult, WorkerId, WorkerInfo};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::Notify;

/// Default per-agent RPC timeout in milliseconds.
pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5_000;

/// Default number of requests a worker serves concurrently.
pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 32;

/// Configuration for an RPC agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Timeout applied to every outbound request.
    pub rpc_timeout: Duration,
    /// Concurrency limit for inbound request handling.
    pub max_concurrent_requests: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

/// Inbound-message callback: executes one request and produces the
/// response. Implemented by the worker runtime.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Handle a request sent by worker `src`.
    async fn handle(&self, src: WorkerId, req: Request) -> Response;
}

/// Abstract transport between named workers.
///
/// `send` enqueues a request and returns a future that completes with the
/// peer's response or a `Timeout` error. Delivery ordering is
/// transport-specific: the in-process transport serializes each
/// (sender, receiver) pair, while the TCP transport pipelines requests
/// concurrently. The refcounting protocol tolerates reordering (owners
/// buffer early deletes and park early fetches).
#[async_trait]
pub trait RpcAgent: Send + Sync {
    /// This worker's identity.
    fn worker_info(&self) -> &WorkerInfo;

    /// Look up a cluster member by name.
    ///
    /// # Errors
    ///
    /// Returns `UnknownWorker` if no member has that name.
    fn worker_info_by_name(&self, name: &str) -> RpcResult<WorkerInfo>;

    /// All cluster members, including this worker.
    fn workers(&self) -> Vec<WorkerInfo>;

    /// The configured per-request timeout.
    fn rpc_timeout(&self) -> Duration;

    /// Start serving inbound requests with the given handler.
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> RpcResult<()>;

    /// Send a request to `dst`.
    ///
    /// Returns immediately with a future for the response.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDestination` if `dst` is not a cluster member and
    /// `Shutdown` after `join`.
    async fn send(&self, dst: &WorkerInfo, req: Request) -> RpcResult<Arc<FutureCell<Response>>>;

    /// Block until every request this agent has sent has its response
    /// processed (including timeouts). A barrier over this agent's
    /// in-flight count, not a cluster barrier.
    async fn sync(&self);

    /// Signal that this agent sends no more messages, drain in-flight
    /// requests, and release transport resources.
    ///
    /// Futures whose continuations touch handler state must not be waited
    /// on after `join`.
    async fn join(&self);
}

/// In-flight request tracking shared by agent implementations.
pub(crate) struct InFlight {
    active: AtomicUsize,
    notify: Notify,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self {
            active: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub(crate) fn begin(&self) {
        self.active.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn finish(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) async fn quiesce(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

static DEFAULT_AGENT: RwLock<Option<Arc<dyn RpcAgent>>> = RwLock::new(None);

/// Register the process-wide default agent.
///
/// Intended to be called exactly once during process startup. A second
/// call overwrites the previous agent; callers are responsible for not
/// running two default agents.
pub fn set_default_agent(agent: Arc<dyn RpcAgent>) {
    *DEFAULT_AGENT.write().expect("default agent lock poisoned") = Some(agent);
}

/// Get the process-wide default agent, if one has been registered.
pub fn get_default_agent() -> Option<Arc<dyn RpcAgent>> {
    DEFAULT_AGENT
        .read()
        .expect("default agent lock poisoned")
        .clone()
}

/// Clear the process-wide default agent (teardown).
pub fn clear_default_agent() {
    *DEFAULT_AGENT.write().expect("default agent lock poisoned") = None;
}

/// Validate a roster: worker ids and names must both be unique.
pub(crate) fn validate_roster(workers: &[WorkerInfo]) -> RpcResult<()> {
    use std::collections::HashSet;
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for w in workers {
        if !ids.insert(w.id) {
            return Err(crate::types::RpcError::Transport(format!(
                "duplicate worker id {} in roster",
                w.id
            )));
        }
        if !names.insert(w.name.as_str()) {
            return Err(crate::types::RpcError::Transport(format!(
                "duplicate worker name '{}' in roster",
                w.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_config_default() {
        let config = AgentConfig::default();
        assert_eq!(config.rpc_timeout.as_millis(), DEFAULT_RPC_TIMEOUT_MS as u128);
        assert_eq!(
            config.max_concurrent_requests,
            DEFAULT_MAX_CONCURRENT_REQUESTS
        );
    }

    #[test]
    fn test_validate_roster_rejects_duplicates() {
        let ok = vec![
            WorkerInfo::new(WorkerId::new(0), "a"),
            WorkerInfo::new(WorkerId::new(1), "b"),
        ];
        assert!(validate_roster(&ok).is_ok());

        let dup_id = vec![
            WorkerInfo::new(WorkerId::new(0), "a"),
            WorkerInfo::new(WorkerId::new(0), "b"),
        ];
        assert!(validate_roster(&dup_id).is_err());

        let dup_name = vec![
            WorkerInfo::new(WorkerId::new(0), "a"),
            WorkerInfo::new(WorkerId::new(1), "a"),
        ];
        assert!(validate_roster(&dup_name).is_err());
    }

    #[tokio::test]
    async fn test_in_flight_quiesce() {
        let in_flight = Arc::new(InFlight::new());
        in_flight.begin();
        in_flight.begin();

        let waiter = {
            let in_flight = Arc::clone(&in_flight);
            tokio::spawn(async move { in_flight.quiesce().await })
        };

        in_flight.finish();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        assert!(!waiter.is_finished());

        in_flight.finish();
        waiter.await.unwrap();
        assert_eq!(in_flight.count(), 0);
    }
}
