//! Per-worker runtime: invocation dispatcher and inbound request handler.
//!
//! A `WorkerContext` binds an agent, a function registry, a user-function
//! executor, and the remote-reference context into one runtime. It is the
//! caller-facing API (the `call_*` and `remote_*` dispatch operations) and
//! at the same time the agent's [`RequestHandler`] for inbound requests.
//!
//! Refcounting control messages (fork-notify, delete-notify) are queued by
//! the [`RRefContext`] and forwarded to owners by a background task, so
//! handle drops never block on the network.

use crate::agent::{RequestHandler, RpcAgent};
use crate::message::{Request, Response};
use crate::registry::{FunctionRegistry, UdfExecutor, UnsupportedUdfExecutor};
use crate::rref::context::{ControlNotify, RRefContext};
use crate::rref::{RRef, Role};
use crate::types::{RRefForkData, RRefId, RpcError, RpcResult, Value, WorkerId, WorkerInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// One worker's runtime: dispatcher, inbound handler, and reference state.
pub struct WorkerContext {
    agent: Arc<dyn RpcAgent>,
    rrefs: RRefContext,
    registry: Arc<FunctionRegistry>,
    udf: Arc<dyn UdfExecutor>,
    control_task: Mutex<Option<JoinHandle<()>>>,
    weak: Weak<WorkerContext>,
}

impl WorkerContext {
    /// Create a runtime over the given agent, registry, and executor.
    ///
    /// The context is inert until [`WorkerContext::start`] wires it into
    /// the agent.
    pub fn new(
        agent: Arc<dyn RpcAgent>,
        registry: Arc<FunctionRegistry>,
        udf: Arc<dyn UdfExecutor>,
    ) -> Arc<Self> {
        let self_id = agent.worker_info().id;
        Arc::new_cyclic(|weak| Self {
            agent,
            rrefs: RRefContext::new(self_id),
            registry,
            udf,
            control_task: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Create a runtime with the builtin-operator registry and no
    /// user-function executor.
    pub fn with_defaults(agent: Arc<dyn RpcAgent>) -> Arc<Self> {
        Self::new(
            agent,
            Arc::new(FunctionRegistry::with_builtins()),
            Arc::new(UnsupportedUdfExecutor),
        )
    }

    /// Start serving: register as the agent's inbound handler and spawn
    /// the control-message forwarder.
    pub async fn start(self: &Arc<Self>) -> RpcResult<()> {
        self.agent
            .start(Arc::clone(self) as Arc<dyn RequestHandler>)
            .await?;

        let mut rx = self.rrefs.take_control_rx().ok_or_else(|| {
            RpcError::Transport("worker context already started".to_string())
        })?;
        let ctx = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let Some(ctx) = ctx.upgrade() else { break };
                ctx.forward_control(msg).await;
            }
        });
        *self.control_task.lock().expect("control task lock poisoned") = Some(task);
        Ok(())
    }

    /// This worker's identity.
    pub fn worker_info(&self) -> &WorkerInfo {
        self.agent.worker_info()
    }

    /// Look up a cluster member by name.
    pub fn worker_info_by_name(&self, name: &str) -> RpcResult<WorkerInfo> {
        self.agent.worker_info_by_name(name)
    }

    /// All cluster members.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.agent.workers()
    }

    /// The agent's per-request timeout.
    pub fn rpc_timeout(&self) -> Duration {
        self.agent.rpc_timeout()
    }

    /// The shared function registry.
    pub fn registry(&self) -> &Arc<FunctionRegistry> {
        &self.registry
    }

    /// The remote-reference context (state queries and teardown).
    pub fn rrefs(&self) -> &RRefContext {
        &self.rrefs
    }

    /// Barrier over this worker's outbound in-flight requests.
    pub async fn sync(&self) {
        self.agent.sync().await;
    }

    /// Stop sending, drain in-flight requests, and release the transport.
    ///
    /// Control notifies still queued at this point are dropped; peers
    /// relying on them should be torn down as a group.
    pub async fn join(&self) {
        self.agent.join().await;
        let task = self
            .control_task
            .lock()
            .expect("control task lock poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
        }
    }

    /// Tear down the remote-reference context.
    ///
    /// Further RRef operations on this worker fail with
    /// `ContextDestroyed`; values already materialized stay valid.
    pub fn destroy_rref_context(&self) {
        self.rrefs.destroy_instance();
    }

    // ----- call shape: send, await, unwrap the value -----

    /// Invoke a builtin operator on `to` and await its value.
    #[instrument(skip_all, fields(dst = %to, op))]
    pub async fn call_op(&self, to: &WorkerInfo, op: &str, args: Vec<Value>) -> RpcResult<Value> {
        let req = Request::CallOp {
            op: op.to_string(),
            args,
        };
        self.round_trip(to, req).await
    }

    /// Invoke an opaque user function on `to` and await its value.
    #[instrument(skip_all, fields(dst = %to))]
    pub async fn call_udf(
        &self,
        to: &WorkerInfo,
        payload: Vec<u8>,
        tensors: Vec<Vec<u8>>,
    ) -> RpcResult<Value> {
        self.round_trip(to, Request::CallUdf { payload, tensors }).await
    }

    /// Invoke a named registered function on `to` and await its value.
    ///
    /// Arguments are bound against the locally shared signature before
    /// anything is sent; an `ArgumentMismatch` never reaches the wire.
    #[instrument(skip_all, fields(dst = %to, name))]
    pub async fn call_function(
        &self,
        to: &WorkerInfo,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> RpcResult<Value> {
        let bound = self.registry.resolve(name)?.bind(args, kwargs)?;
        let req = Request::CallFunction {
            name: name.to_string(),
            args: bound,
        };
        self.round_trip(to, req).await
    }

    async fn round_trip(&self, to: &WorkerInfo, req: Request) -> RpcResult<Value> {
        let reply = self.agent.send(to, req).await?;
        reply.wait().await?.into_value()
    }

    // ----- remote shape: mint a reference, return the handle now -----

    /// Invoke a builtin operator on `to`, binding the result to a new
    /// remote reference.
    ///
    /// Returns a usable handle immediately; the owner completes the value
    /// asynchronously, and execution errors surface on dereference.
    #[instrument(skip_all, fields(dst = %to, op))]
    pub async fn remote_op(
        &self,
        to: &WorkerInfo,
        op: &str,
        args: Vec<Value>,
    ) -> RpcResult<RRef> {
        if to.id == self.worker_info().id {
            let registry = Arc::clone(&self.registry);
            let op = op.to_string();
            return self.local_remote(move || registry.invoke_op(&op, args));
        }
        self.remote_request(to, |rref| Request::RemoteOp {
            op: op.to_string(),
            args,
            rref,
        })
        .await
    }

    /// Invoke an opaque user function on `to`, binding the result to a
    /// new remote reference.
    #[instrument(skip_all, fields(dst = %to))]
    pub async fn remote_udf(
        &self,
        to: &WorkerInfo,
        payload: Vec<u8>,
        tensors: Vec<Vec<u8>>,
    ) -> RpcResult<RRef> {
        if to.id == self.worker_info().id {
            let udf = Arc::clone(&self.udf);
            return self.local_remote(move || udf.execute(&payload, &tensors));
        }
        self.remote_request(to, |rref| Request::RemoteUdf {
            payload,
            tensors,
            rref,
        })
        .await
    }

    /// Invoke a named registered function on `to`, binding the result to
    /// a new remote reference. Argument binding is local, as for
    /// [`WorkerContext::call_function`].
    #[instrument(skip_all, fields(dst = %to, name))]
    pub async fn remote_function(
        &self,
        to: &WorkerInfo,
        name: &str,
        args: Vec<Value>,
        kwargs: HashMap<String, Value>,
    ) -> RpcResult<RRef> {
        let bound = self.registry.resolve(name)?.bind(args, kwargs)?;
        if to.id == self.worker_info().id {
            let registry = Arc::clone(&self.registry);
            let name = name.to_string();
            return self.local_remote(move || registry.invoke_function(&name, bound));
        }
        self.remote_request(to, |rref| Request::RemoteFunction {
            name: name.to_string(),
            args: bound,
            rref,
        })
        .await
    }

    /// Wrap a value already present on this worker into an owner-role
    /// reference, so it can be handed to other workers by reference.
    pub fn wrap_local_value(&self, value: Value) -> RpcResult<RRef> {
        let rref_id = self.rrefs.next_rref_id();
        let fork_id = self.rrefs.next_fork_id(rref_id);
        let cell = self.rrefs.create_owner(rref_id, None)?;
        self.rrefs.retain_local_handle(rref_id)?;
        cell.complete(value);
        Ok(RRef::new(
            self.weak.clone(),
            rref_id,
            fork_id,
            self.worker_info().clone(),
            Role::Owner,
        ))
    }

    /// Import a fork envelope received from another worker, producing a
    /// live handle and running the receiver half of the fork protocol.
    pub fn import_rref(&self, data: RRefForkData) -> RpcResult<RRef> {
        let role = if data.owner.id == self.worker_info().id {
            // The fork came home: it collapses into a local handle.
            self.rrefs.retain_local_handle(data.rref_id)?;
            self.rrefs.remove_fork(data.fork_id)?;
            Role::Owner
        } else {
            self.rrefs.register_user(&data)?;
            Role::User
        };
        Ok(RRef::new(
            self.weak.clone(),
            data.rref_id,
            data.fork_id,
            data.owner,
            role,
        ))
    }

    /// Remote shape where this worker is itself the owner: no request,
    /// the computation runs locally.
    fn local_remote(
        &self,
        compute: impl FnOnce() -> RpcResult<Value> + Send + 'static,
    ) -> RpcResult<RRef> {
        let rref_id = self.rrefs.next_rref_id();
        let fork_id = self.rrefs.next_fork_id(rref_id);
        let cell = self.rrefs.create_owner(rref_id, None)?;
        self.rrefs.retain_local_handle(rref_id)?;
        tokio::task::spawn_blocking(move || {
            let _ = match compute() {
                Ok(v) => cell.complete_if_pending(v),
                Err(e) => cell.fail_if_pending(e),
            };
        });
        Ok(RRef::new(
            self.weak.clone(),
            rref_id,
            fork_id,
            self.worker_info().clone(),
            Role::Owner,
        ))
    }

    async fn remote_request(
        &self,
        to: &WorkerInfo,
        build: impl FnOnce(RRefForkData) -> Request,
    ) -> RpcResult<RRef> {
        let rref_id = self.rrefs.next_rref_id();
        let fork_id = self.rrefs.next_fork_id(rref_id);
        let data = RRefForkData {
            rref_id,
            fork_id,
            owner: to.clone(),
        };
        self.rrefs.register_user(&data)?;

        let reply = match self.agent.send(to, build(data.clone())).await {
            Ok(reply) => reply,
            Err(e) => {
                // The owner never heard of this fork; discard it quietly.
                self.rrefs.unregister_user(fork_id);
                return Err(e);
            }
        };
        // The handle is usable immediately; acceptance failures are
        // logged here and surface again on dereference.
        reply.add_callback(move |result| match result {
            Ok(Response::RemoteAccepted { .. }) => {}
            Ok(Response::Error(e)) => warn!("remote creation of {} failed: {}", rref_id, e),
            Ok(other) => warn!(
                "unexpected response to remote creation of {}: {:?}",
                rref_id, other
            ),
            Err(e) => warn!("remote creation of {} failed: {}", rref_id, e),
        });

        Ok(RRef::new(
            self.weak.clone(),
            rref_id,
            fork_id,
            data.owner,
            Role::User,
        ))
    }

    /// User-side `to_here`: fetch the value from the owner.
    pub(crate) async fn fetch_remote_value(
        &self,
        owner: &WorkerInfo,
        rref_id: RRefId,
    ) -> RpcResult<Value> {
        self.round_trip(owner, Request::FetchValue { rref_id }).await
    }

    /// Owner side of a remote-shape request: create the reference entry
    /// and run the computation off the request path.
    fn accept_remote(
        &self,
        rref: RRefForkData,
        compute: impl FnOnce() -> RpcResult<Value> + Send + 'static,
    ) -> Response {
        if rref.owner.id != self.worker_info().id {
            return Response::Error(RpcError::NotOwner(self.worker_info().id));
        }
        match self.rrefs.create_owner(rref.rref_id, Some(rref.fork_id)) {
            Ok(cell) => {
                let rref_id = rref.rref_id;
                tokio::task::spawn_blocking(move || {
                    let _ = match compute() {
                        Ok(v) => cell.complete_if_pending(v),
                        Err(e) => cell.fail_if_pending(e),
                    };
                });
                Response::RemoteAccepted { rref_id }
            }
            Err(e) => Response::Error(e),
        }
    }

    /// Forward one queued refcounting control message to its owner.
    async fn forward_control(&self, msg: ControlNotify) {
        let (owner, req) = match msg {
            ControlNotify::Fork {
                owner,
                fork,
                held_by,
            } => {
                if owner.id == self.worker_info().id {
                    if let Err(e) = self.rrefs.add_fork(fork.fork_id) {
                        warn!("local fork-notify for {} failed: {}", fork.fork_id, e);
                    }
                    return;
                }
                (owner, Request::ForkNotify { fork, held_by })
            }
            ControlNotify::Delete { owner, fork_id } => {
                if owner.id == self.worker_info().id {
                    if let Err(e) = self.rrefs.remove_fork(fork_id) {
                        warn!("local delete-notify for {} failed: {}", fork_id, e);
                    }
                    return;
                }
                (owner, Request::DeleteFork { fork_id })
            }
        };

        // Fire and forget; failures are logged when the reply resolves.
        match self.agent.send(&owner, req).await {
            Ok(reply) => {
                let owner_name = owner.name.clone();
                reply.add_callback(move |result| {
                    if let Ok(Response::Error(e)) | Err(e) = result.clone() {
                        warn!("control message to {} failed: {}", owner_name, e);
                    }
                });
            }
            Err(e) => warn!("control message to {} not sent: {}", owner, e),
        }
    }

    fn respond(result: RpcResult<Value>) -> Response {
        match result {
            Ok(v) => Response::Value(v),
            Err(e) => Response::Error(e),
        }
    }
}

#[async_trait]
impl RequestHandler for WorkerContext {
    #[instrument(skip_all, fields(worker = %self.worker_info(), src = %src, kind = req.kind()))]
    async fn handle(&self, src: WorkerId, req: Request) -> Response {
        debug!("handling inbound request");
        match req {
            Request::CallOp { op, args } => Self::respond(self.registry.invoke_op(&op, args)),
            Request::CallUdf { payload, tensors } => {
                Self::respond(self.udf.execute(&payload, &tensors))
            }
            Request::CallFunction { name, args } => {
                Self::respond(self.registry.invoke_function(&name, args))
            }
            Request::RemoteOp { op, args, rref } => {
                let registry = Arc::clone(&self.registry);
                self.accept_remote(rref, move || registry.invoke_op(&op, args))
            }
            Request::RemoteUdf {
                payload,
                tensors,
                rref,
            } => {
                let udf = Arc::clone(&self.udf);
                self.accept_remote(rref, move || udf.execute(&payload, &tensors))
            }
            Request::RemoteFunction { name, args, rref } => {
                let registry = Arc::clone(&self.registry);
                self.accept_remote(rref, move || registry.invoke_function(&name, args))
            }
            // A fetch may overtake the create on transports without
            // per-pair ordering; wait on a pending entry in that case.
            Request::FetchValue { rref_id } => match self.rrefs.owner_value_pending_create(rref_id) {
                Ok(cell) => Self::respond(cell.wait().await),
                Err(e) => Response::Error(e),
            },
            Request::ForkNotify { fork, held_by } => {
                debug!("fork {} now held by {}", fork.fork_id, held_by);
                match self.rrefs.add_fork(fork.fork_id) {
                    Ok(()) => Response::Ack,
                    Err(e) => Response::Error(e),
                }
            }
            Request::DeleteFork { fork_id } => match self.rrefs.remove_fork(fork_id) {
                Ok(()) => Response::Ack,
                Err(e) => Response::Error(e),
            },
        }
    }
}
