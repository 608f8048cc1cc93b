//! Remote references over worker-to-worker RPC.
//!
//! `remref` lets a process invoke functions on, and hold references to
//! values living on, other workers in a fixed, named cluster. It provides:
//!
//! - an [`RpcAgent`] transport abstraction with a tarpc-over-TCP
//!   implementation ([`NetworkAgent`]) and an in-process one
//!   ([`LocalCluster`]) for single-process clusters and tests
//! - a single-assignment completion cell ([`FutureCell`]) backing every
//!   asynchronous response
//! - an invocation dispatcher ([`WorkerContext`]) with two call shapes
//!   (await the value, or bind it to a remote reference) over three
//!   payload kinds (builtin operator, opaque user-function blob, named
//!   registered function with signature validation)
//! - distributed reference counting ([`RRef`] handles over an
//!   [`RRefContext`] per worker) so a remote value is released exactly
//!   when no worker holds a live handle to it
//!
//! # Example
//!
//! ```no_run
//! use remref::{LocalCluster, WorkerContext};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> remref::RpcResult<()> {
//!     let cluster = LocalCluster::new(&["trainer", "ps"])?;
//!     let trainer = WorkerContext::with_defaults(cluster.agent("trainer")?);
//!     let ps = WorkerContext::with_defaults(cluster.agent("ps")?);
//!     trainer.start().await?;
//!     ps.start().await?;
//!
//!     let dst = trainer.worker_info_by_name("ps")?;
//!     let sum = trainer.call_op(&dst, "add", vec![json!(2), json!(3)]).await?;
//!     assert_eq!(sum, json!(5));
//!
//!     // Remote shape: the handle is usable before the value exists.
//!     let product = trainer.remote_op(&dst, "mul", vec![json!(4), json!(5)]).await?;
//!     assert_eq!(product.to_here().await?, json!(20));
//!
//!     trainer.join().await;
//!     ps.join().await;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod future;
pub mod message;
pub mod registry;
pub mod rref;
pub mod types;
pub mod worker;

pub use agent::local::{LocalAgent, LocalCluster};
pub use agent::network::{ClientConfig, NetworkAgent};
pub use agent::{
    clear_default_agent, get_default_agent, set_default_agent, AgentConfig, RequestHandler,
    RpcAgent, DEFAULT_MAX_CONCURRENT_REQUESTS, DEFAULT_RPC_TIMEOUT_MS,
};
pub use future::FutureCell;
pub use message::{Request, Response};
pub use registry::{
    FunctionRegistry, Handler, Param, ParamKind, Signature, UdfExecutor, UnsupportedUdfExecutor,
};
pub use rref::context::RRefContext;
pub use rref::RRef;
pub use types::{
    ForkId, RRefForkData, RRefId, RpcError, RpcResult, Value, WorkerId, WorkerInfo,
};
pub use worker::WorkerContext;
