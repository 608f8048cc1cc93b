//! In-process cluster transport.
//!
//! `LocalCluster` wires a set of named workers together inside one
//! process: each (sender, receiver) pair gets its own delivery queue
//! drained by a dedicated task, so responses and control messages are
//! processed in send order per pair, the ordering the refcounting
//! protocol relies on. The cluster also counts transport sends and can
//! black-hole a worker, which makes it the test double for timeout and
//! no-send assertions.

use crate::agent::{AgentConfig, InFlight, RequestHandler, RpcAgent};
use crate::future::FutureCell;
use crate::message::{Request, Response};
use crate::types::{RpcError, RpcResult, WorkerId, WorkerInfo};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, warn};

struct Delivery {
    src: WorkerId,
    dst: WorkerId,
    req: Request,
    reply: Arc<FutureCell<Response>>,
}

struct ClusterInner {
    workers: Vec<WorkerInfo>,
    by_id: HashMap<WorkerId, WorkerInfo>,
    by_name: HashMap<String, WorkerInfo>,
    handlers: RwLock<HashMap<WorkerId, Arc<dyn RequestHandler>>>,
    queues: Mutex<HashMap<(WorkerId, WorkerId), mpsc::UnboundedSender<Delivery>>>,
    sends: AtomicU64,
    black_holes: RwLock<HashSet<WorkerId>>,
}

impl ClusterInner {
    /// Get the per-pair delivery queue, spawning its drain task on first
    /// use. One task per pair keeps delivery FIFO for that pair.
    fn queue(self: &Arc<Self>, src: WorkerId, dst: WorkerId) -> mpsc::UnboundedSender<Delivery> {
        let mut queues = self.queues.lock().expect("queue lock poisoned");
        queues
            .entry((src, dst))
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(Self::drain(Arc::clone(self), rx));
                tx
            })
            .clone()
    }

    async fn drain(inner: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Delivery>) {
        while let Some(delivery) = rx.recv().await {
            if inner
                .black_holes
                .read()
                .expect("black hole lock poisoned")
                .contains(&delivery.dst)
            {
                debug!(
                    "dropping {} request for black-holed worker {}",
                    delivery.req.kind(),
                    delivery.dst
                );
                continue;
            }

            let handler = inner
                .handlers
                .read()
                .expect("handler lock poisoned")
                .get(&delivery.dst)
                .cloned();

            let response = match handler {
                Some(handler) => handler.handle(delivery.src, delivery.req).await,
                None => Response::Error(RpcError::Transport(format!(
                    "worker {} has not been started",
                    delivery.dst
                ))),
            };

            // The watchdog may have already timed the request out.
            delivery.reply.complete_if_pending(response);
        }
    }
}

/// A set of workers connected by an in-process transport.
///
/// Cheap to clone; clones share the same cluster state.
#[derive(Clone)]
pub struct LocalCluster {
    inner: Arc<ClusterInner>,
}

impl LocalCluster {
    /// Create a cluster with one worker per name, ids assigned in order.
    ///
    /// # Errors
    ///
    /// Returns an error if the names are not unique.
    pub fn new(names: &[&str]) -> RpcResult<Self> {
        let workers: Vec<WorkerInfo> = names
            .iter()
            .enumerate()
            .map(|(i, name)| WorkerInfo::new(WorkerId::new(i as u32), *name))
            .collect();
        crate::agent::validate_roster(&workers)?;

        let by_id = workers.iter().map(|w| (w.id, w.clone())).collect();
        let by_name = workers.iter().map(|w| (w.name.clone(), w.clone())).collect();

        Ok(Self {
            inner: Arc::new(ClusterInner {
                workers,
                by_id,
                by_name,
                handlers: RwLock::new(HashMap::new()),
                queues: Mutex::new(HashMap::new()),
                sends: AtomicU64::new(0),
                black_holes: RwLock::new(HashSet::new()),
            }),
        })
    }

    /// Look up a worker by name.
    pub fn worker(&self, name: &str) -> RpcResult<WorkerInfo> {
        self.inner
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))
    }

    /// All workers in the cluster.
    pub fn workers(&self) -> Vec<WorkerInfo> {
        self.inner.workers.clone()
    }

    /// Create an agent for the named worker with the default config.
    pub fn agent(&self, name: &str) -> RpcResult<Arc<LocalAgent>> {
        self.agent_with_config(name, AgentConfig::default())
    }

    /// Create an agent for the named worker with a custom config.
    pub fn agent_with_config(&self, name: &str, config: AgentConfig) -> RpcResult<Arc<LocalAgent>> {
        let info = self.worker(name)?;
        Ok(Arc::new(LocalAgent {
            info,
            cluster: Arc::clone(&self.inner),
            config,
            in_flight: Arc::new(InFlight::new()),
            joined: AtomicBool::new(false),
        }))
    }

    /// Total number of transport sends across the cluster.
    pub fn send_count(&self) -> u64 {
        self.inner.sends.load(Ordering::SeqCst)
    }

    /// Silently drop every request delivered to the named worker.
    ///
    /// Senders observe timeouts instead of responses.
    pub fn black_hole(&self, name: &str) -> RpcResult<()> {
        let info = self.worker(name)?;
        self.inner
            .black_holes
            .write()
            .expect("black hole lock poisoned")
            .insert(info.id);
        Ok(())
    }
}

/// One worker's endpoint on a [`LocalCluster`].
pub struct LocalAgent {
    info: WorkerInfo,
    cluster: Arc<ClusterInner>,
    config: AgentConfig,
    in_flight: Arc<InFlight>,
    joined: AtomicBool,
}

#[async_trait]
impl RpcAgent for LocalAgent {
    fn worker_info(&self) -> &WorkerInfo {
        &self.info
    }

    fn worker_info_by_name(&self, name: &str) -> RpcResult<WorkerInfo> {
        self.cluster
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.cluster.workers.clone()
    }

    fn rpc_timeout(&self) -> std::time::Duration {
        self.config.rpc_timeout
    }

    async fn start(&self, handler: Arc<dyn RequestHandler>) -> RpcResult<()> {
        let mut handlers = self.cluster.handlers.write().expect("handler lock poisoned");
        if handlers.insert(self.info.id, handler).is_some() {
            warn!("worker {} was already started; handler replaced", self.info);
        }
        Ok(())
    }

    async fn send(&self, dst: &WorkerInfo, req: Request) -> RpcResult<Arc<FutureCell<Response>>> {
        if self.joined.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        if !self.cluster.by_id.contains_key(&dst.id) {
            return Err(RpcError::UnknownDestination(dst.id));
        }

        self.cluster.sends.fetch_add(1, Ordering::SeqCst);
        debug!("{} -> {}: {}", self.info, dst, req.kind());

        let reply = Arc::new(FutureCell::new());
        self.in_flight.begin();
        {
            let in_flight = Arc::clone(&self.in_flight);
            reply.add_callback(move |_| in_flight.finish());
        }

        let delivery = Delivery {
            src: self.info.id,
            dst: dst.id,
            req,
            reply: Arc::clone(&reply),
        };
        if self.cluster.queue(self.info.id, dst.id).send(delivery).is_err() {
            reply.fail_if_pending(RpcError::Transport(
                "in-process delivery queue is closed".to_string(),
            ));
            return Ok(reply);
        }

        let timeout = self.config.rpc_timeout;
        let watchdog = Arc::clone(&reply);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            watchdog.fail_if_pending(RpcError::Timeout(timeout.as_millis() as u64));
        });

        Ok(reply)
    }

    async fn sync(&self) {
        self.in_flight.quiesce().await;
    }

    async fn join(&self) {
        self.joined.store(true, Ordering::SeqCst);
        self.in_flight.quiesce().await;
        self.cluster
            .handlers
            .write()
            .expect("handler lock poisoned")
            .remove(&self.info.id);
        debug!("{} joined", self.info);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::{Duration, Instant};

    /// Echoes the first argument of a `CallOp` back to the sender.
    struct EchoHandler;

    #[async_trait]
    impl RequestHandler for EchoHandler {
        async fn handle(&self, _src: WorkerId, req: Request) -> Response {
            match req {
                Request::CallOp { mut args, .. } if !args.is_empty() => {
                    Response::Value(args.remove(0))
                }
                _ => Response::Ack,
            }
        }
    }

    fn call(v: serde_json::Value) -> Request {
        Request::CallOp {
            op: "echo".to_string(),
            args: vec![v],
        }
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let cluster = LocalCluster::new(&["a", "b"]).unwrap();
        let a = cluster.agent("a").unwrap();
        let b = cluster.agent("b").unwrap();
        b.start(Arc::new(EchoHandler)).await.unwrap();

        let dst = cluster.worker("b").unwrap();
        let reply = a.send(&dst, call(json!(7))).await.unwrap();
        let resp = reply.wait().await.unwrap();
        assert_eq!(resp.into_value().unwrap(), json!(7));
        assert_eq!(cluster.send_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let cluster = LocalCluster::new(&["a"]).unwrap();
        let a = cluster.agent("a").unwrap();

        let ghost = WorkerInfo::new(WorkerId::new(9), "ghost");
        let err = a.send(&ghost, call(json!(0))).await.unwrap_err();
        assert_eq!(err, RpcError::UnknownDestination(WorkerId::new(9)));
        assert_eq!(cluster.send_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_lookup_by_name() {
        let cluster = LocalCluster::new(&["a", "b"]).unwrap();
        let a = cluster.agent("a").unwrap();

        assert_eq!(a.worker_info().name, "a");
        assert_eq!(a.worker_info_by_name("b").unwrap().id, WorkerId::new(1));
        assert_eq!(
            a.worker_info_by_name("zzz").unwrap_err(),
            RpcError::UnknownWorker("zzz".to_string())
        );
        assert_eq!(a.workers().len(), 2);
    }

    #[tokio::test]
    async fn test_timeout_against_black_hole() {
        let cluster = LocalCluster::new(&["a", "sink"]).unwrap();
        let a = cluster
            .agent_with_config(
                "a",
                AgentConfig {
                    rpc_timeout: Duration::from_millis(50),
                    ..Default::default()
                },
            )
            .unwrap();
        let sink = cluster.agent("sink").unwrap();
        sink.start(Arc::new(EchoHandler)).await.unwrap();
        cluster.black_hole("sink").unwrap();

        let dst = cluster.worker("sink").unwrap();
        let started = Instant::now();
        let reply = a.send(&dst, call(json!(1))).await.unwrap();
        let err = reply.wait().await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, RpcError::Timeout(50));
        assert!(elapsed >= Duration::from_millis(45), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(500), "fired late: {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_sync_drains_in_flight() {
        let cluster = LocalCluster::new(&["a", "b"]).unwrap();
        let a = cluster.agent("a").unwrap();
        let b = cluster.agent("b").unwrap();
        b.start(Arc::new(EchoHandler)).await.unwrap();

        let dst = cluster.worker("b").unwrap();
        for i in 0..10 {
            a.send(&dst, call(json!(i))).await.unwrap();
        }
        a.sync().await;
        assert_eq!(cluster.send_count(), 10);
    }

    #[tokio::test]
    async fn test_join_rejects_further_sends() {
        let cluster = LocalCluster::new(&["a", "b"]).unwrap();
        let a = cluster.agent("a").unwrap();
        let b = cluster.agent("b").unwrap();
        b.start(Arc::new(EchoHandler)).await.unwrap();

        a.join().await;
        let dst = cluster.worker("b").unwrap();
        let err = a.send(&dst, call(json!(0))).await.unwrap_err();
        assert_eq!(err, RpcError::Shutdown);
    }

    #[tokio::test]
    async fn test_per_pair_fifo_order() {
        use std::sync::Mutex as StdMutex;

        struct Recorder {
            seen: Arc<StdMutex<Vec<i64>>>,
        }

        #[async_trait]
        impl RequestHandler for Recorder {
            async fn handle(&self, _src: WorkerId, req: Request) -> Response {
                if let Request::CallOp { args, .. } = req {
                    self.seen
                        .lock()
                        .unwrap()
                        .push(args[0].as_i64().unwrap());
                }
                Response::Ack
            }
        }

        let cluster = LocalCluster::new(&["a", "b"]).unwrap();
        let a = cluster.agent("a").unwrap();
        let b = cluster.agent("b").unwrap();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        b.start(Arc::new(Recorder {
            seen: Arc::clone(&seen),
        }))
        .await
        .unwrap();

        let dst = cluster.worker("b").unwrap();
        for i in 0..32 {
            a.send(&dst, call(json!(i))).await.unwrap();
        }
        a.sync().await;

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..32).collect::<Vec<i64>>());
    }
}
