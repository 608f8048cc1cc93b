//! tarpc-over-TCP agent.
//!
//! Each worker runs a tarpc server exposing a single `deliver` method;
//! outbound requests go through a lazily connected, cached client per
//! destination with retry on connect. The roster (worker identity plus
//! socket address for every member) is fixed at construction.

use crate::agent::{AgentConfig, InFlight, RequestHandler, RpcAgent};
use crate::future::FutureCell;
use crate::message::{Request, Response};
use crate::types::{RpcError, RpcResult, WorkerId, WorkerInfo};
use async_trait::async_trait;
use futures::StreamExt;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tarpc::context::Context;
use tarpc::server::{self, Channel};
use tokio::sync::RwLock;
use tokio_serde::formats::Bincode;
use tracing::{debug, error, info, instrument, warn};

/// Default connection timeout in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;

/// Default number of retry attempts for failed connections.
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default delay between retry attempts in milliseconds.
const DEFAULT_RETRY_DELAY_MS: u64 = 500;

/// Configuration for client connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Number of retry attempts.
    pub retry_attempts: u32,
    /// Delay between retries.
    pub retry_delay: Duration,
    /// Maximum pending requests per client.
    pub max_pending_requests: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
            max_pending_requests: 100,
        }
    }
}

/// Wire service every worker exposes.
#[tarpc::service]
pub trait WorkerService {
    /// Deliver one request from worker `src` and return its response.
    async fn deliver(src: WorkerId, req: Request) -> Response;
}

/// Connect to a worker with the given configuration.
async fn connect_to_worker(
    addr: SocketAddr,
    config: &ClientConfig,
) -> Result<WorkerServiceClient, std::io::Error> {
    debug!("connecting to worker at {}", addr);

    let transport = tokio::time::timeout(
        config.connect_timeout,
        tarpc::serde_transport::tcp::connect(addr, Bincode::default),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timeout"))??;

    let mut tarpc_config = tarpc::client::Config::default();
    tarpc_config.max_in_flight_requests = config.max_pending_requests;

    let client = WorkerServiceClient::new(tarpc_config, transport).spawn();
    info!("connected to worker at {}", addr);
    Ok(client)
}

/// Connect to a worker with automatic retry on failure.
async fn connect_to_worker_with_retry(
    addr: SocketAddr,
    config: &ClientConfig,
) -> Result<WorkerServiceClient, std::io::Error> {
    let mut last_error = None;

    for attempt in 0..config.retry_attempts {
        if attempt > 0 {
            warn!("retry attempt {} connecting to {}", attempt + 1, addr);
            tokio::time::sleep(config.retry_delay).await;
        }

        match connect_to_worker(addr, config).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                warn!("failed to connect to {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    error!(
        "failed to connect to {} after {} attempts",
        addr, config.retry_attempts
    );
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "connection failed")
    }))
}

/// Server wrapper handing inbound requests to the worker runtime.
#[derive(Clone)]
struct WorkerServer {
    handler: Arc<dyn RequestHandler>,
}

impl WorkerService for WorkerServer {
    #[instrument(skip(self, _ctx, req), fields(kind = req.kind(), src = %src))]
    async fn deliver(self, _ctx: Context, src: WorkerId, req: Request) -> Response {
        self.handler.handle(src, req).await
    }
}

/// TCP transport agent for one worker in a fixed cluster.
pub struct NetworkAgent {
    info: WorkerInfo,
    listen_addr: SocketAddr,
    workers: Vec<WorkerInfo>,
    by_name: HashMap<String, WorkerInfo>,
    addrs: HashMap<WorkerId, SocketAddr>,
    config: AgentConfig,
    client_config: ClientConfig,
    clients: Arc<RwLock<HashMap<WorkerId, WorkerServiceClient>>>,
    in_flight: Arc<InFlight>,
    joined: AtomicBool,
    server: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for NetworkAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkAgent")
            .field("info", &self.info)
            .field("listen_addr", &self.listen_addr)
            .field("workers", &self.workers)
            .finish_non_exhaustive()
    }
}

impl NetworkAgent {
    /// Create an agent for the named worker.
    ///
    /// The roster must contain every cluster member, this worker
    /// included; ids and names must be unique.
    pub fn new(
        name: &str,
        roster: Vec<(WorkerInfo, SocketAddr)>,
        config: AgentConfig,
        client_config: ClientConfig,
    ) -> RpcResult<Self> {
        let workers: Vec<WorkerInfo> = roster.iter().map(|(w, _)| w.clone()).collect();
        crate::agent::validate_roster(&workers)?;

        let (info, listen_addr) = roster
            .iter()
            .find(|(w, _)| w.name == name)
            .map(|(w, a)| (w.clone(), *a))
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))?;

        let by_name = workers.iter().map(|w| (w.name.clone(), w.clone())).collect();
        let addrs = roster.iter().map(|(w, a)| (w.id, *a)).collect();

        Ok(Self {
            info,
            listen_addr,
            workers,
            by_name,
            addrs,
            config,
            client_config,
            clients: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(InFlight::new()),
            joined: AtomicBool::new(false),
            server: Mutex::new(None),
        })
    }

    async fn get_client(
        clients: &RwLock<HashMap<WorkerId, WorkerServiceClient>>,
        addr: SocketAddr,
        dst: WorkerId,
        config: &ClientConfig,
    ) -> Result<WorkerServiceClient, std::io::Error> {
        {
            let clients = clients.read().await;
            if let Some(client) = clients.get(&dst) {
                return Ok(client.clone());
            }
        }

        let client = connect_to_worker_with_retry(addr, config).await?;
        clients.write().await.insert(dst, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl RpcAgent for NetworkAgent {
    fn worker_info(&self) -> &WorkerInfo {
        &self.info
    }

    fn worker_info_by_name(&self, name: &str) -> RpcResult<WorkerInfo> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))
    }

    fn workers(&self) -> Vec<WorkerInfo> {
        self.workers.clone()
    }

    fn rpc_timeout(&self) -> Duration {
        self.config.rpc_timeout
    }

    async fn start(&self, handler: Arc<dyn RequestHandler>) -> RpcResult<()> {
        let listener = tarpc::serde_transport::tcp::listen(&self.listen_addr, Bincode::default)
            .await
            .map_err(|e| RpcError::Transport(format!("failed to bind {}: {}", self.listen_addr, e)))?;
        info!("{} listening on {}", self.info, self.listen_addr);

        let limit = self.config.max_concurrent_requests;
        let task = tokio::spawn(async move {
            listener
                .filter_map(|r| futures::future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .for_each_concurrent(limit, |channel| {
                    let server = WorkerServer {
                        handler: Arc::clone(&handler),
                    };
                    async move {
                        channel
                            .execute(server.serve())
                            .for_each(|response| async {
                                tokio::spawn(response);
                            })
                            .await
                    }
                })
                .await;
        });

        let mut server = self.server.lock().expect("server lock poisoned");
        if server.replace(task).is_some() {
            warn!("{} was already started; previous server replaced", self.info);
        }
        Ok(())
    }

    async fn send(&self, dst: &WorkerInfo, req: Request) -> RpcResult<Arc<FutureCell<Response>>> {
        if self.joined.load(Ordering::SeqCst) {
            return Err(RpcError::Shutdown);
        }
        let addr = *self
            .addrs
            .get(&dst.id)
            .ok_or(RpcError::UnknownDestination(dst.id))?;

        debug!("{} -> {}: {}", self.info, dst, req.kind());

        let reply = Arc::new(FutureCell::new());
        self.in_flight.begin();
        {
            let in_flight = Arc::clone(&self.in_flight);
            reply.add_callback(move |_| in_flight.finish());
        }

        let clients = Arc::clone(&self.clients);
        let client_config = self.client_config.clone();
        let timeout = self.config.rpc_timeout;
        let src = self.info.id;
        let dst_id = dst.id;
        let cell = Arc::clone(&reply);
        tokio::spawn(async move {
            let client = match Self::get_client(&clients, addr, dst_id, &client_config).await {
                Ok(client) => client,
                Err(e) => {
                    cell.fail_if_pending(RpcError::Transport(e.to_string()));
                    return;
                }
            };

            let call = client.deliver(tarpc::context::current(), src, req);
            match tokio::time::timeout(timeout, call).await {
                Err(_) => {
                    cell.fail_if_pending(RpcError::Timeout(timeout.as_millis() as u64));
                }
                Ok(Err(e)) => {
                    // Drop the cached client so the next send reconnects.
                    clients.write().await.remove(&dst_id);
                    cell.fail_if_pending(RpcError::Transport(e.to_string()));
                }
                Ok(Ok(response)) => {
                    cell.complete_if_pending(response);
                }
            }
        });

        Ok(reply)
    }

    async fn sync(&self) {
        self.in_flight.quiesce().await;
    }

    async fn join(&self) {
        self.joined.store(true, Ordering::SeqCst);
        self.in_flight.quiesce().await;

        let task = self.server.lock().expect("server lock poisoned").take();
        if let Some(task) = task {
            task.abort();
        }
        self.clients.write().await.clear();
        debug!("{} joined", self.info);
    }
}
