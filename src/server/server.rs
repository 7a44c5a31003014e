use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::{Buf, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::bus::DispatchBus;
use crate::codec::frame::{FrameDecoder, DEFAULT_MAX_FRAME_LEN};
use crate::rpc::dispatch::{PreHandler, RemoteDispatch, ServiceRegistry};
use crate::rpc::envelope::ErrorNotification;
use crate::rpc::opcode::RpcOpCode;
use crate::server::registry::{ConnectionRegistry, ServerConnection};

/// error level for notifications caused by undecodable call frames
const ERROR_LEVEL_SEVERE: u8 = 2;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// registry group that connections accepted by this server belong to
    pub group_id: u64,
    pub max_frame_len: usize,
    /// a connection that sends nothing for this long is closed; `None`
    ///  disables the check
    pub read_idle_timeout: Option<Duration>,
    /// `0` runs call handlers inline on the connection's read task
    pub worker_count: usize,
    pub queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            group_id: 0,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            read_idle_timeout: Some(Duration::from_secs(60)),
            worker_count: 4,
            queue_depth: 256,
        }
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A fixed set of workers draining a bounded job queue, so slow call handlers
///  exert backpressure on the connections' read tasks instead of spawning
///  without bound.
struct WorkerPool {
    tx: Option<mpsc::Sender<Job>>,
}

impl WorkerPool {
    fn new(worker_count: usize, queue_depth: usize) -> WorkerPool {
        if worker_count == 0 {
            return WorkerPool { tx: None };
        }
        let (tx, rx) = mpsc::channel::<Job>(queue_depth);
        let rx = Arc::new(Mutex::new(rx));
        for _ in 0..worker_count {
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
            });
        }
        WorkerPool { tx: Some(tx) }
    }

    async fn submit(&self, job: impl Future<Output = ()> + Send + 'static) {
        match &self.tx {
            Some(tx) => {
                if tx.send(Box::pin(job)).await.is_err() {
                    warn!("worker pool is gone, dropping job");
                }
            }
            None => job.await,
        }
    }
}

/// The accepting side: serves any number of client connections over one
///  listener, each on its own read task. Call frames go through the worker
///  pool to [RemoteDispatch]; application frames go to the dispatch bus.
///
/// Every accepted connection is auto-bound to the identity `og:<peer-ip>`,
///  so server-initiated pushes can address a peer before it authenticates.
pub struct RpcServer {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    dispatch: Arc<RemoteDispatch>,
    bus: Arc<dyn DispatchBus>,
    workers: WorkerPool,
    next_conn_id: AtomicU64,
}

impl RpcServer {
    pub fn new(
        config: ServerConfig,
        services: Arc<ServiceRegistry>,
        bus: Arc<dyn DispatchBus>,
        pre_handler: Option<Arc<dyn PreHandler>>,
    ) -> Arc<RpcServer> {
        let workers = WorkerPool::new(config.worker_count, config.queue_depth);
        Arc::new(RpcServer {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            dispatch: Arc::new(RemoteDispatch::new(services, bus.clone(), pre_handler)),
            bus,
            workers,
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// The accept loop. Runs until the listener fails.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        info!(addr = %listener.local_addr()?, "listening");
        loop {
            let (stream, peer_addr) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!("failed to set TCP_NODELAY: {}", e);
            }
            let id = self.next_conn_id.fetch_add(1, Ordering::SeqCst);
            let (read_half, write_half) = stream.into_split();
            let conn = ServerConnection::new(id, self.config.group_id, peer_addr, Box::new(write_half));

            info!(conn = id, peer = %peer_addr, "connection accepted");
            let server = self.clone();
            tokio::spawn(async move {
                server.registry.bind(&conn, &format!("og:{}", peer_addr.ip())).await;
                if let Err(e) = server.serve_connection(&conn, read_half).await {
                    debug!(conn = conn.id(), "connection closed: {:#}", e);
                }
                server.registry.remove(&conn).await;
                info!(conn = conn.id(), peer = %peer_addr, "connection gone");
            });
        }
    }

    async fn serve_connection(
        &self,
        conn: &Arc<ServerConnection>,
        mut read_half: OwnedReadHalf,
    ) -> anyhow::Result<()> {
        let mut decoder = FrameDecoder::new(self.config.max_frame_len);
        let mut read_buf = BytesMut::with_capacity(8 * 1024);
        loop {
            let n = match self.config.read_idle_timeout {
                Some(idle) => {
                    match tokio::time::timeout(idle, read_half.read_buf(&mut read_buf)).await {
                        Ok(read) => read?,
                        Err(_) => bail!("nothing received for {:?}", idle),
                    }
                }
                None => read_half.read_buf(&mut read_buf).await?,
            };
            if n == 0 {
                return Ok(()); // orderly close by the peer
            }
            decoder.push(&read_buf);
            read_buf.clear();
            while let Some(frame) = decoder.next_frame()? {
                self.handle_frame(conn, frame).await;
            }
        }
    }

    async fn handle_frame(&self, conn: &Arc<ServerConnection>, mut frame: BytesMut) {
        let opcode = frame.get_i32();
        match RpcOpCode::try_from(opcode) {
            Ok(RpcOpCode::Call) => {
                let dispatch = self.dispatch.clone();
                let conn = conn.clone();
                self.workers
                    .submit(async move {
                        let peer = conn.peer_info().await;
                        match dispatch.handle_call(opcode, &frame, &peer).await {
                            Ok(Some(reply)) => {
                                if let Err(e) = conn.send_reply(&reply).await {
                                    debug!(conn = conn.id(), "failed to send reply: {:#}", e);
                                }
                            }
                            Ok(None) => {}
                            Err(e) => {
                                warn!(conn = conn.id(), peer = %peer.remote_addr,
                                    "undecodable call frame: {:#}", e);
                                let notification = ErrorNotification {
                                    trigger_opcode: opcode,
                                    level: ERROR_LEVEL_SEVERE,
                                    code: 0,
                                    info: format!("{:#}", e),
                                };
                                let _ = conn.send_error(&notification).await;
                            }
                        }
                    })
                    .await;
            }
            Ok(RpcOpCode::Reply) | Ok(RpcOpCode::ErrorNotification) => {
                warn!(conn = conn.id(), opcode, "unexpected protocol frame from a client, dropping");
            }
            Err(_) => {
                let peer = conn.peer_info().await;
                match self.dispatch.check_raw(opcode, &frame, &peer) {
                    Ok(true) => self.bus.dispatch_frame(opcode, frame.freeze()),
                    Ok(false) => debug!(conn = conn.id(), opcode, "application frame vetoed"),
                    Err(e) => warn!(conn = conn.id(), opcode, "pre-handler failed: {:#}", e),
                }
            }
        }
    }
}
