//! Tunnel multiplexer
//!
//! One WebSocket stream carries every logical connection plus DNS RPC
//! traffic. A single writer task drains a bounded outbound queue (enqueueing
//! blocks callers on backpressure); a single reader task demultiplexes
//! incoming frames by connection id. The endpoint owns the `id → connection`
//! map; streams carry only their id and a sender into the shared queue, which
//! keeps the ownership graph acyclic.
//!
//! A data frame for an unknown id creates the connection: the endpoint dials
//! the frame's destination address (the workstation falls back to its
//! configured application port) and pairs the socket with the id. This is
//! what makes the server side effectively stateless between frames.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

use super::protocol::{
    DataFrame, DnsRequestFrame, DnsResponseFrame, Frame,
};
use super::stream::{TunnelStream, INBOUND_BUFFER_DEPTH};
use crate::error::TunnelError;

/// Depth of the shared outbound frame queue
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// WebSocket ping cadence
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Tolerated pong silence beyond one ping interval
pub const PONG_GRACE: Duration = Duration::from_secs(10);

/// Default deadline for the DNS resolve RPC
pub const DEFAULT_RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a closed id is remembered, so late frames do not resurrect it
const TOMBSTONE_TTL: Duration = Duration::from_secs(10);

/// Which side of the tunnel this endpoint is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Workstation: unknown ids are inbound ingress connections dialed to the
    /// local application port
    Workstation,
    /// In-cluster proxy: unknown ids are egress connections dialed to the
    /// frame's destination address, and DNS resolve requests are served
    Cluster,
}

/// Endpoint tuning
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub role: Role,
    /// Local application port the workstation dials for ingress connections
    pub app_port: u16,
    /// Deadline for dialing the target of an unknown id
    pub dial_timeout: Duration,
    pub ping_interval: Duration,
    pub pong_grace: Duration,
}

impl EndpointConfig {
    /// Configuration for the workstation side
    #[must_use]
    pub fn workstation(app_port: u16) -> Self {
        Self {
            role: Role::Workstation,
            app_port,
            dial_timeout: Duration::from_secs(5),
            ping_interval: PING_INTERVAL,
            pong_grace: PONG_GRACE,
        }
    }

    /// Configuration for the in-cluster proxy side
    #[must_use]
    pub fn cluster() -> Self {
        Self {
            role: Role::Cluster,
            app_port: 0,
            dial_timeout: Duration::from_secs(5),
            ping_interval: PING_INTERVAL,
            pong_grace: PONG_GRACE,
        }
    }
}

#[derive(Debug, Clone)]
enum TunnelState {
    Running,
    Closed(Option<String>),
}

struct ConnHandle {
    inbound: mpsc::Sender<Bytes>,
}

struct Shared {
    cfg: EndpointConfig,
    conns: DashMap<String, ConnHandle>,
    closed_ids: DashMap<String, Instant>,
    pending: DashMap<u32, oneshot::Sender<DnsResponseFrame>>,
    next_rpc: AtomicU32,
    outbound_tx: mpsc::Sender<Frame>,
    last_pong: parking_lot::Mutex<Instant>,
    state_tx: watch::Sender<TunnelState>,
}

impl Shared {
    fn is_running(&self) -> bool {
        matches!(*self.state_tx.borrow(), TunnelState::Running)
    }

    /// Transition to closed, tearing down every logical connection and
    /// pending RPC. Only the first call has any effect.
    fn close(&self, reason: Option<String>) {
        let transitioned = self.state_tx.send_if_modified(|state| {
            if matches!(state, TunnelState::Running) {
                *state = TunnelState::Closed(reason.clone());
                true
            } else {
                false
            }
        });
        if transitioned {
            match &reason {
                Some(r) => warn!(reason = %r, "tunnel failed, tearing down all connections"),
                None => info!("tunnel closed"),
            }
            // Dropping the inbound senders delivers EOF to every consumer.
            self.conns.clear();
            self.pending.clear();
        }
    }

    fn register_stream(
        self: &Arc<Self>,
        id: String,
        src_addr: String,
        dst_addr: String,
        initial: Option<Bytes>,
    ) -> TunnelStream {
        let (tx, rx) = mpsc::channel(INBOUND_BUFFER_DEPTH);
        if let Some(payload) = initial {
            if !payload.is_empty() {
                // The buffer is fresh; capacity is available.
                let _ = tx.try_send(payload);
            }
        }
        self.conns.insert(id.clone(), ConnHandle { inbound: tx });
        TunnelStream::new(id, src_addr, dst_addr, rx, self.outbound_tx.clone())
    }

    fn remove_conn(&self, id: &str) {
        if self.conns.remove(id).is_some() {
            self.tombstone(id);
        }
    }

    fn tombstone(&self, id: &str) {
        self.closed_ids.retain(|_, t| t.elapsed() < TOMBSTONE_TTL);
        self.closed_ids.insert(id.to_string(), Instant::now());
    }

    fn recently_closed(&self, id: &str) -> bool {
        self.closed_ids
            .get(id)
            .is_some_and(|t| t.elapsed() < TOMBSTONE_TTL)
    }
}

/// Handle to a running tunnel endpoint.
///
/// Cheap to clone; all clones drive the same tunnel.
#[derive(Clone)]
pub struct TunnelHandle {
    shared: Arc<Shared>,
    state_rx: watch::Receiver<TunnelState>,
}

impl TunnelHandle {
    /// Whether the tunnel is still carrying traffic
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Open a logical connection with the canonical id for this pair.
    ///
    /// An empty data frame announces the connection so the remote side dials
    /// even for protocols where the server speaks first.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Closed` if the tunnel is down.
    pub async fn open_stream(
        &self,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<TunnelStream, TunnelError> {
        self.open_stream_with_id(super::protocol::connection_id(src, dst), src, dst)
            .await
    }

    /// Open a logical connection under an explicit id.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Closed` if the tunnel is down.
    pub async fn open_stream_with_id(
        &self,
        id: String,
        src: SocketAddr,
        dst: SocketAddr,
    ) -> Result<TunnelStream, TunnelError> {
        if !self.is_running() {
            return Err(TunnelError::Closed);
        }
        let stream =
            self.shared
                .register_stream(id.clone(), src.to_string(), dst.to_string(), None);
        self.shared
            .outbound_tx
            .send(Frame::data(id, src.to_string(), dst.to_string(), Bytes::new()))
            .await
            .map_err(|_| TunnelError::Closed)?;
        Ok(stream)
    }

    /// Resolve a hostname through the tunnel's DNS RPC.
    ///
    /// # Errors
    ///
    /// `ResolveTimeout` past the deadline, `ResolveFailed` when the remote
    /// resolver reports an error, `Closed` when the tunnel is down.
    pub async fn resolve_dns(
        &self,
        hostname: &str,
        deadline: Duration,
    ) -> Result<Vec<Ipv4Addr>, TunnelError> {
        if !self.is_running() {
            return Err(TunnelError::Closed);
        }

        let rpc_id = self.shared.next_rpc.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(rpc_id, tx);

        let request = Frame::DnsRequest(DnsRequestFrame {
            rpc_id,
            hostname: hostname.to_string(),
        });
        if self.shared.outbound_tx.send(request).await.is_err() {
            self.shared.pending.remove(&rpc_id);
            return Err(TunnelError::Closed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(error) => Err(TunnelError::ResolveFailed(error)),
                None => Ok(response.addresses),
            },
            Ok(Err(_)) => Err(TunnelError::Closed),
            Err(_) => {
                self.shared.pending.remove(&rpc_id);
                Err(TunnelError::ResolveTimeout)
            }
        }
    }

    /// Block until the tunnel ends.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError::Fatal` when the tunnel died abnormally.
    pub async fn wait(&self) -> Result<(), TunnelError> {
        let mut rx = self.state_rx.clone();
        loop {
            {
                let state = rx.borrow_and_update();
                match &*state {
                    TunnelState::Closed(Some(reason)) => {
                        return Err(TunnelError::Fatal(reason.clone()))
                    }
                    TunnelState::Closed(None) => return Ok(()),
                    TunnelState::Running => {}
                }
            }
            if rx.changed().await.is_err() {
                return Ok(());
            }
        }
    }

    /// Close the tunnel cleanly, tearing down all logical connections
    pub fn shutdown(&self) {
        self.shared.close(None);
    }

    /// Number of live logical connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.conns.len()
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("running", &self.is_running())
            .field("connections", &self.shared.conns.len())
            .finish()
    }
}

/// Start the reader and writer tasks over an established WebSocket stream
pub fn start<S>(ws: WebSocketStream<S>, cfg: EndpointConfig) -> TunnelHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let (state_tx, state_rx) = watch::channel(TunnelState::Running);

    let shared = Arc::new(Shared {
        cfg,
        conns: DashMap::new(),
        closed_ids: DashMap::new(),
        pending: DashMap::new(),
        next_rpc: AtomicU32::new(1),
        outbound_tx,
        last_pong: parking_lot::Mutex::new(Instant::now()),
        state_tx,
    });

    let (sink, stream) = ws.split();
    tokio::spawn(writer_task(sink, outbound_rx, Arc::clone(&shared)));
    tokio::spawn(reader_task(stream, Arc::clone(&shared)));

    TunnelHandle { shared, state_rx }
}

async fn writer_task<S>(
    mut sink: futures::stream::SplitSink<WebSocketStream<S>, Message>,
    mut outbound_rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut state_rx = shared.state_tx.subscribe();
    let mut ping = tokio::time::interval(shared.cfg.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_frame = outbound_rx.recv() => {
                let Some(frame) = maybe_frame else {
                    // Every handle and stream is gone.
                    shared.close(None);
                    break;
                };
                if let Frame::Close(c) = &frame {
                    shared.remove_conn(&c.id);
                }
                trace!(?frame, "sending tunnel frame");
                if let Err(e) = sink.send(Message::Binary(frame.to_bytes())).await {
                    shared.close(Some(format!("tunnel write failed: {e}")));
                    break;
                }
            }
            _ = ping.tick() => {
                let pong_age = shared.last_pong.lock().elapsed();
                if pong_age > shared.cfg.ping_interval + shared.cfg.pong_grace {
                    shared.close(Some(format!(
                        "keepalive timeout: no pong for {}s",
                        pong_age.as_secs()
                    )));
                    break;
                }
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    shared.close(Some(format!("tunnel ping failed: {e}")));
                    break;
                }
            }
            _ = state_rx.changed() => {
                // Drain whatever is already queued, best effort, then say goodbye.
                while let Ok(frame) = outbound_rx.try_recv() {
                    if let Frame::Close(c) = &frame {
                        shared.remove_conn(&c.id);
                    }
                    if sink.send(Message::Binary(frame.to_bytes())).await.is_err() {
                        break;
                    }
                }
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
    debug!("tunnel writer task exited");
}

async fn reader_task<S>(
    mut stream: futures::stream::SplitStream<WebSocketStream<S>>,
    shared: Arc<Shared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut state_rx = shared.state_tx.subscribe();

    loop {
        let item = tokio::select! {
            item = stream.next() => item,
            _ = state_rx.changed() => {
                if !shared.is_running() {
                    break;
                }
                continue;
            }
        };

        match item {
            Some(Ok(Message::Binary(data))) => match Frame::decode(Bytes::from(data)) {
                Ok(frame) => handle_frame(&shared, frame).await,
                Err(e) => {
                    shared.close(Some(format!("tunnel protocol error: {e}")));
                    break;
                }
            },
            Some(Ok(Message::Pong(_))) => {
                *shared.last_pong.lock() = Instant::now();
            }
            Some(Ok(Message::Ping(_) | Message::Text(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                shared.close(Some("tunnel closed by peer".to_string()));
                break;
            }
            Some(Err(e)) => {
                shared.close(Some(format!("tunnel read failed: {e}")));
                break;
            }
        }

        if !shared.is_running() {
            break;
        }
    }
    debug!("tunnel reader task exited");
}

async fn handle_frame(shared: &Arc<Shared>, frame: Frame) {
    match frame {
        Frame::Data(data) => handle_data_frame(shared, data).await,
        Frame::Close(close) => {
            if let Some(error) = &close.error {
                debug!(id = %close.id, error = %error, "remote closed connection with error");
            } else {
                trace!(id = %close.id, "remote closed connection");
            }
            shared.remove_conn(&close.id);
        }
        Frame::DnsRequest(request) => handle_dns_request(shared, request),
        Frame::DnsResponse(response) => {
            if let Some((_, tx)) = shared.pending.remove(&response.rpc_id) {
                let _ = tx.send(response);
            } else {
                trace!(rpc_id = response.rpc_id, "dropping unmatched DNS response");
            }
        }
        Frame::Registration(_) => {
            debug!("ignoring registration frame on an established tunnel");
        }
        Frame::Fatal(fatal) => {
            shared.close(Some(fatal.message));
        }
    }
}

async fn handle_data_frame(shared: &Arc<Shared>, frame: DataFrame) {
    // Known id: deliver payload in receive order. The close for an id always
    // trails its data through this same task, so bytes are never lost.
    if let Some(conn) = shared.conns.get(&frame.id) {
        let tx = conn.inbound.clone();
        drop(conn);
        if frame.payload.is_empty() {
            return;
        }
        if tx.send(frame.payload).await.is_err() {
            // Consumer is gone; its close frame is already queued.
            shared.remove_conn(&frame.id);
        }
        return;
    }

    if shared.recently_closed(&frame.id) {
        trace!(id = %frame.id, "dropping late frame for closed connection");
        return;
    }

    // Unknown id: the remote side opened a connection toward us.
    let dial_addr = match (frame.dst_addr.parse::<SocketAddr>(), shared.cfg.role) {
        (Ok(addr), _) => addr,
        (Err(_), Role::Workstation) => {
            SocketAddr::from(([127, 0, 0, 1], shared.cfg.app_port))
        }
        (Err(_), Role::Cluster) => {
            warn!(id = %frame.id, dst = %frame.dst_addr, "unparseable destination address");
            let _ = shared
                .outbound_tx
                .send(Frame::close_with_error(
                    frame.id.clone(),
                    format!("invalid destination address: {}", frame.dst_addr),
                ))
                .await;
            shared.tombstone(&frame.id);
            return;
        }
    };

    debug!(id = %frame.id, %dial_addr, "new inbound tunnel connection");

    // Register before dialing so frames arriving mid-dial buffer on the
    // connection instead of spawning a second dial.
    let stream = shared.register_stream(
        frame.id.clone(),
        frame.dst_addr.clone(),
        frame.src_addr.clone(),
        Some(frame.payload),
    );
    tokio::spawn(adopt_connection(Arc::clone(shared), stream, dial_addr));
}

/// Dial the local target for a remotely opened connection and pump bytes
async fn adopt_connection(shared: Arc<Shared>, mut stream: TunnelStream, dial_addr: SocketAddr) {
    let id = stream.id().to_string();
    match tokio::time::timeout(shared.cfg.dial_timeout, TcpStream::connect(dial_addr)).await {
        Ok(Ok(mut socket)) => {
            match tokio::io::copy_bidirectional(&mut socket, &mut stream).await {
                Ok((to_tunnel, from_tunnel)) => {
                    debug!(%id, to_tunnel, from_tunnel, "tunnel connection finished");
                }
                Err(e) => debug!(%id, error = %e, "tunnel connection ended"),
            }
        }
        Ok(Err(e)) => {
            debug!(%id, %dial_addr, error = %e, "dial failed for tunnel connection");
            stream.disarm_close();
            shared.remove_conn(&id);
            let _ = shared
                .outbound_tx
                .send(Frame::close_with_error(id, e.to_string()))
                .await;
        }
        Err(_) => {
            debug!(%id, %dial_addr, "dial timed out for tunnel connection");
            stream.disarm_close();
            shared.remove_conn(&id);
            let _ = shared
                .outbound_tx
                .send(Frame::close_with_error(id, "dial timeout"))
                .await;
        }
    }
}

/// Serve a DNS resolve request against the local (cluster) resolver
fn handle_dns_request(shared: &Arc<Shared>, request: DnsRequestFrame) {
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        let response = if shared.cfg.role == Role::Cluster {
            resolve_locally(request.rpc_id, &request.hostname).await
        } else {
            DnsResponseFrame {
                rpc_id: request.rpc_id,
                addresses: Vec::new(),
                error: Some("endpoint does not serve DNS resolution".to_string()),
            }
        };
        let _ = shared.outbound_tx.send(Frame::DnsResponse(response)).await;
    });
}

async fn resolve_locally(rpc_id: u32, hostname: &str) -> DnsResponseFrame {
    match tokio::net::lookup_host((hostname, 0u16)).await {
        Ok(addrs) => {
            let addresses: Vec<Ipv4Addr> = addrs
                .filter_map(|a| match a.ip() {
                    IpAddr::V4(v4) => Some(v4),
                    IpAddr::V6(_) => None,
                })
                .collect();
            if addresses.is_empty() {
                DnsResponseFrame {
                    rpc_id,
                    addresses,
                    error: Some(format!("no A records for {hostname}")),
                }
            } else {
                DnsResponseFrame {
                    rpc_id,
                    addresses,
                    error: None,
                }
            }
        }
        Err(e) => DnsResponseFrame {
            rpc_id,
            addresses: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}
