//! DNS interceptor, UDP transport

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, trace};

use super::processor::{forward_or_servfail, handle_query, servfail, QueryDisposition, SharedDnsContext};

/// UDP DNS server
pub struct DnsUdpServer {
    socket: Arc<UdpSocket>,
    ctx: SharedDnsContext,
}

impl DnsUdpServer {
    /// Bind to the given address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, ctx: SharedDnsContext) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            ctx,
        })
    }

    /// The bound address
    ///
    /// # Errors
    ///
    /// Propagates `local_addr` failures.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Receive queries until shutdown. Each query is handled on its own task
    /// because a matched query suspends on the tunnel's resolve RPC.
    ///
    /// # Errors
    ///
    /// Never returns an error in practice; kept fallible to mirror the
    /// listener lifecycle of the TCP side.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> io::Result<()> {
        // EDNS allows up to 64 KiB.
        let mut buf = vec![0u8; 65_535];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((n, peer)) => {
                            trace!(%peer, bytes = n, "DNS query received");
                            let raw = buf[..n].to_vec();
                            let socket = Arc::clone(&self.socket);
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                handle_packet(socket, raw, peer, ctx).await;
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "DNS UDP recv error");
                            time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("DNS UDP server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_packet(socket: Arc<UdpSocket>, raw: Vec<u8>, peer: SocketAddr, ctx: SharedDnsContext) {
    let req = match Message::from_vec(&raw) {
        Ok(m) => m,
        Err(e) => {
            debug!(%peer, error = %e, "unparseable DNS query");
            return;
        }
    };

    let response_bytes = match handle_query(&req, &ctx).await {
        QueryDisposition::Respond(response) => match response.to_vec() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "failed to encode DNS response");
                servfail(&req).to_vec().unwrap_or_default()
            }
        },
        QueryDisposition::Forward => forward_or_servfail(&raw, &req, &ctx.upstream, false).await,
    };

    if response_bytes.is_empty() {
        return;
    }
    if let Err(e) = socket.send_to(&response_bytes, peer).await {
        debug!(%peer, error = %e, "DNS UDP send error");
    }
}
