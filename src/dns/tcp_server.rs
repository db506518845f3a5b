//! DNS interceptor, TCP transport
//!
//! DNS over TCP frames every message with a 2-byte length prefix
//! (RFC 1035 §4.2.2). A client connection may carry several queries.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time;
use tracing::{debug, error, trace};

use super::processor::{forward_or_servfail, handle_query, servfail, QueryDisposition, SharedDnsContext};

/// TCP DNS server
pub struct DnsTcpServer {
    listener: TcpListener,
    ctx: SharedDnsContext,
}

impl DnsTcpServer {
    /// Bind to the given address.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, ctx: SharedDnsContext) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, ctx })
    }

    /// The bound address
    ///
    /// # Errors
    ///
    /// Propagates `local_addr` failures.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept clients until shutdown.
    ///
    /// # Errors
    ///
    /// Never returns an error in practice; accept faults are logged and
    /// retried after a pause.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> io::Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            trace!(%peer, "DNS TCP client accepted");
                            let ctx = Arc::clone(&self.ctx);
                            tokio::spawn(async move {
                                if let Err(e) = handle_client(stream, peer, ctx).await {
                                    debug!(%peer, error = %e, "DNS TCP client error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "DNS TCP accept error");
                            time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("DNS TCP server stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    ctx: SharedDnsContext,
) -> io::Result<()> {
    let mut length_buf = [0u8; 2];
    let mut message_buf = BytesMut::new();

    loop {
        match stream.read_exact(&mut length_buf).await {
            Ok(..) => {}
            Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }

        let length = u16::from_be_bytes(length_buf) as usize;
        if length == 0 {
            debug!(%peer, "zero-length DNS TCP message");
            continue;
        }

        message_buf.resize(length, 0);
        stream.read_exact(&mut message_buf).await?;

        let req = match Message::from_vec(&message_buf) {
            Ok(m) => m,
            Err(e) => {
                debug!(%peer, error = %e, "unparseable DNS TCP query");
                return Err(io::Error::other(e));
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
            QueryDisposition::Forward => {
                forward_or_servfail(&message_buf, &req, &ctx.upstream, true).await
            }
        };

        if response_bytes.is_empty() {
            continue;
        }
        stream
            .write_all(&(response_bytes.len() as u16).to_be_bytes())
            .await?;
        stream.write_all(&response_bytes).await?;
    }

    Ok(())
}
