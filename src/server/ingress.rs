//! Ingress listeners
//!
//! One TCP listener per configured `port/proto` spec. Each accepted
//! connection becomes a logical tunnel connection whose first frame carries
//! the workstation's application port as the destination, so the far side
//! knows where to dial.

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use super::tunnel::ActiveTunnel;
use crate::config::ListenPortSpec;
use crate::error::ServerError;
use crate::tunnel::{connection_id, TunnelHandle};

/// A bound ingress listener
#[derive(Debug)]
pub struct IngressListener {
    listener: TcpListener,
    spec: ListenPortSpec,
}

impl IngressListener {
    /// Bind the listener for one spec on all interfaces.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BindError` when binding fails.
    pub async fn bind(spec: ListenPortSpec) -> Result<Self, ServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], spec.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::bind(addr, e.to_string()))?;
        info!(%spec, "ingress listener bound");
        Ok(Self { listener, spec })
    }

    /// The bound address
    ///
    /// # Errors
    ///
    /// Propagates `local_addr` failures.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown, forwarding each over the tunnel
    /// toward the workstation's application port.
    pub async fn run(
        self,
        active: ActiveTunnel,
        app_port: u16,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let tunnel = active.read().clone();
                            match tunnel.filter(TunnelHandle::is_running) {
                                Some(handle) => {
                                    tokio::spawn(async move {
                                        forward_ingress(stream, peer, handle, app_port).await;
                                    });
                                }
                                None => {
                                    // No workstation attached; drop like a
                                    // refused connection.
                                    debug!(%peer, spec = %self.spec, "no active tunnel for ingress connection");
                                }
                            }
                        }
                        Err(e) => {
                            error!(spec = %self.spec, error = %e, "ingress accept failed");
                            return;
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!(spec = %self.spec, "ingress listener stopping");
                    return;
                }
            }
        }
    }
}

/// Pump one accepted ingress connection across the tunnel
async fn forward_ingress(
    mut stream: TcpStream,
    peer: SocketAddr,
    tunnel: TunnelHandle,
    app_port: u16,
) {
    // The id records the real accept 4-tuple; the destination address tells
    // the workstation where to dial.
    let local = match stream.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            debug!(%peer, error = %e, "failed to read local address");
            return;
        }
    };
    let id = connection_id(peer, local);
    let dst = SocketAddr::from(([127, 0, 0, 1], app_port));

    let mut tunnel_stream = match tunnel.open_stream_with_id(id.clone(), peer, dst).await {
        Ok(s) => s,
        Err(e) => {
            debug!(%peer, error = %e, "failed to open ingress stream");
            return;
        }
    };

    debug!(%id, "forwarding ingress connection");
    match tokio::io::copy_bidirectional(&mut stream, &mut tunnel_stream).await {
        Ok((inbound, outbound)) => debug!(%id, inbound, outbound, "ingress connection finished"),
        Err(e) => debug!(%id, error = %e, "ingress connection ended"),
    }
}
