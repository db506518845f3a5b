//! Transparent TCP proxy
//!
//! Accepts redirected connections, recovers the address the application
//! actually dialed, maps its proxy IP back to the real cluster destination
//! through the registry, and pipes bytes over a logical tunnel stream.
//!
//! The original destination, not the socket's remote address, is the real
//! target: after a REDIRECT the remote address *is* the proxy IP, useful
//! only as the registry key.

pub mod listener;
pub mod redirect;
pub mod socket;

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tracing::{debug, error, warn};

use crate::registry::ConnectionRegistry;
use crate::tunnel::TunnelHandle;

pub use listener::ProxyListener;
pub use redirect::RedirectGuard;
pub use socket::original_destination;

/// Accept redirected connections until shutdown, one task per connection
pub async fn run_accept_loop(
    listener: ProxyListener,
    registry: Arc<ConnectionRegistry>,
    tunnel: TunnelHandle,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let registry = Arc::clone(&registry);
                        let tunnel = tunnel.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, peer, &registry, &tunnel).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "transparent proxy accept failed");
                        return;
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                debug!("transparent proxy accept loop stopping");
                return;
            }
        }
    }
}

/// Proxy one redirected connection through the tunnel
async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    registry: &ConnectionRegistry,
    tunnel: &TunnelHandle,
) {
    let original_dst = match socket::original_destination(&stream) {
        Ok(addr) => addr,
        Err(e) => {
            warn!(%peer, error = %e, "failed to recover original destination");
            return;
        }
    };

    let IpAddr::V4(proxy_ip) = original_dst.ip() else {
        debug!(%peer, %original_dst, "ignoring non-IPv4 destination");
        return;
    };

    let Some(entry) = registry.lookup(proxy_ip) else {
        // Closing without a response reads as connection-refused upstream.
        debug!(%peer, %proxy_ip, "no registry entry for redirected destination");
        return;
    };

    let real_dst = SocketAddr::new(IpAddr::V4(entry.real_ip), original_dst.port());
    debug!(
        %peer,
        hostname = %entry.hostname,
        %real_dst,
        "proxying intercepted connection"
    );

    let mut tunnel_stream = match tunnel.open_stream(peer, real_dst).await {
        Ok(s) => s,
        Err(e) => {
            warn!(%peer, %real_dst, error = %e, "failed to open tunnel stream");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut stream, &mut tunnel_stream).await {
        Ok((to_cluster, from_cluster)) => {
            debug!(%peer, %real_dst, to_cluster, from_cluster, "intercepted connection finished");
        }
        Err(e) => {
            debug!(%peer, %real_dst, error = %e, "intercepted connection ended");
        }
    }
}
