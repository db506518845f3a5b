//! In-cluster proxy server
//!
//! Terminates the tunnel from the workstation, resolves cluster DNS for it,
//! dials real cluster destinations for egress connections, and accepts
//! configured ingress ports whose traffic travels the tunnel back to the
//! workstation.

pub mod ingress;
pub mod tunnel;

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::{BridgeError, ServerError};

pub use ingress::IngressListener;
pub use tunnel::{serve_tunnel_conn, ActiveTunnel, REGISTRATION_TIMEOUT};

/// The in-cluster proxy server
pub struct ProxyServer {
    cfg: ServerConfig,
}

impl ProxyServer {
    /// Create a server from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when validation fails.
    pub fn new(cfg: ServerConfig) -> Result<Self, BridgeError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Bind everything and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns a bind error at startup; accept-loop faults after startup are
    /// logged and terminate the affected listener only.
    pub async fn run(self, shutdown_tx: broadcast::Sender<()>) -> Result<(), BridgeError> {
        let listener = TcpListener::bind(self.cfg.bind_addr)
            .await
            .map_err(|e| ServerError::bind(self.cfg.bind_addr, e.to_string()))?;
        info!(addr = %self.cfg.bind_addr, "proxy server listening for tunnels");

        let active: ActiveTunnel = Arc::new(RwLock::new(None));

        for spec in self.cfg.parsed_listen_ports()? {
            let ingress = IngressListener::bind(spec).await?;
            tokio::spawn(ingress.run(
                Arc::clone(&active),
                self.cfg.app_port,
                shutdown_tx.subscribe(),
            ));
        }

        let mut shutdown_rx = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "tunnel connection accepted");
                            let active = Arc::clone(&active);
                            let dial_timeout = self.cfg.dial_timeout();
                            tokio::spawn(async move {
                                serve_tunnel_conn(stream, peer, active, dial_timeout).await;
                            });
                        }
                        Err(e) => {
                            return Err(ServerError::IoError(e).into());
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("proxy server stopping");
                    if let Some(handle) = active.read().clone() {
                        handle.shutdown();
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config(bind_port: u16, listen_ports: Vec<String>) -> ServerConfig {
        ServerConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], bind_port)),
            app_port: 3000,
            listen_ports,
            dial_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn test_client_connects_and_resolves() {
        // Ephemeral bind: pick a port first by binding then dropping.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let server = ProxyServer::new(test_config(addr.port(), vec![])).unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let tx = shutdown_tx.clone();
        tokio::spawn(async move { server.run(tx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let handle = tunnel::connect(&format!("ws://127.0.0.1:{}/tunnel", addr.port()), 3000)
            .await
            .unwrap();
        let addrs = handle
            .resolve_dns("127.0.0.1", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(addrs.len(), 1);

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_second_tunnel_refused_while_first_active() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let server = ProxyServer::new(test_config(addr.port(), vec![])).unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let tx = shutdown_tx.clone();
        tokio::spawn(async move { server.run(tx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let url = format!("ws://127.0.0.1:{}/tunnel", addr.port());
        let first = tunnel::connect(&url, 3000).await.unwrap();
        // A round-trip RPC proves the server has processed the registration
        // and claimed the active slot.
        first
            .resolve_dns("127.0.0.1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(first.is_running());

        // The second connects at the WebSocket level but is told to go away.
        let second = tunnel::connect(&url, 3000).await.unwrap();
        let result = second.wait().await;
        assert!(result.is_err(), "second tunnel must be refused");
        assert!(first.is_running(), "first tunnel must survive");

        let _ = shutdown_tx.send(());
    }

    #[tokio::test]
    async fn test_ingress_end_to_end() {
        // The "application" on the workstation side.
        let app = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let app_addr = app.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = app.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 3];
                    sock.read_exact(&mut buf).await.unwrap();
                    assert_eq!(&buf, b"GET");
                    sock.write_all(b"OK").await.unwrap();
                });
            }
        });

        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tunnel_addr = probe.local_addr().unwrap();
        drop(probe);
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ingress_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut cfg = test_config(tunnel_addr.port(), vec![format!("{ingress_port}/tcp")]);
        cfg.app_port = app_addr.port();
        let server = ProxyServer::new(cfg).unwrap();
        let (shutdown_tx, _) = broadcast::channel(1);
        let tx = shutdown_tx.clone();
        tokio::spawn(async move { server.run(tx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Workstation attaches, advertising its app port.
        let handle = tunnel::connect(
            &format!("ws://127.0.0.1:{}/tunnel", tunnel_addr.port()),
            app_addr.port(),
        )
        .await
        .unwrap();
        // Wait until the server has claimed the active slot before sending
        // external traffic at the ingress port.
        handle
            .resolve_dns("127.0.0.1", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(handle.is_running());

        // External traffic hits the pod's ingress port...
        let mut external = tokio::net::TcpStream::connect(("127.0.0.1", ingress_port))
            .await
            .unwrap();
        external.write_all(b"GET").await.unwrap();

        // ...and the response comes back from the workstation's app.
        let mut buf = [0u8; 2];
        external.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"OK");

        let _ = shutdown_tx.send(());
    }
}
