//! Transparent proxy listener
//!
//! A plain TCP listener on loopback; the kernel redirect rules point all
//! traffic for the proxy CIDR at it. An ephemeral port (0) is the default so
//! the listener never collides with the developer's own services.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::error::TproxyError;

/// Listener receiving redirected connections
#[derive(Debug)]
pub struct ProxyListener {
    listener: TcpListener,
}

impl ProxyListener {
    /// Bind on `127.0.0.1:port`; port 0 picks an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::BindError` when binding fails.
    pub async fn bind(port: u16) -> Result<Self, TproxyError> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TproxyError::bind(addr, e.to_string()))?;

        info!(addr = %listener.local_addr()?, "transparent proxy listening");
        Ok(Self { listener })
    }

    /// The bound address (resolves an ephemeral port request)
    ///
    /// # Errors
    ///
    /// Propagates `local_addr` failures.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept one redirected connection.
    ///
    /// # Errors
    ///
    /// Returns `TproxyError::AcceptError` when the accept fails.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), TproxyError> {
        self.listener
            .accept()
            .await
            .map_err(|e| TproxyError::AcceptError(e.to_string()))
    }
}
