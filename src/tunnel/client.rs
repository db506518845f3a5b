//! Workstation-side tunnel connector
//!
//! Dials the in-cluster proxy over WebSocket, sends the registration frame,
//! and hands the established stream to the multiplexer. Exactly one attempt
//! is made; reconnect policy belongs to the caller.

use std::time::Duration;

use futures::SinkExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, info};
use url::Url;

use super::mux::{self, EndpointConfig, TunnelHandle};
use super::protocol::{Frame, RegistrationFrame};
use crate::error::TunnelError;

/// Deadline for the TCP connect and WebSocket handshake together
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect to the proxy server and start the tunnel.
///
/// The dialed socket gets long-lived TCP keepalive settings; application
/// liveness is covered by the multiplexer's WebSocket pings.
///
/// # Errors
///
/// Returns `TunnelError` when the URL is invalid, the dial or handshake
/// fails, or the registration frame cannot be sent.
pub async fn connect(tunnel_url: &str, app_port: u16) -> Result<TunnelHandle, TunnelError> {
    let url = Url::parse(tunnel_url).map_err(|e| TunnelError::InvalidUrl {
        url: tunnel_url.to_string(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "ws" {
        return Err(TunnelError::InvalidUrl {
            url: tunnel_url.to_string(),
            reason: format!("unsupported scheme {:?}, expected ws", url.scheme()),
        });
    }

    let host = url
        .host_str()
        .ok_or_else(|| TunnelError::InvalidUrl {
            url: tunnel_url.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let port = url.port().unwrap_or(80);

    debug!(%host, port, "dialing tunnel endpoint");
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port)))
        .await
        .map_err(|_| TunnelError::connect(format!("{host}:{port}"), "connect timeout"))?
        .map_err(|e| TunnelError::connect(format!("{host}:{port}"), e.to_string()))?;

    configure_keepalive(&stream);

    let (mut ws, _response) =
        tokio::time::timeout(CONNECT_TIMEOUT, client_async(tunnel_url, stream))
            .await
            .map_err(|_| TunnelError::connect(format!("{host}:{port}"), "handshake timeout"))?
            .map_err(|e| TunnelError::connect(format!("{host}:{port}"), e.to_string()))?;

    let registration = Frame::Registration(RegistrationFrame {
        is_server: false,
        connection_key: random_connection_key(),
    });
    ws.send(Message::Binary(registration.to_bytes()))
        .await
        .map_err(|e| TunnelError::RegistrationFailed(e.to_string()))?;

    info!(url = %tunnel_url, "tunnel established");
    Ok(mux::start(ws, EndpointConfig::workstation(app_port)))
}

/// Long idle TCP settings so NAT entries and conntrack state survive quiet
/// periods between the application-level pings.
fn configure_keepalive(stream: &TcpStream) {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(20));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        debug!(error = %e, "failed to set TCP keepalive on tunnel socket");
    }
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "failed to set TCP_NODELAY on tunnel socket");
    }
}

fn random_connection_key() -> String {
    let raw: [u8; 16] = rand::random();
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let err = connect("not a url", 3000).await.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_rejected() {
        let err = connect("https://example.com/tunnel", 3000).await.unwrap_err();
        assert!(matches!(err, TunnelError::InvalidUrl { .. }));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        // Port 1 on loopback refuses connections.
        let err = connect("ws://127.0.0.1:1/tunnel", 3000).await.unwrap_err();
        assert!(matches!(err, TunnelError::ConnectFailed { .. }));
    }

    #[test]
    fn test_connection_key_shape() {
        let key = random_connection_key();
        assert_eq!(key.len(), 32);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(key, random_connection_key());
    }
}
