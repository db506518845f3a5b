//! Tunnel acceptance
//!
//! Upgrades an accepted TCP connection to WebSocket, reads the registration
//! frame under a deadline, and enforces the one-active-tunnel rule. A second
//! concurrent tunnel is refused with a fatal frame rather than displacing
//! the live one.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::tunnel::mux::{self, EndpointConfig};
use crate::tunnel::protocol::{FatalFrame, Frame};
use crate::tunnel::TunnelHandle;

/// Deadline for the registration frame after the WebSocket handshake
pub const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Slot holding the single active tunnel
pub type ActiveTunnel = Arc<RwLock<Option<TunnelHandle>>>;

/// Serve one tunnel connection to completion.
pub async fn serve_tunnel_conn(
    stream: TcpStream,
    peer: SocketAddr,
    active: ActiveTunnel,
    dial_timeout: Duration,
) {
    let mut ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };

    let registration =
        match tokio::time::timeout(REGISTRATION_TIMEOUT, read_registration(&mut ws)).await {
            Ok(Some(reg)) => reg,
            Ok(None) => {
                debug!(%peer, "tunnel closed before registering");
                return;
            }
            Err(_) => {
                warn!(%peer, "no registration frame within deadline");
                send_fatal(&mut ws, "registration timeout").await;
                return;
            }
        };

    if registration.is_server {
        // Both sides claiming the server role means a misconfigured client.
        warn!(%peer, "rejecting registration with server role");
        send_fatal(&mut ws, "expected a client registration").await;
        return;
    }

    // Claim the active slot, releasing it only when this tunnel ends.
    let already_active = {
        let slot = active.write();
        slot.as_ref().is_some_and(TunnelHandle::is_running)
    };
    if already_active {
        warn!(%peer, "refusing second tunnel while one is active");
        send_fatal(&mut ws, "a tunnel is already active").await;
        return;
    }
    let handle = {
        let mut slot = active.write();
        let mut cfg = EndpointConfig::cluster();
        cfg.dial_timeout = dial_timeout;
        let handle = mux::start(ws, cfg);
        *slot = Some(handle.clone());
        handle
    };

    info!(%peer, connection_key = %registration.connection_key, "tunnel registered");

    match handle.wait().await {
        Ok(()) => info!(%peer, "tunnel ended"),
        Err(e) => warn!(%peer, error = %e, "tunnel ended abnormally"),
    }

    let mut slot = active.write();
    if slot.as_ref().is_some_and(|h| !h.is_running()) {
        *slot = None;
    }
}

/// First frame must be a registration.
async fn read_registration(
    ws: &mut WebSocketStream<TcpStream>,
) -> Option<crate::tunnel::protocol::RegistrationFrame> {
    loop {
        match ws.next().await? {
            Ok(Message::Binary(data)) => match Frame::decode(Bytes::from(data)) {
                Ok(Frame::Registration(reg)) => return Some(reg),
                Ok(other) => {
                    debug!(?other, "expected registration as the first frame");
                    return None;
                }
                Err(e) => {
                    debug!(error = %e, "unparseable registration frame");
                    return None;
                }
            },
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(_) | Err(_) => return None,
        }
    }
}

async fn send_fatal(ws: &mut WebSocketStream<TcpStream>, message: &str) {
    let frame = Frame::Fatal(FatalFrame {
        message: message.to_string(),
    });
    let _ = ws.send(Message::Binary(frame.to_bytes())).await;
    let _ = ws.close(None).await;
}
