//! Multiplexed tunnel between the workstation and the in-cluster proxy
//!
//! A single WebSocket stream carries every logical L4 connection in both
//! directions, plus the DNS resolve RPC and connection lifecycle frames.
//! The deliberate choice of *one* stream over one-connection-per-stream
//! trades head-of-line blocking (acceptable for developer-interactive
//! traffic) for a single handshake and a single pairing to manage.
//!
//! - [`protocol`]: the binary frame codec
//! - [`stream`]: [`TunnelStream`], one logical connection
//! - [`mux`]: the reader/writer tasks and the [`TunnelHandle`] API
//! - [`client`]: workstation-side connector

pub mod client;
pub mod mux;
pub mod protocol;
pub mod stream;

use std::net::Ipv4Addr;

use async_trait::async_trait;

use crate::error::TunnelError;

pub use client::connect;
pub use mux::{EndpointConfig, Role, TunnelHandle, DEFAULT_RESOLVE_TIMEOUT};
pub use protocol::{connection_id, Frame};
pub use stream::TunnelStream;

/// Hostname resolution through the tunnel.
///
/// The DNS interceptor consumes the tunnel through this seam so it can be
/// tested against a stub resolver.
#[async_trait]
pub trait Resolve: Send + Sync {
    /// Resolve a hostname to its A addresses via the cluster-side resolver.
    ///
    /// # Errors
    ///
    /// Returns `TunnelError` when the RPC fails, times out, or the tunnel is
    /// down.
    async fn resolve(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, TunnelError>;
}

#[async_trait]
impl Resolve for TunnelHandle {
    async fn resolve(&self, hostname: &str) -> Result<Vec<Ipv4Addr>, TunnelError> {
        self.resolve_dns(hostname, DEFAULT_RESOLVE_TIMEOUT).await
    }
}
