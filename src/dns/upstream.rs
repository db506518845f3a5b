//! Upstream DNS forwarding
//!
//! Queries that no forward-domain pattern claims are relayed unchanged to
//! the nameserver that was configured *before* the resolver file rewrite,
//! and the response is returned verbatim.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::error::DnsError;

/// Deadline for one upstream exchange
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(3);

/// Upper bound on an EDNS UDP response
const MAX_UDP_RESPONSE: usize = 65_535;

/// Relay to the original system nameserver
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    upstream: Option<SocketAddr>,
}

impl UpstreamResolver {
    /// Build a resolver forwarding to `upstream`; `None` makes every
    /// forwarded query fail with `DnsError::NoUpstream` (SERVFAIL at the
    /// server).
    #[must_use]
    pub fn new(upstream: Option<SocketAddr>) -> Self {
        Self { upstream }
    }

    /// The configured upstream, if any
    #[must_use]
    pub fn upstream(&self) -> Option<SocketAddr> {
        self.upstream
    }

    /// Forward a raw query over UDP and return the raw response.
    ///
    /// # Errors
    ///
    /// `NoUpstream` when unconfigured, `UpstreamFailed` on timeout or socket
    /// errors.
    pub async fn forward_udp(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let upstream = self.upstream.ok_or(DnsError::NoUpstream)?;

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket
            .send_to(query, upstream)
            .await
            .map_err(|e| DnsError::upstream(upstream, e.to_string()))?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        let n = tokio::time::timeout(UPSTREAM_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| DnsError::upstream(upstream, "timed out"))?
            .map_err(|e| DnsError::upstream(upstream, e.to_string()))?;

        buf.truncate(n);
        debug!(%upstream, response_len = n, "forwarded query upstream");
        Ok(buf)
    }

    /// Forward a raw query over TCP (2-byte length framing) and return the
    /// raw response.
    ///
    /// # Errors
    ///
    /// `NoUpstream` when unconfigured, `UpstreamFailed` on timeout or socket
    /// errors.
    pub async fn forward_tcp(&self, query: &[u8]) -> Result<Vec<u8>, DnsError> {
        let upstream = self.upstream.ok_or(DnsError::NoUpstream)?;

        let exchange = async {
            let mut stream = TcpStream::connect(upstream).await?;
            stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
            stream.write_all(query).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;

            let mut response = vec![0u8; len];
            stream.read_exact(&mut response).await?;
            Ok::<_, std::io::Error>(response)
        };

        tokio::time::timeout(UPSTREAM_TIMEOUT, exchange)
            .await
            .map_err(|_| DnsError::upstream(upstream, "timed out"))?
            .map_err(|e| DnsError::upstream(upstream, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_upstream_fails() {
        let resolver = UpstreamResolver::new(None);
        assert!(matches!(
            resolver.forward_udp(b"query").await,
            Err(DnsError::NoUpstream)
        ));
        assert!(matches!(
            resolver.forward_tcp(b"query").await,
            Err(DnsError::NoUpstream)
        ));
    }

    #[tokio::test]
    async fn test_udp_forward_round_trip() {
        // A canned "upstream" echoing a fixed response.
        let upstream = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let (n, peer) = upstream.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"raw-query");
            upstream.send_to(b"raw-response", peer).await.unwrap();
        });

        let resolver = UpstreamResolver::new(Some(upstream_addr));
        let response = resolver.forward_udp(b"raw-query").await.unwrap();
        assert_eq!(response, b"raw-response");
    }

    #[tokio::test]
    async fn test_tcp_forward_round_trip() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 2];
            sock.read_exact(&mut len_buf).await.unwrap();
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut query = vec![0u8; len];
            sock.read_exact(&mut query).await.unwrap();
            assert_eq!(query, b"raw-query");

            sock.write_all(&12u16.to_be_bytes()).await.unwrap();
            sock.write_all(b"raw-response").await.unwrap();
        });

        let resolver = UpstreamResolver::new(Some(upstream_addr));
        let response = resolver.forward_tcp(b"raw-query").await.unwrap();
        assert_eq!(response, b"raw-response");
    }
}
