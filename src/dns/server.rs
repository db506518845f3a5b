//! DNS interceptor server
//!
//! Binds the UDP and TCP transports on the same loopback address and runs
//! them until shutdown or the first fatal server error.

use std::io;
use std::net::SocketAddr;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use super::processor::SharedDnsContext;
use super::tcp_server::DnsTcpServer;
use super::udp_server::DnsUdpServer;

/// The DNS interceptor: one UDP and one TCP server sharing a context
pub struct DnsInterceptor {
    udp: DnsUdpServer,
    tcp: DnsTcpServer,
}

impl DnsInterceptor {
    /// Bind both transports on `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if either bind fails (port 53 needs the binary to be
    /// privileged or to hold `CAP_NET_BIND_SERVICE`).
    pub async fn bind(addr: SocketAddr, ctx: SharedDnsContext) -> io::Result<Self> {
        let udp = DnsUdpServer::bind(addr, ctx.clone()).await?;
        // Reuse whatever port UDP got, so an ephemeral request (port 0) ends
        // up on one port for both transports.
        let tcp_addr = udp.local_addr()?;
        let tcp = DnsTcpServer::bind(tcp_addr, ctx).await?;
        Ok(Self { udp, tcp })
    }

    /// The bound address
    ///
    /// # Errors
    ///
    /// Propagates `local_addr` failures.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Run both transports until shutdown or the first server error.
    ///
    /// # Errors
    ///
    /// Returns the first transport error.
    pub async fn run(self, shutdown_tx: &broadcast::Sender<()>) -> io::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, "DNS interceptor listening (udp+tcp)");

        let handles: Vec<JoinHandle<io::Result<()>>> = vec![
            tokio::spawn(self.udp.run(shutdown_tx.subscribe())),
            tokio::spawn(self.tcp.run(shutdown_tx.subscribe())),
        ];

        let (result, _, _) = futures::future::select_all(handles).await;
        result.map_err(io::Error::other)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::pattern::PatternSet;
    use crate::dns::processor::DnsContext;
    use crate::dns::upstream::UpstreamResolver;
    use crate::error::TunnelError;
    use crate::registry::{ConnectionRegistry, IpPool};
    use crate::tunnel::Resolve;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    struct StubResolver;

    #[async_trait]
    impl Resolve for StubResolver {
        async fn resolve(&self, _hostname: &str) -> Result<Vec<Ipv4Addr>, TunnelError> {
            Ok(vec!["10.43.0.15".parse().unwrap()])
        }
    }

    #[tokio::test]
    async fn test_bind_and_shutdown() {
        let ctx = Arc::new(DnsContext {
            patterns: PatternSet::parse(&["*.svc.cluster.local"]).unwrap(),
            registry: Arc::new(ConnectionRegistry::new(
                IpPool::new("10.128.0.0/24".parse().unwrap()),
                Duration::from_secs(10),
                Duration::from_secs(5),
            )),
            resolver: Arc::new(StubResolver),
            upstream: UpstreamResolver::new(None),
        });

        let interceptor = DnsInterceptor::bind("127.0.0.1:0".parse().unwrap(), ctx)
            .await
            .unwrap();
        let addr = interceptor.local_addr().unwrap();
        assert_ne!(addr.port(), 0);

        let (shutdown_tx, _) = broadcast::channel(1);
        let tx = shutdown_tx.clone();
        let server = tokio::spawn(async move { interceptor.run(&tx).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = shutdown_tx.send(());
        server.await.unwrap().unwrap();
    }
}
