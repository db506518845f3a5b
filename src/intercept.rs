//! Workstation-side orchestration
//!
//! Wires the intercept data plane together: registry and sweeper, tunnel,
//! resolver-file rewrite, DNS interceptor, transparent proxy, and kernel
//! redirect rules. Runs until a signal arrives or the tunnel is lost; the
//! teardown order is the reverse of startup so no component outlives what
//! it depends on.
//!
//! The tunnel is attempted exactly once. On loss, the error ascends and the
//! process exits non-zero; reconnect policy belongs to whatever supervises
//! the process.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::Config;
use crate::dns::{
    first_nameserver, DnsContext, DnsInterceptor, PatternSet, ResolvConfGuard, UpstreamResolver,
};
use crate::error::BridgeError;
use crate::registry::{ConnectionRegistry, IpPool};
use crate::tproxy::{self, ProxyListener, RedirectGuard};
use crate::tunnel;

/// Run the intercept side to completion.
///
/// # Errors
///
/// Startup errors (validation, binds, the tunnel dial) and tunnel loss are
/// returned; redirect-rule and resolver-file failures are degraded to
/// warnings because the data plane still works for directly dialed proxy
/// IPs.
pub async fn run(config: Config) -> Result<(), BridgeError> {
    let icfg = config.intercept;
    icfg.validate()?;

    let patterns = PatternSet::parse(&icfg.forward_domains)?;

    let registry = Arc::new(ConnectionRegistry::new(
        IpPool::new(icfg.proxy_cidr),
        icfg.unused_timeout(),
        icfg.cleanup_interval(),
    ));
    let sweeper = registry.spawn_sweeper();

    let tunnel = tunnel::connect(&icfg.tunnel_url, icfg.app_port).await?;

    // The upstream nameserver must come from the resolver file as it was
    // *before* the rewrite below.
    let upstream_ns = std::fs::read_to_string(&icfg.resolv_conf)
        .ok()
        .as_deref()
        .and_then(first_nameserver);
    if upstream_ns.is_none() {
        warn!("no upstream nameserver found; unmatched queries will fail");
    }
    let upstream = UpstreamResolver::new(upstream_ns);

    let mut resolv_guard = if icfg.no_resolv_conf {
        None
    } else {
        match ResolvConfGuard::install(&icfg.resolv_conf) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(error = %e, "failed to rewrite resolver file; DNS interception inactive");
                None
            }
        }
    };

    let (shutdown_tx, _) = broadcast::channel(1);

    let ctx = Arc::new(DnsContext {
        patterns,
        registry: Arc::clone(&registry),
        resolver: Arc::new(tunnel.clone()),
        upstream,
    });
    let dns_addr = SocketAddr::from(([127, 0, 0, 1], icfg.dns_listen_port));
    let dns = DnsInterceptor::bind(dns_addr, ctx).await.map_err(|e| {
        BridgeError::Dns(crate::error::DnsError::IoError(e))
    })?;
    let dns_shutdown = shutdown_tx.clone();
    let mut dns_task = tokio::spawn(async move { dns.run(&dns_shutdown).await });

    let listener = ProxyListener::bind(icfg.proxy_listen_port).await?;
    let proxy_port = listener.local_addr()?.port();
    tokio::spawn(tproxy::run_accept_loop(
        listener,
        Arc::clone(&registry),
        tunnel.clone(),
        shutdown_tx.subscribe(),
    ));

    let mut redirect_guard = if icfg.no_redirect {
        None
    } else {
        match RedirectGuard::install(icfg.proxy_cidr, proxy_port) {
            Ok(guard) => Some(guard),
            Err(e) => {
                warn!(
                    error = %e,
                    "failed to install redirect rules; traffic interception requires NET_ADMIN"
                );
                None
            }
        }
    };

    info!(
        proxy_cidr = %icfg.proxy_cidr,
        proxy_port,
        dns_port = icfg.dns_listen_port,
        app_port = icfg.app_port,
        "intercept running"
    );

    let outcome: Result<(), BridgeError> = tokio::select! {
        () = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
        result = tunnel.wait() => result.map_err(BridgeError::from),
        joined = &mut dns_task => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(crate::error::DnsError::IoError(e).into()),
            Err(e) => Err(BridgeError::Io(std::io::Error::other(e))),
        },
    };

    // Teardown in reverse: stop accepting, remove kernel rules, restore the
    // resolver file, stop the sweeper, close the tunnel.
    let _ = shutdown_tx.send(());
    if let Some(guard) = redirect_guard.as_mut() {
        guard.cleanup();
    }
    if let Some(guard) = resolv_guard.as_mut() {
        guard.restore();
    }
    registry.stop();
    tunnel.shutdown();
    let _ = sweeper.await;

    outcome
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
