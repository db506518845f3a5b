//! Connection registry
//!
//! Tracks live proxy-IP mappings: each allocated proxy IP points at the
//! hostname it stands for and the real cluster IP the tunnel resolved. The
//! registry owns the [`IpPool`]; an address is either free in the pool or
//! allocated with exactly one registry entry referencing it.
//!
//! Entries that see no lookup within the idle window are released by a
//! background sweeper. DNS tools and health probes emit queries that never
//! turn into TCP connections; without timed release a busy service directory
//! would drain a /16 in hours.

pub mod pool;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::error::PoolError;

pub use pool::IpPool;

/// Default idle window after which an unused entry is released
pub const DEFAULT_UNUSED_TIMEOUT: Duration = Duration::from_secs(10);

/// Default sweeper tick
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5);

/// A live proxy-IP mapping
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    /// Hostname the proxy IP stands for
    pub hostname: String,
    /// Real cluster IP the tunnel resolved for the hostname
    pub real_ip: Ipv4Addr,
    last_used: Instant,
}

impl RegistryEntry {
    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Registry of proxy IP → (hostname, real IP) mappings with idle expiry
pub struct ConnectionRegistry {
    pool: IpPool,
    entries: Mutex<HashMap<Ipv4Addr, RegistryEntry>>,
    unused_timeout: Duration,
    cleanup_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl ConnectionRegistry {
    /// Create a registry owning `pool`
    #[must_use]
    pub fn new(pool: IpPool, unused_timeout: Duration, cleanup_interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            pool,
            entries: Mutex::new(HashMap::new()),
            unused_timeout,
            cleanup_interval,
            shutdown_tx,
            stopped: AtomicBool::new(false),
        }
    }

    /// Create a registry with the default timing
    #[must_use]
    pub fn with_defaults(pool: IpPool) -> Self {
        Self::new(pool, DEFAULT_UNUSED_TIMEOUT, DEFAULT_CLEANUP_INTERVAL)
    }

    /// Allocate a proxy IP for `hostname` and record the mapping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` when no address is free. Live entries
    /// are never evicted to make room.
    pub fn allocate(&self, hostname: &str, real_ip: Ipv4Addr) -> Result<Ipv4Addr, PoolError> {
        let mut entries = self.entries.lock();
        let proxy_ip = self.pool.acquire()?;
        entries.insert(
            proxy_ip,
            RegistryEntry {
                hostname: hostname.to_string(),
                real_ip,
                last_used: Instant::now(),
            },
        );
        trace!(%proxy_ip, hostname, %real_ip, "registered proxy mapping");
        Ok(proxy_ip)
    }

    /// Look up a proxy IP, refreshing its last-use stamp on success
    #[must_use]
    pub fn lookup(&self, proxy_ip: Ipv4Addr) -> Option<RegistryEntry> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&proxy_ip)?;
        entry.last_used = Instant::now();
        Some(entry.clone())
    }

    /// Remove a mapping and return its address to the pool. Idempotent.
    pub fn release(&self, proxy_ip: Ipv4Addr) {
        let mut entries = self.entries.lock();
        if entries.remove(&proxy_ip).is_some() {
            self.pool.release(proxy_ip);
            trace!(%proxy_ip, "released proxy mapping");
        }
    }

    /// Release every entry idle for at least the configured window.
    ///
    /// Returns the number of entries released. Runs under the same mutex as
    /// `lookup`, so an entry refreshed mid-sweep is spared.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let expired: Vec<Ipv4Addr> = entries
            .iter()
            .filter(|(_, e)| e.idle_for(now) >= self.unused_timeout)
            .map(|(ip, _)| *ip)
            .collect();

        for ip in &expired {
            entries.remove(ip);
            self.pool.release(*ip);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "swept idle registry entries");
        }
        expired.len()
    }

    /// Number of live entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the registry has no live entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The underlying pool
    #[must_use]
    pub fn pool(&self) -> &IpPool {
        &self.pool
    }

    /// Spawn the background sweeper.
    ///
    /// The task ticks every `cleanup-interval` until [`stop`](Self::stop) is
    /// called.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(registry.cleanup_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        registry.sweep();
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("registry sweeper stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Stop the sweeper. Idempotent.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("stopping connection registry");
            let _ = self.shutdown_tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_registry(unused_ms: u64) -> ConnectionRegistry {
        ConnectionRegistry::new(
            IpPool::new("10.128.0.0/28".parse().unwrap()),
            Duration::from_millis(unused_ms),
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_allocate_and_lookup() {
        let registry = test_registry(10_000);
        let real: Ipv4Addr = "10.43.0.15".parse().unwrap();

        let proxy = registry
            .allocate("redis.prod.svc.cluster.local", real)
            .unwrap();
        assert!(registry.pool().is_allocated(proxy));

        let entry = registry.lookup(proxy).unwrap();
        assert_eq!(entry.hostname, "redis.prod.svc.cluster.local");
        assert_eq!(entry.real_ip, real);

        assert!(registry.lookup("10.128.0.9".parse().unwrap()).is_none());
    }

    #[test]
    fn test_every_entry_backed_by_allocation() {
        let registry = test_registry(10_000);
        for i in 0..5u8 {
            let proxy = registry
                .allocate(&format!("svc-{i}.default.svc.cluster.local"), "10.43.0.1".parse().unwrap())
                .unwrap();
            assert!(registry.pool().is_allocated(proxy));
        }
        assert_eq!(registry.len() + registry.pool().available(), registry.pool().size());
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = test_registry(10_000);
        let proxy = registry
            .allocate("a.svc.cluster.local", "10.43.0.1".parse().unwrap())
            .unwrap();

        registry.release(proxy);
        registry.release(proxy);
        assert!(registry.is_empty());
        assert_eq!(registry.pool().available(), registry.pool().size());
    }

    #[test]
    fn test_sweep_releases_idle_entries() {
        let registry = test_registry(20);
        let proxy = registry
            .allocate("a.svc.cluster.local", "10.43.0.1".parse().unwrap())
            .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.sweep(), 1);
        assert!(registry.lookup(proxy).is_none());
        assert!(!registry.pool().is_allocated(proxy));

        // A later allocation may reuse the released address.
        let again = registry
            .allocate("b.svc.cluster.local", "10.43.0.2".parse().unwrap())
            .unwrap();
        assert!(registry.pool().is_allocated(again));
    }

    #[test]
    fn test_lookup_refresh_spares_entry() {
        let registry = test_registry(50);
        let proxy = registry
            .allocate("a.svc.cluster.local", "10.43.0.1".parse().unwrap())
            .unwrap();

        // Refresh just inside the window, then sweep after the original
        // stamp would have expired.
        std::thread::sleep(Duration::from_millis(30));
        assert!(registry.lookup(proxy).is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(registry.sweep(), 0);
        assert!(registry.lookup(proxy).is_some());
    }

    #[tokio::test]
    async fn test_sweeper_task_and_stop() {
        let registry = Arc::new(test_registry(20));
        let handle = registry.spawn_sweeper();

        registry
            .allocate("a.svc.cluster.local", "10.43.0.1".parse().unwrap())
            .unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.is_empty());

        registry.stop();
        // Double stop is safe.
        registry.stop();
        handle.await.unwrap();
    }
}
