//! Proxy IP pool
//!
//! Materialises the usable host addresses of a configured CIDR (excluding the
//! network and broadcast addresses) and hands them out one at a time.
//! Allocation scans linearly for the first free slot starting at a moving
//! cursor, so the order is deterministic within a process but not guaranteed
//! across runs.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use parking_lot::Mutex;

use crate::error::PoolError;

/// Pool of proxy IP addresses drawn from a private CIDR
#[derive(Debug)]
pub struct IpPool {
    network: Ipv4Net,
    /// First usable host address as a u32
    base: u32,
    /// Number of usable host addresses
    size: usize,
    inner: Mutex<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
    /// One flag per usable host address; true = allocated
    allocated: Vec<bool>,
    /// Where the next first-free scan starts
    cursor: usize,
    /// Count of free slots, kept in sync with `allocated`
    available: usize,
}

impl IpPool {
    /// Create a pool over the usable hosts of `network`.
    ///
    /// For prefixes shorter than /31 the network and broadcast addresses are
    /// excluded; /31 and /32 expose all their addresses.
    #[must_use]
    pub fn new(network: Ipv4Net) -> Self {
        let net = u32::from(network.network());
        let bcast = u32::from(network.broadcast());
        let (base, size) = if network.prefix_len() < 31 {
            (net + 1, (bcast - net - 1) as usize)
        } else {
            (net, (bcast - net + 1) as usize)
        };

        Self {
            network,
            base,
            size,
            inner: Mutex::new(PoolInner {
                allocated: vec![false; size],
                cursor: 0,
                available: size,
            }),
        }
    }

    /// Acquire the next free proxy IP.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Exhausted` when every address is allocated.
    pub fn acquire(&self) -> Result<Ipv4Addr, PoolError> {
        let mut inner = self.inner.lock();
        if inner.available == 0 {
            return Err(PoolError::Exhausted { size: self.size });
        }

        // First-free scan from the cursor, wrapping once.
        for offset in 0..self.size {
            let idx = (inner.cursor + offset) % self.size;
            if !inner.allocated[idx] {
                inner.allocated[idx] = true;
                inner.available -= 1;
                inner.cursor = (idx + 1) % self.size;
                return Ok(Ipv4Addr::from(self.base + idx as u32));
            }
        }

        // available > 0 guarantees the scan found a slot.
        unreachable!("pool accounting out of sync");
    }

    /// Return a proxy IP to the pool.
    ///
    /// Idempotent: releasing a free IP, or an address outside the pool's
    /// range, is a silent no-op.
    pub fn release(&self, ip: Ipv4Addr) {
        let Some(idx) = self.index_of(ip) else {
            return;
        };

        let mut inner = self.inner.lock();
        if inner.allocated[idx] {
            inner.allocated[idx] = false;
            inner.available += 1;
        }
    }

    /// Check whether an address was handed out by this pool and is still
    /// allocated.
    #[must_use]
    pub fn is_allocated(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip)
            .is_some_and(|idx| self.inner.lock().allocated[idx])
    }

    /// Total number of usable host addresses
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of addresses currently free
    #[must_use]
    pub fn available(&self) -> usize {
        self.inner.lock().available
    }

    /// Check if an address lies within the pool's usable range
    #[must_use]
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.index_of(ip).is_some()
    }

    /// The configured network
    #[must_use]
    pub fn network(&self) -> Ipv4Net {
        self.network
    }

    fn index_of(&self, ip: Ipv4Addr) -> Option<usize> {
        let v = u32::from(ip);
        if v < self.base {
            return None;
        }
        let idx = (v - self.base) as usize;
        (idx < self.size).then_some(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_hosts_exclude_network_and_broadcast() {
        let pool = IpPool::new("10.128.0.0/24".parse().unwrap());
        assert_eq!(pool.size(), 254);
        assert!(!pool.contains("10.128.0.0".parse().unwrap()));
        assert!(!pool.contains("10.128.0.255".parse().unwrap()));
        assert!(pool.contains("10.128.0.1".parse().unwrap()));
        assert!(pool.contains("10.128.0.254".parse().unwrap()));
    }

    #[test]
    fn test_acquire_release_accounting() {
        let pool = IpPool::new("10.128.0.0/29".parse().unwrap());
        assert_eq!(pool.size(), 6);
        assert_eq!(pool.available(), 6);

        let ip = pool.acquire().unwrap();
        assert!(pool.is_allocated(ip));
        assert_eq!(pool.available(), 5);

        pool.release(ip);
        assert!(!pool.is_allocated(ip));
        assert_eq!(pool.available(), 6);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = IpPool::new("10.128.0.0/29".parse().unwrap());
        let ip = pool.acquire().unwrap();

        pool.release(ip);
        pool.release(ip);
        assert_eq!(pool.available(), pool.size());

        // Releasing an address outside the pool is a no-op too.
        pool.release("192.168.1.1".parse().unwrap());
        assert_eq!(pool.available(), pool.size());
    }

    #[test]
    fn test_exhaustion() {
        let pool = IpPool::new("10.128.0.0/30".parse().unwrap());
        assert_eq!(pool.size(), 2);

        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);

        assert!(matches!(
            pool.acquire(),
            Err(PoolError::Exhausted { size: 2 })
        ));

        // Releasing one makes the pool usable again without disturbing the other.
        pool.release(a);
        assert!(pool.is_allocated(b));
        let c = pool.acquire().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_no_duplicate_handout() {
        let pool = IpPool::new("10.128.0.0/28".parse().unwrap());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..pool.size() {
            assert!(seen.insert(pool.acquire().unwrap()));
        }
    }

    #[test]
    fn test_allocated_plus_free_is_total() {
        let pool = IpPool::new("10.128.0.0/28".parse().unwrap());
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire().unwrap());
        }
        assert_eq!(held.len() + pool.available(), pool.size());

        for ip in held {
            pool.release(ip);
        }
        assert_eq!(pool.available(), pool.size());
    }

    #[test]
    fn test_concurrent_acquire() {
        use std::sync::Arc;
        use std::thread;

        let pool = Arc::new(IpPool::new("10.128.0.0/24".parse().unwrap()));
        let mut handles = vec![];

        for _ in 0..4 {
            let pool = Arc::clone(&pool);
            handles.push(thread::spawn(move || {
                let mut ips = Vec::new();
                for _ in 0..50 {
                    ips.push(pool.acquire().unwrap());
                }
                ips
            }));
        }

        let mut all: Vec<Ipv4Addr> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total, "no IP handed out twice");
    }
}
