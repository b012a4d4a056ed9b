//! Port allocation within a per-IP pool
//!
//! The lowest free port always wins, so allocation order is deterministic and
//! released ports are reused before higher ones.

use crate::error::{ProvisionError, Result};
use crate::pool::PortPoolStore;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Allocator {
    pools: Arc<PortPoolStore>,
}

impl Allocator {
    pub fn new(pools: Arc<PortPoolStore>) -> Self {
        Self { pools }
    }

    pub fn pools(&self) -> &Arc<PortPoolStore> {
        &self.pools
    }

    /// Reserve the lowest free port of `ip`'s pool.
    ///
    /// The pool must already exist. Fails with `PoolExhausted` when every
    /// port is taken.
    pub fn allocate(&self, ip: &str) -> Result<u16> {
        self.pools.locked(ip, || {
            let mut pool = self.pools.snapshot(ip)?;

            let port = match pool.first_free() {
                Some(port) => port,
                None => {
                    warn!(ip, size = pool.len(), "Port pool exhausted");
                    return Err(ProvisionError::PoolExhausted { ip: ip.to_string() });
                }
            };

            pool.set_free(port, false);
            self.pools.save(&pool)?;

            info!(ip, port, remaining = pool.free_count(), "Allocated port");
            Ok(port)
        })
    }

    /// Return `port` to `ip`'s pool. Releasing a free port is a no-op.
    pub fn release(&self, ip: &str, port: u16) -> Result<()> {
        self.pools.locked(ip, || {
            let mut pool = self.pools.snapshot(ip)?;

            match pool.is_free(port) {
                None => Err(ProvisionError::NotFound(format!(
                    "port {} in pool for {}",
                    port, ip
                ))),
                Some(true) => {
                    debug!(ip, port, "Port already free");
                    Ok(())
                }
                Some(false) => {
                    pool.set_free(port, true);
                    self.pools.save(&pool)?;
                    info!(ip, port, remaining = pool.free_count(), "Released port");
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PortRange;
    use crate::store::MemoryStore;
    use std::collections::HashSet;
    use std::thread;

    fn allocator(start: u16, end: u16) -> Allocator {
        let store = Arc::new(MemoryStore::new());
        let pools = PortPoolStore::new(store, PortRange::new(start, end).unwrap());
        Allocator::new(Arc::new(pools))
    }

    #[test]
    fn test_fresh_pool_hands_out_lowest_port() {
        let alloc = allocator(8100, 8299);
        alloc.pools().ensure("10.0.0.1").unwrap();
        assert_eq!(alloc.allocate("10.0.0.1").unwrap(), 8100);
    }

    #[test]
    fn test_allocations_are_distinct_and_ascending() {
        let alloc = allocator(8100, 8119);
        alloc.pools().ensure("10.0.0.1").unwrap();

        let ports: Vec<u16> = (0..20).map(|_| alloc.allocate("10.0.0.1").unwrap()).collect();
        assert!(ports.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(ports.first(), Some(&8100));
        assert_eq!(ports.last(), Some(&8119));
    }

    #[test]
    fn test_exhaustion_is_an_error() {
        let alloc = allocator(8100, 8102);
        alloc.pools().ensure("10.0.0.1").unwrap();

        for _ in 0..3 {
            alloc.allocate("10.0.0.1").unwrap();
        }

        assert!(matches!(
            alloc.allocate("10.0.0.1"),
            Err(ProvisionError::PoolExhausted { ip }) if ip == "10.0.0.1"
        ));
    }

    #[test]
    fn test_release_recycles_lowest_port() {
        let alloc = allocator(8100, 8102);
        alloc.pools().ensure("10.0.0.1").unwrap();

        assert_eq!(alloc.allocate("10.0.0.1").unwrap(), 8100);
        assert_eq!(alloc.allocate("10.0.0.1").unwrap(), 8101);

        alloc.release("10.0.0.1", 8100).unwrap();
        assert_eq!(alloc.allocate("10.0.0.1").unwrap(), 8100);
        // 8101 is still held
        assert_eq!(alloc.allocate("10.0.0.1").unwrap(), 8102);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = allocator(8100, 8102);
        alloc.pools().ensure("10.0.0.1").unwrap();

        let port = alloc.allocate("10.0.0.1").unwrap();
        alloc.release("10.0.0.1", port).unwrap();
        alloc.release("10.0.0.1", port).unwrap();

        assert_eq!(alloc.pools().snapshot("10.0.0.1").unwrap().free_count(), 3);
    }

    #[test]
    fn test_release_rejects_unknown_pool_or_port() {
        let alloc = allocator(8100, 8102);
        assert!(matches!(
            alloc.release("10.0.0.9", 8100),
            Err(ProvisionError::NotFound(_))
        ));

        alloc.pools().ensure("10.0.0.1").unwrap();
        assert!(matches!(
            alloc.release("10.0.0.1", 9000),
            Err(ProvisionError::NotFound(_))
        ));
    }

    #[test]
    fn test_allocate_requires_pool() {
        let alloc = allocator(8100, 8102);
        assert!(matches!(
            alloc.allocate("10.0.0.1"),
            Err(ProvisionError::NotFound(_))
        ));
    }

    #[test]
    fn test_pools_are_independent_per_ip() {
        let alloc = allocator(8100, 8102);
        alloc.pools().ensure("10.0.0.1").unwrap();
        alloc.pools().ensure("10.0.0.2").unwrap();

        assert_eq!(alloc.allocate("10.0.0.1").unwrap(), 8100);
        assert_eq!(alloc.allocate("10.0.0.2").unwrap(), 8100);
    }

    #[test]
    fn test_concurrent_allocations_never_collide() {
        let alloc = Arc::new(allocator(8100, 8299));
        alloc.pools().ensure("10.0.0.1").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| alloc.allocate("10.0.0.1").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {} allocated twice", port);
            }
        }

        assert_eq!(seen.len(), 200);
        assert_eq!(alloc.pools().snapshot("10.0.0.1").unwrap().free_count(), 0);
    }
}
