//! Per-IP port pools
//!
//! Each host IP owns a fixed set of ports, each either free or allocated.
//! A pool is created lazily, all free, the first time an IP is seen and is
//! never deleted afterwards; ports are recycled instead.

use crate::error::{ProvisionError, Result, StoreError};
use crate::locks::KeyedLocks;
use crate::store::KvStore;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Inclusive range of ports handed out per IP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, String> {
        if start == 0 {
            return Err("port range must start above 0".to_string());
        }
        if start > end {
            return Err(format!("port range start {} is above end {}", start, end));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 8100,
            end: 8299,
        }
    }
}

/// Free/allocated state of every port belonging to one IP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPool {
    pub ip: String,
    /// port -> free
    ports: BTreeMap<u16, bool>,
}

impl PortPool {
    /// A pool covering `range` with every port free
    pub fn new_free(ip: &str, range: PortRange) -> Self {
        Self {
            ip: ip.to_string(),
            ports: range.iter().map(|port| (port, true)).collect(),
        }
    }

    /// Lowest free port, if any
    pub fn first_free(&self) -> Option<u16> {
        self.ports
            .iter()
            .find(|(_, free)| **free)
            .map(|(port, _)| *port)
    }

    /// `Some(free)` for a port in the pool, `None` for a foreign port
    pub fn is_free(&self, port: u16) -> Option<bool> {
        self.ports.get(&port).copied()
    }

    /// Mark a port free or allocated. Returns false if the port is not in the pool.
    pub fn set_free(&mut self, port: u16, free: bool) -> bool {
        match self.ports.get_mut(&port) {
            Some(slot) => {
                *slot = free;
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.ports.values().filter(|free| **free).count()
    }

    /// Allocated ports in ascending order
    pub fn allocated(&self) -> Vec<u16> {
        self.ports
            .iter()
            .filter(|(_, free)| !**free)
            .map(|(port, _)| *port)
            .collect()
    }

    /// Serialize to the stored document: `{"8100": true, ...}`
    pub fn to_document(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(&self.ports).map_err(|e| StoreError::Corrupt {
            key: pool_key(&self.ip),
            reason: e.to_string(),
        })
    }

    /// Parse a stored document, normalizing every port key to an integer
    pub fn from_document(ip: &str, bytes: &[u8]) -> Result<Self, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: pool_key(ip),
            reason,
        };

        let raw: Map<String, Value> =
            serde_json::from_slice(bytes).map_err(|e| corrupt(e.to_string()))?;

        let mut ports = BTreeMap::new();
        for (key, value) in raw {
            let port: u16 = key
                .trim()
                .parse()
                .map_err(|_| corrupt(format!("'{}' is not a port number", key)))?;
            let free = value
                .as_bool()
                .ok_or_else(|| corrupt(format!("port {} has non-boolean state {}", port, value)))?;
            if ports.insert(port, free).is_some() {
                return Err(corrupt(format!("port {} listed twice", port)));
            }
        }

        Ok(Self {
            ip: ip.to_string(),
            ports,
        })
    }
}

pub(crate) fn pool_key(ip: &str) -> String {
    format!("pool:{}", ip)
}

/// Reads and writes whole pool documents, one per IP
pub struct PortPoolStore {
    store: Arc<dyn KvStore>,
    range: PortRange,
    locks: KeyedLocks,
}

impl PortPoolStore {
    pub fn new(store: Arc<dyn KvStore>, range: PortRange) -> Self {
        Self {
            store,
            range,
            locks: KeyedLocks::new(),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Run `f` holding the IP's lock. Every read-modify-write of a pool goes
    /// through here.
    pub fn locked<T>(&self, ip: &str, f: impl FnOnce() -> T) -> T {
        self.locks.with(ip, f)
    }

    /// Create a fully free pool for `ip` unless one already exists
    pub fn ensure(&self, ip: &str) -> Result<()> {
        self.locked(ip, || {
            if self.exists(ip)? {
                return Ok(());
            }

            let pool = PortPool::new_free(ip, self.range);
            self.save(&pool)?;
            info!(
                ip,
                start = self.range.start(),
                end = self.range.end(),
                "Created port pool"
            );
            Ok(())
        })
    }

    pub fn exists(&self, ip: &str) -> Result<bool> {
        Ok(self.store.exists(&pool_key(ip))?)
    }

    /// Current pool state; `NotFound` if the IP was never seen
    pub fn snapshot(&self, ip: &str) -> Result<PortPool> {
        let bytes = self
            .store
            .get(&pool_key(ip))?
            .ok_or_else(|| ProvisionError::NotFound(format!("port pool for {}", ip)))?;
        Ok(PortPool::from_document(ip, &bytes)?)
    }

    /// Persist the full pool state
    pub fn save(&self, pool: &PortPool) -> Result<()> {
        let bytes = pool.to_document()?;
        self.store.set(&pool_key(&pool.ip), &bytes)?;
        debug!(ip = %pool.ip, free = pool.free_count(), "Saved port pool");
        Ok(())
    }
}
