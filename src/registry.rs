//! Registry of active connections.
//!
//! The registry is observational: it records which peers are connected
//! and since when. Each connection task holds a [`Registration`] that
//! removes its entry when the task ends, so the server never owns a
//! connection through the registry.

use chrono::{DateTime, Utc};
use slab::Slab;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Bookkeeping for a single active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Slot identifier in the registry.
    pub id: usize,
    /// Remote address of the peer.
    pub peer: SocketAddr,
    /// When the connection was accepted.
    pub connected_at: DateTime<Utc>,
}

/// Registry of active connections using slab allocation.
///
/// Shared between the accept loop and connection tasks, which may run on
/// different runtime threads.
#[derive(Debug)]
pub struct ConnectionRegistry {
    connections: Mutex<Slab<ConnectionInfo>>,
    max_connections: Option<usize>,
}

impl ConnectionRegistry {
    /// Create a new registry, optionally bounded.
    pub fn new(max_connections: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            connections: Mutex::new(Slab::new()),
            max_connections,
        })
    }

    /// Record a new connection.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn register(self: &Arc<Self>, peer: SocketAddr) -> Option<Registration> {
        let mut connections = self.lock();
        if let Some(max) = self.max_connections {
            if connections.len() >= max {
                return None;
            }
        }

        let entry = connections.vacant_entry();
        let id = entry.key();
        entry.insert(ConnectionInfo {
            id,
            peer,
            connected_at: Utc::now(),
        });

        Some(Registration {
            id,
            registry: Arc::clone(self),
        })
    }

    /// Number of active connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Maximum number of connections allowed, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.max_connections
    }

    /// Copy out the current set of connections.
    pub fn snapshot(&self) -> Vec<ConnectionInfo> {
        self.lock().iter().map(|(_, info)| info.clone()).collect()
    }

    fn remove(&self, id: usize) {
        let mut connections = self.lock();
        if connections.contains(id) {
            connections.remove(id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slab<ConnectionInfo>> {
        // Entries are plain data, a panic mid-update cannot leave them torn.
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Membership of one connection in the registry.
///
/// Dropping the registration removes the entry.
#[derive(Debug)]
pub struct Registration {
    id: usize,
    registry: Arc<ConnectionRegistry>,
}

impl Registration {
    pub fn id(&self) -> usize {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_register_and_drop() {
        let registry = ConnectionRegistry::new(None);
        assert!(registry.is_empty());

        let r1 = registry.register(addr(1000)).unwrap();
        let r2 = registry.register(addr(1001)).unwrap();
        assert_eq!(registry.len(), 2);
        assert_ne!(r1.id(), r2.id());

        drop(r1);
        assert_eq!(registry.len(), 1);

        let remaining = registry.snapshot();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].peer, addr(1001));
        assert_eq!(remaining[0].id, r2.id());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = ConnectionRegistry::new(Some(2));

        let _r1 = registry.register(addr(1)).unwrap();
        let r2 = registry.register(addr(2)).unwrap();

        // At capacity
        assert!(registry.register(addr(3)).is_none());
        assert_eq!(registry.capacity(), Some(2));

        drop(r2);
        assert!(registry.register(addr(3)).is_some());
    }

    #[test]
    fn test_slot_reuse() {
        let registry = ConnectionRegistry::new(None);
        let r1 = registry.register(addr(1)).unwrap();
        let first = r1.id();
        drop(r1);

        // Slab reuses slots
        let r2 = registry.register(addr(2)).unwrap();
        assert_eq!(r2.id(), first);
    }

    #[test]
    fn test_connected_at_is_recorded() {
        let before = Utc::now();
        let registry = ConnectionRegistry::new(None);
        let _r = registry.register(addr(1)).unwrap();
        let info = &registry.snapshot()[0];
        assert!(info.connected_at >= before);
        assert!(info.connected_at <= Utc::now());
    }
}
