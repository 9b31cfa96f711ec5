use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::network::Connection;
use crate::{AppError, AppResult};

/// Live connections of one server, keyed by connection id.
///
/// Lookups take the shared lock, every mutation the exclusive one. Connections are only
/// stopped after the lock has been released; their finalizers remove themselves again.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        ConnectionRegistry::default()
    }

    pub fn add(&self, connection: Arc<Connection>) {
        let id = connection.id();
        let len = {
            let mut connections = self.connections.write();
            if connections.insert(id, connection).is_some() {
                warn!(connection_id = id, "replaced a registered connection");
            }
            connections.len()
        };
        debug!(connection_id = id, len, "connection registered");
    }

    pub fn remove(&self, connection: &Connection) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&connection.id());
        if removed.is_some() {
            debug!(connection_id = connection.id(), "connection unregistered");
        }
        removed
    }

    pub fn get(&self, id: u64) -> AppResult<Arc<Connection>> {
        self.connections
            .read()
            .get(&id)
            .cloned()
            .ok_or(AppError::NotFound(id))
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Stops and removes every connection.
    pub fn clear_all(&self) {
        let drained: Vec<Arc<Connection>> = {
            let mut connections = self.connections.write();
            connections.drain().map(|(_, connection)| connection).collect()
        };
        for connection in &drained {
            connection.stop();
        }
        debug!(stopped = drained.len(), "all connections cleared");
    }

    /// Stops and removes the connection `id`.
    pub fn clear_one(&self, id: u64) -> AppResult<()> {
        let connection = self
            .connections
            .write()
            .remove(&id)
            .ok_or(AppError::NotFound(id))?;
        connection.stop();
        debug!(connection_id = id, "connection cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::network::test_util::detached_connection;

    #[test]
    fn test_add_get_remove() {
        let registry = ConnectionRegistry::new();
        let connection = detached_connection(1);

        registry.add(connection.clone());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(1).unwrap().id(), 1);

        assert!(registry.remove(&connection).is_some());
        assert!(registry.remove(&connection).is_none());
        assert!(matches!(registry.get(1), Err(AppError::NotFound(1))));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear_one_and_all() {
        let registry = ConnectionRegistry::new();
        let connections: Vec<_> = (1..=5).map(detached_connection).collect();
        for connection in &connections {
            registry.add(connection.clone());
        }

        registry.clear_one(3).unwrap();
        assert!(connections[2].is_closed());
        assert!(matches!(registry.clear_one(3), Err(AppError::NotFound(3))));
        assert_eq!(registry.len(), 4);

        registry.clear_all();
        assert!(registry.is_empty());
        assert!(connections.iter().all(|connection| connection.is_closed()));
    }

    #[test]
    fn test_concurrent_add_remove() {
        let registry = Arc::new(ConnectionRegistry::new());
        let threads = 8u64;
        let per_thread = 500u64;

        thread::scope(|scope| {
            for t in 0..threads {
                let registry = registry.clone();
                scope.spawn(move || {
                    let connections: Vec<_> = (0..per_thread)
                        .map(|i| detached_connection(t * per_thread + i + 1))
                        .collect();
                    for connection in &connections {
                        registry.add(connection.clone());
                        assert!(registry.get(connection.id()).is_ok());
                    }
                    // keep every even id
                    for connection in connections.iter().filter(|c| c.id() % 2 == 1) {
                        assert!(registry.remove(connection).is_some());
                        assert!(registry.len() <= (threads * per_thread) as usize);
                    }
                });
            }
        });

        assert_eq!(registry.len(), (threads * per_thread / 2) as usize);
        for id in 1..=threads * per_thread {
            assert_eq!(registry.get(id).is_ok(), id % 2 == 0);
        }
    }
}
