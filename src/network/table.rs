use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use super::{ConnectionId, ConnectionShared};

/// Live connections by id.
///
/// Lookups from any number of senders proceed concurrently; inserts and removals only lock
/// the shard that owns the key. An entry is present exactly while its connection is
/// `Connecting` or `Open`.
#[derive(Debug)]
pub struct ConnectionTable {
    connections: DashMap<ConnectionId, Arc<ConnectionShared>>,
    next_id: AtomicU64,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        ConnectionTable {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Ids are never reused for the lifetime of the table.
    pub fn next_id(&self) -> ConnectionId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, connection: Arc<ConnectionShared>) {
        self.connections.insert(connection.id(), connection);
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionShared>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionShared>> {
        self.connections.remove(&id).map(|(_, connection)| connection)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn connection(table: &ConnectionTable) -> Arc<ConnectionShared> {
        Arc::new(ConnectionShared::new(
            table.next_id(),
            "127.0.0.1:9000".parse().unwrap(),
        ))
    }

    #[test]
    fn test_insert_get_remove() {
        let table = ConnectionTable::new();
        let conn = connection(&table);
        let id = conn.id();
        table.insert(conn);

        assert!(table.contains(id));
        assert_eq!(table.get(id).map(|c| c.id()), Some(id));
        assert_eq!(table.len(), 1);

        assert!(table.remove(id).is_some());
        assert!(table.get(id).is_none());
        assert!(table.remove(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_ids_are_unique_across_threads() {
        let table = Arc::new(ConnectionTable::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || (0..1000).map(|_| table.next_id()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} issued twice", id);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert!(!seen.contains(&0));
    }
}
