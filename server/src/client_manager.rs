//! Connected player tracking for the hub
//!
//! Players connect to the hub before asking to be queued for a backend. Each
//! connection gets a numeric id that doubles as the queue's subject handle.
//! This module handles:
//! - Connection lifecycle (connect, disconnect, timeout)
//! - Address lookup for routing replies and notices
//! - Liveness snapshots consumed by the admission queue
//!
//! The admission queue never holds a client directly. It keeps ids and asks
//! for a liveness snapshot before acting on them.

use crate::ledger::SubjectId;
use log::info;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Represents a connected player
#[derive(Debug)]
pub struct Client {
    /// Unique id assigned by the hub
    pub id: SubjectId,
    /// Network address for replies and notices
    pub addr: SocketAddr,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
}

impl Client {
    pub fn new(id: SubjectId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
        }
    }

    /// Checks if the client has exceeded the connection timeout
    ///
    /// Returns true if no packets have been received from this client
    /// within the specified timeout duration, indicating a likely disconnect.
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all connected players
///
/// Enforces the hub's connection limit and hands out ids. Ids are never
/// reused during the lifetime of the process, so a stale id held by the
/// queue can never point at a different player.
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<SubjectId, Client>,
    /// Next available client ID for new connections
    next_client_id: SubjectId,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
    timeout: Duration,
}

impl ClientManager {
    /// Creates a new client manager with the specified capacity limit
    ///
    /// Client IDs start from 1 and increment for each new connection.
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Attempts to add a new client connection
    ///
    /// Returns Some(client_id) if successful, None if the hub is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<SubjectId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let client = Client::new(client_id, addr);
        info!("Client {} connected from {}", client_id, addr);
        self.clients.insert(client_id, client);

        Some(client_id)
    }

    /// Removes a client. Returns true if the client was found and removed.
    pub fn remove_client(&mut self, client_id: &SubjectId) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<SubjectId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn addr_of(&self, client_id: SubjectId) -> Option<SocketAddr> {
        self.clients.get(&client_id).map(|client| client.addr)
    }

    /// Marks the client as recently active. Returns false for unknown ids.
    pub fn touch(&mut self, client_id: SubjectId) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn is_connected(&self, client_id: SubjectId) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Ids of every connected client, used as a liveness snapshot
    pub fn live_ids(&self) -> HashSet<SubjectId> {
        self.clients.keys().copied().collect()
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the removed ids. Queue entries of these clients are left in
    /// place and dropped on the next reconciliation.
    pub fn check_timeouts(&mut self) -> Vec<SubjectId> {
        let timeout = self.timeout;
        let timed_out: Vec<SubjectId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Returns true if no clients are currently connected
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    fn test_addr2() -> SocketAddr {
        "127.0.0.1:8081".parse().unwrap()
    }

    fn manager(max_clients: usize) -> ClientManager {
        ClientManager::new(max_clients, Duration::from_secs(5))
    }

    #[test]
    fn test_client_creation() {
        let addr = test_addr();
        let client = Client::new(1, addr);

        assert_eq!(client.id, 1);
        assert_eq!(client.addr, addr);
    }

    #[test]
    fn test_client_timeout() {
        let addr = test_addr();
        let mut client = Client::new(1, addr);

        assert!(!client.is_timed_out(Duration::from_secs(1)));

        client.last_seen = Instant::now() - Duration::from_secs(2);

        assert!(client.is_timed_out(Duration::from_secs(1)));
    }

    #[test]
    fn test_add_multiple_clients() {
        let mut manager = manager(3);

        let client_id1 = manager.add_client(test_addr()).unwrap();
        let client_id2 = manager.add_client(test_addr2()).unwrap();

        assert_eq!(client_id1, 1);
        assert_eq!(client_id2, 2);
        assert_eq!(manager.len(), 2);
        assert!(!manager.is_empty());
    }

    #[test]
    fn test_add_client_max_capacity() {
        let mut manager = manager(1);

        assert!(manager.add_client(test_addr()).is_some());
        assert!(manager.add_client(test_addr2()).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_ids_are_not_reused() {
        let mut manager = manager(2);

        let first = manager.add_client(test_addr()).unwrap();
        assert!(manager.remove_client(&first));
        let second = manager.add_client(test_addr()).unwrap();

        assert_ne!(first, second);
        assert!(!manager.is_connected(first));
        assert!(manager.is_connected(second));
    }

    #[test]
    fn test_remove_nonexistent_client() {
        let mut manager = manager(2);
        assert!(!manager.remove_client(&999));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_find_client_by_addr() {
        let mut manager = manager(2);

        let client_id1 = manager.add_client(test_addr()).unwrap();
        let _client_id2 = manager.add_client(test_addr2()).unwrap();

        assert_eq!(manager.find_client_by_addr(test_addr()), Some(client_id1));
        assert_eq!(manager.addr_of(client_id1), Some(test_addr()));

        let unknown_addr: SocketAddr = "192.168.1.1:9999".parse().unwrap();
        assert_eq!(manager.find_client_by_addr(unknown_addr), None);
        assert_eq!(manager.addr_of(42), None);
    }

    #[test]
    fn test_live_ids_snapshot() {
        let mut manager = manager(3);
        let a = manager.add_client(test_addr()).unwrap();
        let b = manager.add_client(test_addr2()).unwrap();

        let live = manager.live_ids();
        manager.remove_client(&a);

        assert!(live.contains(&a));
        assert!(live.contains(&b));
        assert!(!manager.live_ids().contains(&a));
    }

    #[test]
    fn test_check_timeouts() {
        let mut manager = ClientManager::new(3, Duration::from_millis(500));
        let stale = manager.add_client(test_addr()).unwrap();
        let fresh = manager.add_client(test_addr2()).unwrap();

        manager.clients.get_mut(&stale).unwrap().last_seen =
            Instant::now() - Duration::from_secs(2);

        assert!(manager.touch(fresh));
        assert!(!manager.touch(999));

        let removed = manager.check_timeouts();
        assert_eq!(removed, vec![stale]);
        assert!(manager.is_connected(fresh));
    }
}
