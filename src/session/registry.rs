//! Registry of live sessions.
//!
//! Owned by the session manager task; never shared across tasks.
//! A session is present iff its write loop may still receive messages.

use bytes::Bytes;
use slab::Slab;
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

/// Identity of a session.
///
/// Slab slots are reused, so each id also carries a generation. A stale id
/// never matches a newer session occupying the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    slot: usize,
    generation: u64,
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}

/// A registered session.
#[derive(Debug)]
struct Entry {
    generation: u64,
    peer: SocketAddr,
    mailbox: mpsc::Sender<Bytes>,
}

/// Outcome of handing a message to a session's mailbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Message queued.
    Queued,
    /// Mailbox full or closed; the session was removed.
    Evicted,
    /// No such session.
    Unknown,
}

/// Registry of live sessions using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct SessionRegistry {
    sessions: Slab<Entry>,
    next_generation: u64,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Slab::new(),
            next_generation: 0,
            max_sessions,
        }
    }

    /// Register a session.
    ///
    /// Returns `None` if the registry is at capacity.
    pub fn insert(&mut self, peer: SocketAddr, mailbox: mpsc::Sender<Bytes>) -> Option<SessionId> {
        if self.sessions.len() >= self.max_sessions {
            return None;
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let slot = self.sessions.insert(Entry {
            generation,
            peer,
            mailbox,
        });
        Some(SessionId { slot, generation })
    }

    /// Remove a session, dropping its mailbox sender.
    ///
    /// Returns the peer address if the session was present. Removing an
    /// absent or stale id is a no-op.
    pub fn remove(&mut self, id: SessionId) -> Option<SocketAddr> {
        if !self.contains(id) {
            return None;
        }
        Some(self.sessions.remove(id.slot).peer)
    }

    /// Check if a session is registered.
    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions
            .get(id.slot)
            .is_some_and(|entry| entry.generation == id.generation)
    }

    pub fn peer(&self, id: SessionId) -> Option<SocketAddr> {
        self.sessions
            .get(id.slot)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| entry.peer)
    }

    /// Queue `message` for one session without waiting.
    pub fn deliver(&mut self, id: SessionId, message: Bytes) -> Delivery {
        let Some(entry) = self.sessions.get(id.slot) else {
            return Delivery::Unknown;
        };
        if entry.generation != id.generation {
            return Delivery::Unknown;
        }
        match entry.mailbox.try_send(message) {
            Ok(()) => Delivery::Queued,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.sessions.remove(id.slot);
                Delivery::Evicted
            }
        }
    }

    /// Queue `message` for every session without waiting.
    ///
    /// Returns the ids of sessions evicted because their mailbox was full
    /// or closed.
    pub fn broadcast(&mut self, message: &Bytes) -> Vec<SessionId> {
        let evicted: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, entry)| entry.mailbox.try_send(message.clone()).is_err())
            .map(|(slot, entry)| SessionId {
                slot,
                generation: entry.generation,
            })
            .collect();

        for id in &evicted {
            self.sessions.remove(id.slot);
        }
        evicted
    }

    /// Remove every session. Returns how many were removed.
    pub fn clear(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Check if there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Maximum number of sessions allowed.
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_insert_and_capacity() {
        let mut registry = SessionRegistry::new(2);
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        let (tx3, _rx3) = mpsc::channel(1);

        let id1 = registry.insert(peer(1), tx1).unwrap();
        let id2 = registry.insert(peer(2), tx2).unwrap();

        // At capacity
        assert!(registry.insert(peer(3), tx3).is_none());

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.peer(id1), Some(peer(1)));
        assert_eq!(registry.peer(id2), Some(peer(2)));
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut registry = SessionRegistry::new(4);
        let (tx, _rx) = mpsc::channel(1);
        let id = registry.insert(peer(1), tx).unwrap();

        assert_eq!(registry.remove(id), Some(peer(1)));
        assert_eq!(registry.remove(id), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_stale_id_does_not_touch_reused_slot() {
        let mut registry = SessionRegistry::new(4);
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);

        let old = registry.insert(peer(1), tx1).unwrap();
        registry.remove(old);
        let new = registry.insert(peer(2), tx2).unwrap();

        assert_eq!(old.slot, new.slot);
        assert!(!registry.contains(old));
        assert_eq!(registry.remove(old), None);
        assert_eq!(registry.deliver(old, Bytes::from_static(b"x")), Delivery::Unknown);
        assert!(registry.contains(new));
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts() {
        let mut registry = SessionRegistry::new(4);
        let (tx, mut rx) = mpsc::channel(1);
        let id = registry.insert(peer(1), tx).unwrap();

        assert_eq!(registry.deliver(id, Bytes::from_static(b"a")), Delivery::Queued);
        assert_eq!(registry.deliver(id, Bytes::from_static(b"b")), Delivery::Evicted);
        assert!(!registry.contains(id));

        // Queued message still drains, then the mailbox reports closed
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"a"));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_closed_mailbox_evicts() {
        let mut registry = SessionRegistry::new(4);
        let (tx, rx) = mpsc::channel(1);
        let id = registry.insert(peer(1), tx).unwrap();
        drop(rx);

        assert_eq!(registry.deliver(id, Bytes::from_static(b"a")), Delivery::Evicted);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_broadcast_evicts_only_saturated() {
        let mut registry = SessionRegistry::new(4);
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(8);
        let slow = registry.insert(peer(1), slow_tx).unwrap();
        let fast = registry.insert(peer(2), fast_tx).unwrap();

        assert!(registry.broadcast(&Bytes::from_static(b"1")).is_empty());
        assert_eq!(registry.broadcast(&Bytes::from_static(b"2")), vec![slow]);

        assert!(!registry.contains(slow));
        assert!(registry.contains(fast));
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"1"));
        assert_eq!(fast_rx.try_recv().unwrap(), Bytes::from_static(b"2"));
    }

    #[test]
    fn test_clear() {
        let mut registry = SessionRegistry::new(4);
        let (tx, mut rx) = mpsc::channel::<Bytes>(1);
        registry.insert(peer(1), tx).unwrap();

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
