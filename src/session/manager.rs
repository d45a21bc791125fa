//! Session manager actor.
//!
//! A single task owns the [`SessionRegistry`]. Every mutation reaches it as
//! an [`Event`] over one channel, so registration, removal and delivery are
//! totally ordered and the registry is never locked.

use super::registry::{Delivery, SessionId, SessionRegistry};
use crate::config::DispatchMode;
use bytes::Bytes;
use std::net::SocketAddr;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

/// Capacity of the manager's event channel.
const EVENT_QUEUE_SIZE: usize = 1024;

/// Messages handled by the manager task.
#[derive(Debug)]
pub enum Event {
    /// Add a session; the reply carries its id, or `None` at capacity.
    Register {
        peer: SocketAddr,
        mailbox: mpsc::Sender<Bytes>,
        reply: oneshot::Sender<Option<SessionId>>,
    },
    /// Remove a session. Idempotent.
    Unregister { id: SessionId },
    /// Bytes read from a session's socket.
    Inbound { from: SessionId, payload: Bytes },
    /// Report the number of live sessions.
    Count { reply: oneshot::Sender<usize> },
    /// Drop every session and stop.
    Shutdown,
}

/// Cloneable handle used by the listener and session loops.
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    events: mpsc::Sender<Event>,
}

impl ManagerHandle {
    /// Register a session mailbox. `None` if at capacity or the manager
    /// has stopped.
    pub async fn register(
        &self,
        peer: SocketAddr,
        mailbox: mpsc::Sender<Bytes>,
    ) -> Option<SessionId> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Register {
                peer,
                mailbox,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn unregister(&self, id: SessionId) {
        let _ = self.events.send(Event::Unregister { id }).await;
    }

    /// Hand inbound bytes to the manager for delivery.
    pub async fn dispatch(&self, from: SessionId, payload: Bytes) {
        let _ = self.events.send(Event::Inbound { from, payload }).await;
    }

    /// Number of live sessions, or 0 if the manager has stopped.
    pub async fn session_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.events.send(Event::Count { reply }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }
}

/// Owner of the session registry.
pub struct SessionManager {
    registry: SessionRegistry,
    dispatch: DispatchMode,
    events: mpsc::Receiver<Event>,
}

impl SessionManager {
    pub fn new(max_sessions: usize, dispatch: DispatchMode) -> (Self, ManagerHandle) {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_SIZE);
        let manager = Self {
            registry: SessionRegistry::new(max_sessions),
            dispatch,
            events: rx,
        };
        (manager, ManagerHandle { events: tx })
    }

    /// Process events until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            if !self.handle(event) {
                break;
            }
        }

        let dropped = self.registry.clear();
        info!(sessions = dropped, "Session manager stopped");
    }

    /// Apply one event. Returns `false` when the manager should stop.
    fn handle(&mut self, event: Event) -> bool {
        match event {
            Event::Register {
                peer,
                mailbox,
                reply,
            } => {
                let id = self.registry.insert(peer, mailbox);
                match id {
                    Some(id) => {
                        info!(session = %id, peer = %peer, sessions = self.registry.len(), "Added new connection");
                    }
                    None => {
                        warn!(peer = %peer, max = self.registry.capacity(), "Session limit reached");
                    }
                }
                // Drops the mailbox sender with `id` if the caller went away
                if reply.send(id).is_err() {
                    if let Some(id) = id {
                        self.registry.remove(id);
                    }
                }
            }

            Event::Unregister { id } => {
                if let Some(peer) = self.registry.remove(id) {
                    info!(session = %id, peer = %peer, sessions = self.registry.len(), "Connection terminated");
                }
            }

            Event::Inbound { from, payload } => {
                trace!(session = %from, bytes = payload.len(), "Inbound message");
                self.route(from, payload);
            }

            Event::Count { reply } => {
                let _ = reply.send(self.registry.len());
            }

            Event::Shutdown => {
                debug!(sessions = self.registry.len(), "Shutdown requested");
                return false;
            }
        }
        true
    }

    fn route(&mut self, from: SessionId, payload: Bytes) {
        match self.dispatch {
            DispatchMode::Unicast => match self.registry.deliver(from, payload) {
                Delivery::Queued => {}
                Delivery::Evicted => {
                    warn!(session = %from, "Mailbox full or closed, session evicted");
                }
                Delivery::Unknown => {
                    trace!(session = %from, "Message from unregistered session dropped");
                }
            },
            DispatchMode::Broadcast => {
                for id in self.registry.broadcast(&payload) {
                    warn!(session = %id, "Mailbox full or closed, session evicted");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn start(max_sessions: usize, dispatch: DispatchMode) -> ManagerHandle {
        let (manager, handle) = SessionManager::new(max_sessions, dispatch);
        tokio::spawn(manager.run());
        handle
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let handle = start(8, DispatchMode::Unicast);
        let (tx, mut rx) = mpsc::channel(4);

        let id = handle.register(peer(1), tx).await.unwrap();
        assert_eq!(handle.session_count().await, 1);

        handle.unregister(id).await;
        handle.unregister(id).await;
        assert_eq!(handle.session_count().await, 0);

        // Removal closes the mailbox
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_register_at_capacity() {
        let handle = start(1, DispatchMode::Unicast);
        let (tx1, _rx1) = mpsc::channel(4);
        let (tx2, _rx2) = mpsc::channel(4);

        assert!(handle.register(peer(1), tx1).await.is_some());
        assert!(handle.register(peer(2), tx2).await.is_none());
    }

    #[tokio::test]
    async fn test_unicast_reaches_only_sender() {
        let handle = start(8, DispatchMode::Unicast);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = handle.register(peer(1), tx_a).await.unwrap();
        handle.register(peer(2), tx_b).await.unwrap();

        handle.dispatch(a, Bytes::from_static(b"from a")).await;
        assert_eq!(handle.session_count().await, 2);

        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"from a"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_everyone() {
        let handle = start(8, DispatchMode::Broadcast);
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let a = handle.register(peer(1), tx_a).await.unwrap();
        handle.register(peer(2), tx_b).await.unwrap();

        handle.dispatch(a, Bytes::from_static(b"hello")).await;

        assert_eq!(rx_a.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(rx_b.recv().await.unwrap(), Bytes::from_static(b"hello"));
    }

    #[tokio::test]
    async fn test_saturated_session_is_evicted_without_blocking_others() {
        let handle = start(8, DispatchMode::Broadcast);
        let (slow_tx, mut slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(16);
        let slow = handle.register(peer(1), slow_tx).await.unwrap();
        handle.register(peer(2), fast_tx).await.unwrap();

        for i in 0..5u8 {
            handle.dispatch(slow, Bytes::from(vec![i])).await;
        }
        assert_eq!(handle.session_count().await, 1);

        for i in 0..5u8 {
            assert_eq!(fast_rx.recv().await.unwrap(), Bytes::from(vec![i]));
        }

        // The slow mailbox holds what fit, then reports closed
        assert_eq!(slow_rx.recv().await.unwrap(), Bytes::from(vec![0u8]));
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_mailboxes() {
        let (manager, handle) = SessionManager::new(8, DispatchMode::Unicast);
        let task = tokio::spawn(manager.run());
        let (tx, mut rx) = mpsc::channel::<Bytes>(4);
        handle.register(peer(1), tx).await.unwrap();

        handle.shutdown().await;
        task.await.unwrap();

        assert!(rx.recv().await.is_none());
        assert!(handle.register(peer(2), mpsc::channel(1).0).await.is_none());
        assert_eq!(handle.session_count().await, 0);
    }
}
