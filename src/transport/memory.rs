//! # In-Process Memory Transport
//!
//! Routes payloads between endpoints registered on a shared [`MemoryHub`].
//! This is the transport used by tests and demos: several cores wired to one
//! hub behave like a small network with instant delivery.
//!
//! Reachability rules:
//! - delivery succeeds only when both endpoints are connected to the hub;
//! - broadcast reaches every other connected endpoint;
//! - [`MemoryTransport::set_state`] can force the `Degraded` state to
//!   exercise state mirroring without tearing the link down.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use super::{ConnectionState, Transport, TransportEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;

struct Endpoint {
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    connected: bool,
}

/// Shared routing table for a set of [`MemoryTransport`] endpoints.
#[derive(Default)]
pub struct MemoryHub {
    endpoints: RwLock<HashMap<String, Endpoint>>,
}

impl MemoryHub {
    /// An empty hub with no endpoints.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn attach(&self, peer_id: &str, events_tx: mpsc::UnboundedSender<TransportEvent>) {
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(peer_id) {
            tracing::warn!(peer_id, "Replacing existing memory hub endpoint");
        }
        endpoints.insert(
            peer_id.to_string(),
            Endpoint {
                events_tx,
                connected: false,
            },
        );
    }

    fn set_connected(&self, peer_id: &str, connected: bool) {
        if let Some(endpoint) = self.endpoints.write().get_mut(peer_id) {
            endpoint.connected = connected;
        }
    }

    fn deliver(&self, from: &str, to: &str, payload: Vec<u8>) -> Result<()> {
        let endpoints = self.endpoints.read();
        let target = endpoints
            .get(to)
            .filter(|endpoint| endpoint.connected)
            .ok_or_else(|| Error::TransportFailure(format!("peer {} is unreachable", to)))?;

        target
            .events_tx
            .send(TransportEvent::Inbound {
                from: from.to_string(),
                payload,
            })
            .map_err(|_| Error::TransportFailure(format!("peer {} dropped its endpoint", to)))
    }

    fn broadcast_from(&self, from: &str, payload: &[u8]) -> usize {
        let endpoints = self.endpoints.read();
        let mut reached = 0;
        for (peer_id, endpoint) in endpoints.iter() {
            if peer_id == from || !endpoint.connected {
                continue;
            }
            let event = TransportEvent::Inbound {
                from: from.to_string(),
                payload: payload.to_vec(),
            };
            if endpoint.events_tx.send(event).is_ok() {
                reached += 1;
            }
        }
        reached
    }

    fn connected_count_excluding(&self, peer_id: &str) -> usize {
        self.endpoints
            .read()
            .iter()
            .filter(|(id, endpoint)| id.as_str() != peer_id && endpoint.connected)
            .count()
    }
}

/// One endpoint on a [`MemoryHub`].
pub struct MemoryTransport {
    peer_id: String,
    hub: Arc<MemoryHub>,
    state: RwLock<ConnectionState>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    /// Taken by the core when it starts its inbound pump.
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
}

impl MemoryTransport {
    /// Register a new endpoint on the hub. The endpoint starts disconnected.
    pub fn new(hub: Arc<MemoryHub>, peer_id: impl Into<String>) -> Arc<Self> {
        let peer_id = peer_id.into();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        hub.attach(&peer_id, events_tx.clone());

        Arc::new(Self {
            peer_id,
            hub,
            state: RwLock::new(ConnectionState::Disconnected),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Force a connection state (e.g. `Degraded`) and notify the consumer.
    ///
    /// Hub reachability is not touched; only `connect`/`disconnect` change
    /// who can be reached.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        let _ = self.events_tx.send(TransportEvent::StateChanged(state));
    }

    fn emit_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        let _ = self.events_tx.send(TransportEvent::StateChanged(state));
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> String {
        self.peer_id.clone()
    }

    async fn connect(&self) -> Result<()> {
        if self.state.read().is_connected() {
            return Ok(());
        }

        self.emit_state(ConnectionState::Connecting);
        self.hub.set_connected(&self.peer_id, true);
        self.emit_state(ConnectionState::Connected);

        tracing::info!(peer_id = %self.peer_id, "Memory transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if *self.state.read() == ConnectionState::Disconnected {
            return Ok(());
        }

        self.hub.set_connected(&self.peer_id, false);
        self.emit_state(ConnectionState::Disconnected);

        tracing::info!(peer_id = %self.peer_id, "Memory transport disconnected");
        Ok(())
    }

    async fn send(&self, peer_id: &str, payload: Vec<u8>) -> Result<()> {
        let state = *self.state.read();
        if matches!(state, ConnectionState::Disconnected | ConnectionState::Connecting) {
            return Err(Error::TransportFailure("transport is not connected".into()));
        }

        tracing::debug!(
            from = %self.peer_id,
            to = %peer_id,
            bytes = payload.len(),
            "Memory transport delivering payload"
        );
        self.hub.deliver(&self.peer_id, peer_id, payload)
    }

    async fn broadcast(&self, payload: Vec<u8>) -> Result<usize> {
        let state = *self.state.read();
        if matches!(state, ConnectionState::Disconnected | ConnectionState::Connecting) {
            return Err(Error::TransportFailure("transport is not connected".into()));
        }

        let reached = self.hub.broadcast_from(&self.peer_id, &payload);
        tracing::debug!(from = %self.peer_id, reached, "Memory transport broadcast");
        Ok(reached)
    }

    fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn peer_count(&self) -> usize {
        self.hub.connected_count_excluding(&self.peer_id)
    }

    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.events_rx.lock().take()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_emits_state_transitions() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub, "node-a");
        let mut events = transport.events().unwrap();

        transport.connect().await.unwrap();

        match events.recv().await.unwrap() {
            TransportEvent::StateChanged(state) => assert_eq!(state, ConnectionState::Connecting),
            other => panic!("unexpected event: {:?}", other),
        }
        match events.recv().await.unwrap() {
            TransportEvent::StateChanged(state) => assert_eq!(state, ConnectionState::Connected),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(transport.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_events_can_only_be_taken_once() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub, "node-a");

        assert!(transport.events().is_some());
        assert!(transport.events().is_none());
    }

    #[tokio::test]
    async fn test_send_between_connected_endpoints() {
        let hub = MemoryHub::new();
        let alice = MemoryTransport::new(Arc::clone(&hub), "alice");
        let bob = MemoryTransport::new(hub, "bob");
        let mut bob_events = bob.events().unwrap();

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        // Drain Bob's own state transitions.
        bob_events.recv().await.unwrap();
        bob_events.recv().await.unwrap();

        alice.send("bob", b"hello".to_vec()).await.unwrap();

        match bob_events.recv().await.unwrap() {
            TransportEvent::Inbound { from, payload } => {
                assert_eq!(from, "alice");
                assert_eq!(payload, b"hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_send_fails_when_disconnected() {
        let hub = MemoryHub::new();
        let alice = MemoryTransport::new(Arc::clone(&hub), "alice");
        let bob = MemoryTransport::new(hub, "bob");
        bob.connect().await.unwrap();

        // Alice never connected.
        let result = alice.send("bob", b"hello".to_vec()).await;
        assert!(matches!(result, Err(Error::TransportFailure(_))));
    }

    #[tokio::test]
    async fn test_send_to_unreachable_peer_fails() {
        let hub = MemoryHub::new();
        let alice = MemoryTransport::new(Arc::clone(&hub), "alice");
        let bob = MemoryTransport::new(hub, "bob");

        alice.connect().await.unwrap();
        // Bob registered but never connected.
        assert!(alice.send("bob", b"x".to_vec()).await.is_err());
        // And nobody has heard of carol.
        assert!(alice.send("carol", b"x".to_vec()).await.is_err());
        let _ = bob;
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_peers_only() {
        let hub = MemoryHub::new();
        let alice = MemoryTransport::new(Arc::clone(&hub), "alice");
        let bob = MemoryTransport::new(Arc::clone(&hub), "bob");
        let carol = MemoryTransport::new(Arc::clone(&hub), "carol");
        let offline = MemoryTransport::new(hub, "offline");

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        carol.connect().await.unwrap();
        let _ = offline;

        let reached = alice.broadcast(b"announce".to_vec()).await.unwrap();
        assert_eq!(reached, 2);
        assert_eq!(alice.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_set_state_forces_degraded_and_notifies() {
        let hub = MemoryHub::new();
        let transport = MemoryTransport::new(hub, "node-a");
        let mut events = transport.events().unwrap();

        transport.connect().await.unwrap();
        events.recv().await.unwrap();
        events.recv().await.unwrap();

        transport.set_state(ConnectionState::Degraded);
        assert_eq!(transport.state(), ConnectionState::Degraded);

        match events.recv().await.unwrap() {
            TransportEvent::StateChanged(state) => assert_eq!(state, ConnectionState::Degraded),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_disconnected_peer_becomes_unreachable() {
        let hub = MemoryHub::new();
        let alice = MemoryTransport::new(Arc::clone(&hub), "alice");
        let bob = MemoryTransport::new(hub, "bob");

        alice.connect().await.unwrap();
        bob.connect().await.unwrap();
        assert!(alice.send("bob", b"one".to_vec()).await.is_ok());

        bob.disconnect().await.unwrap();
        assert!(alice.send("bob", b"two".to_vec()).await.is_err());
    }
}
