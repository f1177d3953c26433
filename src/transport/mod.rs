//! # Transport Module
//!
//! The delivery seam between the messaging core and the actual network.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         TRANSPORT SEAM                                  │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   SecureMessaging                                                       │
//! │        │  send(peer, bytes) / broadcast(bytes)                          │
//! │        ▼                                                                │
//! │   ┌──────────────────────────────────────────────┐                      │
//! │   │  dyn Transport                               │                      │
//! │   │                                              │                      │
//! │   │  • connect / disconnect                      │                      │
//! │   │  • send / broadcast                          │                      │
//! │   │  • events() → inbound + state stream         │                      │
//! │   └──────────────────────────────────────────────┘                      │
//! │        ▲                          ▲                                     │
//! │        │                          │                                     │
//! │   MemoryTransport            (a real libp2p/WebRTC                      │
//! │   (in-process hub,            transport plugs in here)                  │
//! │    tests and demos)                                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The core never owns connection transitions: it observes
//! [`TransportEvent::StateChanged`] and mirrors the state. Payloads are
//! opaque bytes to the transport; all framing and cryptography happen above.

pub mod memory;

pub use memory::{MemoryHub, MemoryTransport};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Connection state of the transport, mirrored by the messaging core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not connected
    #[default]
    Disconnected,
    /// Connection in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Connected but impaired (lossy link, partial reachability)
    Degraded,
}

impl ConnectionState {
    /// Whether messages can be handed to the transport in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Lowercase label, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events pushed from the transport to its single consumer (the core).
pub enum TransportEvent {
    /// A payload arrived from a peer
    Inbound {
        /// Sending peer id
        from: String,
        /// Opaque payload bytes
        payload: Vec<u8>,
    },
    /// The connection state changed
    StateChanged(ConnectionState),
}

impl std::fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbound { from, payload } => f
                .debug_struct("Inbound")
                .field("from", from)
                .field("payload_len", &payload.len())
                .finish(),
            Self::StateChanged(state) => f.debug_tuple("StateChanged").field(state).finish(),
        }
    }
}

/// The transport collaborator.
///
/// Implementations must be safe to share across tasks. `events()` hands out
/// the event stream exactly once; the messaging core takes it when it
/// initializes.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The peer id this endpoint answers to.
    fn local_peer_id(&self) -> String;

    /// Bring the link up. Emits `Connecting` then `Connected` state events.
    async fn connect(&self) -> Result<()>;

    /// Tear the link down. Emits a `Disconnected` state event.
    async fn disconnect(&self) -> Result<()>;

    /// Deliver a payload to one peer. Fails if the peer is unreachable.
    async fn send(&self, peer_id: &str, payload: Vec<u8>) -> Result<()>;

    /// Deliver a payload to every reachable peer. Returns the reach count.
    async fn broadcast(&self, payload: Vec<u8>) -> Result<usize>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Number of currently reachable peers.
    fn peer_count(&self) -> usize;

    /// Take the event stream. Returns `None` after the first call.
    fn events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_default() {
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_only_connected_accepts_traffic() {
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Disconnected.is_connected());
        assert!(!ConnectionState::Connecting.is_connected());
        assert!(!ConnectionState::Degraded.is_connected());
    }

    #[test]
    fn test_event_debug_hides_payload_bytes() {
        let event = TransportEvent::Inbound {
            from: "peer-a".into(),
            payload: vec![0u8; 512],
        };
        let debug = format!("{:?}", event);
        assert!(debug.contains("payload_len"));
        assert!(debug.contains("512"));
    }
}
