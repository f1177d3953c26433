//! # Peer Directory
//!
//! Types and utilities for tracking known peers.
//!
//! The [`PeerDirectory`] is the single owner of [`PeerInfo`] state. It is
//! shared as `Arc<PeerDirectory>` between the messaging core (which reads
//! public keys and touches liveness on message receipt) and the discovery
//! service (which drives ping updates and timeout eviction). All handed-out
//! values are snapshots; mutation happens only through directory methods.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::crypto::{KemPublicKey, SigningPublicKey};

/// Connection quality classification derived from measured latency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// 500ms or worse
    Poor,
    /// Under 500ms
    Fair,
    /// Under 200ms
    Good,
    /// Under 100ms
    Excellent,
}

impl ConnectionQuality {
    /// Classify a round-trip latency sample in milliseconds.
    ///
    /// Bands: `<100ms` excellent, `<200ms` good, `<500ms` fair, else poor.
    pub fn from_latency(latency_ms: u32) -> Self {
        if latency_ms < 100 {
            ConnectionQuality::Excellent
        } else if latency_ms < 200 {
            ConnectionQuality::Good
        } else if latency_ms < 500 {
            ConnectionQuality::Fair
        } else {
            ConnectionQuality::Poor
        }
    }

    /// Lowercase label, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionQuality::Poor => "poor",
            ConnectionQuality::Fair => "fair",
            ConnectionQuality::Good => "good",
            ConnectionQuality::Excellent => "excellent",
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a peer advertises it can do.
///
/// A closed set: unknown capabilities from future protocol versions are
/// dropped at the wire boundary rather than carried as opaque blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Point-to-point secure messaging.
    Messaging,
    /// Receives broadcast envelopes.
    Broadcast,
    /// Accepts delay-tolerant traffic.
    Dtn,
    /// Will store-and-forward for third parties.
    Relay,
}

/// Information about a known peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Opaque peer identifier
    pub peer_id: String,
    /// The peer's key-encapsulation public key
    pub kem_public_key: KemPublicKey,
    /// The peer's signing public key
    pub signing_public_key: SigningPublicKey,
    /// Last activity timestamp (Unix milliseconds)
    pub last_seen: i64,
    /// Current quality classification
    pub quality: ConnectionQuality,
    /// Most recent latency sample in milliseconds (0 = no sample yet)
    pub latency_ms: u32,
    /// Protocol version the peer speaks
    pub protocol_version: String,
    /// Advertised capabilities
    pub capabilities: Vec<Capability>,
    /// Transport address hint, if known
    pub address: Option<String>,
}

impl PeerInfo {
    /// Create a freshly seen peer with no latency sample yet.
    pub fn new(
        peer_id: impl Into<String>,
        kem_public_key: KemPublicKey,
        signing_public_key: SigningPublicKey,
        now_millis: i64,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            kem_public_key,
            signing_public_key,
            last_seen: now_millis,
            quality: ConnectionQuality::Good,
            latency_ms: 0,
            protocol_version: "1.0.0".to_string(),
            capabilities: vec![Capability::Messaging, Capability::Broadcast],
            address: None,
        }
    }

    /// Replace the advertised capability set.
    pub fn with_capabilities(mut self, capabilities: Vec<Capability>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether the peer advertises `capability`.
    pub fn has_capability(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Whether this peer has gone silent for longer than `timeout_millis`.
    pub fn is_stale(&self, now_millis: i64, timeout_millis: i64) -> bool {
        now_millis - self.last_seen > timeout_millis
    }
}

/// Shared registry of known peers.
#[derive(Debug, Default)]
pub struct PeerDirectory {
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl PeerDirectory {
    /// An empty directory.
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or replace a peer entry. Returns `true` if the peer was new.
    pub fn upsert(&self, info: PeerInfo) -> bool {
        self.peers.write().insert(info.peer_id.clone(), info).is_none()
    }

    /// Copy of the peer's entry, if known.
    pub fn get(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.read().get(peer_id).cloned()
    }

    /// Whether the directory knows this peer.
    pub fn contains(&self, peer_id: &str) -> bool {
        self.peers.read().contains_key(peer_id)
    }

    /// Remove a peer, returning its entry if it was present.
    pub fn remove(&self, peer_id: &str) -> Option<PeerInfo> {
        self.peers.write().remove(peer_id)
    }

    /// Number of known peers.
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether no peers are known.
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Snapshot of every known peer.
    pub fn all(&self) -> Vec<PeerInfo> {
        self.peers.read().values().cloned().collect()
    }

    /// The IDs of every known peer.
    pub fn ids(&self) -> Vec<String> {
        self.peers.read().keys().cloned().collect()
    }

    /// The peer's KEM public key, if the peer is known.
    pub fn kem_key(&self, peer_id: &str) -> Option<KemPublicKey> {
        self.peers.read().get(peer_id).map(|p| p.kem_public_key.clone())
    }

    /// The peer's signing public key, if the peer is known.
    pub fn signing_key(&self, peer_id: &str) -> Option<SigningPublicKey> {
        self.peers.read().get(peer_id).map(|p| p.signing_public_key.clone())
    }

    /// Update the last-seen timestamp (message receipt, any observed activity).
    pub fn touch(&self, peer_id: &str, now_millis: i64) {
        if let Some(peer) = self.peers.write().get_mut(peer_id) {
            peer.last_seen = now_millis;
        }
    }

    /// Record a successful ping: refresh liveness, store the latency sample,
    /// reclassify quality. Returns the updated entry.
    ///
    /// Latency is clamped to at least 1ms so that 0 stays reserved for
    /// "no sample yet".
    pub fn record_ping(&self, peer_id: &str, now_millis: i64, latency_ms: u32) -> Option<PeerInfo> {
        let mut peers = self.peers.write();
        let peer = peers.get_mut(peer_id)?;
        let sample = latency_ms.max(1);
        peer.last_seen = now_millis;
        peer.latency_ms = sample;
        peer.quality = ConnectionQuality::from_latency(sample);
        Some(peer.clone())
    }

    /// Remove and return every peer whose silence exceeds the timeout.
    pub fn evict_stale(&self, now_millis: i64, timeout_millis: i64) -> Vec<PeerInfo> {
        let mut peers = self.peers.write();
        let stale: Vec<String> = peers
            .values()
            .filter(|p| p.is_stale(now_millis, timeout_millis))
            .map(|p| p.peer_id.clone())
            .collect();
        stale.into_iter().filter_map(|id| peers.remove(&id)).collect()
    }
}

// ============================================================================
// TESTS
// ============================================================================
