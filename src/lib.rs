//! # Aphelion Core
//!
//! A peer-to-peer secure messaging core: tiered end-to-end encryption,
//! signed envelopes, delivery tracking, delay-tolerant forwarding, and
//! presence-based peer discovery, with no central servers involved.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       APHELION CORE MODULES                             │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌──────────────────────────┐      ┌──────────────────────────┐         │
//! │  │        Discovery         │      │        Messaging         │         │
//! │  │                          │      │                          │         │
//! │  │ - Presence pings         │─────►│ - Session establishment  │         │
//! │  │ - Timeout eviction       │      │ - Sign + seal envelopes  │         │
//! │  │ - Network stats          │      │ - Delivery tracking      │         │
//! │  │ - Event ring             │      │ - Store-and-forward      │         │
//! │  └────────────┬─────────────┘      └──────┬──────────┬────────┘         │
//! │               │                           │          │                  │
//! │               ▼                           ▼          ▼                  │
//! │  ┌──────────────────────────┐  ┌───────────────┐  ┌─────────────────┐   │
//! │  │          Peers           │  │    Crypto     │  │    Transport    │   │
//! │  │                          │  │               │  │                 │   │
//! │  │ - Directory              │  │ - KEM + HKDF  │  │ - Trait seam    │   │
//! │  │ - Latency / quality      │  │ - Ed25519     │  │ - In-memory hub │   │
//! │  │ - Capabilities           │  │ - AES-256-GCM │  │ - Event stream  │   │
//! │  └──────────────────────────┘  └───────────────┘  └─────────────────┘   │
//! │                                                                         │
//! │  Ambient: error (taxonomy), events (listeners), time (clock seam)       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire library
//! - [`crypto`] - The crypto provider seam, key material, security tiers
//! - [`peers`] - Peer directory: identity keys, liveness, quality
//! - [`transport`] - Delivery seam and the in-memory transport
//! - [`messaging`] - Secure messaging core (sessions, envelopes, DTN)
//! - [`discovery`] - Peer discovery and presence management
//! - [`events`] - Typed listener registries
//! - [`time`] - Clock seam for testable time
//!
//! ## Security Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          SECURITY LAYERS                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Layer 1: Session Establishment (KEM + HKDF)                            │
//! │  ───────────────────────────────────────────                            │
//! │  Each peer pair shares a session key derived by encapsulating against   │
//! │  the recipient's published KEM key. Sessions rotate hourly; at most     │
//! │  one session per peer is ever active.                                   │
//! │                                                                         │
//! │  Layer 2: Message Confidentiality (AES-256-GCM)                         │
//! │  ──────────────────────────────────────────────                         │
//! │  Payloads are sealed under the session key with the envelope identity   │
//! │  bound as AAD, so ciphertext cannot be replayed under another           │
//! │  message, sender, recipient, or session.                                │
//! │                                                                         │
//! │  Layer 3: Authenticity (Ed25519 over the plaintext)                     │
//! │  ──────────────────────────────────────────────────                     │
//! │  The plaintext is signed before encryption. A signature that fails      │
//! │  to verify downgrades the message to unsigned instead of dropping       │
//! │  it: confidentiality held, only the authenticity claim did not.         │
//! │                                                                         │
//! │  Security tiers (Standard / High / Maximum) select the KEM strength     │
//! │  and derivation domain per message.                                     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Wiring
//!
//! Everything is explicit: build the collaborators, hand them to the core,
//! and the core to discovery. No globals.
//!
//! ```ignore
//! use std::sync::Arc;
//! use aphelion_core::{
//!     Clock, DhKemProvider, DiscoveryConfig, MemoryHub, MemoryTransport,
//!     MessagingConfig, PeerDirectory, PeerDiscovery, SecureMessaging, SendOptions,
//! };
//!
//! let hub = MemoryHub::new();
//! let transport = MemoryTransport::new(Arc::clone(&hub), "alice");
//! let directory = Arc::new(PeerDirectory::new());
//! let core = SecureMessaging::new(
//!     MessagingConfig::default(),
//!     Arc::new(DhKemProvider::new()),
//!     transport,
//!     Arc::clone(&directory),
//!     Clock::system(),
//! );
//! let discovery = PeerDiscovery::new(
//!     DiscoveryConfig::default(),
//!     Arc::clone(&core),
//!     directory,
//!     Clock::system(),
//! );
//!
//! discovery.initialize().await?;
//! core.on_message(|message| println!("{}: {}", message.sender_id, message.payload));
//! core.send_message("bob", "hello", SendOptions::default()).await?;
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

pub mod crypto;
pub mod discovery;
pub mod error;
pub mod events;
pub mod messaging;
pub mod peers;
pub mod time;
pub mod transport;

// ============================================================================
// RE-EXPORTS
// ============================================================================

pub use crypto::{CryptoProvider, DhKemProvider, SecurityLevel};
pub use discovery::{DiscoveryConfig, NetworkStats, PeerDiscovery};
pub use error::{Error, Result};
pub use events::ListenerId;
pub use messaging::{
    DeliveryStatus, MessagePriority, MessagingConfig, ReceivedMessage, SecureMessaging,
    SendOptions,
};
pub use peers::{ConnectionQuality, PeerDirectory, PeerInfo};
pub use time::Clock;
pub use transport::memory::{MemoryHub, MemoryTransport};
pub use transport::{ConnectionState, Transport};

// ============================================================================
// VERSION INFO
// ============================================================================

/// Returns the version of Aphelion Core.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

// ============================================================================
// TESTS
// ============================================================================
