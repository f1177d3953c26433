//! # Error Handling
//!
//! This module provides the error types for Aphelion Core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                      │
//! │  │                                                                      │
//! │  ├── Lifecycle Errors                                                   │
//! │  │   ├── NotInitialized        - Core not initialized                   │
//! │  │   └── InitializationFailed  - Core failed to come up                 │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                      │
//! │  │   ├── ProviderFailure       - Cryptographic provider call failed     │
//! │  │   ├── InvalidKey            - Invalid key format/length              │
//! │  │   └── SignatureInvalid      - Signature did not verify               │
//! │  │                                                                      │
//! │  ├── Key Exchange Errors                                                │
//! │  │   ├── KeyExchangeFailed     - Could not establish a session          │
//! │  │   └── UnknownKeyExchange    - Envelope references an unknown session │
//! │  │                                                                      │
//! │  ├── Network Errors                                                     │
//! │  │   ├── NotConnected          - Not connected to the network           │
//! │  │   ├── TransportFailure      - Transport rejected the operation       │
//! │  │   ├── Timeout               - Operation timed out                    │
//! │  │   └── PeerNotFound          - Peer not present in the directory      │
//! │  │                                                                      │
//! │  └── Message Errors                                                     │
//! │      ├── MessageTooLarge       - Payload exceeds the configured limit   │
//! │      ├── InvalidMessage        - Malformed or unparseable envelope      │
//! │      └── DeliveryFailed        - Message delivery failed                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Propagation Policy
//!
//! Per-message failures are values: a failed send returns `Err`, a bad
//! inbound envelope is logged and dropped. Neither takes down the inbound
//! pump or the discovery ping loop. Initialization failures are the one
//! exception and surface loudly from `initialize()`.
//!
//! Two cases are deliberately *not* errors:
//! - A peer timing out is a lifecycle event, reported through the discovery
//!   listeners rather than an `Err`.
//! - An invalid signature on an otherwise well-formed inbound message is a
//!   soft failure: the message is still delivered with `signed = false`.
//!   [`Error::SignatureInvalid`] exists for callers that verify explicitly.

use thiserror::Error;

/// Result type alias for Aphelion Core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Aphelion Core
///
/// All errors are categorized by module/domain to make error handling
/// clearer and to provide meaningful error messages to users.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Lifecycle Errors (100-199)
    // ========================================================================

    /// Core has not been initialized
    #[error("Messaging core has not been initialized. Call SecureMessaging::initialize() first.")]
    NotInitialized,

    /// Core failed to initialize
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    // ========================================================================
    // Crypto Errors (200-299)
    // ========================================================================

    /// A cryptographic provider call failed
    #[error("Cryptographic provider failure: {0}")]
    ProviderFailure(String),

    /// Invalid key format or length
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signature verification failed
    #[error("Signature verification failed")]
    SignatureInvalid,

    // ========================================================================
    // Key Exchange Errors (300-399)
    // ========================================================================

    /// Key exchange could not be established
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// An envelope referenced a key exchange this node does not hold
    #[error("Unknown key exchange: {0}")]
    UnknownKeyExchange(String),

    // ========================================================================
    // Network Errors (400-499)
    // ========================================================================

    /// Not connected to the network
    #[error("Not connected to the network.")]
    NotConnected,

    /// Transport rejected or failed the operation
    #[error("Transport failure: {0}")]
    TransportFailure(String),

    /// Operation timed out
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Peer not present in the peer directory
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    // ========================================================================
    // Message Errors (500-599)
    // ========================================================================

    /// Payload exceeds the configured maximum message size
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge {
        /// Size of the rejected payload in bytes
        size: usize,
        /// Configured limit in bytes
        max: usize,
    },

    /// Malformed or unparseable message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Message delivery failed
    #[error("Failed to deliver message: {0}")]
    DeliveryFailed(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}

impl Error {
    /// Check if this error is recoverable
    ///
    /// Recoverable errors can potentially be resolved by retrying once
    /// conditions change (reconnect, peer comes back, congestion clears).
    /// Retry itself is the caller's responsibility.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotConnected
                | Error::TransportFailure(_)
                | Error::Timeout(_)
                | Error::PeerNotFound(_)
                | Error::DeliveryFailed(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
