//! # Wire Envelope
//!
//! The serialized form of every message the core puts on a transport,
//! plus the local bookkeeping types that track an outbound message
//! through its delivery lifecycle.
//!
//! ## Wire Protocol
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SECURE MESSAGE FORMAT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SecureMessage (JSON serialized)                                        │
//! │  ──────────────────────────────                                         │
//! │  {                                                                      │
//! │    "version": 1,                   // Protocol version                  │
//! │    "id": "uuid-v4",                // Unique message ID                 │
//! │    "sender_id": "peer-alice",      // Sender's peer ID                  │
//! │    "recipient_id": "peer-bob",     // Recipient, or "*" for broadcast   │
//! │    "payload": "base64...",         // Ciphertext (or plaintext if the   │
//! │                                    // message is unencrypted)           │
//! │    "timestamp": 1234567890123,     // Unix timestamp (ms)               │
//! │    "encrypted": true,                                                   │
//! │    "signed": true,                                                      │
//! │    "signature": "hex...",          // Signature over the PLAINTEXT      │
//! │    "key_id": "uuid-v4",            // Session that sealed the payload   │
//! │    "encapsulation": "base64...",   // KEM ciphertext, first envelope    │
//! │                                    // of a fresh session only           │
//! │    "algorithm": "KEM-768+SIG-L3",                                       │
//! │    "dtn": false,                                                        │
//! │    "forward_secrecy": true,                                             │
//! │    "priority": "medium",                                                │
//! │    "hop_count": 0,                 // Incremented per DTN relay         │
//! │    "expires_at": 1234567890123     // DTN deadline (ms), absent         │
//! │                                    // outside DTN                       │
//! │  }                                                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The signature is computed over the plaintext before encryption and
//! verified after decryption, so tampering with the ciphertext fails the
//! AEAD tag and tampering with a plaintext relay fails the signature.
//!
//! Two control payloads ride inside ordinary envelopes:
//! - `aphelion/ping/1` keeps liveness timers fresh and is never acked;
//! - `aphelion/ack/1:<message-id>` confirms delivery of `<message-id>`
//!   and is consumed by the core instead of being handed to listeners.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Current envelope protocol version.
pub const ENVELOPE_PROTOCOL_VERSION: u8 = 1;

/// Recipient ID that addresses every reachable peer.
pub const BROADCAST_RECIPIENT: &str = "*";

/// Algorithm tag for envelopes that were never encrypted or signed.
pub const ALGORITHM_NONE: &str = "none";

/// Payload of a liveness probe.
pub(crate) const PING_PAYLOAD: &str = "aphelion/ping/1";

/// Payload prefix of a delivery confirmation; the suffix is the message ID.
pub(crate) const ACK_PREFIX: &str = "aphelion/ack/1:";

/// Relative urgency of a message, used to order the DTN queue.
///
/// Ordering is derived, so `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background traffic; drained last.
    Low,
    /// The default.
    #[default]
    Medium,
    /// Ahead of ordinary traffic; acks ride at this level.
    High,
    /// Drained before everything else.
    Critical,
}

impl MessagePriority {
    /// Lowercase label, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for MessagePriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery lifecycle of an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted by the core, not yet handed to the transport.
    Pending,
    /// The transport accepted the payload.
    Sent,
    /// The recipient confirmed receipt with an ack.
    Delivered,
    /// Gave up; the reason says why.
    Failed {
        /// What went wrong, for logs and callers.
        reason: String,
    },
    /// A DTN message outlived its TTL before anyone could take it.
    Expired,
}

impl DeliveryStatus {
    /// Lowercase label, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed { .. } => "failed",
            Self::Expired => "expired",
        }
    }

    /// Terminal statuses never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed { .. } | Self::Expired)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encrypted message envelope for wire transmission.
///
/// This is what gets sent over the network. It carries the ciphertext plus
/// everything a recipient needs to locate (or establish) the session that
/// sealed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureMessage {
    /// Protocol version
    pub version: u8,
    /// Unique message ID
    pub id: String,
    /// Sender's peer ID
    pub sender_id: String,
    /// Recipient's peer ID, or [`BROADCAST_RECIPIENT`]
    pub recipient_id: String,
    /// Base64 ciphertext when `encrypted`, plaintext otherwise
    pub payload: String,
    /// Unix timestamp (milliseconds)
    pub timestamp: i64,
    /// Whether `payload` is sealed
    pub encrypted: bool,
    /// Whether `signature` was verified (sender: whether it was produced)
    pub signed: bool,
    /// Signature over the plaintext (hex encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// ID of the key exchange whose session key sealed the payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// KEM ciphertext (base64), present only on the first envelope of a
    /// fresh session so the recipient can decapsulate the session key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encapsulation: Option<String>,
    /// Algorithm tag of the security level, or [`ALGORITHM_NONE`]
    pub algorithm: String,
    /// Whether this envelope may be stored and forwarded
    #[serde(default)]
    pub dtn: bool,
    /// Whether the session behind `key_id` is rotated on schedule
    #[serde(default)]
    pub forward_secrecy: bool,
    /// Relative urgency, used by DTN relays to order their queues
    #[serde(default)]
    pub priority: MessagePriority,
    /// Number of DTN relays this envelope has passed through
    #[serde(default)]
    pub hop_count: u32,
    /// Absolute DTN deadline (ms); relays drop the envelope past this
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl SecureMessage {
    /// Build an unencrypted delivery confirmation for `message_id`.
    pub(crate) fn ack(
        sender_id: &str,
        recipient_id: &str,
        message_id: &str,
        timestamp: i64,
    ) -> Self {
        Self {
            version: ENVELOPE_PROTOCOL_VERSION,
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            recipient_id: recipient_id.to_string(),
            payload: format!("{}{}", ACK_PREFIX, message_id),
            timestamp,
            encrypted: false,
            signed: false,
            signature: None,
            key_id: None,
            encapsulation: None,
            algorithm: ALGORITHM_NONE.to_string(),
            dtn: false,
            forward_secrecy: false,
            priority: MessagePriority::High,
            hop_count: 0,
            expires_at: None,
        }
    }

    /// Whether this envelope addresses every reachable peer.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST_RECIPIENT
    }

    /// The message ID this envelope confirms, if it is an ack.
    ///
    /// Acks are always sent unencrypted; a sealed payload that happens to
    /// decrypt to the ack shape is ordinary data.
    pub fn ack_target(&self) -> Option<&str> {
        if self.encrypted {
            return None;
        }
        self.payload.strip_prefix(ACK_PREFIX)
    }

    /// Whether the DTN deadline has passed.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expires_at.map_or(false, |deadline| now_millis > deadline)
    }

    /// Serialize for the transport.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::SerializationError(e.to_string()))
    }

    /// Parse an envelope off the transport.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::DeserializationError(e.to_string()))
    }

    /// Serialize to JSON (for logs and demos).
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::SerializationError(e.to_string()))
    }
}

/// Build additional authenticated data for the AEAD seal.
///
/// Binds the ciphertext to the envelope identity so a payload cannot be
/// replayed under a different message, sender, recipient, or session.
pub(crate) fn build_aad(id: &str, sender_id: &str, recipient_id: &str, key_id: &str) -> Vec<u8> {
    let mut aad = Vec::new();
    aad.extend_from_slice(id.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(sender_id.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(recipient_id.as_bytes());
    aad.push(b'|');
    aad.extend_from_slice(key_id.as_bytes());
    aad
}

/// Local record of an outbound message.
///
/// Created when the core accepts a send, updated as transport and ack
/// events arrive, and queryable until the caller drops interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentMessage {
    /// Envelope ID this record tracks
    pub id: String,
    /// Recipient's peer ID, or [`BROADCAST_RECIPIENT`]
    pub recipient_id: String,
    /// Plaintext size in bytes
    pub payload_size: usize,
    /// Current lifecycle status
    pub status: DeliveryStatus,
    /// Urgency the message was sent with
    pub priority: MessagePriority,
    /// Whether the message was handed to the DTN queue
    pub dtn: bool,
    /// When the core accepted the send (ms)
    pub created_at: i64,
    /// When `status` last changed (ms)
    pub updated_at: i64,
    /// When an unconfirmed message is declared failed (ms)
    pub deadline_at: i64,
}

impl SentMessage {
    /// A fresh record in [`DeliveryStatus::Pending`].
    pub fn new(
        id: String,
        recipient_id: String,
        payload_size: usize,
        priority: MessagePriority,
        dtn: bool,
        created_at: i64,
        delivery_timeout_millis: i64,
    ) -> Self {
        Self {
            id,
            recipient_id,
            payload_size,
            status: DeliveryStatus::Pending,
            priority,
            dtn,
            created_at,
            updated_at: created_at,
            deadline_at: created_at + delivery_timeout_millis,
        }
    }

    /// Move to `status`, unless the current status is already terminal.
    ///
    /// Returns whether the transition was applied. A late ack arriving
    /// after a timeout failure is dropped here, not upgraded.
    pub fn transition(&mut self, status: DeliveryStatus, now_millis: i64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.updated_at = now_millis;
        true
    }

    /// Whether the delivery deadline has passed without confirmation.
    pub fn is_overdue(&self, now_millis: i64) -> bool {
        !self.status.is_terminal() && now_millis > self.deadline_at
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_envelope() -> SecureMessage {
        SecureMessage {
            version: ENVELOPE_PROTOCOL_VERSION,
            id: "msg-1".to_string(),
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            payload: "c2VhbGVk".to_string(),
            timestamp: 1_700_000_000_000,
            encrypted: true,
            signed: true,
            signature: Some("ab".repeat(64)),
            key_id: Some("kx-1".to_string()),
            encapsulation: None,
            algorithm: "KEM-768+SIG-L3".to_string(),
            dtn: false,
            forward_secrecy: true,
            priority: MessagePriority::Medium,
            hop_count: 0,
            expires_at: None,
        }
    }

    #[test]
    fn test_priority_ordering() {
        assert!(MessagePriority::Critical > MessagePriority::High);
        assert!(MessagePriority::High > MessagePriority::Medium);
        assert!(MessagePriority::Medium > MessagePriority::Low);
        assert_eq!(MessagePriority::default(), MessagePriority::Medium);
    }

    #[test]
    fn test_delivery_status_terminality() {
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Sent.is_terminal());
        assert!(DeliveryStatus::Delivered.is_terminal());
        assert!(DeliveryStatus::Expired.is_terminal());
        assert!(DeliveryStatus::Failed {
            reason: "timeout".into()
        }
        .is_terminal());
    }

    #[test]
    fn test_ack_recognition() {
        let ack = SecureMessage::ack("bob", "alice", "msg-42", 1000);
        assert_eq!(ack.ack_target(), Some("msg-42"));
        assert!(!ack.encrypted);
        assert!(!ack.signed);
        assert_eq!(ack.algorithm, ALGORITHM_NONE);

        // A sealed payload never reads as an ack, whatever it contains.
        let mut sealed = test_envelope();
        sealed.payload = format!("{}msg-42", ACK_PREFIX);
        assert!(sealed.ack_target().is_none());
    }

    #[test]
    fn test_broadcast_sentinel() {
        let mut envelope = test_envelope();
        assert!(!envelope.is_broadcast());
        envelope.recipient_id = BROADCAST_RECIPIENT.to_string();
        assert!(envelope.is_broadcast());
    }

    #[test]
    fn test_expiry() {
        let mut envelope = test_envelope();
        assert!(!envelope.is_expired(i64::MAX));

        envelope.expires_at = Some(5_000);
        assert!(!envelope.is_expired(5_000));
        assert!(envelope.is_expired(5_001));
    }

    #[test]
    fn test_wire_roundtrip() {
        let envelope = test_envelope();
        let bytes = envelope.to_bytes().unwrap();
        let restored = SecureMessage::from_bytes(&bytes).unwrap();

        assert_eq!(restored.id, envelope.id);
        assert_eq!(restored.payload, envelope.payload);
        assert_eq!(restored.signature, envelope.signature);
        assert_eq!(restored.priority, MessagePriority::Medium);
    }

    #[test]
    fn test_optional_fields_default_when_absent() {
        // A minimal envelope from an older sender still parses.
        let json = r#"{
            "version": 1,
            "id": "msg-9",
            "sender_id": "alice",
            "recipient_id": "bob",
            "payload": "hello",
            "timestamp": 1700000000000,
            "encrypted": false,
            "signed": false,
            "algorithm": "none"
        }"#;

        let envelope = SecureMessage::from_bytes(json.as_bytes()).unwrap();
        assert!(envelope.signature.is_none());
        assert!(envelope.key_id.is_none());
        assert!(!envelope.dtn);
        assert_eq!(envelope.priority, MessagePriority::Medium);
        assert_eq!(envelope.hop_count, 0);
    }

    #[test]
    fn test_aad_binds_envelope_identity() {
        let a = build_aad("msg-1", "alice", "bob", "kx-1");
        let b = build_aad("msg-1", "alice", "bob", "kx-2");
        let c = build_aad("msg-2", "alice", "bob", "kx-1");

        assert_ne!(a, b);
        assert_ne!(a, c);
        assert!(a.iter().filter(|&&byte| byte == b'|').count() >= 3);
    }

    #[test]
    fn test_sent_message_transitions() {
        let mut record = SentMessage::new(
            "msg-1".to_string(),
            "bob".to_string(),
            5,
            MessagePriority::Medium,
            false,
            1_000,
            30_000,
        );

        assert_eq!(record.status, DeliveryStatus::Pending);
        assert!(record.transition(DeliveryStatus::Sent, 1_100));
        assert_eq!(record.updated_at, 1_100);
        assert!(record.transition(DeliveryStatus::Delivered, 1_200));

        // Terminal: a later failure must not overwrite the confirmation.
        assert!(!record.transition(
            DeliveryStatus::Failed {
                reason: "late".into()
            },
            1_300,
        ));
        assert_eq!(record.status, DeliveryStatus::Delivered);
    }

    #[test]
    fn test_sent_message_overdue() {
        let mut record = SentMessage::new(
            "msg-1".to_string(),
            "bob".to_string(),
            5,
            MessagePriority::Medium,
            false,
            1_000,
            30_000,
        );

        assert!(!record.is_overdue(31_000));
        assert!(record.is_overdue(31_001));

        record.transition(DeliveryStatus::Delivered, 2_000);
        assert!(!record.is_overdue(100_000));
    }
}
