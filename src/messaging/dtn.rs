//! # Delay-Tolerant Delivery
//!
//! Store-and-forward queue for messages whose recipient may be offline
//! right now. Submitted messages wait out a simulated propagation delay,
//! then a drain task forwards whatever is due through the transport,
//! retrying with a backoff until the message's TTL runs out.
//!
//! ## Queue Discipline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DTN QUEUE ORDER                                    │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Critical ████████  drained first                                       │
//! │  High     ██████                                                        │
//! │  Medium   ████      FIFO within each priority class                     │
//! │  Low      ██        drained last                                        │
//! │                                                                         │
//! │  A message is eligible once its propagation delay has elapsed and       │
//! │  is dropped (status: Expired) once its TTL has.                         │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## WARNING: payloads travel in clear
//!
//! Session keys rotate on the order of an hour; a store-and-forward
//! delivery can outlive every session that could have sealed it. DTN
//! envelopes therefore carry the payload **unencrypted** (still signed,
//! when requested). Do not put confidential content on this path unless a
//! higher layer encrypted it first.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use super::envelope::{MessagePriority, SecureMessage, ENVELOPE_PROTOCOL_VERSION};
use crate::error::{Error, Result};

/// Tuning knobs for the delay-tolerant path.
#[derive(Debug, Clone)]
pub struct DtnConfig {
    /// Maximum queued messages; submissions beyond this are rejected
    pub capacity: usize,
    /// Simulated propagation delay range in milliseconds (min, max)
    pub propagation_delay_ms: (u64, u64),
    /// Base delay before retrying a failed forward
    pub retry_delay: Duration,
    /// How often the drain task wakes up
    pub drain_interval: Duration,
}

impl Default for DtnConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            propagation_delay_ms: (50, 250),
            retry_delay: Duration::from_secs(5),
            drain_interval: Duration::from_millis(500),
        }
    }
}

/// A message parked in the DTN queue.
///
/// Internal bookkeeping form; it becomes a [`SecureMessage`] envelope when
/// a forward is attempted.
#[derive(Debug, Clone)]
pub struct DtnMessage {
    /// Envelope and `SentMessage` ID
    pub id: String,
    /// Originating peer
    pub sender_id: String,
    /// Destination peer
    pub recipient_id: String,
    /// Plaintext payload (see the module warning)
    pub payload: String,
    /// Signature over the plaintext (hex), if the sender asked for one
    pub signature: Option<String>,
    /// Algorithm tag of the signing tier, or `"none"`
    pub algorithm: String,
    /// Queue class; higher drains first
    pub priority: MessagePriority,
    /// Lifetime from `created_at`, in seconds
    pub ttl_secs: u64,
    /// Relays passed so far; the forward that puts it on the wire bumps it
    pub hop_count: u32,
    /// Forward attempts so far
    pub attempts: u32,
    /// When the message entered the queue (Unix milliseconds)
    pub created_at: i64,
}

impl DtnMessage {
    /// Absolute TTL deadline (ms).
    pub fn expires_at_millis(&self) -> i64 {
        self.created_at + self.ttl_secs as i64 * 1000
    }

    /// Whether the TTL deadline has passed.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        now_millis > self.expires_at_millis()
    }

    /// Build the wire envelope for a forward attempt.
    pub fn to_envelope(&self, timestamp_millis: i64) -> SecureMessage {
        SecureMessage {
            version: ENVELOPE_PROTOCOL_VERSION,
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            payload: self.payload.clone(),
            timestamp: timestamp_millis,
            encrypted: false,
            signed: self.signature.is_some(),
            signature: self.signature.clone(),
            key_id: None,
            encapsulation: None,
            algorithm: self.algorithm.clone(),
            dtn: true,
            forward_secrecy: false,
            priority: self.priority,
            hop_count: self.hop_count + 1,
            expires_at: Some(self.expires_at_millis()),
        }
    }
}

struct DtnEntry {
    message: DtnMessage,
    /// Not eligible for forwarding before this time (ms)
    due_at: i64,
    /// Submission order, for FIFO within a priority class
    seq: u64,
}

impl Ord for DtnEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DtnEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DtnEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for DtnEntry {}

/// What a drain pass found: messages ready to forward and messages whose
/// TTL ran out while queued.
#[derive(Debug, Default)]
pub struct DrainBatch {
    /// Due messages, in queue order
    pub ready: Vec<DtnMessage>,
    /// Messages dropped for outliving their TTL
    pub expired: Vec<DtnMessage>,
}

/// Priority queue behind the delay-tolerant path.
pub struct DtnQueue {
    config: DtnConfig,
    entries: Mutex<BinaryHeap<DtnEntry>>,
    seq: AtomicU64,
}

impl DtnQueue {
    /// An empty queue.
    pub fn new(config: DtnConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    /// Park a message until its propagation delay elapses.
    pub fn submit(&self, message: DtnMessage, now_millis: i64) -> Result<()> {
        let mut entries = self.entries.lock();
        if entries.len() >= self.config.capacity {
            tracing::warn!(
                capacity = self.config.capacity,
                id = %message.id,
                "DTN queue full, rejecting message"
            );
            return Err(Error::DeliveryFailed("DTN queue is full".into()));
        }

        let due_at = now_millis + self.propagation_jitter();
        tracing::debug!(
            id = %message.id,
            recipient_id = %message.recipient_id,
            priority = %message.priority,
            due_in_ms = due_at - now_millis,
            "Queued DTN message"
        );
        entries.push(DtnEntry {
            message,
            due_at,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
        Ok(())
    }

    /// Put a message back after a failed forward, delayed by the retry
    /// backoff. Its FIFO position within the priority class moves to the
    /// back.
    pub fn requeue(&self, mut message: DtnMessage, now_millis: i64) {
        message.attempts += 1;
        let due_at =
            now_millis + self.config.retry_delay.as_millis() as i64 + self.propagation_jitter();
        tracing::debug!(
            id = %message.id,
            attempts = message.attempts,
            due_in_ms = due_at - now_millis,
            "Requeued DTN message after failed forward"
        );
        self.entries.lock().push(DtnEntry {
            message,
            due_at,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        });
    }

    /// Pull out everything that is due or expired.
    ///
    /// `ready` comes back highest priority first, FIFO within a class.
    /// Entries that are neither stay queued.
    pub fn collect_due(&self, now_millis: i64) -> DrainBatch {
        let mut entries = self.entries.lock();
        let mut keep = Vec::new();
        let mut batch = DrainBatch::default();

        while let Some(entry) = entries.pop() {
            if entry.message.is_expired(now_millis) {
                batch.expired.push(entry.message);
            } else if entry.due_at <= now_millis {
                batch.ready.push(entry.message);
            } else {
                keep.push(entry);
            }
        }
        entries.extend(keep);

        batch
    }

    /// Number of parked messages.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// The configuration in effect.
    pub fn config(&self) -> &DtnConfig {
        &self.config
    }

    fn propagation_jitter(&self) -> i64 {
        let (min, max) = self.config.propagation_delay_ms;
        rand::thread_rng().gen_range(min..=max) as i64
    }
}

impl std::fmt::Debug for DtnQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DtnQueue")
            .field("len", &self.len())
            .field("capacity", &self.config.capacity)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn instant_config() -> DtnConfig {
        DtnConfig {
            capacity: 16,
            propagation_delay_ms: (0, 0),
            retry_delay: Duration::from_secs(5),
            drain_interval: Duration::from_millis(500),
        }
    }

    fn message(id: &str, priority: MessagePriority, now: i64) -> DtnMessage {
        DtnMessage {
            id: id.to_string(),
            sender_id: "alice".to_string(),
            recipient_id: "bob".to_string(),
            payload: "deferred hello".to_string(),
            signature: None,
            algorithm: "none".to_string(),
            priority,
            ttl_secs: 86_400,
            hop_count: 0,
            attempts: 0,
            created_at: now,
        }
    }

    #[test]
    fn test_drain_orders_by_priority() {
        let queue = DtnQueue::new(instant_config());
        queue.submit(message("low", MessagePriority::Low, 1_000), 1_000).unwrap();
        queue
            .submit(message("critical", MessagePriority::Critical, 1_000), 1_000)
            .unwrap();
        queue
            .submit(message("medium", MessagePriority::Medium, 1_000), 1_000)
            .unwrap();

        let batch = queue.collect_due(1_000);
        let ids: Vec<_> = batch.ready.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["critical", "medium", "low"]);
        assert!(batch.expired.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_fifo_within_a_priority_class() {
        let queue = DtnQueue::new(instant_config());
        queue.submit(message("first", MessagePriority::Medium, 1_000), 1_000).unwrap();
        queue.submit(message("second", MessagePriority::Medium, 1_000), 1_000).unwrap();
        queue.submit(message("third", MessagePriority::Medium, 1_000), 1_000).unwrap();

        let batch = queue.collect_due(1_000);
        let ids: Vec<_> = batch.ready.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_propagation_delay_gates_eligibility() {
        let config = DtnConfig {
            propagation_delay_ms: (1_000, 1_000),
            ..instant_config()
        };
        let queue = DtnQueue::new(config);
        queue.submit(message("m", MessagePriority::Medium, 1_000), 1_000).unwrap();

        // Not due yet.
        let batch = queue.collect_due(1_999);
        assert!(batch.ready.is_empty());
        assert_eq!(queue.len(), 1);

        let batch = queue.collect_due(2_000);
        assert_eq!(batch.ready.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ttl_exhaustion_expires() {
        let queue = DtnQueue::new(instant_config());
        let mut short_lived = message("m", MessagePriority::Medium, 1_000);
        short_lived.ttl_secs = 1;
        queue.submit(short_lived, 1_000).unwrap();

        let batch = queue.collect_due(2_001);
        assert!(batch.ready.is_empty());
        assert_eq!(batch.expired.len(), 1);
        assert_eq!(batch.expired[0].id, "m");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_rejection() {
        let config = DtnConfig { capacity: 2, ..instant_config() };
        let queue = DtnQueue::new(config);

        queue.submit(message("a", MessagePriority::Medium, 1_000), 1_000).unwrap();
        queue.submit(message("b", MessagePriority::Medium, 1_000), 1_000).unwrap();
        let result = queue.submit(message("c", MessagePriority::Medium, 1_000), 1_000);
        assert!(matches!(result, Err(Error::DeliveryFailed(_))));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_requeue_applies_backoff_and_counts_attempts() {
        let queue = DtnQueue::new(instant_config());
        queue.submit(message("m", MessagePriority::Medium, 1_000), 1_000).unwrap();

        let mut batch = queue.collect_due(1_000);
        let failed = batch.ready.pop().unwrap();
        assert_eq!(failed.attempts, 0);

        queue.requeue(failed, 1_000);

        // Backoff: not due again until retry_delay has passed.
        assert!(queue.collect_due(5_999).ready.is_empty());
        let batch = queue.collect_due(6_000);
        assert_eq!(batch.ready.len(), 1);
        assert_eq!(batch.ready[0].attempts, 1);
    }

    #[test]
    fn test_forward_envelope_shape() {
        let dtn = message("m", MessagePriority::High, 1_000);
        let envelope = dtn.to_envelope(2_000);

        assert_eq!(envelope.id, "m");
        assert!(envelope.dtn);
        assert!(!envelope.encrypted);
        assert!(!envelope.signed);
        assert_eq!(envelope.hop_count, 1);
        assert_eq!(envelope.expires_at, Some(1_000 + 86_400_000));
        assert_eq!(envelope.timestamp, 2_000);

        let mut signed = message("s", MessagePriority::High, 1_000);
        signed.signature = Some("ab".repeat(64));
        let envelope = signed.to_envelope(2_000);
        assert!(envelope.signed);
        assert!(envelope.signature.is_some());
    }
}
