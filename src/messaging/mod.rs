//! # Messaging Module
//!
//! End-to-end protected messaging between peers: tiered session
//! establishment, signed and encrypted envelopes, delivery tracking, and a
//! delay-tolerant fallback for peers that are currently out of reach.
//!
//! ## Outbound Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE PROTECTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Sender (Alice)                                                         │
//! │  ─────────────────────────────────────────────────────────────          │
//! │                                                                         │
//! │  Input: "Hello Bob!"                                                    │
//! │                                                                         │
//! │  1. Get (or establish) the session                                      │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  KEM_encapsulate(bob_kem_public) → ciphertext, secret       │        │
//! │  │  session_key = HKDF(secret, tier domain)                    │        │
//! │  │  (reused until rotation; one active session per peer)       │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  2. Sign the plaintext                                                  │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  Ed25519_sign(alice_signing_key, "Hello Bob!")              │        │
//! │  │  → 64-byte signature, hex in the envelope                   │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  3. Seal                                                                │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  AES-256-GCM(                                               │        │
//! │  │    key = session_key,                                       │        │
//! │  │    aad = id | sender | recipient | key_id                   │        │
//! │  │  ) → nonce || ciphertext, base64 in the envelope            │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  Output: SecureMessage (first use carries the KEM encapsulation)        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Inbound Pipeline
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      MESSAGE ACCEPTANCE                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Recipient (Bob)                                                        │
//! │                                                                         │
//! │  1. Parse the envelope; delivery confirmations are consumed here        │
//! │                                                                         │
//! │  2. Resolve the session                                                 │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  known key_id            → cached session key               │        │
//! │  │  unknown + encapsulation → KEM_decapsulate, adopt session   │        │
//! │  │  unknown otherwise       → drop (stale or forged)           │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  3. Open AES-256-GCM with the envelope AAD → plaintext                  │
//! │                                                                         │
//! │  4. Verify the plaintext signature                                      │
//! │  ┌─────────────────────────────────────────────────────────────┐        │
//! │  │  valid   → deliver signed = true                            │        │
//! │  │  invalid → deliver signed = false (content survives,        │        │
//! │  │            the authenticity claim does not)                 │        │
//! │  └─────────────────────────────────────────────────────────────┘        │
//! │                                                                         │
//! │  5. Confirm delivery to the sender, then emit to listeners              │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery Lifecycle
//!
//! ```text
//! Pending ──► Sent ──► Delivered      (confirmation received)
//!    │          │
//!    │          └────► Failed         (no confirmation within the window)
//!    └───────────────► Failed         (transport refused or timed out)
//!
//! Store-and-forward messages instead expire: Pending ──► Sent / Expired
//! ```
//!
//! Broadcasts go out unencrypted (optionally signed) because no shared
//! session exists with `"*"`; they are never confirmed and settle at `Sent`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::crypto::{CryptoProvider, SecurityLevel, Signature};
use crate::error::{Error, Result};
use crate::events::{ListenerId, Listeners};
use crate::peers::{PeerDirectory, PeerInfo};
use crate::time::Clock;
use crate::transport::{ConnectionState, Transport, TransportEvent};

pub mod dtn;
pub mod envelope;
pub mod keyx;

pub use dtn::{DrainBatch, DtnConfig, DtnMessage, DtnQueue};
pub use envelope::{
    DeliveryStatus, MessagePriority, SecureMessage, SentMessage, BROADCAST_RECIPIENT,
    ENVELOPE_PROTOCOL_VERSION,
};
pub use keyx::{IdentityKeys, KeyExchange, KeyExchangeManager};

use self::envelope::{build_aad, ALGORITHM_NONE, PING_PAYLOAD};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Tuning knobs for the messaging core.
#[derive(Debug, Clone)]
pub struct MessagingConfig {
    /// Security tier used when the caller does not pick one
    pub default_level: SecurityLevel,
    /// How long a session key stays fresh before a send establishes a new one
    pub rotation_interval: Duration,
    /// How long a sent message may wait for its delivery confirmation
    pub delivery_timeout: Duration,
    /// Maximum plaintext size in bytes
    pub max_message_size: usize,
    /// Store-and-forward queue settings
    pub dtn: DtnConfig,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_level: SecurityLevel::High,
            rotation_interval: Duration::from_secs(60 * 60),
            delivery_timeout: Duration::from_secs(30),
            max_message_size: 64 * 1024,
            dtn: DtnConfig::default(),
        }
    }
}

/// Per-message options for [`SecureMessaging::send_message`].
///
/// The defaults match everyday traffic: High tier, signed, direct delivery,
/// medium priority, one-day TTL, session rotation on.
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Security tier for this message
    pub level: SecurityLevel,
    /// Sign the plaintext before encryption
    pub sign: bool,
    /// Queue for store-and-forward delivery instead of sending directly
    pub dtn: bool,
    /// Priority class (orders the store-and-forward queue)
    pub priority: MessagePriority,
    /// Time-to-live for store-and-forward messages
    pub ttl: Duration,
    /// Rotate session keys on schedule; turning this off reuses an aged
    /// session for as long as the peer keeps it
    pub forward_secrecy: bool,
    /// Override the configured delivery confirmation window
    pub delivery_timeout: Option<Duration>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            level: SecurityLevel::High,
            sign: true,
            dtn: false,
            priority: MessagePriority::Medium,
            ttl: Duration::from_secs(86_400),
            forward_secrecy: true,
            delivery_timeout: None,
        }
    }
}

// ============================================================================
// DELIVERED PAYLOADS AND COUNTERS
// ============================================================================

/// A message as handed to [`SecureMessaging::on_message`] listeners.
///
/// `signed` reflects the verification verdict, not the sender's claim: a
/// message whose signature failed to verify arrives with `signed = false`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Envelope ID
    pub id: String,
    /// Originating peer
    pub sender_id: String,
    /// Addressed peer (`"*"` for broadcasts)
    pub recipient_id: String,
    /// Decrypted plaintext
    pub payload: String,
    /// Sender timestamp (Unix milliseconds)
    pub timestamp: i64,
    /// Whether the envelope was encrypted on the wire
    pub encrypted: bool,
    /// Whether the signature verified
    pub signed: bool,
    /// Whether this arrived through the store-and-forward path
    pub dtn: bool,
    /// Relay hops taken
    pub hop_count: u32,
    /// Priority class from the envelope
    pub priority: MessagePriority,
    /// Algorithm tag from the envelope
    pub algorithm: String,
}

/// Lifetime traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageCounters {
    /// Envelopes successfully handed to the transport
    pub sent: u64,
    /// Envelopes accepted and delivered to listeners
    pub received: u64,
}

fn received_from(envelope: &SecureMessage, payload: String, signed: bool) -> ReceivedMessage {
    ReceivedMessage {
        id: envelope.id.clone(),
        sender_id: envelope.sender_id.clone(),
        recipient_id: envelope.recipient_id.clone(),
        payload,
        timestamp: envelope.timestamp,
        encrypted: envelope.encrypted,
        signed,
        dtn: envelope.dtn,
        hop_count: envelope.hop_count,
        priority: envelope.priority,
        algorithm: envelope.algorithm.clone(),
    }
}

// ============================================================================
// SECURE MESSAGING CORE
// ============================================================================

/// The messaging service.
///
/// Owns the local identity material, the per-peer session cache, the
/// store-and-forward queue, and the delivery ledger. All crypto goes through
/// the injected [`CryptoProvider`]; all I/O goes through the injected
/// [`Transport`]. [`initialize`](Self::initialize) must run before anything
/// else; it takes the transport's event stream and spawns the inbound pump
/// and the maintenance task.
pub struct SecureMessaging {
    config: MessagingConfig,
    provider: Arc<dyn CryptoProvider>,
    transport: Arc<dyn Transport>,
    directory: Arc<PeerDirectory>,
    identity: Arc<IdentityKeys>,
    keyx: KeyExchangeManager,
    dtn: DtnQueue,
    clock: Clock,
    local_peer_id: String,
    /// Event-driven mirror of the transport state
    state: RwLock<ConnectionState>,
    /// Delivery ledger, keyed by message ID
    sent: RwLock<HashMap<String, SentMessage>>,
    message_listeners: Listeners<ReceivedMessage>,
    state_listeners: Listeners<ConnectionState>,
    sent_count: AtomicU64,
    received_count: AtomicU64,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SecureMessaging {
    /// Wire up a messaging core from its collaborators. Nothing runs until
    /// [`initialize`](Self::initialize).
    pub fn new(
        config: MessagingConfig,
        provider: Arc<dyn CryptoProvider>,
        transport: Arc<dyn Transport>,
        directory: Arc<PeerDirectory>,
        clock: Clock,
    ) -> Arc<Self> {
        let identity = Arc::new(IdentityKeys::new());
        let keyx = KeyExchangeManager::new(
            Arc::clone(&provider),
            Arc::clone(&directory),
            Arc::clone(&identity),
            clock.clone(),
            config.rotation_interval,
        );
        let dtn = DtnQueue::new(config.dtn.clone());
        let local_peer_id = transport.local_peer_id();

        Arc::new(Self {
            config,
            provider,
            transport,
            directory,
            identity,
            keyx,
            dtn,
            clock,
            local_peer_id,
            state: RwLock::new(ConnectionState::Disconnected),
            sent: RwLock::new(HashMap::new()),
            message_listeners: Listeners::new(),
            state_listeners: Listeners::new(),
            sent_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            init_lock: tokio::sync::Mutex::new(()),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Generate the default-tier key material and start the background
    /// tasks. Safe to call more than once; repeat calls are no-ops.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        let _guard = self.init_lock.lock().await;
        if self.initialized.load(Ordering::SeqCst) {
            tracing::debug!(peer_id = %self.local_peer_id, "Messaging core already initialized");
            return Ok(());
        }

        self.identity
            .ensure_level(self.provider.as_ref(), self.config.default_level)
            .await
            .map_err(|e| Error::InitializationFailed(format!("key generation failed: {}", e)))?;

        let events = self.transport.events().ok_or_else(|| {
            Error::InitializationFailed("transport event stream already taken".into())
        })?;

        let (tx, rx) = watch::channel(false);
        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(run_inbound_pump(
                Arc::clone(self),
                events,
                rx.clone(),
            )));
            tasks.push(tokio::spawn(run_maintenance(Arc::clone(self), rx)));
        }
        *self.shutdown.lock() = Some(tx);

        self.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            peer_id = %self.local_peer_id,
            level = %self.config.default_level,
            "Secure messaging core initialized"
        );
        Ok(())
    }

    /// Stop the background tasks and wait for them to finish.
    ///
    /// Terminal for this instance: the transport event stream was consumed
    /// at initialization and cannot be taken again.
    pub async fn shutdown(&self) {
        let sender = self.shutdown.lock().take();
        if let Some(sender) = sender {
            let _ = sender.send(true);
        }
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        if self.initialized.swap(false, Ordering::SeqCst) {
            tracing::info!(peer_id = %self.local_peer_id, "Secure messaging core shut down");
        }
    }

    /// Bring the transport online.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.transport.connect().await
    }

    /// Take the transport offline. Background tasks keep running.
    pub async fn disconnect(&self) -> Result<()> {
        self.ensure_initialized()?;
        self.transport.disconnect().await
    }

    /// Cycle the transport connection.
    pub async fn reconnect(&self) -> Result<()> {
        self.disconnect().await?;
        self.connect().await
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Protect and send a message to one peer. Returns the message ID.
    ///
    /// Direct sends establish (or reuse) a session with the peer, sign the
    /// plaintext, seal it, and wait up to the delivery window for the
    /// transport hand-off. With `options.dtn` the message is queued for
    /// store-and-forward delivery instead and returns immediately.
    pub async fn send_message(
        &self,
        recipient_id: &str,
        content: &str,
        options: SendOptions,
    ) -> Result<String> {
        self.ensure_initialized()?;
        if recipient_id.is_empty() {
            return Err(Error::InvalidMessage("recipient must not be empty".into()));
        }
        if content.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge {
                size: content.len(),
                max: self.config.max_message_size,
            });
        }
        if !self.transport.state().is_connected() {
            return Err(Error::NotConnected);
        }

        self.identity
            .ensure_level(self.provider.as_ref(), options.level)
            .await?;

        if options.dtn {
            return self.send_dtn(recipient_id, content, &options).await;
        }

        let now = self.clock.now_millis();
        let id = Uuid::new_v4().to_string();
        let exchange = self
            .keyx
            .get_or_establish(recipient_id, options.level, options.forward_secrecy)
            .await?;

        let signature = if options.sign {
            Some(self.sign_plaintext(content).await?)
        } else {
            None
        };

        let aad = build_aad(&id, &self.local_peer_id, recipient_id, &exchange.id);
        let sealed = self
            .provider
            .seal(content.as_bytes(), exchange.session_key(), &aad)?;

        // The KEM encapsulation rides along until the first send succeeds;
        // after that the peer resolves the session from key_id alone.
        let announce = !exchange.is_announced();
        let envelope = SecureMessage {
            version: ENVELOPE_PROTOCOL_VERSION,
            id: id.clone(),
            sender_id: self.local_peer_id.clone(),
            recipient_id: recipient_id.to_string(),
            payload: BASE64.encode(&sealed),
            timestamp: now,
            encrypted: true,
            signed: options.sign,
            signature,
            key_id: Some(exchange.id.clone()),
            encapsulation: announce.then(|| BASE64.encode(exchange.encapsulation())),
            algorithm: exchange.algorithm.clone(),
            dtn: false,
            forward_secrecy: options.forward_secrecy,
            priority: options.priority,
            hop_count: 0,
            expires_at: None,
        };
        let bytes = envelope.to_bytes()?;

        // Liveness probes are fire-and-forget: no ledger entry, no
        // confirmation expected.
        let is_ping = content == PING_PAYLOAD;
        let window = options.delivery_timeout.unwrap_or(self.config.delivery_timeout);
        if !is_ping {
            self.sent.write().insert(
                id.clone(),
                SentMessage::new(
                    id.clone(),
                    recipient_id.to_string(),
                    content.len(),
                    options.priority,
                    false,
                    now,
                    window.as_millis() as i64,
                ),
            );
        }

        match tokio::time::timeout(window, self.transport.send(recipient_id, bytes)).await {
            Ok(Ok(())) => {
                exchange.mark_announced();
                self.sent_count.fetch_add(1, Ordering::Relaxed);
                if !is_ping {
                    self.mark_sent(&id);
                }
                tracing::debug!(
                    id = %id,
                    recipient_id,
                    algorithm = %exchange.algorithm,
                    "Message handed to transport"
                );
                Ok(id)
            }
            Ok(Err(e)) => {
                if !is_ping {
                    self.mark_failed(&id, &e.to_string());
                }
                tracing::warn!(id = %id, recipient_id, error = %e, "Transport rejected message");
                Err(e)
            }
            Err(_) => {
                if !is_ping {
                    self.mark_failed(&id, "delivery timeout");
                }
                tracing::warn!(id = %id, recipient_id, "Message delivery timed out");
                Err(Error::Timeout(format!("delivery of message {}", id)))
            }
        }
    }

    /// Queue a message for store-and-forward delivery.
    ///
    /// Session keys rotate, so a payload that may sit in the queue past a
    /// rotation cannot be sealed against today's key. It travels in clear,
    /// still signed when requested.
    async fn send_dtn(
        &self,
        recipient_id: &str,
        content: &str,
        options: &SendOptions,
    ) -> Result<String> {
        let now = self.clock.now_millis();
        let id = Uuid::new_v4().to_string();

        let (signature, algorithm) = if options.sign {
            (
                Some(self.sign_plaintext(content).await?),
                options.level.signature_level().tag().to_string(),
            )
        } else {
            (None, ALGORITHM_NONE.to_string())
        };

        let message = DtnMessage {
            id: id.clone(),
            sender_id: self.local_peer_id.clone(),
            recipient_id: recipient_id.to_string(),
            payload: content.to_string(),
            signature,
            algorithm,
            priority: options.priority,
            ttl_secs: options.ttl.as_secs(),
            hop_count: 0,
            attempts: 0,
            created_at: now,
        };
        self.dtn.submit(message, now)?;

        self.sent.write().insert(
            id.clone(),
            SentMessage::new(
                id.clone(),
                recipient_id.to_string(),
                content.len(),
                options.priority,
                true,
                now,
                options.ttl.as_millis() as i64,
            ),
        );
        tracing::debug!(
            id = %id,
            recipient_id,
            priority = %options.priority,
            "Message queued for store-and-forward delivery"
        );
        Ok(id)
    }

    /// Send a message to every reachable peer. Returns the message ID.
    ///
    /// No shared session exists with `"*"`, so broadcasts trade
    /// confidentiality for reach: the payload goes out in clear, optionally
    /// signed. Receivers do not confirm broadcasts.
    pub async fn broadcast_message(&self, content: &str, options: SendOptions) -> Result<String> {
        self.ensure_initialized()?;
        if content.len() > self.config.max_message_size {
            return Err(Error::MessageTooLarge {
                size: content.len(),
                max: self.config.max_message_size,
            });
        }
        if !self.transport.state().is_connected() {
            return Err(Error::NotConnected);
        }

        self.identity
            .ensure_level(self.provider.as_ref(), options.level)
            .await?;

        let now = self.clock.now_millis();
        let id = Uuid::new_v4().to_string();
        let (signature, algorithm) = if options.sign {
            (
                Some(self.sign_plaintext(content).await?),
                options.level.signature_level().tag().to_string(),
            )
        } else {
            (None, ALGORITHM_NONE.to_string())
        };

        let envelope = SecureMessage {
            version: ENVELOPE_PROTOCOL_VERSION,
            id: id.clone(),
            sender_id: self.local_peer_id.clone(),
            recipient_id: BROADCAST_RECIPIENT.to_string(),
            payload: content.to_string(),
            timestamp: now,
            encrypted: false,
            signed: options.sign,
            signature,
            key_id: None,
            encapsulation: None,
            algorithm,
            dtn: false,
            forward_secrecy: false,
            priority: options.priority,
            hop_count: 0,
            expires_at: None,
        };
        let bytes = envelope.to_bytes()?;

        let window = options.delivery_timeout.unwrap_or(self.config.delivery_timeout);
        self.sent.write().insert(
            id.clone(),
            SentMessage::new(
                id.clone(),
                BROADCAST_RECIPIENT.to_string(),
                content.len(),
                options.priority,
                false,
                now,
                window.as_millis() as i64,
            ),
        );

        match self.transport.broadcast(bytes).await {
            Ok(reached) => {
                self.mark_sent(&id);
                self.sent_count.fetch_add(1, Ordering::Relaxed);
                tracing::info!(id = %id, reached, "Broadcast handed to transport");
                Ok(id)
            }
            Err(e) => {
                self.mark_failed(&id, &e.to_string());
                tracing::warn!(id = %id, error = %e, "Broadcast failed");
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drain the store-and-forward queue: forward what is due, expire what
    /// outlived its TTL, requeue what still cannot reach its peer. Returns
    /// the number of messages forwarded. Runs on the maintenance tick; also
    /// callable directly to force a drain.
    pub async fn flush_dtn(&self) -> usize {
        if !self.transport.state().is_connected() {
            return 0;
        }
        let now = self.clock.now_millis();
        let batch = self.dtn.collect_due(now);

        for message in batch.expired {
            tracing::warn!(
                id = %message.id,
                recipient_id = %message.recipient_id,
                "Store-and-forward message expired before delivery"
            );
            self.mark_expired(&message.id);
        }

        let mut forwarded = 0;
        for message in batch.ready {
            let envelope = message.to_envelope(now);
            let bytes = match envelope.to_bytes() {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(
                        id = %message.id,
                        error = %e,
                        "Failed to encode store-and-forward envelope"
                    );
                    self.mark_failed(&message.id, "envelope encoding failed");
                    continue;
                }
            };
            match self.transport.send(&message.recipient_id, bytes).await {
                Ok(()) => {
                    self.mark_sent(&message.id);
                    self.sent_count.fetch_add(1, Ordering::Relaxed);
                    forwarded += 1;
                }
                Err(e) => {
                    tracing::debug!(
                        id = %message.id,
                        recipient_id = %message.recipient_id,
                        error = %e,
                        "Peer still unreachable, requeueing"
                    );
                    self.dtn.requeue(message, now);
                }
            }
        }
        forwarded
    }

    /// Fail ledger entries whose delivery window elapsed without a
    /// confirmation. Store-and-forward entries are governed by their TTL
    /// and broadcasts are never confirmed, so both are skipped.
    pub fn sweep_overdue(&self) {
        let now = self.clock.now_millis();
        let mut sent = self.sent.write();
        for record in sent.values_mut() {
            if record.dtn || record.recipient_id == BROADCAST_RECIPIENT {
                continue;
            }
            if record.is_overdue(now) {
                let id = record.id.clone();
                record.transition(
                    DeliveryStatus::Failed {
                        reason: "no delivery confirmation within timeout".into(),
                    },
                    now,
                );
                tracing::debug!(id = %id, "Marked unconfirmed message failed");
            }
        }
    }

    // ------------------------------------------------------------------
    // Listeners and introspection
    // ------------------------------------------------------------------

    /// Register a listener for accepted inbound messages.
    pub fn on_message(
        &self,
        listener: impl Fn(&ReceivedMessage) + Send + Sync + 'static,
    ) -> ListenerId {
        self.message_listeners.add(listener)
    }

    /// Remove a message listener. Returns `false` if it was already gone.
    pub fn off_message(&self, id: ListenerId) -> bool {
        self.message_listeners.remove(id)
    }

    /// Register a listener for connection state transitions.
    pub fn on_state_change(
        &self,
        listener: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> ListenerId {
        self.state_listeners.add(listener)
    }

    /// Remove a state listener. Returns `false` if it was already gone.
    pub fn off_state_change(&self, id: ListenerId) -> bool {
        self.state_listeners.remove(id)
    }

    /// The event-driven mirror of the transport state. Sends gate on the
    /// transport's own state; this mirror is what listeners observed last.
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Delivery status of a sent message, if the ledger knows it.
    pub fn message_status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.sent
            .read()
            .get(message_id)
            .map(|record| record.status.clone())
    }

    /// Snapshot of the delivery ledger.
    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.sent.read().values().cloned().collect()
    }

    /// Lifetime sent/received totals.
    pub fn message_counters(&self) -> MessageCounters {
        MessageCounters {
            sent: self.sent_count.load(Ordering::Relaxed),
            received: self.received_count.load(Ordering::Relaxed),
        }
    }

    /// Messages waiting in the store-and-forward queue.
    pub fn dtn_pending(&self) -> usize {
        self.dtn.len()
    }

    /// This node's identifier.
    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Whether [`initialize`](Self::initialize) has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// The crypto provider this core was built with.
    pub fn provider(&self) -> Arc<dyn CryptoProvider> {
        Arc::clone(&self.provider)
    }

    /// The configuration in effect.
    pub fn config(&self) -> &MessagingConfig {
        &self.config
    }

    /// Drop all session state for a departed peer.
    pub fn forget_peer(&self, peer_id: &str) {
        self.keyx.forget_peer(peer_id);
    }

    /// This node's own directory entry, built from its published keys.
    /// Requires [`initialize`](Self::initialize) to have generated them.
    pub fn local_peer_info(&self) -> Result<PeerInfo> {
        Ok(PeerInfo::new(
            self.local_peer_id.clone(),
            self.identity.published_kem_key()?,
            self.identity.published_signing_key()?,
            self.clock.now_millis(),
        ))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::NotInitialized)
        }
    }

    async fn sign_plaintext(&self, content: &str) -> Result<String> {
        let keypair = self.identity.signing_keypair()?;
        Ok(self
            .provider
            .sign(content.as_bytes(), &keypair)
            .await?
            .to_hex())
    }

    fn mark_sent(&self, id: &str) {
        let now = self.clock.now_millis();
        if let Some(record) = self.sent.write().get_mut(id) {
            record.transition(DeliveryStatus::Sent, now);
        }
    }

    fn mark_failed(&self, id: &str, reason: &str) {
        let now = self.clock.now_millis();
        if let Some(record) = self.sent.write().get_mut(id) {
            record.transition(
                DeliveryStatus::Failed {
                    reason: reason.to_string(),
                },
                now,
            );
        }
    }

    fn mark_expired(&self, id: &str) {
        let now = self.clock.now_millis();
        if let Some(record) = self.sent.write().get_mut(id) {
            record.transition(DeliveryStatus::Expired, now);
        }
    }

    fn confirm_delivery(&self, message_id: &str) {
        let now = self.clock.now_millis();
        let mut sent = self.sent.write();
        match sent.get_mut(message_id) {
            Some(record) => {
                if record.transition(DeliveryStatus::Delivered, now) {
                    tracing::debug!(id = message_id, "Message confirmed delivered");
                } else {
                    tracing::debug!(
                        id = message_id,
                        status = %record.status,
                        "Late delivery confirmation ignored"
                    );
                }
            }
            None => tracing::debug!(id = message_id, "Delivery confirmation for unknown message"),
        }
    }

    fn mirror_state(&self, state: ConnectionState) {
        {
            let mut current = self.state.write();
            if *current == state {
                return;
            }
            *current = state;
        }
        tracing::info!(state = %state, "Connection state changed");
        self.state_listeners.emit(&state);
    }

    async fn handle_inbound(&self, from: String, payload: Vec<u8>) {
        let envelope = match SecureMessage::from_bytes(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "Dropping unparseable envelope");
                return;
            }
        };

        if from != envelope.sender_id {
            tracing::warn!(
                from = %from,
                sender_id = %envelope.sender_id,
                "Envelope sender does not match transport origin"
            );
        }

        // Delivery confirmations are consumed here, never delivered.
        if let Some(target) = envelope.ack_target() {
            self.confirm_delivery(target);
            return;
        }

        if !envelope.is_broadcast() && envelope.recipient_id != self.local_peer_id {
            tracing::debug!(
                id = %envelope.id,
                recipient_id = %envelope.recipient_id,
                "Ignoring envelope addressed elsewhere"
            );
            return;
        }

        if envelope.is_expired(self.clock.now_millis()) {
            tracing::debug!(id = %envelope.id, "Dropping expired envelope");
            return;
        }

        let received = if envelope.encrypted {
            match self.open_envelope(&envelope).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(
                        id = %envelope.id,
                        sender_id = %envelope.sender_id,
                        error = %e,
                        "Dropping undecryptable envelope"
                    );
                    return;
                }
            }
        } else {
            let signed = self.verify_claimed(&envelope, &envelope.payload).await;
            received_from(&envelope, envelope.payload.clone(), signed)
        };

        self.deliver(&envelope, received).await;
    }

    /// Resolve the session, open the payload, and verify the signature.
    async fn open_envelope(&self, envelope: &SecureMessage) -> Result<ReceivedMessage> {
        let key_id = envelope
            .key_id
            .as_deref()
            .ok_or_else(|| Error::InvalidMessage("encrypted envelope without key_id".into()))?;

        let exchange = match self.keyx.lookup(key_id) {
            Some(exchange) => exchange,
            None => match &envelope.encapsulation {
                Some(encoded) => {
                    let ciphertext = BASE64.decode(encoded).map_err(|e| {
                        Error::DeserializationError(format!("invalid encapsulation: {}", e))
                    })?;
                    self.keyx
                        .adopt_inbound(
                            &envelope.sender_id,
                            key_id,
                            &envelope.algorithm,
                            &ciphertext,
                        )
                        .await?
                }
                None => return Err(Error::UnknownKeyExchange(key_id.to_string())),
            },
        };

        let sealed = BASE64
            .decode(&envelope.payload)
            .map_err(|e| Error::DeserializationError(format!("invalid payload: {}", e)))?;
        let aad = build_aad(
            &envelope.id,
            &envelope.sender_id,
            &envelope.recipient_id,
            key_id,
        );
        let plaintext_bytes = self.provider.open(&sealed, exchange.session_key(), &aad)?;
        let plaintext = String::from_utf8(plaintext_bytes)
            .map_err(|_| Error::InvalidMessage("payload is not valid UTF-8".into()))?;

        let signed = self.verify_claimed(envelope, &plaintext).await;
        Ok(received_from(envelope, plaintext, signed))
    }

    /// Verify the signature an envelope claims to carry.
    ///
    /// A failed or unverifiable signature downgrades the message to
    /// unsigned rather than dropping it; confidentiality held, only the
    /// authenticity claim did not.
    async fn verify_claimed(&self, envelope: &SecureMessage, plaintext: &str) -> bool {
        if !envelope.signed {
            return false;
        }
        let verified = match &envelope.signature {
            Some(signature_hex) => match Signature::from_hex(signature_hex) {
                Ok(signature) => match self.directory.signing_key(&envelope.sender_id) {
                    Some(public) => {
                        self.provider
                            .verify(plaintext.as_bytes(), &signature, &public)
                            .await
                    }
                    None => {
                        tracing::warn!(
                            sender_id = %envelope.sender_id,
                            "No signing key on file for sender"
                        );
                        false
                    }
                },
                Err(_) => false,
            },
            None => false,
        };
        if !verified {
            tracing::warn!(
                id = %envelope.id,
                sender_id = %envelope.sender_id,
                "Signature verification failed, delivering as unsigned"
            );
        }
        verified
    }

    async fn deliver(&self, envelope: &SecureMessage, received: ReceivedMessage) {
        let now = self.clock.now_millis();
        self.directory.touch(&received.sender_id, now);
        self.received_count.fetch_add(1, Ordering::Relaxed);

        // Pings are liveness probes and broadcasts have no single sender
        // session; neither is confirmed.
        let is_ping = received.payload == PING_PAYLOAD;
        if !is_ping && !envelope.is_broadcast() {
            self.send_ack(&received.sender_id, &received.id).await;
        }

        tracing::debug!(
            id = %received.id,
            sender_id = %received.sender_id,
            encrypted = received.encrypted,
            signed = received.signed,
            "Delivering inbound message"
        );
        self.message_listeners.emit(&received);
    }

    async fn send_ack(&self, peer_id: &str, message_id: &str) {
        let ack = SecureMessage::ack(
            &self.local_peer_id,
            peer_id,
            message_id,
            self.clock.now_millis(),
        );
        match ack.to_bytes() {
            Ok(bytes) => {
                if let Err(e) = self.transport.send(peer_id, bytes).await {
                    tracing::debug!(
                        peer_id,
                        message_id,
                        error = %e,
                        "Failed to return delivery confirmation"
                    );
                }
            }
            Err(e) => tracing::debug!(error = %e, "Failed to encode delivery confirmation"),
        }
    }
}

// ============================================================================
// BACKGROUND TASKS
// ============================================================================

/// Drains transport events: inbound payloads and state changes.
async fn run_inbound_pump(
    core: Arc<SecureMessaging>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Some(TransportEvent::Inbound { from, payload }) => {
                    core.handle_inbound(from, payload).await;
                }
                Some(TransportEvent::StateChanged(state)) => {
                    core.mirror_state(state);
                }
                None => break,
            },
        }
    }
    tracing::debug!(peer_id = %core.local_peer_id, "Inbound pump stopped");
}

/// Periodic upkeep: drain the store-and-forward queue and fail unconfirmed
/// sends whose window elapsed.
async fn run_maintenance(core: Arc<SecureMessaging>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(core.config.dtn.drain_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                core.flush_dtn().await;
                core.sweep_overdue();
            }
        }
    }
    tracing::debug!(peer_id = %core.local_peer_id, "Maintenance task stopped");
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DhKemProvider, KemStrength, SignatureLevel};
    use crate::transport::memory::{MemoryHub, MemoryTransport};

    struct TestNode {
        core: Arc<SecureMessaging>,
        transport: Arc<MemoryTransport>,
        directory: Arc<PeerDirectory>,
    }

    fn test_config() -> MessagingConfig {
        MessagingConfig {
            dtn: DtnConfig {
                propagation_delay_ms: (0, 0),
                ..DtnConfig::default()
            },
            ..MessagingConfig::default()
        }
    }

    fn node(hub: &Arc<MemoryHub>, peer_id: &str, clock: Clock) -> TestNode {
        let transport = MemoryTransport::new(Arc::clone(hub), peer_id);
        let directory = Arc::new(PeerDirectory::new());
        let core = SecureMessaging::new(
            test_config(),
            Arc::new(DhKemProvider::new()),
            Arc::clone(&transport) as Arc<dyn Transport>,
            Arc::clone(&directory),
            clock,
        );
        TestNode {
            core,
            transport,
            directory,
        }
    }

    async fn wired_pair() -> (TestNode, TestNode, Clock) {
        let hub = MemoryHub::new();
        let clock = Clock::manual(1_000_000);
        let alice = node(&hub, "alice", clock.clone());
        let bob = node(&hub, "bob", clock.clone());
        alice.core.initialize().await.unwrap();
        bob.core.initialize().await.unwrap();
        alice.core.connect().await.unwrap();
        bob.core.connect().await.unwrap();
        alice.directory.upsert(bob.core.local_peer_info().unwrap());
        bob.directory.upsert(alice.core.local_peer_info().unwrap());
        (alice, bob, clock)
    }

    fn message_sink(core: &SecureMessaging) -> Arc<Mutex<Vec<ReceivedMessage>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        core.on_message(move |message| captured.lock().push(message.clone()));
        sink
    }

    fn state_sink(core: &SecureMessaging) -> Arc<Mutex<Vec<ConnectionState>>> {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&sink);
        core.on_state_change(move |state| captured.lock().push(*state));
        sink
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let hub = MemoryHub::new();
        let n = node(&hub, "solo", Clock::manual(1_000_000));
        n.core.initialize().await.unwrap();
        n.core.initialize().await.unwrap();
        assert!(n.core.is_initialized());
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let hub = MemoryHub::new();
        let n = node(&hub, "solo", Clock::manual(1_000_000));
        let err = n
            .core
            .send_message("bob", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
        assert!(matches!(n.core.connect().await.unwrap_err(), Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let hub = MemoryHub::new();
        let n = node(&hub, "solo", Clock::manual(1_000_000));
        n.core.initialize().await.unwrap();
        let err = n
            .core
            .send_message("bob", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
        assert!(n.core.sent_messages().is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let (alice, bob, _clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);

        let id = alice
            .core
            .send_message("bob", "hello bob", SendOptions::default())
            .await
            .unwrap();
        settle().await;

        let messages = inbox.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "hello bob");
        assert_eq!(messages[0].sender_id, "alice");
        assert!(messages[0].encrypted);
        assert!(messages[0].signed);
        drop(messages);

        assert_eq!(
            alice.core.message_status(&id),
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(
            alice.core.message_counters(),
            MessageCounters { sent: 1, received: 0 }
        );
        assert_eq!(
            bob.core.message_counters(),
            MessageCounters { sent: 0, received: 1 }
        );
    }

    #[tokio::test]
    async fn test_unsigned_send_delivers_unsigned() {
        let (alice, bob, _clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);

        alice
            .core
            .send_message(
                "bob",
                "off the record",
                SendOptions {
                    sign: false,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        settle().await;

        let messages = inbox.lock();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].encrypted);
        assert!(!messages[0].signed);
    }

    #[tokio::test]
    async fn test_wrong_directory_key_downgrades_signature() {
        let (alice, bob, clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);

        // Replace Bob's record of Alice's signing key with an unrelated one.
        let provider = DhKemProvider::new();
        let bogus = provider
            .generate_signing_keypair(SignatureLevel::Level3)
            .await
            .unwrap();
        let alice_info = alice.core.local_peer_info().unwrap();
        bob.directory.upsert(PeerInfo::new(
            "alice",
            alice_info.kem_public_key.clone(),
            bogus.public.clone(),
            clock.now_millis(),
        ));

        alice
            .core
            .send_message("bob", "still readable", SendOptions::default())
            .await
            .unwrap();
        settle().await;

        let messages = inbox.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "still readable");
        assert!(!messages[0].signed);
    }

    #[tokio::test]
    async fn test_unknown_key_id_envelope_dropped() {
        let (alice, bob, clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);

        let forged = SecureMessage {
            version: ENVELOPE_PROTOCOL_VERSION,
            id: "forged".into(),
            sender_id: "alice".into(),
            recipient_id: "bob".into(),
            payload: BASE64.encode(b"garbage"),
            timestamp: clock.now_millis(),
            encrypted: true,
            signed: false,
            signature: None,
            key_id: Some("no-such-session".into()),
            encapsulation: None,
            algorithm: "KEM-768+SIG-L3".into(),
            dtn: false,
            forward_secrecy: true,
            priority: MessagePriority::Medium,
            hop_count: 0,
            expires_at: None,
        };
        alice
            .transport
            .send("bob", forged.to_bytes().unwrap())
            .await
            .unwrap();
        settle().await;

        assert!(inbox.lock().is_empty());
        assert_eq!(bob.core.message_counters().received, 0);
    }

    #[tokio::test]
    async fn test_session_rotation_is_transparent() {
        let (alice, bob, clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);

        let first = alice
            .core
            .send_message("bob", "before rotation", SendOptions::default())
            .await
            .unwrap();
        settle().await;

        clock.advance(Duration::from_secs(3601));

        let second = alice
            .core
            .send_message("bob", "after rotation", SendOptions::default())
            .await
            .unwrap();
        settle().await;

        let messages = inbox.lock();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, "before rotation");
        assert_eq!(messages[1].payload, "after rotation");
        drop(messages);

        assert_eq!(
            alice.core.message_status(&first),
            Some(DeliveryStatus::Delivered)
        );
        assert_eq!(
            alice.core.message_status(&second),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_dtn_delivers_when_peer_returns() {
        let (alice, bob, clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);
        bob.core.disconnect().await.unwrap();

        let id = alice
            .core
            .send_message(
                "bob",
                "catch up later",
                SendOptions {
                    dtn: true,
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(alice.core.message_status(&id), Some(DeliveryStatus::Pending));
        assert_eq!(alice.core.dtn_pending(), 1);

        // Let the maintenance tick hit the unreachable peer and requeue.
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(alice.core.dtn_pending(), 1);

        bob.core.connect().await.unwrap();
        clock.advance(Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(800)).await;

        let messages = inbox.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, "catch up later");
        assert!(messages[0].dtn);
        assert!(!messages[0].encrypted);
        assert!(messages[0].signed);
        assert_eq!(messages[0].hop_count, 1);
        drop(messages);

        assert_eq!(alice.core.dtn_pending(), 0);
        assert_eq!(
            alice.core.message_status(&id),
            Some(DeliveryStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_dtn_expires_unreachable_message() {
        let (alice, bob, clock) = wired_pair().await;
        bob.core.disconnect().await.unwrap();

        let id = alice
            .core
            .send_message(
                "bob",
                "too late",
                SendOptions {
                    dtn: true,
                    ttl: Duration::from_secs(1),
                    ..SendOptions::default()
                },
            )
            .await
            .unwrap();

        clock.advance(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_millis(800)).await;

        assert_eq!(alice.core.message_status(&id), Some(DeliveryStatus::Expired));
        assert_eq!(alice.core.dtn_pending(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_peers() {
        let hub = MemoryHub::new();
        let clock = Clock::manual(1_000_000);
        let alice = node(&hub, "alice", clock.clone());
        let bob = node(&hub, "bob", clock.clone());
        let carol = node(&hub, "carol", clock.clone());
        for n in [&alice, &bob, &carol] {
            n.core.initialize().await.unwrap();
            n.core.connect().await.unwrap();
        }
        bob.directory.upsert(alice.core.local_peer_info().unwrap());
        carol.directory.upsert(alice.core.local_peer_info().unwrap());
        let bob_inbox = message_sink(&bob.core);
        let carol_inbox = message_sink(&carol.core);

        let id = alice
            .core
            .broadcast_message("service restart at noon", SendOptions::default())
            .await
            .unwrap();
        settle().await;

        for inbox in [&bob_inbox, &carol_inbox] {
            let messages = inbox.lock();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].payload, "service restart at noon");
            assert_eq!(messages[0].recipient_id, BROADCAST_RECIPIENT);
            assert!(!messages[0].encrypted);
            assert!(messages[0].signed);
        }

        // Broadcasts are never confirmed; the ledger settles at Sent.
        assert_eq!(alice.core.message_status(&id), Some(DeliveryStatus::Sent));
    }

    #[tokio::test]
    async fn test_send_validation() {
        let (alice, _bob, _clock) = wired_pair().await;

        let oversized = "x".repeat(64 * 1024 + 1);
        let err = alice
            .core
            .send_message("bob", &oversized, SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge { size: 65537, .. }));

        let err = alice
            .core
            .send_message("", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidMessage(_)));
    }

    #[tokio::test]
    async fn test_state_listener_and_mirror() {
        let hub = MemoryHub::new();
        let n = node(&hub, "solo", Clock::manual(1_000_000));
        n.core.initialize().await.unwrap();
        let states = state_sink(&n.core);

        n.core.connect().await.unwrap();
        settle().await;
        assert_eq!(
            *states.lock(),
            vec![ConnectionState::Connecting, ConnectionState::Connected]
        );
        assert_eq!(n.core.connection_state(), ConnectionState::Connected);

        n.core.disconnect().await.unwrap();
        settle().await;
        assert_eq!(n.core.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_missing_confirmation_marks_failed() {
        let hub = MemoryHub::new();
        let clock = Clock::manual(1_000_000);
        let alice = node(&hub, "alice", clock.clone());
        alice.core.initialize().await.unwrap();
        alice.core.connect().await.unwrap();

        // Carol's endpoint is reachable but nothing is draining it, so no
        // confirmation ever comes back.
        let carol_transport = MemoryTransport::new(Arc::clone(&hub), "carol");
        carol_transport.connect().await.unwrap();
        let provider = DhKemProvider::new();
        let kem = provider
            .generate_kem_keypair(KemStrength::Bits768)
            .await
            .unwrap();
        let signing = provider
            .generate_signing_keypair(SignatureLevel::Level3)
            .await
            .unwrap();
        alice.directory.upsert(PeerInfo::new(
            "carol",
            kem.public.clone(),
            signing.public.clone(),
            clock.now_millis(),
        ));

        let id = alice
            .core
            .send_message("carol", "anyone there?", SendOptions::default())
            .await
            .unwrap();
        assert_eq!(alice.core.message_status(&id), Some(DeliveryStatus::Sent));

        clock.advance(Duration::from_secs(31));
        alice.core.sweep_overdue();

        match alice.core.message_status(&id) {
            Some(DeliveryStatus::Failed { reason }) => {
                assert!(reason.contains("confirmation"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_stops_core() {
        let (alice, _bob, _clock) = wired_pair().await;
        alice.core.shutdown().await;
        assert!(!alice.core.is_initialized());
        let err = alice
            .core
            .send_message("bob", "hi", SendOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_ping_keeps_no_ledger_entry() {
        let (alice, bob, _clock) = wired_pair().await;
        let inbox = message_sink(&bob.core);

        let id = alice
            .core
            .send_message("bob", PING_PAYLOAD, SendOptions::default())
            .await
            .unwrap();
        settle().await;

        // The probe reached Bob but Alice keeps no record and gets no ack.
        let messages = inbox.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].payload, PING_PAYLOAD);
        drop(messages);

        assert_eq!(alice.core.message_status(&id), None);
        assert!(alice.core.sent_messages().is_empty());
        assert_eq!(alice.core.message_counters().sent, 1);
        assert_eq!(bob.core.message_counters().received, 1);
    }
}
