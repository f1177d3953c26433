//! # Key Exchange Manager
//!
//! Establishes, caches and rotates the per-peer sessions that seal
//! message payloads.
//!
//! ## Session Establishment
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      SESSION ESTABLISHMENT                              │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Sender (Alice)                       Recipient (Bob)                   │
//! │  ──────────────                       ───────────────                   │
//! │                                                                         │
//! │  1. encapsulate(bob_kem_public)                                         │
//! │     → ciphertext + shared_secret                                        │
//! │                                                                         │
//! │  2. session_key = KDF(shared_secret)                                    │
//! │                                                                         │
//! │  3. First envelope carries                                              │
//! │     key_id + encapsulation ────────►  4. sees unknown key_id WITH       │
//! │                                          encapsulation attached         │
//! │                                                                         │
//! │                                       5. decapsulate(ciphertext,        │
//! │                                            bob_kem_keypair)             │
//! │                                          → same shared_secret           │
//! │                                                                         │
//! │                                       6. caches the session under       │
//! │                                          the same key_id; replies       │
//! │                                          reuse it in both directions    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Invariants
//!
//! - At most one active session per peer. Establishing or adopting a new
//!   session retires the previous one; envelopes still in flight under a
//!   retired key fail with `UnknownKeyExchange` and are dropped.
//! - Establishment is single-flight per peer: concurrent sends to the
//!   same peer during rotation converge on one new session instead of
//!   racing to create several.
//! - Sessions older than the rotation interval are replaced before the
//!   next send, unless the caller opted out of forward secrecy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::crypto::{
    CryptoProvider, KemKeyPair, KemPublicKey, KemStrength, SecurityLevel, SessionKey,
    SigningKeyPair, SigningPublicKey,
};
use crate::error::{Error, Result};
use crate::peers::PeerDirectory;
use crate::time::Clock;

// ============================================================================
// LOCAL IDENTITY MATERIAL
// ============================================================================

/// The node's own long-lived key material.
///
/// KEM pairs are cached per strength class; peers encapsulate against the
/// published pair, which is the `Bits768` entry, and stronger tiers reuse
/// it under a different derivation domain until a provider with genuine
/// per-tier keys is plugged in. The signing identity is a single pair:
/// peers learn exactly one signing public key, so every tier signs with
/// it and the tier's signature level travels as algorithm metadata.
#[derive(Default)]
pub struct IdentityKeys {
    kem: RwLock<HashMap<KemStrength, Arc<KemKeyPair>>>,
    signing: RwLock<Option<Arc<SigningKeyPair>>>,
}

impl IdentityKeys {
    /// An empty key store; [`ensure_level`](Self::ensure_level) fills it.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure the material a security tier needs exists, generating it
    /// through the provider on first use.
    pub async fn ensure_level(
        &self,
        provider: &dyn CryptoProvider,
        level: SecurityLevel,
    ) -> Result<()> {
        if self.kem.read().get(&KemStrength::Bits768).is_none() {
            let pair = provider.generate_kem_keypair(KemStrength::Bits768).await?;
            self.kem.write().entry(KemStrength::Bits768).or_insert_with(|| Arc::new(pair));
        }

        if self.signing.read().is_none() {
            let pair = provider.generate_signing_keypair(level.signature_level()).await?;
            self.signing.write().get_or_insert_with(|| Arc::new(pair));
        }

        Ok(())
    }

    /// The key pair peers encapsulate against.
    pub fn kem_keypair(&self) -> Result<Arc<KemKeyPair>> {
        self.kem
            .read()
            .get(&KemStrength::Bits768)
            .cloned()
            .ok_or_else(|| Error::NotInitialized)
    }

    /// The public key to advertise to peers.
    pub fn published_kem_key(&self) -> Result<KemPublicKey> {
        Ok(self.kem_keypair()?.public.clone())
    }

    /// The signing identity used for every outbound signature.
    pub fn signing_keypair(&self) -> Result<Arc<SigningKeyPair>> {
        self.signing.read().clone().ok_or(Error::NotInitialized)
    }

    /// The verification key peers check signatures against.
    pub fn published_signing_key(&self) -> Result<SigningPublicKey> {
        Ok(self.signing_keypair()?.public.clone())
    }
}

impl std::fmt::Debug for IdentityKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeys")
            .field("kem_strengths", &self.kem.read().len())
            .field("has_signing_identity", &self.signing.read().is_some())
            .finish()
    }
}

// ============================================================================
// SESSION RECORD
// ============================================================================

/// One established session with a peer.
pub struct KeyExchange {
    /// Session identifier carried as `key_id` on envelopes
    pub id: String,
    /// The peer this session seals to
    pub peer_id: String,
    /// Tier the session was established at
    pub level: SecurityLevel,
    /// Algorithm tag carried on envelopes sealed under this session
    pub algorithm: String,
    /// When the session was established (Unix milliseconds)
    pub established_at: i64,
    session_key: SessionKey,
    encapsulation: Vec<u8>,
    /// Whether the peer has been told about this session. The first
    /// envelope of a fresh session carries the encapsulation; once a send
    /// succeeds this flips and later envelopes carry only the key_id.
    announced: AtomicBool,
}

impl KeyExchange {
    pub(crate) fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    /// KEM ciphertext the recipient needs to derive the session key.
    pub fn encapsulation(&self) -> &[u8] {
        &self.encapsulation
    }

    /// Whether the peer has been sent the encapsulation for this session.
    pub fn is_announced(&self) -> bool {
        self.announced.load(Ordering::Acquire)
    }

    /// Record that the peer has received the encapsulation.
    pub fn mark_announced(&self) {
        self.announced.store(true, Ordering::Release);
    }

    /// Whether the session is older than the rotation interval.
    pub fn is_stale(&self, now_millis: i64, rotation_interval: Duration) -> bool {
        now_millis - self.established_at > rotation_interval.as_millis() as i64
    }
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Session key stays out of Debug output.
        f.debug_struct("KeyExchange")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("algorithm", &self.algorithm)
            .field("established_at", &self.established_at)
            .field("announced", &self.is_announced())
            .finish()
    }
}

// ============================================================================
// MANAGER
// ============================================================================

/// Owns every session record and the rotation policy.
pub struct KeyExchangeManager {
    provider: Arc<dyn CryptoProvider>,
    directory: Arc<PeerDirectory>,
    identity: Arc<IdentityKeys>,
    clock: Clock,
    rotation_interval: Duration,
    /// All live sessions by key_id, both established and adopted
    records: RwLock<HashMap<String, Arc<KeyExchange>>>,
    /// The session currently used to seal to each peer
    active: RwLock<HashMap<String, String>>,
    /// Per-peer establishment gates
    establishing: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyExchangeManager {
    /// A manager with no sessions.
    pub fn new(
        provider: Arc<dyn CryptoProvider>,
        directory: Arc<PeerDirectory>,
        identity: Arc<IdentityKeys>,
        clock: Clock,
        rotation_interval: Duration,
    ) -> Self {
        Self {
            provider,
            directory,
            identity,
            clock,
            rotation_interval,
            records: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            establishing: Mutex::new(HashMap::new()),
        }
    }

    /// The session to seal the next message to `peer_id` with.
    ///
    /// Reuses the active session when it matches the requested tier and is
    /// fresh enough; otherwise establishes a replacement. With
    /// `forward_secrecy` off the staleness check is skipped and a matching
    /// session is reused indefinitely.
    pub async fn get_or_establish(
        &self,
        peer_id: &str,
        level: SecurityLevel,
        forward_secrecy: bool,
    ) -> Result<Arc<KeyExchange>> {
        if let Some(existing) = self.active_record(peer_id) {
            if self.is_reusable(&existing, level, forward_secrecy) {
                return Ok(existing);
            }
        }

        let gate = {
            let mut establishing = self.establishing.lock();
            Arc::clone(establishing.entry(peer_id.to_string()).or_default())
        };
        let _guard = gate.lock().await;

        // A concurrent caller may have finished while we waited.
        if let Some(existing) = self.active_record(peer_id) {
            if self.is_reusable(&existing, level, forward_secrecy) {
                return Ok(existing);
            }
        }

        self.establish(peer_id, level).await
    }

    /// Look up a session by the `key_id` carried on an envelope.
    pub fn lookup(&self, key_id: &str) -> Option<Arc<KeyExchange>> {
        self.records.read().get(key_id).cloned()
    }

    /// Adopt a session announced by a peer.
    ///
    /// Called when an inbound envelope carries an encapsulation for a
    /// key_id we do not know yet. Decapsulates the KEM ciphertext with our
    /// own key pair and caches the session under the sender's key_id, so
    /// both the rest of that conversation and our replies can use it.
    /// Re-announcements of a known key_id return the existing record.
    pub async fn adopt_inbound(
        &self,
        peer_id: &str,
        key_id: &str,
        algorithm: &str,
        encapsulation: &[u8],
    ) -> Result<Arc<KeyExchange>> {
        if let Some(existing) = self.lookup(key_id) {
            return Ok(existing);
        }

        let level = SecurityLevel::from_algorithm_tag(algorithm).ok_or_else(|| {
            Error::KeyExchangeFailed(format!("unrecognized algorithm tag: {}", algorithm))
        })?;

        let keypair = self.identity.kem_keypair()?;
        let shared = self
            .provider
            .decapsulate(encapsulation, &keypair, level.kem_strength())
            .await?;

        let record = Arc::new(KeyExchange {
            id: key_id.to_string(),
            peer_id: peer_id.to_string(),
            level,
            algorithm: algorithm.to_string(),
            established_at: self.clock.now_millis(),
            session_key: SessionKey::from_shared_secret(&shared),
            encapsulation: encapsulation.to_vec(),
            // The peer invented this session; it needs no announcement
            // from us.
            announced: AtomicBool::new(true),
        });

        self.install(Arc::clone(&record));
        tracing::info!(
            peer_id,
            key_id,
            algorithm,
            "Adopted key exchange announced by peer"
        );
        Ok(record)
    }

    /// Drop every session for a peer, e.g. after it times out.
    pub fn forget_peer(&self, peer_id: &str) {
        let mut records = self.records.write();
        let mut active = self.active.write();
        if let Some(key_id) = active.remove(peer_id) {
            records.remove(&key_id);
            tracing::debug!(peer_id, key_id = %key_id, "Dropped key exchange for departed peer");
        }
        records.retain(|_, record| record.peer_id != peer_id);
        self.establishing.lock().remove(peer_id);
    }

    /// Number of live session records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether no sessions are held at all.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn active_record(&self, peer_id: &str) -> Option<Arc<KeyExchange>> {
        let key_id = self.active.read().get(peer_id).cloned()?;
        self.records.read().get(&key_id).cloned()
    }

    fn is_reusable(
        &self,
        record: &KeyExchange,
        level: SecurityLevel,
        forward_secrecy: bool,
    ) -> bool {
        if record.level != level {
            return false;
        }
        if !forward_secrecy {
            return true;
        }
        !record.is_stale(self.clock.now_millis(), self.rotation_interval)
    }

    async fn establish(&self, peer_id: &str, level: SecurityLevel) -> Result<Arc<KeyExchange>> {
        let peer_key = self
            .directory
            .kem_key(peer_id)
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))?;

        let encapsulated = self
            .provider
            .encapsulate(&peer_key, level.kem_strength())
            .await?;

        let record = Arc::new(KeyExchange {
            id: Uuid::new_v4().to_string(),
            peer_id: peer_id.to_string(),
            level,
            algorithm: level.algorithm_tag(),
            established_at: self.clock.now_millis(),
            session_key: SessionKey::from_shared_secret(&encapsulated.shared_secret),
            encapsulation: encapsulated.ciphertext,
            announced: AtomicBool::new(false),
        });

        self.install(Arc::clone(&record));
        tracing::info!(
            peer_id,
            key_id = %record.id,
            algorithm = %record.algorithm,
            "Established key exchange"
        );
        Ok(record)
    }

    /// Make `record` the peer's active session, retiring the previous one.
    fn install(&self, record: Arc<KeyExchange>) {
        let mut records = self.records.write();
        let mut active = self.active.write();
        if let Some(old_id) = active.insert(record.peer_id.clone(), record.id.clone()) {
            if old_id != record.id {
                records.remove(&old_id);
                tracing::debug!(
                    peer_id = %record.peer_id,
                    retired_key_id = %old_id,
                    "Retired previous key exchange"
                );
            }
        }
        records.insert(record.id.clone(), record);
    }
}

impl std::fmt::Debug for KeyExchangeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchangeManager")
            .field("records", &self.records.read().len())
            .field("active_peers", &self.active.read().len())
            .field("rotation_interval", &self.rotation_interval)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
