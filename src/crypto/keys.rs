//! # Key Material
//!
//! This module defines the key and signature types handled by the
//! cryptographic provider.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  KemKeyPair                                                     │   │
//! │  │  ──────────                                                     │   │
//! │  │                                                                 │   │
//! │  │  Purpose:                                                       │   │
//! │  │  • Receiving encapsulated session secrets from peers            │   │
//! │  │  • The public half is advertised through the peer directory     │   │
//! │  │                                                                 │   │
//! │  │  Format:                                                        │   │
//! │  │  • Private key: 32 bytes (kept secret, zeroized on drop)        │   │
//! │  │  • Public key: 32 bytes + strength tag (shared freely)          │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SigningKeyPair                                                 │   │
//! │  │  ──────────────                                                 │   │
//! │  │                                                                 │   │
//! │  │  Purpose:                                                       │   │
//! │  │  • Signing outbound plaintext before encryption                 │   │
//! │  │  • Verifying authenticity of received messages                  │   │
//! │  │                                                                 │   │
//! │  │  Format:                                                        │   │
//! │  │  • Private key: 32 bytes (kept secret, zeroized on drop)        │   │
//! │  │  • Public key: 32 bytes + level tag (shared freely)             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │  SharedSecret / SessionKey                                      │   │
//! │  │  ─────────────────────────                                      │   │
//! │  │                                                                 │   │
//! │  │  The 32-byte output of encapsulation/decapsulation, and the     │   │
//! │  │  AEAD key a key-exchange record holds. Both zeroize on drop.    │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::ZeroizeOnDrop;

use crate::crypto::{KemStrength, SignatureLevel};
use crate::error::{Error, Result};

/// Size of a KEM public key in bytes
pub const KEM_PUBLIC_KEY_SIZE: usize = 32;

/// Size of a KEM ciphertext (encapsulation) in bytes
pub const KEM_CIPHERTEXT_SIZE: usize = 32;

/// Size of a session key in bytes (256 bits)
pub const SESSION_KEY_SIZE: usize = 32;

/// Size of a signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

// ============================================================================
// KEM KEYS
// ============================================================================

/// Public half of a KEM key pair
///
/// Contains only public information: safe to serialize, transmit and store.
/// The strength tag travels with the key so encapsulation can select the
/// matching derivation domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KemPublicKey {
    #[serde(with = "hex_bytes")]
    bytes: [u8; KEM_PUBLIC_KEY_SIZE],
    strength: KemStrength,
}

impl KemPublicKey {
    /// Wrap raw key bytes with their strength tag.
    pub fn from_bytes(bytes: [u8; KEM_PUBLIC_KEY_SIZE], strength: KemStrength) -> Self {
        Self { bytes, strength }
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEM_PUBLIC_KEY_SIZE] {
        &self.bytes
    }

    /// The strength class this key was generated for.
    pub fn strength(&self) -> KemStrength {
        self.strength
    }

    pub(crate) fn x25519(&self) -> X25519PublicKey {
        X25519PublicKey::from(self.bytes)
    }
}

/// KEM key pair used for receiving encapsulated secrets
#[derive(ZeroizeOnDrop)]
pub struct KemKeyPair {
    /// Private key (secret)
    #[zeroize(skip)] // x25519_dalek handles its own zeroization
    secret: StaticSecret,
    /// Public key (derived from secret)
    #[zeroize(skip)]
    pub public: KemPublicKey,
}

impl KemKeyPair {
    /// Generate a new random KEM key pair of the given strength class.
    ///
    /// Uses the operating system's secure random number generator.
    pub fn generate(strength: KemStrength) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = KemPublicKey::from_bytes(X25519PublicKey::from(&secret).to_bytes(), strength);
        Self { secret, public }
    }

    /// The strength class of this pair.
    pub fn strength(&self) -> KemStrength {
        self.public.strength()
    }

    /// Raw Diffie-Hellman against a peer-supplied public value.
    pub(crate) fn diffie_hellman(&self, their_public: &X25519PublicKey) -> [u8; 32] {
        self.secret.diffie_hellman(their_public).to_bytes()
    }
}

impl std::fmt::Debug for KemKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Secret stays out of Debug output.
        f.debug_struct("KemKeyPair").field("public", &self.public).finish()
    }
}

// ============================================================================
// SIGNING KEYS
// ============================================================================

/// Public half of a signing key pair
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SigningPublicKey {
    #[serde(with = "hex_bytes")]
    bytes: [u8; 32],
    level: SignatureLevel,
}

impl SigningPublicKey {
    /// Wrap raw key bytes with their level tag.
    pub fn from_bytes(bytes: [u8; 32], level: SignatureLevel) -> Self {
        Self { bytes, level }
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// The signature level this key was generated for.
    pub fn level(&self) -> SignatureLevel {
        self.level
    }

    /// The dalek verifying key for signature checks.
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.bytes)
            .map_err(|e| Error::InvalidKey(format!("Invalid signing public key: {}", e)))
    }
}

/// Signing key pair
#[derive(ZeroizeOnDrop)]
pub struct SigningKeyPair {
    /// Private signing key (secret)
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
    /// Public verification key
    #[zeroize(skip)]
    pub public: SigningPublicKey,
}

impl SigningKeyPair {
    /// Generate a new random signing key pair at the given level.
    pub fn generate(level: SignatureLevel) -> Self {
        let secret = SigningKey::generate(&mut OsRng);
        let public = SigningPublicKey::from_bytes(secret.verifying_key().to_bytes(), level);
        Self { secret, public }
    }

    /// The signature level of this pair.
    pub fn level(&self) -> SignatureLevel {
        self.public.level()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

impl std::fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKeyPair").field("public", &self.public).finish()
    }
}

// ============================================================================
// SECRETS
// ============================================================================

/// The shared secret produced by encapsulation/decapsulation
///
/// Already passed through the provider's KDF; both sides of an exchange
/// hold the same 32 bytes. Zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct SharedSecret {
    bytes: [u8; 32],
}

impl SharedSecret {
    /// Wrap a derived secret.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// An AEAD session key held by a key-exchange record
///
/// Zeroized when dropped.
#[derive(ZeroizeOnDrop)]
pub struct SessionKey {
    bytes: [u8; SESSION_KEY_SIZE],
}

impl SessionKey {
    /// Wrap raw key material.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Adopt the encapsulated shared secret as the session key.
    pub fn from_shared_secret(secret: &SharedSecret) -> Self {
        Self { bytes: *secret.as_bytes() }
    }

    pub(crate) fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

// ============================================================================
// SIGNATURES
// ============================================================================

/// A detached signature over message plaintext
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_bytes")] pub [u8; SIGNATURE_SIZE]);

impl Signature {
    /// Wrap raw signature bytes.
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (must be exactly 64 bytes)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(Error::InvalidKey(format!(
                "Signature must be {} bytes, got {}",
                SIGNATURE_SIZE,
                slice.len()
            )));
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    /// The raw signature bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.0
    }

    /// Encode as hex string (the form carried in envelopes)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| Error::InvalidKey(format!("Invalid signature hex: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl AsRef<[u8]> for Signature {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// ============================================================================
// SERDE HELPERS
// ============================================================================

/// Serde helper for serializing 32-byte arrays as hex
mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

/// Serde helper for signature bytes
mod signature_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 64], serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<[u8; 64], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("Invalid signature length"))
    }
}

// ============================================================================
// TESTS
// ============================================================================
