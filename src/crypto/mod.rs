//! # Cryptography Module
//!
//! This module defines the cryptographic provider seam and the key material
//! types that flow through it.
//!
//! ## Security Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    TIERED SECURITY MODEL                        │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │   Tier       KEM class      Signature      Notes                │   │
//! │  │   ────────   ─────────      ─────────      ─────────────────    │   │
//! │  │   STANDARD   768-bit        Level 3        reuses HIGH keys     │   │
//! │  │   HIGH       768-bit        Level 3        the default tier     │   │
//! │  │   MAXIMUM    1024-bit       Level 5        strongest settings   │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 SESSION ESTABLISHMENT                           │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  1. Encapsulate against the peer's advertised KEM key          │   │
//! │  │     encapsulate(peer_pub) → (ciphertext, shared_secret)        │   │
//! │  │                                                                 │   │
//! │  │  2. Both sides derive the same session key                     │   │
//! │  │     sender:   shared_secret from encapsulation                 │   │
//! │  │     receiver: decapsulate(ciphertext, own_keypair)             │   │
//! │  │                                                                 │   │
//! │  │  3. Seal messages with the session key                         │   │
//! │  │     • AES-256-GCM, 96-bit random nonce per message             │   │
//! │  │     • AAD binds envelope id, sender, recipient, key id         │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 SIGNATURE SCHEME                                │   │
//! │  ├─────────────────────────────────────────────────────────────────┤   │
//! │  │                                                                 │   │
//! │  │  Signatures cover the PLAINTEXT and are computed before        │   │
//! │  │  encryption, so the receiver verifies content integrity        │   │
//! │  │  after decryption. 64-byte signatures, 32-byte public keys.    │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## The Provider Seam
//!
//! All asymmetric cryptography goes through the [`CryptoProvider`] trait.
//! The shipped [`DhKemProvider`] emulates the KEM interface classically
//! (ephemeral X25519 + HKDF-SHA256); a post-quantum implementation plugs in
//! behind the same trait without touching the messaging core. Asymmetric
//! operations are `async` because a real provider may be slow; symmetric
//! sealing and hashing stay synchronous.
//!
//! ## Security Considerations
//!
//! 1. **Key Zeroization**: All secret material is zeroized when dropped
//! 2. **Constant-Time Operations**: Using dalek for constant-time crypto
//! 3. **Secure Random**: Using `rand::rngs::OsRng` for cryptographic randomness
//! 4. **No Nonce Reuse**: Unique random nonces for every seal operation

mod keys;
mod provider;

pub use keys::{
    KemKeyPair, KemPublicKey, SessionKey, SharedSecret, Signature, SigningKeyPair,
    SigningPublicKey, KEM_CIPHERTEXT_SIZE, KEM_PUBLIC_KEY_SIZE, SESSION_KEY_SIZE, SIGNATURE_SIZE,
};
pub use provider::{domain, DhKemProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ============================================================================
// SECURITY TIERS
// ============================================================================

/// KEM strength class requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KemStrength {
    /// 768-bit class
    Bits768,
    /// 1024-bit class
    Bits1024,
}

impl KemStrength {
    /// Wire tag for this strength class.
    pub fn tag(&self) -> &'static str {
        match self {
            KemStrength::Bits768 => "KEM-768",
            KemStrength::Bits1024 => "KEM-1024",
        }
    }

    /// Recover the strength class from an envelope algorithm tag.
    pub fn from_algorithm_tag(tag: &str) -> Option<Self> {
        if tag.starts_with("KEM-1024") {
            Some(KemStrength::Bits1024)
        } else if tag.starts_with("KEM-768") {
            Some(KemStrength::Bits768)
        } else {
            None
        }
    }
}

/// Signature scheme level requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureLevel {
    /// NIST level 3 class
    Level3,
    /// NIST level 5 class
    Level5,
}

impl SignatureLevel {
    /// Wire tag for this signature level.
    pub fn tag(&self) -> &'static str {
        match self {
            SignatureLevel::Level3 => "SIG-L3",
            SignatureLevel::Level5 => "SIG-L5",
        }
    }
}

/// Security tier for an outbound message.
///
/// Selects the KEM strength class and signature level used for the
/// message's session establishment and signing. STANDARD is a semantic
/// tier: it maps onto the HIGH tier's key material.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    /// Everyday traffic; maps onto High's key material
    Standard,
    /// The default tier: KEM-768 with level-3 signatures
    #[default]
    High,
    /// KEM-1024 with level-5 signatures
    Maximum,
}

impl SecurityLevel {
    /// The KEM strength class this tier establishes sessions with.
    pub fn kem_strength(&self) -> KemStrength {
        match self {
            SecurityLevel::Standard | SecurityLevel::High => KemStrength::Bits768,
            SecurityLevel::Maximum => KemStrength::Bits1024,
        }
    }

    /// The signature level this tier signs with.
    pub fn signature_level(&self) -> SignatureLevel {
        match self {
            SecurityLevel::Standard | SecurityLevel::High => SignatureLevel::Level3,
            SecurityLevel::Maximum => SignatureLevel::Level5,
        }
    }

    /// Combined algorithm tag carried in envelopes, e.g. `KEM-768+SIG-L3`.
    pub fn algorithm_tag(&self) -> String {
        format!("{}+{}", self.kem_strength().tag(), self.signature_level().tag())
    }

    /// Recover the tier from an envelope algorithm tag.
    ///
    /// STANDARD shares HIGH's material, so its tag parses back as `High`.
    pub fn from_algorithm_tag(tag: &str) -> Option<Self> {
        match KemStrength::from_algorithm_tag(tag)? {
            KemStrength::Bits768 => Some(SecurityLevel::High),
            KemStrength::Bits1024 => Some(SecurityLevel::Maximum),
        }
    }
}

impl std::fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SecurityLevel::Standard => "standard",
            SecurityLevel::High => "high",
            SecurityLevel::Maximum => "maximum",
        };
        f.write_str(name)
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Output of a KEM encapsulation: the ciphertext to ship to the peer and
/// the locally derived shared secret.
#[derive(Debug)]
pub struct Encapsulation {
    /// KEM ciphertext, carried on the first envelope of an exchange
    pub ciphertext: Vec<u8>,
    /// The shared secret both sides now hold
    pub shared_secret: SharedSecret,
}

/// The cryptographic provider seam.
///
/// The messaging core treats the provider as opaque: key generation,
/// encapsulation and signing may take arbitrary time and are awaited,
/// never blocked on. Implementations must be safe to share across tasks.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Generate a KEM key pair of the given strength class.
    async fn generate_kem_keypair(&self, strength: KemStrength) -> Result<KemKeyPair>;

    /// Generate a signing key pair at the given level.
    async fn generate_signing_keypair(&self, level: SignatureLevel) -> Result<SigningKeyPair>;

    /// Encapsulate a fresh shared secret against a peer's public key.
    ///
    /// The strength selects the derivation domain; it normally matches the
    /// requested security tier of the message being sent.
    async fn encapsulate(&self, peer: &KemPublicKey, strength: KemStrength)
        -> Result<Encapsulation>;

    /// Recover the shared secret from a received KEM ciphertext.
    async fn decapsulate(
        &self,
        ciphertext: &[u8],
        keypair: &KemKeyPair,
        strength: KemStrength,
    ) -> Result<SharedSecret>;

    /// Sign data with the given key pair.
    async fn sign(&self, data: &[u8], keypair: &SigningKeyPair) -> Result<Signature>;

    /// Verify a signature. Malformed keys or signatures verify as `false`.
    async fn verify(&self, data: &[u8], signature: &Signature, public: &SigningPublicKey) -> bool;

    /// AEAD-seal plaintext under a session key. The returned buffer is
    /// nonce-prefixed and self-contained.
    fn seal(&self, plaintext: &[u8], key: &SessionKey, aad: &[u8]) -> Result<Vec<u8>>;

    /// Open a nonce-prefixed AEAD ciphertext. Fails on any tampering of
    /// ciphertext or AAD.
    fn open(&self, sealed: &[u8], key: &SessionKey, aad: &[u8]) -> Result<Vec<u8>>;

    /// Hash arbitrary data to 32 bytes.
    fn hash(&self, data: &[u8]) -> [u8; 32];
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_defaults_to_high() {
        assert_eq!(SecurityLevel::default(), SecurityLevel::High);
    }

    #[test]
    fn test_standard_maps_to_high_tier_material() {
        assert_eq!(
            SecurityLevel::Standard.kem_strength(),
            SecurityLevel::High.kem_strength()
        );
        assert_eq!(
            SecurityLevel::Standard.signature_level(),
            SecurityLevel::High.signature_level()
        );
    }

    #[test]
    fn test_maximum_selects_strongest_material() {
        assert_eq!(SecurityLevel::Maximum.kem_strength(), KemStrength::Bits1024);
        assert_eq!(SecurityLevel::Maximum.signature_level(), SignatureLevel::Level5);
        assert_eq!(SecurityLevel::Maximum.algorithm_tag(), "KEM-1024+SIG-L5");
    }

    #[test]
    fn test_strength_round_trips_through_algorithm_tag() {
        for level in [SecurityLevel::Standard, SecurityLevel::High, SecurityLevel::Maximum] {
            let tag = level.algorithm_tag();
            assert_eq!(KemStrength::from_algorithm_tag(&tag), Some(level.kem_strength()));
        }
        assert_eq!(KemStrength::from_algorithm_tag("RSA-2048"), None);
    }

    #[test]
    fn test_level_round_trips_through_algorithm_tag() {
        let high = SecurityLevel::High.algorithm_tag();
        let max = SecurityLevel::Maximum.algorithm_tag();
        assert_eq!(SecurityLevel::from_algorithm_tag(&high), Some(SecurityLevel::High));
        assert_eq!(SecurityLevel::from_algorithm_tag(&max), Some(SecurityLevel::Maximum));

        // STANDARD is indistinguishable from HIGH on the wire.
        let standard = SecurityLevel::Standard.algorithm_tag();
        assert_eq!(SecurityLevel::from_algorithm_tag(&standard), Some(SecurityLevel::High));
        assert_eq!(SecurityLevel::from_algorithm_tag("none"), None);
    }
}
