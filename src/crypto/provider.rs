//! # Default Cryptographic Provider
//!
//! A classical emulation of the KEM interface on the dalek stack.
//!
//! ## Encapsulation Construction
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      DHKEM-STYLE ENCAPSULATION                          │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  SENDER                                                                 │
//! │  ──────                                                                 │
//! │  1. ephemeral = X25519 keypair (fresh per encapsulation)                │
//! │  2. ciphertext = ephemeral public key (32 bytes)                        │
//! │  3. dh = ephemeral_secret × recipient_public                            │
//! │  4. shared_secret = HKDF-SHA256(                                        │
//! │       ikm  = dh,                                                        │
//! │       salt = ciphertext ‖ recipient_public,                             │
//! │       info = strength domain ("aphelion-kem-768-v1" / "...1024-v1")     │
//! │     )                                                                   │
//! │                                                                         │
//! │  RECIPIENT                                                              │
//! │  ─────────                                                              │
//! │  1. dh = own_secret × ciphertext   (same point, other side)             │
//! │  2. same HKDF → same shared_secret                                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ephemeral secret never leaves `encapsulate`; it is consumed by the
//! Diffie-Hellman computation, so a fresh exchange cannot be recreated after
//! the fact. Signatures are Ed25519; the level parameter is carried as
//! metadata and selects the scheme in a real post-quantum provider.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce as AesNonce,
};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey};

use crate::crypto::{
    CryptoProvider, Encapsulation, KemKeyPair, KemPublicKey, KemStrength, SessionKey,
    SharedSecret, Signature, SignatureLevel, SigningKeyPair, SigningPublicKey,
    KEM_CIPHERTEXT_SIZE,
};
use crate::error::{Error, Result};

/// Size of the AES-GCM nonce in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// Domain separation strings for HKDF
///
/// These ensure that secrets derived for different strength classes are
/// cryptographically independent, even over the same underlying curve.
pub mod domain {
    /// Derivation domain for the 768-bit KEM class
    pub const KEM_768: &[u8] = b"aphelion-kem-768-v1";

    /// Derivation domain for the 1024-bit KEM class
    pub const KEM_1024: &[u8] = b"aphelion-kem-1024-v1";
}

impl KemStrength {
    fn derivation_domain(&self) -> &'static [u8] {
        match self {
            KemStrength::Bits768 => domain::KEM_768,
            KemStrength::Bits1024 => domain::KEM_1024,
        }
    }
}

/// The default provider: ephemeral X25519 encapsulation, Ed25519
/// signatures, AES-256-GCM sealing, SHA-256 hashing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DhKemProvider;

impl DhKemProvider {
    /// The provider is stateless; this is equivalent to the unit value.
    pub fn new() -> Self {
        Self
    }

    /// HKDF shared by both directions of an exchange.
    ///
    /// Salt binds the concrete encapsulation (ciphertext) and the recipient
    /// key, so the same DH point never yields the same secret twice.
    fn derive_shared(
        dh_output: &[u8; 32],
        ciphertext: &[u8],
        recipient_public: &[u8],
        strength: KemStrength,
    ) -> Result<SharedSecret> {
        let mut salt = Vec::with_capacity(ciphertext.len() + recipient_public.len());
        salt.extend_from_slice(ciphertext);
        salt.extend_from_slice(recipient_public);

        let hkdf = Hkdf::<Sha256>::new(Some(&salt), dh_output);
        let mut secret = [0u8; 32];
        hkdf.expand(strength.derivation_domain(), &mut secret)
            .map_err(|_| Error::ProviderFailure("HKDF expansion failed".into()))?;

        Ok(SharedSecret::from_bytes(secret))
    }
}

#[async_trait]
impl CryptoProvider for DhKemProvider {
    async fn generate_kem_keypair(&self, strength: KemStrength) -> Result<KemKeyPair> {
        Ok(KemKeyPair::generate(strength))
    }

    async fn generate_signing_keypair(&self, level: SignatureLevel) -> Result<SigningKeyPair> {
        Ok(SigningKeyPair::generate(level))
    }

    async fn encapsulate(
        &self,
        peer: &KemPublicKey,
        strength: KemStrength,
    ) -> Result<Encapsulation> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ciphertext = X25519PublicKey::from(&ephemeral).to_bytes();
        // Consumes the ephemeral secret; it cannot be used twice.
        let dh = ephemeral.diffie_hellman(&peer.x25519()).to_bytes();

        let shared_secret = Self::derive_shared(&dh, &ciphertext, peer.as_bytes(), strength)?;

        Ok(Encapsulation {
            ciphertext: ciphertext.to_vec(),
            shared_secret,
        })
    }

    async fn decapsulate(
        &self,
        ciphertext: &[u8],
        keypair: &KemKeyPair,
        strength: KemStrength,
    ) -> Result<SharedSecret> {
        let ct_bytes: [u8; KEM_CIPHERTEXT_SIZE] = ciphertext.try_into().map_err(|_| {
            Error::InvalidKey(format!(
                "KEM ciphertext must be {} bytes, got {}",
                KEM_CIPHERTEXT_SIZE,
                ciphertext.len()
            ))
        })?;

        let their_ephemeral = X25519PublicKey::from(ct_bytes);
        let dh = keypair.diffie_hellman(&their_ephemeral);

        Self::derive_shared(&dh, &ct_bytes, keypair.public.as_bytes(), strength)
    }

    async fn sign(&self, data: &[u8], keypair: &SigningKeyPair) -> Result<Signature> {
        use ed25519_dalek::Signer;
        let sig = keypair.signing_key().sign(data);
        Ok(Signature::from_bytes(sig.to_bytes()))
    }

    async fn verify(&self, data: &[u8], signature: &Signature, public: &SigningPublicKey) -> bool {
        use ed25519_dalek::Verifier;
        let verifying_key = match public.verifying_key() {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());
        verifying_key.verify(data, &sig).is_ok()
    }

    fn seal(&self, plaintext: &[u8], key: &SessionKey, aad: &[u8]) -> Result<Vec<u8>> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| Error::ProviderFailure(format!("Invalid session key: {}", e)))?;

        let ciphertext = cipher
            .encrypt(AesNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| Error::ProviderFailure(format!("Sealing failed: {}", e)))?;

        // Nonce-prefixed so the buffer is self-contained on the wire.
        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8], key: &SessionKey, aad: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < NONCE_SIZE {
            return Err(Error::InvalidMessage(format!(
                "Sealed payload of {} bytes is shorter than the nonce",
                sealed.len()
            )));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| Error::ProviderFailure(format!("Invalid session key: {}", e)))?;

        cipher
            .decrypt(AesNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| {
                Error::ProviderFailure("Opening failed: authentication tag mismatch".into())
            })
    }

    fn hash(&self, data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_encapsulate_decapsulate_agree() {
        let provider = DhKemProvider::new();
        let recipient = provider.generate_kem_keypair(KemStrength::Bits768).await.unwrap();

        let encapsulation = provider
            .encapsulate(&recipient.public, KemStrength::Bits768)
            .await
            .unwrap();
        let recovered = provider
            .decapsulate(&encapsulation.ciphertext, &recipient, KemStrength::Bits768)
            .await
            .unwrap();

        assert_eq!(encapsulation.shared_secret.as_bytes(), recovered.as_bytes());
        assert_eq!(encapsulation.ciphertext.len(), KEM_CIPHERTEXT_SIZE);
    }

    #[tokio::test]
    async fn test_strength_domains_are_separated() {
        let provider = DhKemProvider::new();
        let recipient = provider.generate_kem_keypair(KemStrength::Bits768).await.unwrap();

        let encapsulation = provider
            .encapsulate(&recipient.public, KemStrength::Bits768)
            .await
            .unwrap();
        // Same ciphertext, wrong strength class: different derivation domain.
        let mismatched = provider
            .decapsulate(&encapsulation.ciphertext, &recipient, KemStrength::Bits1024)
            .await
            .unwrap();

        assert_ne!(encapsulation.shared_secret.as_bytes(), mismatched.as_bytes());
    }

    #[tokio::test]
    async fn test_each_encapsulation_is_fresh() {
        let provider = DhKemProvider::new();
        let recipient = provider.generate_kem_keypair(KemStrength::Bits768).await.unwrap();

        let a = provider.encapsulate(&recipient.public, KemStrength::Bits768).await.unwrap();
        let b = provider.encapsulate(&recipient.public, KemStrength::Bits768).await.unwrap();

        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.shared_secret.as_bytes(), b.shared_secret.as_bytes());
    }

    #[tokio::test]
    async fn test_decapsulate_rejects_bad_ciphertext_length() {
        let provider = DhKemProvider::new();
        let recipient = provider.generate_kem_keypair(KemStrength::Bits768).await.unwrap();

        let result = provider.decapsulate(&[0u8; 16], &recipient, KemStrength::Bits768).await;
        assert!(matches!(result, Err(Error::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_sign_verify_round_trip() {
        let provider = DhKemProvider::new();
        let keypair = provider
            .generate_signing_keypair(SignatureLevel::Level3)
            .await
            .unwrap();
        let message = b"hail from the outer orbit";

        let signature = provider.sign(message, &keypair).await.unwrap();
        assert!(provider.verify(message, &signature, &keypair.public).await);
        assert!(!provider.verify(b"different message", &signature, &keypair.public).await);
    }

    #[tokio::test]
    async fn test_verify_with_wrong_key_fails() {
        let provider = DhKemProvider::new();
        let signer = provider.generate_signing_keypair(SignatureLevel::Level3).await.unwrap();
        let other = provider.generate_signing_keypair(SignatureLevel::Level3).await.unwrap();

        let signature = provider.sign(b"payload", &signer).await.unwrap();
        assert!(!provider.verify(b"payload", &signature, &other.public).await);
    }

    #[test]
    fn test_seal_open_round_trip() {
        let provider = DhKemProvider::new();
        let key = SessionKey::from_bytes([42u8; 32]);
        let aad = b"msg-1|alice|bob";

        let sealed = provider.seal(b"Hello, World!", &key, aad).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + 13 + 16);

        let opened = provider.open(&sealed, &key, aad).unwrap();
        assert_eq!(opened, b"Hello, World!");
    }

    #[test]
    fn test_open_detects_tampering() {
        let provider = DhKemProvider::new();
        let key = SessionKey::from_bytes([42u8; 32]);

        let mut sealed = provider.seal(b"payload", &key, b"aad").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;

        assert!(provider.open(&sealed, &key, b"aad").is_err());
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let provider = DhKemProvider::new();
        let key = SessionKey::from_bytes([42u8; 32]);

        let sealed = provider.seal(b"payload", &key, b"context").unwrap();
        assert!(provider.open(&sealed, &key, b"other context").is_err());
        assert!(provider.open(&sealed, &key, b"context").is_ok());
    }

    #[test]
    fn test_open_rejects_truncated_input() {
        let provider = DhKemProvider::new();
        let key = SessionKey::from_bytes([42u8; 32]);
        assert!(matches!(
            provider.open(&[1, 2, 3], &key, b""),
            Err(Error::InvalidMessage(_))
        ));
    }

    #[test]
    fn test_hash_is_deterministic() {
        let provider = DhKemProvider::new();
        assert_eq!(provider.hash(b"abc"), provider.hash(b"abc"));
        assert_ne!(provider.hash(b"abc"), provider.hash(b"abd"));
    }
}
