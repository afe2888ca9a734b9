//! # Cryptographic Facade
//!
//! All primitive operations the router core needs, behind one value:
//!
//! - **Signatures**: domain-separated Ed25519 signing and verification
//! - **AEAD**: XChaCha20-Poly1305 sealing of link frames and path layers
//! - **DH**: X25519 agreement for session and per-hop keys
//! - **Hashing**: BLAKE3 for short hashes and key derivation
//!
//! A [`Crypto`] value is constructed once and passed through `Router`
//! construction; components hold it by clone. There is no process-global
//! instance, so tests can thread their own through any component.
//!
//! Domain separation: every signed record type uses a unique prefix so a
//! signature can never be replayed in a different context.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use curve25519_dalek::scalar::Scalar;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

use crate::identity::{RouterId, SecretKey, SubSecretKey};

/// Domain separation prefix for router contact signatures.
pub const RC_SIGNATURE_DOMAIN: &[u8] = b"veilnet-rc-v1:";

/// Domain separation prefix for introset signatures.
pub const INTROSET_SIGNATURE_DOMAIN: &[u8] = b"veilnet-introset-v1:";

/// Domain separation prefix for link handshake signatures.
pub const LINK_HANDSHAKE_DOMAIN: &[u8] = b"veilnet-link-v1:";

/// XChaCha20-Poly1305 nonce length.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

/// Error type for signature verification failures, shared by every signed
/// record (RCs, introsets, handshakes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// The crypto facade. Stateless; clones are free.
#[derive(Clone, Copy, Debug, Default)]
pub struct Crypto;

impl Crypto {
    pub fn new() -> Self {
        Self
    }

    // ------------------------------------------------------------------
    // Signatures
    // ------------------------------------------------------------------

    /// Sign `data` with `key` under a domain prefix.
    pub fn sign(&self, key: &SecretKey, domain: &[u8], data: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        key.sign(&prefixed).to_vec()
    }

    /// Sign `data` with a derived sub-key under a domain prefix.
    pub fn sign_sub(&self, key: &SubSecretKey, domain: &[u8], data: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        key.sign(&prefixed).to_vec()
    }

    /// Verify a domain-separated signature claimed to be from `signer`.
    pub fn verify(
        &self,
        signer: &RouterId,
        domain: &[u8],
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), SignatureError> {
        if signature.is_empty() {
            return Err(SignatureError::Missing);
        }
        if signature.len() != 64 {
            return Err(SignatureError::InvalidLength);
        }
        if !signer.is_valid() {
            return Err(SignatureError::InvalidPublicKey);
        }
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        if signer.verify(&prefixed, signature) {
            Ok(())
        } else {
            Err(SignatureError::VerificationFailed)
        }
    }

    // ------------------------------------------------------------------
    // Key generation and DH
    // ------------------------------------------------------------------

    /// Generate an identity/signing key (Ed25519 public half cached).
    pub fn identity_keygen(&self) -> SecretKey {
        SecretKey::generate()
    }

    /// Generate an encryption key: the seed is an X25519 secret and the
    /// cached public half is the matching X25519 public key.
    pub fn encryption_keygen(&self) -> SecretKey {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let mut key = SecretKey::from_seed(seed);
        let public = self.dh_public(&seed);
        key.set_public_half(public);
        seed.zeroize();
        key
    }

    /// Recompute the cached X25519 public half of an encryption key loaded
    /// from disk.
    pub fn recalc_encryption(&self, key: &mut SecretKey) {
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&key.as_bytes()[..32]);
        let public = self.dh_public(&seed);
        key.set_public_half(public);
        seed.zeroize();
    }

    /// X25519 public key for a 32-byte secret.
    pub fn dh_public(&self, secret: &[u8; 32]) -> [u8; 32] {
        let sk = x25519_dalek::StaticSecret::from(*secret);
        *x25519_dalek::PublicKey::from(&sk).as_bytes()
    }

    /// X25519 shared secret.
    pub fn dh(&self, secret: &[u8; 32], remote_public: &[u8; 32]) -> [u8; 32] {
        let sk = x25519_dalek::StaticSecret::from(*secret);
        let pk = x25519_dalek::PublicKey::from(*remote_public);
        *sk.diffie_hellman(&pk).as_bytes()
    }

    /// Fresh ephemeral X25519 secret.
    pub fn ephemeral_secret(&self) -> [u8; 32] {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        seed
    }

    /// Deterministically derive a sub-key from a parent signing key and a
    /// context string (e.g. a hidden-service address). The derived scalar is
    /// canonical, so the result round-trips through `recalculate`.
    pub fn derive_subkey(&self, parent: &SecretKey, context: &[u8]) -> SubSecretKey {
        let parent_scalar = parent.to_private();
        let mut hasher = Sha512::new();
        hasher.update(b"veilnet-subkey-v1:");
        hasher.update(parent_scalar.as_bytes());
        hasher.update(context);
        let wide: [u8; 64] = hasher.finalize().into();
        let scalar = Scalar::from_bytes_mod_order_wide(&wide);
        SubSecretKey::from_scalar(scalar.to_bytes())
    }

    // ------------------------------------------------------------------
    // AEAD
    // ------------------------------------------------------------------

    /// Seal `plaintext` with XChaCha20-Poly1305.
    pub fn seal(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Vec<u8> {
        let cipher = XChaCha20Poly1305::new(key.into());
        cipher
            .encrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .expect("XChaCha20-Poly1305 encryption is infallible for in-memory buffers")
    }

    /// Open a sealed buffer. Returns `None` on authentication failure.
    pub fn open(
        &self,
        key: &[u8; 32],
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Option<Vec<u8>> {
        let cipher = XChaCha20Poly1305::new(key.into());
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .ok()
    }

    pub fn random_nonce(&self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }

    // ------------------------------------------------------------------
    // Hashing
    // ------------------------------------------------------------------

    /// BLAKE3 hash of `data`.
    pub fn hash(&self, data: &[u8]) -> [u8; 32] {
        *blake3::hash(data).as_bytes()
    }

    /// Derive a 32-byte key from input material under a context label.
    pub fn derive_key(&self, context: &str, material: &[u8]) -> [u8; 32] {
        blake3::derive_key(context, material)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let crypto = Crypto::new();
        let key = SecretKey::generate();
        let sig = crypto.sign(&key, RC_SIGNATURE_DOMAIN, b"payload");

        assert!(crypto
            .verify(&key.public_key(), RC_SIGNATURE_DOMAIN, b"payload", &sig)
            .is_ok());
    }

    #[test]
    fn domain_separation_prevents_replay() {
        let crypto = Crypto::new();
        let key = SecretKey::generate();
        let sig = crypto.sign(&key, RC_SIGNATURE_DOMAIN, b"payload");

        assert_eq!(
            crypto.verify(&key.public_key(), INTROSET_SIGNATURE_DOMAIN, b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn verify_rejects_malformed_signatures() {
        let crypto = Crypto::new();
        let key = SecretKey::generate();
        let id = key.public_key();

        assert_eq!(
            crypto.verify(&id, RC_SIGNATURE_DOMAIN, b"x", &[]),
            Err(SignatureError::Missing)
        );
        assert_eq!(
            crypto.verify(&id, RC_SIGNATURE_DOMAIN, b"x", &[0u8; 32]),
            Err(SignatureError::InvalidLength)
        );
    }

    #[test]
    fn dh_agreement_symmetric() {
        let crypto = Crypto::new();
        let a = crypto.ephemeral_secret();
        let b = crypto.ephemeral_secret();
        let a_pub = crypto.dh_public(&a);
        let b_pub = crypto.dh_public(&b);

        assert_eq!(crypto.dh(&a, &b_pub), crypto.dh(&b, &a_pub));
    }

    #[test]
    fn encryption_key_public_half_is_x25519() {
        let crypto = Crypto::new();
        let key = crypto.encryption_keygen();
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&key.as_bytes()[..32]);
        assert_eq!(*key.public_key().as_bytes(), crypto.dh_public(&seed));
    }

    #[test]
    fn recalc_encryption_matches_keygen() {
        let crypto = Crypto::new();
        let key = crypto.encryption_keygen();
        let mut reloaded = SecretKey::from_bytes(*key.as_bytes());
        crypto.recalc_encryption(&mut reloaded);
        assert_eq!(reloaded.public_key(), key.public_key());
    }

    #[test]
    fn seal_open_roundtrip() {
        let crypto = Crypto::new();
        let key = crypto.derive_key("test seal key", b"material");
        let nonce = crypto.random_nonce();

        let sealed = crypto.seal(&key, &nonce, b"aad", b"secret frame");
        assert_eq!(
            crypto.open(&key, &nonce, b"aad", &sealed),
            Some(b"secret frame".to_vec())
        );
    }

    #[test]
    fn open_rejects_tampering() {
        let crypto = Crypto::new();
        let key = crypto.derive_key("test seal key", b"material");
        let nonce = crypto.random_nonce();

        let mut sealed = crypto.seal(&key, &nonce, b"aad", b"secret frame");
        sealed[0] ^= 1;
        assert_eq!(crypto.open(&key, &nonce, b"aad", &sealed), None);

        let sealed = crypto.seal(&key, &nonce, b"aad", b"secret frame");
        assert_eq!(crypto.open(&key, &nonce, b"wrong aad", &sealed), None);
    }

    #[test]
    fn derive_subkey_deterministic() {
        let crypto = Crypto::new();
        let parent = SecretKey::generate();

        let a = crypto.derive_subkey(&parent, b"address-1");
        let b = crypto.derive_subkey(&parent, b"address-1");
        let c = crypto.derive_subkey(&parent, b"address-2");

        assert_eq!(a.to_public(), b.to_public());
        assert_ne!(a.to_public(), c.to_public());

        let sig = crypto.sign_sub(&a, INTROSET_SIGNATURE_DOMAIN, b"introset");
        assert!(crypto
            .verify(&a.to_public(), INTROSET_SIGNATURE_DOMAIN, b"introset", &sig)
            .is_ok());
    }
}
