//! # Router Identity and Key Material
//!
//! Core identity types for the overlay:
//!
//! - [`RouterId`]: 32-byte Ed25519 public key identifying a router; doubles as
//!   a DHT key after reinterpretation
//! - [`SecretKey`]: 64-byte seed+pubkey blob as persisted on disk
//! - [`PrivateKey`]: the derived, clamped scalar actually used for arithmetic
//! - [`SubSecretKey`]: an already-derived scalar plus signing randomness, used
//!   for keys derived from other keys (e.g. per-address introset signing)
//!
//! ## Key Derivation
//!
//! A [`SecretKey`] holds a 32-byte seed and a cached public key. The scalar is
//! obtained by hashing the seed with SHA-512, clamping the low 32 bytes
//! (clear the low 3 bits of byte 0, clear bit 7 and set bit 6 of byte 31), and
//! discarding the rest. This matches standard Ed25519 expansion, so signatures
//! made through the seed verify under the cached public key.
//!
//! A [`SubSecretKey`] stores a scalar directly (no clamping on use); its
//! signing randomness is recomputed as the upper half of SHA-512(scalar).
//! Public keys are computed by multiplying the Ed25519 basepoint by the scalar
//! *without* further clamping.

use curve25519_dalek::edwards::EdwardsPoint;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};
use zeroize::Zeroize;

/// 32-byte key used for XOR-distance ordering in the DHT. A [`RouterId`]'s
/// bytes are a `DhtKey` directly; an introset's derived signing key is one too.
pub type DhtKey = [u8; 32];

/// Compare two XOR distances lexicographically.
///
/// Used to determine which of two keys is closer to a target in the XOR
/// metric space.
#[inline]
pub fn distance_cmp(a: &DhtKey, b: &DhtKey) -> std::cmp::Ordering {
    a.cmp(b)
}

/// XOR distance between two 32-byte keys.
#[inline]
pub fn xor_distance(a: &DhtKey, b: &DhtKey) -> DhtKey {
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = a[i] ^ b[i];
    }
    out
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouterId([u8; 32]);

impl RouterId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Reinterpret this identity as a DHT key.
    #[inline]
    pub fn as_dht_key(&self) -> DhtKey {
        self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &RouterId) -> DhtKey {
        xor_distance(&self.0, &other.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// True if these bytes decode to a usable Ed25519 public key point.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Verify an Ed25519 signature made by this router's identity key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        if signature.len() != 64 {
            return false;
        }
        let Ok(vk) = VerifyingKey::try_from(self.0.as_slice()) else {
            return false;
        };
        let sig_bytes: [u8; 64] = match signature.try_into() {
            Ok(b) => b,
            Err(_) => return false,
        };
        vk.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl std::fmt::Debug for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterId({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for RouterId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for RouterId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A 64-byte secret key blob: 32-byte seed followed by the 32-byte public key.
///
/// This is the form keys take on disk and in memory at rest. The scalar used
/// for signing and DH is derived on demand via [`to_private`](Self::to_private).
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; 64],
}

impl SecretKey {
    pub const SIZE: usize = 64;

    /// Generate a fresh random key with the public half filled in.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        OsRng.fill_bytes(&mut seed);
        let key = Self::from_seed(seed);
        seed.zeroize();
        key
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&seed);
        let mut key = Self { bytes };
        key.recalculate();
        key
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.bytes
    }

    fn seed(&self) -> &[u8] {
        &self.bytes[..32]
    }

    /// Recompute the cached public half from the seed.
    pub fn recalculate(&mut self) -> &mut Self {
        let pk = self.to_private().to_public();
        self.bytes[32..].copy_from_slice(pk.as_bytes());
        self
    }

    /// Overwrite the cached public half. Used by the crypto facade for
    /// encryption keys, whose public half is X25519 rather than Ed25519.
    pub(crate) fn set_public_half(&mut self, public: [u8; 32]) {
        self.bytes[32..].copy_from_slice(&public);
    }

    /// Derive the actual scalar: SHA-512 the seed, clamp, keep the low 32
    /// bytes.
    pub fn to_private(&self) -> PrivateKey {
        let mut h: [u8; 64] = Sha512::digest(self.seed()).into();
        h[0] &= 248;
        h[31] &= 63;
        h[31] |= 64;
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&h[..32]);
        h.zeroize();
        PrivateKey { scalar }
    }

    pub fn public_key(&self) -> RouterId {
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&self.bytes[32..]);
        RouterId::from_bytes(pk)
    }

    /// Sign through the standard Ed25519 expansion of the seed.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        let seed: [u8; 32] = self.seed().try_into().expect("seed is 32 bytes");
        let signing = SigningKey::from_bytes(&seed);
        signing.sign(message).to_bytes()
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("pubkey", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// A derived 32-byte scalar. Already clamped; never clamped again.
#[derive(Clone)]
pub struct PrivateKey {
    scalar: [u8; 32],
}

impl PrivateKey {
    pub fn from_scalar(scalar: [u8; 32]) -> Self {
        Self { scalar }
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.scalar
    }

    /// Multiply the Ed25519 basepoint by this scalar without clamping.
    pub fn to_public(&self) -> RouterId {
        let s = Scalar::from_bytes_mod_order(self.scalar);
        let point = EdwardsPoint::mul_base(&s);
        RouterId::from_bytes(point.compress().to_bytes())
    }
}

impl Drop for PrivateKey {
    fn drop(&mut self) {
        self.scalar.zeroize();
    }
}

/// A derived scalar plus the 32-byte signing randomness Ed25519 needs for
/// deterministic nonces. The randomness is always recomputed as the upper
/// half of SHA-512(scalar), so a `SubSecretKey` is fully determined by its
/// scalar.
#[derive(Clone)]
pub struct SubSecretKey {
    bytes: [u8; 64],
}

impl SubSecretKey {
    pub fn from_scalar(scalar: [u8; 32]) -> Self {
        let mut key = Self { bytes: [0u8; 64] };
        key.bytes[..32].copy_from_slice(&scalar);
        key.recalculate();
        key
    }

    /// Recompute the signing-randomness half from the scalar half.
    pub fn recalculate(&mut self) -> &mut Self {
        let scalar = &self.bytes[..32];
        let h: [u8; 64] = Sha512::digest(scalar).into();
        self.bytes[32..].copy_from_slice(&h[32..]);
        self
    }

    pub fn to_public(&self) -> RouterId {
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&self.bytes[..32]);
        PrivateKey::from_scalar(scalar).to_public()
    }

    /// Sign with the raw expanded key (scalar + hash prefix). Used for keys
    /// derived from other keys, where no seed exists to expand. The scalar is
    /// taken as-is; re-clamping here would change the public key.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        use ed25519_dalek::hazmat::{raw_sign, ExpandedSecretKey};

        let mut scalar_bytes = [0u8; 32];
        scalar_bytes.copy_from_slice(&self.bytes[..32]);
        let mut hash_prefix = [0u8; 32];
        hash_prefix.copy_from_slice(&self.bytes[32..]);
        let esk = ExpandedSecretKey {
            scalar: Scalar::from_bytes_mod_order(scalar_bytes),
            hash_prefix,
        };
        scalar_bytes.zeroize();

        let vk_bytes = self.to_public();
        let vk = VerifyingKey::try_from(vk_bytes.as_bytes().as_slice())
            .expect("scalar-derived public key is a valid point");
        raw_sign::<Sha512>(&esk, message, &vk).to_bytes()
    }
}

impl Drop for SubSecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SubSecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubSecretKey")
            .field("pubkey", &self.to_public())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_key_generation_unique() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        assert_ne!(a.public_key(), b.public_key());
    }

    #[test]
    fn derived_public_matches_cached_public() {
        for _ in 0..20 {
            let key = SecretKey::generate();
            assert_eq!(key.to_private().to_public(), key.public_key());
        }
    }

    #[test]
    fn recalculate_is_idempotent() {
        let mut key = SecretKey::generate();
        let before = *key.as_bytes();
        key.recalculate();
        assert_eq!(*key.as_bytes(), before);
    }

    #[test]
    fn recalculate_repairs_corrupt_public_half() {
        let key = SecretKey::generate();
        let expected = key.public_key();

        let mut bytes = *key.as_bytes();
        bytes[40] ^= 0xFF;
        let mut mangled = SecretKey::from_bytes(bytes);
        assert_ne!(mangled.public_key(), expected);

        mangled.recalculate();
        assert_eq!(mangled.public_key(), expected);
    }

    #[test]
    fn sign_verifies_under_public_key() {
        let key = SecretKey::generate();
        let msg = b"link handshake";
        let sig = key.sign(msg);

        assert!(key.public_key().verify(msg, &sig));
        assert!(!key.public_key().verify(b"other message", &sig));
    }

    #[test]
    fn wrong_key_rejects_signature() {
        let a = SecretKey::generate();
        let b = SecretKey::generate();
        let sig = a.sign(b"hello");
        assert!(!b.public_key().verify(b"hello", &sig));
    }

    #[test]
    fn scalar_clamping_bits() {
        for _ in 0..20 {
            let key = SecretKey::generate();
            let private = key.to_private();
            let s = private.as_bytes();
            assert_eq!(s[0] & 0b0000_0111, 0, "low 3 bits of byte 0 cleared");
            assert_eq!(s[31] & 0b1000_0000, 0, "bit 7 of byte 31 cleared");
            assert_eq!(s[31] & 0b0100_0000, 0b0100_0000, "bit 6 of byte 31 set");
        }
    }

    #[test]
    fn sub_secret_key_signs_and_verifies() {
        let parent = SecretKey::generate();
        let sub = SubSecretKey::from_scalar(*parent.to_private().as_bytes());

        assert_eq!(sub.to_public(), parent.public_key());

        let msg = b"introset payload";
        let sig = sub.sign(msg);
        assert!(sub.to_public().verify(msg, &sig));
    }

    #[test]
    fn sub_secret_key_recalculate_deterministic() {
        let parent = SecretKey::generate();
        let scalar = *parent.to_private().as_bytes();
        let a = SubSecretKey::from_scalar(scalar);
        let mut b = SubSecretKey::from_scalar(scalar);
        b.recalculate();
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn xor_distance_properties() {
        let a = SecretKey::generate().public_key();
        let b = SecretKey::generate().public_key();

        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
        assert_eq!(a.xor_distance(&a), [0u8; 32]);

        let mut expected = [0u8; 32];
        for (i, byte) in expected.iter_mut().enumerate() {
            *byte = a.as_bytes()[i] ^ b.as_bytes()[i];
        }
        assert_eq!(a.xor_distance(&b), expected);
    }

    #[test]
    fn router_id_hex_roundtrip() {
        let id = SecretKey::generate().public_key();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(RouterId::from_hex(&hex).unwrap(), id);

        assert!(RouterId::from_hex("abcd").is_err());
        assert!(RouterId::from_hex(&"g".repeat(64)).is_err());
    }

    #[test]
    fn is_valid_rejects_garbage() {
        assert!(!RouterId::from_bytes([0u8; 32]).is_valid());
        assert!(SecretKey::generate().public_key().is_valid());
    }
}
