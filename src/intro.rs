//! # Hidden-Service Introductions
//!
//! An [`Introduction`] advertises "send traffic addressed to me to this
//! router on this path". An [`IntroSet`] is the signed list of a hidden
//! service's currently valid introductions. What the DHT actually stores is
//! an [`EncryptedIntroSet`]: the introset sealed under a key derived from the
//! service address and re-signed by a per-address derived signing key, so DHT
//! nodes can validate and order records without learning their contents.

use serde::{Deserialize, Serialize};

use crate::crypto::{Crypto, INTROSET_SIGNATURE_DOMAIN, NONCE_SIZE};
use crate::identity::{DhtKey, RouterId, SecretKey};
use crate::messages::PathId;

/// Clock-skew slack for validating received introsets. A record may not claim
/// to expire further than this past the local notion of now.
pub const MAX_INTROSET_TIME_DELTA: u64 = 10 * 60 * 1000;

/// `(router, path)` pair a client can be reached through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Introduction {
    pub router: RouterId,
    pub path_id: PathId,
    pub expires_at: u64,
    pub version: u64,
}

impl Introduction {
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Signed per-hidden-service record listing live introductions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntroSet {
    /// Service address: hash of the owner signing key.
    pub address: [u8; 32],
    /// The service's long-lived signing key.
    pub owner_key: RouterId,
    pub intros: Vec<Introduction>,
    pub topic: Option<String>,
    pub version: u64,
    /// Optional proof-of-work stamp; carried but not currently enforced.
    pub pow: Option<u64>,
    pub expires_at: u64,
    pub signature: Vec<u8>,
}

impl IntroSet {
    /// Assemble and sign an introset from live introductions. The expiry is
    /// the latest introduction expiry.
    pub fn create(
        crypto: &Crypto,
        owner: &SecretKey,
        intros: Vec<Introduction>,
        topic: Option<String>,
    ) -> Self {
        let owner_key = owner.public_key();
        let address = crypto.hash(owner_key.as_bytes());
        let expires_at = intros.iter().map(|i| i.expires_at).max().unwrap_or(0);
        let mut set = Self {
            address,
            owner_key,
            intros,
            topic,
            version: crate::messages::PROTOCOL_VERSION,
            pow: None,
            expires_at,
            signature: Vec::new(),
        };
        let payload = set.signed_payload();
        set.signature = crypto.sign(owner, INTROSET_SIGNATURE_DOMAIN, &payload);
        set
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).expect("introset serialization is infallible")
    }

    pub fn verify(&self, crypto: &Crypto, now: u64) -> bool {
        if self.intros.is_empty() || self.is_expired(now) {
            return false;
        }
        if crypto.hash(self.owner_key.as_bytes()) != self.address {
            return false;
        }
        crypto
            .verify(
                &self.owner_key,
                INTROSET_SIGNATURE_DOMAIN,
                &self.signed_payload(),
                &self.signature,
            )
            .is_ok()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }
}

/// Introset sealed for DHT storage.
///
/// The derived signing key is computed deterministically from the owner key
/// and the service address, so the same service always publishes under the
/// same DHT key, and validators only ever see the derived key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedIntroSet {
    pub derived_signing_key: RouterId,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    pub expires_at: u64,
    pub signature: Vec<u8>,
}

impl EncryptedIntroSet {
    /// Seal `introset` under its service address and sign with the derived
    /// per-address key.
    pub fn seal(crypto: &Crypto, owner: &SecretKey, introset: &IntroSet) -> Self {
        let subkey = crypto.derive_subkey(owner, &introset.address);
        let enc_key = crypto.derive_key("veilnet introset sealing", &introset.address);
        let nonce = crypto.random_nonce();
        let plaintext =
            bincode::serialize(introset).expect("introset serialization is infallible");
        let ciphertext = crypto.seal(&enc_key, &nonce, &[], &plaintext);

        let mut sealed = Self {
            derived_signing_key: subkey.to_public(),
            nonce,
            ciphertext,
            expires_at: introset.expires_at,
            signature: Vec::new(),
        };
        let payload = sealed.signed_payload();
        sealed.signature = crypto.sign_sub(&subkey, INTROSET_SIGNATURE_DOMAIN, &payload);
        sealed
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).expect("encrypted introset serialization is infallible")
    }

    /// The DHT key this record lives under.
    pub fn dht_key(&self) -> DhtKey {
        self.derived_signing_key.as_dht_key()
    }

    /// Full validation for storage and propagation: signature under the
    /// derived key, not yet expired, and not claiming an expiry further than
    /// the clock-skew slack into the future.
    pub fn verify(&self, crypto: &Crypto, now: u64) -> bool {
        if self.is_expired(now) {
            return false;
        }
        if self.expires_at > now + MAX_INTROSET_TIME_DELTA {
            return false;
        }
        crypto
            .verify(
                &self.derived_signing_key,
                INTROSET_SIGNATURE_DOMAIN,
                &self.signed_payload(),
                &self.signature,
            )
            .is_ok()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at <= now
    }

    /// Newest-wins ordering at one DHT key.
    pub fn other_is_newer(&self, other: &EncryptedIntroSet) -> bool {
        other.expires_at > self.expires_at
    }

    /// Open the sealed introset. Any holder of the service address can open;
    /// confidentiality comes from the address being unguessable.
    pub fn open(&self, crypto: &Crypto, address: &[u8; 32]) -> Option<IntroSet> {
        let enc_key = crypto.derive_key("veilnet introset sealing", address);
        let plaintext = crypto.open(&enc_key, &self.nonce, &[], &self.ciphertext)?;
        crate::messages::deserialize_bounded(&plaintext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ms;

    fn test_intro(router_seed: u8, expires_at: u64) -> Introduction {
        Introduction {
            router: RouterId::from_bytes([router_seed; 32]),
            path_id: [router_seed; 16],
            expires_at,
            version: crate::messages::PROTOCOL_VERSION,
        }
    }

    fn test_introset(crypto: &Crypto, owner: &SecretKey, expires_at: u64) -> IntroSet {
        IntroSet::create(
            crypto,
            owner,
            vec![test_intro(1, expires_at), test_intro(2, expires_at)],
            None,
        )
    }

    #[test]
    fn introset_signs_and_verifies() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let set = test_introset(&crypto, &owner, now + 60_000);

        assert!(set.verify(&crypto, now));
    }

    #[test]
    fn introset_tamper_detected() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let mut set = test_introset(&crypto, &owner, now + 60_000);

        set.intros[0].router = RouterId::from_bytes([9; 32]);
        assert!(!set.verify(&crypto, now));
    }

    #[test]
    fn expired_introset_fails_verify() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let set = test_introset(&crypto, &owner, now.saturating_sub(1));

        assert!(!set.verify(&crypto, now));
    }

    #[test]
    fn sealed_introset_verifies_and_opens() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let set = test_introset(&crypto, &owner, now + 60_000);
        let sealed = EncryptedIntroSet::seal(&crypto, &owner, &set);

        assert!(sealed.verify(&crypto, now));

        let opened = sealed.open(&crypto, &set.address).expect("open failed");
        assert_eq!(opened.owner_key, set.owner_key);
        assert_eq!(opened.intros, set.intros);
    }

    #[test]
    fn sealed_introset_same_service_same_dht_key() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let a = EncryptedIntroSet::seal(&crypto, &owner, &test_introset(&crypto, &owner, now + 10_000));
        let b = EncryptedIntroSet::seal(&crypto, &owner, &test_introset(&crypto, &owner, now + 20_000));

        assert_eq!(a.dht_key(), b.dht_key());
        assert!(a.other_is_newer(&b));
        assert!(!b.other_is_newer(&a));
    }

    #[test]
    fn sealed_introset_rejects_far_future_expiry() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let set = test_introset(&crypto, &owner, now + MAX_INTROSET_TIME_DELTA + 60_000);
        let sealed = EncryptedIntroSet::seal(&crypto, &owner, &set);

        assert!(!sealed.verify(&crypto, now));
        // A later clock inside the slack window accepts it.
        assert!(sealed.verify(&crypto, now + 120_000));
    }

    #[test]
    fn sealed_introset_tamper_detected() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let set = test_introset(&crypto, &owner, now + 60_000);
        let mut sealed = EncryptedIntroSet::seal(&crypto, &owner, &set);

        sealed.expires_at += 1;
        assert!(!sealed.verify(&crypto, now));
    }

    #[test]
    fn open_with_wrong_address_fails() {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let now = now_ms();
        let set = test_introset(&crypto, &owner, now + 60_000);
        let sealed = EncryptedIntroSet::seal(&crypto, &owner, &set);

        assert!(sealed.open(&crypto, &[0u8; 32]).is_none());
    }
}
