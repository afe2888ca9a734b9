//! # Router Contacts
//!
//! A [`RouterContact`] (RC) is the signed, timestamped descriptor a router
//! advertises: identity key, encryption key, transport addresses, exit
//! capability, and network id. The [`RcStore`] is the in-memory set of every
//! RC we currently trust, indexed by identity, with XOR-closest queries for
//! the DHT and policy filters (whitelist, strict-connect, blacklist) applied
//! at insertion and connection time.
//!
//! Store invariant: an RC in the store always verifies, matches our netid,
//! and is not expired. Replacement only happens for strictly newer
//! `last_updated`.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::net::IpAddr;
use std::path::Path;

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::crypto::{Crypto, RC_SIGNATURE_DOMAIN};
use crate::error::RouterError;
use crate::identity::{distance_cmp, DhtKey, RouterId, SecretKey};

/// How long a signed RC stays valid.
pub const RC_LIFETIME: u64 = 6 * 60 * 60 * 1000;

/// Window before expiry in which an RC counts as "expiring soon"; regen fuzz
/// is added on top so a fleet of routers does not re-sign in lockstep.
pub const RC_STALE_WINDOW: u64 = 5 * 60 * 1000;

/// One advertised transport endpoint.
///
/// `dialect` names the link-layer implementation that can speak to it; when a
/// contact offers several addresses the lowest `rank` is preferred.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub dialect: String,
    /// Transport public key for this endpoint.
    pub pubkey: RouterId,
    pub rank: u16,
    pub ip: IpAddr,
    pub port: u16,
}

impl AddressInfo {
    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.ip, self.port)
    }
}

/// Exit advertisement: traffic may leave the overlay through this router.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub pubkey: RouterId,
    pub ip: IpAddr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RouterContact {
    pub pubkey: RouterId,
    /// X25519 key for onion and session encryption.
    pub enckey: [u8; 32],
    pub nickname: Option<String>,
    pub addrs: Vec<AddressInfo>,
    pub exits: Vec<ExitInfo>,
    pub netid: String,
    pub last_updated: u64,
    pub version: u64,
    pub signature: Vec<u8>,
}

impl RouterContact {
    /// Assemble an unsigned RC; call [`sign`](Self::sign) before advertising.
    pub fn new(netid: String, addrs: Vec<AddressInfo>) -> Self {
        Self {
            pubkey: RouterId::from_bytes([0; 32]),
            enckey: [0; 32],
            nickname: None,
            addrs,
            exits: Vec::new(),
            netid,
            last_updated: 0,
            version: crate::messages::PROTOCOL_VERSION,
            signature: Vec::new(),
        }
    }

    fn signed_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        unsigned.signature = Vec::new();
        bincode::serialize(&unsigned).expect("rc serialization is infallible")
    }

    /// Stamp `last_updated`, fill in the public keys, and sign with the
    /// identity key.
    pub fn sign(&mut self, crypto: &Crypto, identity: &SecretKey, enckey: [u8; 32], now: u64) {
        self.pubkey = identity.public_key();
        self.enckey = enckey;
        self.last_updated = now;
        self.signature = Vec::new();
        let payload = self.signed_payload();
        self.signature = crypto.sign(identity, RC_SIGNATURE_DOMAIN, &payload);
    }

    /// Signature and lifetime check. Netid policy lives in the store, which
    /// knows what our network is.
    pub fn verify(&self, crypto: &Crypto, now: u64) -> bool {
        if self.is_expired(now) {
            return false;
        }
        crypto
            .verify(
                &self.pubkey,
                RC_SIGNATURE_DOMAIN,
                &self.signed_payload(),
                &self.signature,
            )
            .is_ok()
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now.saturating_sub(self.last_updated) > RC_LIFETIME
    }

    /// True inside the fuzzed pre-expiry window.
    pub fn expires_soon(&self, now: u64, fuzz_ms: u64) -> bool {
        self.is_expired(now + fuzz_ms + RC_STALE_WINDOW)
    }

    pub fn age(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_updated)
    }

    pub fn time_until_expires(&self, now: u64) -> u64 {
        (self.last_updated + RC_LIFETIME).saturating_sub(now)
    }

    pub fn is_exit(&self) -> bool {
        !self.exits.is_empty()
    }

    /// Addresses usable by a link layer speaking `dialect`, best rank first.
    pub fn addresses_for(&self, dialect: &str) -> Vec<&AddressInfo> {
        let mut addrs: Vec<&AddressInfo> =
            self.addrs.iter().filter(|a| a.dialect == dialect).collect();
        addrs.sort_by_key(|a| a.rank);
        addrs
    }
}

impl PartialEq for RouterContact {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey == other.pubkey && self.last_updated == other.last_updated
    }
}

impl Eq for RouterContact {}

/// True for addresses that should never appear in a public RC.
pub fn is_bogon(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_unspecified()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_multicast()
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified() || v6.is_multicast(),
    }
}

/// Connection policy applied on top of the store contents.
#[derive(Clone, Debug, Default)]
pub struct RcPolicy {
    /// Service-node whitelist from the staking oracle; only enforced when
    /// `whitelist_enabled`.
    pub whitelist: HashSet<RouterId>,
    pub whitelist_enabled: bool,
    /// Client strict-connect set; when non-empty only these may be dialed.
    pub strict_connect: HashSet<RouterId>,
    pub blacklist: HashSet<RouterId>,
    /// Bootstrap nodes are exempt from whitelist purges.
    pub bootstrap: HashSet<RouterId>,
}

impl RcPolicy {
    /// Whether we may open a session to `id`. Strict-connect restricts whom
    /// a client dials directly.
    pub fn remote_is_allowed(&self, id: &RouterId) -> bool {
        if !self.strict_connect.is_empty() && !self.strict_connect.contains(id) {
            return false;
        }
        self.hop_is_allowed(id)
    }

    /// Whether `id` may appear as a path hop. Strict-connect binds only the
    /// first hop (which is a direct session), so it is not consulted here.
    pub fn hop_is_allowed(&self, id: &RouterId) -> bool {
        if self.blacklist.contains(id) {
            return false;
        }
        if self.whitelist_enabled {
            return self.whitelist.contains(id) || self.bootstrap.contains(id);
        }
        true
    }

    pub fn is_bootstrap(&self, id: &RouterId) -> bool {
        self.bootstrap.contains(id)
    }
}

/// In-memory RC set. Owned by the logic lane; disk caching works on
/// snapshots handed to the disk worker.
pub struct RcStore {
    crypto: Crypto,
    netid: String,
    block_bogons: bool,
    entries: HashMap<RouterId, RouterContact>,
    policy: RcPolicy,
}

impl RcStore {
    pub fn new(crypto: Crypto, netid: String, block_bogons: bool, policy: RcPolicy) -> Self {
        Self {
            crypto,
            netid,
            block_bogons,
            entries: HashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &RcPolicy {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut RcPolicy {
        &mut self.policy
    }

    /// Insert or replace. Accepted iff the RC verifies, carries our netid,
    /// passes bogon policy, and is strictly newer than any stored copy.
    pub fn insert(&mut self, rc: RouterContact, now: u64) -> Result<(), RouterError> {
        if rc.netid != self.netid {
            debug!(peer = %rc.pubkey, netid = %rc.netid, "rc rejected: wrong netid");
            return Err(RouterError::PeerNotAllowed);
        }
        if rc.is_expired(now) {
            return Err(RouterError::Expired);
        }
        if !rc.verify(&self.crypto, now) {
            warn!(peer = %rc.pubkey, "rc rejected: bad signature");
            return Err(RouterError::CryptoVerifyFail);
        }
        if self.block_bogons && rc.addrs.iter().any(|a| is_bogon(a.ip)) {
            debug!(peer = %rc.pubkey, "rc rejected: bogon address");
            return Err(RouterError::PeerNotAllowed);
        }
        if let Some(existing) = self.entries.get(&rc.pubkey) {
            if rc.last_updated <= existing.last_updated {
                return Err(RouterError::Duplicate);
            }
        }
        self.entries.insert(rc.pubkey, rc);
        Ok(())
    }

    pub fn get(&self, id: &RouterId) -> Option<&RouterContact> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RouterId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Policy-driven purge. Returns how many entries were dropped.
    pub fn remove_if(&mut self, mut pred: impl FnMut(&RouterContact) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, rc| !pred(rc));
        before - self.entries.len()
    }

    /// Drop expired RCs.
    pub fn expire(&mut self, now: u64) -> usize {
        self.remove_if(|rc| rc.is_expired(now))
    }

    /// The `n` RCs with smallest XOR distance between pubkey and `key`.
    /// Returns exactly `min(n, len)` entries, closest first.
    pub fn find_closest_to(&self, key: &DhtKey, n: usize) -> Vec<RouterContact> {
        if n == 0 {
            return Vec::new();
        }

        #[derive(PartialEq, Eq)]
        struct DistEntry {
            dist: DhtKey,
            rc: RouterContact,
        }

        impl Ord for DistEntry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                distance_cmp(&self.dist, &other.dist)
            }
        }

        impl PartialOrd for DistEntry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<DistEntry> = BinaryHeap::with_capacity(n + 1);
        for rc in self.entries.values() {
            let dist = crate::identity::xor_distance(&rc.pubkey.as_dht_key(), key);
            if heap.len() < n {
                heap.push(DistEntry {
                    dist,
                    rc: rc.clone(),
                });
            } else if let Some(max) = heap.peek() {
                if distance_cmp(&dist, &max.dist) == std::cmp::Ordering::Less {
                    heap.push(DistEntry {
                        dist,
                        rc: rc.clone(),
                    });
                    heap.pop();
                }
            }
        }

        let mut result: Vec<RouterContact> = heap.into_iter().map(|e| e.rc).collect();
        result.sort_by(|a, b| {
            let da = crate::identity::xor_distance(&a.pubkey.as_dht_key(), key);
            let db = crate::identity::xor_distance(&b.pubkey.as_dht_key(), key);
            distance_cmp(&da, &db)
        });
        result
    }

    /// A random whitelisted router (service-node side only).
    pub fn random_whitelisted(&self) -> Option<RouterContact> {
        self.entries
            .values()
            .filter(|rc| self.policy.whitelist.contains(&rc.pubkey))
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// A random stored router passing the connection policy.
    pub fn random_allowed(&self, exclude: &HashSet<RouterId>) -> Option<RouterContact> {
        self.entries
            .values()
            .filter(|rc| self.policy.remote_is_allowed(&rc.pubkey) && !exclude.contains(&rc.pubkey))
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    /// Copy of the current entries for the disk worker.
    pub fn snapshot(&self) -> Vec<RouterContact> {
        self.entries.values().cloned().collect()
    }
}

// ============================================================================
// Disk cache (one file per RC under netdb/)
// ============================================================================

fn rc_file_name(id: &RouterId) -> String {
    format!("{}.signed", id.to_hex())
}

/// Write one RC into the cache directory. Runs on the disk worker.
pub fn store_rc_file(dir: &Path, rc: &RouterContact) -> std::io::Result<()> {
    let bytes = bincode::serialize(rc)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(dir.join(rc_file_name(&rc.pubkey)), bytes)
}

/// Read a single RC file (also used for `bootstrap.add-node`).
pub fn load_rc_file(path: &Path) -> std::io::Result<RouterContact> {
    let bytes = std::fs::read(path)?;
    crate::messages::deserialize_bounded(&bytes)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Read every RC in the cache directory, skipping unreadable files.
pub fn load_rc_cache(dir: &Path) -> Vec<RouterContact> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().map(|e| e == "signed").unwrap_or(false) {
            match load_rc_file(&path) {
                Ok(rc) => out.push(rc),
                Err(e) => debug!(file = %path.display(), error = %e, "skipping bad rc cache file"),
            }
        }
    }
    out
}
