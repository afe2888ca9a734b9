//! # Path Builder and Forwarder
//!
//! Paths are ordered chains of 1..=8 relays carrying layered-encrypted frames.
//! The builder negotiates one symmetric key per hop through X25519 against
//! each hop's advertised encryption key, sealed into per-hop build records
//! that relays peel in order. Traffic then flows in two directions:
//!
//! - **upstream** (owner → terminal): the owner wraps the payload in one
//!   layer per hop, innermost for the terminal; each relay strips its layer
//!   and forwards
//! - **downstream** (replies): each relay adds its layer on the way back and
//!   the owner peels them all
//!
//! Hop selection: distinct routers, allowed by policy, fresh RCs, not
//! profiled bad, not on the caller's blacklist, preferring routers not
//! already carrying live paths. `strict-connect` pins the first hop; exit
//! paths pin the last hop to an exit-capable router.
//!
//! Relays keep a [`TransitContext`]: the per-hop key table that strips or
//! wraps layers and forwards between neighbors.

use std::collections::{HashMap, HashSet};

use rand::seq::SliceRandom;
use rand::RngCore;
use tracing::{debug, info, trace, warn};

use crate::crypto::{Crypto, NONCE_SIZE};
use crate::error::RouterError;
use crate::identity::{RouterId, SecretKey};
use crate::messages::{LinkMessage, PathBuildInfo, PathBuildRecord, PathId};
use crate::profiling::Profiling;
use crate::rc::{RcPolicy, RcStore, RouterContact};

/// Default lifetime of a built path.
pub const PATH_LIFETIME: u64 = 10 * 60 * 1000;

/// Rebuild window: a path this close to expiry stops being counted as live.
pub const PATH_EXPIRY_SLACK: u64 = 60 * 1000;

/// A path build must confirm within this deadline.
pub const PATH_BUILD_TIMEOUT: u64 = 30_000;

/// Derivation context for per-hop keys.
const HOP_KEY_CONTEXT: &str = "veilnet path hop key v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathStatus {
    Building,
    Established,
    Failed,
}

/// One hop of an owned path.
pub struct PathHop {
    pub router: RouterId,
    /// Path id on the side facing us.
    pub rx_id: PathId,
    /// Path id on the side facing the next hop.
    pub tx_id: PathId,
    key: [u8; 32],
}

/// A path we own.
pub struct Path {
    pub hops: Vec<PathHop>,
    pub status: PathStatus,
    pub built_at: u64,
    pub expires_at: u64,
}

impl Path {
    /// The id the first hop knows us by; our handle for the whole path.
    pub fn id(&self) -> PathId {
        self.hops[0].rx_id
    }

    pub fn first_hop(&self) -> RouterId {
        self.hops[0].router
    }

    pub fn terminal(&self) -> RouterId {
        self.hops.last().expect("paths have at least one hop").router
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    /// Established and not about to expire.
    pub fn is_usable(&self, now: u64) -> bool {
        self.status == PathStatus::Established
            && now + PATH_EXPIRY_SLACK < self.expires_at
    }
}

fn random_path_id() -> PathId {
    let mut id = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut id);
    id
}

/// One onion layer: nonce then ciphertext.
fn wrap_layer(crypto: &Crypto, key: &[u8; 32], payload: &[u8]) -> Vec<u8> {
    let nonce = crypto.random_nonce();
    let sealed = crypto.seal(key, &nonce, &[], payload);
    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    out
}

fn peel_layer(crypto: &Crypto, key: &[u8; 32], payload: &[u8]) -> Option<Vec<u8>> {
    if payload.len() < NONCE_SIZE {
        return None;
    }
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&payload[..NONCE_SIZE]);
    crypto.open(key, &nonce, &[], &payload[NONCE_SIZE..])
}

/// Constraints a build request imposes beyond global policy.
#[derive(Default)]
pub struct HopSelection {
    /// Routers this path must avoid.
    pub blacklist: HashSet<RouterId>,
    /// Terminal must be exit-capable.
    pub require_exit: bool,
}

/// Builder and owner-side forwarder.
pub struct PathContext {
    crypto: Crypto,
    hops_per_path: usize,
    paths_wanted: usize,
    paths: HashMap<PathId, Path>,
    /// Owner-side outbound traffic waiting for the next pump.
    upstream_queue: Vec<(PathId, Vec<u8>)>,
    /// Peeled reply payloads waiting for the next pump.
    downstream_ready: Vec<(PathId, Vec<u8>)>,
}

impl PathContext {
    pub fn new(crypto: Crypto, hops_per_path: usize, paths_wanted: usize) -> Self {
        Self {
            crypto,
            hops_per_path,
            paths_wanted,
            paths: HashMap::new(),
            upstream_queue: Vec::new(),
            downstream_ready: Vec::new(),
        }
    }

    pub fn num_paths(&self) -> usize {
        self.paths.len()
    }

    pub fn num_usable(&self, now: u64) -> usize {
        self.paths.values().filter(|p| p.is_usable(now)).count()
    }

    /// How many builds to start to reach the target, counting in-flight ones.
    pub fn builds_needed(&self, now: u64) -> usize {
        let live = self
            .paths
            .values()
            .filter(|p| p.is_usable(now) || p.status == PathStatus::Building)
            .count();
        self.paths_wanted.saturating_sub(live)
    }

    pub fn get(&self, id: &PathId) -> Option<&Path> {
        self.paths.get(id)
    }

    /// Pick hops and assemble the build message for the first hop.
    /// Returns `(first_hop, build_message, path_id)`.
    pub fn build_path(
        &mut self,
        store: &RcStore,
        profiling: &Profiling,
        selection: &HopSelection,
        now: u64,
    ) -> Result<(RouterId, LinkMessage, PathId), RouterError> {
        let routers = self.select_hops(store, profiling, selection, now)?;

        // Per-hop ids: hop_i's tx id is hop_{i+1}'s rx id.
        let mut ids: Vec<PathId> = (0..=routers.len()).map(|_| random_path_id()).collect();
        ids[routers.len()] = [0u8; 16];

        let mut hops = Vec::with_capacity(routers.len());
        let mut records = Vec::with_capacity(routers.len());
        for (i, rc) in routers.iter().enumerate() {
            let ephemeral = self.crypto.ephemeral_secret();
            let shared = self.crypto.dh(&ephemeral, &rc.enckey);
            let key = self.crypto.derive_key(HOP_KEY_CONTEXT, &shared);

            let info = PathBuildInfo {
                rx_id: ids[i],
                tx_id: ids[i + 1],
                next_hop: routers.get(i + 1).map(|rc| rc.pubkey),
                lifetime_ms: PATH_LIFETIME,
            };
            let plaintext =
                bincode::serialize(&info).expect("build info serialization is infallible");
            let nonce = self.crypto.random_nonce();
            let ciphertext = self.crypto.seal(&key, &nonce, &[], &plaintext);
            records.push(PathBuildRecord {
                ephemeral: self.crypto.dh_public(&ephemeral),
                nonce,
                ciphertext,
            });
            hops.push(PathHop {
                router: rc.pubkey,
                rx_id: ids[i],
                tx_id: ids[i + 1],
                key,
            });
        }

        let path = Path {
            hops,
            status: PathStatus::Building,
            built_at: now,
            expires_at: now + PATH_LIFETIME,
        };
        let path_id = path.id();
        let first_hop = path.first_hop();
        info!(
            path = %hex::encode(&path_id[..8]),
            hops = path.hops.len(),
            "building path"
        );
        self.paths.insert(path_id, path);

        Ok((first_hop, LinkMessage::PathBuild { records }, path_id))
    }

    fn select_hops(
        &self,
        store: &RcStore,
        profiling: &Profiling,
        selection: &HopSelection,
        now: u64,
    ) -> Result<Vec<RouterContact>, RouterError> {
        let policy: &RcPolicy = store.policy();

        // Count how often each router already carries one of our live paths,
        // to spread hops across the network.
        let mut usage: HashMap<RouterId, usize> = HashMap::new();
        for path in self.paths.values() {
            for hop in &path.hops {
                *usage.entry(hop.router).or_default() += 1;
            }
        }

        let usable = |rc: &RouterContact| {
            policy.hop_is_allowed(&rc.pubkey)
                && !rc.expires_soon(now, 0)
                && !profiling.is_bad(&rc.pubkey)
                && !selection.blacklist.contains(&rc.pubkey)
        };

        let mut candidates: Vec<RouterContact> = store
            .snapshot()
            .into_iter()
            .filter(usable)
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        // Least-used first; shuffle above breaks ties randomly.
        candidates.sort_by_key(|rc| usage.get(&rc.pubkey).copied().unwrap_or(0));

        let mut hops: Vec<RouterContact> = Vec::with_capacity(self.hops_per_path);

        // Terminal for exit paths must be exit-capable; reserve it first so
        // the only exit in sight is not burned on an earlier position.
        let terminal = if selection.require_exit && self.hops_per_path > 1 {
            match candidates.iter().find(|rc| rc.is_exit()).cloned() {
                Some(rc) => Some(rc),
                None => return Err(RouterError::PathBuildFail),
            }
        } else {
            None
        };

        // First hop honors strict-connect.
        let first = candidates
            .iter()
            .filter(|rc| {
                policy.strict_connect.is_empty() || policy.strict_connect.contains(&rc.pubkey)
            })
            .find(|rc| terminal.as_ref().map(|t| t.pubkey) != Some(rc.pubkey))
            .cloned();
        let Some(first) = first else {
            return Err(RouterError::PathBuildFail);
        };
        hops.push(first);

        let middle_needed = self.hops_per_path - 1 - usize::from(terminal.is_some());
        for rc in candidates {
            if hops.len() >= 1 + middle_needed {
                break;
            }
            if hops.iter().any(|h| h.pubkey == rc.pubkey) {
                continue;
            }
            if let Some(t) = &terminal {
                if t.pubkey == rc.pubkey {
                    continue;
                }
            }
            hops.push(rc);
        }
        if let Some(t) = terminal {
            hops.push(t);
        }

        if hops.len() != self.hops_per_path {
            debug!(
                selected = hops.len(),
                wanted = self.hops_per_path,
                "not enough usable routers for path"
            );
            return Err(RouterError::PathBuildFail);
        }
        Ok(hops)
    }

    /// The terminal confirmed the build.
    pub fn handle_confirm(&mut self, path_id: PathId, now: u64) -> bool {
        let Some(path) = self.paths.get_mut(&path_id) else {
            return false;
        };
        if path.status != PathStatus::Building {
            return false;
        }
        path.status = PathStatus::Established;
        path.built_at = now;
        path.expires_at = now + PATH_LIFETIME;
        info!(path = %hex::encode(&path_id[..8]), "path established");
        true
    }

    /// Queue an upstream payload; emitted at the next pump.
    pub fn queue_upstream(&mut self, path_id: PathId, payload: Vec<u8>) {
        self.upstream_queue.push((path_id, payload));
    }

    /// Wrap and emit everything queued upstream. Returns `(first_hop,
    /// message)` pairs for the dispatcher.
    pub fn pump_upstream(&mut self, now: u64) -> Vec<(RouterId, LinkMessage)> {
        let queued = std::mem::take(&mut self.upstream_queue);
        let mut out = Vec::with_capacity(queued.len());
        for (path_id, payload) in queued {
            let Some(path) = self.paths.get(&path_id) else {
                trace!(path = %hex::encode(&path_id[..8]), "upstream for unknown path dropped");
                continue;
            };
            if !path.is_usable(now) {
                continue;
            }
            let mut wrapped = payload;
            for hop in path.hops.iter().rev() {
                wrapped = wrap_layer(&self.crypto, &hop.key, &wrapped);
            }
            out.push((
                path.first_hop(),
                LinkMessage::PathUpstream {
                    path_id,
                    payload: wrapped,
                },
            ));
        }
        out
    }

    /// Ingest a downstream frame from our first hop: peel every layer.
    pub fn handle_downstream(&mut self, path_id: PathId, payload: Vec<u8>) {
        let Some(path) = self.paths.get(&path_id) else {
            trace!(path = %hex::encode(&path_id[..8]), "downstream for unknown path dropped");
            return;
        };
        let mut peeled = payload;
        for hop in &path.hops {
            match peel_layer(&self.crypto, &hop.key, &peeled) {
                Some(p) => peeled = p,
                None => {
                    warn!(path = %hex::encode(&path_id[..8]), "downstream layer failed to open");
                    return;
                }
            }
        }
        self.downstream_ready.push((path_id, peeled));
    }

    /// Fully peeled reply payloads.
    pub fn pump_downstream(&mut self) -> Vec<(PathId, Vec<u8>)> {
        std::mem::take(&mut self.downstream_ready)
    }

    /// Drop expired paths and time out stuck builds.
    pub fn expire_paths(&mut self, now: u64) -> usize {
        let before = self.paths.len();
        self.paths.retain(|id, path| {
            if path.status == PathStatus::Building
                && now.saturating_sub(path.built_at) > PATH_BUILD_TIMEOUT
            {
                debug!(path = %hex::encode(&id[..8]), "path build timed out");
                return false;
            }
            !path.is_expired(now)
        });
        before - self.paths.len()
    }

    /// Routers used by any live path; fed to profiling on success/failure.
    pub fn routers_in_use(&self) -> HashSet<RouterId> {
        self.paths
            .values()
            .flat_map(|p| p.hops.iter().map(|h| h.router))
            .collect()
    }
}

// ============================================================================
// Transit (relay side)
// ============================================================================

struct TransitHop {
    prev_hop: RouterId,
    next_hop: Option<RouterId>,
    rx_id: PathId,
    tx_id: PathId,
    key: [u8; 32],
    expires_at: u64,
}

/// What the relay should do with a processed transit frame.
#[derive(Debug)]
pub enum TransitAction {
    /// Forward this message to the given router.
    Forward(RouterId, LinkMessage),
    /// We are the terminal; the payload surfaced here.
    Deliver(PathId, Vec<u8>),
    /// Frame dropped.
    None,
}

/// Relay-side table of paths we carry for others.
pub struct TransitContext {
    crypto: Crypto,
    encryption: SecretKey,
    allow_transit: bool,
    /// Upstream direction, keyed by the id facing the previous hop.
    by_rx: HashMap<PathId, TransitHop>,
    /// Downstream direction: id facing the next hop → rx id.
    tx_index: HashMap<PathId, PathId>,
}

impl TransitContext {
    pub fn new(crypto: Crypto, encryption: SecretKey, allow_transit: bool) -> Self {
        Self {
            crypto,
            encryption,
            allow_transit,
            by_rx: HashMap::new(),
            tx_index: HashMap::new(),
        }
    }

    pub fn allow_transit(&mut self) {
        self.allow_transit = true;
    }

    pub fn num_transit(&self) -> usize {
        self.by_rx.len()
    }

    /// Process a path build: peel our record, install the hop, and either
    /// forward the rest or confirm as terminal.
    pub fn handle_build(
        &mut self,
        from: RouterId,
        mut records: Vec<PathBuildRecord>,
        now: u64,
    ) -> TransitAction {
        if !self.allow_transit {
            trace!(%from, "transit not allowed, dropping path build");
            return TransitAction::None;
        }
        if records.is_empty() {
            return TransitAction::None;
        }
        let record = records.remove(0);

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&self.encryption.as_bytes()[..32]);
        let shared = self.crypto.dh(&secret, &record.ephemeral);
        let key = self.crypto.derive_key(HOP_KEY_CONTEXT, &shared);
        let Some(plaintext) = self
            .crypto
            .open(&key, &record.nonce, &[], &record.ciphertext)
        else {
            warn!(%from, "path build record failed to open");
            return TransitAction::None;
        };
        let Ok(info) = crate::messages::deserialize_bounded::<PathBuildInfo>(&plaintext) else {
            warn!(%from, "malformed path build info");
            return TransitAction::None;
        };
        if self.by_rx.contains_key(&info.rx_id) {
            debug!(%from, "duplicate path id in build, dropping");
            return TransitAction::None;
        }

        let lifetime = info.lifetime_ms.min(PATH_LIFETIME);
        let hop = TransitHop {
            prev_hop: from,
            next_hop: info.next_hop,
            rx_id: info.rx_id,
            tx_id: info.tx_id,
            key,
            expires_at: now + lifetime,
        };
        let rx_id = hop.rx_id;
        let tx_id = hop.tx_id;
        let next_hop = hop.next_hop;
        self.by_rx.insert(rx_id, hop);
        if next_hop.is_some() {
            self.tx_index.insert(tx_id, rx_id);
        }

        match next_hop {
            Some(next) => TransitAction::Forward(next, LinkMessage::PathBuild { records }),
            None => {
                // Terminal hop: confirm back toward the owner.
                debug!(%from, path = %hex::encode(&rx_id[..8]), "transit path terminates here");
                TransitAction::Forward(from, LinkMessage::PathConfirm { path_id: rx_id })
            }
        }
    }

    /// A confirm flowing back toward the owner maps tx→rx at each hop.
    pub fn handle_confirm(&mut self, from: RouterId, path_id: PathId) -> TransitAction {
        let Some(rx_id) = self.tx_index.get(&path_id) else {
            return TransitAction::None;
        };
        let Some(hop) = self.by_rx.get(rx_id) else {
            return TransitAction::None;
        };
        if hop.next_hop != Some(from) {
            return TransitAction::None;
        }
        TransitAction::Forward(hop.prev_hop, LinkMessage::PathConfirm { path_id: hop.rx_id })
    }

    /// Strip our layer and forward upstream, or deliver at the terminal.
    pub fn handle_upstream(
        &mut self,
        from: RouterId,
        path_id: PathId,
        payload: Vec<u8>,
        now: u64,
    ) -> TransitAction {
        let Some(hop) = self.by_rx.get(&path_id) else {
            trace!(path = %hex::encode(&path_id[..8]), "upstream for unknown transit path");
            return TransitAction::None;
        };
        if hop.prev_hop != from || now >= hop.expires_at {
            return TransitAction::None;
        }
        let Some(stripped) = peel_layer(&self.crypto, &hop.key, &payload) else {
            debug!(path = %hex::encode(&path_id[..8]), "upstream layer failed to open");
            return TransitAction::None;
        };
        match hop.next_hop {
            Some(next) => TransitAction::Forward(
                next,
                LinkMessage::PathUpstream {
                    path_id: hop.tx_id,
                    payload: stripped,
                },
            ),
            None => TransitAction::Deliver(path_id, stripped),
        }
    }

    /// Wrap our layer and forward downstream toward the owner.
    pub fn handle_downstream(
        &mut self,
        from: RouterId,
        path_id: PathId,
        payload: Vec<u8>,
        now: u64,
    ) -> TransitAction {
        let Some(rx_id) = self.tx_index.get(&path_id) else {
            return TransitAction::None;
        };
        let Some(hop) = self.by_rx.get(rx_id) else {
            return TransitAction::None;
        };
        if hop.next_hop != Some(from) || now >= hop.expires_at {
            return TransitAction::None;
        }
        let wrapped = wrap_layer(&self.crypto, &hop.key, &payload);
        TransitAction::Forward(
            hop.prev_hop,
            LinkMessage::PathDownstream {
                path_id: hop.rx_id,
                payload: wrapped,
            },
        )
    }

    /// Originate a downstream reply at the terminal hop of `path_id`.
    pub fn originate_downstream(&self, path_id: PathId, payload: Vec<u8>) -> TransitAction {
        let Some(hop) = self.by_rx.get(&path_id) else {
            return TransitAction::None;
        };
        if hop.next_hop.is_some() {
            return TransitAction::None;
        }
        let wrapped = wrap_layer(&self.crypto, &hop.key, &payload);
        TransitAction::Forward(
            hop.prev_hop,
            LinkMessage::PathDownstream {
                path_id: hop.rx_id,
                payload: wrapped,
            },
        )
    }

    pub fn expire(&mut self, now: u64) {
        let dead: Vec<PathId> = self
            .by_rx
            .values()
            .filter(|h| now >= h.expires_at)
            .map(|h| h.rx_id)
            .collect();
        for rx_id in dead {
            if let Some(hop) = self.by_rx.remove(&rx_id) {
                self.tx_index.remove(&hop.tx_id);
            }
        }
    }
}
