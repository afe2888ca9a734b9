//! # DHT Core
//!
//! Kademlia-flavored, but simplified: the routing table is the set of RCs we
//! hold, so RC lifetime and DHT membership are the same fact. Storage splits
//! into the router node table (this context's own view of live peers) and the
//! services table (derived signing key → encrypted introset, newest-wins).
//!
//! ## Propagation
//!
//! `PublishIntro` walks the four routers closest to the introset key. A
//! relayed publish (`relayed=true`, `relay_order ∈ {0,1}`) selects the pair
//! `(closest[0], closest[1])` or `(closest[2], closest[3])`; each member
//! either stores locally (if it is us) or receives a non-relayed copy.
//! A non-relayed publish stores when we are among the closest four, else
//! forwards the pair once more. Termination rests on the relayed→non-relayed
//! step; [`MAX_PROPAGATION_DEPTH`] is declared for a future hop counter but
//! not enforced.
//!
//! ## Transactions
//!
//! Every outbound request allocates a process-unique, monotonically
//! increasing txid. A TX record tracks who asked (for bridged requests),
//! which peers were already asked, the values found, and a hard deadline.
//! Expiry fires the completion with no values and acknowledges any upstream
//! asker with an empty `GotIntro` so it is never left waiting. Replies to a
//! closed TX are discarded.

use std::collections::{HashMap, HashSet};

use rand::RngCore;
use tracing::{debug, trace, warn};

use crate::crypto::Crypto;
use crate::identity::{distance_cmp, xor_distance, DhtKey, RouterId};
use crate::intro::EncryptedIntroSet;
use crate::messages::{DhtMessage, PROTOCOL_VERSION};
use crate::rc::{RcStore, RouterContact};

/// Peers asked per lookup before giving up.
pub const DHT_K: usize = 4;

/// Closest-router set size used by publish propagation.
const CLOSEST_SET: usize = 4;

/// Outstanding requests expire after this long.
pub const TX_DEADLINE: u64 = 5_000;

/// Reserved for future depth tracking on forwarded publishes; propagation
/// currently terminates through the relayed→non-relayed step alone.
pub const MAX_PROPAGATION_DEPTH: u64 = 5;

/// Completion for an introset lookup or publish.
pub type IntroLookupHandler = Box<dyn FnOnce(Vec<EncryptedIntroSet>) + Send + 'static>;

/// Completion for a router lookup.
pub type RouterLookupHandler = Box<dyn FnOnce(Vec<RouterContact>) + Send + 'static>;

/// Who is waiting on a transaction: the remote router and its txid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TxOwner {
    pub node: RouterId,
    pub txid: u64,
}

struct IntroTx {
    /// Upstream asker to bridge the reply back to; `None` for local requests.
    asker: Option<TxOwner>,
    target: DhtKey,
    peers_asked: HashSet<DhtKey>,
    values_found: Vec<EncryptedIntroSet>,
    deadline: u64,
    handler: Option<IntroLookupHandler>,
}

struct RouterTx {
    target: RouterId,
    deadline: u64,
    handler: Option<RouterLookupHandler>,
}

pub struct DhtContext {
    crypto: Crypto,
    our_key: RouterId,
    /// Our own view of live peers; pruned against the session tables.
    nodes: HashMap<DhtKey, RouterContact>,
    /// Hidden-service storage.
    services: HashMap<DhtKey, EncryptedIntroSet>,
    intro_txs: HashMap<u64, IntroTx>,
    router_txs: HashMap<u64, RouterTx>,
    next_txid: u64,
    /// Messages to hand to the outbound dispatcher, drained by the router.
    outbox: Vec<(RouterId, DhtMessage)>,
}

impl DhtContext {
    pub fn new(crypto: Crypto, our_key: RouterId) -> Self {
        Self {
            crypto,
            our_key,
            nodes: HashMap::new(),
            services: HashMap::new(),
            intro_txs: HashMap::new(),
            router_txs: HashMap::new(),
            next_txid: 1,
            outbox: Vec::new(),
        }
    }

    pub fn our_key(&self) -> RouterId {
        self.our_key
    }

    fn alloc_txid(&mut self) -> u64 {
        let txid = self.next_txid;
        self.next_txid += 1;
        txid
    }

    /// Queued `(destination, message)` pairs for the dispatcher.
    pub fn take_outbox(&mut self) -> Vec<(RouterId, DhtMessage)> {
        std::mem::take(&mut self.outbox)
    }

    fn send(&mut self, to: RouterId, msg: DhtMessage) {
        self.outbox.push((to, msg));
    }

    // ------------------------------------------------------------------
    // Node table
    // ------------------------------------------------------------------

    pub fn put_node(&mut self, rc: RouterContact) {
        self.nodes.insert(rc.pubkey.as_dht_key(), rc);
    }

    pub fn del_node(&mut self, key: &DhtKey) {
        self.nodes.remove(key);
    }

    pub fn has_node(&self, key: &DhtKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Drop nodes failing `pred`; used each tick to keep the table a subset
    /// of live peers.
    pub fn retain_nodes(&mut self, mut pred: impl FnMut(&RouterContact) -> bool) {
        self.nodes.retain(|_, rc| pred(rc));
    }

    fn closest_node_excluding(
        &self,
        target: &DhtKey,
        exclude: &HashSet<DhtKey>,
    ) -> Option<RouterId> {
        self.nodes
            .values()
            .filter(|rc| !exclude.contains(&rc.pubkey.as_dht_key()))
            .min_by(|a, b| {
                let da = xor_distance(&a.pubkey.as_dht_key(), target);
                let db = xor_distance(&b.pubkey.as_dht_key(), target);
                distance_cmp(&da, &db)
            })
            .map(|rc| rc.pubkey)
    }

    // ------------------------------------------------------------------
    // Services table
    // ------------------------------------------------------------------

    /// Store an introset, keeping the newest by expiry at each key.
    pub fn store_intro(&mut self, introset: EncryptedIntroSet) -> bool {
        let key = introset.dht_key();
        if let Some(existing) = self.services.get(&key) {
            if !existing.other_is_newer(&introset) {
                return false;
            }
        }
        trace!(key = %hex::encode(&key[..8]), "storing introset");
        self.services.insert(key, introset);
        true
    }

    pub fn get_intro(&self, key: &DhtKey) -> Option<&EncryptedIntroSet> {
        self.services.get(key)
    }

    pub fn num_intros(&self) -> usize {
        self.services.len()
    }

    // ------------------------------------------------------------------
    // Local API
    // ------------------------------------------------------------------

    /// Publish an introset through `via` with the given relay order. The
    /// handler receives the stored copies acknowledged by the network, or
    /// nothing at the deadline.
    pub fn publish_intro(
        &mut self,
        introset: EncryptedIntroSet,
        via: RouterId,
        relay_order: u64,
        handler: Option<IntroLookupHandler>,
        now: u64,
    ) -> u64 {
        let txid = self.alloc_txid();
        let target = introset.dht_key();
        let mut peers_asked = HashSet::new();
        peers_asked.insert(self.our_key.as_dht_key());
        peers_asked.insert(via.as_dht_key());
        self.intro_txs.insert(
            txid,
            IntroTx {
                asker: None,
                target,
                peers_asked,
                values_found: Vec::new(),
                deadline: now + TX_DEADLINE,
                handler,
            },
        );
        self.send(
            via,
            DhtMessage::PublishIntro {
                introset,
                txid,
                relayed: true,
                relay_order,
                version: PROTOCOL_VERSION,
            },
        );
        txid
    }

    /// Look up an introset through `via`. The handler receives the newest
    /// value found, or nothing at the deadline.
    pub fn lookup_intro(
        &mut self,
        target: DhtKey,
        via: RouterId,
        relay_order: u64,
        handler: IntroLookupHandler,
        now: u64,
    ) -> u64 {
        let txid = self.alloc_txid();
        let mut peers_asked = HashSet::new();
        peers_asked.insert(self.our_key.as_dht_key());
        peers_asked.insert(via.as_dht_key());
        self.intro_txs.insert(
            txid,
            IntroTx {
                asker: None,
                target,
                peers_asked,
                values_found: Vec::new(),
                deadline: now + TX_DEADLINE,
                handler: Some(handler),
            },
        );
        self.send(
            via,
            DhtMessage::FindIntro {
                target,
                txid,
                relay_order,
                relayed: true,
            },
        );
        txid
    }

    /// Ask `via` for routers near a random target; used to refill a thin RC
    /// store.
    pub fn explore(&mut self, via: RouterId, handler: RouterLookupHandler, now: u64) -> u64 {
        let txid = self.alloc_txid();
        let mut target = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut target);
        let target = RouterId::from_bytes(target);
        self.router_txs.insert(
            txid,
            RouterTx {
                target,
                deadline: now + TX_DEADLINE,
                handler: Some(handler),
            },
        );
        self.send(
            via,
            DhtMessage::FindRouter {
                target,
                txid,
                exploratory: true,
            },
        );
        txid
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    /// Process one DHT message from an authenticated peer. Replies and
    /// forwards land in the outbox.
    pub fn handle_message(&mut self, from: RouterId, msg: DhtMessage, store: &RcStore, now: u64) {
        match msg {
            DhtMessage::PublishIntro {
                introset,
                txid,
                relayed,
                relay_order,
                version: _,
            } => self.handle_publish_intro(from, introset, txid, relayed, relay_order, store, now),
            DhtMessage::FindIntro {
                target,
                txid,
                relay_order,
                relayed,
            } => self.handle_find_intro(from, target, txid, relay_order, relayed, store, now),
            DhtMessage::GotIntro { values, txid } => self.handle_got_intro(from, values, txid, now),
            DhtMessage::FindRouter {
                target,
                txid,
                exploratory: _,
            } => self.handle_find_router(from, target, txid, store),
            DhtMessage::GotRouter { routers, txid } => self.handle_got_router(from, routers, txid),
        }
    }

    fn handle_publish_intro(
        &mut self,
        from: RouterId,
        introset: EncryptedIntroSet,
        txid: u64,
        relayed: bool,
        relay_order: u64,
        store: &RcStore,
        now: u64,
    ) {
        let key = introset.dht_key();

        if !introset.verify(&self.crypto, now) {
            warn!(%from, key = %hex::encode(&key[..8]), "publish with invalid introset");
            self.send(from, DhtMessage::GotIntro { values: vec![], txid });
            return;
        }

        let closest = store.find_closest_to(&key, CLOSEST_SET);
        if closest.len() < CLOSEST_SET {
            warn!(
                %from,
                known = closest.len(),
                "publish received but too few routers known"
            );
            self.send(from, DhtMessage::GotIntro { values: vec![], txid });
            return;
        }

        if relayed {
            if relay_order > 1 {
                warn!(%from, relay_order, "publish with invalid relay order");
                self.send(from, DhtMessage::GotIntro { values: vec![], txid });
                return;
            }
            self.propagate_to_pair(from, txid, introset, &closest, relay_order, now);
        } else {
            let among_closest = closest.iter().any(|rc| rc.pubkey == self.our_key);
            if among_closest {
                self.store_intro(introset.clone());
                self.send(
                    from,
                    DhtMessage::GotIntro {
                        values: vec![introset],
                        txid,
                    },
                );
            } else {
                // One-hop forward toward the true closest pair; never
                // re-enters the relayed branch.
                self.propagate_to_pair(from, txid, introset, &closest, relay_order.min(1), now);
            }
        }
    }

    /// Forward an introset to the pair of closest routers selected by
    /// `relay_order`, storing locally when a pair member is us.
    fn propagate_to_pair(
        &mut self,
        from: RouterId,
        txid: u64,
        introset: EncryptedIntroSet,
        closest: &[RouterContact],
        relay_order: u64,
        now: u64,
    ) {
        let (first, second) = if relay_order == 0 {
            (&closest[0], &closest[1])
        } else {
            (&closest[2], &closest[3])
        };
        let peer0 = first.pubkey;
        let peer1 = second.pubkey;
        let are_peer0 = peer0 == self.our_key;
        let are_peer1 = peer1 == self.our_key;

        if are_peer0 || are_peer1 {
            self.store_intro(introset.clone());
            self.send(
                from,
                DhtMessage::GotIntro {
                    values: vec![introset.clone()],
                    txid,
                },
            );
        }
        if !are_peer0 {
            self.forward_publish(from, txid, introset.clone(), peer0, now);
        }
        if !are_peer1 {
            self.forward_publish(from, txid, introset, peer1, now);
        }
    }

    /// Send a non-relayed publish to `peer`, bridging its reply back to the
    /// original asker under the original txid.
    fn forward_publish(
        &mut self,
        asker: RouterId,
        asker_txid: u64,
        introset: EncryptedIntroSet,
        peer: RouterId,
        now: u64,
    ) {
        if peer == asker {
            return;
        }
        let sub_txid = self.alloc_txid();
        let target = introset.dht_key();
        let mut peers_asked = HashSet::new();
        peers_asked.insert(self.our_key.as_dht_key());
        peers_asked.insert(peer.as_dht_key());
        self.intro_txs.insert(
            sub_txid,
            IntroTx {
                asker: Some(TxOwner {
                    node: asker,
                    txid: asker_txid,
                }),
                target,
                peers_asked,
                values_found: Vec::new(),
                deadline: now + TX_DEADLINE,
                handler: None,
            },
        );
        self.send(
            peer,
            DhtMessage::PublishIntro {
                introset,
                txid: sub_txid,
                relayed: false,
                relay_order: 0,
                version: PROTOCOL_VERSION,
            },
        );
    }

    fn handle_find_intro(
        &mut self,
        from: RouterId,
        target: DhtKey,
        txid: u64,
        relay_order: u64,
        relayed: bool,
        store: &RcStore,
        now: u64,
    ) {
        // Serve from local storage when we hold a live copy.
        if let Some(introset) = self.services.get(&target) {
            if !introset.is_expired(now) {
                let values = vec![introset.clone()];
                self.send(from, DhtMessage::GotIntro { values, txid });
                return;
            }
        }

        if !relayed {
            // A non-relayed find terminates here: the selected holder either
            // has the introset or nobody does.
            self.send(from, DhtMessage::GotIntro { values: vec![], txid });
            return;
        }

        // Forward toward the closest routers, selected by relay order.
        let closest = store.find_closest_to(&target, CLOSEST_SET);
        let candidate = closest
            .iter()
            .map(|rc| rc.pubkey)
            .filter(|id| *id != self.our_key && *id != from)
            .nth(relay_order as usize);
        let Some(candidate) = candidate else {
            self.send(from, DhtMessage::GotIntro { values: vec![], txid });
            return;
        };

        let sub_txid = self.alloc_txid();
        let mut peers_asked = HashSet::new();
        peers_asked.insert(self.our_key.as_dht_key());
        peers_asked.insert(candidate.as_dht_key());
        self.intro_txs.insert(
            sub_txid,
            IntroTx {
                asker: Some(TxOwner { node: from, txid }),
                target,
                peers_asked,
                values_found: Vec::new(),
                deadline: now + TX_DEADLINE,
                handler: None,
            },
        );
        self.send(
            candidate,
            DhtMessage::FindIntro {
                target,
                txid: sub_txid,
                relay_order: 0,
                relayed: false,
            },
        );
    }

    fn handle_got_intro(
        &mut self,
        from: RouterId,
        values: Vec<EncryptedIntroSet>,
        txid: u64,
        now: u64,
    ) {
        let Some(tx) = self.intro_txs.get_mut(&txid) else {
            trace!(%from, txid, "reply for closed tx discarded");
            return;
        };

        for value in values {
            if value.dht_key() != tx.target {
                warn!(%from, "introset reply with wrong target");
                continue;
            }
            if !value.verify(&self.crypto, now) {
                warn!(%from, "invalid introset in reply");
                continue;
            }
            // Dedup by derived key, keeping the newest by expiry.
            match tx
                .values_found
                .iter_mut()
                .find(|v| v.dht_key() == value.dht_key())
            {
                Some(existing) => {
                    if existing.other_is_newer(&value) {
                        *existing = value;
                    }
                }
                None => tx.values_found.push(value),
            }
        }

        // Keep asking while empty-handed and under the K budget.
        if tx.values_found.is_empty() && tx.peers_asked.len() < DHT_K {
            let exclude = tx.peers_asked.clone();
            let target = tx.target;
            if let Some(next_peer) = self.closest_node_excluding(&target, &exclude) {
                let tx = self.intro_txs.get_mut(&txid).expect("tx still present");
                tx.peers_asked.insert(next_peer.as_dht_key());
                self.send(
                    next_peer,
                    DhtMessage::FindIntro {
                        target,
                        txid,
                        relay_order: 0,
                        relayed: false,
                    },
                );
                return;
            }
        }

        self.complete_intro_tx(txid);
    }

    fn complete_intro_tx(&mut self, txid: u64) {
        let Some(mut tx) = self.intro_txs.remove(&txid) else {
            return;
        };
        // Reply with the single newest value.
        if !tx.values_found.is_empty() {
            let newest = tx
                .values_found
                .iter()
                .max_by_key(|v| v.expires_at)
                .cloned()
                .expect("non-empty values");
            tx.values_found = vec![newest];
        }
        if let Some(asker) = tx.asker {
            self.send(
                asker.node,
                DhtMessage::GotIntro {
                    values: tx.values_found.clone(),
                    txid: asker.txid,
                },
            );
        }
        if let Some(handler) = tx.handler.take() {
            handler(tx.values_found);
        }
    }

    fn handle_find_router(&mut self, from: RouterId, target: RouterId, txid: u64, store: &RcStore) {
        let mut routers: Vec<RouterContact> = store
            .find_closest_to(&target.as_dht_key(), DHT_K)
            .into_iter()
            .filter(|rc| rc.pubkey != from)
            .collect();
        if let Some(exact) = store.get(&target) {
            if !routers.iter().any(|rc| rc.pubkey == target) {
                routers.insert(0, exact.clone());
            }
        }
        self.send(from, DhtMessage::GotRouter { routers, txid });
    }

    fn handle_got_router(&mut self, from: RouterId, routers: Vec<RouterContact>, txid: u64) {
        let Some(mut tx) = self.router_txs.remove(&txid) else {
            trace!(%from, txid, "router reply for closed tx discarded");
            return;
        };
        debug!(%from, count = routers.len(), target = %tx.target, "router lookup answered");
        if let Some(handler) = tx.handler.take() {
            handler(routers);
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Expire TX records and stored introsets. Timed-out completions fire
    /// with nothing; bridged askers get an empty reply.
    pub fn tick(&mut self, now: u64) {
        let expired_intro: Vec<u64> = self
            .intro_txs
            .iter()
            .filter(|(_, tx)| now >= tx.deadline)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in expired_intro {
            debug!(txid, "dht tx deadline reached");
            self.complete_intro_tx(txid);
        }

        let expired_router: Vec<u64> = self
            .router_txs
            .iter()
            .filter(|(_, tx)| now >= tx.deadline)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in expired_router {
            if let Some(mut tx) = self.router_txs.remove(&txid) {
                if let Some(handler) = tx.handler.take() {
                    handler(Vec::new());
                }
            }
        }

        self.services.retain(|_, introset| !introset.is_expired(now));
    }

    #[cfg(test)]
    fn peers_asked(&self, txid: u64) -> Option<&HashSet<DhtKey>> {
        self.intro_txs.get(&txid).map(|tx| &tx.peers_asked)
    }
}
