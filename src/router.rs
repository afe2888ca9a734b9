//! # Router Runtime
//!
//! The composition root: owns the link layers (as an arena), the RC store,
//! the outbound machinery, the DHT context, path state, and profiling, all
//! inside a single [`RouterState`] that lives on the logic lane. The public
//! [`Router`] handle posts jobs onto the lane; UDP receive tasks, the
//! periodic ticker, and worker completions are the only other producers.
//!
//! The tick runs once a second and performs, in order: profiling upkeep,
//! the hourly stats report, RC store maintenance, regeneration of our own RC
//! when it nears expiry, policy purges (relays), persisted-session revival,
//! connection-target maintenance with DHT exploration when the store runs
//! thin, path maintenance, pruning the DHT node table down to live peers,
//! and path/TX expiry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rand::Rng;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::crypto::Crypto;
use crate::dht::{DhtContext, IntroLookupHandler};
use crate::error::RouterError;
use crate::identity::{DhtKey, RouterId};
use crate::intro::EncryptedIntroSet;
use crate::keys::KeyManager;
use crate::link::{self, LinkEvent, LinkLayer};
use crate::logic::{spawn_logic, DiskWorker, LogicHandle, WorkerPool};
use crate::messages::{LinkMessage, PathId};
use crate::outbound::{MessageDispatcher, SessionEvent, SessionMaker};
use crate::path::{HopSelection, PathContext, TransitAction, TransitContext};
use crate::profiling::Profiling;
use crate::rc::{self, RcPolicy, RcStore, RouterContact};
use crate::util::{now_ms, DecayingHashSet};

/// Re-sign our RC at least this often.
pub const RC_REGEN_INTERVAL: u64 = 60 * 60 * 1000;

/// Stats snapshot interval.
const STATS_REPORT_INTERVAL: u64 = 60 * 60 * 1000;

/// Router tick period.
const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Gossiped RCs seen within this window skip re-verification.
const RC_GOSSIP_FILTER_INTERVAL: u64 = 30_000;

/// Fewer known routers than this triggers DHT exploration.
const MIN_ROUTERS_FOR_PATHS: usize = 4;

/// Everything the router owns; lives on the logic lane.
pub struct RouterState {
    config: Config,
    crypto: Crypto,
    keys: KeyManager,
    our_rc: RouterContact,
    store: RcStore,
    /// Link-layer arena; sessions are reached through indices, never
    /// back-pointers.
    links: Vec<LinkLayer>,
    maker: SessionMaker,
    dispatcher: MessageDispatcher,
    dht: DhtContext,
    paths: PathContext,
    transit: TransitContext,
    profiling: Profiling,
    /// Keep-alive-until list: peers whose session we re-establish on death.
    persist_sessions: HashMap<RouterId, u64>,
    /// Recently gossiped RCs; skipped to keep the crypto pool honest work.
    rc_gossip_filter: DecayingHashSet<RouterId>,
    /// Payloads that terminated at us from paths we carry.
    path_inbox: Vec<(PathId, Vec<u8>)>,
    crypto_pool: Arc<WorkerPool>,
    disk: Arc<DiskWorker>,
    logic: Option<LogicHandle<RouterState>>,
    started_at: u64,
    last_stats_report: u64,
    is_relay: bool,
    stopping: bool,
}

impl RouterState {
    fn logic(&self) -> LogicHandle<RouterState> {
        self.logic.clone().expect("logic handle installed at startup")
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    fn handle_udp(&mut self, link_idx: usize, from: SocketAddr, datagram: &[u8], now: u64) {
        if self.stopping {
            return;
        }
        let policy = self.store.policy().clone();
        let events =
            self.links[link_idx].recv_from(from, datagram, now, &|id| policy.remote_is_allowed(id));
        self.process_link_events(events, now);
        // Pump path traffic after every receive burst.
        self.pump_paths(now);
        self.drain_dht_outbox(now);
    }

    fn process_link_events(&mut self, events: Vec<LinkEvent>, now: u64) {
        for event in events {
            match event {
                LinkEvent::SessionEstablished { peer, inbound } => {
                    debug!(%peer, inbound, "session established");
                    self.profiling.connect_succeeded(&peer, now);
                    if let Some(rc) = self.store.get(&peer).cloned() {
                        self.dht.put_node(rc);
                    }
                    let ev = SessionEvent::Established { peer, inbound };
                    self.maker.handle_event(ev, now);
                    let (links, dispatcher) = (&mut self.links, &mut self.dispatcher);
                    dispatcher.handle_event(links, ev, now);
                }
                LinkEvent::SessionClosed { peer, reason } => {
                    info!(%peer, ?reason, "session fully closed");
                    self.dht.del_node(&peer.as_dht_key());
                    let ev = SessionEvent::Closed { peer };
                    self.maker.handle_event(ev, now);
                    let (links, dispatcher) = (&mut self.links, &mut self.dispatcher);
                    dispatcher.handle_event(links, ev, now);
                }
                LinkEvent::PendingTimeout { addr, peer } => {
                    debug!(%addr, ?peer, "pending session timed out");
                    if let Some(peer) = peer {
                        self.profiling.connect_timed_out(&peer, now);
                        let ev = SessionEvent::ConnectTimeout { peer };
                        self.maker.handle_event(ev, now);
                        let (links, dispatcher) = (&mut self.links, &mut self.dispatcher);
                        dispatcher.handle_event(links, ev, now);
                    }
                }
                LinkEvent::Message { peer, message } => {
                    self.dispatch_message(peer, message, now);
                }
            }
        }
    }

    fn dispatch_message(&mut self, from: RouterId, message: LinkMessage, now: u64) {
        match message {
            LinkMessage::Dht(msg) => {
                self.dht.handle_message(from, msg, &self.store, now);
                self.drain_dht_outbox(now);
            }
            LinkMessage::PathBuild { records } => {
                let action = self.transit.handle_build(from, records, now);
                self.apply_transit_action(action, now);
            }
            LinkMessage::PathConfirm { path_id } => {
                if self.paths.handle_confirm(path_id, now) {
                    for hop in self.paths.routers_in_use() {
                        self.profiling.path_succeeded(&hop, now);
                    }
                } else {
                    let action = self.transit.handle_confirm(from, path_id);
                    self.apply_transit_action(action, now);
                }
            }
            LinkMessage::PathUpstream { path_id, payload } => {
                let action = self.transit.handle_upstream(from, path_id, payload, now);
                self.apply_transit_action(action, now);
            }
            LinkMessage::PathDownstream { path_id, payload } => {
                if self.paths.get(&path_id).is_some() {
                    self.paths.handle_downstream(path_id, payload);
                } else {
                    let action = self.transit.handle_downstream(from, path_id, payload, now);
                    self.apply_transit_action(action, now);
                }
            }
        }
    }

    fn apply_transit_action(&mut self, action: TransitAction, now: u64) {
        match action {
            TransitAction::Forward(to, message) => {
                self.send_link_message(to, message, now);
            }
            TransitAction::Deliver(path_id, payload) => {
                self.path_inbox.push((path_id, payload));
            }
            TransitAction::None => {}
        }
    }

    fn send_link_message(&mut self, to: RouterId, message: LinkMessage, now: u64) {
        let (links, dispatcher, maker, store) = (
            &mut self.links,
            &mut self.dispatcher,
            &mut self.maker,
            &self.store,
        );
        dispatcher.queue_message(links, maker, store, to, message, None, now);
    }

    fn drain_dht_outbox(&mut self, now: u64) {
        for (to, msg) in self.dht.take_outbox() {
            self.send_link_message(to, LinkMessage::Dht(msg), now);
        }
    }

    /// Verify gossiped RCs on the crypto pool, inserting survivors back on
    /// the lane. RCs seen within the gossip filter window are skipped.
    fn verify_rcs_async(&mut self, rcs: Vec<RouterContact>) {
        let now = now_ms();
        let rcs: Vec<RouterContact> = rcs
            .into_iter()
            .filter(|rc| self.rc_gossip_filter.insert(rc.pubkey, now))
            .collect();
        if rcs.is_empty() {
            return;
        }
        let crypto = self.crypto;
        let logic = self.logic();
        self.crypto_pool.add_job(move || {
            let now = now_ms();
            let valid: Vec<RouterContact> =
                rcs.into_iter().filter(|rc| rc.verify(&crypto, now)).collect();
            if valid.is_empty() {
                return;
            }
            let _ = logic.call(move |state| {
                let now = now_ms();
                for rc in valid {
                    // Full insert re-checks policy and freshness on the lane.
                    match state.store.insert(rc.clone(), now) {
                        Ok(()) => state.queue_rc_cache_write(rc),
                        Err(RouterError::Duplicate) => {}
                        Err(e) => debug!(peer = %rc.pubkey, error = %e, "gossiped rc rejected"),
                    }
                }
            });
        });
    }

    fn queue_rc_cache_write(&self, rc: RouterContact) {
        let dir = self.keys.netdb_dir();
        self.disk.add_job(move || {
            if let Err(e) = rc::store_rc_file(&dir, &rc) {
                warn!(error = %e, "rc cache write failed");
            }
        });
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    fn pump_paths(&mut self, now: u64) {
        for (to, message) in self.paths.pump_upstream(now) {
            self.send_link_message(to, message, now);
        }
        for delivered in self.paths.pump_downstream() {
            self.path_inbox.push(delivered);
        }
    }

    fn maintain_paths(&mut self, now: u64) {
        if self.is_relay {
            return;
        }
        for _ in 0..self.paths.builds_needed(now) {
            match self
                .paths
                .build_path(&self.store, &self.profiling, &HopSelection::default(), now)
            {
                Ok((first_hop, build, _)) => {
                    self.send_link_message(first_hop, build, now);
                }
                Err(e) => {
                    debug!(error = %e, "path build not possible yet");
                    break;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Tick
    // ------------------------------------------------------------------

    fn tick(&mut self, now: u64) {
        if self.stopping {
            return;
        }

        // 1. profiling upkeep
        self.profiling.tick(now);
        self.rc_gossip_filter.decay(now);

        // 2. hourly stats
        if now.saturating_sub(self.last_stats_report) > STATS_REPORT_INTERVAL {
            self.report_stats(now);
        }

        // 3. RC store maintenance
        let expired = self.store.expire(now);
        if expired > 0 {
            debug!(expired, "dropped expired rcs");
        }

        // 4. regenerate our RC when stale or expiring soon
        let fuzz = rand::thread_rng().gen_range(0..10_000);
        if self.our_rc.expires_soon(now, fuzz)
            || now.saturating_sub(self.our_rc.last_updated) > RC_REGEN_INTERVAL
        {
            info!("regenerating our rc");
            if !self.update_our_rc(now) {
                error!("failed to update our rc");
            }
        }

        // 5. relays purge RCs no longer allowed, keeping bootstrap nodes
        if self.is_relay {
            let policy = self.store.policy().clone();
            self.store.remove_if(|rc| {
                !policy.is_bootstrap(&rc.pubkey) && !policy.hop_is_allowed(&rc.pubkey)
            });
        }

        // 6. revive persisted sessions
        self.persist_sessions.retain(|_, until| *until > now);
        let wanted: Vec<RouterId> = self
            .persist_sessions
            .keys()
            .copied()
            .filter(|peer| !link::has_session_any(&self.links, peer))
            .collect();
        for peer in wanted {
            let (links, maker, store) = (&mut self.links, &mut self.maker, &self.store);
            maker.create_session_to(links, store, peer, None, now);
        }

        // 7. connection targets and exploration
        let connected = link::num_connected_all(&self.links);
        let strict = self.store.policy().strict_connect.len();
        let mut connect_to_num = self.maker.min_connected;
        if strict > 0 && connect_to_num > strict {
            connect_to_num = strict;
        }
        if connected < connect_to_num {
            let delta = connect_to_num - connected;
            let (links, maker, store) = (&mut self.links, &mut self.maker, &self.store);
            maker.connect_to_random_routers(links, store, delta, now);
        }
        if self.store.len() < MIN_ROUTERS_FOR_PATHS && connected > 0 {
            self.explore_network(now);
        }

        // 8. service/path upkeep
        self.maintain_paths(now);
        self.pump_paths(now);

        // 9. the DHT node table stays a subset of live peers
        let live: std::collections::HashSet<RouterId> =
            link::connected_peers_all(&self.links).into_iter().collect();
        self.dht.retain_nodes(|rc| live.contains(&rc.pubkey));

        // 10. expiries and queue upkeep
        self.paths.expire_paths(now);
        self.transit.expire(now);
        self.dht.tick(now);
        {
            let (links, dispatcher) = (&mut self.links, &mut self.dispatcher);
            dispatcher.tick(links, now);
        }
        let mut events = Vec::new();
        for link in &mut self.links {
            events.extend(link.pump(now));
        }
        self.process_link_events(events, now);
        self.drain_dht_outbox(now);

        if self.profiling.should_save(now) {
            let bytes = self.profiling.save_snapshot(now);
            let path = self.keys.profiles_path();
            self.disk.add_job(move || {
                if let Err(e) = crate::profiling::write_profiles(&path, &bytes) {
                    warn!(error = %e, "profile save failed");
                }
            });
        }
    }

    fn explore_network(&mut self, now: u64) {
        let peers = link::connected_peers_all(&self.links);
        let Some(via) = peers.first().copied() else {
            return;
        };
        debug!(%via, known = self.store.len(), "exploring network for more routers");
        let logic = self.logic();
        self.dht.explore(
            via,
            Box::new(move |routers| {
                let _ = logic.call(move |state| state.verify_rcs_async(routers));
            }),
            now,
        );
        self.drain_dht_outbox(now);
    }

    fn report_stats(&mut self, now: u64) {
        info!(netid = %self.config.router.netid, uptime_ms = now.saturating_sub(self.started_at), "stats report");
        info!(rcs = self.store.len(), "rc store size");
        info!(connected = link::num_connected_all(&self.links), "router connections");
        info!(paths = self.paths.num_paths(), transit = self.transit.num_transit(), "path state");
        if self.is_relay {
            info!(
                rc_age_ms = self.our_rc.age(now),
                rc_expires_in_ms = self.our_rc.time_until_expires(now),
                "our rc lifetime"
            );
        }
        self.last_stats_report = now;
    }

    /// Re-sign our RC and renegotiate every session so peers learn the fresh
    /// descriptor.
    fn update_our_rc(&mut self, now: u64) -> bool {
        let identity = self.keys.identity().clone();
        let enckey = *self.keys.encryption().public_key().as_bytes();
        let mut next = self.our_rc.clone();
        next.sign(&self.crypto, &identity, enckey, now);
        if !next.verify(&self.crypto, now) {
            return false;
        }
        self.our_rc = next.clone();
        if self.is_relay {
            let _ = self.store.insert(next.clone(), now);
        }

        let path = self.keys.self_rc_path();
        self.disk.add_job(move || {
            let bytes = match bincode::serialize(&next) {
                Ok(b) => b,
                Err(e) => {
                    warn!(error = %e, "rc encode failed");
                    return;
                }
            };
            if let Err(e) = std::fs::write(&path, bytes) {
                // Retried implicitly at the next regeneration tick.
                warn!(error = %e, "rc save failed");
            }
        });

        for link in &mut self.links {
            link.for_each_session_mut(|session| session.renegotiate(now));
        }
        true
    }

    /// Entry router for a DHT request: the requested peer if we have a live
    /// session to it, otherwise any connected peer.
    fn pick_via(&mut self, requested: Option<RouterId>) -> Option<RouterId> {
        match requested {
            Some(peer) if link::has_session_any(&self.links, &peer) => Some(peer),
            Some(_) => None,
            None => link::connected_peers_all(&self.links).first().copied(),
        }
    }

    fn shutdown(&mut self, now: u64) {
        if self.stopping {
            return;
        }
        info!("stopping router");
        self.stopping = true;
        self.dispatcher.stop();
        for link in &mut self.links {
            link.stop(now);
        }
        let snapshot = self.store.snapshot();
        let dir = self.keys.netdb_dir();
        self.disk.add_job(move || {
            for rc in &snapshot {
                let _ = rc::store_rc_file(&dir, rc);
            }
        });
    }
}

/// Structured snapshot of a running router, for the API surface to consume.
#[derive(Clone, Debug)]
pub struct RouterStatus {
    pub running: bool,
    pub relay: bool,
    pub uptime_ms: u64,
    pub known_rcs: usize,
    pub connected_routers: usize,
    pub paths: usize,
    pub transit_paths: usize,
    pub stored_introsets: usize,
}

/// Handle to a running router.
pub struct Router {
    logic: LogicHandle<RouterState>,
    our_id: RouterId,
    local_addr: SocketAddr,
    lane: tokio::task::JoinHandle<RouterState>,
}

impl Router {
    /// Build and start a router from its configuration. Binds the link
    /// layer, loads keys and cached RCs, signs our RC, and starts the tick.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let crypto = Crypto::new();
        let keys = KeyManager::ensure(&config.router.data_dir, &crypto)
            .context("key store initialization failed")?;
        let is_relay = config.is_relay();
        let now = now_ms();

        // Bind one link layer per configured interface. Relays listen where
        // configured; clients get a single ephemeral outbound port.
        let mut bind_addrs: Vec<SocketAddr> = Vec::new();
        for bind in &config.binds {
            let addr = format!("{}:{}", bind.interface, bind.port)
                .parse()
                .with_context(|| format!("invalid bind address {}", bind.interface))?;
            bind_addrs.push(addr);
        }
        if bind_addrs.is_empty() {
            bind_addrs.push("0.0.0.0:0".parse().expect("static addr parses"));
        }
        let mut links: Vec<LinkLayer> = Vec::with_capacity(bind_addrs.len());
        let mut sockets = Vec::with_capacity(bind_addrs.len());
        for addr in bind_addrs {
            let (link, socket) = LinkLayer::bind(
                crypto,
                keys.identity().clone(),
                keys.transport().clone(),
                addr,
                is_relay,
            )
            .await
            .with_context(|| format!("failed to bind link layer on {addr}"))?;
            links.push(link);
            sockets.push(socket);
        }
        let local_addr = links[0].local_addr();

        // Our RC advertises every bound link; the public override applies to
        // the primary.
        let addr_infos: Vec<crate::rc::AddressInfo> = links
            .iter()
            .enumerate()
            .map(|(i, link)| {
                if i == 0 {
                    link.address_info(
                        config.router.public_address.map(std::net::IpAddr::V4),
                        config.router.public_port,
                    )
                } else {
                    link.address_info(None, None)
                }
            })
            .collect();
        let mut our_rc = RouterContact::new(config.router.netid.clone(), addr_infos);
        our_rc.sign(
            &crypto,
            keys.identity(),
            *keys.encryption().public_key().as_bytes(),
            now,
        );
        let our_id = our_rc.pubkey;
        info!(%our_id, %local_addr, relay = is_relay, "router starting");

        let mut policy = RcPolicy::default();
        policy.strict_connect = config.network.strict_connect.iter().copied().collect();
        policy.blacklist = config.network.blacklist.iter().copied().collect();
        let mut store = RcStore::new(
            crypto,
            config.router.netid.clone(),
            config.router.block_bogons,
            policy,
        );

        // Relays keep their own RC in the store: closest-set decisions in
        // the DHT must be able to find us among the candidates.
        if is_relay {
            let _ = store.insert(our_rc.clone(), now);
        }

        // Seed from the disk cache, then bootstrap files.
        for rc in rc::load_rc_cache(&keys.netdb_dir()) {
            let _ = store.insert(rc, now);
        }
        let mut bootstrap_rcs = Vec::new();
        for file in config.bootstrap_files.iter().chain(&config.connect_files) {
            match rc::load_rc_file(file) {
                Ok(rc) => match store.insert(rc.clone(), now) {
                    Ok(()) => {
                        info!(peer = %rc.pubkey, "added bootstrap node");
                        store.policy_mut().bootstrap.insert(rc.pubkey);
                        bootstrap_rcs.push(rc);
                    }
                    Err(RouterError::Duplicate) => {
                        warn!(peer = %rc.pubkey, "duplicate bootstrap node");
                    }
                    Err(e) => warn!(file = %file.display(), error = %e, "bad bootstrap rc"),
                },
                Err(e) => warn!(file = %file.display(), error = %e, "unreadable bootstrap rc"),
            }
        }

        // Profiling: clients only, unless configured off.
        let profiling_enabled = if is_relay {
            false
        } else {
            config.network.profiling.unwrap_or(true)
        };
        let mut profiling = Profiling::new(profiling_enabled);
        profiling.load(&keys.profiles_path());

        let maker = SessionMaker::new(
            our_id,
            config.router.min_connections,
            config.router.max_connections,
        );
        let mut dht = DhtContext::new(crypto, our_id);
        for rc in &bootstrap_rcs {
            dht.put_node(rc.clone());
        }
        let paths = PathContext::new(crypto, config.network.hops, config.network.paths);
        let transit = TransitContext::new(crypto, keys.encryption().clone(), is_relay);

        let crypto_pool = Arc::new(WorkerPool::new(
            "cryptoworker",
            config.router.worker_threads,
        ));
        let disk = Arc::new(DiskWorker::new());
        let net_threads = config.router.net_threads;
        let job_queue_size = config.router.job_queue_size;

        let state = RouterState {
            config,
            crypto,
            keys,
            our_rc,
            store,
            links,
            maker,
            dispatcher: MessageDispatcher::new(),
            dht,
            paths,
            transit,
            profiling,
            persist_sessions: HashMap::new(),
            rc_gossip_filter: DecayingHashSet::new(RC_GOSSIP_FILTER_INTERVAL),
            path_inbox: Vec::new(),
            crypto_pool,
            disk,
            logic: None,
            started_at: now,
            last_stats_report: now,
            is_relay,
            stopping: false,
        };

        let (logic, lane) = spawn_logic(state, job_queue_size);
        // The state needs its own handle for worker completions.
        {
            let handle = logic.clone();
            let _ = logic.call(move |state| state.logic = Some(handle));
        }

        // Persist our freshly signed RC.
        let _ = logic.call(|state| {
            state.update_our_rc(now_ms());
        });

        // Receive tasks: datagrams hop onto the lane before touching state.
        // Each bound socket gets its own set, tagged with its arena index.
        for (link_idx, socket) in sockets.iter().enumerate() {
            for _ in 0..net_threads.max(1) {
                let socket = socket.clone();
                let logic = logic.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 65536];
                    loop {
                        match socket.recv_from(&mut buf).await {
                            Ok((len, from)) => {
                                let datagram = buf[..len].to_vec();
                                let delivered = logic
                                    .call_async(move |state| {
                                        state.handle_udp(link_idx, from, &datagram, now_ms())
                                    })
                                    .await;
                                if !delivered {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!(error = %e, "udp recv error");
                            }
                        }
                    }
                });
            }
        }

        // The once-a-second maintenance tick.
        logic.call_every(TICK_INTERVAL, |state: &mut RouterState| {
            state.tick(now_ms());
        });

        Ok(Self {
            logic,
            our_id,
            local_addr,
            lane,
        })
    }

    pub fn our_id(&self) -> RouterId {
        self.our_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn query<T: Send + 'static>(
        &self,
        f: impl FnOnce(&mut RouterState) -> T + Send + 'static,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        let ok = self
            .logic
            .call_async(move |state| {
                let _ = tx.send(f(state));
            })
            .await;
        if !ok {
            return None;
        }
        rx.await.ok()
    }

    /// Our current signed RC.
    pub async fn our_rc(&self) -> Option<RouterContact> {
        self.query(|state| state.our_rc.clone()).await
    }

    /// Insert a verified RC (e.g. learned out of band).
    pub async fn add_rc(&self, rc: RouterContact) -> Option<Result<(), RouterError>> {
        self.query(move |state| {
            let now = now_ms();
            state.store.insert(rc.clone(), now).map(|()| {
                state.dht.put_node(rc.clone());
                state.queue_rc_cache_write(rc);
            })
        })
        .await
    }

    /// Ask for a session to `remote`; resolves on establishment or failure.
    pub async fn connect_to(&self, remote: RouterId) -> Option<crate::outbound::SessionResult> {
        let (tx, rx) = oneshot::channel();
        let sent = self
            .logic
            .call_async(move |state| {
                let now = now_ms();
                let (links, maker, store) =
                    (&mut state.links, &mut state.maker, &state.store);
                maker.create_session_to(
                    links,
                    store,
                    remote,
                    Some(Box::new(move |_, result| {
                        let _ = tx.send(result);
                    })),
                    now,
                );
            })
            .await;
        if !sent {
            return None;
        }
        rx.await.ok()
    }

    pub async fn has_session_to(&self, remote: RouterId) -> bool {
        self.query(move |state| link::has_session_any(&state.links, &remote))
            .await
            .unwrap_or(false)
    }

    pub async fn num_connected_routers(&self) -> usize {
        self.query(|state| link::num_connected_all(&state.links))
            .await
            .unwrap_or(0)
    }

    pub async fn num_known_rcs(&self) -> usize {
        self.query(|state| state.store.len()).await.unwrap_or(0)
    }

    /// Keep a session to `remote` alive until `until` (ms since epoch).
    pub async fn persist_session_until(&self, remote: RouterId, until: u64) {
        self.query(move |state| {
            state.persist_sessions.insert(remote, until);
        })
        .await;
    }

    /// Publish an introset into the DHT through a connected router. With no
    /// explicit `via`, any connected peer serves as the entry.
    pub async fn publish_introset(
        &self,
        introset: EncryptedIntroSet,
        via: Option<RouterId>,
        relay_order: u64,
        handler: IntroLookupHandler,
    ) -> bool {
        self.query(move |state| {
            let now = now_ms();
            let Some(via) = state.pick_via(via) else {
                handler(vec![]);
                return false;
            };
            state.dht.publish_intro(introset, via, relay_order, Some(handler), now);
            state.drain_dht_outbox(now);
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Resolve an introset by its DHT key through a connected router.
    pub async fn lookup_introset(
        &self,
        key: DhtKey,
        via: Option<RouterId>,
        handler: IntroLookupHandler,
    ) -> bool {
        self.query(move |state| {
            let now = now_ms();
            let Some(via) = state.pick_via(via) else {
                handler(vec![]);
                return false;
            };
            state.dht.lookup_intro(key, via, 0, handler, now);
            state.drain_dht_outbox(now);
            true
        })
        .await
        .unwrap_or(false)
    }

    /// Introsets currently stored in this node's services table.
    pub async fn stored_introset(&self, key: DhtKey) -> Option<EncryptedIntroSet> {
        self.query(move |state| state.dht.get_intro(&key).cloned())
            .await
            .flatten()
    }

    pub async fn num_paths(&self) -> usize {
        self.query(|state| state.paths.num_paths()).await.unwrap_or(0)
    }

    /// Payloads delivered to us as a path terminal.
    pub async fn take_path_inbox(&self) -> Vec<(PathId, Vec<u8>)> {
        self.query(|state| std::mem::take(&mut state.path_inbox))
            .await
            .unwrap_or_default()
    }

    pub async fn uptime_ms(&self) -> u64 {
        self.query(|state| now_ms().saturating_sub(state.started_at))
            .await
            .unwrap_or(0)
    }

    pub async fn status(&self) -> Option<RouterStatus> {
        self.query(|state| RouterStatus {
            running: !state.stopping,
            relay: state.is_relay,
            uptime_ms: now_ms().saturating_sub(state.started_at),
            known_rcs: state.store.len(),
            connected_routers: link::num_connected_all(&state.links),
            paths: state.paths.num_paths(),
            transit_paths: state.transit.num_transit(),
            stored_introsets: state.dht.num_intros(),
        })
        .await
    }

    /// Graceful shutdown: close sessions, flush caches, stop the lane.
    pub async fn stop(self) {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .logic
            .call_async(move |state| {
                state.shutdown(now_ms());
                let _ = tx.send(());
            })
            .await;
        let _ = rx.await;
        // Give close frames a moment to leave the socket. The ticker task
        // still holds a lane sender, so the lane is cancelled rather than
        // drained; dropping the state joins the worker pools.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        self.lane.abort();
        let _ = self.lane.await;
    }

    /// Run until interrupted.
    pub async fn run_until_interrupted(self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c()
            .await
            .context("failed waiting for interrupt")?;
        self.stop().await;
        Ok(())
    }
}

/// Write a default config file for the requested role.
pub fn write_default_config(path: &PathBuf, relay: bool) -> anyhow::Result<()> {
    let text = if relay {
        Config::default_router_ini()
    } else {
        Config::default_client_ini()
    };
    std::fs::write(path, text)
        .with_context(|| format!("cannot write config to {}", path.display()))?;
    info!(file = %path.display(), "wrote default configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::SessionResult;
    use crate::session::SESSION_TIMEOUT;
    use std::sync::atomic::{AtomicU16, Ordering};
    use std::time::Duration;

    static PORT_COUNTER: AtomicU16 = AtomicU16::new(43000);

    fn next_port() -> u16 {
        PORT_COUNTER.fetch_add(1, Ordering::SeqCst)
    }

    async fn spawn_relay(data_dir: &std::path::Path) -> Router {
        let port = next_port();
        let text = format!(
            "[router]\n\
             netid = veilnet\n\
             data-dir = {}\n\
             block-bogons = false\n\
             \n\
             [bind]\n\
             127.0.0.1 = {port}\n",
            data_dir.display()
        );
        let config = Config::parse(&text).expect("relay config parses");
        Router::new(config).await.expect("relay starts")
    }

    /// Two relays with exchanged RCs and an established session.
    async fn connected_pair() -> (Router, Router, tempfile::TempDir, tempfile::TempDir) {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let a = spawn_relay(dir_a.path()).await;
        let b = spawn_relay(dir_b.path()).await;
        a.add_rc(b.our_rc().await.unwrap()).await.unwrap().unwrap();
        b.add_rc(a.our_rc().await.unwrap()).await.unwrap().unwrap();
        assert_eq!(
            a.connect_to(b.our_id()).await,
            Some(SessionResult::Established)
        );
        (a, b, dir_a, dir_b)
    }

    async fn wait_for_mutual_session(a: &Router, b: &Router, budget: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + budget;
        loop {
            if a.has_session_to(b.our_id()).await && b.has_session_to(a.our_id()).await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reconnect_after_session_timeout() {
        let (a, b, _da, _db) = connected_pair().await;
        assert!(wait_for_mutual_session(&a, &b, Duration::from_secs(5)).await);

        // Run one tick with the clock advanced past the session timeout: the
        // pump detects the silent session and closes it. The next natural
        // tick then sees connected < min and re-dials through the still-valid
        // RC.
        let future_now = now_ms() + SESSION_TIMEOUT + 1;
        let (tx, rx) = oneshot::channel();
        let sent = a
            .logic
            .call_async(move |state| {
                state.tick(future_now);
                let _ = tx.send(link::num_connected_all(&state.links));
            })
            .await;
        assert!(sent);
        let connected_after_timeout = rx.await.unwrap();
        assert_eq!(connected_after_timeout, 0, "timed-out session must be closed");

        // The redial from that same tick completes within the 5 s budget.
        assert!(
            wait_for_mutual_session(&a, &b, Duration::from_secs(5)).await,
            "session should be re-established after the timeout"
        );
        assert_eq!(a.num_connected_routers().await, 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stale_rc_regenerates_and_sessions_stay_linked() {
        let (a, b, _da, _db) = connected_pair().await;
        assert!(wait_for_mutual_session(&a, &b, Duration::from_secs(5)).await);
        let before = a.our_rc().await.unwrap();

        // Age our RC past the regen interval; the next natural tick re-signs
        // it and renegotiates every session.
        let aged = a
            .logic
            .call_async(|state| {
                state.our_rc.last_updated = state
                    .our_rc
                    .last_updated
                    .saturating_sub(RC_REGEN_INTERVAL + 1);
            })
            .await;
        assert!(aged);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let regenerated = loop {
            if let Some(rc) = a.our_rc().await {
                if rc.last_updated > before.last_updated {
                    break rc;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "rc was not regenerated"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        };
        assert!(regenerated.verify(&Crypto::new(), now_ms()));
        assert_eq!(regenerated.pubkey, before.pubkey);

        // Renegotiation rode on the live sessions; they stay established.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(a.has_session_to(b.our_id()).await);
        assert!(b.has_session_to(a.our_id()).await);
        assert_eq!(a.num_connected_routers().await, 1);

        a.stop().await;
        b.stop().await;
    }
}
