//! # Outbound Session Maker and Message Dispatcher
//!
//! [`SessionMaker`] owns on-demand session establishment: at most one
//! in-flight attempt per router (single-flight), every requester's callback
//! fired once with the outcome, and exponential per-peer backoff after
//! failures. It also maintains the connection targets by dialing random
//! allowed routers when the count drops below the floor.
//!
//! [`MessageDispatcher`] owns per-remote FIFO queues: messages to a router
//! without a session wait (bounded, with a per-entry TTL) while the maker
//! establishes one, then drain in order. Send outcomes surface through the
//! message's completion handler, which fires exactly once.
//!
//! Both react to [`SessionEvent`]s the router forwards from the link layer;
//! neither is called from anywhere but the logic lane.

use std::collections::{HashMap, HashSet, VecDeque};
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, info, trace};

use crate::identity::RouterId;
use crate::link::{self, LinkLayer};
use crate::messages::LinkMessage;
use crate::rc::RcStore;
use crate::session::{SendCompletion, SendStatus};

/// Messages older than this are dropped from the wait queues.
pub const MESSAGE_TTL: u64 = 5_000;

/// Per-remote wait-queue watermark; enqueues past it report congestion.
pub const QUEUE_WATERMARK: usize = 64;

/// First-failure cooldown; doubles per consecutive failure.
const BACKOFF_BASE: u64 = 1_000;

/// Cooldown cap.
const BACKOFF_MAX: u64 = 60_000;

/// Routers tracked for backoff; oldest entries fall out.
const BACKOFF_TRACKED: usize = 512;

/// Outcome delivered to session-request callbacks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionResult {
    Established,
    Timeout,
    NoAddress,
    NotAllowed,
}

pub type SessionResultCallback = Box<dyn FnOnce(RouterId, SessionResult) + Send + 'static>;

/// Typed link-state change, forwarded by the router from [`crate::link::LinkEvent`]s.
#[derive(Clone, Copy, Debug)]
pub enum SessionEvent {
    Established { peer: RouterId, inbound: bool },
    ConnectTimeout { peer: RouterId },
    Closed { peer: RouterId },
}

#[derive(Clone, Copy, Debug)]
struct BackoffEntry {
    until: u64,
    exponent: u32,
}

pub struct SessionMaker {
    our_id: RouterId,
    pub min_connected: usize,
    pub max_connected: usize,
    in_flight: HashMap<RouterId, Vec<SessionResultCallback>>,
    backoff: LruCache<RouterId, BackoffEntry>,
}

impl SessionMaker {
    pub fn new(our_id: RouterId, min_connected: usize, max_connected: usize) -> Self {
        Self {
            our_id,
            min_connected,
            max_connected,
            in_flight: HashMap::new(),
            backoff: LruCache::new(NonZeroUsize::new(BACKOFF_TRACKED).expect("nonzero")),
        }
    }

    /// Establish a session to `remote`, coalescing with any attempt already
    /// in flight. The callback fires exactly once.
    pub fn create_session_to(
        &mut self,
        links: &mut [LinkLayer],
        store: &RcStore,
        remote: RouterId,
        callback: Option<SessionResultCallback>,
        now: u64,
    ) {
        if remote == self.our_id {
            if let Some(cb) = callback {
                cb(remote, SessionResult::NotAllowed);
            }
            return;
        }
        if link::has_session_any(links, &remote) {
            if let Some(cb) = callback {
                cb(remote, SessionResult::Established);
            }
            return;
        }
        if let Some(waiters) = self.in_flight.get_mut(&remote) {
            if let Some(cb) = callback {
                waiters.push(cb);
            }
            return;
        }
        if !store.policy().remote_is_allowed(&remote) {
            if let Some(cb) = callback {
                cb(remote, SessionResult::NotAllowed);
            }
            return;
        }
        let Some(rc) = store.get(&remote).cloned() else {
            debug!(peer = %remote, "no rc for session request");
            if let Some(cb) = callback {
                cb(remote, SessionResult::NoAddress);
            }
            return;
        };

        match link::try_establish_any(links, &rc, now) {
            Ok(()) => {
                trace!(peer = %remote, "session establishment started");
                self.in_flight
                    .insert(remote, callback.into_iter().collect());
            }
            Err(e) => {
                debug!(peer = %remote, error = %e, "session establishment failed to start");
                self.note_failure(remote, now);
                if let Some(cb) = callback {
                    cb(remote, SessionResult::NoAddress);
                }
            }
        }
    }

    /// React to a link-state change.
    pub fn handle_event(&mut self, event: SessionEvent, now: u64) {
        match event {
            SessionEvent::Established { peer, .. } => {
                self.backoff.pop(&peer);
                for cb in self.in_flight.remove(&peer).unwrap_or_default() {
                    cb(peer, SessionResult::Established);
                }
            }
            SessionEvent::ConnectTimeout { peer } => {
                self.note_failure(peer, now);
                for cb in self.in_flight.remove(&peer).unwrap_or_default() {
                    cb(peer, SessionResult::Timeout);
                }
            }
            SessionEvent::Closed { .. } => {}
        }
    }

    fn note_failure(&mut self, peer: RouterId, now: u64) {
        let exponent = self
            .backoff
            .get(&peer)
            .map(|e| e.exponent + 1)
            .unwrap_or(0);
        let delay = (BACKOFF_BASE << exponent.min(16)).min(BACKOFF_MAX);
        self.backoff.put(
            peer,
            BackoffEntry {
                until: now + delay,
                exponent,
            },
        );
    }

    fn under_cooldown(&mut self, peer: &RouterId, now: u64) -> bool {
        self.backoff.get(peer).map(|e| e.until > now).unwrap_or(false)
    }

    pub fn is_in_flight(&self, peer: &RouterId) -> bool {
        self.in_flight.contains_key(peer)
    }

    /// Dial up to `want` random routers that policy allows, we are not
    /// connected to, and that are not cooling down from a recent failure.
    /// Never dials past the configured connection ceiling.
    pub fn connect_to_random_routers(
        &mut self,
        links: &mut [LinkLayer],
        store: &RcStore,
        want: usize,
        now: u64,
    ) -> usize {
        let connected = link::num_connected_all(links);
        let want = want.min(self.max_connected.saturating_sub(connected));
        if want == 0 {
            return 0;
        }
        let mut exclude: HashSet<RouterId> =
            link::connected_peers_all(links).into_iter().collect();
        exclude.insert(self.our_id);
        for peer in self.in_flight.keys() {
            exclude.insert(*peer);
        }

        let mut started = 0;
        for _ in 0..want * 3 {
            if started >= want {
                break;
            }
            let Some(rc) = store.random_allowed(&exclude) else {
                break;
            };
            exclude.insert(rc.pubkey);
            if self.under_cooldown(&rc.pubkey, now) {
                continue;
            }
            self.create_session_to(links, store, rc.pubkey, None, now);
            if self.is_in_flight(&rc.pubkey) {
                started += 1;
            }
        }
        if started > 0 {
            info!(started, want, "dialing random routers");
        }
        started
    }
}

struct QueuedMessage {
    message: LinkMessage,
    handler: Option<SendCompletion>,
    enqueued_at: u64,
}

/// Per-remote FIFO queues for messages awaiting a session.
#[derive(Default)]
pub struct MessageDispatcher {
    queues: HashMap<RouterId, VecDeque<QueuedMessage>>,
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send now if a session exists, otherwise queue and ask the maker to
    /// establish one. The handler fires exactly once: `Success`/`Failure`
    /// from the session, `Timeout` on TTL expiry, `Congestion` past the
    /// watermark.
    pub fn queue_message(
        &mut self,
        links: &mut [LinkLayer],
        maker: &mut SessionMaker,
        store: &RcStore,
        remote: RouterId,
        message: LinkMessage,
        handler: Option<SendCompletion>,
        now: u64,
    ) {
        if link::has_session_any(links, &remote) && link::can_send_any(links, &remote) {
            match link::send_to_best(links, &remote, &message, handler, now) {
                Ok(()) => return,
                Err(handler) => {
                    // Session raced away between the check and the send; fall
                    // through to the queue with the handler intact.
                    self.enqueue(remote, message, handler, now);
                    maker.create_session_to(links, store, remote, None, now);
                    return;
                }
            }
        }

        let queue_len = self.queues.get(&remote).map(|q| q.len()).unwrap_or(0);
        if queue_len >= QUEUE_WATERMARK {
            debug!(peer = %remote, "outbound queue congested");
            if let Some(h) = handler {
                h(SendStatus::Congestion);
            }
            return;
        }
        self.enqueue(remote, message, handler, now);
        if !link::has_session_any(links, &remote) {
            maker.create_session_to(links, store, remote, None, now);
        }
    }

    fn enqueue(
        &mut self,
        remote: RouterId,
        message: LinkMessage,
        handler: Option<SendCompletion>,
        now: u64,
    ) {
        self.queues.entry(remote).or_default().push_back(QueuedMessage {
            message,
            handler,
            enqueued_at: now,
        });
    }

    /// React to a link-state change: drain on establishment, fail on death.
    pub fn handle_event(&mut self, links: &mut [LinkLayer], event: SessionEvent, now: u64) {
        match event {
            SessionEvent::Established { peer, .. } => self.drain(links, peer, now),
            SessionEvent::ConnectTimeout { peer } => self.fail_all(peer),
            SessionEvent::Closed { .. } => {}
        }
    }

    /// Flush queued messages for `remote` in order, stopping when the send
    /// window fills.
    fn drain(&mut self, links: &mut [LinkLayer], remote: RouterId, now: u64) {
        let mut session_lost = false;
        if let Some(queue) = self.queues.get_mut(&remote) {
            while !queue.is_empty() {
                if !link::can_send_any(links, &remote) {
                    break;
                }
                let entry = queue.pop_front().expect("queue is non-empty");
                if let Err(handler) =
                    link::send_to_best(links, &remote, &entry.message, entry.handler, now)
                {
                    // No session after all; everything left fails below.
                    queue.push_front(QueuedMessage {
                        message: entry.message,
                        handler,
                        enqueued_at: entry.enqueued_at,
                    });
                    session_lost = true;
                    break;
                }
            }
            if queue.is_empty() {
                self.queues.remove(&remote);
            }
        }
        if session_lost {
            self.fail_all(remote);
        }
    }

    fn fail_all(&mut self, remote: RouterId) {
        if let Some(queue) = self.queues.remove(&remote) {
            for entry in queue {
                if let Some(h) = entry.handler {
                    h(SendStatus::Failure);
                }
            }
        }
    }

    /// Drop timed-out entries and retry remotes that gained a session.
    pub fn tick(&mut self, links: &mut [LinkLayer], now: u64) {
        let remotes: Vec<RouterId> = self.queues.keys().copied().collect();
        for remote in remotes {
            if let Some(queue) = self.queues.get_mut(&remote) {
                while let Some(front) = queue.front() {
                    if now.saturating_sub(front.enqueued_at) <= MESSAGE_TTL {
                        break;
                    }
                    let entry = queue.pop_front().expect("front exists");
                    trace!(peer = %remote, "queued message timed out");
                    if let Some(h) = entry.handler {
                        h(SendStatus::Timeout);
                    }
                }
                if queue.is_empty() {
                    self.queues.remove(&remote);
                    continue;
                }
            }
            if link::has_session_any(links, &remote) {
                self.drain(links, remote, now);
            }
        }
    }

    pub fn queued_for(&self, remote: &RouterId) -> usize {
        self.queues.get(remote).map(|q| q.len()).unwrap_or(0)
    }

    /// Fail everything; used at shutdown.
    pub fn stop(&mut self) {
        let remotes: Vec<RouterId> = self.queues.keys().copied().collect();
        for remote in remotes {
            self.fail_all(remote);
        }
    }
}
