//! # Link Session
//!
//! One authenticated, rekeying datagram session to a peer. The session is a
//! pure state machine: datagrams go in through [`recv_raw`](Session::recv_raw),
//! datagrams to transmit come out through [`take_outbox`](Session::take_outbox),
//! and the owning link layer moves bytes to and from the socket. That keeps
//! every session fully drivable in tests without networking.
//!
//! ```text
//! Initial → Introducing → HandshakeSent → Linked → (rekey) → Linked
//!                                              ↘ Closing → Terminal
//! ```
//!
//! Any state can drop straight to `Terminal` on verification failure, replay,
//! or hard timeout. Only `Linked` counts as established; before that the link
//! layer keeps the session in its pending table.
//!
//! Handshake: the initiator sends a signed `Intro` with an ephemeral X25519
//! key; the responder answers with a signed `IntroAck` carrying its own
//! ephemeral. Both derive per-direction XChaCha20-Poly1305 keys from the
//! shared secret. The initiator's first encrypted frame moves the responder
//! to `Linked`.
//!
//! Delivery: data frames are sequenced, acknowledged cumulatively, and
//! retransmitted on a fixed timer. Messages larger than one fragment are
//! split and reassembled in order. The unacked-byte window bounds memory and
//! surfaces as [`send_queue_backlog`](Session::send_queue_backlog) so the
//! link layer can pick the least-loaded session per peer.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;

use tracing::{debug, trace, warn};
use zeroize::Zeroize;

use crate::crypto::{Crypto, LINK_HANDSHAKE_DOMAIN, NONCE_SIZE};
use crate::error::RouterError;
use crate::identity::{RouterId, SecretKey};
use crate::messages::{
    frame_type, AckFrame, CloseFrame, DataFrame, IntroAckFrame, IntroFrame, LinkFrame,
    LinkMessage, PingFrame, RekeyFrame,
};
use crate::rc::RouterContact;

/// Linked sessions time out after this much rx silence.
pub const SESSION_TIMEOUT: u64 = 30_000;

/// Keepalive is sent when nothing has been transmitted for this long.
pub const PING_INTERVAL: u64 = 5_000;

/// Pending sessions must reach `Linked` within this deadline.
pub const HANDSHAKE_TIMEOUT: u64 = 10_000;

/// Rekey at this key age, or earlier by traffic volume.
pub const REKEY_INTERVAL: u64 = 10 * 60 * 1000;

/// Rekey once this much traffic has passed in either direction.
pub const REKEY_BYTES: u64 = 64 * 1024 * 1024;

/// Unacked frames retransmit on this timer.
const RETRANSMIT_TIMEOUT: u64 = 1_000;

/// A frame that fails this many retransmits kills the session.
const MAX_RETRANSMITS: u32 = 5;

/// Consecutive AEAD failures before the session closes.
const MAX_AUTH_FAILURES: u32 = 5;

/// Replay window width in sequence numbers.
const REPLAY_WINDOW: u64 = 64;

/// Unacked-byte watermark; the dispatcher holds messages once this is full.
pub const SEND_WINDOW_BYTES: usize = 256 * 1024;

/// Plaintext bytes per data frame.
const FRAGMENT_SIZE: usize = 1024;

/// Pre-link messages queued while the handshake runs.
const PRELINK_QUEUE_MAX: usize = 32;

/// Intro frames older than this are ignored.
const INTRO_MAX_SKEW: u64 = 60_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    Outbound,
    Inbound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Introducing,
    HandshakeSent,
    Linked,
    Closing,
    Terminal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    Normal,
    Timeout,
    HandshakeFailure,
    AuthFailure,
    Replay,
    Rejected,
    Shutdown,
}

impl CloseReason {
    fn wire_code(self) -> u8 {
        match self {
            CloseReason::Normal => 0,
            CloseReason::Timeout => 1,
            CloseReason::HandshakeFailure => 2,
            CloseReason::AuthFailure => 3,
            CloseReason::Replay => 4,
            CloseReason::Rejected => 5,
            CloseReason::Shutdown => 6,
        }
    }
}

/// Outcome reported to a message's completion handler. Fired exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendStatus {
    Success,
    Failure,
    Timeout,
    Congestion,
}

pub type SendCompletion = Box<dyn FnOnce(SendStatus) + Send + 'static>;

/// Per-fragment plaintext wrapper; `last` closes a message.
#[derive(serde::Serialize, serde::Deserialize)]
struct Fragment {
    last: bool,
    data: Vec<u8>,
}

struct PendingFrame {
    seq: u64,
    datagram: Vec<u8>,
    size: usize,
    last_sent: u64,
    retries: u32,
    completion: Option<SendCompletion>,
}

#[derive(Clone)]
struct SessionKeys {
    tx: [u8; 32],
    rx: [u8; 32],
    epoch: u64,
}

impl Drop for SessionKeys {
    fn drop(&mut self) {
        self.tx.zeroize();
        self.rx.zeroize();
    }
}

/// Outstanding rekey negotiation: our fresh ephemeral for the next epoch.
struct PendingRekey {
    epoch: u64,
    local_ephemeral: [u8; 32],
}

pub struct Session {
    crypto: Crypto,
    identity: SecretKey,
    role: SessionRole,
    state: SessionState,
    remote_addr: SocketAddr,
    remote_id: Option<RouterId>,
    /// RC we dialed (outbound only); pins the expected responder identity.
    remote_rc: Option<RouterContact>,

    local_ephemeral: [u8; 32],
    keys: Option<SessionKeys>,
    next_keys: Option<SessionKeys>,
    pending_rekey: Option<PendingRekey>,

    // Transmit side.
    next_seq: u64,
    next_ping_seq: u64,
    unacked: VecDeque<PendingFrame>,
    unacked_bytes: usize,
    prelink: VecDeque<(Vec<u8>, Option<SendCompletion>)>,

    // Receive side.
    rx_next: u64,
    rx_highest: u64,
    replay_bitmap: u64,
    rx_highest_ping: u64,
    reorder: BTreeMap<u64, Vec<u8>>,
    assembly: Vec<u8>,
    pending_ack: bool,
    auth_failures: u32,
    replay_hits: u32,

    // Bookkeeping.
    created_at: u64,
    last_rx: u64,
    last_tx: u64,
    keys_installed_at: u64,
    bytes_sent: u64,
    bytes_rcvd: u64,
    close_reason: Option<CloseReason>,
    just_established: bool,

    cached_intro: Option<Vec<u8>>,
    cached_intro_ack: Option<Vec<u8>>,
    outbox: Vec<Vec<u8>>,
}

impl Session {
    /// Start an outbound session toward `rc` and queue the intro datagram.
    pub fn outbound(
        crypto: Crypto,
        identity: SecretKey,
        rc: RouterContact,
        remote_addr: SocketAddr,
        now: u64,
    ) -> Self {
        let mut session = Self::new(
            crypto,
            identity,
            SessionRole::Outbound,
            remote_addr,
            now,
        );
        session.remote_id = Some(rc.pubkey);
        session.remote_rc = Some(rc);
        session.send_intro(now);
        session.state = SessionState::Introducing;
        session
    }

    /// Accept the first datagram from an unknown endpoint.
    pub fn inbound(crypto: Crypto, identity: SecretKey, remote_addr: SocketAddr, now: u64) -> Self {
        Self::new(crypto, identity, SessionRole::Inbound, remote_addr, now)
    }

    fn new(
        crypto: Crypto,
        identity: SecretKey,
        role: SessionRole,
        remote_addr: SocketAddr,
        now: u64,
    ) -> Self {
        let local_ephemeral = crypto.ephemeral_secret();
        Self {
            crypto,
            identity,
            role,
            state: SessionState::Initial,
            remote_addr,
            remote_id: None,
            remote_rc: None,
            local_ephemeral,
            keys: None,
            next_keys: None,
            pending_rekey: None,
            next_seq: 1,
            next_ping_seq: 1,
            unacked: VecDeque::new(),
            unacked_bytes: 0,
            prelink: VecDeque::new(),
            rx_next: 1,
            rx_highest: 0,
            replay_bitmap: 0,
            rx_highest_ping: 0,
            reorder: BTreeMap::new(),
            assembly: Vec::new(),
            pending_ack: false,
            auth_failures: 0,
            replay_hits: 0,
            created_at: now,
            last_rx: now,
            last_tx: now,
            keys_installed_at: now,
            bytes_sent: 0,
            bytes_rcvd: 0,
            close_reason: None,
            just_established: false,
            cached_intro: None,
            cached_intro_ack: None,
            outbox: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn is_established(&self) -> bool {
        self.state == SessionState::Linked
    }

    pub fn remote_id(&self) -> Option<RouterId> {
        self.remote_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Pending-unacked bytes; the link layer picks the least-loaded session.
    pub fn send_queue_backlog(&self) -> usize {
        self.unacked_bytes
    }

    /// Room left in the unacked window; the dispatcher retains messages when
    /// this is false.
    pub fn can_send(&self) -> bool {
        self.unacked_bytes < SEND_WINDOW_BYTES
    }

    /// True once the session has been silent past its deadline. Pending
    /// states use the handshake deadline, linked sessions the rx timeout.
    pub fn timed_out(&self, now: u64) -> bool {
        match self.state {
            SessionState::Terminal => true,
            SessionState::Closing => self.outbox.is_empty(),
            SessionState::Linked => now.saturating_sub(self.last_rx) > SESSION_TIMEOUT,
            _ => now.saturating_sub(self.created_at) > HANDSHAKE_TIMEOUT,
        }
    }

    /// One-shot flag set when the session reaches `Linked`.
    pub fn take_established(&mut self) -> bool {
        std::mem::take(&mut self.just_established)
    }

    /// Datagrams queued for the socket.
    pub fn take_outbox(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbox)
    }

    pub fn has_outbox(&self) -> bool {
        !self.outbox.is_empty()
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Enqueue an outbound message. The completion fires exactly once, with
    /// `Success` only after the remote acknowledged every fragment.
    pub fn send_message(
        &mut self,
        msg: &LinkMessage,
        completion: Option<SendCompletion>,
        now: u64,
    ) -> Result<(), RouterError> {
        match self.state {
            SessionState::Closing | SessionState::Terminal => {
                if let Some(done) = completion {
                    done(SendStatus::Failure);
                }
                return Err(RouterError::SessionTimeout);
            }
            SessionState::Linked => {}
            _ => {
                if self.prelink.len() >= PRELINK_QUEUE_MAX {
                    if let Some(done) = completion {
                        done(SendStatus::Congestion);
                    }
                    return Err(RouterError::QueueFull);
                }
                let bytes =
                    bincode::serialize(msg).expect("link message serialization is infallible");
                self.prelink.push_back((bytes, completion));
                return Ok(());
            }
        }

        let bytes = bincode::serialize(msg).expect("link message serialization is infallible");
        self.send_serialized(bytes, completion, now);
        Ok(())
    }

    fn send_serialized(&mut self, bytes: Vec<u8>, completion: Option<SendCompletion>, now: u64) {
        let total = bytes.len().max(1);
        let mut completion = completion;
        let mut offset = 0;
        while offset < total {
            let end = (offset + FRAGMENT_SIZE).min(bytes.len());
            let last = end == bytes.len();
            let fragment = Fragment {
                last,
                data: bytes[offset..end].to_vec(),
            };
            let plaintext =
                bincode::serialize(&fragment).expect("fragment serialization is infallible");
            let seq = self.next_seq;
            self.next_seq += 1;

            let keys = self
                .active_tx_keys()
                .expect("linked session always has keys installed");
            let nonce = make_nonce(keys.epoch, seq, CHANNEL_DATA);
            let tx_key = keys.tx;
            let ciphertext = self
                .crypto
                .seal(&tx_key, &nonce, &[frame_type::DATA], &plaintext);
            let datagram = LinkFrame::Data(DataFrame { seq, ciphertext }).encode();
            let size = datagram.len();

            self.outbox.push(datagram.clone());
            self.unacked.push_back(PendingFrame {
                seq,
                datagram,
                size,
                last_sent: now,
                retries: 0,
                completion: if last { completion.take() } else { None },
            });
            self.unacked_bytes += size;
            self.bytes_sent += size as u64;
            self.last_tx = now;
            offset = end;
            if bytes.is_empty() {
                break;
            }
        }
    }

    // ------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------

    /// Ingest one UDP payload; returns any decrypted link messages, in order.
    pub fn recv_raw(&mut self, datagram: &[u8], now: u64) -> Vec<LinkMessage> {
        if matches!(self.state, SessionState::Terminal) {
            return Vec::new();
        }
        let Some(frame) = LinkFrame::decode(datagram) else {
            trace!(peer = ?self.remote_id, "undecodable datagram dropped");
            return Vec::new();
        };

        match frame {
            LinkFrame::Intro(intro) => {
                self.handle_intro(intro, now);
                Vec::new()
            }
            LinkFrame::IntroAck(ack) => {
                self.handle_intro_ack(ack, now);
                Vec::new()
            }
            LinkFrame::Data(data) => self.handle_data(data, now),
            LinkFrame::Ack(ack) => {
                self.handle_ack(ack, now);
                Vec::new()
            }
            LinkFrame::Ping(ping) => {
                self.handle_ping(ping, now);
                Vec::new()
            }
            LinkFrame::Rekey(rekey) => {
                self.handle_rekey(rekey, now);
                Vec::new()
            }
            LinkFrame::Close(_) => {
                debug!(peer = ?self.remote_id, "remote closed session");
                self.fail_outstanding();
                self.state = SessionState::Terminal;
                self.close_reason.get_or_insert(CloseReason::Normal);
                Vec::new()
            }
        }
    }

    fn handle_intro(&mut self, intro: IntroFrame, now: u64) {
        if self.role != SessionRole::Inbound {
            return;
        }
        match self.state {
            SessionState::Initial => {}
            SessionState::HandshakeSent => {
                // Duplicate intro: replay our cached ack, keep the first keys.
                if let Some(ack) = &self.cached_intro_ack {
                    self.outbox.push(ack.clone());
                }
                return;
            }
            _ => return,
        }

        if now.saturating_sub(intro.timestamp) > INTRO_MAX_SKEW {
            debug!(from = %self.remote_addr, "stale intro dropped");
            return;
        }
        let payload = handshake_payload(&intro.ephemeral, intro.timestamp);
        if self
            .crypto
            .verify(&intro.initiator, LINK_HANDSHAKE_DOMAIN, &payload, &intro.signature)
            .is_err()
        {
            warn!(from = %self.remote_addr, "intro signature invalid");
            self.terminate(CloseReason::HandshakeFailure);
            return;
        }

        self.state = SessionState::Introducing;
        self.remote_id = Some(intro.initiator);
        self.keys = Some(self.derive_keys(&intro.ephemeral, 0));

        let timestamp = now;
        let ack_payload = handshake_payload(&self.crypto.dh_public(&self.local_ephemeral), timestamp);
        let signature = self
            .crypto
            .sign(&self.identity, LINK_HANDSHAKE_DOMAIN, &ack_payload);
        let ack = LinkFrame::IntroAck(IntroAckFrame {
            responder: self.identity.public_key(),
            ephemeral: self.crypto.dh_public(&self.local_ephemeral),
            timestamp,
            signature,
        })
        .encode();
        self.cached_intro_ack = Some(ack.clone());
        self.outbox.push(ack);
        self.last_tx = now;
        self.last_rx = now;
        self.state = SessionState::HandshakeSent;
    }

    fn handle_intro_ack(&mut self, ack: IntroAckFrame, now: u64) {
        if self.role != SessionRole::Outbound || self.state != SessionState::Introducing {
            return;
        }
        let expected = self
            .remote_rc
            .as_ref()
            .map(|rc| rc.pubkey)
            .expect("outbound session always has a target rc");
        if ack.responder != expected {
            warn!(from = %self.remote_addr, "intro-ack from unexpected identity");
            self.terminate(CloseReason::HandshakeFailure);
            return;
        }
        let payload = handshake_payload(&ack.ephemeral, ack.timestamp);
        if self
            .crypto
            .verify(&ack.responder, LINK_HANDSHAKE_DOMAIN, &payload, &ack.signature)
            .is_err()
        {
            warn!(from = %self.remote_addr, "intro-ack signature invalid");
            self.terminate(CloseReason::HandshakeFailure);
            return;
        }

        self.keys = Some(self.derive_keys(&ack.ephemeral, 0));
        self.keys_installed_at = now;
        self.last_rx = now;
        self.become_linked(now);
        // First encrypted frame confirms the handshake to the responder.
        self.send_ping(now);
    }

    fn handle_data(&mut self, data: DataFrame, now: u64) -> Vec<LinkMessage> {
        if !matches!(
            self.state,
            SessionState::Linked | SessionState::HandshakeSent
        ) {
            return Vec::new();
        }
        if !self.replay_ok(data.seq) {
            self.note_replay();
            return Vec::new();
        }
        let Some(plaintext) =
            self.open_frame(data.seq, CHANNEL_DATA, &[frame_type::DATA], &data.ciphertext, now)
        else {
            return Vec::new();
        };
        self.mark_seq(data.seq);

        if self.state == SessionState::HandshakeSent {
            self.become_linked(now);
        }
        self.last_rx = now;
        self.bytes_rcvd += data.ciphertext.len() as u64;
        self.pending_ack = true;

        self.reorder.insert(data.seq, plaintext);
        let mut delivered = Vec::new();
        while let Some(plaintext) = self.reorder.remove(&self.rx_next) {
            self.rx_next += 1;
            let Ok(fragment) = crate::messages::deserialize_bounded::<Fragment>(&plaintext) else {
                warn!(peer = ?self.remote_id, "malformed fragment, closing");
                self.terminate(CloseReason::AuthFailure);
                return delivered;
            };
            self.assembly.extend_from_slice(&fragment.data);
            if fragment.last {
                let bytes = std::mem::take(&mut self.assembly);
                match crate::messages::deserialize_bounded::<LinkMessage>(&bytes) {
                    Ok(msg) => delivered.push(msg),
                    Err(e) => {
                        debug!(peer = ?self.remote_id, error = %e, "undecodable link message");
                    }
                }
            }
        }
        delivered
    }

    fn handle_ack(&mut self, ack: AckFrame, now: u64) {
        if self.state != SessionState::Linked {
            return;
        }
        self.last_rx = now;
        while let Some(front) = self.unacked.front() {
            if front.seq > ack.acked {
                break;
            }
            let mut frame = self.unacked.pop_front().expect("front exists");
            self.unacked_bytes -= frame.size;
            if let Some(done) = frame.completion.take() {
                done(SendStatus::Success);
            }
        }
    }

    fn handle_ping(&mut self, ping: PingFrame, now: u64) {
        if !matches!(
            self.state,
            SessionState::Linked | SessionState::HandshakeSent
        ) {
            return;
        }
        if ping.seq <= self.rx_highest_ping {
            return;
        }
        if self
            .open_frame(ping.seq, CHANNEL_PING, &[frame_type::PING], &ping.ciphertext, now)
            .is_none()
        {
            return;
        }
        self.rx_highest_ping = ping.seq;
        self.last_rx = now;
        if self.state == SessionState::HandshakeSent {
            self.become_linked(now);
        }
    }

    fn handle_rekey(&mut self, rekey: RekeyFrame, now: u64) {
        if self.state != SessionState::Linked {
            return;
        }
        let Some(remote_id) = self.remote_id else {
            return;
        };
        let current_epoch = self.keys.as_ref().map(|k| k.epoch).unwrap_or(0);
        if rekey.epoch != current_epoch + 1 {
            return;
        }
        let payload = rekey_payload(&rekey.ephemeral, rekey.epoch);
        if self
            .crypto
            .verify(&remote_id, LINK_HANDSHAKE_DOMAIN, &payload, &rekey.signature)
            .is_err()
        {
            warn!(peer = %remote_id, "rekey signature invalid");
            self.terminate(CloseReason::AuthFailure);
            return;
        }

        let had_pending = self.pending_rekey.is_some();
        if !had_pending {
            self.start_rekey(now);
        }
        let pending = self
            .pending_rekey
            .as_ref()
            .expect("pending rekey was just ensured");
        let shared = self.crypto.dh(&pending.local_ephemeral, &rekey.ephemeral);
        let local_pub = self.crypto.dh_public(&pending.local_ephemeral);
        let epoch = pending.epoch;
        self.next_keys =
            Some(self.derive_keys_from_shared(shared, &local_pub, &rekey.ephemeral, epoch));
        self.last_rx = now;
        if !had_pending {
            // We are the responder in this exchange; answer with our half.
            self.send_rekey(now);
        }
        // Transmit moves to the new epoch right away (active_tx_keys); the
        // old receive keys stay installed until the remote's new-epoch
        // traffic arrives, so in-flight frames still decrypt.
    }

    // ------------------------------------------------------------------
    // Tick, close
    // ------------------------------------------------------------------

    /// Drive retransmission, keepalive, acknowledgement, and rekey.
    pub fn tick(&mut self, now: u64) {
        match self.state {
            SessionState::Introducing => {
                // The intro itself is retransmitted on the same timer as data.
                if now.saturating_sub(self.last_tx) > RETRANSMIT_TIMEOUT {
                    if let Some(intro) = &self.cached_intro {
                        self.outbox.push(intro.clone());
                        self.last_tx = now;
                    }
                }
            }
            SessionState::Linked => {
                self.flush_ack();
                self.retransmit(now);
                if now.saturating_sub(self.last_tx) > PING_INTERVAL {
                    self.send_ping(now);
                }
                let key_age = now.saturating_sub(self.keys_installed_at);
                let traffic = self.bytes_sent.max(self.bytes_rcvd);
                if self.pending_rekey.is_none()
                    && (key_age > REKEY_INTERVAL || traffic > REKEY_BYTES)
                {
                    self.start_rekey(now);
                    self.send_rekey(now);
                }
            }
            _ => {}
        }
    }

    fn retransmit(&mut self, now: u64) {
        let mut dead = false;
        let keep_outbox = &mut self.outbox;
        for frame in self.unacked.iter_mut() {
            if now.saturating_sub(frame.last_sent) <= RETRANSMIT_TIMEOUT {
                continue;
            }
            if frame.retries >= MAX_RETRANSMITS {
                dead = true;
                break;
            }
            frame.retries += 1;
            frame.last_sent = now;
            keep_outbox.push(frame.datagram.clone());
        }
        if dead {
            debug!(peer = ?self.remote_id, "retransmit limit reached, closing session");
            self.close(CloseReason::Timeout, now);
        }
    }

    fn flush_ack(&mut self) {
        if !self.pending_ack {
            return;
        }
        self.pending_ack = false;
        let acked = self.rx_next - 1;
        self.outbox
            .push(LinkFrame::Ack(AckFrame { acked }).encode());
    }

    /// Graceful teardown: queue a close frame, fail outstanding completions,
    /// and linger in `Closing` until the outbox drains.
    pub fn close(&mut self, reason: CloseReason, _now: u64) {
        if matches!(self.state, SessionState::Closing | SessionState::Terminal) {
            return;
        }
        self.flush_ack();
        self.outbox.push(
            LinkFrame::Close(CloseFrame {
                reason: reason.wire_code(),
            })
            .encode(),
        );
        self.fail_outstanding();
        self.close_reason = Some(reason);
        self.state = SessionState::Closing;
    }

    /// Hard stop with no close frame.
    fn terminate(&mut self, reason: CloseReason) {
        self.fail_outstanding();
        self.close_reason = Some(reason);
        self.state = SessionState::Terminal;
    }

    /// Trigger a rekey now regardless of thresholds; used when our RC is
    /// re-signed so peers pick up the fresh descriptor epoch.
    pub fn renegotiate(&mut self, now: u64) {
        if self.state != SessionState::Linked || self.pending_rekey.is_some() {
            return;
        }
        self.start_rekey(now);
        self.send_rekey(now);
    }

    fn fail_outstanding(&mut self) {
        for mut frame in self.unacked.drain(..) {
            if let Some(done) = frame.completion.take() {
                done(SendStatus::Failure);
            }
        }
        self.unacked_bytes = 0;
        for (_, completion) in self.prelink.drain(..) {
            if let Some(done) = completion {
                done(SendStatus::Failure);
            }
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn become_linked(&mut self, now: u64) {
        self.state = SessionState::Linked;
        self.just_established = true;
        self.keys_installed_at = now;
        let queued: Vec<(Vec<u8>, Option<SendCompletion>)> = self.prelink.drain(..).collect();
        for (bytes, completion) in queued {
            self.send_serialized(bytes, completion, now);
        }
    }

    fn send_intro(&mut self, now: u64) {
        let ephemeral = self.crypto.dh_public(&self.local_ephemeral);
        let payload = handshake_payload(&ephemeral, now);
        let signature = self
            .crypto
            .sign(&self.identity, LINK_HANDSHAKE_DOMAIN, &payload);
        let intro = LinkFrame::Intro(IntroFrame {
            initiator: self.identity.public_key(),
            ephemeral,
            timestamp: now,
            version: crate::messages::PROTOCOL_VERSION,
            signature,
        })
        .encode();
        self.cached_intro = Some(intro.clone());
        self.outbox.push(intro);
        self.last_tx = now;
    }

    fn send_ping(&mut self, now: u64) {
        let Some(keys) = self.active_tx_keys() else {
            return;
        };
        let seq = self.next_ping_seq;
        let nonce = make_nonce(keys.epoch, seq, CHANNEL_PING);
        let tx_key = keys.tx;
        self.next_ping_seq += 1;
        let ciphertext = self
            .crypto
            .seal(&tx_key, &nonce, &[frame_type::PING], b"ka");
        self.outbox
            .push(LinkFrame::Ping(PingFrame { seq, ciphertext }).encode());
        self.last_tx = now;
    }

    fn start_rekey(&mut self, _now: u64) {
        let epoch = self.keys.as_ref().map(|k| k.epoch).unwrap_or(0) + 1;
        self.pending_rekey = Some(PendingRekey {
            epoch,
            local_ephemeral: self.crypto.ephemeral_secret(),
        });
    }

    fn send_rekey(&mut self, now: u64) {
        let Some(pending) = &self.pending_rekey else {
            return;
        };
        let ephemeral = self.crypto.dh_public(&pending.local_ephemeral);
        let payload = rekey_payload(&ephemeral, pending.epoch);
        let signature = self
            .crypto
            .sign(&self.identity, LINK_HANDSHAKE_DOMAIN, &payload);
        self.outbox.push(
            LinkFrame::Rekey(RekeyFrame {
                ephemeral,
                epoch: pending.epoch,
                signature,
            })
            .encode(),
        );
        self.last_tx = now;
    }

    /// Keys used for sealing: the next epoch once negotiated, else current.
    fn active_tx_keys(&self) -> Option<&SessionKeys> {
        self.next_keys.as_ref().or(self.keys.as_ref())
    }

    /// Finish an epoch switch once the remote's new-epoch traffic arrives.
    fn promote_keys(&mut self, now: u64) {
        if let Some(next) = self.next_keys.take() {
            self.keys = Some(next);
            self.pending_rekey = None;
            self.keys_installed_at = now;
            self.bytes_sent = 0;
            self.bytes_rcvd = 0;
        }
    }

    fn derive_keys(&self, remote_ephemeral: &[u8; 32], epoch: u64) -> SessionKeys {
        let shared = self.crypto.dh(&self.local_ephemeral, remote_ephemeral);
        let local_pub = self.crypto.dh_public(&self.local_ephemeral);
        self.derive_keys_from_shared(shared, &local_pub, remote_ephemeral, epoch)
    }

    fn derive_keys_from_shared(
        &self,
        shared: [u8; 32],
        local_ephemeral_pub: &[u8; 32],
        remote_ephemeral_pub: &[u8; 32],
        epoch: u64,
    ) -> SessionKeys {
        // Initiator-to-responder and responder-to-initiator keys come from
        // the same material under direction labels; each side maps them onto
        // tx/rx by role.
        let (initiator_eph, responder_eph) = match self.role {
            SessionRole::Outbound => (local_ephemeral_pub, remote_ephemeral_pub),
            SessionRole::Inbound => (remote_ephemeral_pub, local_ephemeral_pub),
        };
        let mut material = Vec::with_capacity(32 * 3 + 8);
        material.extend_from_slice(&shared);
        material.extend_from_slice(initiator_eph);
        material.extend_from_slice(responder_eph);
        material.extend_from_slice(&epoch.to_le_bytes());

        let i2r = self.crypto.derive_key("veilnet link i2r v1", &material);
        let r2i = self.crypto.derive_key("veilnet link r2i v1", &material);
        let (tx, rx) = match self.role {
            SessionRole::Outbound => (i2r, r2i),
            SessionRole::Inbound => (r2i, i2r),
        };
        SessionKeys { tx, rx, epoch }
    }

    /// Query the sliding replay window. Marking happens only after the frame
    /// authenticates, so spoofed sequence numbers cannot burn window slots.
    fn replay_ok(&self, seq: u64) -> bool {
        if seq > self.rx_highest {
            return true;
        }
        let offset = self.rx_highest - seq;
        if offset >= REPLAY_WINDOW {
            return false;
        }
        self.replay_bitmap & (1u64 << offset) == 0
    }

    fn mark_seq(&mut self, seq: u64) {
        if seq > self.rx_highest {
            let delta = seq - self.rx_highest;
            self.replay_bitmap = if delta >= 64 {
                0
            } else {
                self.replay_bitmap << delta
            };
            self.replay_bitmap |= 1;
            self.rx_highest = seq;
        } else {
            self.replay_bitmap |= 1u64 << (self.rx_highest - seq);
        }
        self.replay_hits = 0;
    }

    fn note_replay(&mut self) {
        self.replay_hits += 1;
        if self.replay_hits >= MAX_AUTH_FAILURES {
            debug!(peer = ?self.remote_id, "replay window overflow, closing");
            self.terminate(CloseReason::Replay);
        }
    }

    /// Open a sealed frame with the current keys, falling back to the next
    /// epoch's keys mid-rekey. A success under the next keys promotes them.
    fn open_frame(
        &mut self,
        seq: u64,
        channel: u8,
        aad: &[u8],
        ciphertext: &[u8],
        now: u64,
    ) -> Option<Vec<u8>> {
        if let Some(keys) = &self.keys {
            let nonce = make_nonce(keys.epoch, seq, channel);
            if let Some(plain) = self.crypto.open(&keys.rx, &nonce, aad, ciphertext) {
                self.auth_failures = 0;
                return Some(plain);
            }
        }
        if let Some(next) = &self.next_keys {
            let nonce = make_nonce(next.epoch, seq, channel);
            if let Some(plain) = self.crypto.open(&next.rx, &nonce, aad, ciphertext) {
                self.auth_failures = 0;
                // Remote switched epochs; follow it.
                self.promote_keys(now);
                return Some(plain);
            }
        }
        self.auth_failures += 1;
        if self.auth_failures >= MAX_AUTH_FAILURES {
            debug!(peer = ?self.remote_id, "too many auth failures, closing");
            self.terminate(CloseReason::AuthFailure);
        }
        None
    }
}

const CHANNEL_DATA: u8 = 0x00;
const CHANNEL_PING: u8 = 0x01;

fn make_nonce(epoch: u64, seq: u64, channel: u8) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..8].copy_from_slice(&epoch.to_le_bytes());
    nonce[8..16].copy_from_slice(&seq.to_le_bytes());
    nonce[16] = channel;
    nonce
}

fn handshake_payload(ephemeral: &[u8; 32], timestamp: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(40);
    payload.extend_from_slice(ephemeral);
    payload.extend_from_slice(&timestamp.to_le_bytes());
    payload
}

fn rekey_payload(ephemeral: &[u8; 32], epoch: u64) -> Vec<u8> {
    let mut payload = Vec::with_capacity(40);
    payload.extend_from_slice(ephemeral);
    payload.extend_from_slice(&epoch.to_le_bytes());
    payload
}
