//! # Link Layer
//!
//! Owns one UDP endpoint and every session speaking through it. Two tables:
//!
//! - `authed`: RouterId → sessions (several per peer allowed, capped at
//!   [`MAX_SESSIONS_PER_KEY`]) plus a reverse address index
//! - `pending`: remote address → handshaking sessions, capped at
//!   [`MAX_SESSIONS_PER_ENDPOINT`] per endpoint
//!
//! The link layer itself is plain state owned by the logic lane; a separate
//! receive task reads the socket and posts datagrams onto the lane. Sends go
//! out through the shared socket with `try_send_to` (non-blocking; a full
//! socket buffer drops the datagram, which the session's retransmission
//! absorbs).
//!
//! Established/closed/timeout transitions surface as [`LinkEvent`]s for the
//! router to fan out to the session maker and dispatcher.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::crypto::Crypto;
use crate::error::RouterError;
use crate::identity::{RouterId, SecretKey};
use crate::messages::LinkMessage;
use crate::rc::{AddressInfo, RouterContact};
use crate::session::{
    CloseReason, SendCompletion, Session, SessionRole, SessionState,
};

/// Authenticated sessions allowed per peer identity.
pub const MAX_SESSIONS_PER_KEY: usize = 16;

/// Pending (handshaking) sessions allowed per remote endpoint.
pub const MAX_SESSIONS_PER_ENDPOINT: usize = 5;

/// The link dialect this layer implements.
pub const DIALECT: &str = "iwp";

/// Address preference rank advertised in our RC.
pub const RANK: u16 = 2;

/// State transition the router reacts to.
#[derive(Debug)]
pub enum LinkEvent {
    /// A session reached `Linked` and was promoted into the authed table.
    SessionEstablished {
        peer: RouterId,
        inbound: bool,
    },
    /// An authed session fully closed.
    SessionClosed {
        peer: RouterId,
        reason: CloseReason,
    },
    /// A pending session died before authenticating; the session maker needs
    /// to know so its single-flight entry can fail.
    PendingTimeout {
        addr: SocketAddr,
        peer: Option<RouterId>,
    },
    /// A decrypted message arrived from an established session.
    Message {
        peer: RouterId,
        message: LinkMessage,
    },
}

pub struct LinkLayer {
    crypto: Crypto,
    identity: SecretKey,
    /// Link-transport key; its public half is what the RC advertises for
    /// this endpoint, separate from the router identity.
    transport: SecretKey,
    /// Wire dialect this layer speaks; address selection and advertisement
    /// go by it, so layers in one arena can differ.
    dialect: String,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    allow_inbound: bool,
    authed: HashMap<RouterId, Vec<Session>>,
    authed_addrs: HashMap<SocketAddr, RouterId>,
    pending: HashMap<SocketAddr, Vec<Session>>,
}

impl LinkLayer {
    /// Bind the UDP endpoint. The caller spawns the receive task over the
    /// returned socket handle and posts datagrams back onto the logic lane.
    pub async fn bind(
        crypto: Crypto,
        identity: SecretKey,
        transport: SecretKey,
        bind_addr: SocketAddr,
        allow_inbound: bool,
    ) -> std::io::Result<(Self, Arc<UdpSocket>)> {
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        let local_addr = socket.local_addr()?;
        info!(addr = %local_addr, inbound = allow_inbound, "link layer bound");
        let layer = Self {
            crypto,
            identity,
            transport,
            dialect: DIALECT.to_string(),
            socket: socket.clone(),
            local_addr,
            allow_inbound,
            authed: HashMap::new(),
            authed_addrs: HashMap::new(),
            pending: HashMap::new(),
        };
        Ok((layer, socket))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn dialect(&self) -> &str {
        &self.dialect
    }

    /// Our advertisement for the RC.
    pub fn address_info(&self, public_ip: Option<std::net::IpAddr>, public_port: Option<u16>) -> AddressInfo {
        AddressInfo {
            dialect: self.dialect.clone(),
            pubkey: self.transport.public_key(),
            rank: RANK,
            ip: public_ip.unwrap_or_else(|| self.local_addr.ip()),
            port: public_port.unwrap_or_else(|| self.local_addr.port()),
        }
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Dispatch one received datagram. `allow_peer` is the connection policy
    /// check applied to newly authenticated inbound peers.
    pub fn recv_from(
        &mut self,
        from: SocketAddr,
        datagram: &[u8],
        now: u64,
        allow_peer: &dyn Fn(&RouterId) -> bool,
    ) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        // Authed sessions are found through the reverse address index.
        if let Some(peer) = self.authed_addrs.get(&from).copied() {
            if let Some(sessions) = self.authed.get_mut(&peer) {
                if let Some(session) = sessions
                    .iter_mut()
                    .find(|s| s.remote_addr() == from)
                {
                    for message in session.recv_raw(datagram, now) {
                        events.push(LinkEvent::Message { peer, message });
                    }
                    self.flush_peer(&peer);
                    return events;
                }
            }
        }

        // Pending sessions by endpoint; a new inbound endpoint gets a fresh
        // session if allowed and under the cap.
        let is_new = !self.pending.contains_key(&from);
        if is_new {
            if !self.allow_inbound {
                trace!(%from, "inbound not permitted, dropping datagram");
                return events;
            }
            let session = Session::inbound(self.crypto, self.identity.clone(), from, now);
            self.pending.insert(from, vec![session]);
        }

        let Some(sessions) = self.pending.get_mut(&from) else {
            return events;
        };
        let mut delivered = Vec::new();
        for session in sessions.iter_mut() {
            delivered = session.recv_raw(datagram, now);
            if session.state() != SessionState::Initial || !delivered.is_empty() {
                break;
            }
        }
        // A brand-new inbound session that made no progress was garbage.
        if is_new
            && self
                .pending
                .get(&from)
                .map(|v| v.iter().all(|s| s.state() == SessionState::Initial))
                .unwrap_or(false)
        {
            self.pending.remove(&from);
            return events;
        }

        events.extend(self.promote_ready(from, allow_peer, now));
        if let Some(peer) = self.authed_addrs.get(&from).copied() {
            for message in delivered {
                events.push(LinkEvent::Message { peer, message });
            }
        }
        self.flush_addr(from);
        events
    }

    /// Promote any pending session at `addr` that reached `Linked`.
    fn promote_ready(
        &mut self,
        addr: SocketAddr,
        allow_peer: &dyn Fn(&RouterId) -> bool,
        now: u64,
    ) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        let Some(sessions) = self.pending.get_mut(&addr) else {
            return events;
        };
        let ready: Vec<usize> = sessions
            .iter_mut()
            .enumerate()
            .filter_map(|(i, s)| if s.take_established() { Some(i) } else { None })
            .collect();

        for idx in ready.into_iter().rev() {
            let Some(sessions) = self.pending.get_mut(&addr) else {
                break;
            };
            let mut session = sessions.remove(idx);
            if sessions.is_empty() {
                self.pending.remove(&addr);
            }
            let Some(peer) = session.remote_id() else {
                session.close(CloseReason::HandshakeFailure, now);
                continue;
            };
            let inbound = session.role() == SessionRole::Inbound;
            if inbound && !allow_peer(&peer) {
                debug!(%peer, "peer rejected by policy after handshake");
                session.close(CloseReason::Rejected, now);
                self.send_outbox(&mut session);
                continue;
            }
            // Re-insert so map_addr sees the pending entry, as the public
            // contract requires.
            self.pending.entry(addr).or_default().push(session);
            if self.map_addr(&peer, addr) {
                events.push(LinkEvent::SessionEstablished { peer, inbound });
            }
        }
        events
    }

    /// Promote a pending session at the session's remote address into the
    /// authed table. Fails (and closes the session) if no pending entry
    /// exists or the per-peer cap is reached. Both cap checks happen under
    /// the same logic-lane critical section, so the invariants hold together.
    pub fn map_addr(&mut self, peer: &RouterId, addr: SocketAddr) -> bool {
        let Some(sessions) = self.pending.get_mut(&addr) else {
            return false;
        };
        let Some(idx) = sessions.iter().position(|s| s.is_established()) else {
            return false;
        };

        let authed_count = self.authed.get(peer).map(|v| v.len()).unwrap_or(0);
        if authed_count >= MAX_SESSIONS_PER_KEY {
            warn!(%peer, "too many sessions for peer");
            let mut session = sessions.remove(idx);
            if sessions.is_empty() {
                self.pending.remove(&addr);
            }
            session.close(CloseReason::Rejected, crate::util::now_ms());
            self.send_outbox(&mut session);
            return false;
        }

        let session = sessions.remove(idx);
        if sessions.is_empty() {
            self.pending.remove(&addr);
        }
        self.authed_addrs.insert(addr, *peer);
        self.authed.entry(*peer).or_default().push(session);
        true
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    /// Send a message to `remote` over the least-backlogged session. With no
    /// authed session the completion is handed back untouched so the caller
    /// can queue the message; once a session takes it, the session guarantees
    /// it fires exactly once.
    pub fn send_to(
        &mut self,
        remote: &RouterId,
        message: &LinkMessage,
        completion: Option<SendCompletion>,
        now: u64,
    ) -> Result<(), Option<SendCompletion>> {
        let Some(sessions) = self.authed.get_mut(remote) else {
            return Err(completion);
        };
        let Some(session) = sessions
            .iter_mut()
            .filter(|s| s.is_established())
            .min_by_key(|s| s.send_queue_backlog())
        else {
            return Err(completion);
        };
        let _ = session.send_message(message, completion, now);
        self.flush_peer(remote);
        Ok(())
    }

    /// Whether any authed session to `remote` has window room.
    pub fn can_send_to(&self, remote: &RouterId) -> bool {
        self.authed
            .get(remote)
            .map(|v| v.iter().any(|s| s.is_established() && s.can_send()))
            .unwrap_or(false)
    }

    /// Smallest backlog among established sessions to `remote`, if any.
    /// Used to pick a layer when several carry sessions to the same peer.
    pub fn best_backlog_to(&self, remote: &RouterId) -> Option<usize> {
        self.authed
            .get(remote)?
            .iter()
            .filter(|s| s.is_established())
            .map(|s| s.send_queue_backlog())
            .min()
    }

    /// Start an outbound session to `rc`, picking the lowest-rank address
    /// this dialect can speak to.
    pub fn try_establish_to(&mut self, rc: &RouterContact, now: u64) -> Result<(), RouterError> {
        if self.authed.get(&rc.pubkey).map(|v| v.len()).unwrap_or(0) >= MAX_SESSIONS_PER_KEY {
            return Err(RouterError::QueueFull);
        }
        let addrs = rc.addresses_for(&self.dialect);
        let Some(addr) = addrs.first() else {
            return Err(RouterError::PeerNotAllowed);
        };
        let remote = addr.socket_addr();

        let pending = self.pending.entry(remote).or_default();
        if pending.len() >= MAX_SESSIONS_PER_ENDPOINT {
            return Err(RouterError::QueueFull);
        }
        let mut session = Session::outbound(
            self.crypto,
            self.identity.clone(),
            rc.clone(),
            remote,
            now,
        );
        self.send_outbox(&mut session);
        self.pending.entry(remote).or_default().push(session);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Tick every session, erase the dead, and flush pending datagrams.
    pub fn pump(&mut self, now: u64) -> Vec<LinkEvent> {
        let mut events = Vec::new();

        // Authed sessions first.
        let peers: Vec<RouterId> = self.authed.keys().copied().collect();
        for peer in peers {
            let Some(sessions) = self.authed.remove(&peer) else {
                continue;
            };
            let (dead, mut alive): (Vec<Session>, Vec<Session>) =
                sessions.into_iter().partition(|s| s.timed_out(now));
            for session in alive.iter_mut() {
                session.tick(now);
            }
            if !alive.is_empty() {
                self.authed.insert(peer, alive);
            }
            for mut session in dead {
                info!(%peer, "session timed out");
                let reason = session.close_reason().unwrap_or(CloseReason::Timeout);
                session.close(CloseReason::Timeout, now);
                self.send_outbox(&mut session);
                self.authed_addrs.remove(&session.remote_addr());
                events.push(LinkEvent::SessionClosed { peer, reason });
            }
            self.flush_peer(&peer);
        }

        // Then pending.
        let addrs: Vec<SocketAddr> = self.pending.keys().copied().collect();
        for addr in addrs {
            let Some(sessions) = self.pending.remove(&addr) else {
                continue;
            };
            let (timed_out, mut alive): (Vec<Session>, Vec<Session>) =
                sessions.into_iter().partition(|s| s.timed_out(now));
            for session in alive.iter_mut() {
                session.tick(now);
            }
            if !alive.is_empty() {
                self.pending.insert(addr, alive);
            }
            for mut session in timed_out {
                debug!(%addr, "pending session timed out");
                session.close(CloseReason::Timeout, now);
                self.send_outbox(&mut session);
                events.push(LinkEvent::PendingTimeout {
                    addr,
                    peer: session.remote_id(),
                });
            }
            self.flush_addr(addr);
        }

        events
    }

    /// Visit every authed session. With `randomize`, iteration starts at a
    /// random rotation so callers inspecting only a prefix don't bias toward
    /// map order.
    pub fn for_each_session(&self, mut visit: impl FnMut(&Session), randomize: bool) {
        let sessions: Vec<&Session> = self.authed.values().flatten().collect();
        if sessions.is_empty() {
            return;
        }
        let start = if randomize {
            rand::thread_rng().gen_range(0..sessions.len())
        } else {
            0
        };
        for i in 0..sessions.len() {
            visit(sessions[(start + i) % sessions.len()]);
        }
    }

    /// Mutating visit, used for renegotiation after an RC refresh.
    pub fn for_each_session_mut(&mut self, mut visit: impl FnMut(&mut Session)) {
        let peers: Vec<RouterId> = self.authed.keys().copied().collect();
        for peer in &peers {
            if let Some(sessions) = self.authed.get_mut(peer) {
                for session in sessions.iter_mut() {
                    visit(session);
                }
            }
            self.flush_peer(peer);
        }
    }

    pub fn has_session_to(&self, remote: &RouterId) -> bool {
        self.authed
            .get(remote)
            .map(|v| v.iter().any(|s| s.is_established()))
            .unwrap_or(false)
    }

    /// Count of distinct connected peers.
    pub fn num_connected(&self) -> usize {
        self.authed
            .values()
            .filter(|v| v.iter().any(|s| s.is_established()))
            .count()
    }

    pub fn connected_peers(&self) -> Vec<RouterId> {
        self.authed
            .iter()
            .filter(|(_, v)| v.iter().any(|s| s.is_established()))
            .map(|(id, _)| *id)
            .collect()
    }

    /// Sessions (authed or pending) currently present for `peer`.
    pub fn session_count(&self, peer: &RouterId) -> usize {
        self.authed.get(peer).map(|v| v.len()).unwrap_or(0)
    }

    pub fn pending_count(&self, addr: &SocketAddr) -> usize {
        self.pending.get(addr).map(|v| v.len()).unwrap_or(0)
    }

    /// Close every session to `remote`.
    pub fn close_session_to(&mut self, remote: &RouterId, now: u64) {
        if let Some(mut sessions) = self.authed.remove(remote) {
            info!(peer = %remote, "closing all sessions");
            for session in sessions.iter_mut() {
                self.authed_addrs.remove(&session.remote_addr());
                session.close(CloseReason::Normal, now);
                self.send_outbox(session);
            }
        }
    }

    /// Shut the whole layer down.
    pub fn stop(&mut self, now: u64) {
        for sessions in self.authed.values_mut() {
            for session in sessions.iter_mut() {
                session.close(CloseReason::Shutdown, now);
            }
        }
        for sessions in self.pending.values_mut() {
            for session in sessions.iter_mut() {
                session.close(CloseReason::Shutdown, now);
            }
        }
        let peers: Vec<RouterId> = self.authed.keys().copied().collect();
        for peer in peers {
            self.flush_peer(&peer);
        }
        let addrs: Vec<SocketAddr> = self.pending.keys().copied().collect();
        for addr in addrs {
            self.flush_addr(addr);
        }
        self.authed.clear();
        self.authed_addrs.clear();
        self.pending.clear();
    }

    // ------------------------------------------------------------------
    // Socket plumbing
    // ------------------------------------------------------------------

    fn flush_peer(&mut self, peer: &RouterId) {
        let socket = self.socket.clone();
        if let Some(sessions) = self.authed.get_mut(peer) {
            for session in sessions.iter_mut() {
                let addr = session.remote_addr();
                for datagram in session.take_outbox() {
                    send_datagram(&socket, &datagram, addr);
                }
            }
        }
    }

    fn flush_addr(&mut self, addr: SocketAddr) {
        let socket = self.socket.clone();
        if let Some(sessions) = self.pending.get_mut(&addr) {
            for session in sessions.iter_mut() {
                for datagram in session.take_outbox() {
                    send_datagram(&socket, &datagram, addr);
                }
            }
        }
        if let Some(peer) = self.authed_addrs.get(&addr).copied() {
            self.flush_peer(&peer);
        }
    }

    fn send_outbox(&self, session: &mut Session) {
        let addr = session.remote_addr();
        for datagram in session.take_outbox() {
            send_datagram(&self.socket, &datagram, addr);
        }
    }
}

fn send_datagram(socket: &UdpSocket, datagram: &[u8], addr: SocketAddr) {
    // Non-blocking; a full socket buffer loses the datagram, which the
    // session retransmission timer absorbs.
    if let Err(e) = socket.try_send_to(datagram, addr) {
        if e.kind() != std::io::ErrorKind::WouldBlock {
            trace!(%addr, error = %e, "udp send failed");
        }
    }
}

// ============================================================================
// Arena operations
// ============================================================================
//
// A router owns one link layer per bound interface/dialect. These free
// functions span the whole arena; per-layer state stays private to each
// LinkLayer.

/// True if any layer has an established session to `remote`.
pub fn has_session_any(links: &[LinkLayer], remote: &RouterId) -> bool {
    links.iter().any(|l| l.has_session_to(remote))
}

/// True if any layer can take another frame for `remote` right now.
pub fn can_send_any(links: &[LinkLayer], remote: &RouterId) -> bool {
    links.iter().any(|l| l.can_send_to(remote))
}

/// Distinct connected peers across every layer.
pub fn connected_peers_all(links: &[LinkLayer]) -> Vec<RouterId> {
    let mut peers: HashSet<RouterId> = HashSet::new();
    for link in links {
        peers.extend(link.connected_peers());
    }
    peers.into_iter().collect()
}

/// Count of distinct connected peers across every layer.
pub fn num_connected_all(links: &[LinkLayer]) -> usize {
    let mut peers: HashSet<RouterId> = HashSet::new();
    for link in links {
        peers.extend(link.connected_peers());
    }
    peers.len()
}

/// Send over the layer whose best session to `remote` has the lowest
/// backlog. With no session anywhere, the completion comes back untouched.
pub fn send_to_best(
    links: &mut [LinkLayer],
    remote: &RouterId,
    message: &LinkMessage,
    completion: Option<SendCompletion>,
    now: u64,
) -> Result<(), Option<SendCompletion>> {
    let best = links
        .iter()
        .enumerate()
        .filter_map(|(i, l)| l.best_backlog_to(remote).map(|b| (i, b)))
        .min_by_key(|(_, backlog)| *backlog)
        .map(|(i, _)| i);
    match best {
        Some(i) => links[i].send_to(remote, message, completion, now),
        None => Err(completion),
    }
}

/// Start establishment on the first layer that can speak to one of the RC's
/// addresses. Returns the last error when none can.
pub fn try_establish_any(
    links: &mut [LinkLayer],
    rc: &RouterContact,
    now: u64,
) -> Result<(), RouterError> {
    let mut last = RouterError::PeerNotAllowed;
    for link in links.iter_mut() {
        match link.try_establish_to(rc, now) {
            Ok(()) => return Ok(()),
            Err(e) => last = e,
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::now_ms;

    async fn test_layer(allow_inbound: bool) -> (LinkLayer, SecretKey) {
        let crypto = Crypto::new();
        let identity = SecretKey::generate();
        let (layer, _socket) = LinkLayer::bind(
            crypto,
            identity.clone(),
            crypto.encryption_keygen(),
            "127.0.0.1:0".parse().unwrap(),
            allow_inbound,
        )
        .await
        .unwrap();
        (layer, identity)
    }

    fn make_rc(crypto: &Crypto, port: u16, now: u64) -> (SecretKey, RouterContact) {
        let identity = SecretKey::generate();
        let enc = crypto.encryption_keygen();
        let mut rc = RouterContact::new(
            "veilnet".into(),
            vec![AddressInfo {
                dialect: DIALECT.into(),
                pubkey: identity.public_key(),
                rank: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port,
            }],
        );
        rc.sign(crypto, &identity, *enc.public_key().as_bytes(), now);
        (identity, rc)
    }

    /// Drive datagrams between two in-process link layers until quiet.
    async fn shuttle(
        a: &mut LinkLayer,
        a_sock: &Arc<UdpSocket>,
        b: &mut LinkLayer,
        b_sock: &Arc<UdpSocket>,
        now: u64,
    ) -> Vec<LinkEvent> {
        let allow = |_: &RouterId| true;
        let mut events = Vec::new();
        let mut buf = [0u8; 65536];
        for _ in 0..64 {
            let mut progressed = false;
            while let Ok((len, from)) = a_sock.try_recv_from(&mut buf) {
                events.extend(a.recv_from(from, &buf[..len], now, &allow));
                progressed = true;
            }
            while let Ok((len, from)) = b_sock.try_recv_from(&mut buf) {
                events.extend(b.recv_from(from, &buf[..len], now, &allow));
                progressed = true;
            }
            if !progressed {
                // Give the kernel a moment to surface in-flight datagrams.
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let mut any = false;
                for (layer, sock) in [(&mut *a, a_sock), (&mut *b, b_sock)] {
                    while let Ok((len, from)) = sock.try_recv_from(&mut buf) {
                        events.extend(layer.recv_from(from, &buf[..len], now, &allow));
                        any = true;
                    }
                }
                if !any {
                    break;
                }
            }
        }
        events
    }

    #[tokio::test]
    async fn establish_between_two_layers() {
        let now = now_ms();
        let crypto = Crypto::new();

        let a_id = SecretKey::generate();
        let b_id = SecretKey::generate();
        let (mut a, a_sock) = LinkLayer::bind(crypto, a_id.clone(), crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let (mut b, b_sock) = LinkLayer::bind(crypto, b_id.clone(), crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();

        // Hand-build B's RC pointing at its bound port.
        let enc = crypto.encryption_keygen();
        let mut b_rc = RouterContact::new(
            "veilnet".into(),
            vec![AddressInfo {
                dialect: DIALECT.into(),
                pubkey: b_id.public_key(),
                rank: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port: b.local_addr().port(),
            }],
        );
        b_rc.sign(&crypto, &b_id, *enc.public_key().as_bytes(), now);

        a.try_establish_to(&b_rc, now).unwrap();
        assert_eq!(a.pending_count(&b.local_addr()), 1);

        let events = shuttle(&mut a, &a_sock, &mut b, &b_sock, now).await;

        assert!(a.has_session_to(&b_id.public_key()));
        assert!(b.has_session_to(&a_id.public_key()));
        assert_eq!(a.num_connected(), 1);
        assert_eq!(b.num_connected(), 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::SessionEstablished { inbound: false, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::SessionEstablished { inbound: true, .. })));
    }

    #[tokio::test]
    async fn message_travels_between_layers() {
        let now = now_ms();
        let crypto = Crypto::new();
        let a_id = SecretKey::generate();
        let b_id = SecretKey::generate();
        let (mut a, a_sock) = LinkLayer::bind(crypto, a_id.clone(), crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let (mut b, b_sock) = LinkLayer::bind(crypto, b_id.clone(), crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let enc = crypto.encryption_keygen();
        let mut b_rc = RouterContact::new(
            "veilnet".into(),
            vec![AddressInfo {
                dialect: DIALECT.into(),
                pubkey: b_id.public_key(),
                rank: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port: b.local_addr().port(),
            }],
        );
        b_rc.sign(&crypto, &b_id, *enc.public_key().as_bytes(), now);
        a.try_establish_to(&b_rc, now).unwrap();
        shuttle(&mut a, &a_sock, &mut b, &b_sock, now).await;

        let msg = LinkMessage::PathConfirm { path_id: [9; 16] };
        assert!(a.send_to(&b_id.public_key(), &msg, None, now).is_ok());

        let events = shuttle(&mut a, &a_sock, &mut b, &b_sock, now).await;
        assert!(events.iter().any(|e| matches!(
            e,
            LinkEvent::Message {
                message: LinkMessage::PathConfirm { path_id: [9, ..] },
                ..
            }
        )));
    }

    #[tokio::test]
    async fn send_to_unknown_peer_hands_back_completion() {
        let (mut layer, _) = test_layer(true).await;
        let unknown = SecretKey::generate().public_key();
        let completion: SendCompletion = Box::new(|_| panic!("must not fire"));
        let result = layer.send_to(
            &unknown,
            &LinkMessage::PathConfirm { path_id: [0; 16] },
            Some(completion),
            now_ms(),
        );
        match result {
            Err(Some(_)) => {}
            other => panic!("expected unconsumed completion, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn establish_requires_matching_dialect() {
        let now = now_ms();
        let crypto = Crypto::new();
        let (mut layer, _) = test_layer(true).await;

        let identity = SecretKey::generate();
        let mut rc = RouterContact::new(
            "veilnet".into(),
            vec![AddressInfo {
                dialect: "other-proto".into(),
                pubkey: identity.public_key(),
                rank: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port: 9999,
            }],
        );
        rc.sign(&crypto, &identity, [0; 32], now);

        assert_eq!(
            layer.try_establish_to(&rc, now),
            Err(RouterError::PeerNotAllowed)
        );
    }

    #[tokio::test]
    async fn pending_endpoint_cap_enforced() {
        let now = now_ms();
        let crypto = Crypto::new();
        let (mut layer, _) = test_layer(true).await;

        let (_, rc) = make_rc(&crypto, 4567, now);
        for _ in 0..MAX_SESSIONS_PER_ENDPOINT {
            layer.try_establish_to(&rc, now).unwrap();
        }
        assert_eq!(
            layer.try_establish_to(&rc, now),
            Err(RouterError::QueueFull)
        );
        let addr: SocketAddr = "127.0.0.1:4567".parse().unwrap();
        assert_eq!(layer.pending_count(&addr), MAX_SESSIONS_PER_ENDPOINT);
    }

    #[tokio::test]
    async fn inbound_refused_when_not_permitted() {
        let (mut layer, _) = test_layer(false).await;
        let from: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        let events = layer.recv_from(from, &[0x01, 0, 0, 0], now_ms(), &|_| true);
        assert!(events.is_empty());
        assert_eq!(layer.pending_count(&from), 0);
    }

    #[tokio::test]
    async fn garbage_from_new_endpoint_leaves_no_state() {
        let (mut layer, _) = test_layer(true).await;
        let from: SocketAddr = "127.0.0.1:5556".parse().unwrap();
        layer.recv_from(from, b"complete nonsense", now_ms(), &|_| true);
        assert_eq!(layer.pending_count(&from), 0);
    }

    #[tokio::test]
    async fn pending_timeout_reported_and_erased() {
        let now = now_ms();
        let crypto = Crypto::new();
        let (mut layer, _) = test_layer(true).await;
        let (_, rc) = make_rc(&crypto, 4568, now);
        layer.try_establish_to(&rc, now).unwrap();

        let events = layer.pump(now + crate::session::HANDSHAKE_TIMEOUT + 1);
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::PendingTimeout { peer: Some(p), .. } if *p == rc.pubkey)));
        let addr: SocketAddr = "127.0.0.1:4568".parse().unwrap();
        assert_eq!(layer.pending_count(&addr), 0);
    }

    #[tokio::test]
    async fn session_timeout_closes_and_reports() {
        let now = now_ms();
        let crypto = Crypto::new();
        let a_id = SecretKey::generate();
        let b_id = SecretKey::generate();
        let (mut a, a_sock) = LinkLayer::bind(crypto, a_id, crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let (mut b, b_sock) = LinkLayer::bind(crypto, b_id.clone(), crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let enc = crypto.encryption_keygen();
        let mut b_rc = RouterContact::new(
            "veilnet".into(),
            vec![AddressInfo {
                dialect: DIALECT.into(),
                pubkey: b_id.public_key(),
                rank: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port: b.local_addr().port(),
            }],
        );
        b_rc.sign(&crypto, &b_id, *enc.public_key().as_bytes(), now);
        a.try_establish_to(&b_rc, now).unwrap();
        shuttle(&mut a, &a_sock, &mut b, &b_sock, now).await;
        assert!(a.has_session_to(&b_id.public_key()));

        // Silence past the timeout; pump detects, closes, erases.
        let later = now + crate::session::SESSION_TIMEOUT + 1;
        let events = a.pump(later);
        assert!(events
            .iter()
            .any(|e| matches!(e, LinkEvent::SessionClosed { peer, .. } if *peer == b_id.public_key())));
        assert!(!a.has_session_to(&b_id.public_key()));
        assert_eq!(a.num_connected(), 0);
    }

    /// Drive a real handshake and hand back the server-side `Linked` session
    /// as the link layer would hold it in `pending` for `client_addr`.
    fn established_inbound(
        crypto: Crypto,
        server_identity: &SecretKey,
        server_rc: &RouterContact,
        client_identity: &SecretKey,
        client_addr: SocketAddr,
        now: u64,
    ) -> Session {
        let mut client = Session::outbound(
            crypto,
            client_identity.clone(),
            server_rc.clone(),
            "127.0.0.1:1".parse().unwrap(),
            now,
        );
        let mut server = Session::inbound(crypto, server_identity.clone(), client_addr, now);
        for _ in 0..8 {
            let c_out = client.take_outbox();
            let s_out = server.take_outbox();
            if c_out.is_empty() && s_out.is_empty() {
                break;
            }
            for d in c_out {
                server.recv_raw(&d, now);
            }
            for d in s_out {
                client.recv_raw(&d, now);
            }
        }
        assert!(server.is_established(), "handshake must complete");
        server
    }

    #[tokio::test]
    async fn authed_cap_rejects_seventeenth_session() {
        let now = now_ms();
        let crypto = Crypto::new();
        let (mut layer, _) = test_layer(true).await;

        // One peer identity, sessions arriving from seventeen endpoints.
        let server_identity = SecretKey::generate();
        let enc = crypto.encryption_keygen();
        let mut server_rc = RouterContact::new("veilnet".into(), Vec::new());
        server_rc.sign(&crypto, &server_identity, *enc.public_key().as_bytes(), now);
        let client_identity = SecretKey::generate();
        let peer = client_identity.public_key();

        for i in 0..=MAX_SESSIONS_PER_KEY {
            let addr: SocketAddr = format!("127.0.0.1:{}", 9100 + i).parse().unwrap();
            let session = established_inbound(
                crypto,
                &server_identity,
                &server_rc,
                &client_identity,
                addr,
                now,
            );
            layer.pending.entry(addr).or_default().push(session);
            let mapped = layer.map_addr(&peer, addr);
            if i < MAX_SESSIONS_PER_KEY {
                assert!(mapped, "session {i} should be promoted");
            } else {
                assert!(!mapped, "session past the cap must be rejected");
                // The rejected session was closed and its pending entry erased.
                assert_eq!(layer.pending_count(&addr), 0);
            }
        }

        assert_eq!(layer.session_count(&peer), MAX_SESSIONS_PER_KEY);
        let mut visited = 0;
        layer.for_each_session(|_| visited += 1, false);
        assert_eq!(visited, MAX_SESSIONS_PER_KEY);
        let mut visited_rand = 0;
        layer.for_each_session(|_| visited_rand += 1, true);
        assert_eq!(visited_rand, MAX_SESSIONS_PER_KEY);
    }

    #[tokio::test]
    async fn map_addr_without_pending_entry_fails() {
        let (mut layer, _) = test_layer(true).await;
        let peer = SecretKey::generate().public_key();
        assert!(!layer.map_addr(&peer, "127.0.0.1:9099".parse().unwrap()));
    }

    #[tokio::test]
    async fn for_each_session_visits_all() {
        let now = now_ms();
        let crypto = Crypto::new();
        let a_id = SecretKey::generate();
        let b_id = SecretKey::generate();
        let (mut a, a_sock) = LinkLayer::bind(crypto, a_id, crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let (mut b, b_sock) = LinkLayer::bind(crypto, b_id.clone(), crypto.encryption_keygen(), "127.0.0.1:0".parse().unwrap(), true)
            .await
            .unwrap();
        let enc = crypto.encryption_keygen();
        let mut b_rc = RouterContact::new(
            "veilnet".into(),
            vec![AddressInfo {
                dialect: DIALECT.into(),
                pubkey: b_id.public_key(),
                rank: 1,
                ip: "127.0.0.1".parse().unwrap(),
                port: b.local_addr().port(),
            }],
        );
        b_rc.sign(&crypto, &b_id, *enc.public_key().as_bytes(), now);
        a.try_establish_to(&b_rc, now).unwrap();
        shuttle(&mut a, &a_sock, &mut b, &b_sock, now).await;

        let mut visited = 0;
        a.for_each_session(|_| visited += 1, false);
        assert_eq!(visited, 1);
        let mut visited_rand = 0;
        a.for_each_session(|_| visited_rand += 1, true);
        assert_eq!(visited_rand, 1);
    }
}
