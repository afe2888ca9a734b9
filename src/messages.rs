//! # Wire Protocol Messages
//!
//! Serializable message types for both protocol levels:
//!
//! | Level | Type | Carried by |
//! |-------|------|-----------|
//! | Link frame | [`LinkFrame`] | one UDP datagram, 1-byte type then payload |
//! | Link message | [`LinkMessage`] | decrypted data frames, dispatched upward |
//! | DHT message | [`DhtMessage`] | `LinkMessage::Dht`, routed by the DHT core |
//!
//! Everything is bincode with size limits; all deserialization of untrusted
//! bytes goes through [`deserialize_bounded`].

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::identity::{DhtKey, RouterId};
use crate::intro::EncryptedIntroSet;
use crate::rc::RouterContact;

/// Protocol version carried in DHT messages and signed records.
pub const PROTOCOL_VERSION: u64 = 0;

/// Identifier of one path at one hop.
pub type PathId = [u8; 16];

/// Maximum size of any single wire message.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Deserialization buffer limit; slightly above the message limit to allow
/// for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_MESSAGE_SIZE as u64) + 4096;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced. Use this for every untrusted buffer.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

// ============================================================================
// Link frames (datagram level)
// ============================================================================

/// Frame type tags. One leading byte on every datagram.
pub mod frame_type {
    pub const INTRO: u8 = 0x01;
    pub const INTRO_ACK: u8 = 0x02;
    pub const DATA: u8 = 0x03;
    pub const ACK: u8 = 0x04;
    pub const PING: u8 = 0x05;
    pub const REKEY: u8 = 0x06;
    pub const CLOSE: u8 = 0x07;
}

/// First datagram of a handshake. Sent in the clear, authenticity from the
/// signature over the ephemeral key.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntroFrame {
    /// Initiator's identity key.
    pub initiator: RouterId,
    /// Initiator's ephemeral X25519 public key.
    pub ephemeral: [u8; 32],
    /// Wall-clock of frame creation, for replayed-intro rejection.
    pub timestamp: u64,
    pub version: u64,
    /// Identity signature over `(ephemeral, timestamp)`.
    pub signature: Vec<u8>,
}

/// Responder half of the handshake.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IntroAckFrame {
    pub responder: RouterId,
    pub ephemeral: [u8; 32],
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// Sequenced, encrypted payload frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataFrame {
    pub seq: u64,
    pub ciphertext: Vec<u8>,
}

/// Cumulative acknowledgement: every frame with `seq <= acked` has arrived.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AckFrame {
    pub acked: u64,
}

/// Keepalive, encrypted like data so it also proves liveness of the keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PingFrame {
    pub seq: u64,
    pub ciphertext: Vec<u8>,
}

/// Mid-session rekey offer. Signed with the identity key; carries the fresh
/// ephemeral for the next epoch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RekeyFrame {
    pub ephemeral: [u8; 32],
    pub epoch: u64,
    pub signature: Vec<u8>,
}

/// Session teardown notice.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloseFrame {
    pub reason: u8,
}

/// One UDP datagram.
#[derive(Clone, Debug)]
pub enum LinkFrame {
    Intro(IntroFrame),
    IntroAck(IntroAckFrame),
    Data(DataFrame),
    Ack(AckFrame),
    Ping(PingFrame),
    Rekey(RekeyFrame),
    Close(CloseFrame),
}

impl LinkFrame {
    /// Encode as the 1-byte type tag followed by the typed payload.
    pub fn encode(&self) -> Vec<u8> {
        fn with_tag<T: Serialize>(tag: u8, payload: &T) -> Vec<u8> {
            let body = bincode::serialize(payload).expect("frame serialization is infallible");
            let mut out = Vec::with_capacity(1 + body.len());
            out.push(tag);
            out.extend_from_slice(&body);
            out
        }
        match self {
            LinkFrame::Intro(f) => with_tag(frame_type::INTRO, f),
            LinkFrame::IntroAck(f) => with_tag(frame_type::INTRO_ACK, f),
            LinkFrame::Data(f) => with_tag(frame_type::DATA, f),
            LinkFrame::Ack(f) => with_tag(frame_type::ACK, f),
            LinkFrame::Ping(f) => with_tag(frame_type::PING, f),
            LinkFrame::Rekey(f) => with_tag(frame_type::REKEY, f),
            LinkFrame::Close(f) => with_tag(frame_type::CLOSE, f),
        }
    }

    /// Decode a datagram. `None` for unknown tags, truncation, or garbage.
    pub fn decode(datagram: &[u8]) -> Option<Self> {
        let (&tag, body) = datagram.split_first()?;
        match tag {
            frame_type::INTRO => deserialize_bounded(body).ok().map(LinkFrame::Intro),
            frame_type::INTRO_ACK => deserialize_bounded(body).ok().map(LinkFrame::IntroAck),
            frame_type::DATA => deserialize_bounded(body).ok().map(LinkFrame::Data),
            frame_type::ACK => deserialize_bounded(body).ok().map(LinkFrame::Ack),
            frame_type::PING => deserialize_bounded(body).ok().map(LinkFrame::Ping),
            frame_type::REKEY => deserialize_bounded(body).ok().map(LinkFrame::Rekey),
            frame_type::CLOSE => deserialize_bounded(body).ok().map(LinkFrame::Close),
            _ => None,
        }
    }
}

// ============================================================================
// Link messages (decrypted, dispatched upward)
// ============================================================================

/// A message delivered by an established session to the router.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LinkMessage {
    /// DHT request/response traffic.
    Dht(DhtMessage),
    /// Path build request: one sealed record per hop, peeled in order.
    PathBuild { records: Vec<PathBuildRecord> },
    /// Path traffic flowing away from the path owner.
    PathUpstream { path_id: PathId, payload: Vec<u8> },
    /// Path traffic flowing back toward the path owner.
    PathDownstream { path_id: PathId, payload: Vec<u8> },
    /// Confirmation that a path build reached its terminal hop.
    PathConfirm { path_id: PathId },
}

/// One hop's sealed slice of a path build.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathBuildRecord {
    /// Builder's ephemeral X25519 public key for this hop.
    pub ephemeral: [u8; 32],
    /// Sealed [`PathBuildInfo`], encrypted to the hop's encryption key.
    pub nonce: [u8; 24],
    pub ciphertext: Vec<u8>,
}

/// Plaintext of a [`PathBuildRecord`] once the hop opens it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PathBuildInfo {
    /// Path id on the receive side of this hop.
    pub rx_id: PathId,
    /// Path id on the transmit side (toward the next hop).
    pub tx_id: PathId,
    /// Next hop to forward the remaining records to; `None` at the terminal.
    pub next_hop: Option<RouterId>,
    pub lifetime_ms: u64,
}

// ============================================================================
// DHT messages
// ============================================================================

/// DHT traffic. Field meanings follow the glossary: the introset payload, the
/// relay order selecting which pair of closest routers to use, the relayed
/// flag bounding propagation, the transaction id, and the protocol version.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DhtMessage {
    FindIntro {
        target: DhtKey,
        txid: u64,
        relay_order: u64,
        relayed: bool,
    },
    PublishIntro {
        introset: EncryptedIntroSet,
        txid: u64,
        relayed: bool,
        relay_order: u64,
        version: u64,
    },
    GotIntro {
        values: Vec<EncryptedIntroSet>,
        txid: u64,
    },
    FindRouter {
        target: RouterId,
        txid: u64,
        exploratory: bool,
    },
    GotRouter {
        routers: Vec<RouterContact>,
        txid: u64,
    },
}

impl DhtMessage {
    /// Transaction id this message belongs to.
    pub fn txid(&self) -> u64 {
        match self {
            DhtMessage::FindIntro { txid, .. } => *txid,
            DhtMessage::PublishIntro { txid, .. } => *txid,
            DhtMessage::GotIntro { txid, .. } => *txid,
            DhtMessage::FindRouter { txid, .. } => *txid,
            DhtMessage::GotRouter { txid, .. } => *txid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Crypto;
    use crate::identity::SecretKey;
    use crate::intro::{IntroSet, Introduction};
    use crate::util::now_ms;

    fn sealed_introset() -> EncryptedIntroSet {
        let crypto = Crypto::new();
        let owner = SecretKey::generate();
        let set = IntroSet::create(
            &crypto,
            &owner,
            vec![Introduction {
                router: RouterId::from_bytes([3; 32]),
                path_id: [4; 16],
                expires_at: now_ms() + 60_000,
                version: PROTOCOL_VERSION,
            }],
            None,
        );
        EncryptedIntroSet::seal(&crypto, &owner, &set)
    }

    #[test]
    fn link_frame_roundtrip_all_types() {
        let frames = vec![
            LinkFrame::Intro(IntroFrame {
                initiator: RouterId::from_bytes([1; 32]),
                ephemeral: [2; 32],
                timestamp: 12345,
                version: PROTOCOL_VERSION,
                signature: vec![0u8; 64],
            }),
            LinkFrame::IntroAck(IntroAckFrame {
                responder: RouterId::from_bytes([5; 32]),
                ephemeral: [6; 32],
                timestamp: 23456,
                signature: vec![0u8; 64],
            }),
            LinkFrame::Data(DataFrame {
                seq: 42,
                ciphertext: b"opaque".to_vec(),
            }),
            LinkFrame::Ack(AckFrame { acked: 41 }),
            LinkFrame::Ping(PingFrame {
                seq: 43,
                ciphertext: b"ka".to_vec(),
            }),
            LinkFrame::Rekey(RekeyFrame {
                ephemeral: [7; 32],
                epoch: 2,
                signature: vec![0u8; 64],
            }),
            LinkFrame::Close(CloseFrame { reason: 1 }),
        ];

        for frame in frames {
            let encoded = frame.encode();
            let decoded = LinkFrame::decode(&encoded).expect("decode failed");
            assert_eq!(
                std::mem::discriminant(&frame),
                std::mem::discriminant(&decoded)
            );
        }
    }

    #[test]
    fn link_frame_first_byte_is_type_tag() {
        let ack = LinkFrame::Ack(AckFrame { acked: 7 }).encode();
        assert_eq!(ack[0], frame_type::ACK);

        let close = LinkFrame::Close(CloseFrame { reason: 0 }).encode();
        assert_eq!(close[0], frame_type::CLOSE);
    }

    #[test]
    fn unknown_tag_and_garbage_rejected() {
        assert!(LinkFrame::decode(&[]).is_none());
        assert!(LinkFrame::decode(&[0xEE, 1, 2, 3]).is_none());

        let mut truncated = LinkFrame::Data(DataFrame {
            seq: 1,
            ciphertext: vec![0u8; 100],
        })
        .encode();
        truncated.truncate(truncated.len() / 2);
        assert!(LinkFrame::decode(&truncated).is_none());
    }

    #[test]
    fn dht_message_roundtrip_preserves_fields() {
        let msg = DhtMessage::PublishIntro {
            introset: sealed_introset(),
            txid: 77,
            relayed: true,
            relay_order: 1,
            version: PROTOCOL_VERSION,
        };

        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: DhtMessage = deserialize_bounded(&bytes).unwrap();

        match decoded {
            DhtMessage::PublishIntro {
                txid,
                relayed,
                relay_order,
                version,
                introset,
            } => {
                assert_eq!(txid, 77);
                assert!(relayed);
                assert_eq!(relay_order, 1);
                assert_eq!(version, PROTOCOL_VERSION);
                assert!(!introset.ciphertext.is_empty());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn dht_message_txid_accessor() {
        assert_eq!(
            DhtMessage::FindIntro {
                target: [0; 32],
                txid: 5,
                relay_order: 0,
                relayed: false,
            }
            .txid(),
            5
        );
        assert_eq!(
            DhtMessage::GotIntro {
                values: vec![],
                txid: 9
            }
            .txid(),
            9
        );
    }

    #[test]
    fn link_message_dht_roundtrip() {
        let msg = LinkMessage::Dht(DhtMessage::FindIntro {
            target: [8; 32],
            txid: 3,
            relay_order: 1,
            relayed: true,
        });
        let bytes = bincode::serialize(&msg).unwrap();
        let decoded: LinkMessage = deserialize_bounded(&bytes).unwrap();
        match decoded {
            LinkMessage::Dht(DhtMessage::FindIntro {
                target,
                txid,
                relay_order,
                relayed,
            }) => {
                assert_eq!(target, [8; 32]);
                assert_eq!(txid, 3);
                assert_eq!(relay_order, 1);
                assert!(relayed);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn oversized_payload_rejected() {
        let bytes = bincode::serialize(&DataFrame {
            seq: 0,
            ciphertext: vec![0u8; MAX_MESSAGE_SIZE * 2],
        })
        .unwrap();
        assert!(deserialize_bounded::<DataFrame>(&bytes).is_err());
    }
}
