//! Protocol message types.
//!
//! Every datagram carries exactly one [`Message`]: an 11-byte header
//! (`kind | seq | frame | payload_len`) followed by a kind-specific payload.
//! The `frame` header field is overloaded: for [`MessageBody::Input`] it
//! names the first frame of the input batch; for every other kind it carries
//! the sender's receive frontier for the destination peer's side, which is
//! how input acknowledgement piggybacks on all traffic.

use std::net::SocketAddr;

use crate::sync_state::SyncState;
use crate::{Frame, Side};

/// `Reject` code for a join refused because the lobby already has
/// `num_players` sides filled. Codes 1–4 are [`SyncMismatch`] codes.
///
/// [`SyncMismatch`]: crate::SyncMismatch
pub(crate) const REJECT_SESSION_FULL: u8 = 10;

/// Side index carried on the wire for a peer with no input slot (observer).
pub(crate) const OBSERVER_SIDE: u8 = 0xFF;

/// One-byte message kind tags. Fixed by the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub(crate) enum MessageKind {
    Join = 1,
    Accept = 2,
    Reject = 3,
    Delay = 4,
    Ready = 5,
    Input = 6,
    Ack = 7,
    Chat = 8,
    EndSession = 9,
    Ping = 10,
    Pong = 11,
}

impl MessageKind {
    pub(crate) fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Join,
            2 => Self::Accept,
            3 => Self::Reject,
            4 => Self::Delay,
            5 => Self::Ready,
            6 => Self::Input,
            7 => Self::Ack,
            8 => Self::Chat,
            9 => Self::EndSession,
            10 => Self::Ping,
            11 => Self::Pong,
            _ => return None,
        })
    }
}

/// A peer roster entry inside an `Accept`.
///
/// Input exchange is a full mesh, so every client needs every other
/// participant's endpoint; the host is the only peer that learns addresses
/// first-hand (from `Join` datagrams) and relays them here. The recipient's
/// own entry is *not* included; its assignment travels in `your_side`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerEntry {
    /// Assigned side, or [`OBSERVER_SIDE`].
    pub side: u8,
    pub username: String,
    /// The peer's UDP endpoint as observed by the host.
    pub addr: SocketAddr,
}

/// The kind-specific payload of a message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum MessageBody {
    /// Client → host: request to join with the client's snapshot.
    Join {
        username: String,
        observer: bool,
        sync_state: SyncState,
    },
    /// Host → client: accepted roster. Re-broadcast on every roster change.
    /// `your_side` is the recipient's assignment ([`OBSERVER_SIDE`] for
    /// observers), so clients never infer their side from list order.
    Accept {
        num_players: u8,
        your_side: u8,
        peers: Vec<PeerEntry>,
        sync_state: SyncState,
    },
    /// Host → client: join refused.
    Reject { code: u8, text: String },
    /// Host → all: the session-wide input delay, in frames.
    Delay { input_delay: u8 },
    /// Sender has everything it needs to start.
    Ready,
    /// A batch of consecutive input records for one side. The first frame of
    /// the batch is the header `frame`; `bytes` holds `count` records of
    /// [`NUM_SYNC_INPUTS`] bytes each. `ack_frontier` is the sender's receive
    /// frontier for the *recipient's* side.
    ///
    /// [`NUM_SYNC_INPUTS`]: crate::NUM_SYNC_INPUTS
    Input {
        side: Side,
        ack_frontier: Frame,
        bytes: Vec<u8>,
    },
    /// Acknowledges receipt of the reliable message carrying `acked_seq`.
    Ack { acked_seq: u32 },
    /// Lobby chat line.
    Chat { username: String, text: String },
    /// The sender is tearing the session down.
    EndSession,
    /// Keep-alive probe.
    Ping { nonce: u32 },
    /// Keep-alive response, echoing the probe's nonce.
    Pong { nonce: u32 },
}

impl MessageBody {
    pub(crate) fn kind(&self) -> MessageKind {
        match self {
            Self::Join { .. } => MessageKind::Join,
            Self::Accept { .. } => MessageKind::Accept,
            Self::Reject { .. } => MessageKind::Reject,
            Self::Delay { .. } => MessageKind::Delay,
            Self::Ready => MessageKind::Ready,
            Self::Input { .. } => MessageKind::Input,
            Self::Ack { .. } => MessageKind::Ack,
            Self::Chat { .. } => MessageKind::Chat,
            Self::EndSession => MessageKind::EndSession,
            Self::Ping { .. } => MessageKind::Ping,
            Self::Pong { .. } => MessageKind::Pong,
        }
    }

    /// Reliable messages are retransmitted under exponential backoff until
    /// acknowledged. `Input` is deliberately not reliable: records are
    /// idempotent by (side, frame) and re-sent opportunistically instead.
    /// `EndSession` is acknowledged but retransmitted only a bounded number
    /// of times (the session is dying either way).
    pub(crate) fn is_reliable(&self) -> bool {
        matches!(
            self,
            Self::Join { .. }
                | Self::Accept { .. }
                | Self::Delay { .. }
                | Self::Ready
                | Self::Chat { .. }
        )
    }

    /// Whether the receiver must answer this message with an `Ack`.
    pub(crate) fn wants_ack(&self) -> bool {
        self.is_reliable() || matches!(self, Self::EndSession)
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Message {
    /// Per-peer sequence number, unique over the life of the channel.
    pub seq: u32,
    /// See the module docs for the overloaded meaning of this field.
    pub frame: Frame,
    pub body: MessageBody,
}

impl Message {
    pub(crate) fn kind(&self) -> MessageKind {
        self.body.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_round_trip() {
        for tag in 1..=11u8 {
            let kind = MessageKind::from_u8(tag).unwrap();
            assert_eq!(kind as u8, tag);
        }
        assert!(MessageKind::from_u8(0).is_none());
        assert!(MessageKind::from_u8(12).is_none());
    }

    #[test]
    fn reliability_classification() {
        assert!(MessageBody::Ready.is_reliable());
        assert!(MessageBody::Delay { input_delay: 3 }.is_reliable());
        assert!(MessageBody::Chat {
            username: "A".into(),
            text: "hi".into()
        }
        .is_reliable());

        assert!(!MessageBody::Ack { acked_seq: 1 }.is_reliable());
        assert!(!MessageBody::Ping { nonce: 2 }.is_reliable());
        assert!(!MessageBody::Input {
            side: Side::HOST,
            ack_frontier: Frame::ZERO,
            bytes: vec![0; crate::NUM_SYNC_INPUTS],
        }
        .is_reliable());

        // EndSession is acked but not reliably retransmitted.
        assert!(!MessageBody::EndSession.is_reliable());
        assert!(MessageBody::EndSession.wants_ack());
    }
}
