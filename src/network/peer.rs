//! The per-peer reliability channel.
//!
//! A [`PeerChannel`] layers at-least-once delivery over the datagram
//! endpoint for one remote address: it assigns sequence numbers, suppresses
//! duplicates on receive, retransmits unacknowledged reliable messages under
//! exponential backoff, and watches for silence. The channel never touches a
//! socket itself: it encodes into byte buffers and hands them back to the
//! caller, so no lock is ever held across a send.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::network::codec;
use crate::network::messages::{Message, MessageBody};
use crate::sessions::config::ProtocolTuning;
use crate::{Frame, Side};

/// A reliable message awaiting acknowledgement.
#[derive(Debug)]
struct Pending {
    seq: u32,
    encoded: Vec<u8>,
    next_resend: Instant,
    backoff: Duration,
    /// `Some(n)`: give up after `n` more retransmissions (`EndSession`).
    attempts_left: Option<u32>,
}

/// Reliability and bookkeeping state for one remote peer.
#[derive(Debug)]
pub(crate) struct PeerChannel {
    /// The peer's UDP endpoint. Peers are identified by address.
    pub addr: SocketAddr,
    /// Display name, learned from `Join`/`Accept`.
    pub username: String,
    /// The input side this peer owns, or `None` for observers.
    pub side: Option<Side>,
    /// Whether the peer has sent `Ready`.
    pub ready: bool,
    /// Highest frame of *our* inputs the peer has confirmed receiving,
    /// exclusive. Piggybacked on all of the peer's traffic.
    pub acked_frontier: Frame,
    /// Wall-clock instant of the last datagram from this peer.
    pub last_recv: Instant,
    /// Wall-clock instant of the last datagram we sent to this peer.
    pub last_send: Instant,
    /// Round-trip estimate from the last completed Ping/Pong, if any.
    pub rtt: Option<Duration>,

    next_seq: u32,
    delivered: BTreeSet<u32>,
    pending: Vec<Pending>,
    ping_in_flight: Option<(u32, Instant)>,
    next_ping_nonce: u32,
    /// Total retransmissions performed on this channel.
    pub retransmit_count: u64,
}

impl PeerChannel {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            addr,
            username: String::new(),
            side: None,
            ready: false,
            acked_frontier: Frame::ZERO,
            last_recv: now,
            last_send: now,
            rtt: None,
            next_seq: 0,
            delivered: BTreeSet::new(),
            pending: Vec::new(),
            ping_in_flight: None,
            next_ping_nonce: 0,
            retransmit_count: 0,
        }
    }

    fn assign_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Encodes `body` for this peer and registers it for retransmission if
    /// reliable. Returns the assigned sequence number and the wire bytes for
    /// the caller to send.
    ///
    /// `frame` is the piggybacked receive frontier stamped into the header;
    /// `Input` batches go through [`compose_input`](Self::compose_input)
    /// instead, which puts the batch start frame there.
    pub(crate) fn compose(
        &mut self,
        body: MessageBody,
        frame: Frame,
        tuning: &ProtocolTuning,
    ) -> (u32, Vec<u8>) {
        let seq = self.assign_seq();
        let reliable = body.is_reliable();
        let msg = Message { seq, frame, body };
        // Encoding a message we just built cannot fail; sizes are bounded by
        // construction. An empty buffer would simply never arrive.
        let encoded = codec::encode(&msg).unwrap_or_default();

        if reliable {
            self.pending.push(Pending {
                seq,
                encoded: encoded.clone(),
                next_resend: Instant::now() + tuning.retransmit_initial,
                backoff: tuning.retransmit_initial,
                attempts_left: None,
            });
        }
        self.note_send();
        (seq, encoded)
    }

    /// Composes an `Input` batch. Unlike [`compose`](Self::compose), the
    /// header frame carries the batch's first frame number and the receive
    /// frontier travels in the payload.
    pub(crate) fn compose_input(
        &mut self,
        side: Side,
        start_frame: Frame,
        ack_frontier: Frame,
        bytes: Vec<u8>,
    ) -> (u32, Vec<u8>) {
        let seq = self.assign_seq();
        let msg = Message {
            seq,
            frame: start_frame,
            body: MessageBody::Input {
                side,
                ack_frontier,
                bytes,
            },
        };
        let encoded = codec::encode(&msg).unwrap_or_default();
        self.note_send();
        (seq, encoded)
    }

    /// Registers an already-composed `EndSession` for its bounded resend
    /// schedule: once per tick, at most `4 × input_delay` times.
    pub(crate) fn track_end_session(
        &mut self,
        seq: u32,
        encoded: Vec<u8>,
        input_delay: u8,
        tuning: &ProtocolTuning,
    ) {
        self.pending.push(Pending {
            seq,
            encoded,
            next_resend: Instant::now() + tuning.tick_interval,
            backoff: tuning.tick_interval,
            attempts_left: Some(4 * u32::from(input_delay).max(1)),
        });
    }

    /// Collects every pending message due for retransmission at `now`,
    /// doubling its backoff up to the cap. Returns the buffers to resend.
    pub(crate) fn due_retransmits(
        &mut self,
        now: Instant,
        tuning: &ProtocolTuning,
    ) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        self.pending.retain_mut(|pending| {
            if pending.next_resend > now {
                return true;
            }
            if let Some(left) = &mut pending.attempts_left {
                if *left == 0 {
                    trace!(seq = pending.seq, "retransmit attempts exhausted");
                    return false;
                }
                *left -= 1;
            }
            out.push(pending.encoded.clone());
            pending.backoff = (pending.backoff * 2).min(tuning.retransmit_cap);
            pending.next_resend = now + pending.backoff;
            true
        });
        self.retransmit_count += out.len() as u64;
        if !out.is_empty() {
            self.note_send();
        }
        out
    }

    /// Whether a keep-alive probe is owed, and the probe body if so.
    pub(crate) fn keepalive_due(&mut self, now: Instant, tuning: &ProtocolTuning) -> Option<u32> {
        if now.duration_since(self.last_send) < tuning.keepalive_interval {
            return None;
        }
        let nonce = self.next_ping_nonce;
        self.next_ping_nonce = self.next_ping_nonce.wrapping_add(1);
        self.ping_in_flight = Some((nonce, now));
        Some(nonce)
    }

    /// Handles an incoming `Pong`, updating the RTT estimate.
    pub(crate) fn on_pong(&mut self, nonce: u32) {
        if let Some((expected, sent_at)) = self.ping_in_flight {
            if expected == nonce {
                self.rtt = Some(sent_at.elapsed());
                self.ping_in_flight = None;
            }
        }
    }

    /// Removes an acknowledged message from the retransmission list.
    pub(crate) fn on_ack(&mut self, acked_seq: u32) {
        self.pending.retain(|p| p.seq != acked_seq);
    }

    /// Duplicate suppression: returns `true` the first time `seq` is seen,
    /// `false` for a replay. The caller acks either way so a lost ack does
    /// not keep the sender retransmitting.
    pub(crate) fn accept_seq(&mut self, seq: u32) -> bool {
        self.delivered.insert(seq)
    }

    /// Raises the peer's input acknowledgement frontier (it never moves
    /// backwards: stale retransmits carry stale frontiers).
    pub(crate) fn raise_acked_frontier(&mut self, frontier: Frame) {
        if frontier > self.acked_frontier {
            self.acked_frontier = frontier;
        }
    }

    /// Marks traffic received from this peer.
    pub(crate) fn note_recv(&mut self) {
        self.last_recv = Instant::now();
    }

    /// Marks traffic sent to this peer.
    pub(crate) fn note_send(&mut self) {
        self.last_send = Instant::now();
    }

    /// How long the peer has been silent.
    pub(crate) fn silence(&self, now: Instant) -> Duration {
        now.duration_since(self.last_recv)
    }

    /// Whether any reliable message remains unacknowledged.
    pub(crate) fn has_unacked(&self) -> bool {
        self.pending.iter().any(|p| p.attempts_left.is_none())
    }

    /// Whether the capped `EndSession` resend schedule has finished (acked
    /// or exhausted).
    pub(crate) fn end_session_drained(&self) -> bool {
        !self
            .pending
            .iter()
            .any(|p| p.attempts_left.is_some())
    }
}
