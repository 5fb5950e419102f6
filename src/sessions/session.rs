//! The lock-step session state machine.
//!
//! One [`LockstepSession`] owns three threads of execution:
//!
//! 1. the **emulator thread** (external; it calls in through the hook
//!    adapter and may block in [`poll_input`](LockstepSession::poll_input)),
//! 2. the **receive thread**, which owns the socket's receive side,
//!    dispatches messages, and drives the retransmission tick,
//! 3. the short-lived **connect thread**, which runs the host or join
//!    negotiation until the session is running or dead.
//!
//! # Locking discipline
//!
//! All mutable session state lives in one plain (non-reentrant) mutex.
//! Dispatch and tick handlers mutate state under the lock while *queueing*
//! side effects (datagrams to send, callbacks to invoke) into a local
//! list, and the effects run only after the lock is released. No code path
//! can hold the session lock across a socket call or a user callback, which
//! is what makes the single non-reentrant mutex sufficient.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::frame_info::{FrameInput, NUM_SYNC_INPUTS};
use crate::frame_queue::{FrameQueue, InsertOutcome, WaitError};
use crate::network::codec;
use crate::network::messages::{
    Message, MessageBody, MessageKind, PeerEntry, OBSERVER_SIDE, REJECT_SESSION_FULL,
};
use crate::network::peer::PeerChannel;
use crate::network::socket::DatagramSocket;
use crate::replay::ReplayRecorder;
use crate::report_fault;
use crate::sessions::config::{ProtocolTuning, SessionMode, INPUT_DELAY_RANGE};
use crate::sessions::event::{ExitReason, SessionCallbacks};
use crate::sessions::latch::Latch;
use crate::sync_state::SyncMismatch;
use crate::telemetry::{FaultKind, FaultSeverity};
use crate::{EmulatorHost, Frame, FramelockError, FramelockResult, SessionPhase, Side};

/// Upper bound on the connect latch wait; effectively "until cancelled".
const LATCH_WAIT_CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// Side effects produced under the session lock, executed after release.
enum Effect {
    Send { addr: SocketAddr, bytes: Vec<u8> },
    Userlist(Vec<String>),
    Chat { user: String, text: String },
    ConnectionEstablished(u8),
    Status(String),
}

pub(crate) struct Core {
    pub phase: SessionPhase,
    pub mode: SessionMode,
    pub username: String,
    pub num_players: u8,
    pub local_side: Option<Side>,
    pub input_delay: u8,
    /// Sequence number of the most recently applied `Delay`; a stale
    /// retransmit with a lower seq must not win a renegotiation.
    delay_seq: Option<u32>,
    /// Host: the delay the UI confirmed, arming the running transition.
    confirmed_delay: Option<u8>,
    /// Whether the local `Ready` has been broadcast.
    announced_ready: bool,
    /// Client: whether the host's `Ready` arrived.
    host_ready: bool,
    pub peers: Vec<PeerChannel>,
    /// Client: the host's address (peers[i].addr for the host entry).
    host_addr: Option<SocketAddr>,
    join_sent_at: Option<Instant>,
    pub sync_state: Option<crate::SyncState>,
    pub exit: Option<ExitReason>,
    /// After a terminal transition: deadline for the EndSession drain.
    drain_deadline: Option<Instant>,
    save_replay: bool,
}

impl Core {
    fn peer_index(&self, addr: SocketAddr) -> Option<usize> {
        self.peers.iter().position(|p| p.addr == addr)
    }

    /// Number of player sides filled, counting the local one.
    fn players_present(&self) -> usize {
        1 + self.peers.iter().filter(|p| p.side.is_some()).count()
    }

    fn lowest_free_side(&self) -> Option<Side> {
        (1..self.num_players).map(Side::new).find(|candidate| {
            self.peers.iter().all(|p| p.side != Some(*candidate))
        })
    }

    /// Usernames for the owner's lobby list: local first, then peers in
    /// side order with observers last.
    fn roster(&self) -> Vec<String> {
        let mut entries: Vec<(u8, String)> = self
            .peers
            .iter()
            .map(|p| {
                (
                    p.side.map_or(OBSERVER_SIDE, Side::as_u8),
                    p.username.clone(),
                )
            })
            .collect();
        entries.push((
            self.local_side.map_or(OBSERVER_SIDE, Side::as_u8),
            self.username.clone(),
        ));
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        entries.into_iter().map(|(_, name)| name).collect()
    }

    fn is_host(&self) -> bool {
        self.mode == SessionMode::Host
    }
}

/// Shared state between the session handle and its worker threads.
pub(crate) struct Shared {
    core: Mutex<Core>,
    phase_cv: Condvar,
    queue: FrameQueue,
    socket: Arc<dyn DatagramSocket>,
    callbacks: SessionCallbacks,
    tuning: ProtocolTuning,
    connect_latch: Latch,
    emulator: Arc<dyn EmulatorHost>,
    recorder: Mutex<Option<ReplayRecorder>>,
    replay_sink: Mutex<Option<Box<dyn std::io::Write + Send>>>,
}

impl Shared {
    fn flush_effects(&self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Send { addr, bytes } => self.socket.send_to(&bytes, addr),
                Effect::Userlist(list) => (self.callbacks.on_userlist)(&list),
                Effect::Chat { user, text } => (self.callbacks.on_chat)(&user, &text),
                Effect::ConnectionEstablished(delay) => {
                    (self.callbacks.on_connection_established)(delay)
                },
                Effect::Status(text) => (self.callbacks.on_status)(&text),
            }
        }
    }

    /// Composes a message on `peer`'s channel, stamping the piggybacked
    /// receive frontier, and queues it for sending.
    fn push_message(&self, peer: &mut PeerChannel, body: MessageBody, effects: &mut Vec<Effect>) {
        let frontier = peer
            .side
            .map_or(Frame::ZERO, |side| self.queue.recv_frontier(side));
        let (_, bytes) = peer.compose(body, frontier, &self.tuning);
        effects.push(Effect::Send {
            addr: peer.addr,
            bytes,
        });
    }

    /// The terminal transition. Idempotent: only the first reason sticks.
    fn enter_terminal(
        &self,
        core: &mut Core,
        phase: SessionPhase,
        reason: ExitReason,
        effects: &mut Vec<Effect>,
    ) {
        debug_assert!(phase.is_terminal());
        if core.phase.is_terminal() {
            return;
        }
        debug!(phase = %phase, reason = %reason, "session reached terminal phase");
        core.phase = phase;
        core.exit = Some(reason.clone());
        effects.push(Effect::Status(reason.to_string()));

        // Best-effort EndSession to everyone we ever talked to, kept alive
        // by the bounded resend schedule.
        let delay = core.input_delay.max(1);
        for peer in &mut core.peers {
            let frontier = peer
                .side
                .map_or(Frame::ZERO, |side| self.queue.recv_frontier(side));
            let (seq, bytes) = peer.compose(MessageBody::EndSession, frontier, &self.tuning);
            peer.track_end_session(seq, bytes.clone(), delay, &self.tuning);
            effects.push(Effect::Send {
                addr: peer.addr,
                bytes,
            });
        }
        core.drain_deadline = Some(Instant::now() + self.tuning.end_session_drain(delay));

        self.queue.close();
        self.connect_latch.cancel();
        self.phase_cv.notify_all();
    }

    /// Checks the running barrier and performs the `Ready → Running`
    /// transition when it clears.
    fn maybe_start_running(&self, core: &mut Core, effects: &mut Vec<Effect>) {
        if core.phase != SessionPhase::Ready {
            return;
        }
        let armed = if core.is_host() {
            core.confirmed_delay.is_some()
                && core.announced_ready
                && core
                    .peers
                    .iter()
                    .filter(|p| p.side.is_some())
                    .all(|p| p.ready)
                && core.peers.iter().all(|p| !p.has_unacked())
        } else {
            core.delay_seq.is_some() && core.announced_ready && core.host_ready
        };
        if !armed {
            return;
        }

        self.queue
            .prime(usize::from(core.num_players), core.local_side, core.input_delay);
        core.phase = SessionPhase::Running;
        self.phase_cv.notify_all();
        effects.push(Effect::Status(format!(
            "running with input delay {}",
            core.input_delay
        )));

        if core.save_replay {
            self.open_recorder(core);
        }
    }

    fn open_recorder(&self, core: &Core) {
        let Some(sync_state) = core.sync_state.as_ref() else {
            return;
        };
        let Some(sink) = self.replay_sink.lock().take() else {
            return;
        };
        match ReplayRecorder::new(sink, sync_state) {
            Ok(recorder) => *self.recorder.lock() = Some(recorder),
            Err(err) => report_fault!(
                FaultSeverity::Error,
                FaultKind::InternalError,
                "could not open replay recorder: {err}"
            ),
        }
    }

    fn record_input(&self, side: Side, input: &FrameInput) {
        let mut recorder = self.recorder.lock();
        if let Some(inner) = recorder.as_mut() {
            if let Err(err) = inner.record(side, input) {
                report_fault!(
                    FaultSeverity::Error,
                    FaultKind::InternalError,
                    "replay write failed, recording stopped: {err}"
                );
                *recorder = None;
                return;
            }
        }
    }

    /// Sends the unacknowledged tail of local inputs to every peer. Runs on
    /// the internal tick, on every publish, and from inside a blocked `get`.
    fn pump_inputs_locked(&self, core: &mut Core, effects: &mut Vec<Effect>) {
        if core.phase != SessionPhase::Running || core.local_side.is_none() {
            return;
        }
        let window = usize::from(self.tuning.input_batch_window);
        for peer in &mut core.peers {
            let Some((start, bytes)) = self.queue.outgoing_window(peer.acked_frontier, window)
            else {
                continue;
            };
            let ack_frontier = peer
                .side
                .map_or(Frame::ZERO, |side| self.queue.recv_frontier(side));
            let side = core.local_side.unwrap_or(Side::HOST);
            let (_, encoded) = peer.compose_input(side, start, ack_frontier, bytes);
            effects.push(Effect::Send {
                addr: peer.addr,
                bytes: encoded,
            });
        }
    }

    /// Garbage-collects inputs every peer has confirmed.
    fn collect_acked_garbage(&self, core: &Core) {
        let min_acked = core
            .peers
            .iter()
            .map(|p| p.acked_frontier)
            .min()
            .unwrap_or(Frame::ZERO);
        self.queue.collect_garbage(min_acked);
    }
}

// ---------------------------------------------------------------------------
// Receive path
// ---------------------------------------------------------------------------

fn handle_datagram(shared: &Shared, src: SocketAddr, bytes: &[u8]) {
    let msg = match codec::decode(bytes) {
        Ok(msg) => msg,
        Err(err) => {
            report_fault!(
                FaultSeverity::Warning,
                FaultKind::MalformedMessage,
                "dropping {} byte datagram from {src}: {err}",
                bytes.len()
            );
            return;
        },
    };

    let mut effects = Vec::new();
    {
        let mut core = shared.core.lock();
        dispatch(shared, &mut core, src, msg, &mut effects);
    }
    shared.flush_effects(effects);
}

fn dispatch(
    shared: &Shared,
    core: &mut Core,
    src: SocketAddr,
    msg: Message,
    effects: &mut Vec<Effect>,
) {
    trace!(kind = ?msg.kind(), seq = msg.seq, from = %src, "dispatch");

    // Joins are the only messages accepted from unknown addresses.
    if msg.kind() == MessageKind::Join {
        handle_join(shared, core, src, msg, effects);
        return;
    }
    let Some(idx) = core.peer_index(src) else {
        report_fault!(
            FaultSeverity::Warning,
            FaultKind::Protocol,
            "dropping {:?} from unknown peer {src}",
            msg.kind()
        );
        return;
    };

    {
        let peer = &mut core.peers[idx];
        peer.note_recv();

        // Reliable (and EndSession) messages are acked unconditionally, then
        // suppressed if this seq was already processed.
        if msg.body.wants_ack() {
            let first_delivery = peer.accept_seq(msg.seq);
            let body = MessageBody::Ack { acked_seq: msg.seq };
            shared.push_message(peer, body, effects);
            if !first_delivery {
                return;
            }
        }

        // Every non-Input message piggybacks the sender's receive frontier
        // for our side in the header frame field.
        if msg.kind() != MessageKind::Input {
            peer.raise_acked_frontier(msg.frame);
        }
    }

    match msg.body {
        // Handled before the peer lookup.
        MessageBody::Join { .. } => {},
        MessageBody::Accept {
            num_players,
            your_side,
            peers,
            sync_state,
        } => handle_accept(shared, core, src, num_players, your_side, peers, sync_state, effects),
        MessageBody::Reject { code, text } => {
            if core.phase == SessionPhase::Handshaking {
                let reason = if code == REJECT_SESSION_FULL {
                    ExitReason::PeerError("session is full".to_owned())
                } else {
                    ExitReason::SyncMismatch(SyncMismatch::from_code(code, &text))
                };
                shared.enter_terminal(core, SessionPhase::Ended, reason, effects);
            }
        },
        MessageBody::Delay { input_delay } => {
            // Renegotiation: only the newest Delay (seq-wise) is effective,
            // and none are once the queue is primed and running.
            if !matches!(
                core.phase,
                SessionPhase::Handshaking | SessionPhase::Ready
            ) {
                return;
            }
            if core.delay_seq.map_or(true, |prev| msg.seq > prev) {
                core.delay_seq = Some(msg.seq);
                core.input_delay = input_delay;
                effects.push(Effect::Status(format!("input delay set to {input_delay}")));
                if !core.is_host() && !core.announced_ready {
                    core.announced_ready = true;
                    for peer in &mut core.peers {
                        shared.push_message(peer, MessageBody::Ready, effects);
                    }
                }
                shared.maybe_start_running(core, effects);
            }
        },
        MessageBody::Ready => {
            let peer = &mut core.peers[idx];
            peer.ready = true;
            if peer.side == Some(Side::HOST) {
                core.host_ready = true;
            }
            shared.maybe_start_running(core, effects);
            shared.phase_cv.notify_all();
        },
        MessageBody::Input {
            side,
            ack_frontier,
            bytes,
        } => handle_input(shared, core, idx, msg.frame, side, ack_frontier, &bytes),
        MessageBody::Ack { acked_seq } => {
            core.peers[idx].on_ack(acked_seq);
            // Running may have been blocked on this very ack.
            shared.maybe_start_running(core, effects);
            shared.phase_cv.notify_all();
        },
        MessageBody::Chat { username, text } => {
            effects.push(Effect::Chat {
                user: username,
                text,
            });
        },
        MessageBody::EndSession => {
            debug!(frame = %self_sim_frame(shared, core), "peer ended the session");
            shared.enter_terminal(core, SessionPhase::Ended, ExitReason::Completed, effects);
        },
        MessageBody::Ping { nonce } => {
            let peer = &mut core.peers[idx];
            shared.push_message(peer, MessageBody::Pong { nonce }, effects);
        },
        MessageBody::Pong { nonce } => core.peers[idx].on_pong(nonce),
    }
}

fn self_sim_frame(shared: &Shared, core: &Core) -> Frame {
    if core.phase == SessionPhase::Running || core.phase.is_terminal() {
        shared.queue.sim_frame()
    } else {
        Frame::ZERO
    }
}

fn handle_join(
    shared: &Shared,
    core: &mut Core,
    src: SocketAddr,
    msg: Message,
    effects: &mut Vec<Effect>,
) {
    let MessageBody::Join {
        username,
        observer,
        sync_state,
    } = msg.body
    else {
        return;
    };

    // Players are admitted while advertising; observers occupy no side and
    // may also slip in after the roster filled, up to the running
    // transition.
    let joinable = core.is_host()
        && (core.phase == SessionPhase::Advertising
            || (core.phase == SessionPhase::Ready && observer));
    if !joinable {
        // Late or misdirected join; a raw reject needs no channel state.
        effects.push(raw_reject(src, REJECT_SESSION_FULL, "session is not accepting joins"));
        return;
    }

    if let Some(idx) = core.peer_index(src) {
        // Retransmitted join: ack it and re-send the current roster.
        let peer = &mut core.peers[idx];
        peer.accept_seq(msg.seq);
        peer.note_recv();
        let ack = MessageBody::Ack { acked_seq: msg.seq };
        shared.push_message(peer, ack, effects);
        broadcast_accepts(shared, core, effects);
        return;
    }

    // Snapshot compatibility gates the door.
    let Some(ours) = core.sync_state.as_ref() else {
        effects.push(raw_reject(src, REJECT_SESSION_FULL, "host is not ready"));
        return;
    };
    if let Err(mismatch) = ours.check_compatible(&sync_state) {
        effects.push(Effect::Status(mismatch.to_string()));
        effects.push(raw_reject(src, mismatch.code(), &mismatch.detail()));
        return;
    }

    let side = if observer {
        None
    } else {
        match core.lowest_free_side() {
            Some(side) => Some(side),
            None => {
                effects.push(raw_reject(src, REJECT_SESSION_FULL, "all sides are taken"));
                return;
            },
        }
    };

    debug!(peer = %src, ?side, username = %username, "accepted join");
    let mut peer = PeerChannel::new(src);
    peer.username = username;
    peer.side = side;
    peer.accept_seq(msg.seq);
    shared.push_message(&mut peer, MessageBody::Ack { acked_seq: msg.seq }, effects);
    core.peers.push(peer);

    broadcast_accepts(shared, core, effects);
    effects.push(Effect::Userlist(core.roster()));

    if core.phase == SessionPhase::Advertising
        && core.players_present() == usize::from(core.num_players)
    {
        core.phase = SessionPhase::Ready;
        effects.push(Effect::Status("all players connected".to_owned()));
        shared.phase_cv.notify_all();
    }
}

/// One `Accept` per accepted peer; each gets a roster excluding itself and
/// its own assignment in `your_side`.
fn broadcast_accepts(shared: &Shared, core: &mut Core, effects: &mut Vec<Effect>) {
    let Some(sync_state) = core.sync_state.clone() else {
        return;
    };
    let num_players = core.num_players;
    let all: Vec<(SocketAddr, u8, String)> = core
        .peers
        .iter()
        .map(|p| {
            (
                p.addr,
                p.side.map_or(OBSERVER_SIDE, Side::as_u8),
                p.username.clone(),
            )
        })
        .collect();
    let host_entry = PeerEntry {
        side: Side::HOST.as_u8(),
        username: core.username.clone(),
        addr: shared
            .socket
            .local_addr()
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0))),
    };

    for peer in &mut core.peers {
        let roster: Vec<PeerEntry> = std::iter::once(host_entry.clone())
            .chain(all.iter().filter(|(addr, _, _)| *addr != peer.addr).map(
                |(addr, side, username)| PeerEntry {
                    side: *side,
                    username: username.clone(),
                    addr: *addr,
                },
            ))
            .collect();
        let body = MessageBody::Accept {
            num_players,
            your_side: peer.side.map_or(OBSERVER_SIDE, Side::as_u8),
            peers: roster,
            sync_state: sync_state.clone(),
        };
        shared.push_message(peer, body, effects);
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_accept(
    shared: &Shared,
    core: &mut Core,
    src: SocketAddr,
    num_players: u8,
    your_side: u8,
    roster: Vec<PeerEntry>,
    sync_state: crate::SyncState,
    effects: &mut Vec<Effect>,
) {
    if core.is_host() || Some(src) != core.host_addr {
        report_fault!(
            FaultSeverity::Warning,
            FaultKind::Protocol,
            "unexpected Accept from {src}"
        );
        return;
    }
    // Roster re-broadcasts may straggle in after this end already started
    // running (UDP reorders; reliable retransmission re-delivers); the mesh
    // update must still be applied or a late-joining peer stays unreachable.
    if !matches!(
        core.phase,
        SessionPhase::Handshaking | SessionPhase::Ready | SessionPhase::Running
    ) {
        return;
    }

    // The host checked compatibility before accepting, but check from this
    // end too: an asymmetric predicate is itself a divergence.
    if let Some(ours) = core.sync_state.as_ref() {
        if let Err(mismatch) = ours.check_compatible(&sync_state) {
            shared.enter_terminal(
                core,
                SessionPhase::Ended,
                ExitReason::SyncMismatch(mismatch),
                effects,
            );
            return;
        }
    }

    let first_accept = core.phase == SessionPhase::Handshaking;
    core.num_players = num_players;
    core.local_side = (your_side != OBSERVER_SIDE).then(|| Side::new(your_side));

    // Update the mesh: the roster excludes us; the host relays every other
    // participant's endpoint. The host's own entry maps to the address we
    // already talk to (it cannot know its externally visible address).
    for entry in &roster {
        let side = (entry.side != OBSERVER_SIDE).then(|| Side::new(entry.side));
        let addr = if side == Some(Side::HOST) { src } else { entry.addr };
        match core.peer_index(addr) {
            Some(idx) => {
                core.peers[idx].side = side;
                core.peers[idx].username = entry.username.clone();
            },
            None => {
                let mut peer = PeerChannel::new(addr);
                peer.side = side;
                peer.username = entry.username.clone();
                core.peers.push(peer);
            },
        }
    }

    if first_accept {
        core.phase = SessionPhase::Ready;
        effects.push(Effect::ConnectionEstablished(core.input_delay));
        shared.phase_cv.notify_all();
    }
    effects.push(Effect::Userlist(core.roster()));
    shared.maybe_start_running(core, effects);
}

fn handle_input(
    shared: &Shared,
    core: &mut Core,
    idx: usize,
    first_frame: Frame,
    side: Side,
    ack_frontier: Frame,
    bytes: &[u8],
) {
    let peer = &mut core.peers[idx];
    if peer.side != Some(side) {
        report_fault!(
            FaultSeverity::Warning,
            FaultKind::Protocol,
            "peer {} sent inputs for {side} it does not own",
            peer.addr
        );
        return;
    }
    peer.raise_acked_frontier(ack_frontier);

    if !shared.queue.is_open() {
        // Inputs racing ahead of our own Running transition; the sender's
        // window will carry them again.
        return;
    }

    for (i, chunk) in bytes.chunks_exact(NUM_SYNC_INPUTS).enumerate() {
        let frame = first_frame.saturating_add(i as u32);
        let mut record = [0u8; NUM_SYNC_INPUTS];
        record.copy_from_slice(chunk);
        if shared.queue.insert_remote(side, frame, record) == InsertOutcome::Inserted {
            shared.record_input(side, &FrameInput::from_bytes(frame, record));
        }
    }
    shared.collect_acked_garbage(core);
}

fn raw_reject(addr: SocketAddr, code: u8, text: &str) -> Effect {
    let msg = Message {
        seq: 0,
        frame: Frame::ZERO,
        body: MessageBody::Reject {
            code,
            text: text.to_owned(),
        },
    };
    Effect::Send {
        addr,
        bytes: codec::encode(&msg).unwrap_or_default(),
    }
}

// ---------------------------------------------------------------------------
// Tick
// ---------------------------------------------------------------------------

/// Runs the periodic work: retransmits, keep-alives, silence detection,
/// negotiation timeouts, and the running input pump. Returns `true` once the
/// session is terminal *and* fully drained, which stops the receive thread.
fn tick(shared: &Shared) -> bool {
    let now = Instant::now();
    let mut effects = Vec::new();
    let done = {
        let mut core = shared.core.lock();

        if core.phase == SessionPhase::Handshaking {
            let expired = core
                .join_sent_at
                .is_some_and(|sent| now.duration_since(sent) > shared.tuning.join_timeout);
            if expired {
                shared.enter_terminal(
                    &mut core,
                    SessionPhase::Ended,
                    ExitReason::JoinTimeout,
                    &mut effects,
                );
            }
        }

        // Silence detection before retransmits: a dead peer gets no more
        // traffic, just the EndSession burst from the terminal transition.
        if matches!(core.phase, SessionPhase::Ready | SessionPhase::Running) {
            let timeout = shared.tuning.peer_silence_timeout;
            let silent = core.peers.iter().any(|p| p.silence(now) > timeout);
            if silent {
                let frame = self_sim_frame(shared, &core);
                shared.enter_terminal(
                    &mut core,
                    SessionPhase::Ended,
                    ExitReason::PeerTimeout { frame },
                    &mut effects,
                );
            }
        }

        for peer in &mut core.peers {
            for bytes in peer.due_retransmits(now, &shared.tuning) {
                effects.push(Effect::Send {
                    addr: peer.addr,
                    bytes,
                });
            }
        }

        if !core.phase.is_terminal() {
            for peer in &mut core.peers {
                if let Some(nonce) = peer.keepalive_due(now, &shared.tuning) {
                    shared.push_message(peer, MessageBody::Ping { nonce }, &mut effects);
                }
            }
            shared.pump_inputs_locked(&mut core, &mut effects);
        }

        core.phase.is_terminal() && {
            let all_drained = core.peers.iter().all(PeerChannel::end_session_drained);
            let deadline_passed = core.drain_deadline.map_or(true, |d| now >= d);
            all_drained || deadline_passed
        }
    };
    shared.flush_effects(effects);
    done
}

// ---------------------------------------------------------------------------
// Worker threads
// ---------------------------------------------------------------------------

fn run_receive_thread(shared: Arc<Shared>) {
    loop {
        if let Some((src, bytes)) = shared.socket.recv_timeout(shared.tuning.tick_interval) {
            handle_datagram(&shared, src, &bytes);
        }
        if tick(&shared) {
            break;
        }
    }
    // Final flush so a replay survives an abrupt end.
    if let Some(recorder) = shared.recorder.lock().as_mut() {
        let _ = recorder.flush();
    }
    debug!("receive thread exits");
}

fn run_connect_thread(shared: Arc<Shared>) {
    // Negotiation cannot start until the emulator reaches its first input
    // poll: before that there is no snapshot worth comparing.
    if !shared.connect_latch.wait(LATCH_WAIT_CAP) {
        let mut effects = Vec::new();
        {
            let mut core = shared.core.lock();
            shared.enter_terminal(
                &mut core,
                SessionPhase::Cancelled,
                ExitReason::CancelledByUser,
                &mut effects,
            );
        }
        shared.flush_effects(effects);
        return;
    }

    let snapshot = shared.emulator.capture_sync_state();
    let mut effects = Vec::new();
    {
        let mut core = shared.core.lock();
        if core.phase.is_terminal() {
            return;
        }
        core.sync_state = Some(snapshot.clone());
        if core.is_host() {
            core.phase = SessionPhase::Advertising;
            // The lobby window opens with the default delay of 1; the host
            // confirms the real value once everyone is in.
            effects.push(Effect::ConnectionEstablished(core.input_delay));
            effects.push(Effect::Status("waiting for players".to_owned()));
        } else if let Some(host_addr) = core.host_addr {
            core.phase = SessionPhase::Handshaking;
            let mut peer = PeerChannel::new(host_addr);
            peer.side = Some(Side::HOST);
            let body = MessageBody::Join {
                username: core.username.clone(),
                observer: core.mode == SessionMode::Observe,
                sync_state: snapshot,
            };
            shared.push_message(&mut peer, body, &mut effects);
            core.peers.push(peer);
            core.join_sent_at = Some(Instant::now());
            effects.push(Effect::Status(format!("joining {host_addr}")));
        } else {
            shared.enter_terminal(
                &mut core,
                SessionPhase::Ended,
                ExitReason::PeerError("no host address configured".to_owned()),
                &mut effects,
            );
        }
        shared.phase_cv.notify_all();
    }
    shared.flush_effects(effects);

    // Block until the session runs or dies; all the actual work happens on
    // the receive thread.
    let mut core = shared.core.lock();
    while core.phase != SessionPhase::Running && !core.phase.is_terminal() {
        shared
            .phase_cv
            .wait_for(&mut core, Duration::from_millis(500));
    }
    debug!(phase = %core.phase, "connect thread exits");
}

// ---------------------------------------------------------------------------
// The public handle
// ---------------------------------------------------------------------------

/// A running lock-step netplay session.
///
/// Create one through [`SessionBuilder`](crate::SessionBuilder). The handle
/// is thread-safe; the emulator hook adapter shares it with the owning
/// application.
pub struct LockstepSession {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    closed: Mutex<bool>,
}

impl std::fmt::Debug for LockstepSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockstepSession")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl LockstepSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        mode: SessionMode,
        username: String,
        num_players: u8,
        host_addr: Option<SocketAddr>,
        save_replay: bool,
        socket: Arc<dyn DatagramSocket>,
        callbacks: SessionCallbacks,
        tuning: ProtocolTuning,
        emulator: Arc<dyn EmulatorHost>,
        replay_sink: Option<Box<dyn std::io::Write + Send>>,
    ) -> FramelockResult<Self> {
        let local_side = match mode {
            SessionMode::Host => Some(Side::HOST),
            SessionMode::Connect => None, // assigned by Accept
            SessionMode::Observe => None,
        };
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                phase: SessionPhase::Binding,
                mode,
                username,
                num_players,
                local_side,
                input_delay: 1,
                delay_seq: None,
                confirmed_delay: None,
                announced_ready: false,
                host_ready: false,
                peers: Vec::new(),
                host_addr,
                join_sent_at: None,
                sync_state: None,
                exit: None,
                drain_deadline: None,
                save_replay,
            }),
            phase_cv: Condvar::new(),
            queue: FrameQueue::new(),
            socket,
            callbacks,
            tuning,
            connect_latch: Latch::new(),
            emulator,
            recorder: Mutex::new(None),
            replay_sink: Mutex::new(replay_sink),
        });

        shared.emulator.reset_to_safe_defaults();

        let spawn_failed = |_| FramelockError::InvalidRequest {
            info: "could not spawn a session worker thread",
        };
        let receive = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("framelock-recv".to_owned())
                .spawn(move || run_receive_thread(shared))
                .map_err(spawn_failed)?
        };
        let connect = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("framelock-connect".to_owned())
                .spawn(move || run_connect_thread(shared))
        };
        let connect = match connect {
            Ok(handle) => handle,
            Err(err) => {
                // Unwind the half-started session before reporting.
                shared.connect_latch.cancel();
                shared.queue.close();
                shared.core.lock().phase = SessionPhase::Ended;
                let _ = receive.join();
                return Err(spawn_failed(err));
            },
        };

        Ok(Self {
            shared,
            threads: Mutex::new(vec![receive, connect]),
            closed: Mutex::new(false),
        })
    }

    /// The session's current phase.
    pub fn phase(&self) -> SessionPhase {
        self.shared.core.lock().phase
    }

    /// Why the session ended, once it has.
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.core.lock().exit.clone()
    }

    /// The current session-wide input delay, in frames.
    pub fn input_delay(&self) -> u8 {
        self.shared.core.lock().input_delay
    }

    /// The side assigned to the local player, if any (observers have none;
    /// clients have none until accepted).
    pub fn local_side(&self) -> Option<Side> {
        self.shared.core.lock().local_side
    }

    /// The number of player sides in the session.
    pub fn num_players(&self) -> u8 {
        self.shared.core.lock().num_players
    }

    /// The frame the simulation is currently on.
    pub fn sim_frame(&self) -> Frame {
        self.shared.queue.sim_frame()
    }

    /// Signals that the emulator reached its first input poll, releasing the
    /// connect thread to capture the snapshot and negotiate.
    pub fn notify_io_ready(&self) {
        self.shared.connect_latch.open();
    }

    /// Blocks until the session is `Running`, terminal, or `timeout`
    /// elapses. Returns `true` iff the session is running.
    pub fn wait_running(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.core.lock();
        while core.phase != SessionPhase::Running && !core.phase.is_terminal() {
            if self
                .shared
                .phase_cv
                .wait_until(&mut core, deadline)
                .timed_out()
            {
                break;
            }
        }
        core.phase == SessionPhase::Running
    }

    /// Blocks until the session reaches a terminal phase or `timeout`
    /// elapses; returns the exit reason if terminal.
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<ExitReason> {
        let deadline = Instant::now() + timeout;
        let mut core = self.shared.core.lock();
        while !core.phase.is_terminal() {
            if self
                .shared
                .phase_cv
                .wait_until(&mut core, deadline)
                .timed_out()
            {
                break;
            }
        }
        core.exit.clone()
    }

    /// Host only: re-broadcasts the input delay without confirming the
    /// start. May be called repeatedly while the lobby is open; clients
    /// apply the newest value.
    ///
    /// # Errors
    ///
    /// Rejects values outside `[1, 100]`, calls from non-hosts, and calls
    /// after the session started running.
    pub fn announce_delay(&self, delay: u8) -> FramelockResult<()> {
        self.host_delay(delay, false)
    }

    /// Host only: fixes the input delay and arms the start. The session
    /// transitions to `Running` once every client acknowledged the delay and
    /// reported ready.
    ///
    /// # Errors
    ///
    /// As [`announce_delay`](Self::announce_delay), and additionally
    /// requires the full roster (`Ready` phase).
    pub fn confirm_start(&self, delay: u8) -> FramelockResult<()> {
        self.host_delay(delay, true)
    }

    fn host_delay(&self, delay: u8, confirm: bool) -> FramelockResult<()> {
        if !INPUT_DELAY_RANGE.contains(&delay) {
            return Err(FramelockError::InvalidRequest {
                info: "input delay must be in 1..=100",
            });
        }
        let mut effects = Vec::new();
        {
            let mut core = self.shared.core.lock();
            if !core.is_host() {
                return Err(FramelockError::InvalidRequest {
                    info: "only the host sets the input delay",
                });
            }
            match core.phase {
                SessionPhase::Advertising if !confirm => {},
                SessionPhase::Ready => {},
                phase => {
                    return Err(FramelockError::WrongPhase {
                        current: phase,
                        required: SessionPhase::Ready,
                    });
                },
            }

            core.input_delay = delay;
            for peer in &mut core.peers {
                self.shared.push_message(
                    peer,
                    MessageBody::Delay { input_delay: delay },
                    &mut effects,
                );
            }
            if confirm {
                core.confirmed_delay = Some(delay);
                if !core.announced_ready {
                    core.announced_ready = true;
                    for peer in &mut core.peers {
                        self.shared.push_message(peer, MessageBody::Ready, &mut effects);
                    }
                }
                self.shared.maybe_start_running(&mut core, &mut effects);
            }
        }
        self.shared.flush_effects(effects);
        Ok(())
    }

    /// Sends a chat line to every peer.
    ///
    /// # Errors
    ///
    /// Fails once the session is terminal.
    pub fn send_chat(&self, text: &str) -> FramelockResult<()> {
        let mut effects = Vec::new();
        {
            let mut core = self.shared.core.lock();
            if core.phase.is_terminal() {
                return Err(FramelockError::SessionEnded);
            }
            let username = core.username.clone();
            for peer in &mut core.peers {
                self.shared.push_message(
                    peer,
                    MessageBody::Chat {
                        username: username.clone(),
                        text: text.to_owned(),
                    },
                    &mut effects,
                );
            }
        }
        self.shared.flush_effects(effects);
        Ok(())
    }

    /// Publishes the local side's sampled input for the next local input
    /// frame and pumps transmission. Returns the frame number written.
    ///
    /// # Errors
    ///
    /// [`FramelockError::WrongPhase`] before `Running`;
    /// [`FramelockError::SessionEnded`] after the session ends.
    pub fn publish_local(&self, bytes: [u8; NUM_SYNC_INPUTS]) -> FramelockResult<Frame> {
        {
            let core = self.shared.core.lock();
            match core.phase {
                SessionPhase::Running => {},
                phase if phase.is_terminal() => return Err(FramelockError::SessionEnded),
                phase => {
                    return Err(FramelockError::WrongPhase {
                        current: phase,
                        required: SessionPhase::Running,
                    });
                },
            }
        }
        let frame = self.shared.queue.publish_local(bytes)?;
        if let Some(side) = self.local_side() {
            self.shared
                .record_input(side, &FrameInput::from_bytes(frame, bytes));
        }
        self.pump();
        Ok(frame)
    }

    /// Advances the simulation frame counter and returns the new frame.
    pub fn advance_frame(&self) -> Frame {
        self.shared.queue.next_frame()
    }

    /// Returns side `side`'s input for `frame`, blocking until it arrives.
    /// The blocked wait participates in retransmission: the send window is
    /// pumped on every internal tick of the wait.
    ///
    /// # Errors
    ///
    /// [`FramelockError::SessionEnded`] if the session ends while waiting;
    /// [`FramelockError::InputTimeout`] (fatal: the session is torn down)
    /// if the record does not arrive within the input wait timeout.
    pub fn poll_input(&self, side: Side, frame: Frame) -> FramelockResult<FrameInput> {
        let result = self.shared.queue.get_blocking(
            side,
            frame,
            self.shared.tuning.input_wait_timeout,
            self.shared.tuning.tick_interval,
            || self.pump(),
        );
        match result {
            Ok(input) => Ok(input),
            Err(WaitError::Closed) => Err(FramelockError::SessionEnded),
            Err(WaitError::Timeout) => {
                let mut effects = Vec::new();
                {
                    let mut core = self.shared.core.lock();
                    self.shared.enter_terminal(
                        &mut core,
                        SessionPhase::Ended,
                        ExitReason::InputTimeout { frame },
                        &mut effects,
                    );
                }
                self.shared.flush_effects(effects);
                Err(FramelockError::InputTimeout { frame })
            },
        }
    }

    /// Immediately transmits the unacknowledged tail of local inputs to all
    /// peers. Called from every poll; cheap when there is nothing to send.
    pub fn pump(&self) {
        let mut effects = Vec::new();
        {
            let mut core = self.shared.core.lock();
            self.shared.pump_inputs_locked(&mut core, &mut effects);
        }
        self.shared.flush_effects(effects);
    }

    /// User-initiated cancel. Before the session is ready this cancels the
    /// lobby; during a run it ends the session for everyone.
    pub fn cancel(&self) {
        let mut effects = Vec::new();
        {
            let mut core = self.shared.core.lock();
            if core.phase.is_terminal() {
                return;
            }
            let phase = if matches!(core.phase, SessionPhase::Running) {
                SessionPhase::Ended
            } else {
                SessionPhase::Cancelled
            };
            self.shared
                .enter_terminal(&mut core, phase, ExitReason::CancelledByUser, &mut effects);
        }
        self.shared.flush_effects(effects);
    }

    /// Tears the session down: cancels if still live, waits for the
    /// `EndSession` drain, joins the worker threads, and restores the
    /// emulator settings. Idempotent; called automatically on drop.
    pub fn shutdown(&self) {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return;
            }
            *closed = true;
        }
        self.cancel();
        let handles: Vec<JoinHandle<()>> = self.threads.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(recorder) = self.shared.recorder.lock().as_mut() {
            let _ = recorder.flush();
        }
        self.shared.emulator.restore_settings();
    }

    /// Whether a peer or the user has requested the session end.
    pub fn end_requested(&self) -> bool {
        self.shared.core.lock().phase.is_terminal()
    }

    /// Total retransmissions performed across all peer channels.
    pub fn retransmit_count(&self) -> u64 {
        self.shared
            .core
            .lock()
            .peers
            .iter()
            .map(|p| p.retransmit_count)
            .sum()
    }
}

impl Drop for LockstepSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}
