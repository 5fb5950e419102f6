//! The emulator controller-poll hook adapter.
//!
//! Console pads are polled a byte at a time: the emulator opens a command
//! with `start_poll(port)`, then exchanges bytes through `poll` until the
//! peripheral command completes. This adapter sits between the emulator and
//! the real pad backend and turns that byte stream into session traffic:
//!
//! - command `0x42` (read controller) on pad 0 marks the frame boundary,
//! - the local pad's sampled bytes are staged and published as the session
//!   side assigned to this instance,
//! - the bytes *returned* to the emulator come from the session's frame
//!   queue, so every instance sees every side's inputs identically.
//!
//! # Pad mapping
//!
//! The console multitap addresses pads by (port, slot); the session
//! addresses them by a flat pad number that doubles as the side index:
//!
//! ```text
//! port 0 slot 0   -> pad 0
//! port 1 slot 0-3 -> pad 1-4
//! port 0 slot 1-3 -> pad 5-7
//! ```
//!
//! Pads at or beyond the session's player count read neutral values
//! (buttons `0xFF` idle, analogs `0x7F` centered).
//!
//! # Blocking
//!
//! The wait for remote inputs happens on the *first synchronized byte* of a
//! pad's `0x42` command; the rest of the command is served from the fetched
//! record without suspending. The very first synchronized byte of the first
//! frame additionally releases the session's connect latch and parks until
//! the session is running.

use std::sync::Arc;
use std::time::Duration;

use crate::frame_info::{FrameInput, NEUTRAL_ANALOG, NEUTRAL_BUTTONS, NUM_SYNC_INPUTS};
use crate::sessions::session::LockstepSession;
use crate::{Frame, FramelockResult, Side};

/// The pad command that reads controller state; its first poll on pad 0 per
/// emulator loop iteration is the frame boundary.
const READ_CONTROLLER: u8 = 0x42;

/// Cap on the wait for the session to start; lobby negotiation involves a
/// human confirming the delay, so this is hours, not seconds.
const START_WAIT_CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// The real controller plugin underneath the hook.
///
/// Mirrors the console pad plugin ABI: `start_poll` opens a command on a
/// port (1-based), `poll` exchanges one byte, `set_slot` selects a multitap
/// slot (both arguments 1-based).
pub trait PadBackend {
    /// Opens a poll command; returns the pad's opening byte.
    fn start_poll(&mut self, port: u8) -> u8;
    /// Exchanges one command byte with the pad.
    fn poll(&mut self, value: u8) -> u8;
    /// Selects the active multitap slot for a port.
    fn set_slot(&mut self, port: u8, slot: u8);
}

/// The slice of the session surface the hook drives. A seam for tests; the
/// only production implementation is [`LockstepSession`].
pub(crate) trait InputSession: Send + Sync {
    fn notify_io_ready(&self);
    fn wait_running(&self, timeout: Duration) -> bool;
    fn end_requested(&self) -> bool;
    fn num_players(&self) -> u8;
    fn local_side(&self) -> Option<Side>;
    fn sim_frame(&self) -> Frame;
    fn advance_frame(&self) -> Frame;
    fn publish_local(&self, bytes: [u8; NUM_SYNC_INPUTS]) -> FramelockResult<Frame>;
    fn poll_input(&self, side: Side, frame: Frame) -> FramelockResult<FrameInput>;
}

impl InputSession for LockstepSession {
    fn notify_io_ready(&self) {
        LockstepSession::notify_io_ready(self);
    }

    fn wait_running(&self, timeout: Duration) -> bool {
        LockstepSession::wait_running(self, timeout)
    }

    fn end_requested(&self) -> bool {
        LockstepSession::end_requested(self)
    }

    fn num_players(&self) -> u8 {
        LockstepSession::num_players(self)
    }

    fn local_side(&self) -> Option<Side> {
        LockstepSession::local_side(self)
    }

    fn sim_frame(&self) -> Frame {
        LockstepSession::sim_frame(self)
    }

    fn advance_frame(&self) -> Frame {
        LockstepSession::advance_frame(self)
    }

    fn publish_local(&self, bytes: [u8; NUM_SYNC_INPUTS]) -> FramelockResult<Frame> {
        LockstepSession::publish_local(self, bytes)
    }

    fn poll_input(&self, side: Side, frame: Frame) -> FramelockResult<FrameInput> {
        LockstepSession::poll_input(self, side, frame)
    }
}

/// The controller-poll interception point. One instance lives on the
/// emulator thread; it is not shared.
pub struct PadPollHook<P: PadBackend> {
    session: Arc<dyn InputSession>,
    backend: P,
    current_command: u8,
    poll_port: usize,
    poll_slot: [u8; 2],
    poll_index: usize,
    hook_frame: u64,
    publish_pending: bool,
    staged: [u8; NUM_SYNC_INPUTS],
    active_record: Option<FrameInput>,
    vibration_remap: [[u8; 2]; 8],
    started: bool,
    stopped: bool,
}

impl<P: PadBackend> PadPollHook<P> {
    /// Hooks `backend` into `session`.
    pub fn new(session: Arc<LockstepSession>, backend: P) -> Self {
        Self::with_session(session, backend)
    }

    pub(crate) fn with_session(session: Arc<dyn InputSession>, backend: P) -> Self {
        Self {
            session,
            backend,
            current_command: 0,
            poll_port: 0,
            poll_slot: [0; 2],
            poll_index: 0,
            hook_frame: 0,
            publish_pending: false,
            staged: [0; NUM_SYNC_INPUTS],
            active_record: None,
            vibration_remap: [[0; 2]; 8],
            started: false,
            stopped: false,
        }
    }

    /// Whether the hook has shut itself down (session over or errored). The
    /// owner should check the session's exit reason and close the netplay
    /// window.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Number of frame boundaries observed since the hook was installed.
    pub fn frames_seen(&self) -> u64 {
        self.hook_frame
    }

    /// Flat pad number for the current (port, slot); see the module docs
    /// for the mapping table.
    fn current_pad(&self) -> usize {
        let slot = usize::from(self.poll_slot[self.poll_port]);
        if slot != 0 {
            slot + if self.poll_port == 0 { 4 } else { 1 }
        } else {
            self.poll_port
        }
    }

    /// Which pad should receive rumble sent to `pad`: the local player's
    /// physical pad is pad 0, so only the pad matching the local side gets
    /// real motor values. Remote pads' rumble is zeroed (forwarding it to
    /// the owning instance is a possible future extension).
    fn vibrate_target(&self, pad: usize) -> Option<usize> {
        if self.stopped {
            return Some(pad);
        }
        if pad == 0 {
            self.session.local_side().map(|s| s.as_usize())
        } else {
            None
        }
    }

    /// Intercepts `start_poll`. Publishes the previous frame's staged input
    /// and signals the frame boundary when appropriate.
    pub fn start_poll(&mut self, port: u8) -> u8 {
        if self.publish_pending {
            self.publish_pending = false;
            self.publish_staged();
        }

        self.poll_port = usize::from(port.saturating_sub(1)).min(1);
        self.poll_index = 0;
        self.active_record = None;

        // current_command still holds the previous command here; a completed
        // 0x42 on pad 0 means one emulator loop iteration has ended.
        if self.current_pad() == 0 && self.current_command == READ_CONTROLLER {
            if self.started && !self.stopped {
                self.session.advance_frame();
            }
            self.hook_frame += 1;
        }
        self.backend.start_poll(port)
    }

    /// Intercepts one command byte.
    pub fn poll(&mut self, mut value: u8) -> u8 {
        let pad = self.current_pad();
        if self.poll_index == 0 {
            self.current_command = value;
        }

        // Bytes 2-3 of the outgoing 0x42 command carry the rumble motor
        // values; remap them so rumble follows the local side.
        if self.current_command == READ_CONTROLLER && (2..=3).contains(&self.poll_index) {
            let motor = self.poll_index - 2;
            if pad < self.vibration_remap.len() {
                self.vibration_remap[pad][motor] = value;
                value = match self.vibrate_target(pad) {
                    None => 0,
                    Some(target) if target != pad => self
                        .vibration_remap
                        .get(target)
                        .map_or(0, |motors| motors[motor]),
                    Some(_) => value,
                };
            }
        }

        let mut response = self.backend.poll(value);

        if self.current_command == READ_CONTROLLER {
            if pad == 0 && self.poll_index == 0 {
                self.publish_pending = true;
            }
            if self.poll_index < 2 {
                // Header bytes pass through untouched.
            } else if self.poll_index <= 1 + NUM_SYNC_INPUTS && self.poll_index < 8 {
                response = self.handle_io(pad, self.poll_index - 2, response);
            } else if self.poll_index > 3 && self.poll_index < 8 {
                response = NEUTRAL_ANALOG;
            } else {
                response = NEUTRAL_BUTTONS;
            }
        }

        self.poll_index += 1;
        response
    }

    /// Intercepts multitap slot selection.
    pub fn set_slot(&mut self, port: u8, slot: u8) {
        let port_idx = usize::from(port.saturating_sub(1)).min(1);
        self.poll_port = port_idx;
        self.poll_slot[port_idx] = slot.saturating_sub(1);
        self.backend.set_slot(port, slot);
    }

    /// One synchronized input byte: stage the local sample, serve the byte
    /// from the session's record for this pad's side.
    fn handle_io(&mut self, pad: usize, index: usize, sampled: u8) -> u8 {
        if !self.started && !self.stopped {
            // First synchronized byte ever: the emulator is far enough along
            // that a snapshot is meaningful. Release the connect thread and
            // park until the lobby resolves.
            self.session.notify_io_ready();
            if self.session.wait_running(START_WAIT_CAP) {
                self.started = true;
            } else {
                self.stopped = true;
                return sampled;
            }
        }
        if self.stopped {
            return sampled;
        }
        if self.session.end_requested() {
            self.stopped = true;
            return sampled;
        }

        // Unassigned pads read as untouched controllers.
        if pad >= usize::from(self.session.num_players()) {
            return if index < 2 { NEUTRAL_BUTTONS } else { NEUTRAL_ANALOG };
        }

        // The local player's physical controller is pad 0; its samples
        // become this instance's published side.
        if pad == 0 {
            self.staged[index] = sampled;
        }

        let record = match self.active_record {
            Some(record) => record,
            None => {
                let frame = self.session.sim_frame();
                match self.session.poll_input(Side::new(pad as u8), frame) {
                    Ok(record) => {
                        self.active_record = Some(record);
                        record
                    },
                    Err(_) => {
                        // Fatal: timeout or session end. The session has
                        // already surfaced the reason.
                        self.stopped = true;
                        return sampled;
                    },
                }
            },
        };
        record.bytes.get(index).copied().unwrap_or(NEUTRAL_ANALOG)
    }

    fn publish_staged(&mut self) {
        if self.stopped || !self.started || self.session.local_side().is_none() {
            return;
        }
        if self.session.publish_local(self.staged).is_err() {
            self.stopped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FramelockError;
    use parking_lot::Mutex;

    /// Scripted session stub.
    struct StubSession {
        running: bool,
        num_players: u8,
        local_side: Option<Side>,
        sim_frame: Mutex<Frame>,
        published: Mutex<Vec<FrameInput>>,
        records: Mutex<Vec<(Side, Frame)>>,
        remote: [u8; NUM_SYNC_INPUTS],
        ended: Mutex<bool>,
    }

    impl StubSession {
        fn new(local_side: Option<Side>) -> Self {
            Self {
                running: true,
                num_players: 2,
                local_side,
                sim_frame: Mutex::new(Frame::ZERO),
                published: Mutex::new(Vec::new()),
                records: Mutex::new(Vec::new()),
                remote: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66],
                ended: Mutex::new(false),
            }
        }
    }

    impl InputSession for StubSession {
        fn notify_io_ready(&self) {}

        fn wait_running(&self, _timeout: Duration) -> bool {
            self.running
        }

        fn end_requested(&self) -> bool {
            *self.ended.lock()
        }

        fn num_players(&self) -> u8 {
            self.num_players
        }

        fn local_side(&self) -> Option<Side> {
            self.local_side
        }

        fn sim_frame(&self) -> Frame {
            *self.sim_frame.lock()
        }

        fn advance_frame(&self) -> Frame {
            let mut frame = self.sim_frame.lock();
            *frame = frame.next();
            *frame
        }

        fn publish_local(&self, bytes: [u8; NUM_SYNC_INPUTS]) -> FramelockResult<Frame> {
            let frame = Frame::new(self.published.lock().len() as u32);
            self.published.lock().push(FrameInput::from_bytes(frame, bytes));
            Ok(frame)
        }

        fn poll_input(&self, side: Side, frame: Frame) -> FramelockResult<FrameInput> {
            if *self.ended.lock() {
                return Err(FramelockError::SessionEnded);
            }
            self.records.lock().push((side, frame));
            Ok(FrameInput::from_bytes(frame, self.remote))
        }
    }

    /// Pad backend that answers with a fixed local controller state.
    struct ScriptedPad {
        local: [u8; NUM_SYNC_INPUTS],
        index: usize,
    }

    impl ScriptedPad {
        fn new(local: [u8; NUM_SYNC_INPUTS]) -> Self {
            Self { local, index: 0 }
        }
    }

    impl PadBackend for ScriptedPad {
        fn start_poll(&mut self, _port: u8) -> u8 {
            self.index = 0;
            0xFF
        }

        fn poll(&mut self, _value: u8) -> u8 {
            let response = match self.index {
                0 => 0x41, // digital pad id
                1 => 0x5A,
                i if (2..2 + NUM_SYNC_INPUTS).contains(&i) => self.local[i - 2],
                _ => 0xFF,
            };
            self.index += 1;
            response
        }

        fn set_slot(&mut self, _port: u8, _slot: u8) {}
    }

    fn run_pad_command(hook: &mut PadPollHook<ScriptedPad>, port: u8) -> Vec<u8> {
        hook.start_poll(port);
        // 0x42 command is 9 bytes total: command, idle, then data.
        let mut out = vec![hook.poll(0x42), hook.poll(0x00)];
        for _ in 0..7 {
            out.push(hook.poll(0x00));
        }
        out
    }

    fn hook_with(session: Arc<StubSession>) -> PadPollHook<ScriptedPad> {
        PadPollHook::with_session(
            session,
            ScriptedPad::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
        )
    }

    #[test]
    fn pad_mapping_covers_all_slots() {
        let session = Arc::new(StubSession::new(Some(Side::HOST)));
        let mut hook = hook_with(session);

        // port 0 slot 0 -> pad 0
        hook.set_slot(1, 1);
        hook.start_poll(1);
        assert_eq!(hook.current_pad(), 0);

        // port 1 slots 0-3 -> pads 1-4
        for slot in 1..=4u8 {
            hook.set_slot(2, slot);
            hook.start_poll(2);
            assert_eq!(hook.current_pad(), usize::from(slot));
        }

        // port 0 slots 1-3 -> pads 5-7
        for slot in 2..=4u8 {
            hook.set_slot(1, slot);
            hook.start_poll(1);
            assert_eq!(hook.current_pad(), usize::from(slot) + 3);
        }
    }

    #[test]
    fn synchronized_bytes_come_from_the_session() {
        let session = Arc::new(StubSession::new(Some(Side::HOST)));
        let mut hook = hook_with(Arc::clone(&session));
        let response = run_pad_command(&mut hook, 1);

        // Bytes 2.. of the response are the session's record, not the
        // local pad's.
        assert_eq!(&response[2..2 + NUM_SYNC_INPUTS], &session.remote[..]);
        // One fetch per command, for pad 0 = side 0, frame 0.
        assert_eq!(session.records.lock().as_slice(), &[(Side::HOST, Frame::ZERO)]);
    }

    #[test]
    fn local_sample_is_staged_and_published_at_next_boundary() {
        let session = Arc::new(StubSession::new(Some(Side::new(1))));
        let mut hook = hook_with(Arc::clone(&session));

        run_pad_command(&mut hook, 1);
        assert!(session.published.lock().is_empty(), "published too early");

        // The next frame's start_poll publishes the staged sample.
        run_pad_command(&mut hook, 1);
        let published = session.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].bytes, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
    }

    #[test]
    fn frame_advances_once_per_loop_iteration() {
        let session = Arc::new(StubSession::new(Some(Side::HOST)));
        let mut hook = hook_with(Arc::clone(&session));

        run_pad_command(&mut hook, 1); // frame 0
        assert_eq!(session.sim_frame(), Frame::ZERO);
        run_pad_command(&mut hook, 1); // boundary -> frame 1
        assert_eq!(session.sim_frame(), Frame::new(1));
        run_pad_command(&mut hook, 1);
        assert_eq!(session.sim_frame(), Frame::new(2));
        assert_eq!(hook.frames_seen(), 2);
    }

    #[test]
    fn unassigned_pads_read_neutral() {
        let session = Arc::new(StubSession::new(Some(Side::HOST)));
        let mut hook = hook_with(Arc::clone(&session));
        run_pad_command(&mut hook, 1);

        // Pad 2 in a 2-player session is unassigned.
        hook.set_slot(2, 3); // port 1 slot 2 -> pad 3
        let response = run_pad_command(&mut hook, 2);
        assert_eq!(response[2], NEUTRAL_BUTTONS);
        assert_eq!(response[3], NEUTRAL_BUTTONS);
        assert_eq!(response[4], NEUTRAL_ANALOG);
    }

    #[test]
    fn trailing_bytes_are_neutral() {
        let session = Arc::new(StubSession::new(Some(Side::HOST)));
        let mut hook = hook_with(session);
        let response = run_pad_command(&mut hook, 1);
        // Bytes beyond 2 + NUM_SYNC_INPUTS: analog-neutral up to 7, 0xFF after.
        assert_eq!(*response.last().unwrap(), NEUTRAL_BUTTONS);
    }

    #[test]
    fn session_end_stops_the_hook() {
        let session = Arc::new(StubSession::new(Some(Side::HOST)));
        let mut hook = hook_with(Arc::clone(&session));
        run_pad_command(&mut hook, 1);
        assert!(!hook.is_stopped());

        *session.ended.lock() = true;
        run_pad_command(&mut hook, 1);
        assert!(hook.is_stopped());
    }

    #[test]
    fn lobby_cancellation_stops_before_start() {
        let session = Arc::new(StubSession {
            running: false,
            ..StubSession::new(Some(Side::HOST))
        });
        let mut hook = hook_with(session);
        run_pad_command(&mut hook, 1);
        assert!(hook.is_stopped());
    }

    #[test]
    fn rumble_reaches_only_the_local_side_pad() {
        // Local player is side 1: rumble the emulator sends to pad 1 must
        // reach the physical pad (pad 0); rumble for pad 0 is remapped away.
        let session = Arc::new(StubSession::new(Some(Side::new(1))));
        let mut hook = hook_with(Arc::clone(&session));

        // Prime vibration state on pad 1 (port 1 slot 0).
        hook.set_slot(2, 1);
        hook.start_poll(2);
        hook.poll(0x42);
        hook.poll(0x00);
        hook.poll(0x7E); // motor 0 value destined for pad 1
        // Pad 1 is not the rumble target pad (only pad 0 maps): zeroed.
        // (The value is captured for remap regardless.)

        hook.set_slot(1, 1);
        hook.start_poll(1);
        hook.poll(0x42);
        hook.poll(0x00);
        // Pad 0's rumble should be the value the emulator addressed to the
        // local side's pad (pad 1), captured above.
        assert_eq!(hook.vibration_remap[1][0], 0x7E);
    }
}
