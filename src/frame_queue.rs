//! The per-side frame input exchange.
//!
//! One [`FrameQueue`] holds an ordered input store for every side in the
//! session. The emulator thread blocks in [`FrameQueue::get_blocking`] until
//! the scheduled frame's record arrives; the receive thread feeds records in
//! via [`FrameQueue::insert_remote`] and wakes it. A single mutex plus one
//! condvar cover all sides (contention is two threads at 60 Hz), and one lock
//! keeps the happens-before story trivial: a write to side `s` is visible to
//! any `get` of side `s` that returns it.
//!
//! # Input delay
//!
//! With a session delay of `d`, frames `0..d` of every side are pre-primed
//! with all-zero records before the session runs, and the local input
//! counter starts at `d`. The emulator's first `d` frames therefore never
//! block, and the input sampled while simulating frame `f` lands on frame
//! `f + d - 1`: the simulation consumes inputs sampled `d` frames earlier.
//!
//! # Immutability
//!
//! A record is immutable once written. Re-delivered `Input` datagrams are
//! idempotent: a duplicate is dropped, and a *conflicting* write for an
//! occupied slot is dropped and reported, never applied.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::frame_info::{FrameInput, NUM_SYNC_INPUTS};
use crate::report_fault;
use crate::telemetry::{FaultKind, FaultSeverity};
use crate::{Frame, FramelockError, Side, SideVec};

/// Why a blocking `get` returned without an input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitError {
    /// The timeout elapsed with no record for the requested frame.
    Timeout,
    /// The queue was closed (session ended) while waiting.
    Closed,
}

/// What happened to an incoming remote record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// New record stored.
    Inserted,
    /// Same record already present (or below the receive frontier).
    Duplicate,
    /// An occupied slot was offered different bytes. The original is kept.
    Conflict,
}

#[derive(Debug, Default)]
struct SideStore {
    inputs: BTreeMap<Frame, FrameInput>,
    /// Lowest frame not yet seen for this side; everything below is known.
    recv_frontier: Frame,
}

impl SideStore {
    fn advance_frontier(&mut self) {
        while self.inputs.contains_key(&self.recv_frontier) {
            self.recv_frontier = self.recv_frontier.next();
        }
    }
}

#[derive(Debug)]
struct QueueState {
    sides: SideVec<SideStore>,
    local_side: Option<Side>,
    /// Next frame number the local side will publish.
    current_local_frame: Frame,
    /// The frame the emulator is currently simulating.
    sim_frame: Frame,
    open: bool,
}

impl QueueState {
    fn store(&self, side: Side) -> Option<&SideStore> {
        self.sides.get(side.as_usize())
    }

    fn store_mut(&mut self, side: Side) -> Option<&mut SideStore> {
        self.sides.get_mut(side.as_usize())
    }
}

/// The shared input store for all sides of one session.
#[derive(Debug)]
pub(crate) struct FrameQueue {
    state: Mutex<QueueState>,
    data_ready: Condvar,
}

impl FrameQueue {
    /// Creates an unprimed, closed queue. [`FrameQueue::prime`] must run
    /// before any frame traffic.
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                sides: SideVec::new(),
                local_side: None,
                current_local_frame: Frame::ZERO,
                sim_frame: Frame::ZERO,
                open: false,
            }),
            data_ready: Condvar::new(),
        }
    }

    /// Prepares the queue for a run: one store per side, frames
    /// `0..delay` of every side pre-filled with zero inputs, the local input
    /// counter at `delay`. Opens the queue.
    pub(crate) fn prime(&self, num_players: usize, local_side: Option<Side>, delay: u8) {
        let mut state = self.state.lock();
        state.sides.clear();
        for _ in 0..num_players {
            let mut store = SideStore::default();
            for f in 0..u32::from(delay) {
                let frame = Frame::new(f);
                store.inputs.insert(frame, FrameInput::zeroed(frame));
            }
            store.advance_frontier();
            state.sides.push(store);
        }
        state.local_side = local_side;
        state.current_local_frame = Frame::new(u32::from(delay));
        state.sim_frame = Frame::ZERO;
        state.open = true;
        drop(state);
        self.data_ready.notify_all();
    }

    /// Closes the queue, waking every blocked `get` with
    /// [`WaitError::Closed`]. Idempotent.
    pub(crate) fn close(&self) {
        self.state.lock().open = false;
        self.data_ready.notify_all();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Publishes the local side's input for the current local frame and
    /// advances the counter by exactly one. Returns the frame written.
    ///
    /// # Errors
    ///
    /// [`FramelockError::SessionEnded`] once the queue is closed, and
    /// [`FramelockError::InvalidRequest`] for observers (no local side).
    pub(crate) fn publish_local(
        &self,
        bytes: [u8; NUM_SYNC_INPUTS],
    ) -> Result<Frame, FramelockError> {
        let mut state = self.state.lock();
        if !state.open {
            return Err(FramelockError::SessionEnded);
        }
        let Some(side) = state.local_side else {
            return Err(FramelockError::InvalidRequest {
                info: "observers do not publish inputs",
            });
        };
        let frame = state.current_local_frame;
        let record = FrameInput::from_bytes(frame, bytes);
        let Some(store) = state.store_mut(side) else {
            return Err(FramelockError::InvalidRequest {
                info: "queue is not primed",
            });
        };
        debug_assert!(!store.inputs.contains_key(&frame));
        store.inputs.insert(frame, record);
        store.advance_frontier();
        state.current_local_frame = frame.next();
        drop(state);
        self.data_ready.notify_all();
        Ok(frame)
    }

    /// Stores a record received from the network. First write wins; see
    /// [`InsertOutcome`].
    pub(crate) fn insert_remote(
        &self,
        side: Side,
        frame: Frame,
        bytes: [u8; NUM_SYNC_INPUTS],
    ) -> InsertOutcome {
        let mut state = self.state.lock();
        let Some(store) = state.store_mut(side) else {
            return InsertOutcome::Duplicate;
        };
        if frame < store.recv_frontier {
            return InsertOutcome::Duplicate;
        }
        match store.inputs.get(&frame).map(|existing| existing.bytes) {
            Some(existing) if existing == bytes => InsertOutcome::Duplicate,
            Some(_) => {
                report_fault!(
                    FaultSeverity::Error,
                    FaultKind::FrameQueue,
                    "conflicting input for {side} frame {frame}; keeping the first write"
                );
                InsertOutcome::Conflict
            },
            None => {
                store.inputs.insert(frame, FrameInput::from_bytes(frame, bytes));
                store.advance_frontier();
                drop(state);
                self.data_ready.notify_all();
                InsertOutcome::Inserted
            },
        }
    }

    /// Returns side `side`'s record for `frame`, blocking until it arrives,
    /// the queue closes, or `timeout` elapses. While blocked, `on_tick` runs
    /// (without the queue lock) every `tick` so the caller can drive
    /// retransmission.
    pub(crate) fn get_blocking(
        &self,
        side: Side,
        frame: Frame,
        timeout: Duration,
        tick: Duration,
        mut on_tick: impl FnMut(),
    ) -> Result<FrameInput, WaitError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                loop {
                    if let Some(input) =
                        state.store(side).and_then(|s| s.inputs.get(&frame)).copied()
                    {
                        return Ok(input);
                    }
                    if !state.open {
                        return Err(WaitError::Closed);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::Timeout);
                    }
                    let wake_at = (now + tick).min(deadline);
                    if self.data_ready.wait_until(&mut state, wake_at).timed_out() {
                        break;
                    }
                }
            }
            // Lock released: let the caller pump its retransmissions.
            on_tick();
        }
    }

    /// Non-blocking lookup.
    pub(crate) fn get_now(&self, side: Side, frame: Frame) -> Option<FrameInput> {
        let state = self.state.lock();
        state.store(side).and_then(|s| s.inputs.get(&frame)).copied()
    }

    /// Advances the simulation frame counter and returns the new value. The
    /// local *input* counter advances independently via `publish_local`.
    pub(crate) fn next_frame(&self) -> Frame {
        let mut state = self.state.lock();
        state.sim_frame = state.sim_frame.next();
        state.sim_frame
    }

    pub(crate) fn sim_frame(&self) -> Frame {
        self.state.lock().sim_frame
    }

    pub(crate) fn current_local_frame(&self) -> Frame {
        self.state.lock().current_local_frame
    }

    /// Lowest frame not yet seen from `side`.
    pub(crate) fn recv_frontier(&self, side: Side) -> Frame {
        self.state
            .lock()
            .store(side)
            .map(|s| s.recv_frontier)
            .unwrap_or(Frame::ZERO)
    }

    /// Collects the local side's unacknowledged tail for transmission: up to
    /// `max_records` consecutive frames starting at `floor` (the oldest
    /// frames the peer is missing). Oldest-first matters: the receiver can
    /// only consume its next frame, so a window anchored anywhere later
    /// could starve it forever under sustained loss. Returns the first
    /// frame plus the flattened record bytes.
    pub(crate) fn outgoing_window(
        &self,
        floor: Frame,
        max_records: usize,
    ) -> Option<(Frame, Vec<u8>)> {
        let state = self.state.lock();
        let side = state.local_side?;
        let store = state.store(side)?;
        let end = state.current_local_frame;
        if floor >= end {
            return None;
        }
        let mut bytes = Vec::with_capacity(max_records * NUM_SYNC_INPUTS);
        let mut start = None;
        let mut next = floor;
        // GC keeps everything at or above the peers' shared ack floor, so
        // this walk is contiguous once it finds the first retained record.
        while next < end && bytes.len() < max_records * NUM_SYNC_INPUTS {
            match store.inputs.get(&next) {
                Some(record) => {
                    start.get_or_insert(next);
                    bytes.extend_from_slice(&record.bytes);
                    next = next.next();
                },
                None if start.is_none() => next = next.next(),
                None => break,
            }
        }
        start.map(|s| (s, bytes))
    }

    /// Drops records no peer or local consumer can need any more: local-side
    /// frames below both `min_acked` and the simulation frame, remote-side
    /// frames below the simulation frame.
    pub(crate) fn collect_garbage(&self, min_acked: Frame) {
        let mut state = self.state.lock();
        let sim = state.sim_frame;
        let local = state.local_side;
        for (idx, store) in state.sides.iter_mut().enumerate() {
            let cutoff = if local.map(Side::as_usize) == Some(idx) {
                min_acked.min(sim)
            } else {
                sim
            };
            store.inputs.retain(|&frame, _| frame >= cutoff);
        }
    }

    /// Number of records currently held for `side` (diagnostics and tests).
    pub(crate) fn len_of(&self, side: Side) -> usize {
        self.state
            .lock()
            .store(side)
            .map(|s| s.inputs.len())
            .unwrap_or(0)
    }
}
