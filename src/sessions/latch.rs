//! A one-shot open/cancel latch.
//!
//! The connect thread must not negotiate until the emulator has reached its
//! first input poll (before that point there is no snapshot to negotiate
//! with), and it must also wake if the user cancels first. A condition
//! variable alone invites missed-wakeup bugs; this latch pairs one with an
//! explicit tri-state predicate.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Closed,
    Open,
    Cancelled,
}

/// See the module docs.
#[derive(Debug)]
pub(crate) struct Latch {
    state: Mutex<LatchState>,
    cv: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Closed),
            cv: Condvar::new(),
        }
    }

    /// Opens the latch. Later opens and cancels are ignored.
    pub(crate) fn open(&self) {
        let mut state = self.state.lock();
        if *state == LatchState::Closed {
            *state = LatchState::Open;
            self.cv.notify_all();
        }
    }

    /// Cancels all waiters. Ignored if the latch already opened.
    pub(crate) fn cancel(&self) {
        let mut state = self.state.lock();
        if *state == LatchState::Closed {
            *state = LatchState::Cancelled;
            self.cv.notify_all();
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        *self.state.lock() == LatchState::Open
    }

    /// Blocks until the latch opens or is cancelled. Returns `true` if it
    /// opened. `timeout` bounds the wait; expiry counts as cancellation.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state == LatchState::Closed {
            if self.cv.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state == LatchState::Open
    }
}
