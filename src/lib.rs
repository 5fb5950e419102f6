//! # Framelock
//!
//! Framelock is a deterministic **lock-step** netplay session layer for
//! cycle-accurate console emulators, written in 100% safe Rust. Two to eight
//! emulator instances run the same program from an identical initial state;
//! each instance contributes the inputs for one *side* (controller slot),
//! exchanges those inputs over UDP, and advances one emulated frame only when
//! every side's inputs for the scheduled frame are known. Determinism of the
//! emulator, plus identical inputs, plus an identical starting snapshot,
//! yields an identical simulation at every endpoint.
//!
//! Unlike rollback netcode, framelock never predicts: the emulator thread is
//! stalled *in place*, exactly where it polls the controller, until the
//! remote inputs for the scheduled frame have arrived. Smoothness comes from
//! a negotiated input delay, not from speculation.
//!
//! The crate is built from five components:
//!
//! - [`network::socket`]: the UDP datagram endpoint,
//! - [`network::peer`]: per-peer reliability (sequencing, acks, retransmits,
//!   keep-alive) layered over unreliable datagrams,
//! - [`sessions`]: the lobby protocol and session state machine,
//! - [`frame_queue`]: the per-side input exchange the emulator blocks on,
//! - [`hook`]: the adapter that turns the emulator's byte-by-byte controller
//!   poll protocol into frame-boundary events.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]

pub use error::{CodecError, FramelockError};

/// A specialized `Result` type for framelock operations.
///
/// The second type parameter may be overridden for functions that return a
/// different error type. Named `FramelockResult` rather than `Result` so glob
/// imports never shadow `std::result::Result`.
pub type FramelockResult<T, E = FramelockError> = std::result::Result<T, E>;

pub use emulator::EmulatorHost;
pub use frame_info::{FrameInput, NUM_SYNC_INPUTS};
pub use hook::{PadBackend, PadPollHook};
pub use network::chaos_socket::{ChaosConfig, ChaosSocket, ChaosStats};
pub use network::socket::{DatagramSocket, UdpEndpoint};
pub use replay::{ReplayReader, ReplayRecorder, REPLAY_MAGIC};
pub use sessions::builder::SessionBuilder;
pub use sessions::config::{ProtocolTuning, SessionConfig, SessionMode};
pub use sessions::event::{ExitReason, SessionCallbacks};
pub use sessions::session::LockstepSession;
pub use sync_state::{SyncMismatch, SyncState};

pub mod emulator;
#[doc(hidden)]
pub mod error;
#[doc(hidden)]
pub mod frame_info;
#[doc(hidden)]
pub mod frame_queue;
pub mod hook;
pub mod replay;
/// Minimal PCG32 generator used for deterministic fault injection.
pub mod rng;
pub mod sync_state;
pub mod telemetry;

/// Network transport: datagram endpoint, wire codec, message types, the
/// per-peer reliability channel, and the fault-injection test socket.
pub mod network {
    pub mod chaos_socket;
    /// Byte-exact little-endian wire codec.
    pub mod codec;
    #[doc(hidden)]
    pub mod messages;
    #[doc(hidden)]
    pub mod peer;
    /// The UDP datagram endpoint and the socket abstraction.
    pub mod socket;
}

/// Session layer: configuration, builder, lobby state machine, callbacks.
pub mod sessions {
    #[doc(hidden)]
    pub mod builder;
    /// Session configuration and protocol tuning knobs.
    pub mod config;
    #[doc(hidden)]
    pub mod event;
    pub(crate) mod latch;
    #[doc(hidden)]
    pub mod session;
}

// #############
// # CONSTANTS #
// #############

/// The maximum number of sides (players) a session supports.
pub const MAX_SIDES: usize = 8;

/// One iteration of the emulator's main loop, identified by a monotonically
/// increasing number starting at 0.
///
/// `Frame` is a newtype over `u32`. Frame numbers never go backwards and
/// never wrap in practice (a 60 Hz session would need over two years of
/// continuous play to exhaust them); arithmetic helpers are checked or
/// saturating so a pathological counter cannot corrupt queue indexing.
///
/// # Examples
///
/// ```
/// use framelock::Frame;
///
/// let f = Frame::new(41);
/// assert_eq!(f.next(), Frame::new(42));
/// assert!(f < f.next());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(u32);

impl Frame {
    /// Frame 0, the first frame of a session.
    pub const ZERO: Self = Self(0);

    /// Creates a `Frame` from a raw `u32`.
    #[inline]
    #[must_use]
    pub const fn new(frame: u32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `u32` value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the frame as a `usize` for indexing.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns the next frame, saturating at `u32::MAX`.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Adds `rhs` frames, saturating at `u32::MAX`.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, rhs: u32) -> Self {
        Self(self.0.saturating_add(rhs))
    }

    /// Subtracts `rhs` frames, saturating at 0.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: u32) -> Self {
        Self(self.0.saturating_sub(rhs))
    }

    /// Returns the distance in frames between `self` and `other`.
    #[inline]
    #[must_use]
    pub const fn abs_diff(self, other: Self) -> u32 {
        self.0.abs_diff(other.0)
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::ops::Add<u32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<u32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = u32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<u32> for Frame {
    #[inline]
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<Frame> for u32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

impl PartialEq<u32> for Frame {
    #[inline]
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl PartialOrd<u32> for Frame {
    #[inline]
    fn partial_cmp(&self, other: &u32) -> Option<std::cmp::Ordering> {
        self.0.partial_cmp(other)
    }
}

/// A controller-input slot on the session.
///
/// Side 0 belongs to the host; sides `1..n-1` belong to clients in join
/// order. A side is distinct from the emulator's local controller pad index:
/// every instance's pad 0 shows side 0's inputs regardless of which side the
/// local player was assigned.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Side(u8);

impl Side {
    /// The host's side.
    pub const HOST: Self = Self(0);

    /// Creates a `Side` from a raw index.
    #[inline]
    #[must_use]
    pub const fn new(side: u8) -> Self {
        Self(side)
    }

    /// Returns the underlying index.
    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the side as a `usize` for indexing.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if this side is a valid player slot for a session with
    /// `num_players` sides.
    #[inline]
    #[must_use]
    pub const fn is_valid_for(self, num_players: usize) -> bool {
        (self.0 as usize) < num_players
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "side {}", self.0)
    }
}

/// The lifecycle phase of a [`LockstepSession`].
///
/// ```text
/// Idle --bind ok--> Binding
/// Binding --host mode--> Advertising --all clients accepted--> Ready
/// Binding --client mode--> Handshaking --accepted--> Ready
/// Ready --delay agreed, all ready--> Running
/// any --end request / timeout / mismatch--> Ended
/// any (pre-Ready) --user cancel--> Cancelled
/// ```
///
/// `Cancelled` and `Ended` are terminal; entering either wakes every blocked
/// wait and stops further frame publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// No session activity yet.
    Idle,
    /// The local endpoint is bound; negotiation has not started.
    Binding,
    /// Host only: waiting for clients to join.
    Advertising,
    /// Client only: join sent, waiting for the host's accept.
    Handshaking,
    /// All peers known; waiting on the delay agreement and the ready barrier.
    Ready,
    /// Lock-step frame exchange in progress.
    Running,
    /// Terminal: cancelled by the user before the session was ready.
    Cancelled,
    /// Terminal: the session finished, failed, or was torn down.
    Ended,
}

impl SessionPhase {
    /// Returns `true` for the two terminal phases.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Ended)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Binding => "Binding",
            Self::Advertising => "Advertising",
            Self::Handshaking => "Handshaking",
            Self::Ready => "Ready",
            Self::Running => "Running",
            Self::Cancelled => "Cancelled",
            Self::Ended => "Ended",
        };
        f.write_str(name)
    }
}

/// Stack-allocated vector sized for one entry per side.
///
/// Sessions have at most [`MAX_SIDES`] participants, so per-side bookkeeping
/// never spills to the heap.
pub type SideVec<T> = smallvec::SmallVec<[T; MAX_SIDES]>;
