//! Owner-facing callbacks and exit conditions.

use crate::sync_state::SyncMismatch;
use crate::Frame;

/// Why a session reached a terminal phase.
///
/// Exactly one reason is reported per session, via
/// [`LockstepSession::exit_reason`](crate::LockstepSession::exit_reason) and
/// a final `on_status` line.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExitReason {
    /// The session ended cleanly (a peer or the local user ended it after
    /// it was running).
    Completed,
    /// The local user cancelled before the session was running.
    CancelledByUser,
    /// A peer went silent past the silence timeout.
    PeerTimeout {
        /// The simulation frame at which the peer was declared lost.
        frame: Frame,
    },
    /// The peers' emulator snapshots were incompatible.
    SyncMismatch(SyncMismatch),
    /// The host never answered the join request.
    JoinTimeout,
    /// The local port could not be bound.
    BindFailed {
        /// The requested port.
        port: u16,
    },
    /// No input arrived for a frame within the input wait timeout.
    InputTimeout {
        /// The frame the emulator was blocked on.
        frame: Frame,
    },
    /// A peer reported a fatal error.
    PeerError(String),
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "session completed"),
            Self::CancelledByUser => write!(f, "cancelled by user"),
            Self::PeerTimeout { frame } => write!(f, "peer timeout on frame {frame}"),
            Self::SyncMismatch(reason) => write!(f, "{reason}"),
            Self::JoinTimeout => write!(f, "join timed out"),
            Self::BindFailed { port } => write!(f, "unable to bind port {port}"),
            Self::InputTimeout { frame } => write!(f, "timeout on frame {frame}"),
            Self::PeerError(message) => write!(f, "peer error: {message}"),
        }
    }
}

/// Callback bundle supplied by the owning application.
///
/// Callbacks are invoked from the session's receive thread; owners that
/// drive a UI must marshal to their UI thread. The session holds the
/// callbacks by value and never invokes them after reaching a terminal phase
/// and draining, so the owner may tear its UI down once
/// [`wait_for_exit`](crate::LockstepSession::wait_for_exit) returns.
pub struct SessionCallbacks {
    /// The lobby roster changed. Receives every username, host first.
    pub on_userlist: Box<dyn Fn(&[String]) + Send + Sync>,
    /// A chat line arrived.
    pub on_chat: Box<dyn Fn(&str, &str) + Send + Sync>,
    /// The lobby connection is up; the argument is the current input delay.
    pub on_connection_established: Box<dyn Fn(u8) + Send + Sync>,
    /// A status line for the owner's console.
    pub on_status: Box<dyn Fn(&str) + Send + Sync>,
}

impl Default for SessionCallbacks {
    fn default() -> Self {
        Self {
            on_userlist: Box::new(|_| {}),
            on_chat: Box::new(|_, _| {}),
            on_connection_established: Box::new(|_| {}),
            on_status: Box::new(|_| {}),
        }
    }
}

impl std::fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCallbacks").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_reason_messages() {
        assert_eq!(
            ExitReason::InputTimeout {
                frame: Frame::new(9)
            }
            .to_string(),
            "timeout on frame 9"
        );
        assert_eq!(
            ExitReason::SyncMismatch(SyncMismatch::BiosVersion).to_string(),
            "Bios version mismatch"
        );
        assert_eq!(ExitReason::JoinTimeout.to_string(), "join timed out");
    }

    #[test]
    fn default_callbacks_are_inert() {
        let callbacks = SessionCallbacks::default();
        (callbacks.on_userlist)(&["a".into()]);
        (callbacks.on_chat)("a", "hi");
        (callbacks.on_connection_established)(3);
        (callbacks.on_status)("ok");
    }
}
