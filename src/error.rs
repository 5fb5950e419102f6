//! Error types for framelock operations.
//!
//! There is one crate-wide error enum, [`FramelockError`], with structured
//! variants that store their debugging context as plain fields and format
//! lazily in `Display`. Hot-path construction never allocates except where a
//! peer-supplied string is part of the error itself.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::sync_state::SyncMismatch;
use crate::{Frame, SessionPhase, Side};

/// Errors that can occur while decoding or encoding wire messages.
///
/// Decode failures on the receive path are not fatal: the datagram is dropped
/// and counted (see [`telemetry`](crate::telemetry)).
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CodecError {
    /// The buffer ended before the announced structure was complete.
    Truncated {
        /// Bytes required to finish the current field.
        needed: usize,
        /// Bytes actually remaining.
        remaining: usize,
    },
    /// The message kind tag is not one this protocol version understands.
    UnknownKind(u8),
    /// A length-prefixed string was not valid UTF-8.
    InvalidUtf8,
    /// The header's payload length did not match the bytes present.
    PayloadLengthMismatch {
        /// Length announced in the header.
        announced: usize,
        /// Bytes actually present after the header.
        actual: usize,
    },
    /// A string exceeded the maximum length encodable with a u16 prefix.
    StringTooLong(usize),
    /// A payload exceeded the maximum length encodable with a u16 prefix.
    PayloadTooLong(usize),
    /// A field held a value outside its legal range (bad side index,
    /// zero-count input batch, unknown reject code).
    InvalidField(&'static str),
}

impl Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated { needed, remaining } => {
                write!(
                    f,
                    "message truncated: needed {needed} more bytes, {remaining} remaining"
                )
            },
            Self::UnknownKind(tag) => write!(f, "unknown message kind tag {tag:#04x}"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::PayloadLengthMismatch { announced, actual } => {
                write!(
                    f,
                    "payload length mismatch: header announced {announced} bytes, {actual} present"
                )
            },
            Self::StringTooLong(len) => write!(f, "string of {len} bytes exceeds u16 prefix"),
            Self::PayloadTooLong(len) => write!(f, "payload of {len} bytes exceeds u16 prefix"),
            Self::InvalidField(field) => write!(f, "invalid value for field: {field}"),
        }
    }
}

impl Error for CodecError {}

/// The error type for all fallible framelock operations.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FramelockError {
    /// The session configuration was rejected before any socket was opened.
    InvalidConfiguration {
        /// What was wrong with the configuration.
        reason: String,
    },
    /// The local UDP port could not be bound.
    BindFailed {
        /// The requested port.
        port: u16,
    },
    /// The operation requires the session to be in a different phase.
    WrongPhase {
        /// The phase the session was actually in.
        current: SessionPhase,
        /// The phase the operation requires.
        required: SessionPhase,
    },
    /// The session has reached a terminal phase; no further frame traffic is
    /// possible.
    SessionEnded,
    /// No input for the given frame arrived within the input wait timeout.
    InputTimeout {
        /// The frame the caller was blocked on.
        frame: Frame,
    },
    /// The host did not accept the join request within the join timeout.
    JoinTimeout,
    /// A peer went silent past the peer silence timeout.
    PeerTimeout {
        /// The simulation frame at the moment the peer was declared lost.
        frame: Frame,
    },
    /// The peers' emulator snapshots are incompatible.
    SyncStateMismatch(SyncMismatch),
    /// A message could not be encoded or decoded.
    Codec(CodecError),
    /// An input record arrived attributed to a side the sending peer does not
    /// own.
    SideMismatch {
        /// The side claimed in the message.
        claimed: Side,
        /// The side the peer actually owns, if any.
        owned: Option<Side>,
    },
    /// The request is not valid in the session's current state.
    InvalidRequest {
        /// Short description of the violated precondition.
        info: &'static str,
    },
}

impl Display for FramelockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfiguration { reason } => {
                write!(f, "invalid session configuration: {reason}")
            },
            Self::BindFailed { port } => write!(f, "unable to bind UDP port {port}"),
            Self::WrongPhase { current, required } => {
                write!(f, "operation requires phase {required}, session is {current}")
            },
            Self::SessionEnded => write!(f, "session has ended"),
            Self::InputTimeout { frame } => {
                write!(f, "timed out waiting for inputs on frame {frame}")
            },
            Self::JoinTimeout => write!(f, "timed out waiting for the host to accept the join"),
            Self::PeerTimeout { frame } => {
                write!(f, "peer went silent (simulation frame {frame})")
            },
            Self::SyncStateMismatch(reason) => write!(f, "{reason}"),
            Self::Codec(err) => write!(f, "codec failure: {err}"),
            Self::SideMismatch { claimed, owned } => match owned {
                Some(owned) => {
                    write!(f, "input claims {claimed} but the peer owns {owned}")
                },
                None => write!(f, "input claims {claimed} but the peer owns no side"),
            },
            Self::InvalidRequest { info } => write!(f, "invalid request: {info}"),
        }
    }
}

impl Error for FramelockError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Codec(err) => Some(err),
            _ => None,
        }
    }
}

impl From<CodecError> for FramelockError {
    fn from(err: CodecError) -> Self {
        Self::Codec(err)
    }
}

impl From<SyncMismatch> for FramelockError {
    fn from(reason: SyncMismatch) -> Self {
        Self::SyncStateMismatch(reason)
    }
}
