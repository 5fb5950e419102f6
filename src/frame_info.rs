//! The per-frame controller input record.

use crate::Frame;

/// Number of controller bytes synchronized per side per frame.
///
/// Six bytes cover the two button bytes plus the four analog stick axes. A
/// digital-only build would need just the two button bytes, but analog games
/// desync immediately without the stick axes, so the larger record is the
/// default.
pub const NUM_SYNC_INPUTS: usize = 6;

/// Byte returned for an idle digital button byte (all buttons released).
pub const NEUTRAL_BUTTONS: u8 = 0xFF;

/// Byte returned for a centered analog axis.
pub const NEUTRAL_ANALOG: u8 = 0x7F;

/// The synchronized controller bytes for one side on one frame.
///
/// A `FrameInput` is immutable once written into a queue: retransmission and
/// duplicate delivery can never change the bytes a frame simulates with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct FrameInput {
    /// The frame this input belongs to.
    pub frame: Frame,
    /// The raw controller bytes, in poll order: buttons first, then analog
    /// axes.
    pub bytes: [u8; NUM_SYNC_INPUTS],
}

impl FrameInput {
    /// An input record with every byte zero, used to pre-prime the first
    /// `delay` frames of a session.
    #[must_use]
    pub const fn zeroed(frame: Frame) -> Self {
        Self {
            frame,
            bytes: [0; NUM_SYNC_INPUTS],
        }
    }

    /// An input record representing an untouched controller: buttons idle,
    /// analog axes centered.
    #[must_use]
    pub const fn neutral(frame: Frame) -> Self {
        let mut bytes = [NEUTRAL_ANALOG; NUM_SYNC_INPUTS];
        bytes[0] = NEUTRAL_BUTTONS;
        bytes[1] = NEUTRAL_BUTTONS;
        Self { frame, bytes }
    }

    /// Creates a record from raw bytes.
    #[must_use]
    pub const fn from_bytes(frame: Frame, bytes: [u8; NUM_SYNC_INPUTS]) -> Self {
        Self { frame, bytes }
    }
}

impl std::fmt::Display for FrameInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "frame {}: 0x", self.frame)?;
        for byte in &self.bytes {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}
