//! The pre-simulation emulator snapshot and its compatibility predicate.
//!
//! Lock-step netplay is only sound when every instance starts from an
//! identical machine state. Before a session runs, each peer captures a
//! [`SyncState`] naming everything whose divergence would desynchronize the
//! simulation: the firmware revision, the loaded program, and every
//! behavior-affecting toggle. Two snapshots must be byte-compatible for a
//! join to be accepted.

use std::fmt;

/// Fixed width of the BIOS/firmware version identifier.
pub const BIOS_VERSION_LEN: usize = 64;

/// Fixed width of the disc/program identifier. Compared up to the first NUL.
pub const DISC_ID_LEN: usize = 32;

/// Opaque snapshot of the behavior-relevant emulator state, captured once
/// before the session runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncState {
    /// Firmware/BIOS version identifier, zero-padded.
    pub bios_version: [u8; BIOS_VERSION_LEN],
    /// Loaded disc/program identifier, NUL-terminated within the field.
    pub disc_id: [u8; DISC_ID_LEN],
    /// The MPEG-skip hack changes frame timing and must match exactly.
    pub skip_mpeg_hack: bool,
    /// Bitset of further behavior-affecting toggles. Any divergence here is a
    /// mismatch; individual bits are not interpreted by this crate.
    pub toggles: u32,
}

impl SyncState {
    /// Builds a snapshot from identifier strings, truncating or zero-padding
    /// to the fixed field widths.
    #[must_use]
    pub fn new(bios_version: &str, disc_id: &str) -> Self {
        let mut state = Self {
            bios_version: [0; BIOS_VERSION_LEN],
            disc_id: [0; DISC_ID_LEN],
            skip_mpeg_hack: false,
            toggles: 0,
        };
        copy_padded(&mut state.bios_version, bios_version.as_bytes());
        copy_padded(&mut state.disc_id, disc_id.as_bytes());
        state
    }

    /// Returns the disc identifier as a string, up to the first NUL.
    #[must_use]
    pub fn disc_id_str(&self) -> String {
        let end = self
            .disc_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(DISC_ID_LEN);
        String::from_utf8_lossy(&self.disc_id[..end]).into_owned()
    }

    /// Checks whether two snapshots are compatible for lock-step simulation.
    ///
    /// Field order matters: the first divergent field names the mismatch, so
    /// a BIOS difference is reported even if the disc also differs.
    ///
    /// # Errors
    ///
    /// Returns the first [`SyncMismatch`] found.
    pub fn check_compatible(&self, other: &Self) -> Result<(), SyncMismatch> {
        if self.bios_version != other.bios_version {
            return Err(SyncMismatch::BiosVersion);
        }
        if self.disc_id_str() != other.disc_id_str() {
            return Err(SyncMismatch::DiscId {
                ours: self.disc_id_str(),
                theirs: other.disc_id_str(),
            });
        }
        if self.skip_mpeg_hack != other.skip_mpeg_hack {
            return Err(SyncMismatch::SkipMpegHack);
        }
        if self.toggles != other.toggles {
            return Err(SyncMismatch::Toggles {
                ours: self.toggles,
                theirs: other.toggles,
            });
        }
        Ok(())
    }
}

fn copy_padded(dst: &mut [u8], src: &[u8]) {
    let len = src.len().min(dst.len());
    dst[..len].copy_from_slice(&src[..len]);
}

/// Why two snapshots cannot run a session together.
///
/// The `Display` form is the exact message surfaced on the owner's console.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SyncMismatch {
    /// The firmware revisions differ.
    BiosVersion,
    /// Different programs are loaded.
    DiscId {
        /// Our disc identifier.
        ours: String,
        /// The peer's disc identifier.
        theirs: String,
    },
    /// The MPEG-skip hack setting differs.
    SkipMpegHack,
    /// Some other behavior toggle differs.
    Toggles {
        /// Our toggle bits.
        ours: u32,
        /// The peer's toggle bits.
        theirs: u32,
    },
}

impl SyncMismatch {
    /// Stable one-byte code carried in `Reject` messages.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::BiosVersion => 1,
            Self::DiscId { .. } => 2,
            Self::SkipMpegHack => 3,
            Self::Toggles { .. } => 4,
        }
    }

    /// Rebuilds a mismatch from its wire code and descriptive text.
    #[must_use]
    pub fn from_code(code: u8, text: &str) -> Self {
        match code {
            2 => {
                let mut parts = text.splitn(2, " and ");
                let ours = parts.next().unwrap_or_default().to_owned();
                let theirs = parts.next().unwrap_or_default().to_owned();
                Self::DiscId { ours, theirs }
            },
            3 => Self::SkipMpegHack,
            4 => Self::Toggles { ours: 0, theirs: 0 },
            _ => Self::BiosVersion,
        }
    }

    /// The descriptive text carried alongside the code in `Reject` messages.
    #[must_use]
    pub fn detail(&self) -> String {
        match self {
            Self::DiscId { ours, theirs } => format!("{ours} and {theirs}"),
            _ => String::new(),
        }
    }
}

// The wording matches what players have seen on the console for years; do
// not edit casually.
impl fmt::Display for SyncMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BiosVersion => write!(f, "Bios version mismatch"),
            Self::DiscId { ours, theirs } => write!(
                f,
                "You are trying to boot different games: {ours} and {theirs}"
            ),
            Self::SkipMpegHack => write!(f, "SkipMpegHack settings mismatch"),
            Self::Toggles { ours, theirs } => write!(
                f,
                "Emulation settings mismatch ({ours:#010x} vs {theirs:#010x})"
            ),
        }
    }
}

impl std::error::Error for SyncMismatch {}
