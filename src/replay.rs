//! Replay recording and playback.
//!
//! A replay is the session's starting snapshot plus every accepted input, in
//! arrival order. Replayed against the same emulator build, it reproduces
//! the simulation byte for byte, which is also what makes replays the
//! cheapest desync forensics tool available.
//!
//! File layout, all little-endian:
//!
//! ```text
//! magic      := "REP1"
//! sync_state := u32 len | len bytes (the wire snapshot encoding)
//! record     := u32 frame | u8 side | u8[N] input      (repeated to EOF)
//! ```

use std::io::{self, Read, Write};

use crate::frame_info::{FrameInput, NUM_SYNC_INPUTS};
use crate::sync_state::{SyncState, BIOS_VERSION_LEN, DISC_ID_LEN};
use crate::{Frame, Side};

/// The four magic bytes opening every replay stream.
pub const REPLAY_MAGIC: &[u8; 4] = b"REP1";

const SYNC_STATE_WIRE_LEN: usize = BIOS_VERSION_LEN + DISC_ID_LEN + 1 + 4;

/// Streams session inputs into a writer as they are accepted.
pub struct ReplayRecorder {
    sink: Box<dyn Write + Send>,
}

impl std::fmt::Debug for ReplayRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayRecorder").finish_non_exhaustive()
    }
}

impl ReplayRecorder {
    /// Opens a recorder over `sink`, writing the magic and the snapshot
    /// header immediately.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn new(mut sink: Box<dyn Write + Send>, sync_state: &SyncState) -> io::Result<Self> {
        sink.write_all(REPLAY_MAGIC)?;
        let mut blob = Vec::with_capacity(SYNC_STATE_WIRE_LEN);
        blob.extend_from_slice(&sync_state.bios_version);
        blob.extend_from_slice(&sync_state.disc_id);
        blob.push(u8::from(sync_state.skip_mpeg_hack));
        blob.extend_from_slice(&sync_state.toggles.to_le_bytes());
        sink.write_all(&(blob.len() as u32).to_le_bytes())?;
        sink.write_all(&blob)?;
        Ok(Self { sink })
    }

    /// Appends one accepted input record.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn record(&mut self, side: Side, input: &FrameInput) -> io::Result<()> {
        self.sink.write_all(&input.frame.as_u32().to_le_bytes())?;
        self.sink.write_all(&[side.as_u8()])?;
        self.sink.write_all(&input.bytes)
    }

    /// Flushes the underlying sink.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors from the sink.
    pub fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

/// One input record read back from a replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayRecord {
    /// The side that published the input.
    pub side: Side,
    /// The input itself, carrying its frame number.
    pub input: FrameInput,
}

/// Reads a replay stream back.
#[derive(Debug)]
pub struct ReplayReader<R> {
    source: R,
    sync_state: SyncState,
}

impl<R: Read> ReplayReader<R> {
    /// Opens a reader, validating the magic and decoding the snapshot.
    ///
    /// # Errors
    ///
    /// `InvalidData` on a bad magic or malformed snapshot header; other I/O
    /// errors pass through.
    pub fn new(mut source: R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        source.read_exact(&mut magic)?;
        if &magic != REPLAY_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "not a replay stream (bad magic)",
            ));
        }
        let mut len_bytes = [0u8; 4];
        source.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len != SYNC_STATE_WIRE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected snapshot length",
            ));
        }
        let mut blob = vec![0u8; len];
        source.read_exact(&mut blob)?;

        let mut bios_version = [0u8; BIOS_VERSION_LEN];
        bios_version.copy_from_slice(&blob[..BIOS_VERSION_LEN]);
        let mut disc_id = [0u8; DISC_ID_LEN];
        disc_id.copy_from_slice(&blob[BIOS_VERSION_LEN..BIOS_VERSION_LEN + DISC_ID_LEN]);
        let skip_mpeg_hack = blob[BIOS_VERSION_LEN + DISC_ID_LEN] != 0;
        let mut toggle_bytes = [0u8; 4];
        toggle_bytes.copy_from_slice(&blob[BIOS_VERSION_LEN + DISC_ID_LEN + 1..]);

        Ok(Self {
            source,
            sync_state: SyncState {
                bios_version,
                disc_id,
                skip_mpeg_hack,
                toggles: u32::from_le_bytes(toggle_bytes),
            },
        })
    }

    /// The snapshot the replay was recorded against.
    pub fn sync_state(&self) -> &SyncState {
        &self.sync_state
    }

    /// Reads the next record, or `None` at a clean end of stream.
    ///
    /// # Errors
    ///
    /// `UnexpectedEof` if the stream ends inside a record.
    pub fn next_record(&mut self) -> io::Result<Option<ReplayRecord>> {
        let mut frame_bytes = [0u8; 4];
        match self.source.read_exact(&mut frame_bytes) {
            Ok(()) => {},
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(err) => return Err(err),
        }
        let mut side = [0u8; 1];
        self.source.read_exact(&mut side)?;
        let mut bytes = [0u8; NUM_SYNC_INPUTS];
        self.source.read_exact(&mut bytes)?;
        Ok(Some(ReplayRecord {
            side: Side::new(side[0]),
            input: FrameInput::from_bytes(Frame::new(u32::from_le_bytes(frame_bytes)), bytes),
        }))
    }
}
