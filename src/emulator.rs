//! The emulator collaboration interface.

use crate::sync_state::SyncState;

/// What the emulator must expose for a session to run on top of it.
///
/// The session calls [`capture_sync_state`](Self::capture_sync_state) exactly
/// once, after the emulator's first controller poll (so the machine is far
/// enough along that the snapshot is meaningful) and before the session
/// starts running. The settings hooks bracket the session: divergence-prone
/// options are forced to safe defaults while a session is open and restored
/// when it closes.
pub trait EmulatorHost: Send + Sync {
    /// Snapshot everything whose divergence between peers would
    /// desynchronize the simulation.
    fn capture_sync_state(&self) -> SyncState;

    /// Force behavior-affecting settings to the session-safe defaults.
    /// Called when the session opens, after the current settings are saved.
    fn reset_to_safe_defaults(&self);

    /// Restore the settings saved before
    /// [`reset_to_safe_defaults`](Self::reset_to_safe_defaults). Called when
    /// the session closes.
    fn restore_settings(&self);
}
