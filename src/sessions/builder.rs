//! Fluent construction of a [`LockstepSession`].

use std::io::Write;
use std::sync::Arc;

use crate::network::socket::{DatagramSocket, UdpEndpoint};
use crate::sessions::config::{ProtocolTuning, SessionConfig, SessionMode};
use crate::sessions::event::SessionCallbacks;
use crate::sessions::session::LockstepSession;
use crate::{EmulatorHost, FramelockError, FramelockResult};

/// Builds and starts a session.
///
/// ```no_run
/// use framelock::{SessionBuilder, SessionConfig, SessionCallbacks};
/// use std::sync::Arc;
///
/// # struct Emu;
/// # impl framelock::EmulatorHost for Emu {
/// #     fn capture_sync_state(&self) -> framelock::SyncState {
/// #         framelock::SyncState::new("bios", "disc")
/// #     }
/// #     fn reset_to_safe_defaults(&self) {}
/// #     fn restore_settings(&self) {}
/// # }
/// let session = SessionBuilder::new(
///     SessionConfig::host(4000, 2).with_username("host"),
/// )
/// .with_emulator(Arc::new(Emu))
/// .with_callbacks(SessionCallbacks::default())
/// .start()?;
/// # Ok::<(), framelock::FramelockError>(())
/// ```
#[must_use = "SessionBuilder does nothing until start() is called"]
pub struct SessionBuilder {
    config: SessionConfig,
    tuning: ProtocolTuning,
    callbacks: SessionCallbacks,
    socket: Option<Arc<dyn DatagramSocket>>,
    emulator: Option<Arc<dyn EmulatorHost>>,
    replay_sink: Option<Box<dyn Write + Send>>,
}

impl SessionBuilder {
    /// Starts a builder from a configuration.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            tuning: ProtocolTuning::default(),
            callbacks: SessionCallbacks::default(),
            socket: None,
            emulator: None,
            replay_sink: None,
        }
    }

    /// Overrides the protocol timing knobs.
    pub fn with_tuning(mut self, tuning: ProtocolTuning) -> Self {
        self.tuning = tuning;
        self
    }

    /// Installs the owner's callbacks.
    pub fn with_callbacks(mut self, callbacks: SessionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Supplies a pre-bound socket instead of binding a fresh UDP endpoint;
    /// the hook tests use this to interpose a
    /// [`ChaosSocket`](crate::ChaosSocket).
    pub fn with_socket(mut self, socket: Arc<dyn DatagramSocket>) -> Self {
        self.socket = Some(socket);
        self
    }

    /// Connects the emulator collaboration interface. Required.
    pub fn with_emulator(mut self, emulator: Arc<dyn EmulatorHost>) -> Self {
        self.emulator = Some(emulator);
        self
    }

    /// Supplies the stream replays are recorded to. Recording only happens
    /// when the configuration also sets `save_replay`.
    pub fn with_replay_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.replay_sink = Some(sink);
        self
    }

    /// Validates the configuration, binds the endpoint, and spawns the
    /// session's worker threads.
    ///
    /// # Errors
    ///
    /// [`FramelockError::InvalidConfiguration`] for a bad configuration or a
    /// missing emulator interface, [`FramelockError::BindFailed`] if the
    /// port is taken.
    pub fn start(self) -> FramelockResult<LockstepSession> {
        self.config.validate()?;
        let Some(emulator) = self.emulator else {
            return Err(FramelockError::InvalidConfiguration {
                reason: "an EmulatorHost implementation is required".to_owned(),
            });
        };

        let socket: Arc<dyn DatagramSocket> = match self.socket {
            Some(socket) => socket,
            None => Arc::new(UdpEndpoint::bind(self.config.local_bind_port)?),
        };

        let save_replay = self.config.save_replay && self.replay_sink.is_some();
        let num_players = match self.config.mode {
            SessionMode::Host => self.config.num_players,
            // Clients learn the real count from the host's Accept.
            SessionMode::Connect | SessionMode::Observe => 0,
        };

        LockstepSession::spawn(
            self.config.mode,
            self.config.username.clone(),
            num_players,
            self.config.peer_socket_addr(),
            save_replay,
            socket,
            self.callbacks,
            self.tuning,
            emulator,
            self.replay_sink,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SyncState;

    struct StubEmulator;

    impl EmulatorHost for StubEmulator {
        fn capture_sync_state(&self) -> SyncState {
            SyncState::new("bios", "disc")
        }

        fn reset_to_safe_defaults(&self) {}

        fn restore_settings(&self) {}
    }

    #[test]
    fn start_rejects_invalid_config_before_binding() {
        let result = SessionBuilder::new(SessionConfig::host(0, 2))
            .with_emulator(Arc::new(StubEmulator))
            .start();
        assert!(matches!(
            result,
            Err(FramelockError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn start_requires_emulator() {
        let result = SessionBuilder::new(SessionConfig::host(4000, 2)).start();
        assert!(matches!(
            result,
            Err(FramelockError::InvalidConfiguration { reason }) if reason.contains("EmulatorHost")
        ));
    }

    #[test]
    fn bind_failure_is_reported() {
        // Hold a port, then try to host on it.
        let holder = UdpEndpoint::bind(0).unwrap();
        let port = holder.local_addr().unwrap().port();
        let result = SessionBuilder::new(SessionConfig::host(port, 2))
            .with_emulator(Arc::new(StubEmulator))
            .start();
        assert!(matches!(result, Err(FramelockError::BindFailed { port: p }) if p == port));
    }
}
