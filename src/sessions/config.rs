//! Session configuration and protocol tuning.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::FramelockError;

/// The role this instance plays in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionMode {
    /// Bind a well-known port, accept joins, own the delay decision.
    Host,
    /// Join a host and contribute inputs for an assigned side.
    Connect,
    /// Join a host as a spectator: receive inputs, publish none.
    Observe,
}

impl std::fmt::Display for SessionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => write!(f, "Host"),
            Self::Connect => write!(f, "Connect"),
            Self::Observe => write!(f, "Observe"),
        }
    }
}

/// Maximum accepted username length in bytes.
pub const MAX_USERNAME_BYTES: usize = 64;

/// The input delay range a host may choose from, in frames.
pub const INPUT_DELAY_RANGE: std::ops::RangeInclusive<u8> = 1..=100;

/// User-facing session configuration.
///
/// Validation happens in [`SessionConfig::validate`], called by the builder
/// before any socket is opened; a bad configuration never gets as far as a
/// bind.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Role of this instance.
    pub mode: SessionMode,
    /// Local UDP port. Must be nonzero when hosting; 0 picks an ephemeral
    /// port in `Connect`/`Observe` modes.
    pub local_bind_port: u16,
    /// The host address to join. Required in `Connect`/`Observe` modes.
    pub peer_address: Option<IpAddr>,
    /// The host port to join. Required in `Connect`/`Observe` modes.
    pub peer_port: u16,
    /// Number of player sides, including the host. Host only.
    pub num_players: u8,
    /// Display name, UTF-8, at most [`MAX_USERNAME_BYTES`] bytes.
    pub username: String,
    /// Record every accepted input to a replay stream.
    pub save_replay: bool,
}

impl SessionConfig {
    /// A host configuration on `port` for `num_players` sides.
    #[must_use]
    pub fn host(port: u16, num_players: u8) -> Self {
        Self {
            mode: SessionMode::Host,
            local_bind_port: port,
            peer_address: None,
            peer_port: 0,
            num_players,
            username: String::new(),
            save_replay: false,
        }
    }

    /// A client configuration joining `host`.
    #[must_use]
    pub fn connect(host: SocketAddr) -> Self {
        Self {
            mode: SessionMode::Connect,
            local_bind_port: 0,
            peer_address: Some(host.ip()),
            peer_port: host.port(),
            num_players: 0,
            username: String::new(),
            save_replay: false,
        }
    }

    /// An observer configuration watching `host`.
    #[must_use]
    pub fn observe(host: SocketAddr) -> Self {
        let mut config = Self::connect(host);
        config.mode = SessionMode::Observe;
        config
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = username.into();
        self
    }

    /// Returns the host's socket address for `Connect`/`Observe` modes.
    #[must_use]
    pub fn peer_socket_addr(&self) -> Option<SocketAddr> {
        self.peer_address
            .map(|ip| SocketAddr::new(ip, self.peer_port))
    }

    /// Checks every configuration constraint.
    ///
    /// # Errors
    ///
    /// Returns [`FramelockError::InvalidConfiguration`] naming the first
    /// violated constraint.
    pub fn validate(&self) -> Result<(), FramelockError> {
        let fail = |reason: &str| {
            Err(FramelockError::InvalidConfiguration {
                reason: reason.to_owned(),
            })
        };

        match self.mode {
            SessionMode::Host => {
                if self.local_bind_port == 0 {
                    return fail("host mode requires a nonzero listen port");
                }
                if !(2..=crate::MAX_SIDES as u8).contains(&self.num_players) {
                    return fail("num_players must be between 2 and 8");
                }
            },
            SessionMode::Connect | SessionMode::Observe => {
                if self.peer_address.is_none() {
                    return fail("connect mode requires a host address");
                }
                if self.peer_port == 0 {
                    return fail("connect mode requires a nonzero host port");
                }
            },
        }
        if self.username.len() > MAX_USERNAME_BYTES {
            return fail("username exceeds 64 bytes");
        }
        Ok(())
    }
}

/// Protocol timing knobs.
///
/// The defaults reproduce the behavior players know; they are exposed mostly
/// so tests can shrink the long timeouts. The 10-second input wait in
/// particular is generous for any playable connection, but a cheap guard
/// against wedging the emulator thread forever.
#[derive(Debug, Clone)]
pub struct ProtocolTuning {
    /// How long `get` blocks on a missing input before the session dies with
    /// `InputTimeout`.
    pub input_wait_timeout: Duration,
    /// How long a client waits for the host's `Accept`.
    pub join_timeout: Duration,
    /// Silence threshold after which a peer is declared lost.
    pub peer_silence_timeout: Duration,
    /// Send silence threshold after which a keep-alive `Ping` is issued.
    pub keepalive_interval: Duration,
    /// First retransmission delay for reliable messages.
    pub retransmit_initial: Duration,
    /// Retransmission backoff cap.
    pub retransmit_cap: Duration,
    /// The receive thread's internal tick; also the resend cadence for
    /// `EndSession`.
    pub tick_interval: Duration,
    /// How many trailing frames an `Input` datagram carries per side.
    pub input_batch_window: u8,
}

impl Default for ProtocolTuning {
    fn default() -> Self {
        Self {
            input_wait_timeout: Duration::from_secs(10),
            join_timeout: Duration::from_secs(10),
            peer_silence_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_millis(500),
            retransmit_initial: Duration::from_millis(50),
            retransmit_cap: Duration::from_secs(1),
            tick_interval: Duration::from_millis(17),
            input_batch_window: 8,
        }
    }
}

impl ProtocolTuning {
    /// How long an `EndSession` broadcast is kept alive before the session
    /// gives up on stragglers: `max(tick × 4 × delay, 500 ms)`.
    #[must_use]
    pub fn end_session_drain(&self, input_delay: u8) -> Duration {
        let ticks = self.tick_interval * 4 * u32::from(input_delay);
        ticks.max(Duration::from_millis(500))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn host_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4000)
    }

    #[test]
    fn valid_host_config() {
        assert!(SessionConfig::host(4000, 2).validate().is_ok());
        assert!(SessionConfig::host(4000, 8).validate().is_ok());
    }

    #[test]
    fn host_rejects_bad_player_counts() {
        assert!(SessionConfig::host(4000, 1).validate().is_err());
        assert!(SessionConfig::host(4000, 9).validate().is_err());
        assert!(SessionConfig::host(4000, 0).validate().is_err());
    }

    #[test]
    fn host_rejects_port_zero() {
        assert!(SessionConfig::host(0, 2).validate().is_err());
    }

    #[test]
    fn connect_allows_ephemeral_local_port() {
        let config = SessionConfig::connect(host_addr());
        assert_eq!(config.local_bind_port, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn connect_requires_peer() {
        let mut config = SessionConfig::connect(host_addr());
        config.peer_address = None;
        assert!(config.validate().is_err());

        let mut config = SessionConfig::connect(host_addr());
        config.peer_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn username_length_capped() {
        let config = SessionConfig::host(4000, 2).with_username("x".repeat(65));
        assert!(config.validate().is_err());
        let config = SessionConfig::host(4000, 2).with_username("x".repeat(64));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn observe_mode_validates_like_connect() {
        assert!(SessionConfig::observe(host_addr()).validate().is_ok());
    }

    #[test]
    fn end_session_drain_has_floor() {
        let tuning = ProtocolTuning::default();
        // 17ms * 4 * 1 = 68ms, below the 500ms floor.
        assert_eq!(tuning.end_session_drain(1), Duration::from_millis(500));
        // 17ms * 4 * 10 = 680ms, above it.
        assert_eq!(tuning.end_session_drain(10), Duration::from_millis(680));
    }
}
