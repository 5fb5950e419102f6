//! Shared fixtures for the session integration tests.
//!
//! All tests run real UDP sockets on loopback. Hosts bind an ephemeral port
//! up front (via a pre-bound socket handed to the builder) so no fixed port
//! numbers are ever contended.

// Each integration test binary uses a different subset of these fixtures.
#![allow(dead_code)]

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use framelock::{
    ChaosConfig, ChaosSocket, DatagramSocket, EmulatorHost, FramelockError, LockstepSession,
    ProtocolTuning, SessionBuilder, SessionCallbacks, SessionConfig, Side, SyncState, UdpEndpoint,
    NUM_SYNC_INPUTS,
};

/// An emulator whose snapshot is whatever the test wants it to be.
pub struct StubEmulator {
    state: SyncState,
}

impl StubEmulator {
    pub fn new(state: SyncState) -> Self {
        Self { state }
    }
}

impl EmulatorHost for StubEmulator {
    fn capture_sync_state(&self) -> SyncState {
        self.state.clone()
    }

    fn reset_to_safe_defaults(&self) {}

    fn restore_settings(&self) {}
}

pub fn reference_state() -> SyncState {
    SyncState::new("Europe v02.00(14/06/2004)", "SLES-52563")
}

/// Timing knobs shrunk so failure paths resolve in test time.
pub fn fast_tuning() -> ProtocolTuning {
    ProtocolTuning {
        input_wait_timeout: Duration::from_secs(5),
        join_timeout: Duration::from_secs(2),
        peer_silence_timeout: Duration::from_millis(1500),
        tick_interval: Duration::from_millis(5),
        ..ProtocolTuning::default()
    }
}

/// Captures `on_status` lines for assertions.
#[derive(Clone, Default)]
pub struct StatusLog(Arc<Mutex<Vec<String>>>);

impl StatusLog {
    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.0.lock().iter().any(|line| line.contains(needle))
    }
}

pub fn logging_callbacks() -> (SessionCallbacks, StatusLog) {
    let log = StatusLog::default();
    let sink = log.clone();
    let callbacks = SessionCallbacks {
        on_status: Box::new(move |line| sink.0.lock().push(line.to_owned())),
        ..SessionCallbacks::default()
    };
    (callbacks, log)
}

/// A `Write` sink tests can read back out of (replay capture).
#[derive(Clone, Default)]
pub struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

pub struct HostHandle {
    pub session: Arc<LockstepSession>,
    pub addr: SocketAddr,
    pub chaos: Option<Arc<ChaosSocket<UdpEndpoint>>>,
    pub status: StatusLog,
}

/// Stands a host up on an ephemeral port.
pub fn start_host(num_players: u8, state: SyncState, chaos: Option<ChaosConfig>) -> HostHandle {
    let endpoint = UdpEndpoint::bind(0).expect("bind ephemeral host port");
    let port = endpoint.local_addr().expect("host local addr").port();
    let (callbacks, status) = logging_callbacks();

    let mut chaos_handle = None;
    let socket: Arc<dyn DatagramSocket> = match chaos {
        Some(config) => {
            let wrapped = Arc::new(ChaosSocket::new(endpoint, config));
            chaos_handle = Some(Arc::clone(&wrapped));
            wrapped
        },
        None => Arc::new(endpoint),
    };

    let session = SessionBuilder::new(
        SessionConfig::host(port, num_players).with_username("host"),
    )
    .with_emulator(Arc::new(StubEmulator::new(state)))
    .with_callbacks(callbacks)
    .with_tuning(fast_tuning())
    .with_socket(socket)
    .start()
    .expect("host session starts");

    HostHandle {
        session: Arc::new(session),
        addr: loopback(port),
        chaos: chaos_handle,
        status,
    }
}

pub struct ClientHandle {
    pub session: Arc<LockstepSession>,
    pub chaos: Option<Arc<ChaosSocket<UdpEndpoint>>>,
    pub status: StatusLog,
}

pub fn start_client(
    host: SocketAddr,
    username: &str,
    state: SyncState,
    chaos: Option<ChaosConfig>,
) -> ClientHandle {
    start_peer(SessionConfig::connect(host).with_username(username), state, chaos)
}

pub fn start_observer(host: SocketAddr, state: SyncState) -> ClientHandle {
    start_peer(
        SessionConfig::observe(host).with_username("watcher"),
        state,
        None,
    )
}

fn start_peer(
    config: SessionConfig,
    state: SyncState,
    chaos: Option<ChaosConfig>,
) -> ClientHandle {
    let (callbacks, status) = logging_callbacks();
    let mut builder = SessionBuilder::new(config)
        .with_emulator(Arc::new(StubEmulator::new(state)))
        .with_callbacks(callbacks)
        .with_tuning(fast_tuning());

    let mut chaos_handle = None;
    if let Some(chaos_config) = chaos {
        let endpoint = UdpEndpoint::bind(0).expect("bind ephemeral client port");
        let wrapped = Arc::new(ChaosSocket::new(endpoint, chaos_config));
        chaos_handle = Some(Arc::clone(&wrapped));
        builder = builder.with_socket(wrapped);
    }

    ClientHandle {
        session: Arc::new(builder.start().expect("client session starts")),
        chaos: chaos_handle,
        status,
    }
}

/// What a frame-loop driver observed.
pub struct DriveResult {
    /// `trace[frame][side]` = the input bytes consumed for that side.
    pub trace: Vec<Vec<[u8; NUM_SYNC_INPUTS]>>,
    /// The error that stopped the loop early, if any.
    pub error: Option<FramelockError>,
}

/// Runs the emulator-side frame loop against a session: publish the local
/// sample, read every side's input for the current frame, advance. Stops
/// after `max_frames` frames or on the first error.
pub fn drive_frames(
    session: Arc<LockstepSession>,
    local_input: impl Fn(u32) -> [u8; NUM_SYNC_INPUTS] + Send + 'static,
    max_frames: u32,
) -> JoinHandle<DriveResult> {
    std::thread::spawn(move || {
        let mut result = DriveResult {
            trace: Vec::new(),
            error: None,
        };
        if !session.wait_running(Duration::from_secs(20)) {
            result.error = Some(FramelockError::SessionEnded);
            return result;
        }
        let num_players = session.num_players();
        let is_player = session.local_side().is_some();

        for iteration in 0..max_frames {
            if is_player {
                if let Err(err) = session.publish_local(local_input(iteration)) {
                    result.error = Some(err);
                    break;
                }
            }
            let frame = session.sim_frame();
            let mut row = Vec::with_capacity(usize::from(num_players));
            let mut failed = None;
            for side in 0..num_players {
                match session.poll_input(Side::new(side), frame) {
                    Ok(input) => row.push(input.bytes),
                    Err(err) => {
                        failed = Some(err);
                        break;
                    },
                }
            }
            match failed {
                Some(err) => {
                    result.error = Some(err);
                    break;
                },
                None => result.trace.push(row),
            }
            session.advance_frame();
        }
        result
    })
}

/// A constant-byte input pattern: `byte` in position 0, zeros elsewhere.
pub fn constant_input(byte: u8) -> impl Fn(u32) -> [u8; NUM_SYNC_INPUTS] + Send + 'static {
    move |_| {
        let mut bytes = [0u8; NUM_SYNC_INPUTS];
        bytes[0] = byte;
        bytes
    }
}

/// An input pattern that varies per frame, for determinism checks.
pub fn varying_input(salt: u8) -> impl Fn(u32) -> [u8; NUM_SYNC_INPUTS] + Send + 'static {
    move |iteration| {
        let mut bytes = [0u8; NUM_SYNC_INPUTS];
        bytes[0] = salt;
        bytes[1] = (iteration % 251) as u8;
        bytes[2] = (iteration / 251) as u8;
        bytes
    }
}
