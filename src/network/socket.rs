//! The UDP datagram endpoint.
//!
//! The endpoint is stateless: it moves length-delimited payloads between the
//! local port and known peer addresses. Framing, sequencing, and reliability
//! all live a layer up in [`peer`](crate::network::peer).

use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::report_fault;
use crate::telemetry::{FaultKind, FaultSeverity};
use crate::FramelockError;

const RECV_BUFFER_SIZE: usize = 4096;

/// A packet larger than this may be fragmented by the network, and losing any
/// fragment loses the whole datagram, so sends above it are reported.
/// Source: <https://stackoverflow.com/a/35697810/775982>
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A datagram transport the session layer can run over.
///
/// Implementations must be usable from multiple threads: the receive thread
/// owns `recv_timeout` while any thread may call `send_to`. The two provided
/// implementations are [`UdpEndpoint`] (a real socket) and
/// [`ChaosSocket`](crate::ChaosSocket) (fault injection for tests).
pub trait DatagramSocket: Send + Sync {
    /// Sends one payload to `addr`. Best-effort: transport errors are
    /// reported to telemetry and otherwise swallowed, because a lost datagram
    /// is indistinguishable from a dropped one and the reliability layer
    /// retries either way.
    fn send_to(&self, payload: &[u8], addr: SocketAddr);

    /// Waits up to `timeout` for one datagram. Returns `None` on timeout.
    fn recv_timeout(&self, timeout: Duration) -> Option<(SocketAddr, Vec<u8>)>;

    /// The local address the socket is bound to, if known.
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// A blocking UDP socket bound to `0.0.0.0:port` with per-call read
/// timeouts.
#[derive(Debug)]
pub struct UdpEndpoint {
    socket: UdpSocket,
}

impl UdpEndpoint {
    /// Binds to `0.0.0.0:port`. Port 0 asks the OS for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`FramelockError::BindFailed`] if the port is occupied or the
    /// socket cannot be created.
    pub fn bind(port: u16) -> Result<Self, FramelockError> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let socket = UdpSocket::bind(addr).map_err(|_| FramelockError::BindFailed { port })?;
        Ok(Self { socket })
    }
}

impl DatagramSocket for UdpEndpoint {
    fn send_to(&self, payload: &[u8], addr: SocketAddr) {
        if payload.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_fault!(
                FaultSeverity::Warning,
                FaultKind::Transport,
                "sending UDP packet of {} bytes, larger than the {} byte fragmentation threshold",
                payload.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        if let Err(err) = self.socket.send_to(payload, addr) {
            report_fault!(
                FaultSeverity::Warning,
                FaultKind::Transport,
                "failed to send UDP packet to {addr}: {err}"
            );
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<(SocketAddr, Vec<u8>)> {
        // A zero Duration would put the socket into blocking mode; clamp up.
        let timeout = timeout.max(Duration::from_millis(1));
        if self.socket.set_read_timeout(Some(timeout)).is_err() {
            return None;
        }
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        loop {
            match self.socket.recv_from(&mut buffer) {
                Ok((len, src)) => return Some((src, buffer[..len].to_vec())),
                Err(ref err)
                    if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
                {
                    return None;
                },
                // Datagram sockets surface this after a send to a dead peer;
                // it says nothing about our ability to keep receiving.
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => {
                    report_fault!(
                        FaultSeverity::Error,
                        FaultKind::Transport,
                        "unexpected socket error: {:?}: {err}",
                        err.kind()
                    );
                    return None;
                },
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr().ok()
    }
}
