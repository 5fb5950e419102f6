//! A socket wrapper that injects latency and loss for testing.
//!
//! [`ChaosSocket`] wraps any [`DatagramSocket`] and simulates an unreliable
//! link: each outgoing datagram is dropped with a configured probability
//! (Bernoulli) and otherwise delayed by a uniform random duration in
//! `[min_latency, max_latency]`. Given the same seed, the same traffic sees
//! the same fate, so lossy-network tests are reproducible.
//!
//! # Example
//!
//! ```no_run
//! use framelock::{ChaosConfig, ChaosSocket, UdpEndpoint};
//! use std::time::Duration;
//!
//! let inner = UdpEndpoint::bind(0).unwrap();
//! let config = ChaosConfig::builder()
//!     .latency(Duration::from_millis(40), Duration::from_millis(80))
//!     .loss_rate(0.25)
//!     .seed(42)
//!     .build();
//! let socket = ChaosSocket::new(inner, config);
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::network::socket::DatagramSocket;
use crate::rng::Pcg32;

/// Configuration for the injected network conditions.
#[derive(Debug, Clone)]
#[must_use = "ChaosConfig has no effect unless passed to ChaosSocket::new()"]
pub struct ChaosConfig {
    /// Minimum added one-way latency.
    pub min_latency: Duration,
    /// Maximum added one-way latency.
    pub max_latency: Duration,
    /// Probability in `[0, 1]` that an outgoing datagram is silently dropped.
    pub loss_rate: f64,
    /// RNG seed. The same seed replays the same drop/delay decisions.
    pub seed: u64,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        Self {
            min_latency: Duration::ZERO,
            max_latency: Duration::ZERO,
            loss_rate: 0.0,
            seed: 0,
        }
    }
}

impl ChaosConfig {
    /// Starts building a configuration.
    pub fn builder() -> ChaosConfigBuilder {
        ChaosConfigBuilder::default()
    }
}

/// Builder for [`ChaosConfig`].
#[derive(Debug, Clone, Default)]
#[must_use = "ChaosConfigBuilder must be consumed by calling .build()"]
pub struct ChaosConfigBuilder {
    config: ChaosConfig,
}

impl ChaosConfigBuilder {
    /// Sets the added latency range. `min` may equal `max` for a constant
    /// delay.
    pub fn latency(mut self, min: Duration, max: Duration) -> Self {
        self.config.min_latency = min;
        self.config.max_latency = max.max(min);
        self
    }

    /// Sets the drop probability, clamped to `[0, 1]`.
    pub fn loss_rate(mut self, rate: f64) -> Self {
        self.config.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Sets the RNG seed.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> ChaosConfig {
        self.config
    }
}

/// Counters describing what the chaos layer did to the traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaosStats {
    /// Datagrams handed to the inner socket (possibly after a delay).
    pub sent: u64,
    /// Datagrams silently discarded.
    pub dropped: u64,
    /// Datagrams that were held back before delivery.
    pub delayed: u64,
}

struct InFlight {
    deliver_at: Instant,
    addr: SocketAddr,
    payload: Vec<u8>,
}

struct ChaosState {
    rng: Pcg32,
    in_flight: VecDeque<InFlight>,
    stats: ChaosStats,
}

/// A [`DatagramSocket`] wrapper injecting deterministic latency and loss on
/// the send path.
///
/// Delayed datagrams are flushed whenever any thread touches the socket; the
/// receive thread's poll cadence bounds how late a delayed packet can be.
pub struct ChaosSocket<S> {
    inner: S,
    config: Mutex<ChaosConfig>,
    state: Mutex<ChaosState>,
}

impl<S: DatagramSocket> ChaosSocket<S> {
    /// Wraps `inner` with the given chaos configuration.
    pub fn new(inner: S, config: ChaosConfig) -> Self {
        let rng = Pcg32::seed_from_u64(config.seed);
        Self {
            inner,
            config: Mutex::new(config),
            state: Mutex::new(ChaosState {
                rng,
                in_flight: VecDeque::new(),
                stats: ChaosStats::default(),
            }),
        }
    }

    /// Returns a snapshot of the traffic counters.
    pub fn stats(&self) -> ChaosStats {
        self.state.lock().stats
    }

    /// Changes the drop probability mid-run. Tests use this to make a live
    /// peer fall silent without tearing its socket down.
    pub fn set_loss_rate(&self, rate: f64) {
        self.config.lock().loss_rate = rate.clamp(0.0, 1.0);
    }

    fn flush_due(&self) {
        let now = Instant::now();
        loop {
            let due = {
                let mut state = self.state.lock();
                match state.in_flight.front() {
                    Some(pkt) if pkt.deliver_at <= now => state.in_flight.pop_front(),
                    _ => None,
                }
            };
            match due {
                Some(pkt) => self.inner.send_to(&pkt.payload, pkt.addr),
                None => break,
            }
        }
    }
}

impl<S: DatagramSocket> DatagramSocket for ChaosSocket<S> {
    fn send_to(&self, payload: &[u8], addr: SocketAddr) {
        self.flush_due();

        let config = self.config.lock().clone();
        let delay = {
            let mut state = self.state.lock();
            if state.rng.gen_bool(config.loss_rate) {
                state.stats.dropped += 1;
                return;
            }
            let min = config.min_latency.as_millis() as u64;
            let max = config.max_latency.as_millis() as u64;
            let delay = if max == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(state.rng.gen_range_inclusive(min, max))
            };
            state.stats.sent += 1;
            if !delay.is_zero() {
                state.stats.delayed += 1;
                state.in_flight.push_back(InFlight {
                    deliver_at: Instant::now() + delay,
                    addr,
                    payload: payload.to_vec(),
                });
            }
            delay
        };

        if delay.is_zero() {
            self.inner.send_to(payload, addr);
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<(SocketAddr, Vec<u8>)> {
        self.flush_due();
        // Poll in short slices so packets queued mid-wait still get flushed
        // close to their due time.
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let slice = (deadline - now).min(Duration::from_millis(5));
            if let Some(received) = self.inner.recv_timeout(slice) {
                return Some(received);
            }
            self.flush_due();
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// Records sends instead of performing them.
    struct RecordingSocket {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    }

    impl RecordingSocket {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
            }
        }
    }

    impl DatagramSocket for RecordingSocket {
        fn send_to(&self, payload: &[u8], addr: SocketAddr) {
            self.sent.lock().push((addr, payload.to_vec()));
        }

        fn recv_timeout(&self, _timeout: Duration) -> Option<(SocketAddr, Vec<u8>)> {
            None
        }

        fn local_addr(&self) -> Option<SocketAddr> {
            None
        }
    }

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000)
    }

    #[test]
    fn passthrough_when_unconfigured() {
        let chaos = ChaosSocket::new(RecordingSocket::new(), ChaosConfig::default());
        for i in 0..10u8 {
            chaos.send_to(&[i], addr());
        }
        assert_eq!(chaos.inner.sent.lock().len(), 10);
        let stats = chaos.stats();
        assert_eq!(stats.sent, 10);
        assert_eq!(stats.dropped, 0);
    }

    #[test]
    fn full_loss_drops_everything() {
        let config = ChaosConfig::builder().loss_rate(1.0).seed(1).build();
        let chaos = ChaosSocket::new(RecordingSocket::new(), config);
        for i in 0..10u8 {
            chaos.send_to(&[i], addr());
        }
        assert!(chaos.inner.sent.lock().is_empty());
        assert_eq!(chaos.stats().dropped, 10);
    }

    #[test]
    fn loss_is_deterministic_for_a_seed() {
        let run = |seed: u64| {
            let config = ChaosConfig::builder().loss_rate(0.5).seed(seed).build();
            let chaos = ChaosSocket::new(RecordingSocket::new(), config);
            for i in 0..64u8 {
                chaos.send_to(&[i], addr());
            }
            let sent = chaos.inner.sent.lock();
            sent.iter().map(|(_, p)| p[0]).collect::<Vec<_>>()
        };
        assert_eq!(run(77), run(77));
        assert_ne!(run(77), run(78));
    }

    #[test]
    fn latency_holds_packets_until_due() {
        let config = ChaosConfig::builder()
            .latency(Duration::from_millis(30), Duration::from_millis(30))
            .seed(3)
            .build();
        let chaos = ChaosSocket::new(RecordingSocket::new(), config);
        chaos.send_to(&[1], addr());
        assert!(chaos.inner.sent.lock().is_empty(), "delivered early");

        std::thread::sleep(Duration::from_millis(40));
        chaos.flush_due();
        assert_eq!(chaos.inner.sent.lock().len(), 1);
        assert_eq!(chaos.stats().delayed, 1);
    }
}
