//! A minimal PCG32 pseudo-random generator.
//!
//! The only consumer of randomness in this crate is the fault-injection
//! socket, which must be *deterministic given a seed* so that lossy-network
//! tests are reproducible. Pulling in the full `rand` crate for that one use
//! is not worth the dependency; PCG32 (O'Neill, "PCG: A Family of Simple
//! Fast Space-Efficient Statistically Good Algorithms for Random Number
//! Generation") is 64 bits of state and a handful of operations.

/// PCG32 generator state.
#[derive(Debug, Clone)]
pub struct Pcg32 {
    state: u64,
    inc: u64,
}

const PCG_MULTIPLIER: u64 = 6364136223846793005;
const PCG_DEFAULT_STREAM: u64 = 1442695040888963407;

impl Pcg32 {
    /// Creates a generator from a 64-bit seed on the default stream.
    #[must_use]
    pub fn seed_from_u64(seed: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: PCG_DEFAULT_STREAM | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(seed);
        rng.next_u32();
        rng
    }

    /// Returns the next 32 random bits.
    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(PCG_MULTIPLIER).wrapping_add(self.inc);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Returns a uniformly distributed value in `[low, high]`.
    ///
    /// Uses a simple modulo reduction; the bias is negligible for the small
    /// ranges (milliseconds of latency) this crate draws.
    pub fn gen_range_inclusive(&mut self, low: u64, high: u64) -> u64 {
        debug_assert!(low <= high);
        let span = high - low + 1;
        low + u64::from(self.next_u32()) % span
    }

    /// Returns `true` with probability `p` (clamped to `[0, 1]`).
    pub fn gen_bool(&mut self, p: f64) -> bool {
        let p = p.clamp(0.0, 1.0);
        f64::from(self.next_u32()) < p * f64::from(u32::MAX)
    }
}
