//! Checksum-corruption injector for exercising the reject/resend path.
//!
//! Real networks corrupt packets rarely, so the sender simulates it: before
//! each data frame leaves, [`ErrorInjector::should_corrupt`] draws once and,
//! on a hit, the frame's checksum is bumped by one (see
//! [`crate::packet::Frame::with_injected_error`]).  The receiver then sees a
//! mismatch and answers with a reject.
//!
//! The injector owns its RNG.  Seed it with [`ErrorInjector::seeded`] to make
//! a lossy run reproducible.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Fraction-of-frames corruption model.
#[derive(Debug, Clone)]
pub struct ErrorInjector {
    /// Probability in `[0.0, 1.0]` that a frame is corrupted.
    error_rate: f64,
    rng: StdRng,
}

impl ErrorInjector {
    /// An injector seeded from OS entropy.
    pub fn new(error_rate: f64) -> Self {
        Self {
            error_rate: clamp_rate(error_rate),
            rng: StdRng::from_os_rng(),
        }
    }

    /// A deterministic injector.
    pub fn seeded(error_rate: f64, seed: u64) -> Self {
        Self {
            error_rate: clamp_rate(error_rate),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    /// Change the rate for the next transfer, keeping the RNG stream.
    pub fn set_error_rate(&mut self, error_rate: f64) {
        self.error_rate = clamp_rate(error_rate);
    }

    /// One uniform draw: `true` means "corrupt this frame".
    pub fn should_corrupt(&mut self) -> bool {
        self.error_rate > 0.0 && self.rng.random_bool(self.error_rate)
    }
}

fn clamp_rate(rate: f64) -> f64 {
    if rate.is_nan() {
        0.0
    } else {
        rate.clamp(0.0, 1.0)
    }
}
