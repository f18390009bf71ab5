use std::{
    cmp,
    time::Duration,
};

use rand::RngCore;

/// Jittered exponential backoff. Callers hold one per retry loop, `fail()` on
/// each error to get the next delay, and `reset()` once an attempt succeeds.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self, rng: &mut dyn RngCore) -> Duration {
        // Full jitter, per the usual AWS architecture blog recipe.
        let jitter = rng.next_u32() as f32 / u32::MAX as f32;
        self.fail_unjittered().mul_f32(jitter)
    }

    /// The next delay without jitter. Used where the retry cadence is part of
    /// an observable contract rather than load shedding.
    pub fn fail_unjittered(&mut self) -> Duration {
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}
