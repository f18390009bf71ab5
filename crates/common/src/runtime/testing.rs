//! Test implementation of the [`Runtime`] trait.
//!
//! Timers go through tokio's virtual clock, so tests run under
//! `#[tokio::test(start_paused = true)]` execute backoffs and heartbeats
//! instantly and deterministically. Randomness is seeded per-runtime.

use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;
use tokio::time::Instant;

use super::{
    prod::TokioSpawnHandle,
    Runtime,
    SpawnHandle,
};

const DEFAULT_SEED: u64 = 0;

#[derive(Clone)]
pub struct TestRuntime {
    rng: Arc<Mutex<ChaCha12Rng>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        crate::env::config_test();
        Self {
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
        }
    }

    /// Advance the paused tokio clock, firing any timers that come due.
    pub async fn advance_time(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

#[async_trait]
impl Runtime for TestRuntime {
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TokioSpawnHandle::new(name, tokio::spawn(f)))
    }

    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn monotonic_now(&self) -> Instant {
        Instant::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R {
        f(&mut *self.rng.lock())
    }
}
