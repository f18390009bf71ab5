//! Runtime trait abstracting OS-esque features (task spawning, timers,
//! clocks, randomness) so services can run identically on the production
//! tokio runtime and on a deterministic paused-clock runtime in tests.

use std::{
    future::Future,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use async_trait::async_trait;
use futures::future::BoxFuture;
use rand::RngCore;
use thiserror::Error;
use tokio::time::Instant;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            JoinError::Canceled
        } else {
            JoinError::Panicked(anyhow::anyhow!("{e}"))
        }
    }
}

pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

#[async_trait]
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Spawn `f` onto the runtime, detached from the caller. The returned
    /// handle can shut the task down and join on it.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Sleep for `duration`. On the test runtime this advances the virtual
    /// clock rather than blocking.
    async fn wait(&self, duration: Duration);

    /// A monotonic reading of the runtime's clock.
    fn monotonic_now(&self) -> Instant;

    /// Wall-clock time since the unix epoch.
    fn unix_timestamp(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
    }

    /// Run `f` with the runtime's random number generator. The test runtime
    /// seeds this deterministically.
    fn with_rng<R>(&self, f: impl FnOnce(&mut dyn RngCore) -> R) -> R;
}
