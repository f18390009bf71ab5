//! Lifecycle primitive shared by every long-lived service: cooperative
//! cancellation, exponential retry backoff, and timers that die with the
//! service.

use std::{
    borrow::Cow,
    collections::BTreeMap,
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::Level;

use crate::runtime::{
    Runtime,
    SpawnHandle,
};

pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// A service was asked to shut down. Stopping a `RunningState` with this
/// cause (anywhere in the chain) logs at info rather than error.
#[derive(thiserror::Error, Debug)]
#[error("aborted: {reason}")]
pub struct AbortError {
    pub reason: Cow<'static, str>,
}

impl AbortError {
    pub fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Marks an error that retrying cannot fix; `backoff` stops the service
/// instead of sleeping when it sees one.
#[derive(thiserror::Error, Debug)]
#[error("unrecoverable: {message}")]
pub struct UnrecoverableError {
    pub message: String,
}

impl UnrecoverableError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

fn is_abort(e: &anyhow::Error) -> bool {
    e.chain().any(|c| c.downcast_ref::<AbortError>().is_some())
}

fn is_unrecoverable(e: &anyhow::Error) -> bool {
    e.chain()
        .any(|c| c.downcast_ref::<UnrecoverableError>().is_some())
}

struct Inner {
    running: bool,
    next_id: u64,
    cancelables: BTreeMap<u64, Box<dyn FnOnce() + Send>>,
    timers: BTreeMap<u64, Box<dyn SpawnHandle>>,
    retry_delay: Duration,
}

pub struct RunningState<RT: Runtime> {
    rt: RT,
    name: &'static str,
    initial_retry_delay: Duration,
    max_retry_delay: Duration,
    inner: Arc<Mutex<Inner>>,
    stopped_tx: Arc<watch::Sender<bool>>,
}

impl<RT: Runtime> Clone for RunningState<RT> {
    fn clone(&self) -> Self {
        Self {
            rt: self.rt.clone(),
            name: self.name,
            initial_retry_delay: self.initial_retry_delay,
            max_retry_delay: self.max_retry_delay,
            inner: self.inner.clone(),
            stopped_tx: self.stopped_tx.clone(),
        }
    }
}

impl<RT: Runtime> RunningState<RT> {
    pub fn new(rt: RT, name: &'static str) -> Self {
        Self::with_retry_delays(rt, name, INITIAL_RETRY_DELAY, MAX_RETRY_DELAY)
    }

    pub fn with_retry_delays(
        rt: RT,
        name: &'static str,
        initial_retry_delay: Duration,
        max_retry_delay: Duration,
    ) -> Self {
        let (stopped_tx, _) = watch::channel(false);
        Self {
            rt,
            name,
            initial_retry_delay,
            max_retry_delay,
            inner: Arc::new(Mutex::new(Inner {
                running: true,
                next_id: 0,
                cancelables: BTreeMap::new(),
                timers: BTreeMap::new(),
                retry_delay: initial_retry_delay,
            })),
            stopped_tx: Arc::new(stopped_tx),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `true` until `stop` is called.
    pub fn should_run(&self) -> bool {
        self.inner.lock().running
    }

    /// Stop the service: run registered cancelables, clear pending timers,
    /// and resolve `stopped()`. Idempotent.
    pub fn stop(&self, cause: Option<&anyhow::Error>) {
        let (cancelables, timers) = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return;
            }
            inner.running = false;
            (
                std::mem::take(&mut inner.cancelables),
                std::mem::take(&mut inner.timers),
            )
        };
        let level = match cause {
            Some(e) if !is_abort(e) => Level::ERROR,
            _ => Level::INFO,
        };
        if level == Level::ERROR {
            tracing::error!("Stopping {}: {cause:?}", self.name);
        } else {
            tracing::info!("Stopping {}: {cause:?}", self.name);
        }
        for (_, cancel) in cancelables {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(cancel)) {
                tracing::error!("Cancel handler for {} panicked: {panic:?}", self.name);
            }
        }
        for (_, mut timer) in timers {
            timer.shutdown();
        }
        let _ = self.stopped_tx.send(true);
    }

    /// Resolves once `stop` has run.
    pub async fn stopped(&self) {
        let mut rx = self.stopped_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Register a handler to run on `stop`. If the service has already
    /// stopped, the handler runs immediately. The returned guard unregisters
    /// (idempotently) without running the handler.
    pub fn cancel_on_stop(&self, cancel: Box<dyn FnOnce() + Send>) -> Unregister {
        let id = {
            let mut inner = self.inner.lock();
            if !inner.running {
                drop(inner);
                if let Err(panic) = catch_unwind(AssertUnwindSafe(cancel)) {
                    tracing::error!("Cancel handler for {} panicked: {panic:?}", self.name);
                }
                return Unregister {
                    inner: Arc::downgrade(&self.inner),
                    id: u64::MAX,
                };
            }
            let id = inner.next_id;
            inner.next_id += 1;
            inner.cancelables.insert(id, cancel);
            id
        };
        Unregister {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Run `f` after `delay` unless the service stops first. The timer is
    /// removed from the pending set when it fires.
    pub fn set_timeout(
        &self,
        name: &'static str,
        delay: Duration,
        f: impl FnOnce() + Send + 'static,
    ) {
        let mut inner = self.inner.lock();
        if !inner.running {
            return;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let rt = self.rt.clone();
        let weak = Arc::downgrade(&self.inner);
        let handle = self.rt.spawn(name, async move {
            rt.wait(delay).await;
            let Some(strong) = weak.upgrade() else {
                return;
            };
            {
                let mut inner = strong.lock();
                if !inner.running {
                    return;
                }
                inner.timers.remove(&id);
            }
            f();
        });
        inner.timers.insert(id, handle);
    }

    /// Sleep for the current retry delay (or until stop), then double it up
    /// to the max. Returns `false` if the service stopped, or if `cause` is
    /// an abort or unrecoverable error, in which case the service is stopped
    /// instead of sleeping.
    pub async fn backoff(&self, cause: Option<&anyhow::Error>) -> bool {
        if let Some(e) = cause {
            if is_abort(e) || is_unrecoverable(e) {
                self.stop(cause);
                return false;
            }
        }
        if !self.should_run() {
            return false;
        }
        let delay = self.inner.lock().retry_delay;
        tracing::info!("Retrying {} in {delay:?}: {cause:?}", self.name);
        tokio::select! {
            _ = self.rt.wait(delay) => {},
            _ = self.stopped() => return false,
        }
        {
            let mut inner = self.inner.lock();
            inner.retry_delay = std::cmp::min(inner.retry_delay * 2, self.max_retry_delay);
        }
        self.should_run()
    }

    /// Restore the retry delay to its initial value after a healthy run.
    pub fn reset_backoff(&self) {
        self.inner.lock().retry_delay = self.initial_retry_delay;
    }
}

/// Guard returned by `cancel_on_stop`. Dropping it does nothing; explicit
/// `unregister()` removes the handler and is idempotent.
pub struct Unregister {
    inner: std::sync::Weak<Mutex<Inner>>,
    id: u64,
}

impl Unregister {
    pub fn unregister(&self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.lock().cancelables.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{
                AtomicU32,
                Ordering,
            },
            Arc,
        },
        time::Duration,
    };

    use crate::{
        running_state::{
            AbortError,
            RunningState,
        },
        runtime::testing::TestRuntime,
    };

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_runs_cancelables() {
        let rt = TestRuntime::new();
        let state = RunningState::new(rt, "test-service");
        let fired = Arc::new(AtomicU32::new(0));

        let fired_ = fired.clone();
        let _guard = state.cancel_on_stop(Box::new(move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        }));
        let fired_ = fired.clone();
        let unregistered = state.cancel_on_stop(Box::new(move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        }));
        unregistered.unregister();
        unregistered.unregister();

        assert!(state.should_run());
        state.stop(None);
        state.stop(None);
        assert!(!state.should_run());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        state.stopped().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timers_cleared_on_stop() {
        let rt = TestRuntime::new();
        let state = RunningState::new(rt.clone(), "test-service");
        let fired = Arc::new(AtomicU32::new(0));

        let fired_ = fired.clone();
        state.set_timeout("later", Duration::from_secs(5), move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        });
        let fired_ = fired.clone();
        state.set_timeout("soon", Duration::from_millis(10), move || {
            fired_.fetch_add(1, Ordering::SeqCst);
        });

        rt.advance_time(Duration::from_millis(20)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        state.stop(None);
        rt.advance_time(Duration::from_secs(10)).await;
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_resets() {
        let rt = TestRuntime::new();
        let state = RunningState::with_retry_delays(
            rt.clone(),
            "test-service",
            Duration::from_millis(100),
            Duration::from_millis(400),
        );

        let start = tokio::time::Instant::now();
        assert!(state.backoff(None).await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));

        let start = tokio::time::Instant::now();
        assert!(state.backoff(None).await);
        assert_eq!(start.elapsed(), Duration::from_millis(200));

        state.reset_backoff();
        let start = tokio::time::Instant::now();
        assert!(state.backoff(None).await);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_stops_on_abort() {
        let rt = TestRuntime::new();
        let state = RunningState::new(rt, "test-service");
        let cause = anyhow::Error::new(AbortError::new("shutdown requested"));
        assert!(!state.backoff(Some(&cause)).await);
        assert!(!state.should_run());
    }
}
