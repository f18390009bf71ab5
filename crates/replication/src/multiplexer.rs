//! Serializes transactions from multiple cooperative producers (the upstream
//! reader and the backfill streamer) into a single downstream subscription.
//!
//! At any moment the stream is either quiescent at a watermark or reserved
//! by exactly one producer. `reserve` hands exclusive push rights to the
//! caller; `release` passes them to the oldest waiter (FIFO) or returns the
//! stream to quiescence. Everything a producer pushes between its `reserve`
//! and `release` appears contiguously downstream.
//!
//! Listeners are invoked synchronously inside `push`, before the enqueue
//! future is awaited. The backfill manager relies on this: it is both a
//! listener and a producer on the same multiplexer, and must observe a
//! message before the producer that pushed it can block on backpressure.

use std::{
    collections::VecDeque,
    sync::Arc,
    time::Duration,
};

use common::{
    knobs::CHANGE_STREAM_QUEUE_SIZE,
    runtime::Runtime,
    watermark::Watermark,
};
use parking_lot::Mutex;
use tokio::sync::{
    mpsc,
    oneshot,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    message::ChangeStreamMessage,
    metrics::{
        log_multiplexer_push,
        log_reserve_wait,
    },
};

pub type Listener = Arc<dyn Fn(&ChangeStreamMessage) + Send + Sync>;

struct Waiter {
    producer: &'static str,
    started: tokio::time::Instant,
    resolve: oneshot::Sender<Watermark>,
}

struct Inner {
    /// `Some` when quiescent, `None` while a producer holds the reservation.
    current: Option<Watermark>,
    /// Watermark at the most recent release, for the monotonicity check.
    last_released: Watermark,
    /// Strictly increasing across all committed transactions.
    last_commit: Option<Watermark>,
    waiters: VecDeque<Waiter>,
    listeners: Vec<Listener>,
    cancels: Vec<Box<dyn FnOnce() + Send>>,
    failed: bool,
}

pub struct ChangeStreamMultiplexer<RT: Runtime> {
    rt: RT,
    inner: Mutex<Inner>,
    downstream_tx: mpsc::Sender<anyhow::Result<ChangeStreamMessage>>,
    downstream_rx: Mutex<Option<mpsc::Receiver<anyhow::Result<ChangeStreamMessage>>>>,
}

impl<RT: Runtime> ChangeStreamMultiplexer<RT> {
    pub fn new(rt: RT, initial_watermark: Watermark) -> Self {
        let (downstream_tx, downstream_rx) = mpsc::channel(*CHANGE_STREAM_QUEUE_SIZE);
        Self {
            rt,
            inner: Mutex::new(Inner {
                current: Some(initial_watermark.clone()),
                last_released: initial_watermark,
                last_commit: None,
                waiters: VecDeque::new(),
                listeners: Vec::new(),
                cancels: Vec::new(),
                failed: false,
            }),
            downstream_tx,
            downstream_rx: Mutex::new(Some(downstream_rx)),
        }
    }

    /// Subscribe to every message that flows through the multiplexer,
    /// including statuses that are not forwarded downstream.
    pub fn add_listener(&self, listener: Listener) {
        self.inner.lock().listeners.push(listener);
    }

    /// Register cleanup to run when the stream fails or is canceled.
    pub fn on_cancel(&self, cancel: Box<dyn FnOnce() + Send>) {
        self.inner.lock().cancels.push(cancel);
    }

    /// Acquire exclusive push rights. Resolves immediately when the stream
    /// is quiescent; otherwise joins the FIFO waiter queue and resolves with
    /// the watermark of the release that hands rights over.
    pub async fn reserve(&self, producer: &'static str) -> anyhow::Result<Watermark> {
        let rx = {
            let mut inner = self.inner.lock();
            anyhow::ensure!(!inner.failed, "Change stream has terminated");
            if let Some(watermark) = inner.current.take() {
                return Ok(watermark);
            }
            let (tx, rx) = oneshot::channel();
            inner.waiters.push_back(Waiter {
                producer,
                started: self.rt.monotonic_now(),
                resolve: tx,
            });
            rx
        };
        let started = self.rt.monotonic_now();
        let watermark = rx
            .await
            .map_err(|_| anyhow::anyhow!("Change stream canceled while {producer} waited"))?;
        log_reserve_wait(producer, started.elapsed());
        Ok(watermark)
    }

    /// Give up push rights at `new_watermark`, handing them to the oldest
    /// waiter if any. Watermarks never move backwards; a producer that
    /// pushed nothing releases with the watermark it reserved at.
    pub fn release(&self, new_watermark: Watermark) -> anyhow::Result<()> {
        let mut inner = self.inner.lock();
        anyhow::ensure!(
            inner.current.is_none(),
            "release() without an active reservation"
        );
        anyhow::ensure!(
            new_watermark >= inner.last_released,
            "Watermark went backwards on release: {new_watermark} < {}",
            inner.last_released
        );
        inner.last_released = new_watermark.clone();
        loop {
            match inner.waiters.pop_front() {
                Some(waiter) => {
                    // A waiter that gave up (dropped its future) just passes
                    // rights along to the next one.
                    if waiter.resolve.send(new_watermark.clone()).is_ok() {
                        return Ok(());
                    }
                },
                None => {
                    inner.current = Some(new_watermark);
                    return Ok(());
                },
            }
        }
    }

    /// How long the oldest waiter has been waiting, or `None` if nobody is.
    /// Producers use this to decide whether to yield their reservation.
    pub fn waiter_delay(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .waiters
            .front()
            .map(|waiter| waiter.started.elapsed())
    }

    /// Push one message downstream. Requires an active reservation. The
    /// await completes when the message is enqueued; slow consumers pace
    /// producers here.
    pub async fn push(&self, message: ChangeStreamMessage) -> anyhow::Result<()> {
        let listeners = {
            let mut inner = self.inner.lock();
            anyhow::ensure!(!inner.failed, "Change stream has terminated");
            anyhow::ensure!(
                inner.current.is_none(),
                "push() without an active reservation"
            );
            if let ChangeStreamMessage::Commit { watermark } = &message {
                if let Some(last_commit) = &inner.last_commit {
                    anyhow::ensure!(
                        watermark > last_commit,
                        "Commit watermark {watermark} does not exceed {last_commit}"
                    );
                }
                inner.last_commit = Some(watermark.clone());
            }
            inner.listeners.clone()
        };
        for listener in &listeners {
            listener(&message);
        }
        log_multiplexer_push(&message);
        self.downstream_tx
            .send(Ok(message))
            .await
            .map_err(|_| anyhow::anyhow!("Change stream subscription dropped"))
    }

    /// Push an out-of-band status. No reservation required: listeners always
    /// see it, but it is only forwarded downstream when acked, to keep
    /// keepalive churn out of the subscription.
    pub async fn push_status(
        &self,
        status: crate::message::StatusMessage,
    ) -> anyhow::Result<()> {
        let listeners = {
            let inner = self.inner.lock();
            anyhow::ensure!(!inner.failed, "Change stream has terminated");
            inner.listeners.clone()
        };
        let ack = status.ack;
        let message = ChangeStreamMessage::Status(status);
        for listener in &listeners {
            listener(&message);
        }
        if ack {
            self.downstream_tx
                .send(Ok(message))
                .await
                .map_err(|_| anyhow::anyhow!("Change stream subscription dropped"))?;
        }
        Ok(())
    }

    /// Terminate the downstream subscription with `err` and run producer
    /// cleanup.
    pub fn fail(&self, err: anyhow::Error) {
        tracing::error!("Change stream failed: {err:#}");
        let cancels = {
            let mut inner = self.inner.lock();
            inner.failed = true;
            inner.waiters.clear();
            std::mem::take(&mut inner.cancels)
        };
        // Best effort: if the queue is full the consumer is about to see the
        // channel close anyway.
        let _ = self.downstream_tx.try_send(Err(err));
        for cancel in cancels {
            cancel();
        }
    }

    /// Run producer cleanup without an error; used when the consumer goes
    /// away.
    pub fn cancel(&self) {
        let cancels = {
            let mut inner = self.inner.lock();
            inner.failed = true;
            inner.waiters.clear();
            std::mem::take(&mut inner.cancels)
        };
        for cancel in cancels {
            cancel();
        }
    }

    /// The consumer-facing lazy sequence. Panics if taken twice: the
    /// downstream is single-consumer by design.
    pub fn as_source(&self) -> ReceiverStream<anyhow::Result<ChangeStreamMessage>> {
        let rx = self
            .downstream_rx
            .lock()
            .take()
            .expect("Downstream subscription taken twice");
        ReceiverStream::new(rx)
    }
}
