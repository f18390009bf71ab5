//! Tunable limits and parameters for the zero-cache workers.
//!
//! Every knob can be overridden with an environment variable of the same
//! name. Each should have a comment explaining what it's for so an oncall
//! engineer can adjust it safely.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use crate::env::env_config;

/// How long the backfill manager waits before retrying a failed backfill.
/// Doubles on each consecutive failure up to `BACKFILL_MAX_RETRY_DELAY_MS`.
pub static BACKFILL_INITIAL_RETRY_DELAY: LazyLock<Duration> = LazyLock::new(|| {
    Duration::from_millis(env_config("BACKFILL_INITIAL_RETRY_DELAY_MS", 2_000))
});

/// Cap on the backfill retry delay.
pub static BACKFILL_MAX_RETRY_DELAY: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("BACKFILL_MAX_RETRY_DELAY_MS", 60_000)));

/// Queue depth of the multiplexed change-stream subscription. Producers
/// block (backpressure) once this many messages are buffered downstream.
pub static CHANGE_STREAM_QUEUE_SIZE: LazyLock<usize> =
    LazyLock::new(|| env_config("CHANGE_STREAM_QUEUE_SIZE", 1024));

/// How often heartbeat pings are sent on sync sockets.
pub static SYNC_HEARTBEAT_INTERVAL: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SYNC_HEARTBEAT_INTERVAL_MS", 5_000)));

/// How long without any client traffic before a sync socket is considered
/// dead and torn down.
pub static SYNC_CLIENT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("SYNC_CLIENT_TIMEOUT_MS", 120_000)));

/// Whether to send random padding frames after `connected` to warm the
/// connection. Off by default.
pub static ZERO_WARM_FRAMES: LazyLock<bool> = LazyLock::new(|| env_config("ZERO_WARM_FRAMES", false));

/// Size of each warm padding frame, when enabled.
pub static ZERO_WARM_FRAME_BYTES: LazyLock<usize> =
    LazyLock::new(|| env_config("ZERO_WARM_FRAME_BYTES", 1024));

/// Number of warm padding frames sent after `connected`, when enabled.
pub static ZERO_WARM_FRAME_COUNT: LazyLock<usize> =
    LazyLock::new(|| env_config("ZERO_WARM_FRAME_COUNT", 3));

/// Timeout for a single HTTP call to the user's push endpoint.
pub static PUSHER_REQUEST_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("PUSHER_REQUEST_TIMEOUT_MS", 30_000)));

/// Timeout for a single HTTP call to the user's query-transform endpoint.
pub static TRANSFORMER_REQUEST_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("TRANSFORMER_REQUEST_TIMEOUT_MS", 30_000)));

/// Number of syncer workers forked by the process manager. 0 means one per
/// available core.
pub static NUM_SYNCER_WORKERS: LazyLock<usize> =
    LazyLock::new(|| env_config("NUM_SYNCER_WORKERS", 0));

/// Grace period for draining user-facing workers on SIGINT/SIGTERM before
/// the supervisor escalates to a forceful stop.
pub static DRAIN_GRACE_PERIOD: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("DRAIN_GRACE_PERIOD_MS", 30_000)));
