//! Shared plumbing for reporting process metrics to prometheus.
//!
//! Each crate declares its metrics in a `metrics.rs` module with the
//! `register_zero_*` macros and exposes small `log_*` / `*_timer` wrapper
//! functions, so call sites never touch prometheus types directly.

use std::{
    env,
    sync::LazyLock,
};

use prometheus::Registry;

mod labels;
mod macros;
mod reporting;
mod timer;

pub use crate::{
    labels::{
        IntoLabel,
        MetricLabel,
        STATUS_LABEL,
    },
    reporting::{
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        StatusTimer,
        Timer,
    },
};

/// The process-wide registry scraped by the metrics endpoint. All
/// `register_zero_*` declarations land here.
pub static ZERO_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Which service of the multi-process deployment this is ("dispatcher",
/// "syncer", "change-streamer"). Stamped on the common name prefix so one
/// scrape endpoint can serve all workers.
pub static SERVICE_NAME: LazyLock<String> =
    LazyLock::new(|| env::var("ZERO_SERVICE_NAME").unwrap_or_else(|_| "zero_cache".to_owned()));

#[doc(hidden)]
pub use paste::paste;
#[doc(hidden)]
pub use prometheus;

/// Prefix a declared metric ident with the product namespace.
#[macro_export]
macro_rules! metric_name {
    ($name:expr) => {
        format!("zero_{}", $name)
    };
}
