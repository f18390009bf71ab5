use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    labels::MetricLabel,
    reporting::{
        log_distribution,
        log_distribution_with_labels,
    },
};

/// Observes its elapsed time into a histogram on drop.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        log_distribution(self.histogram, self.start.elapsed().as_secs_f64());
    }
}

/// Timer over a labeled histogram whose `status` label defaults to `error`
/// unless `finish()` is called on the success path. Dropping the timer early
/// therefore records the attempt as failed.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: BTreeSet<MetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut labels = BTreeSet::new();
        labels.insert(MetricLabel::STATUS_ERROR);
        Self {
            start: Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn add_label(&mut self, label: MetricLabel) {
        self.labels.insert(label);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success.
    pub fn finish(mut self) -> Duration {
        self.labels.remove(&MetricLabel::STATUS_ERROR);
        self.labels.insert(MetricLabel::STATUS_SUCCESS);
        self.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(
            self.histogram,
            self.start.elapsed().as_secs_f64(),
            labels.into_iter().collect(),
        );
    }
}
