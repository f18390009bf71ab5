use std::collections::HashMap;

use prometheus::{
    Gauge,
    GaugeVec,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
};

use crate::labels::MetricLabel;

fn label_map(labels: &[MetricLabel]) -> HashMap<&str, &str> {
    labels.iter().map(|l| l.split_key_value()).collect()
}

pub fn log_counter(counter: &IntCounter, increment: u64) {
    counter.inc_by(increment);
}

pub fn log_counter_with_labels(counter: &IntCounterVec, increment: u64, labels: Vec<MetricLabel>) {
    match counter.get_metric_with(&label_map(&labels)) {
        Ok(counter) => counter.inc_by(increment),
        Err(e) => tracing::error!("Failed to log counter sample: {e}"),
    }
}

pub fn log_distribution(histogram: &Histogram, value: f64) {
    histogram.observe(value);
}

pub fn log_distribution_with_labels(
    histogram: &HistogramVec,
    value: f64,
    labels: Vec<MetricLabel>,
) {
    match histogram.get_metric_with(&label_map(&labels)) {
        Ok(histogram) => histogram.observe(value),
        Err(e) => tracing::error!("Failed to log histogram sample: {e}"),
    }
}

pub fn log_gauge(gauge: &Gauge, value: f64) {
    gauge.set(value);
}

pub fn log_gauge_with_labels(gauge: &GaugeVec, value: f64, labels: Vec<MetricLabel>) {
    match gauge.get_metric_with(&label_map(&labels)) {
        Ok(gauge) => gauge.set(value),
        Err(e) => tracing::error!("Failed to log gauge sample: {e}"),
    }
}
