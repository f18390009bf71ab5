use std::time::Duration;

use metrics::{
    log_counter,
    log_counter_with_labels,
    log_distribution_with_labels,
    register_zero_counter,
    register_zero_histogram,
    MetricLabel,
};

use crate::message::ChangeStreamMessage;

register_zero_histogram!(
    CHANGE_STREAM_RESERVE_WAIT_SECONDS,
    "Time a producer spent waiting for the change-stream reservation",
    &["producer"]
);
pub fn log_reserve_wait(producer: &'static str, wait: Duration) {
    log_distribution_with_labels(
        &CHANGE_STREAM_RESERVE_WAIT_SECONDS,
        wait.as_secs_f64(),
        vec![MetricLabel::new("producer", producer)],
    );
}

register_zero_counter!(
    CHANGE_STREAM_MESSAGES_TOTAL,
    "Messages pushed through the change-stream multiplexer",
    &["kind"]
);
pub fn log_multiplexer_push(message: &ChangeStreamMessage) {
    let kind = match message {
        ChangeStreamMessage::Begin { .. } => "begin",
        ChangeStreamMessage::Commit { .. } => "commit",
        ChangeStreamMessage::Data(..) => "data",
        ChangeStreamMessage::Status(..) => "status",
        ChangeStreamMessage::Rollback => "rollback",
    };
    log_counter_with_labels(
        &CHANGE_STREAM_MESSAGES_TOTAL,
        1,
        vec![MetricLabel::new("kind", kind)],
    );
}

register_zero_counter!(BACKFILL_STARTED_TOTAL, "Backfills started");
pub fn log_backfill_started() {
    log_counter(&BACKFILL_STARTED_TOTAL, 1);
}

register_zero_counter!(BACKFILL_COMPLETED_TOTAL, "Backfills run to completion");
pub fn log_backfill_completed() {
    log_counter(&BACKFILL_COMPLETED_TOTAL, 1);
}

register_zero_counter!(
    BACKFILL_CANCELED_TOTAL,
    "Backfills canceled by schema changes",
    &["reason"]
);
pub fn log_backfill_canceled(reason: &'static str) {
    log_counter_with_labels(
        &BACKFILL_CANCELED_TOTAL,
        1,
        vec![MetricLabel::new("reason", reason)],
    );
}

register_zero_counter!(BACKFILL_RETRIES_TOTAL, "Backfill retry timers scheduled");
pub fn log_backfill_retry() {
    log_counter(&BACKFILL_RETRIES_TOTAL, 1);
}

register_zero_counter!(
    BACKFILL_COOPERATIVE_YIELDS_TOTAL,
    "Times the backfill producer released its reservation to a waiter"
);
pub fn log_backfill_yield() {
    log_counter(&BACKFILL_COOPERATIVE_YIELDS_TOTAL, 1);
}
