use errors::ErrorKind;
use metrics::{
    log_counter_with_labels,
    register_zero_counter,
    MetricLabel,
};

register_zero_counter!(
    ERRORS_REPORTED_TOTAL,
    "Errors reported at service top-levels",
    &["kind"]
);
pub fn log_error_reported(kind: Option<ErrorKind>) {
    let label = match kind {
        Some(kind) => MetricLabel::new("kind", kind.to_string()),
        None => MetricLabel::new("kind", "Unclassified"),
    };
    log_counter_with_labels(&ERRORS_REPORTED_TOTAL, 1, vec![label]);
}
