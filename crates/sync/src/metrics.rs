use metrics::{
    log_counter_with_labels,
    log_distribution,
    register_zero_counter,
    register_zero_histogram,
    MetricLabel,
    StatusTimer,
    STATUS_LABEL,
};
use sync_types::UpstreamMessage;

register_zero_histogram!(
    SYNC_CONNECT_SECONDS,
    "Time between Connection creation and a successful init handshake",
    &STATUS_LABEL
);
pub fn connect_timer() -> StatusTimer {
    StatusTimer::new(&SYNC_CONNECT_SECONDS)
}

register_zero_histogram!(
    SYNC_HANDLE_MESSAGE_SECONDS,
    "Time to handle a client message",
    &["status", "endpoint"]
);
pub fn handle_message_timer(message: &UpstreamMessage) -> StatusTimer {
    let mut timer = StatusTimer::new(&SYNC_HANDLE_MESSAGE_SECONDS);
    timer.add_label(MetricLabel::new("endpoint", message.kind()));
    timer
}

register_zero_counter!(
    PUSH_HTTP_CALLS_TOTAL,
    "HTTP calls to user push endpoints",
    &["status"]
);
pub fn log_push_http_call(status: u16) {
    log_counter_with_labels(
        &PUSH_HTTP_CALLS_TOTAL,
        1,
        vec![MetricLabel::new("status", status.to_string())],
    );
}

register_zero_histogram!(
    PUSH_COMBINED_MUTATIONS,
    "Mutations carried per combined push call"
);
register_zero_histogram!(
    PUSH_COMBINED_TASKS,
    "Queued pushes combined into one call"
);
pub fn log_push_combined_mutations(tasks: usize, mutations: usize) {
    log_distribution(&PUSH_COMBINED_TASKS, tasks as f64);
    log_distribution(&PUSH_COMBINED_MUTATIONS, mutations as f64);
}

register_zero_histogram!(
    SYNC_PROCESS_CLIENT_MESSAGE_SECONDS,
    "Delay between receiving a client message on the socket and processing it"
);
pub fn log_process_client_message_delay(delay: std::time::Duration) {
    log_distribution(&SYNC_PROCESS_CLIENT_MESSAGE_SECONDS, delay.as_secs_f64());
}

register_zero_counter!(
    SYNC_MESSAGES_OUT_TOTAL,
    "Messages sent to clients",
    &["kind"]
);
pub fn log_message_out(message: &sync_types::DownstreamMessage) {
    log_counter_with_labels(
        &SYNC_MESSAGES_OUT_TOTAL,
        1,
        vec![MetricLabel::new("kind", message.kind())],
    );
}

register_zero_counter!(
    AUTH_SESSION_REVISIONS_TOTAL,
    "Auth session revision bumps across all client groups"
);
pub fn log_auth_revision() {
    metrics::log_counter(&AUTH_SESSION_REVISIONS_TOTAL, 1);
}
