use prometheus::{IntCounter, IntCounterVec, IntGaugeVec};
use std::sync::LazyLock;

pub static CONN_GAUGE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    prometheus::register_int_gauge_vec!(
        "connection_count",
        "number of active connections",
        &["service"]
    )
    .unwrap()
});
pub static TOTAL_CONN: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_connection_count",
        "total number of connections ever made",
        &["service"]
    )
    .unwrap()
});
pub static CONN_DENIED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_connections_denied",
        "total number of connections rejected due to concurrency limits",
        &["service"]
    )
    .unwrap()
});
pub static TOTAL_MSGS_RECVD: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_messages_received",
        "total number of messages ever received",
        &["service"]
    )
    .unwrap()
});
pub static TOTAL_MSGS_STORED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "total_messages_stored",
        "total number of messages ever persisted to a mailbox"
    )
    .unwrap()
});
pub static TOTAL_MSGS_REMOVED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    prometheus::register_int_counter_vec!(
        "total_messages_removed",
        "total number of messages removed from mailboxes",
        &["reason"]
    )
    .unwrap()
});
pub static MONITOR_EVENTS_DROPPED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "monitor_events_dropped",
        "number of hub events dropped because a subscriber was too slow"
    )
    .unwrap()
});
pub static RETENTION_RUNS: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "retention_sweep_runs_total",
        "total number of retention sweeps"
    )
    .unwrap()
});
pub static RETENTION_PRUNED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "retention_pruned_total",
        "total number of messages removed by the retention sweeper"
    )
    .unwrap()
});
