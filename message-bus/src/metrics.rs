//! Prometheus metrics for message bus

use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static! {
    /// Total messages delivered to a mailbox
    pub static ref MESSAGES_SENT: IntCounterVec = register_int_counter_vec!(
        "message_bus_sent_total",
        "Total messages delivered to a mailbox",
        &["kind"]
    )
    .expect("message_bus_sent_total registers once");

    /// Messages removed by drop rules
    pub static ref MESSAGES_DROPPED: IntCounterVec = register_int_counter_vec!(
        "message_bus_dropped_total",
        "Messages removed by drop rules",
        &["kind"]
    )
    .expect("message_bus_dropped_total registers once");

    /// Messages addressed to nodes without a mailbox
    pub static ref MESSAGES_UNREACHABLE: IntCounterVec = register_int_counter_vec!(
        "message_bus_unreachable_total",
        "Messages addressed to nodes without a mailbox",
        &["kind"]
    )
    .expect("message_bus_unreachable_total registers once");

    /// Request round-trip duration
    pub static ref REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "message_bus_request_duration_seconds",
        "Request round-trip duration in seconds",
        &["kind", "status"]
    )
    .expect("message_bus_request_duration_seconds registers once");
}
