pub mod collector;
pub mod exporter;

pub use collector::MetricsCollector;
pub use exporter::export_metrics;

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    pub static ref SCAN_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fe_waf_scan_total",
        "Scan decisions by audit result",
        &["result"]
    )
    .unwrap();
    pub static ref CHANGELOG_DELIVERED: IntCounterVec = register_int_counter_vec!(
        "fe_waf_changelog_delivered_total",
        "Change log entries delivered to subscribers",
        &["table"]
    )
    .unwrap();
    pub static ref CHANGELOG_POLL_ERRORS: IntCounter = register_int_counter!(
        "fe_waf_changelog_poll_errors_total",
        "Change log polls that failed"
    )
    .unwrap();
}

/// Forces registration so the exporter lists every family from the start.
pub fn init_metrics() {
    lazy_static::initialize(&SCAN_TOTAL);
    lazy_static::initialize(&CHANGELOG_DELIVERED);
    lazy_static::initialize(&CHANGELOG_POLL_ERRORS);
}
