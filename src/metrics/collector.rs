use super::*;

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn inc_scan(&self, result: &str) {
        SCAN_TOTAL.with_label_values(&[result]).inc();
    }

    pub fn inc_changelog_delivered(&self, table: &str) {
        CHANGELOG_DELIVERED.with_label_values(&[table]).inc();
    }

    pub fn inc_changelog_poll_errors(&self) {
        CHANGELOG_POLL_ERRORS.inc();
    }
}
