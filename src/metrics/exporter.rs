use anyhow::{Context, Result};
use prometheus::{Encoder, TextEncoder};

/// Renders every registered family in the Prometheus text format.
pub fn export_metrics() -> Result<String> {
    super::init_metrics();

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&prometheus::gather(), &mut buffer)
        .context("Failed to encode metrics")?;
    String::from_utf8(buffer).context("Metrics output is not UTF-8")
}
