use super::audit::{AuditOutput, ScanResult};
use super::config::{ConfigStore, WafMode};
use super::plugin::{RequestDescriptor, ScanPlugin, ScanVerdict};
use crate::error::Result;
use crate::metrics::MetricsCollector;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Scan decision pipeline: mode, allow/deny networks, then the plugin chain.
pub struct ScanEngine {
    config: Arc<ConfigStore>,
    /// Registration order is evaluation order.
    plugins: Vec<Arc<dyn ScanPlugin>>,
    output: AuditOutput,
    metrics: MetricsCollector,
}

impl ScanEngine {
    /// Fails with a config error when the output format does not parse or a
    /// file sink cannot be opened.
    pub fn new(config: Arc<ConfigStore>, outputs: &str, output_format: &str) -> Result<Self> {
        let output = AuditOutput::new(outputs, output_format)?;
        info!("WAF engine initialized in {} mode", config.mode());

        Ok(Self {
            config,
            plugins: Vec::new(),
            output,
            metrics: MetricsCollector::new(),
        })
    }

    /// Appends a plugin to the chain. A plugin registered under a name already
    /// in use replaces the previous one at the same position.
    pub fn register_plugin(&mut self, plugin: Arc<dyn ScanPlugin>) {
        match self.plugins.iter().position(|p| p.name() == plugin.name()) {
            Some(idx) => {
                warn!("Replacing already registered plugin {}", plugin.name());
                self.plugins[idx] = plugin;
            }
            None => {
                info!("Registered scan plugin {}", plugin.name());
                self.plugins.push(plugin);
            }
        }
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn config(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    /// Decides on one request and audits the decision.
    pub fn scan(&self, request: &RequestDescriptor) -> ScanResult {
        let result = self.decide(request);
        self.output.emit(request, result);
        self.metrics.inc_scan(result.as_str());
        result
    }

    fn decide(&self, request: &RequestDescriptor) -> ScanResult {
        // one snapshot for the whole decision
        let policy = self.config.snapshot();

        if policy.mode == WafMode::Disabled {
            return ScanResult::Pass;
        }

        if let Some(ip) = request.remote_ip() {
            if policy.is_allow_listed(ip) {
                return ScanResult::Pass;
            }
            if policy.is_deny_listed(ip) {
                return ScanResult::Blocked;
            }
        }

        for plugin in &self.plugins {
            if !policy.is_plugin_enabled(plugin.name()) {
                continue;
            }
            if plugin.scan(request) == ScanVerdict::Block {
                debug!("Plugin {} flagged request from {}", plugin.name(), request.remote_addr);
                return match policy.mode {
                    WafMode::Dryrun => ScanResult::Dryrun,
                    _ => ScanResult::Blocked,
                };
            }
        }

        ScanResult::Pass
    }
}
