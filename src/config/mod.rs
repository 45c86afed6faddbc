pub mod defaults;
pub mod parser;
pub mod validator;

use anyhow::Result;
use defaults::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub waf: WafConfig,
    #[serde(default)]
    pub geoip: GeoIpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// `json`, `pretty` or `text`
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default = "default_store_prefix")]
    pub prefix: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Tries for the first connection to a shared store.
    #[serde(default = "default_connect_retry_attempts")]
    pub connect_retry_attempts: u32,
    #[serde(default = "default_connect_retry_delay_ms")]
    pub connect_retry_delay_ms: u64,
}

impl StoreConfig {
    pub fn backend(&self) -> Option<StoreBackend> {
        match self.backend.as_str() {
            "memory" => Some(StoreBackend::Memory),
            "redis" => Some(StoreBackend::Redis),
            _ => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WafConfig {
    /// Comma separated `scope:target` audit sinks.
    #[serde(default = "default_waf_output")]
    pub output: String,
    #[serde(default = "default_waf_output_format")]
    pub output_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoIpConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_geoip_fallback_path")]
    pub fallback_path: String,
    #[serde(default = "default_geoip_remote_url")]
    pub remote_url: String,
    #[serde(default = "default_geoip_download_timeout_secs")]
    pub download_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            url: default_redis_url(),
            prefix: default_store_prefix(),
            poll_interval_ms: default_poll_interval_ms(),
            connect_retry_attempts: default_connect_retry_attempts(),
            connect_retry_delay_ms: default_connect_retry_delay_ms(),
        }
    }
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            output: default_waf_output(),
            output_format: default_waf_output_format(),
        }
    }
}

impl Default for GeoIpConfig {
    fn default() -> Self {
        Self {
            enable: default_true(),
            fallback_path: default_geoip_fallback_path(),
            remote_url: default_geoip_remote_url(),
            download_timeout_secs: default_geoip_download_timeout_secs(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        parser::parse_config(path)
    }

    pub fn validate(&self) -> Vec<String> {
        validator::validate_config(self)
    }

    pub fn geoip_source(&self) -> crate::geoip::DatasetSource {
        crate::geoip::DatasetSource {
            fallback_path: PathBuf::from(&self.geoip.fallback_path),
            remote_url: self.geoip.remote_url.clone(),
            download_timeout: Duration::from_secs(self.geoip.download_timeout_secs),
        }
    }
}
