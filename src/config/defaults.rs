//! Default values for configuration options

// Server defaults
pub(super) fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub(super) fn default_port() -> u16 {
    18000
}

pub(super) fn default_true() -> bool {
    true
}

// Logging defaults
pub(super) fn default_log_level() -> String {
    "info".to_string()
}

pub(super) fn default_log_format() -> String {
    "json".to_string()
}

// Store defaults
pub(super) fn default_store_backend() -> String {
    "memory".to_string()
}

pub(super) fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

pub(super) fn default_store_prefix() -> String {
    "fe_waf:".to_string()
}

pub(super) fn default_poll_interval_ms() -> u64 {
    1000
}

pub(super) fn default_connect_retry_attempts() -> u32 {
    10
}

pub(super) fn default_connect_retry_delay_ms() -> u64 {
    1000
}

// WAF audit defaults
pub(super) fn default_waf_output() -> String {
    "all:log".to_string()
}

pub(super) fn default_waf_output_format() -> String {
    "{{.Date}} {{.Remoteaddr}} {{.Method}} {{.Url}} {{.Scanresult}}".to_string()
}

// GeoIP defaults
pub(super) fn default_geoip_fallback_path() -> String {
    "/usr/share/fe-waf/dbip-country-lite.mmdb".to_string()
}

pub(super) fn default_geoip_remote_url() -> String {
    "https://download.db-ip.com/free/dbip-country-lite-{year}-{month}.mmdb.gz".to_string()
}

pub(super) fn default_geoip_download_timeout_secs() -> u64 {
    60
}
