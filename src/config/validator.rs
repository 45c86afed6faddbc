use super::Config;
use crate::waf::audit::AuditTemplate;
use std::path::Path;

/// Returns human readable findings. `[X]` entries are fatal, `[!]` are
/// warnings and `[*]` are recommendations.
pub fn validate_config(config: &Config) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.server.port < 1024 {
        warnings.push(format!(
            "[!] Port {} requires root privileges. Consider using a port >= 1024",
            config.server.port
        ));
    }

    if !["trace", "debug", "info", "warn", "error"].contains(&config.logging.level.as_str()) {
        warnings.push(format!(
            "[X] Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
            config.logging.level
        ));
    }

    if !["json", "pretty", "text"].contains(&config.logging.format.as_str()) {
        warnings.push(format!(
            "[X] Invalid log format: {}. Must be 'json', 'pretty' or 'text'",
            config.logging.format
        ));
    }

    if config.store.backend().is_none() {
        warnings.push(format!(
            "[X] Invalid store backend: {}. Must be 'memory' or 'redis'",
            config.store.backend
        ));
    }

    if config.store.poll_interval_ms == 0 {
        warnings.push("[X] Store poll interval cannot be 0".to_string());
    }

    if config.store.backend() == Some(super::StoreBackend::Redis)
        && config.store.connect_retry_attempts == 0
    {
        warnings.push(
            "[!] Store connect_retry_attempts is 0. One connection attempt will be made".to_string(),
        );
    }

    if config.geoip.enable && config.geoip.download_timeout_secs == 0 {
        warnings.push("[X] GeoIP download timeout cannot be 0".to_string());
    }

    if config.store.backend == "memory" {
        warnings.push(
            "[*] Memory store is local to this process. Use 'redis' to share configuration between instances".to_string(),
        );
    }

    if let Err(e) = AuditTemplate::parse(&config.waf.output_format) {
        warnings.push(format!("[X] Invalid WAF output format: {}", e));
    }

    if config.waf.output.split(',').all(|s| s.trim().is_empty()) {
        warnings.push("[!] No WAF output configured. Scan decisions will not be audited.".to_string());
    }

    if config.geoip.enable {
        if !Path::new(&config.geoip.fallback_path).exists() {
            warnings.push(format!(
                "[!] GeoIP fallback dataset not found: {}. GeoIP depends on the download succeeding",
                config.geoip.fallback_path
            ));
        }

        if !config.geoip.remote_url.contains("{year}") || !config.geoip.remote_url.contains("{month}") {
            warnings.push(
                "[!] GeoIP remote URL has no {year}/{month} placeholders. The same file will be fetched every month".to_string(),
            );
        }
    }

    if config.logging.level == "debug" || config.logging.level == "trace" {
        warnings.push(
            "[*] Recommendation: Use 'info' or 'warn' log level in production".to_string(),
        );
    }

    warnings
}

pub fn has_fatal(warnings: &[String]) -> bool {
    warnings.iter().any(|w| w.starts_with("[X]"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_has_no_fatal_issue() {
        let warnings = validate_config(&Config::default());
        assert!(!has_fatal(&warnings), "{:?}", warnings);
    }

    #[test]
    fn test_fatal_issues() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();
        config.store.backend = "etcd".to_string();
        config.store.poll_interval_ms = 0;
        config.waf.output_format = "{{.Bogus}}".to_string();

        let warnings = validate_config(&config);
        let fatal: Vec<_> = warnings.iter().filter(|w| w.starts_with("[X]")).collect();
        assert_eq!(fatal.len(), 4, "{:?}", warnings);
        assert!(has_fatal(&warnings));
    }

    #[test]
    fn test_geoip_warnings_only_when_enabled() {
        let mut config = Config::default();
        config.geoip.fallback_path = "/nonexistent/db.mmdb".to_string();
        config.geoip.remote_url = "https://example.com/db.mmdb.gz".to_string();
        assert_eq!(
            validate_config(&config)
                .iter()
                .filter(|w| w.contains("GeoIP"))
                .count(),
            2
        );

        config.geoip.enable = false;
        assert!(!validate_config(&config).iter().any(|w| w.contains("GeoIP")));
    }
}
