//! Durable record storage consumed by the change notifier, the live
//! configuration and the geo-IP plugin.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::{Result, WafError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Logical table a change log entry refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTable {
    Config,
    Geoip,
}

impl ChangeTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Geoip => "geoip",
        }
    }
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeTable {
    type Err = WafError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "config" => Ok(Self::Config),
            "geoip" => Ok(Self::Geoip),
            _ => Err(WafError::Persistence(format!("unknown change table '{}'", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeLogEntry {
    pub id: u64,
    pub table: ChangeTable,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeoipCountryRule {
    pub country_code: String,
    pub allow: bool,
}

impl GeoipCountryRule {
    pub fn new(country_code: impl Into<String>, allow: bool) -> Self {
        Self {
            country_code: country_code.into(),
            allow,
        }
    }
}

/// The cached geo-IP dataset: a single row, replaced as a whole.
#[derive(Debug, Clone)]
pub struct GeoipSource {
    pub timestamp: DateTime<Utc>,
    pub source: Vec<u8>,
}

/// Abstract record store.
///
/// Every call may block on I/O. Lookups of a single record return
/// [`WafError::NotFound`] when the record is absent.
pub trait RecordStore: Send + Sync {
    /// Appends a change log entry and returns its id. Ids are strictly
    /// increasing and never reused.
    fn append_change_log(&self, table: ChangeTable, key: &str) -> Result<u64>;

    /// Highest change log id, `NotFound` while the log is empty.
    fn latest_change_log_id(&self) -> Result<u64>;

    fn change_log_entry(&self, id: u64) -> Result<ChangeLogEntry>;

    fn config_entries(&self) -> Result<HashMap<String, String>>;

    fn config_entry(&self, key: &str) -> Result<String>;

    /// Upserts a config value. One value per key, last write wins.
    fn set_config_entry(&self, key: &str, value: &str) -> Result<()>;

    fn geoip_country_rules(&self) -> Result<Vec<GeoipCountryRule>>;

    /// Replaces the whole country rule set.
    fn replace_geoip_country_rules(&self, rules: &[GeoipCountryRule]) -> Result<()>;

    fn geoip_source_timestamp(&self) -> Result<DateTime<Utc>>;

    fn geoip_source(&self) -> Result<GeoipSource>;

    fn replace_geoip_source(&self, timestamp: DateTime<Utc>, source: &[u8]) -> Result<()>;
}

/// Runs a store operation on the blocking pool. Store implementations may do
/// network I/O and must stay off the async worker threads.
pub async fn run_blocking<T, F>(store: &Arc<dyn RecordStore>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn RecordStore) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|e| WafError::Persistence(format!("store task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_blocking_returns_store_result() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());

        let id = run_blocking(&store, |s| s.append_change_log(ChangeTable::Config, "mode"))
            .await
            .unwrap();
        assert_eq!(id, 1);

        let err = run_blocking(&store, |s| s.change_log_entry(7)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_run_blocking_reports_panicked_task() {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryStore::new());
        let err = run_blocking(&store, |_| -> Result<()> { panic!("store blew up") })
            .await
            .unwrap_err();
        assert!(matches!(err, WafError::Persistence(_)));
    }
}
