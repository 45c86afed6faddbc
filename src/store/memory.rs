use super::{ChangeLogEntry, ChangeTable, GeoipCountryRule, GeoipSource, RecordStore};
use crate::error::{Result, WafError};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
struct Tables {
    change_log: Vec<ChangeLogEntry>,
    config: HashMap<String, String>,
    geoip_countries: Vec<GeoipCountryRule>,
    geoip_source: Option<GeoipSource>,
}

/// In-process record store.
///
/// Shared between service instances only by sharing the `Arc`; mostly useful
/// for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryStore {
    fn append_change_log(&self, table: ChangeTable, key: &str) -> Result<u64> {
        let mut tables = self.tables.lock();
        let id = tables.change_log.len() as u64 + 1;
        tables.change_log.push(ChangeLogEntry {
            id,
            table,
            key: key.to_string(),
        });
        Ok(id)
    }

    fn latest_change_log_id(&self) -> Result<u64> {
        self.tables
            .lock()
            .change_log
            .last()
            .map(|entry| entry.id)
            .ok_or_else(|| WafError::NotFound("change log is empty".to_string()))
    }

    fn change_log_entry(&self, id: u64) -> Result<ChangeLogEntry> {
        // ids start at 1 and are dense
        let tables = self.tables.lock();
        id.checked_sub(1)
            .and_then(|idx| tables.change_log.get(idx as usize))
            .cloned()
            .ok_or_else(|| WafError::NotFound(format!("change log entry {}", id)))
    }

    fn config_entries(&self) -> Result<HashMap<String, String>> {
        Ok(self.tables.lock().config.clone())
    }

    fn config_entry(&self, key: &str) -> Result<String> {
        self.tables
            .lock()
            .config
            .get(key)
            .cloned()
            .ok_or_else(|| WafError::NotFound(format!("config key '{}'", key)))
    }

    fn set_config_entry(&self, key: &str, value: &str) -> Result<()> {
        self.tables
            .lock()
            .config
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn geoip_country_rules(&self) -> Result<Vec<GeoipCountryRule>> {
        Ok(self.tables.lock().geoip_countries.clone())
    }

    fn replace_geoip_country_rules(&self, rules: &[GeoipCountryRule]) -> Result<()> {
        self.tables.lock().geoip_countries = rules.to_vec();
        Ok(())
    }

    fn geoip_source_timestamp(&self) -> Result<DateTime<Utc>> {
        self.tables
            .lock()
            .geoip_source
            .as_ref()
            .map(|source| source.timestamp)
            .ok_or_else(|| WafError::NotFound("geoip source".to_string()))
    }

    fn geoip_source(&self) -> Result<GeoipSource> {
        self.tables
            .lock()
            .geoip_source
            .clone()
            .ok_or_else(|| WafError::NotFound("geoip source".to_string()))
    }

    fn replace_geoip_source(&self, timestamp: DateTime<Utc>, source: &[u8]) -> Result<()> {
        self.tables.lock().geoip_source = Some(GeoipSource {
            timestamp,
            source: source.to_vec(),
        });
        Ok(())
    }
}
