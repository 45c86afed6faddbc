use super::{ChangeLogEntry, ChangeTable, GeoipCountryRule, GeoipSource, RecordStore};
use crate::error::{Result, WafError};
use chrono::{DateTime, TimeZone, Utc};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use redis::{Commands, RedisError};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

lazy_static! {
    /// Writes the entry first and bumps the counter last: a failing HSET
    /// leaves the counter untouched, so no id is ever allocated without its
    /// entry.
    static ref APPEND_CHANGE_LOG: redis::Script = redis::Script::new(
        r"
local id = tonumber(redis.call('GET', KEYS[1]) or '0') + 1
redis.call('HSET', KEYS[2] .. id, 'table', ARGV[1], 'key', ARGV[2])
redis.call('SET', KEYS[1], id)
return id
"
    );
}

/// Record store shared by every service instance through Redis.
///
/// Key layout under `prefix`:
/// - `changelog:seq` counter, `changelog:<id>` hash (`table`, `key`)
/// - `config` hash (key -> value)
/// - `geoip:countries` hash (code -> "1" | "0")
/// - `geoip:source` hash (`timestamp`, `source`)
pub struct RedisStore {
    client: redis::Client,
    /// Dropped on connection errors and reopened on the next call.
    conn: Mutex<Option<redis::Connection>>,
    prefix: String,
}

impl RedisStore {
    /// Opens the first connection, trying `attempts` times (at least once)
    /// with `delay` between tries. Blocks the calling thread.
    pub fn connect(url: &str, prefix: &str, attempts: u32, delay: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let attempts = attempts.max(1);

        let mut tries = 0;
        let conn = loop {
            tries += 1;
            match client.get_connection() {
                Ok(conn) => break conn,
                Err(e) if tries < attempts => {
                    warn!(
                        "Redis connection attempt {}/{} to {} failed: {}",
                        tries, attempts, url, e
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => return Err(e.into()),
            }
        };
        info!("Connected to redis record store at {}", url);

        Ok(Self {
            client,
            conn: Mutex::new(Some(conn)),
            prefix: prefix.to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Runs `op` on the shared connection. When a cached connection turns
    /// out to be broken, `op` is retried once on a fresh one.
    fn with_conn<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(&mut redis::Connection) -> redis::RedisResult<T>,
    {
        let mut slot = self.conn.lock();
        let mut fresh = false;

        loop {
            let mut conn = match slot.take() {
                Some(conn) => conn,
                None => {
                    fresh = true;
                    self.client.get_connection()?
                }
            };

            match op(&mut conn) {
                Ok(value) => {
                    *slot = Some(conn);
                    return Ok(value);
                }
                Err(e) if is_connection_error(&e) => {
                    warn!("Redis connection lost: {}", e);
                    if fresh {
                        return Err(e.into());
                    }
                }
                Err(e) => {
                    *slot = Some(conn);
                    return Err(e.into());
                }
            }
        }
    }
}

fn is_connection_error(e: &RedisError) -> bool {
    e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
}

impl RecordStore for RedisStore {
    fn append_change_log(&self, table: ChangeTable, key: &str) -> Result<u64> {
        let seq = self.key("changelog:seq");
        let entry_prefix = self.key("changelog:");
        self.with_conn(|conn| {
            APPEND_CHANGE_LOG
                .key(&seq)
                .key(&entry_prefix)
                .arg(table.as_str())
                .arg(key)
                .invoke(conn)
        })
    }

    fn latest_change_log_id(&self) -> Result<u64> {
        let seq = self.key("changelog:seq");
        let id: Option<u64> = self.with_conn(|conn| conn.get(&seq))?;
        match id {
            Some(id) if id > 0 => Ok(id),
            _ => Err(WafError::NotFound("change log is empty".to_string())),
        }
    }

    fn change_log_entry(&self, id: u64) -> Result<ChangeLogEntry> {
        let key = self.key(&format!("changelog:{}", id));
        let fields: HashMap<String, String> = self.with_conn(|conn| conn.hgetall(&key))?;

        match (fields.get("table"), fields.get("key")) {
            (Some(table), Some(key)) => Ok(ChangeLogEntry {
                id,
                table: table.parse()?,
                key: key.clone(),
            }),
            _ => Err(WafError::NotFound(format!("change log entry {}", id))),
        }
    }

    fn config_entries(&self) -> Result<HashMap<String, String>> {
        let config = self.key("config");
        self.with_conn(|conn| conn.hgetall(&config))
    }

    fn config_entry(&self, key: &str) -> Result<String> {
        let config = self.key("config");
        let value: Option<String> = self.with_conn(|conn| conn.hget(&config, key))?;
        value.ok_or_else(|| WafError::NotFound(format!("config key '{}'", key)))
    }

    fn set_config_entry(&self, key: &str, value: &str) -> Result<()> {
        let config = self.key("config");
        self.with_conn(|conn| conn.hset::<_, _, _, ()>(&config, key, value))
    }

    fn geoip_country_rules(&self) -> Result<Vec<GeoipCountryRule>> {
        let countries = self.key("geoip:countries");
        let fields: HashMap<String, String> = self.with_conn(|conn| conn.hgetall(&countries))?;

        let mut rules: Vec<GeoipCountryRule> = fields
            .into_iter()
            .map(|(code, allow)| GeoipCountryRule::new(code, allow == "1"))
            .collect();
        rules.sort_by(|a, b| a.country_code.cmp(&b.country_code));
        Ok(rules)
    }

    fn replace_geoip_country_rules(&self, rules: &[GeoipCountryRule]) -> Result<()> {
        let key = self.key("geoip:countries");
        let items: Vec<(&str, &str)> = rules
            .iter()
            .map(|r| (r.country_code.as_str(), if r.allow { "1" } else { "0" }))
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic().del(&key).ignore();
        if !items.is_empty() {
            pipe.hset_multiple(&key, &items).ignore();
        }
        self.with_conn(|conn| pipe.query::<()>(conn))
    }

    fn geoip_source_timestamp(&self) -> Result<DateTime<Utc>> {
        let key = self.key("geoip:source");
        let secs: Option<i64> = self.with_conn(|conn| conn.hget(&key, "timestamp"))?;
        secs.and_then(|s| Utc.timestamp_opt(s, 0).single())
            .ok_or_else(|| WafError::NotFound("geoip source".to_string()))
    }

    fn geoip_source(&self) -> Result<GeoipSource> {
        let key = self.key("geoip:source");
        let (secs, source): (Option<i64>, Option<Vec<u8>>) = self.with_conn(|conn| {
            redis::cmd("HMGET")
                .arg(&key)
                .arg("timestamp")
                .arg("source")
                .query(conn)
        })?;

        match (secs.and_then(|s| Utc.timestamp_opt(s, 0).single()), source) {
            (Some(timestamp), Some(source)) => Ok(GeoipSource { timestamp, source }),
            _ => Err(WafError::NotFound("geoip source".to_string())),
        }
    }

    fn replace_geoip_source(&self, timestamp: DateTime<Utc>, source: &[u8]) -> Result<()> {
        let key = self.key("geoip:source");
        self.with_conn(|conn| {
            redis::cmd("HSET")
                .arg(&key)
                .arg("timestamp")
                .arg(timestamp.timestamp())
                .arg("source")
                .arg(source)
                .query::<()>(conn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store(prefix: &str) -> RedisStore {
        let store = RedisStore::connect(
            "redis://127.0.0.1:6379",
            prefix,
            1,
            Duration::from_millis(0),
        )
        .expect("Failed to connect to Redis");
        let pattern = format!("{}*", prefix);
        let keys: Vec<String> = store
            .with_conn(|conn| conn.keys(&pattern))
            .expect("Failed to list keys");
        for key in keys {
            store
                .with_conn(|conn| conn.del::<_, ()>(&key))
                .expect("Failed to clean key");
        }
        store
    }

    #[test]
    #[ignore] // Requires Redis to be running
    fn test_redis_change_log() {
        let store = test_store("fe_waf_test_changelog:");
        assert!(store.latest_change_log_id().unwrap_err().is_not_found());

        let id = store.append_change_log(ChangeTable::Config, "mode").unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.latest_change_log_id().unwrap(), 1);

        let entry = store.change_log_entry(1).unwrap();
        assert_eq!(entry.table, ChangeTable::Config);
        assert_eq!(entry.key, "mode");
        assert!(store.change_log_entry(2).unwrap_err().is_not_found());
    }

    #[test]
    #[ignore] // Requires Redis to be running
    fn test_redis_config_and_geoip() {
        let store = test_store("fe_waf_test_tables:");

        store.set_config_entry("mode", "dryrun").unwrap();
        store.set_config_entry("mode", "enabled").unwrap();
        assert_eq!(store.config_entry("mode").unwrap(), "enabled");
        assert_eq!(store.config_entries().unwrap().len(), 1);

        store
            .replace_geoip_country_rules(&[
                GeoipCountryRule::new("UK", true),
                GeoipCountryRule::new("CA", true),
            ])
            .unwrap();
        let rules = store.geoip_country_rules().unwrap();
        assert_eq!(rules[0], GeoipCountryRule::new("CA", true));
        assert_eq!(rules.len(), 2);

        store.replace_geoip_country_rules(&[]).unwrap();
        assert!(store.geoip_country_rules().unwrap().is_empty());

        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        store.replace_geoip_source(ts, b"foobar").unwrap();
        let source = store.geoip_source().unwrap();
        assert_eq!(source.source, b"foobar");
        assert_eq!(store.geoip_source_timestamp().unwrap(), ts);
    }

    #[test]
    fn test_connect_gives_up_after_attempts() {
        let started = std::time::Instant::now();
        let err = RedisStore::connect(
            "redis://127.0.0.1:1",
            "fe_waf_test:",
            3,
            Duration::from_millis(50),
        )
        .err()
        .unwrap();

        assert!(matches!(err, WafError::Persistence(_)));
        // two pauses between three attempts
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    #[ignore] // Requires Redis to be running
    fn test_failed_entry_write_allocates_no_id() {
        let store = test_store("fe_waf_test_append:");
        // an entry key of the wrong type makes the HSET step fail
        store
            .with_conn(|conn| conn.set::<_, _, ()>("fe_waf_test_append:changelog:1", "x"))
            .unwrap();

        assert!(store.append_change_log(ChangeTable::Config, "mode").is_err());
        assert!(store.latest_change_log_id().unwrap_err().is_not_found());

        store
            .with_conn(|conn| conn.del::<_, ()>("fe_waf_test_append:changelog:1"))
            .unwrap();
        assert_eq!(store.append_change_log(ChangeTable::Config, "mode").unwrap(), 1);
        assert_eq!(store.change_log_entry(1).unwrap().key, "mode");
    }

    #[test]
    #[ignore] // Requires Redis to be running
    fn test_reconnects_after_connection_loss() {
        let store = test_store("fe_waf_test_reconnect:");
        store.set_config_entry("mode", "dryrun").unwrap();

        // drops every normal client, this one included
        let _ = store.with_conn(|conn| {
            redis::cmd("CLIENT")
                .arg("KILL")
                .arg("TYPE")
                .arg("normal")
                .arg("SKIPME")
                .arg("no")
                .query::<()>(conn)
        });

        assert_eq!(store.config_entry("mode").unwrap(), "dryrun");
        store.set_config_entry("mode", "enabled").unwrap();
        assert_eq!(store.config_entry("mode").unwrap(), "enabled");
    }
}
