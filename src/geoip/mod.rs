pub mod dataset;

pub use dataset::{init_dataset, CountryLookup, DatasetSource, GeoipDataset};

use crate::error::{Result, WafError};
use crate::notifier::{ChangeListener, ChangeNotifier};
use crate::store::{run_blocking, ChangeTable, GeoipCountryRule, RecordStore};
use crate::waf::plugin::{RequestDescriptor, ScanPlugin, ScanVerdict};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Country allow/deny table. All rows share one semantic.
#[derive(Debug, Clone, Default)]
pub struct CountryTable {
    pub countries: HashMap<String, bool>,
    pub allow_mode: bool,
}

impl CountryTable {
    /// The mode is taken from the first rule; an empty table means no
    /// restriction.
    pub fn from_rules(rules: &[GeoipCountryRule]) -> Self {
        let allow_mode = rules.first().map(|r| r.allow).unwrap_or(true);
        if rules.iter().any(|r| r.allow != allow_mode) {
            warn!(
                "GeoIP country table mixes allow and deny rows, using {} mode",
                if allow_mode { "allow" } else { "deny" }
            );
        }

        Self {
            countries: rules
                .iter()
                .map(|r| (r.country_code.clone(), r.allow))
                .collect(),
            allow_mode,
        }
    }

    fn verdict(&self, country: &str) -> ScanVerdict {
        let listed = self.countries.contains_key(country);
        if listed != self.allow_mode {
            ScanVerdict::Block
        } else {
            ScanVerdict::Allow
        }
    }
}

/// Blocks or allows requests by source country.
pub struct GeoipPlugin {
    store: Arc<dyn RecordStore>,
    lookup: Arc<dyn CountryLookup>,
    table: RwLock<Arc<CountryTable>>,
}

impl GeoipPlugin {
    pub const NAME: &'static str = "geoip";

    /// Prepares the dataset (cache, download or bundled file), loads the
    /// country table and subscribes to geo-IP changes. Store access runs on
    /// the blocking pool.
    pub async fn new(notifier: Arc<ChangeNotifier>, source: &DatasetSource) -> Result<Arc<Self>> {
        let store = Arc::clone(notifier.store());
        let dataset = init_dataset(&store, source, Utc::now()).await?;
        let rules = run_blocking(&store, |s| s.geoip_country_rules())
            .await
            .map_err(load_error)?;
        Ok(Self::from_rules(notifier, Arc::new(dataset), &rules))
    }

    /// Synchronous constructor for callers that already own a lookup.
    pub fn with_lookup(
        notifier: Arc<ChangeNotifier>,
        lookup: Arc<dyn CountryLookup>,
    ) -> Result<Arc<Self>> {
        let rules = notifier
            .store()
            .geoip_country_rules()
            .map_err(load_error)?;
        Ok(Self::from_rules(notifier, lookup, &rules))
    }

    fn from_rules(
        notifier: Arc<ChangeNotifier>,
        lookup: Arc<dyn CountryLookup>,
        rules: &[GeoipCountryRule],
    ) -> Arc<Self> {
        let table = CountryTable::from_rules(rules);
        info!(
            "GeoIP plugin ready: {} countries in {} mode",
            table.countries.len(),
            if table.allow_mode { "allow" } else { "deny" }
        );

        let plugin = Arc::new(Self {
            store: Arc::clone(notifier.store()),
            lookup,
            table: RwLock::new(Arc::new(table)),
        });
        notifier.subscribe(ChangeTable::Geoip, plugin.clone());
        plugin
    }

    pub fn table(&self) -> Arc<CountryTable> {
        Arc::clone(&self.table.read())
    }
}

impl ScanPlugin for GeoipPlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn scan(&self, request: &RequestDescriptor) -> ScanVerdict {
        let table = self.table();
        if table.countries.is_empty() {
            return ScanVerdict::Allow;
        }

        // fail open on anything we cannot resolve
        let country = match request
            .remote_ip()
            .and_then(|ip| self.lookup.lookup_country(ip))
        {
            Some(country) => country,
            None => return ScanVerdict::Allow,
        };

        let verdict = table.verdict(&country);
        if verdict == ScanVerdict::Block {
            debug!("GeoIP blocks {} (country: {})", request.remote_addr, country);
        }
        verdict
    }
}

impl ChangeListener for GeoipPlugin {
    fn on_change(&self, _key: &str) {
        match self.store.geoip_country_rules() {
            Ok(rules) => {
                *self.table.write() = Arc::new(CountryTable::from_rules(&rules));
            }
            Err(e) => error!("Error reading geoip countries: {}", e),
        }
    }
}

fn load_error(e: WafError) -> WafError {
    WafError::PluginInit(format!("loading geoip countries: {}", e))
}

/// Replaces the country table with `codes`, all allowed or all denied, and
/// notifies every instance. An empty list lifts the restriction.
pub fn set_countries(notifier: &ChangeNotifier, codes: &[String], allow: bool) -> Result<()> {
    let rules = codes
        .iter()
        .map(|code| {
            let code = code.trim();
            if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(WafError::InvalidArgument(format!(
                    "'{}' is not a two letter country code",
                    code
                )));
            }
            Ok(GeoipCountryRule::new(code.to_ascii_uppercase(), allow))
        })
        .collect::<Result<Vec<_>>>()?;

    notifier.store().replace_geoip_country_rules(&rules)?;
    notifier.notify_change(ChangeTable::Geoip, if allow { "allow" } else { "deny" })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use reqwest::Url;

    /// Fixed address -> country map.
    struct StaticLookup(HashMap<String, String>);

    impl CountryLookup for StaticLookup {
        fn lookup_country(&self, ip: std::net::IpAddr) -> Option<String> {
            self.0.get(&ip.to_string()).cloned()
        }
    }

    fn static_lookup() -> Arc<dyn CountryLookup> {
        Arc::new(StaticLookup(
            [("5.5.5.5", "FR"), ("6.6.6.6", "UK")]
                .into_iter()
                .map(|(ip, c)| (ip.to_string(), c.to_string()))
                .collect(),
        ))
    }

    fn request(remote_addr: &str) -> RequestDescriptor {
        RequestDescriptor::new(remote_addr, Url::parse("http://www.google.fr").unwrap(), "GET")
    }

    fn setup() -> (Arc<MemoryStore>, Arc<ChangeNotifier>) {
        let store = Arc::new(MemoryStore::new());
        let notifier = Arc::new(ChangeNotifier::new(store.clone()).unwrap());
        (store, notifier)
    }

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn test_empty_table_allows() {
        let (_, notifier) = setup();
        let plugin = GeoipPlugin::with_lookup(notifier, static_lookup()).unwrap();

        assert!(plugin.table().countries.is_empty());
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Allow);
    }

    #[test]
    fn test_allow_mode_blocks_unlisted_country() {
        let (store, notifier) = setup();
        store
            .replace_geoip_country_rules(&[GeoipCountryRule::new("UK", true)])
            .unwrap();
        let plugin = GeoipPlugin::with_lookup(notifier, static_lookup()).unwrap();

        assert!(plugin.table().allow_mode);
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Block);
        assert_eq!(plugin.scan(&request("6.6.6.6")), ScanVerdict::Allow);
    }

    #[test]
    fn test_deny_mode_blocks_listed_country() {
        let (store, notifier) = setup();
        store
            .replace_geoip_country_rules(&[GeoipCountryRule::new("FR", false)])
            .unwrap();
        let plugin = GeoipPlugin::with_lookup(notifier, static_lookup()).unwrap();

        assert!(!plugin.table().allow_mode);
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Block);
        assert_eq!(plugin.scan(&request("6.6.6.6")), ScanVerdict::Allow);
    }

    #[test]
    fn test_lookup_failure_fails_open() {
        let (store, notifier) = setup();
        store
            .replace_geoip_country_rules(&[GeoipCountryRule::new("UK", true)])
            .unwrap();
        let plugin = GeoipPlugin::with_lookup(notifier, static_lookup()).unwrap();

        assert_eq!(plugin.scan(&request("7.7.7.7")), ScanVerdict::Allow);
        assert_eq!(plugin.scan(&request("garbage")), ScanVerdict::Allow);
    }

    #[test]
    fn test_with_real_dataset() {
        let (store, notifier) = setup();
        store
            .replace_geoip_country_rules(&[GeoipCountryRule::new("GB", true)])
            .unwrap();
        let dataset = GeoipDataset::from_bytes(dataset::TEST_MMDB.to_vec()).unwrap();
        let plugin = GeoipPlugin::with_lookup(notifier, Arc::new(dataset)).unwrap();

        assert_eq!(plugin.scan(&request("2.2.2.2")), ScanVerdict::Allow);
        assert_eq!(plugin.scan(&request("1.1.1.1")), ScanVerdict::Block);
        assert_eq!(plugin.scan(&request("9.9.9.9")), ScanVerdict::Allow);
        assert_eq!(plugin.scan(&request("2001:db8::1")), ScanVerdict::Allow);
    }

    #[test]
    fn test_change_notification_reloads_table() {
        let (_, notifier) = setup();
        let plugin = GeoipPlugin::with_lookup(notifier.clone(), static_lookup()).unwrap();
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Allow);

        set_countries(&notifier, &codes(&["uk"]), true).unwrap();
        notifier.poll_once().unwrap();

        let table = plugin.table();
        assert_eq!(table.countries.len(), 1);
        assert_eq!(table.countries.get("UK"), Some(&true));
        assert!(table.allow_mode);
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Block);

        set_countries(&notifier, &codes(&["FR", "DE"]), false).unwrap();
        notifier.poll_once().unwrap();
        assert!(!plugin.table().allow_mode);
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Block);
        assert_eq!(plugin.scan(&request("6.6.6.6")), ScanVerdict::Allow);

        set_countries(&notifier, &[], true).unwrap();
        notifier.poll_once().unwrap();
        assert_eq!(plugin.scan(&request("5.5.5.5")), ScanVerdict::Allow);
    }

    #[test]
    fn test_set_countries_validates_codes() {
        let (store, notifier) = setup();
        set_countries(&notifier, &codes(&["CA"]), true).unwrap();

        let err = set_countries(&notifier, &codes(&["FR", "FRA"]), false).unwrap_err();
        assert!(matches!(err, WafError::InvalidArgument(_)));
        assert_eq!(
            store.geoip_country_rules().unwrap(),
            vec![GeoipCountryRule::new("CA", true)]
        );

        let entry = store.change_log_entry(store.latest_change_log_id().unwrap()).unwrap();
        assert_eq!(entry.table, ChangeTable::Geoip);
        assert_eq!(entry.key, "allow");
    }

    #[tokio::test]
    async fn test_new_uses_cached_dataset() {
        let (store, notifier) = setup();
        store
            .replace_geoip_source(Utc::now(), dataset::TEST_MMDB)
            .unwrap();
        store
            .replace_geoip_country_rules(&[GeoipCountryRule::new("UK", true)])
            .unwrap();
        let source = DatasetSource {
            fallback_path: "/nonexistent/fallback.mmdb".into(),
            remote_url: "http://127.0.0.1:1/db-{year}-{month}.mmdb.gz".to_string(),
            download_timeout: std::time::Duration::from_secs(5),
        };

        let plugin = GeoipPlugin::new(notifier, &source).await.unwrap();
        let table = plugin.table();
        assert_eq!(table.countries.len(), 1);
        assert!(table.allow_mode);
    }

    #[tokio::test]
    async fn test_new_fails_without_any_dataset() {
        let (_, notifier) = setup();
        let source = DatasetSource {
            fallback_path: "/nonexistent/fallback.mmdb".into(),
            remote_url: "http://127.0.0.1:1/db-{year}-{month}.mmdb.gz".to_string(),
            download_timeout: std::time::Duration::from_secs(5),
        };

        let err = GeoipPlugin::new(notifier, &source).await.err().unwrap();
        assert!(matches!(err, WafError::PluginInit(_)));
    }
}
