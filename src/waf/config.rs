use crate::error::{Result, WafError};
use crate::notifier::{ChangeListener, ChangeNotifier};
use crate::store::{ChangeTable, RecordStore};
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

pub const MODE_KEY: &str = "mode";
pub const ALLOWLIST_KEY: &str = "allowlist";
pub const DENYLIST_KEY: &str = "denylist";
pub const PLUGIN_KEY_PREFIX: &str = "plugin_";

/// Global WAF posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WafMode {
    /// Block requests a plugin flags.
    #[default]
    Enabled,
    /// Audit what would be blocked, let everything through.
    Dryrun,
    /// No scanning.
    Disabled,
}

impl fmt::Display for WafMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => write!(f, "enabled"),
            Self::Dryrun => write!(f, "dryrun"),
            Self::Disabled => write!(f, "disabled"),
        }
    }
}

impl FromStr for WafMode {
    type Err = WafError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enabled" => Ok(Self::Enabled),
            "dryrun" => Ok(Self::Dryrun),
            "disabled" => Ok(Self::Disabled),
            _ => Err(WafError::InvalidArgument(format!(
                "bad mode '{}' (must be enabled, dryrun or disabled)",
                s
            ))),
        }
    }
}

/// Immutable policy snapshot. A new one is published on every change.
#[derive(Debug, Clone, Default)]
pub struct WafPolicy {
    pub mode: WafMode,
    pub enabled_plugins: HashMap<String, bool>,
    pub allow_list: Vec<IpNetwork>,
    pub deny_list: Vec<IpNetwork>,
}

impl WafPolicy {
    pub fn is_plugin_enabled(&self, name: &str) -> bool {
        self.enabled_plugins.get(name).copied().unwrap_or(false)
    }

    pub fn is_allow_listed(&self, ip: IpAddr) -> bool {
        self.allow_list.iter().any(|network| network.contains(ip))
    }

    pub fn is_deny_listed(&self, ip: IpAddr) -> bool {
        self.deny_list.iter().any(|network| network.contains(ip))
    }

    /// Applies one stored key/value pair. Unknown keys and bad values are
    /// ignored; a malformed network inside a list is dropped on its own.
    fn apply_entry(&mut self, key: &str, value: &str) {
        match key {
            MODE_KEY => match value.parse() {
                Ok(mode) => self.mode = mode,
                Err(e) => warn!("Ignoring stored mode: {}", e),
            },
            ALLOWLIST_KEY => self.allow_list = parse_networks_lenient("allow", value),
            DENYLIST_KEY => self.deny_list = parse_networks_lenient("deny", value),
            _ => {
                if let Some(plugin) = key.strip_prefix(PLUGIN_KEY_PREFIX) {
                    match value {
                        "enabled" => {
                            self.enabled_plugins.insert(plugin.to_string(), true);
                        }
                        "disabled" => {
                            self.enabled_plugins.insert(plugin.to_string(), false);
                        }
                        _ => warn!("Ignoring plugin toggle {}={}", key, value),
                    }
                }
            }
        }
    }
}

fn split_networks(csv: &str) -> impl Iterator<Item = &str> {
    let csv = csv.trim();
    // an empty value is an empty list
    csv.split(',')
        .map(str::trim)
        .filter(move |_| !csv.is_empty())
}

fn parse_network(cidr: &str) -> Result<IpNetwork> {
    if !cidr.contains('/') {
        return Err(WafError::InvalidArgument(format!(
            "'{}' is not a CIDR network (missing prefix length)",
            cidr
        )));
    }
    IpNetwork::from_str(cidr)
        .map_err(|e| WafError::InvalidArgument(format!("invalid CIDR '{}': {}", cidr, e)))
}

fn parse_networks_lenient(list: &str, csv: &str) -> Vec<IpNetwork> {
    split_networks(csv)
        .filter_map(|cidr| match parse_network(cidr) {
            Ok(network) => Some(network),
            Err(e) => {
                error!("not able to parse {} net {}: {}", list, cidr, e);
                None
            }
        })
        .collect()
}

/// All-or-nothing parse used by explicit set calls.
pub fn parse_networks(csv: &str) -> Result<Vec<IpNetwork>> {
    split_networks(csv).map(parse_network).collect()
}

/// Live WAF policy, bootstrapped from the record store and kept current by
/// change notifications on the config table.
pub struct ConfigStore {
    notifier: Arc<ChangeNotifier>,
    policy: RwLock<Arc<WafPolicy>>,
}

impl ConfigStore {
    /// Loads every stored config entry and subscribes to config changes.
    pub fn bootstrap(notifier: Arc<ChangeNotifier>) -> Result<Arc<Self>> {
        let entries = notifier.store().config_entries()?;

        let mut policy = WafPolicy::default();
        for (key, value) in &entries {
            policy.apply_entry(key, value);
        }
        info!(
            "WAF config loaded: mode={}, {} allow / {} deny networks",
            policy.mode,
            policy.allow_list.len(),
            policy.deny_list.len()
        );

        let config = Arc::new(Self {
            notifier: Arc::clone(&notifier),
            policy: RwLock::new(Arc::new(policy)),
        });
        notifier.subscribe(ChangeTable::Config, config.clone());
        Ok(config)
    }

    fn store(&self) -> &Arc<dyn RecordStore> {
        self.notifier.store()
    }

    /// Current policy snapshot. Never blocks on store I/O.
    pub fn snapshot(&self) -> Arc<WafPolicy> {
        Arc::clone(&self.policy.read())
    }

    pub fn mode(&self) -> WafMode {
        self.snapshot().mode
    }

    pub fn is_allow_listed(&self, ip: IpAddr) -> bool {
        self.snapshot().is_allow_listed(ip)
    }

    pub fn is_deny_listed(&self, ip: IpAddr) -> bool {
        self.snapshot().is_deny_listed(ip)
    }

    /// Publishes a modified copy of the current policy.
    fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut WafPolicy),
    {
        let mut current = self.policy.write();
        let mut next = WafPolicy::clone(&current);
        f(&mut next);
        *current = Arc::new(next);
    }

    fn parse_entry(&self, key: &str, value: &str) {
        self.update(|policy| policy.apply_entry(key, value));
    }

    /// Writes the value and appends the change log entry; the call returns
    /// once both are stored.
    fn persist(&self, key: &str, value: &str) -> Result<()> {
        self.store().set_config_entry(key, value)?;
        self.notifier.notify_change(ChangeTable::Config, key)?;
        Ok(())
    }

    pub fn set_mode(&self, mode: &str) -> Result<()> {
        let mode: WafMode = mode.parse()?;
        self.update(|policy| policy.mode = mode);
        self.persist(MODE_KEY, &mode.to_string())
    }

    pub fn set_allow_list(&self, csv: &str) -> Result<()> {
        let networks = parse_networks(csv)?;
        self.update(|policy| policy.allow_list = networks);
        self.persist(ALLOWLIST_KEY, csv)
    }

    pub fn set_deny_list(&self, csv: &str) -> Result<()> {
        let networks = parse_networks(csv)?;
        self.update(|policy| policy.deny_list = networks);
        self.persist(DENYLIST_KEY, csv)
    }

    pub fn enable_plugin(&self, name: &str, enabled: bool) -> Result<()> {
        self.update(|policy| {
            policy.enabled_plugins.insert(name.to_string(), enabled);
        });
        let value = if enabled { "enabled" } else { "disabled" };
        self.persist(&format!("{}{}", PLUGIN_KEY_PREFIX, name), value)
    }
}

impl ChangeListener for ConfigStore {
    fn on_change(&self, key: &str) {
        match self.store().config_entry(key) {
            Ok(value) => self.parse_entry(key, &value),
            Err(e) => error!("Error reading config {}: {}", key, e),
        }
    }
}
