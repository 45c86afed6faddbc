pub mod config;
pub mod serve;
pub mod waf;

pub use config::ConfigArgs;
pub use serve::ServeArgs;
pub use waf::WafArgs;

use crate::config::{StoreBackend, StoreConfig};
use crate::notifier::ChangeNotifier;
use crate::store::{MemoryStore, RecordStore, RedisStore};
use crate::waf::ConfigStore;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;

/// Opens the record store selected by `[store]`.
pub fn open_store(config: &StoreConfig) -> Result<Arc<dyn RecordStore>> {
    match config.backend() {
        Some(StoreBackend::Memory) => {
            info!("Using in-process memory record store");
            Ok(Arc::new(MemoryStore::new()))
        }
        Some(StoreBackend::Redis) => {
            info!("Using Redis record store at {}", config.url);
            let store = RedisStore::connect(
                &config.url,
                &config.prefix,
                config.connect_retry_attempts,
                config.connect_retry_delay(),
            )
            .with_context(|| format!("Failed to connect to Redis at {}", config.url))?;
            Ok(Arc::new(store))
        }
        None => bail!("Unknown store backend: {}", config.backend),
    }
}

/// Opens the store, reads the change log head and loads the WAF policy on
/// the blocking pool, since connecting may sleep between retries.
pub async fn open_shared_state(
    config: &StoreConfig,
) -> Result<(Arc<ChangeNotifier>, Arc<ConfigStore>)> {
    let config = config.clone();
    tokio::task::spawn_blocking(move || -> Result<_> {
        let store = open_store(&config)?;
        let notifier = Arc::new(
            ChangeNotifier::new(store)
                .context("Failed to read the change log")?
                .with_interval(config.poll_interval()),
        );
        let waf = ConfigStore::bootstrap(notifier.clone()).context("Failed to load WAF config")?;
        Ok((notifier, waf))
    })
    .await
    .context("Store startup task failed")?
}
