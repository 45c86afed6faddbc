//! Geo-IP dataset lifecycle: cached copy in the record store, monthly remote
//! download, bundled file as last resort.

use crate::error::{Result, WafError};
use crate::store::{run_blocking, RecordStore};
use chrono::{DateTime, Datelike, Duration, Utc};
use flate2::read::GzDecoder;
use maxminddb::{geoip2, MaxMindDBError, Reader};
use std::io::Read;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A cached dataset older than this is refreshed.
pub const MAX_CACHE_AGE_DAYS: i64 = 31;

/// The bundled dataset is cached with a timestamp this far in the past, so the
/// next startup tries the download again.
pub const FALLBACK_BACKDATE_DAYS: i64 = 30;

/// Upper bound on a decompressed dataset. Country databases are a few MiB.
pub const MAX_DATASET_BYTES: u64 = 256 * 1024 * 1024;

/// Resolves an address to an ISO 3166 alpha-2 country code.
pub trait CountryLookup: Send + Sync {
    /// `None` when the address is not in the dataset or carries no country.
    fn lookup_country(&self, ip: IpAddr) -> Option<String>;
}

/// MaxMind-format country database held in memory.
pub struct GeoipDataset {
    reader: Reader<Vec<u8>>,
}

impl GeoipDataset {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let reader = Reader::from_source(bytes)
            .map_err(|e| WafError::PluginInit(format!("invalid geoip dataset: {}", e)))?;
        debug!(
            "GeoIP dataset loaded: {} (build epoch {})",
            reader.metadata.database_type, reader.metadata.build_epoch
        );
        Ok(Self { reader })
    }
}

impl CountryLookup for GeoipDataset {
    fn lookup_country(&self, ip: IpAddr) -> Option<String> {
        match self.reader.lookup::<geoip2::Country>(ip) {
            Ok(record) => record
                .country
                .and_then(|c| c.iso_code)
                .map(|code| code.to_string()),
            Err(MaxMindDBError::AddressNotFoundError(_)) => None,
            Err(e) => {
                debug!("GeoIP lookup failed for {}: {}", ip, e);
                None
            }
        }
    }
}

/// Where fresh datasets come from.
#[derive(Debug, Clone)]
pub struct DatasetSource {
    /// Bundled dataset, raw (not compressed).
    pub fallback_path: PathBuf,
    /// Gzip-compressed dataset URL with `{year}` and `{month}` placeholders.
    pub remote_url: String,
    /// Whole-request limit for the download.
    pub download_timeout: std::time::Duration,
}

impl DatasetSource {
    pub fn remote_url_for(&self, now: DateTime<Utc>) -> String {
        self.remote_url
            .replace("{year}", &format!("{:04}", now.year()))
            .replace("{month}", &format!("{:02}", now.month()))
    }
}

/// Fetches `url` and gunzips the body in memory.
pub async fn download_gz(url: &str, timeout: std::time::Duration) -> Result<Vec<u8>> {
    let fetch_err = |e: reqwest::Error| WafError::PluginInit(format!("fetching {}: {}", url, e));

    let client = reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(fetch_err)?;
    let response = client
        .get(url)
        .send()
        .await
        .map_err(fetch_err)?
        .error_for_status()
        .map_err(fetch_err)?;
    let body = response.bytes().await.map_err(fetch_err)?;

    gunzip_capped(&body, MAX_DATASET_BYTES)
        .map_err(|e| WafError::PluginInit(format!("decompressing {}: {}", url, e)))
}

fn gunzip_capped(data: &[u8], limit: u64) -> std::result::Result<Vec<u8>, String> {
    let mut out = Vec::new();
    GzDecoder::new(data)
        .take(limit + 1)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 > limit {
        return Err(format!("dataset exceeds {} bytes", limit));
    }
    Ok(out)
}

/// Returns a usable dataset, refreshing the store's cached copy when needed:
///
/// 1. cached copy younger than [`MAX_CACHE_AGE_DAYS`];
/// 2. remote download, cached with `now`;
/// 3. bundled file, cached with `now` minus [`FALLBACK_BACKDATE_DAYS`].
pub async fn init_dataset(
    store: &Arc<dyn RecordStore>,
    source: &DatasetSource,
    now: DateTime<Utc>,
) -> Result<GeoipDataset> {
    if let Some(dataset) = load_cached(store, now).await {
        return Ok(dataset);
    }

    let url = source.remote_url_for(now);
    info!("Downloading geoip dataset from {}", url);
    match download_gz(&url, source.download_timeout).await {
        Ok(bytes) => match GeoipDataset::from_bytes(bytes.clone()) {
            Ok(dataset) => {
                let size = bytes.len();
                cache_source(store, now, bytes).await?;
                info!("GeoIP dataset refreshed ({} bytes)", size);
                return Ok(dataset);
            }
            Err(e) => warn!("Downloaded geoip dataset is unusable: {}", e),
        },
        Err(e) => warn!("GeoIP dataset download failed: {}", e),
    }

    info!(
        "Falling back to bundled geoip dataset {}",
        source.fallback_path.display()
    );
    let bytes = tokio::fs::read(&source.fallback_path).await.map_err(|e| {
        WafError::PluginInit(format!(
            "reading {}: {}",
            source.fallback_path.display(),
            e
        ))
    })?;
    let dataset = GeoipDataset::from_bytes(bytes.clone())?;
    cache_source(store, now - Duration::days(FALLBACK_BACKDATE_DAYS), bytes).await?;

    Ok(dataset)
}

async fn cache_source(
    store: &Arc<dyn RecordStore>,
    timestamp: DateTime<Utc>,
    bytes: Vec<u8>,
) -> Result<()> {
    run_blocking(store, move |s| s.replace_geoip_source(timestamp, &bytes))
        .await
        .map_err(|e| WafError::PluginInit(format!("caching geoip dataset: {}", e)))
}

async fn load_cached(store: &Arc<dyn RecordStore>, now: DateTime<Utc>) -> Option<GeoipDataset> {
    let timestamp = match run_blocking(store, |s| s.geoip_source_timestamp()).await {
        Ok(ts) => ts,
        Err(WafError::NotFound(_)) => {
            debug!("No cached geoip dataset");
            return None;
        }
        Err(e) => {
            warn!("Cannot read cached geoip dataset timestamp: {}", e);
            return None;
        }
    };

    if now - timestamp >= Duration::days(MAX_CACHE_AGE_DAYS) {
        info!("Cached geoip dataset from {} is stale", timestamp);
        return None;
    }

    let cached = match run_blocking(store, |s| s.geoip_source()).await {
        Ok(cached) => cached,
        Err(e) => {
            warn!("Cannot read cached geoip dataset: {}", e);
            return None;
        }
    };
    match GeoipDataset::from_bytes(cached.source) {
        Ok(dataset) => Some(dataset),
        Err(e) => {
            warn!("Cached geoip dataset is unusable: {}", e);
            None
        }
    }
}

#[cfg(test)]
pub(crate) const TEST_MMDB: &[u8] = include_bytes!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/tests/data/test-country.mmdb"
));
