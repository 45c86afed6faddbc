use crate::error::WafError;
use reqwest::Url;
use serde::Deserialize;
use std::net::IpAddr;

/// Normalized request handed over by the ingestion layer.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub remote_addr: String,
    pub url: Url,
    pub method: String,
}

impl RequestDescriptor {
    pub fn new(remote_addr: impl Into<String>, url: Url, method: impl Into<String>) -> Self {
        Self {
            remote_addr: remote_addr.into(),
            url,
            method: method.into(),
        }
    }

    /// `None` when the remote address is not a textual IP.
    pub fn remote_ip(&self) -> Option<IpAddr> {
        self.remote_addr.parse().ok()
    }

    /// Host with the port when one is present, as `host:port`.
    pub fn url_host(&self) -> String {
        let host = self.url.host_str().unwrap_or("");
        match self.url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        }
    }
}

/// Wire form of a [`RequestDescriptor`].
#[derive(Debug, Clone, Deserialize)]
pub struct RequestPayload {
    pub remote_addr: String,
    pub url: String,
    pub method: String,
}

impl TryFrom<RequestPayload> for RequestDescriptor {
    type Error = WafError;

    fn try_from(payload: RequestPayload) -> Result<Self, Self::Error> {
        let url = Url::parse(&payload.url)
            .map_err(|e| WafError::InvalidArgument(format!("bad url '{}': {}", payload.url, e)))?;
        Ok(Self {
            remote_addr: payload.remote_addr,
            url,
            method: payload.method,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanVerdict {
    Allow,
    Block,
}

/// A scanning strategy. `name()` is both the registry key and the suffix of
/// its `plugin_<name>` toggle.
pub trait ScanPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn scan(&self, request: &RequestDescriptor) -> ScanVerdict;
}
