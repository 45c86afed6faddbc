use super::plugin::{RequestDescriptor, ScanPlugin, ScanVerdict};

/// Signature scanner slot. No signatures are loaded yet, so every request
/// passes.
#[derive(Debug, Default)]
pub struct SignaturePlugin;

impl SignaturePlugin {
    pub const NAME: &'static str = "axsi";

    pub fn new() -> Self {
        Self
    }
}

impl ScanPlugin for SignaturePlugin {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn scan(&self, _request: &RequestDescriptor) -> ScanVerdict {
        ScanVerdict::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Url;

    #[test]
    fn test_always_allows() {
        let plugin = SignaturePlugin::new();
        let request = RequestDescriptor::new(
            "10.0.0.1",
            Url::parse("http://example.com/?q=' OR 1=1 --").unwrap(),
            "GET",
        );

        assert_eq!(plugin.name(), "axsi");
        assert_eq!(plugin.scan(&request), ScanVerdict::Allow);
    }
}
