use async_trait::async_trait;

use super::{has_path, with_default_path, Discovered, DiscoveryEngine, DEFAULT_METRICS_PATH};
use crate::error::ResolutionError;
use crate::hostname::parse_url;
use crate::model::{ScrapeTarget, Tags};

/// Targets listed verbatim in the configuration.
#[derive(Debug)]
pub struct StaticDiscovery {
    urls: Vec<String>,
}

impl StaticDiscovery {
    pub fn new(urls: Vec<String>) -> Self {
        Self { urls }
    }

    fn target(raw: &str) -> Result<ScrapeTarget, ResolutionError> {
        let parsed = parse_url(raw)?;
        let raw = raw.trim();
        // the tag keeps the url as configured, default port and case included
        let original_url = if has_path(&parsed) {
            raw.to_string()
        } else if parsed.query().is_none() && parsed.fragment().is_none() {
            format!("{}{}", raw.trim_end_matches('/'), DEFAULT_METRICS_PATH)
        } else {
            with_default_path(parsed.clone()).to_string()
        };
        Ok(ScrapeTarget {
            original_url,
            url: with_default_path(parsed),
            address: None,
            tags: Tags::new(),
        })
    }
}

#[async_trait]
impl DiscoveryEngine for StaticDiscovery {
    fn kind(&self) -> &'static str {
        "static"
    }

    async fn find_targets(&self) -> Result<Discovered, ResolutionError> {
        let mut discovered = Discovered::default();
        for raw in &self.urls {
            match Self::target(raw) {
                Ok(target) => discovered.targets.push(target),
                Err(e) => {
                    tracing::warn!("skipping static url {:?}: {}", raw, e);
                    discovered.errors.push(e);
                }
            }
        }
        Ok(discovered)
    }
}
