use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use url::Url;

pub type Tags = BTreeMap<String, String>;
pub type Fields = BTreeMap<String, f64>;

/// Tag carrying the url a record was scraped from.
pub const TAG_URL: &str = "url";
/// Tag carrying the resolved host of a target.
pub const TAG_ADDRESS: &str = "address";
/// Tag carrying the container a discovered target runs in.
pub const TAG_CONTAINER_ID: &str = "container_id";

/// A single endpoint to scrape during one gather cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeTarget {
    /// The url actually fetched.
    pub url: Url,
    /// The url as the user wrote it, before any resolution.
    pub original_url: String,
    /// Canonical host, when the source attaches one.
    pub address: Option<String>,
    /// Base tags attached to every record from this target.
    pub tags: Tags,
}

impl ScrapeTarget {
    pub fn key(&self) -> String {
        self.url.to_string()
    }

    /// Tags every record from this target starts with, `url` and `address` included.
    pub fn base_tags(&self) -> Tags {
        let mut tags = self.tags.clone();
        tags.insert(TAG_URL.into(), self.original_url.clone());
        if let Some(address) = &self.address {
            tags.insert(TAG_ADDRESS.into(), address.clone());
        }
        tags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricType {
    Gauge,
    Counter,
    Summary,
    Histogram,
    Untyped,
}

impl MetricType {
    /// Unknown kinds fall back to untyped.
    pub fn from_kind(kind: &str) -> Self {
        match kind {
            "gauge" => MetricType::Gauge,
            "counter" => MetricType::Counter,
            "summary" => MetricType::Summary,
            "histogram" => MetricType::Histogram,
            _ => MetricType::Untyped,
        }
    }

    /// Field name used for single value kinds.
    pub fn value_field(&self) -> &'static str {
        match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            _ => "value",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricType::Gauge => "gauge",
            MetricType::Counter => "counter",
            MetricType::Summary => "summary",
            MetricType::Histogram => "histogram",
            MetricType::Untyped => "untyped",
        };
        f.write_str(s)
    }
}

/// Structural role of a sample inside its family.
#[derive(Debug, Clone, PartialEq)]
pub enum SuffixRole {
    Value,
    /// Quantile level, kept as written in the label.
    Quantile(String),
    Sum,
    Count,
    /// Bucket upper bound, kept as written in the `le` label.
    Bucket(String),
}

impl SuffixRole {
    /// Parsed quantile level or bucket bound.
    pub fn param(&self) -> Option<f64> {
        match self {
            SuffixRole::Quantile(s) | SuffixRole::Bucket(s) => crate::prometheus_scrape::parse_float(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub labels: Tags,
    pub value: f64,
    pub timestamp_ms: Option<i64>,
    pub role: SuffixRole,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub kind: MetricType,
    pub samples: Vec<Sample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, kind: MetricType) -> Self {
        Self {
            name: name.into(),
            help: None,
            kind,
            samples: Vec::new(),
        }
    }
}

/// The unit handed to a [`Sink`](crate::sink::Sink).
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub measurement: String,
    pub tags: Tags,
    pub fields: Fields,
    pub timestamp: Option<DateTime<Utc>>,
}
