use std::fmt;

use thiserror::Error;

/// A configured target that cannot be turned into a url with a host.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvalidUrlError {
    #[error("empty url")]
    Empty,
    #[error("unparsable url {url:?}: {reason}")]
    Unparsable { url: String, reason: String },
    #[error("url {0:?} has no host")]
    NoHost(String),
    #[error("cannot use address {address:?} in url {url:?}")]
    BadAddress { url: String, address: String },
}

/// DNS or cluster discovery failure. Reduces the target set, never fatal on its own.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("invalid target: {0}")]
    InvalidUrl(#[from] InvalidUrlError),
    #[error("dns lookup of {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("dns lookup of {0} returned no addresses")]
    NoAddresses(String),
    #[error("mesos agent request to {url} failed: {source}")]
    MesosRequest {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("mesos agent {url} answered {status}")]
    MesosStatus { url: String, status: http::StatusCode },
    #[error("mesos agent state could not be decoded: {0}")]
    MesosState(#[from] serde_json::Error),
    #[error("mesos discovery timed out after {0:?}")]
    Timeout(std::time::Duration),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(http::StatusCode),
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Problem found while reading an exposition body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("line {line}: unterminated label set")]
    UnterminatedLabels { line: usize },
    #[error("line {line}: malformed label set: {reason}")]
    MalformedLabels { line: usize, reason: String },
    #[error("line {line}: invalid metric name {name:?}")]
    InvalidName { line: usize, name: String },
    #[error("line {line}: missing value")]
    MissingValue { line: usize },
    #[error("line {line}: non-numeric value {value:?}")]
    InvalidValue { line: usize, value: String },
    #[error("line {line}: malformed timestamp {timestamp:?}")]
    InvalidTimestamp { line: usize, timestamp: String },
    #[error("line {line}: unexpected trailing data {data:?}")]
    TrailingData { line: usize, data: String },
    #[error("line {line}: body is not valid utf-8, discarding the rest")]
    InvalidUtf8 { line: usize },
}

impl ParseError {
    /// Body-level failures stop the parse; line-level ones only skip the line.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::InvalidUtf8 { .. })
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("sink rejected record {measurement}: {reason}")]
pub struct SinkError {
    pub measurement: String,
    pub reason: String,
}

/// Why one target contributed fewer records than it could have.
#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("fetch {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: FetchError,
    },
    #[error("parse {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },
    #[error("emit {url}: {source}")]
    Sink {
        url: String,
        #[source]
        source: SinkError,
    },
}

/// Where a non-fatal problem of a cycle came from.
#[derive(Debug)]
pub enum CycleWarning {
    Resolution {
        source_kind: &'static str,
        error: ResolutionError,
    },
    Scrape(ScrapeError),
}

impl fmt::Display for CycleWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleWarning::Resolution { source_kind, error } => {
                write!(f, "{} discovery: {}", source_kind, error)
            }
            CycleWarning::Scrape(e) => write!(f, "{}", e),
        }
    }
}

/// Every non-fatal failure of one cycle, as a single error value.
#[derive(Debug, Default)]
pub struct CycleErrors(pub Vec<CycleWarning>);

impl CycleErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, warning: CycleWarning) {
        self.0.push(warning);
    }

    pub fn iter(&self) -> impl Iterator<Item = &CycleWarning> {
        self.0.iter()
    }
}

impl fmt::Display for CycleErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) during gather", self.0.len())?;
        for warning in &self.0 {
            write!(f, "; {}", warning)?;
        }
        Ok(())
    }
}

impl std::error::Error for CycleErrors {}

/// Cycle-level failure: no usable target source at all.
#[derive(Error, Debug)]
pub enum GatherError {
    #[error("no usable target source: {0}")]
    Configuration(CycleErrors),
}
