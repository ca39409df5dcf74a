use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use http::header::{HeaderMap, HeaderValue, ACCEPT};
use http::StatusCode;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::PrometheusConfig;
use crate::discovery::TargetResolver;
use crate::error::{CycleErrors, CycleWarning, FetchError, GatherError, ScrapeError};
use crate::model::{ScrapeTarget, TAG_ADDRESS, TAG_URL};
use crate::prometheus_scrape::Scrape;
use crate::sink::Sink;

static ACCEPT_TEXT_FORMAT: &str = "text/plain;version=0.0.4;q=1,*/*;q=0.1";

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

/// Retrieves one target's exposition body.
#[async_trait]
pub trait Fetcher: std::fmt::Debug + Send + Sync {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchResponse, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_TEXT_FORMAT));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("promgather/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<FetchResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await?;
        let status = response.status();
        let body = response.bytes().await?.to_vec();
        Ok(FetchResponse { status, body })
    }
}

/// Where a gather cycle is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Resolving,
    Scraping(usize),
    Draining,
    Done,
}

/// Outcome of one gather cycle. Partial failure is normal, `errors` holds
/// every target or source that did not fully succeed.
#[derive(Debug, Default)]
pub struct GatherReport {
    pub targets: usize,
    /// Targets that delivered a body.
    pub scraped: usize,
    pub records: usize,
    pub errors: CycleErrors,
    pub cancelled: bool,
}

impl GatherReport {
    /// All non-fatal failures as one error, if there were any.
    pub fn error(&self) -> Option<&CycleErrors> {
        if self.errors.is_empty() {
            None
        } else {
            Some(&self.errors)
        }
    }
}

#[derive(Debug, Default)]
struct TargetOutcome {
    fetched: bool,
    records: usize,
    errors: Vec<ScrapeError>,
}

/// Fetch, parse and emit for a single target.
struct TargetScrape<F, S> {
    target: ScrapeTarget,
    fetcher: Arc<F>,
    sink: Arc<S>,
    timeout: Duration,
}

impl<F: Fetcher, S: Sink> TargetScrape<F, S> {
    async fn run(self) -> TargetOutcome {
        let mut outcome = TargetOutcome::default();
        let url = self.target.url.to_string();
        tracing::debug!("scraping {}", url);

        let body = match self.fetch().await {
            Ok(body) => body,
            Err(source) => {
                tracing::warn!("error scraping {}: {}", url, source);
                outcome.errors.push(ScrapeError::Fetch { url, source });
                return outcome;
            }
        };
        outcome.fetched = true;

        let scrape = Scrape::parse(&body);
        let base_tags = self.target.base_tags();

        for record in scrape.records() {
            let mut tags = base_tags.clone();
            for (key, value) in record.tags {
                if key == TAG_URL || key == TAG_ADDRESS {
                    continue;
                }
                tags.insert(key, value);
            }

            match self
                .sink
                .add_fields(&record.measurement, record.fields, tags, record.timestamp)
            {
                Ok(()) => outcome.records += 1,
                Err(source) => outcome.errors.push(ScrapeError::Sink {
                    url: url.clone(),
                    source,
                }),
            }
        }

        if !scrape.errors.is_empty() {
            tracing::warn!("{} lines of {} could not be parsed", scrape.errors.len(), url);
        }
        outcome
            .errors
            .extend(scrape.errors.into_iter().map(|source| ScrapeError::Parse {
                url: url.clone(),
                source,
            }));

        outcome
    }

    async fn fetch(&self) -> Result<Vec<u8>, FetchError> {
        let response = tokio::time::timeout(self.timeout, self.fetcher.fetch(&self.target.url, self.timeout))
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;

        if !response.status.is_success() {
            return Err(FetchError::Status(response.status));
        }
        Ok(response.body)
    }
}

/// Runs gather cycles: resolve targets, scrape them concurrently, push the
/// records to a sink.
#[derive(Debug)]
pub struct Gatherer<F = HttpFetcher> {
    resolver: TargetResolver,
    fetcher: Arc<F>,
    timeout: Duration,
    max_concurrency: usize,
    phase: Mutex<CyclePhase>,
}

impl Gatherer {
    pub fn from_config(config: &PrometheusConfig) -> Result<Self, reqwest::Error> {
        Ok(Self::new(
            TargetResolver::from_config(config),
            HttpFetcher::new()?,
            config.response_timeout,
            config.max_concurrency,
        ))
    }
}

impl<F: Fetcher + 'static> Gatherer<F> {
    pub fn new(resolver: TargetResolver, fetcher: F, timeout: Duration, max_concurrency: usize) -> Self {
        Self {
            resolver,
            fetcher: Arc::new(fetcher),
            timeout,
            max_concurrency: max_concurrency.max(1),
            phase: Mutex::new(CyclePhase::Idle),
        }
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, next: CyclePhase) {
        let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
        tracing::trace!("gather cycle {:?} -> {:?}", *phase, next);
        *phase = next;
    }

    /// One-time setup of the discovery sources.
    pub fn start(&mut self) -> Result<(), CycleErrors> {
        self.resolver.start()
    }

    /// Run one gather cycle.
    ///
    /// Returns `Err` only when no target source is usable because of its
    /// configuration. Cancelling `cancel` stops in-flight scrapes and returns
    /// what was emitted so far.
    pub async fn gather<S: Sink + 'static>(
        &self,
        sink: Arc<S>,
        cancel: &CancellationToken,
    ) -> Result<GatherReport, GatherError> {
        let mut report = GatherReport::default();

        self.enter(CyclePhase::Resolving);
        let resolution = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                report.cancelled = true;
                self.enter(CyclePhase::Idle);
                return Ok(report);
            }
            resolution = self.resolver.resolve() => resolution?,
        };
        report.errors = resolution.errors;
        report.targets = resolution.targets.len();

        self.enter(CyclePhase::Scraping(report.targets));
        let scrapes = resolution.targets.into_iter().map(|(_, target)| {
            let scrape = TargetScrape {
                target,
                fetcher: self.fetcher.clone(),
                sink: sink.clone(),
                timeout: self.timeout,
            };
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return None;
                }
                // the spawned scrape is dropped together with its handle
                let (remote, handle) = scrape.run().remote_handle();
                tokio::spawn(remote);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    outcome = handle => Some(outcome),
                }
            }
        });

        let mut outcomes = stream::iter(scrapes).buffer_unordered(self.max_concurrency);
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Some(outcome) => {
                    report.scraped += outcome.fetched as usize;
                    report.records += outcome.records;
                    for error in outcome.errors {
                        report.errors.push(CycleWarning::Scrape(error));
                    }
                }
                None => report.cancelled = true,
            }
        }

        self.enter(CyclePhase::Draining);
        if report.cancelled {
            tracing::warn!("gather cancelled after {} records", report.records);
        }
        tracing::info!(
            "gathered {} records from {} of {} targets, {} errors",
            report.records,
            report.scraped,
            report.targets,
            report.errors.len()
        );

        self.enter(CyclePhase::Done);
        self.enter(CyclePhase::Idle);
        Ok(report)
    }
}
