pub mod kube;
pub mod mesos;
pub mod static_urls;

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use async_trait::async_trait;
use url::Url;

use crate::config::{PrometheusConfig, TargetPrecedence};
use crate::error::{CycleErrors, CycleWarning, GatherError, ResolutionError};
use crate::model::ScrapeTarget;

use self::kube::KubeDiscovery;
use self::mesos::MesosDiscovery;
use self::static_urls::StaticDiscovery;

pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Targets found by one source, with the entries it had to give up on.
#[derive(Debug, Default)]
pub struct Discovered {
    pub targets: Vec<ScrapeTarget>,
    pub errors: Vec<ResolutionError>,
}

#[async_trait]
pub trait DiscoveryEngine: std::fmt::Debug + Send + Sync {
    /// Source kind, used in logs and cycle warnings.
    fn kind(&self) -> &'static str;

    /// One-time setup before the first cycle.
    fn start(&mut self) -> Result<(), ResolutionError> {
        Ok(())
    }

    /// `Err` means the whole source failed; partial failures go in [`Discovered::errors`].
    async fn find_targets(&self) -> Result<Discovered, ResolutionError>;
}

/// Targets of one cycle keyed by fetch url, plus what went wrong finding them.
#[derive(Debug, Default)]
pub struct Resolution {
    pub targets: BTreeMap<String, ScrapeTarget>,
    pub errors: CycleErrors,
}

/// Merges every configured source into one deduplicated target set.
#[derive(Debug, Default)]
pub struct TargetResolver {
    sources: Vec<Box<dyn DiscoveryEngine>>,
    precedence: TargetPrecedence,
}

impl TargetResolver {
    pub fn new(precedence: TargetPrecedence) -> Self {
        Self {
            sources: Vec::new(),
            precedence,
        }
    }

    /// Sources merge in configuration order: static urls, kubernetes services, mesos.
    pub fn from_config(config: &PrometheusConfig) -> Self {
        let mut resolver = Self::new(config.precedence);

        if !config.urls.is_empty() {
            resolver.push(StaticDiscovery::new(config.urls.clone()));
        }
        if !config.kubernetes_services.is_empty() {
            resolver.push(KubeDiscovery::new(
                config.kubernetes_services.clone(),
                config.response_timeout,
            ));
        }
        if let Some(agent_url) = &config.mesos_agent_url {
            resolver.push(MesosDiscovery::new(
                agent_url.clone(),
                config.mesos_timeout,
                config.mesos_mode,
            ));
        }

        resolver
    }

    pub fn push<D: DiscoveryEngine + 'static>(&mut self, source: D) {
        self.sources.push(Box::new(source));
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Run every source's setup. A source that fails to start still resolves,
    /// and reports its problem on each cycle.
    pub fn start(&mut self) -> Result<(), CycleErrors> {
        let mut errors = CycleErrors::default();
        for source in self.sources.iter_mut() {
            if let Err(error) = source.start() {
                tracing::warn!("{} discovery failed to start: {}", source.kind(), error);
                errors.push(CycleWarning::Resolution {
                    source_kind: source.kind(),
                    error,
                });
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Resolve all sources concurrently and merge their targets.
    ///
    /// Fails only when every configured source is unusable and at least one
    /// of them failed because of its configuration.
    pub async fn resolve(&self) -> Result<Resolution, GatherError> {
        let results =
            futures::future::join_all(self.sources.iter().map(|source| source.find_targets())).await;

        let mut resolution = Resolution::default();
        let mut usable = 0;
        let mut misconfigured = false;

        for (source, result) in self.sources.iter().zip(results) {
            let kind = source.kind();
            match result {
                Ok(discovered) => {
                    if !discovered.targets.is_empty() || discovered.errors.is_empty() {
                        usable += 1;
                    }
                    tracing::debug!(
                        "{} discovery found {} targets, {} errors",
                        kind,
                        discovered.targets.len(),
                        discovered.errors.len()
                    );
                    for error in discovered.errors {
                        misconfigured |= is_configuration_error(&error);
                        resolution.errors.push(CycleWarning::Resolution {
                            source_kind: kind,
                            error,
                        });
                    }
                    for target in discovered.targets {
                        self.merge(&mut resolution.targets, target);
                    }
                }
                Err(error) => {
                    tracing::warn!("{} discovery failed: {}", kind, error);
                    misconfigured |= is_configuration_error(&error);
                    resolution.errors.push(CycleWarning::Resolution {
                        source_kind: kind,
                        error,
                    });
                }
            }
        }

        if !self.sources.is_empty() && usable == 0 && misconfigured {
            return Err(GatherError::Configuration(resolution.errors));
        }

        Ok(resolution)
    }

    fn merge(&self, targets: &mut BTreeMap<String, ScrapeTarget>, target: ScrapeTarget) {
        match (targets.entry(target.key()), self.precedence) {
            (Entry::Vacant(v), _) => {
                v.insert(target);
            }
            (Entry::Occupied(mut e), TargetPrecedence::LastWins) => {
                e.insert(target);
            }
            (Entry::Occupied(_), TargetPrecedence::FirstWins) => {}
            (Entry::Occupied(mut e), TargetPrecedence::MergeTags) => {
                let existing = e.get_mut();
                existing.tags.extend(target.tags);
                if existing.address.is_none() {
                    existing.address = target.address;
                }
            }
        }
    }
}

fn is_configuration_error(error: &ResolutionError) -> bool {
    matches!(error, ResolutionError::InvalidUrl(_))
}

pub fn has_path(url: &Url) -> bool {
    !(url.path().is_empty() || url.path() == "/")
}

/// Point `url` at the default metrics path when it has none.
pub fn with_default_path(mut url: Url) -> Url {
    if !has_path(&url) {
        url.set_path(DEFAULT_METRICS_PATH);
    }
    url
}
