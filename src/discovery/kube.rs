use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;

use super::{with_default_path, Discovered, DiscoveryEngine};
use crate::error::{InvalidUrlError, ResolutionError};
use crate::hostname::parse_url;
use crate::model::{ScrapeTarget, Tags};

/// Name resolution used to expand service urls into per-address targets.
#[async_trait]
pub trait DnsResolver: std::fmt::Debug + Send + Sync {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>>;
}

/// Resolves through the system resolver.
#[derive(Debug, Default)]
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn lookup(&self, host: &str, port: u16) -> std::io::Result<Vec<IpAddr>> {
        let mut addresses: Vec<IpAddr> = Vec::new();
        for addr in tokio::net::lookup_host((host, port)).await? {
            if !addresses.contains(&addr.ip()) {
                addresses.push(addr.ip());
            }
        }
        Ok(addresses)
    }
}

/// Kubernetes services addressed by url, scraped on every address their
/// host name resolves to.
#[derive(Debug)]
pub struct KubeDiscovery<R = SystemResolver> {
    services: Vec<String>,
    timeout: Duration,
    resolver: R,
}

impl KubeDiscovery {
    pub fn new(services: Vec<String>, timeout: Duration) -> Self {
        Self::with_resolver(services, timeout, SystemResolver)
    }
}

impl<R: DnsResolver> KubeDiscovery<R> {
    pub fn with_resolver(services: Vec<String>, timeout: Duration, resolver: R) -> Self {
        Self {
            services,
            timeout,
            resolver,
        }
    }

    async fn service_targets(&self, raw: &str) -> Result<Vec<ScrapeTarget>, ResolutionError> {
        let url = parse_url(raw)?;
        let host = url
            .host_str()
            .ok_or_else(|| InvalidUrlError::NoHost(raw.to_string()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url.port_or_known_default().unwrap_or(80);

        let addresses = match tokio::time::timeout(self.timeout, self.resolver.lookup(&host, port)).await {
            Ok(Ok(addresses)) => addresses,
            Ok(Err(source)) => return Err(ResolutionError::Dns { host, source }),
            Err(_) => {
                return Err(ResolutionError::Dns {
                    host,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "lookup timed out"),
                })
            }
        };
        if addresses.is_empty() {
            return Err(ResolutionError::NoAddresses(host));
        }

        let mut targets = Vec::with_capacity(addresses.len());
        for address in addresses {
            let mut resolved = url.clone();
            resolved
                .set_ip_host(address)
                .map_err(|_| InvalidUrlError::BadAddress {
                    url: raw.to_string(),
                    address: address.to_string(),
                })?;

            targets.push(ScrapeTarget {
                url: with_default_path(resolved),
                original_url: raw.trim().to_string(),
                address: Some(address.to_string()),
                tags: Tags::new(),
            });
        }

        Ok(targets)
    }
}

#[async_trait]
impl<R: DnsResolver> DiscoveryEngine for KubeDiscovery<R> {
    fn kind(&self) -> &'static str {
        "kubernetes"
    }

    async fn find_targets(&self) -> Result<Discovered, ResolutionError> {
        let lookups = join_all(self.services.iter().map(|raw| self.service_targets(raw))).await;

        let mut discovered = Discovered::default();
        for (raw, result) in self.services.iter().zip(lookups) {
            match result {
                Ok(targets) => discovered.targets.extend(targets),
                Err(e) => {
                    tracing::warn!("could not resolve kubernetes service {}: {}", raw, e);
                    discovered.errors.push(e);
                }
            }
        }
        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Debug, Default)]
    struct FakeResolver(HashMap<&'static str, Vec<IpAddr>>);

    #[async_trait]
    impl DnsResolver for FakeResolver {
        async fn lookup(&self, host: &str, _port: u16) -> std::io::Result<Vec<IpAddr>> {
            self.0.get(host).cloned().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such host")
            })
        }
    }

    fn discovery(services: &[&str]) -> KubeDiscovery<FakeResolver> {
        let mut hosts = HashMap::new();
        hosts.insert(
            "metrics.monitoring.svc",
            vec!["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()],
        );
        KubeDiscovery::with_resolver(
            services.iter().map(|s| s.to_string()).collect(),
            Duration::from_secs(1),
            FakeResolver(hosts),
        )
    }

    #[tokio::test]
    async fn one_target_per_address() {
        let found = discovery(&["http://metrics.monitoring.svc:8080"])
            .find_targets()
            .await
            .unwrap();

        assert!(found.errors.is_empty());
        let urls: Vec<_> = found.targets.iter().map(|t| t.url.as_str()).collect();
        assert_eq!(
            urls,
            vec!["http://10.0.0.1:8080/metrics", "http://10.0.0.2:8080/metrics"]
        );

        let tags = found.targets[1].base_tags();
        assert_eq!(tags["url"], "http://metrics.monitoring.svc:8080");
        assert_eq!(tags["address"], "10.0.0.2");
    }

    #[tokio::test]
    async fn failed_lookup_keeps_the_rest() {
        let found = discovery(&[
            "http://random.cluster.local:88/metrics",
            "http://metrics.monitoring.svc:8080/metrics",
        ])
        .find_targets()
        .await
        .unwrap();

        assert_eq!(found.targets.len(), 2);
        assert_eq!(found.errors.len(), 1);
        assert!(matches!(found.errors[0], ResolutionError::Dns { .. }));
    }

    #[tokio::test]
    async fn system_resolver_handles_literal_addresses() {
        let addresses = SystemResolver.lookup("127.0.0.1", 80).await.unwrap();
        assert_eq!(addresses, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
