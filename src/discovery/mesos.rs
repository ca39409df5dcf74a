use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use super::{Discovered, DiscoveryEngine, DEFAULT_METRICS_PATH};
use crate::config::MesosMode;
use crate::error::{InvalidUrlError, ResolutionError};
use crate::hostname::{extract_host, parse_url};
use crate::model::{ScrapeTarget, Tags, TAG_CONTAINER_ID};

static LABEL_METRICS_FORMAT: &str = "DCOS_METRICS_FORMAT";
static LABEL_METRICS_ENDPOINT: &str = "DCOS_METRICS_ENDPOINT";
static LABEL_METRICS_PORT_INDEX: &str = "DCOS_METRICS_PORT_INDEX";
static PROMETHEUS_FORMAT: &str = "prometheus";

static STATE_PATH: &str = "/state";
static FEDERATE_PATH: &str = "/federate";

static DEFAULT_SCRAPE_SCHEME: &str = "http";

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct AgentState {
    #[serde(default)]
    pub frameworks: Vec<Framework>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Framework {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub executors: Vec<Executor>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Executor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub container: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Task {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub discovery: Option<DiscoveryInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct DiscoveryInfo {
    #[serde(default)]
    pub ports: Ports,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Ports {
    #[serde(default)]
    pub ports: Vec<Port>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Port {
    pub number: u16,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub labels: Labels,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Labels {
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct Label {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

fn label<'a>(labels: &'a [Label], key: &str) -> Option<&'a str> {
    labels
        .iter()
        .find(|l| l.key == key)
        .map(|l| l.value.as_str())
}

impl Task {
    fn ports(&self) -> &[Port] {
        self.discovery
            .as_ref()
            .map(|d| d.ports.ports.as_slice())
            .unwrap_or(&[])
    }

    fn endpoint_path(&self, port: Option<&Port>) -> String {
        let path = port
            .and_then(|p| label(&p.labels.labels, LABEL_METRICS_ENDPOINT))
            .or_else(|| label(&self.labels, LABEL_METRICS_ENDPOINT))
            .unwrap_or(DEFAULT_METRICS_PATH);
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        }
    }

    /// Ports whose own labels declare prometheus metrics.
    fn port_label_endpoints(&self) -> Vec<(u16, String)> {
        self.ports()
            .iter()
            .filter(|p| label(&p.labels.labels, LABEL_METRICS_FORMAT) == Some(PROMETHEUS_FORMAT))
            .map(|p| (p.number, self.endpoint_path(Some(p))))
            .collect()
    }

    /// The port picked by the task's `DCOS_METRICS_PORT_INDEX` label.
    fn task_label_endpoints(&self) -> Vec<(u16, String)> {
        if label(&self.labels, LABEL_METRICS_FORMAT) != Some(PROMETHEUS_FORMAT) {
            return Vec::new();
        }
        let index = match label(&self.labels, LABEL_METRICS_PORT_INDEX).and_then(|i| i.parse::<usize>().ok()) {
            Some(index) => index,
            None => {
                tracing::debug!("task {} has no usable {}", self.id, LABEL_METRICS_PORT_INDEX);
                return Vec::new();
            }
        };
        match self.ports().get(index) {
            Some(port) => vec![(port.number, self.endpoint_path(None))],
            None => {
                tracing::debug!("task {} has no port at index {}", self.id, index);
                Vec::new()
            }
        }
    }

    fn metrics_endpoints(&self, mode: MesosMode) -> Vec<(u16, String)> {
        match mode {
            MesosMode::PortLabel => self.port_label_endpoints(),
            MesosMode::TaskLabel => self.task_label_endpoints(),
            MesosMode::Auto => {
                let endpoints = self.port_label_endpoints();
                if endpoints.is_empty() {
                    self.task_label_endpoints()
                } else {
                    endpoints
                }
            }
            MesosMode::Federate => Vec::new(),
        }
    }
}

/// Access to a Mesos agent's HTTP api.
#[async_trait]
pub trait MesosAgent: std::fmt::Debug + Send + Sync {
    async fn state(&self, agent_url: &Url, timeout: Duration) -> Result<AgentState, ResolutionError>;
}

#[derive(Debug, Default)]
pub struct HttpMesosAgent {
    client: reqwest::Client,
}

#[async_trait]
impl MesosAgent for HttpMesosAgent {
    async fn state(&self, agent_url: &Url, timeout: Duration) -> Result<AgentState, ResolutionError> {
        let url = agent_url.join(STATE_PATH).map_err(|e| InvalidUrlError::Unparsable {
            url: agent_url.to_string(),
            reason: e.to_string(),
        })?;
        let request_error = |source| ResolutionError::MesosRequest {
            url: url.to_string(),
            source,
        };

        let response = self
            .client
            .get(url.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(request_error)?;
        if !response.status().is_success() {
            return Err(ResolutionError::MesosStatus {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let body = response.bytes().await.map_err(request_error)?;
        Ok(serde_json::from_slice(&body)?)
    }
}

/// Scrape targets running on one Mesos agent.
#[derive(Debug)]
pub struct MesosDiscovery<A = HttpMesosAgent> {
    agent_url: String,
    timeout: Duration,
    mode: MesosMode,
    agent: A,
    /// Host the agent's tasks are reachable on, set by `start`.
    hostname: Option<String>,
}

impl MesosDiscovery {
    pub fn new(agent_url: String, timeout: Duration, mode: MesosMode) -> Self {
        Self::with_agent(agent_url, timeout, mode, HttpMesosAgent::default())
    }
}

impl<A: MesosAgent> MesosDiscovery<A> {
    pub fn with_agent(agent_url: String, timeout: Duration, mode: MesosMode, agent: A) -> Self {
        Self {
            agent_url,
            timeout,
            mode,
            agent,
            hostname: None,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn target(&self, hostname: &str, port: u16, path: &str, container: &str) -> Result<ScrapeTarget, InvalidUrlError> {
        let host = if hostname.contains(':') {
            format!("[{}]", hostname)
        } else {
            hostname.to_string()
        };
        let raw = format!("{}://{}:{}{}", DEFAULT_SCRAPE_SCHEME, host, port, path);
        let url = parse_url(&raw)?;

        let mut tags = Tags::new();
        tags.insert(TAG_CONTAINER_ID.into(), container.to_string());

        Ok(ScrapeTarget {
            original_url: url.to_string(),
            url,
            address: Some(hostname.to_string()),
            tags,
        })
    }

    fn federate_target(&self, agent_url: &Url, hostname: &str) -> Result<ScrapeTarget, InvalidUrlError> {
        let url = agent_url.join(FEDERATE_PATH).map_err(|e| InvalidUrlError::Unparsable {
            url: agent_url.to_string(),
            reason: e.to_string(),
        })?;
        Ok(ScrapeTarget {
            original_url: url.to_string(),
            url,
            address: Some(hostname.to_string()),
            tags: Tags::new(),
        })
    }
}

#[async_trait]
impl<A: MesosAgent> DiscoveryEngine for MesosDiscovery<A> {
    fn kind(&self) -> &'static str {
        "mesos"
    }

    fn start(&mut self) -> Result<(), ResolutionError> {
        let hostname = extract_host(&self.agent_url)?;
        tracing::info!("mesos discovery using agent host {}", hostname);
        self.hostname = Some(hostname);
        Ok(())
    }

    async fn find_targets(&self) -> Result<Discovered, ResolutionError> {
        let agent_url = parse_url(&self.agent_url)?;
        let hostname = match &self.hostname {
            Some(hostname) => hostname.clone(),
            None => extract_host(&self.agent_url)?,
        };

        let mut discovered = Discovered::default();

        if self.mode == MesosMode::Federate {
            discovered.targets.push(self.federate_target(&agent_url, &hostname)?);
            return Ok(discovered);
        }

        let state = tokio::time::timeout(self.timeout, self.agent.state(&agent_url, self.timeout))
            .await
            .map_err(|_| ResolutionError::Timeout(self.timeout))??;

        for framework in &state.frameworks {
            for executor in &framework.executors {
                for task in &executor.tasks {
                    for (port, path) in task.metrics_endpoints(self.mode) {
                        match self.target(&hostname, port, &path, &executor.container) {
                            Ok(target) => discovered.targets.push(target),
                            Err(e) => discovered.errors.push(e.into()),
                        }
                    }
                }
            }
        }

        Ok(discovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATE: &str = r#"{
        "frameworks": [{
            "id": "marathon",
            "executors": [
                {
                    "id": "web",
                    "container": "abc-123",
                    "tasks": [{
                        "id": "web.1",
                        "labels": [
                            {"key": "DCOS_METRICS_FORMAT", "value": "prometheus"},
                            {"key": "DCOS_METRICS_PORT_INDEX", "value": "1"}
                        ],
                        "discovery": {"ports": {"ports": [
                            {"number": 8080, "name": "http", "protocol": "tcp"},
                            {"number": 12345, "name": "metrics", "protocol": "tcp"}
                        ]}}
                    }]
                },
                {
                    "id": "federator",
                    "container": "xyz-123",
                    "tasks": [{
                        "id": "federator.1",
                        "discovery": {"ports": {"ports": [
                            {"number": 12345, "name": "federate", "labels": {"labels": [
                                {"key": "DCOS_METRICS_FORMAT", "value": "prometheus"},
                                {"key": "DCOS_METRICS_ENDPOINT", "value": "federate"}
                            ]}}
                        ]}}
                    }]
                },
                {
                    "id": "quiet",
                    "container": "nop-000",
                    "tasks": [{"id": "quiet.1"}]
                }
            ]
        }]
    }"#;

    #[derive(Debug)]
    struct FixedAgent(Option<AgentState>);

    #[async_trait]
    impl MesosAgent for FixedAgent {
        async fn state(&self, _agent_url: &Url, _timeout: Duration) -> Result<AgentState, ResolutionError> {
            self.0.clone().ok_or_else(|| ResolutionError::Timeout(Duration::from_millis(1)))
        }
    }

    fn discovery(mode: MesosMode, state: Option<AgentState>) -> MesosDiscovery<FixedAgent> {
        let mut discovery = MesosDiscovery::with_agent(
            "http://127.0.0.1:5051".into(),
            Duration::from_millis(100),
            mode,
            FixedAgent(state),
        );
        discovery.start().unwrap();
        discovery
    }

    fn state() -> AgentState {
        serde_json::from_str(STATE).unwrap()
    }

    fn urls(found: &Discovered) -> Vec<(&str, &str)> {
        found
            .targets
            .iter()
            .map(|t| (t.url.as_str(), t.tags[TAG_CONTAINER_ID].as_str()))
            .collect()
    }

    #[test]
    fn start_derives_hostname_once() {
        let discovery = discovery(MesosMode::Auto, None);
        assert_eq!(discovery.hostname(), Some("127.0.0.1"));
    }

    #[test]
    fn start_rejects_unexpanded_agent_url() {
        let mut discovery = MesosDiscovery::with_agent(
            "$MESOS_AGENT".into(),
            Duration::from_millis(100),
            MesosMode::Auto,
            FixedAgent(None),
        );
        assert!(matches!(discovery.start(), Err(ResolutionError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn port_labels() {
        let found = discovery(MesosMode::PortLabel, Some(state())).find_targets().await.unwrap();
        assert_eq!(urls(&found), vec![("http://127.0.0.1:12345/federate", "xyz-123")]);
    }

    #[tokio::test]
    async fn task_labels() {
        let found = discovery(MesosMode::TaskLabel, Some(state())).find_targets().await.unwrap();
        assert_eq!(urls(&found), vec![("http://127.0.0.1:12345/metrics", "abc-123")]);
        assert_eq!(found.targets[0].address.as_deref(), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn auto_accepts_both() {
        let found = discovery(MesosMode::Auto, Some(state())).find_targets().await.unwrap();
        assert_eq!(
            urls(&found),
            vec![
                ("http://127.0.0.1:12345/metrics", "abc-123"),
                ("http://127.0.0.1:12345/federate", "xyz-123"),
            ]
        );
    }

    #[tokio::test]
    async fn empty_state_has_no_targets() {
        let found = discovery(MesosMode::Auto, Some(AgentState::default()))
            .find_targets()
            .await
            .unwrap();
        assert!(found.targets.is_empty());
        assert!(found.errors.is_empty());
    }

    #[tokio::test]
    async fn federate_mode_targets_agent() {
        let found = discovery(MesosMode::Federate, None).find_targets().await.unwrap();
        assert_eq!(found.targets.len(), 1);
        assert_eq!(found.targets[0].url.as_str(), "http://127.0.0.1:5051/federate");
    }

    #[tokio::test]
    async fn agent_failure_fails_the_source() {
        let result = discovery(MesosMode::Auto, None).find_targets().await;
        assert!(result.is_err());
    }
}
