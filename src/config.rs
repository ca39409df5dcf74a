use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use structopt::StructOpt;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_MESOS_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONCURRENCY: usize = 16;

/// How tasks advertise their metrics endpoint to Mesos discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MesosMode {
    /// Accept either label style.
    Auto,
    /// `DCOS_METRICS_FORMAT` on a discovery port.
    PortLabel,
    /// `DCOS_METRICS_FORMAT` and `DCOS_METRICS_PORT_INDEX` on the task.
    TaskLabel,
    /// Scrape the agent's federate endpoint instead of the tasks.
    Federate,
}

impl Default for MesosMode {
    fn default() -> Self {
        MesosMode::Auto
    }
}

impl FromStr for MesosMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(MesosMode::Auto),
            "port-label" => Ok(MesosMode::PortLabel),
            "task-label" => Ok(MesosMode::TaskLabel),
            "federate" => Ok(MesosMode::Federate),
            other => Err(format!("unknown mesos mode {:?}", other)),
        }
    }
}

impl fmt::Display for MesosMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MesosMode::Auto => "auto",
            MesosMode::PortLabel => "port-label",
            MesosMode::TaskLabel => "task-label",
            MesosMode::Federate => "federate",
        })
    }
}

/// What happens when two sources produce a target with the same url.
/// Sources merge in order: static urls, kubernetes services, mesos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetPrecedence {
    LastWins,
    FirstWins,
    /// Keep the first target, overlay the later one's tags on it.
    MergeTags,
}

impl Default for TargetPrecedence {
    fn default() -> Self {
        TargetPrecedence::LastWins
    }
}

impl FromStr for TargetPrecedence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "last-wins" => Ok(TargetPrecedence::LastWins),
            "first-wins" => Ok(TargetPrecedence::FirstWins),
            "merge-tags" => Ok(TargetPrecedence::MergeTags),
            other => Err(format!("unknown target precedence {:?}", other)),
        }
    }
}

#[derive(StructOpt, Debug, Clone, PartialEq)]
pub struct PrometheusConfig {
    /// Static url to scrape, `/metrics` is appended when no path is given.
    #[structopt(long = "url", number_of_values = 1)]
    pub urls: Vec<String>,

    /// Kubernetes service url, scraped on every address its host resolves to.
    #[structopt(long = "kubernetes-service", number_of_values = 1)]
    pub kubernetes_services: Vec<String>,

    /// Mesos agent to discover tasks from.
    #[structopt(long)]
    pub mesos_agent_url: Option<String>,

    #[structopt(long, default_value = "1s", parse(try_from_str = humantime::parse_duration))]
    pub mesos_timeout: Duration,

    /// auto, port-label, task-label or federate.
    #[structopt(long, default_value = "auto")]
    pub mesos_mode: MesosMode,

    /// Per target scrape timeout.
    #[structopt(long, default_value = "3s", parse(try_from_str = humantime::parse_duration))]
    pub response_timeout: Duration,

    /// Targets scraped at the same time.
    #[structopt(long, default_value = "16")]
    pub max_concurrency: usize,

    /// last-wins, first-wins or merge-tags.
    #[structopt(long, default_value = "last-wins")]
    pub precedence: TargetPrecedence,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            kubernetes_services: Vec::new(),
            mesos_agent_url: None,
            mesos_timeout: DEFAULT_MESOS_TIMEOUT,
            mesos_mode: MesosMode::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            precedence: TargetPrecedence::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_matches_defaults() {
        let parsed = PrometheusConfig::from_iter_safe(&["promgather"]).unwrap();
        assert_eq!(parsed, PrometheusConfig::default());
    }

    #[test]
    fn parses_repeated_sources() {
        let parsed = PrometheusConfig::from_iter_safe(&[
            "promgather",
            "--url",
            "http://a:9100",
            "--url",
            "http://b:9100/custom",
            "--kubernetes-service",
            "http://svc.ns:8080/metrics",
            "--mesos-agent-url",
            "http://agent:5051",
            "--mesos-mode",
            "task-label",
            "--response-timeout",
            "500ms",
            "--precedence",
            "merge-tags",
        ])
        .unwrap();

        assert_eq!(parsed.urls, vec!["http://a:9100", "http://b:9100/custom"]);
        assert_eq!(parsed.kubernetes_services.len(), 1);
        assert_eq!(parsed.mesos_agent_url.as_deref(), Some("http://agent:5051"));
        assert_eq!(parsed.mesos_mode, MesosMode::TaskLabel);
        assert_eq!(parsed.response_timeout, Duration::from_millis(500));
        assert_eq!(parsed.precedence, TargetPrecedence::MergeTags);
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!("sideways".parse::<MesosMode>().is_err());
    }
}
