use url::Url;

use crate::error::InvalidUrlError;

/// Parse `raw` as an absolute url and require a host component.
pub fn parse_url(raw: &str) -> Result<Url, InvalidUrlError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(InvalidUrlError::Empty);
    }

    let url = Url::parse(raw).map_err(|e| InvalidUrlError::Unparsable {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(url),
        _ => Err(InvalidUrlError::NoHost(raw.to_string())),
    }
}

/// Host of `raw` without port, e.g. `some-agent.example.com` for
/// `http://some-agent.example.com:5051/`.
pub fn extract_host(raw: &str) -> Result<String, InvalidUrlError> {
    let url = parse_url(raw)?;
    match url.host() {
        Some(url::Host::Ipv6(addr)) => Ok(addr.to_string()),
        Some(host) => Ok(host.to_string()),
        None => Err(InvalidUrlError::NoHost(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_host_without_port() {
        let good = [
            ("http://localhost", "localhost"),
            ("http://localhost:9090", "localhost"),
            ("http://192.168.2.2", "192.168.2.2"),
            ("http://192.168.2.2:9090", "192.168.2.2"),
            ("https://192.168.2.2", "192.168.2.2"),
            ("http://some-agent.testing.example.com/", "some-agent.testing.example.com"),
            ("http://[::1]:5051", "::1"),
        ];
        for (input, expected) in good.iter() {
            assert_eq!(extract_host(input).unwrap(), *expected, "input {}", input);
        }
    }

    #[test]
    fn rejects_empty_and_hostless() {
        for input in ["$UNPARSED_ENVIRONMENT_VARIABLE", "", "   ", "unix:/run/agent.sock"].iter() {
            assert!(extract_host(input).is_err(), "input {:?}", input);
        }
        assert_eq!(extract_host(""), Err(InvalidUrlError::Empty));
    }
}
