//! Channel configuration and endpoint construction.

use std::time::Duration;

use url::Url;

use crate::types::OrganizationId;

/// Default base URL of the stream endpoint.
pub const DEFAULT_BASE_URL: &str = "ws://localhost:8000/api/v1";

/// Default keep-alive interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Default delay between a close and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Default keep-alive token.
pub const DEFAULT_KEEP_ALIVE_PAYLOAD: &str = "ping";

/// Configuration for a [`LiveChannel`](crate::LiveChannel).
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base URL; the endpoint is `<base>/ws/<organization_id>`.
    pub base_url: Url,
    /// Interval between keep-alive frames while open.
    pub keep_alive_interval: Duration,
    /// Literal text sent as the keep-alive frame.
    pub keep_alive_payload: String,
    /// Fixed delay before reconnecting after a close.
    pub reconnect_delay: Duration,
    /// Capacity of the subscriber broadcast buffer.
    ///
    /// Subscribers lagging further than this lose the oldest events.
    pub event_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url is valid"),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_payload: DEFAULT_KEEP_ALIVE_PAYLOAD.to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: 64,
        }
    }
}

impl ChannelConfig {
    /// Creates a configuration with default timings for `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if `base_url` is not an absolute URL that can carry
    /// path segments.
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let base_url = parse_base_url(base_url)?;
        Ok(Self { base_url, ..Self::default() })
    }

    /// Builds the stream endpoint for `organization`.
    ///
    /// The id is pushed as a single escaped path segment, so ids containing
    /// `/` or spaces cannot escape the `/ws/` prefix.
    pub fn endpoint(&self, organization: &OrganizationId) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("ws").push(organization.as_str());
        }
        url
    }
}

/// Parses and validates a base URL.
pub(crate) fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidBaseUrl(format!("{raw}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(ConfigError::InvalidBaseUrl(format!("{raw}: cannot carry a path")));
    }
    Ok(url)
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The base URL is malformed or cannot carry a path.
    #[error("invalid base url {0}")]
    InvalidBaseUrl(String),
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = ChannelConfig::default();
        assert_eq!(config.base_url.as_str(), DEFAULT_BASE_URL);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.keep_alive_payload, "ping");
    }

    #[rstest]
    #[case::plain("ws://localhost:8000/api/v1", "org-1", "ws://localhost:8000/api/v1/ws/org-1")]
    #[case::trailing_slash(
        "ws://localhost:8000/api/v1/",
        "org-1",
        "ws://localhost:8000/api/v1/ws/org-1"
    )]
    #[case::root("wss://status.example.com", "org-2", "wss://status.example.com/ws/org-2")]
    #[case::escaped("ws://h/api", "a/b c", "ws://h/api/ws/a%2Fb%20c")]
    fn test_endpoint(#[case] base: &str, #[case] org: &str, #[case] expected: &str) {
        let config = ChannelConfig::new(base).unwrap();
        let endpoint = config.endpoint(&OrganizationId::new(org).unwrap());
        assert_eq!(endpoint.as_str(), expected);
    }

    #[rstest]
    #[case::relative("/api/v1")]
    #[case::no_base("mailto:ops@example.com")]
    fn test_invalid_base(#[case] base: &str) {
        assert!(matches!(ChannelConfig::new(base), Err(ConfigError::InvalidBaseUrl(_))));
    }
}
