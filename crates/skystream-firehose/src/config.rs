//! Firehose client configuration.

use std::time::Duration;

use backoff::ExponentialBackoff;

use crate::FirehoseError;

/// Default relay URL (Bluesky relay).
pub const DEFAULT_RELAY_URL: &str = "wss://bsky.network";

/// Repository event stream method.
pub const SUBSCRIBE_REPOS: &str = "com.atproto.sync.subscribeRepos";

/// Configuration for a [`FirehoseClient`](crate::FirehoseClient).
#[derive(Debug, Clone)]
pub struct FirehoseConfig {
    /// Relay WebSocket base URL (`wss://...`).
    pub relay_url: String,
    /// Namespaced method identifier of the stream endpoint.
    pub method: String,
    /// Reconnect automatically after transport failures.
    pub auto_reconnect: bool,
    /// Consecutive transport failures tolerated before giving up.
    pub retry_budget: u32,
    /// First backoff interval between reconnection attempts.
    pub initial_backoff: Duration,
    /// Upper bound on the backoff interval.
    pub max_backoff: Duration,
    /// No message for this long is treated as a dead connection.
    pub read_timeout: Duration,
    /// Depth of the event sink channel.
    pub sink_capacity: usize,
    /// Enumerate relay repositories over HTTP after an `OutdatedCursor`
    /// notice (requires a fetch capability).
    pub backfill_on_outdated_cursor: bool,
    /// Page limit for out-of-band backfill.
    pub backfill_max_pages: usize,
}

impl Default for FirehoseConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            method: SUBSCRIBE_REPOS.to_string(),
            auto_reconnect: true,
            retry_budget: 10,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            read_timeout: Duration::from_secs(300),
            sink_capacity: 1000,
            backfill_on_outdated_cursor: false,
            backfill_max_pages: 100,
        }
    }
}

impl FirehoseConfig {
    /// Configuration for the given relay with defaults elsewhere.
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ..Default::default()
        }
    }

    /// Set the stream method identifier.
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Enable or disable automatic reconnection.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the consecutive failure budget.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Set the backoff bounds.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the sink channel depth.
    pub fn with_sink_capacity(mut self, capacity: usize) -> Self {
        self.sink_capacity = capacity;
        self
    }

    /// Enable out-of-band backfill after `OutdatedCursor`.
    pub fn with_outdated_cursor_backfill(mut self, max_pages: usize) -> Self {
        self.backfill_on_outdated_cursor = true;
        self.backfill_max_pages = max_pages;
        self
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<(), FirehoseError> {
        if !(self.relay_url.starts_with("wss://") || self.relay_url.starts_with("ws://")) {
            return Err(FirehoseError::InvalidConfig(format!(
                "relay URL must use ws:// or wss://, got {}",
                self.relay_url
            )));
        }
        if self.method.is_empty() {
            return Err(FirehoseError::InvalidConfig(
                "method identifier is empty".to_string(),
            ));
        }
        if self.sink_capacity == 0 {
            return Err(FirehoseError::InvalidConfig(
                "sink capacity must be at least 1".to_string(),
            ));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(FirehoseError::InvalidConfig(
                "initial backoff exceeds max backoff".to_string(),
            ));
        }
        Ok(())
    }

    /// Stream URL, with the cursor as a query parameter when set.
    pub fn stream_url(&self, cursor: Option<i64>) -> String {
        let base = self.relay_url.trim_end_matches('/');
        match cursor {
            Some(cursor) => format!("{}/xrpc/{}?cursor={}", base, self.method, cursor),
            None => format!("{}/xrpc/{}", base, self.method),
        }
    }

    /// Fresh backoff schedule for a reconnection episode.
    pub(crate) fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            max_elapsed_time: None, // bounded by retry_budget instead
            ..Default::default()
        }
    }
}

/// Derive a relay WebSocket URL from an HTTP host URL.
///
/// Converts `https://pds.example.com` to `wss://pds.example.com`.
pub fn stream_url_for_host(host_url: &str) -> String {
    host_url
        .replace("https://", "wss://")
        .replace("http://", "ws://")
}

/// Derive the HTTP host URL for a relay WebSocket URL.
pub fn http_url_for_relay(relay_url: &str) -> String {
    relay_url
        .replace("wss://", "https://")
        .replace("ws://", "http://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relay_url() {
        assert_eq!(DEFAULT_RELAY_URL, "wss://bsky.network");
        assert_eq!(FirehoseConfig::default().method, SUBSCRIBE_REPOS);
    }

    #[test]
    fn test_stream_url_without_cursor() {
        let config = FirehoseConfig::new("wss://relay.example.com/");
        assert_eq!(
            config.stream_url(None),
            "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos"
        );
    }

    #[test]
    fn test_stream_url_with_cursor() {
        let config = FirehoseConfig::new("wss://relay.example.com");
        assert_eq!(
            config.stream_url(Some(12345)),
            "wss://relay.example.com/xrpc/com.atproto.sync.subscribeRepos?cursor=12345"
        );
    }

    #[test]
    fn test_stream_url_custom_method() {
        let config = FirehoseConfig::new("ws://localhost:2470")
            .with_method("com.atproto.label.subscribeLabels");
        assert_eq!(
            config.stream_url(Some(0)),
            "ws://localhost:2470/xrpc/com.atproto.label.subscribeLabels?cursor=0"
        );
    }

    #[test]
    fn test_validate() {
        assert!(FirehoseConfig::default().validate().is_ok());
        assert!(FirehoseConfig::new("https://bsky.network").validate().is_err());
        assert!(
            FirehoseConfig::default()
                .with_sink_capacity(0)
                .validate()
                .is_err()
        );
        assert!(
            FirehoseConfig::default()
                .with_backoff(Duration::from_secs(10), Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_url_conversions() {
        assert_eq!(
            stream_url_for_host("https://pds.example.com"),
            "wss://pds.example.com"
        );
        assert_eq!(stream_url_for_host("http://localhost:2583"), "ws://localhost:2583");
        assert_eq!(http_url_for_relay("wss://bsky.network"), "https://bsky.network");
    }
}
