//! Tunables for the client session and the reference relay.

use std::time::Duration;

use crate::error::CollabError;

/// Client-side configuration.
///
/// Defaults follow the documented protocol constants: 30s heartbeat, five
/// reconnect attempts three seconds apart, a five minute presence lease and a
/// three second cursor fade.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabConfig {
    /// WebSocket endpoint of the relay.
    pub server_url: String,
    /// Interval between heartbeat pings; also the pong deadline.
    pub heartbeat_interval: Duration,
    /// Reconnect attempts before the connection is declared lost.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Outbound messages buffered while disconnected.
    pub outbound_queue_capacity: usize,
    /// Remote presence entries expire after this long without an update.
    pub presence_timeout: Duration,
    /// Local inactivity before status drops to away.
    pub away_after: Duration,
    /// Local presence is re-announced at least this often while joined.
    pub presence_refresh_interval: Duration,
    /// Minimum spacing of activity-driven presence broadcasts.
    pub activity_broadcast_interval: Duration,
    /// Remote cursors disappear after this long without an update.
    pub cursor_fade: Duration,
    /// Minimum pointer travel (pixels) before a cursor update is sent.
    pub cursor_min_distance: f64,
    /// Minimum spacing of cursor updates.
    pub cursor_min_interval: Duration,
    /// Overlapping edits closer than this (by timestamp) conflict.
    pub conflict_window: Duration,
    /// Resolved conflicts kept locally for display.
    pub resolved_history_limit: usize,
    /// How often the async driver ticks the session.
    pub tick_interval: Duration,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:9090".to_string(),
            heartbeat_interval: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            outbound_queue_capacity: 500,
            presence_timeout: Duration::from_secs(5 * 60),
            away_after: Duration::from_secs(2 * 60),
            presence_refresh_interval: Duration::from_secs(60),
            activity_broadcast_interval: Duration::from_secs(1),
            cursor_fade: Duration::from_secs(3),
            cursor_min_distance: 5.0,
            cursor_min_interval: Duration::from_millis(50),
            conflict_window: Duration::from_secs(5),
            resolved_history_limit: 100,
            tick_interval: Duration::from_millis(50),
        }
    }
}

impl CollabConfig {
    /// Default configuration pointed at `server_url`.
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Self::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.outbound_queue_capacity = capacity;
        self
    }

    pub fn with_presence_timeout(mut self, timeout: Duration) -> Self {
        self.presence_timeout = timeout;
        self
    }

    pub fn with_away_after(mut self, after: Duration) -> Self {
        self.away_after = after;
        self
    }

    pub fn with_cursor_fade(mut self, fade: Duration) -> Self {
        self.cursor_fade = fade;
        self
    }

    pub fn with_conflict_window(mut self, window: Duration) -> Self {
        self.conflict_window = window;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Reject settings that would break the timing invariants.
    pub fn validate(&self) -> Result<(), CollabError> {
        if self.server_url.is_empty() {
            return Err(CollabError::Config("server_url is empty".into()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(CollabError::Config("heartbeat_interval must be non-zero".into()));
        }
        if self.outbound_queue_capacity == 0 {
            return Err(CollabError::Config("outbound_queue_capacity must be non-zero".into()));
        }
        if self.presence_refresh_interval >= self.presence_timeout {
            return Err(CollabError::Config(format!(
                "presence_refresh_interval ({:?}) must be shorter than presence_timeout ({:?})",
                self.presence_refresh_interval, self.presence_timeout
            )));
        }
        if self.cursor_min_distance < 0.0 {
            return Err(CollabError::Config("cursor_min_distance must not be negative".into()));
        }
        if self.tick_interval.is_zero() {
            return Err(CollabError::Config("tick_interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// Reference relay configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per document room
    pub room_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            room_capacity: 256,
        }
    }
}

impl RelayConfig {
    /// Read overrides from `HUDDLE_BIND` and `HUDDLE_ROOM_CAPACITY`.
    pub fn from_env() -> Result<Self, CollabError> {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("HUDDLE_BIND") {
            config.bind_addr = bind;
        }
        if let Ok(capacity) = std::env::var("HUDDLE_ROOM_CAPACITY") {
            config.room_capacity = capacity
                .parse()
                .map_err(|e| CollabError::Config(format!("HUDDLE_ROOM_CAPACITY: {e}")))?;
        }
        if config.room_capacity == 0 {
            return Err(CollabError::Config("room_capacity must be non-zero".into()));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_constants() {
        let config = CollabConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.presence_timeout, Duration::from_secs(300));
        assert_eq!(config.cursor_fade, Duration::from_secs(3));
        assert_eq!(config.cursor_min_distance, 5.0);
        assert_eq!(config.cursor_min_interval, Duration::from_millis(50));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = CollabConfig::new("ws://relay:1234")
            .with_reconnect(2, Duration::from_millis(10))
            .with_queue_capacity(8);
        assert_eq!(config.server_url, "ws://relay:1234");
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.reconnect_delay, Duration::from_millis(10));
        assert_eq!(config.outbound_queue_capacity, 8);
    }

    #[test]
    fn test_validate_rejects_refresh_longer_than_lease() {
        let mut config = CollabConfig::default();
        config.presence_refresh_interval = Duration::from_secs(600);
        assert!(matches!(config.validate(), Err(CollabError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_queue() {
        let config = CollabConfig::default().with_queue_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.room_capacity, 256);
    }
}
