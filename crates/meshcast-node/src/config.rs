//! Node configuration.

use std::time::Duration;

use meshcast_protocols::{ReconnectPolicy, DEFAULT_HANDSHAKE_TIMEOUT};
use meshcast_transfer::{DeliveryConfig, DEFAULT_SEND_TIMEOUT};

use crate::error::{NodeError, Result};

/// Configuration shared by distributors and forwarders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Interval between neighbour acknowledgement flushes
    pub ack_interval: Duration,

    /// Upper bound on one chunk send; `None` waits indefinitely
    pub send_timeout: Option<Duration>,

    /// Outbound connection attempts per peer before giving up
    pub connect_attempts: u32,

    /// Delay after the first failed attempt; doubles up to 8 s
    pub connect_backoff: Duration,

    /// Relay hops a pushed block may take
    pub block_ttl: u8,

    /// How long an accepted link may stay silent before its handshake
    pub handshake_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ack_interval: Duration::from_millis(1000),
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
            connect_attempts: 1,
            connect_backoff: Duration::from_millis(250),
            block_ttl: 1,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl NodeConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Create config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(ms) = parse::<u64>(&lookup, "MESHCAST_ACK_INTERVAL_MS")? {
            if ms == 0 {
                return Err(invalid("MESHCAST_ACK_INTERVAL_MS", "0", "must be positive"));
            }
            config.ack_interval = Duration::from_millis(ms);
        }

        if let Some(ms) = parse::<u64>(&lookup, "MESHCAST_SEND_TIMEOUT_MS")? {
            config.send_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        if let Some(attempts) = parse::<u32>(&lookup, "MESHCAST_CONNECT_ATTEMPTS")? {
            if attempts == 0 {
                return Err(invalid("MESHCAST_CONNECT_ATTEMPTS", "0", "must be at least 1"));
            }
            config.connect_attempts = attempts;
        }

        if let Some(ms) = parse::<u64>(&lookup, "MESHCAST_CONNECT_BACKOFF_MS")? {
            config.connect_backoff = Duration::from_millis(ms);
        }

        if let Some(ttl) = parse::<u8>(&lookup, "MESHCAST_BLOCK_TTL")? {
            config.block_ttl = ttl;
        }

        if let Some(ms) = parse::<u64>(&lookup, "MESHCAST_HANDSHAKE_TIMEOUT_MS")? {
            if ms == 0 {
                return Err(invalid("MESHCAST_HANDSHAKE_TIMEOUT_MS", "0", "must be positive"));
            }
            config.handshake_timeout = Duration::from_millis(ms);
        }

        Ok(config)
    }

    #[must_use]
    pub fn with_ack_interval(mut self, interval: Duration) -> Self {
        self.ack_interval = interval;
        self
    }

    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.send_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_connect_attempts(mut self, attempts: u32) -> Self {
        self.connect_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_connect_backoff(mut self, backoff: Duration) -> Self {
        self.connect_backoff = backoff;
        self
    }

    #[must_use]
    pub fn with_block_ttl(mut self, ttl: u8) -> Self {
        self.block_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::default()
            .with_max_attempts(self.connect_attempts)
            .with_initial_backoff(self.connect_backoff)
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        match self.send_timeout {
            Some(timeout) => DeliveryConfig::default().with_send_timeout(timeout),
            None => DeliveryConfig::default().without_send_timeout(),
        }
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|e: T::Err| invalid(var, &value, &e.to_string()))
}

fn invalid(var: &'static str, value: &str, reason: &str) -> NodeError {
    NodeError::Config {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
