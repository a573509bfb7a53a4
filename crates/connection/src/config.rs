use std::time::Duration;

use serde::Deserialize;

/// Configuration for the shared Redis connection.
///
/// Everything here is fixed when the [`ConnectionManager`](crate::ConnectionManager)
/// is built; changing it requires a new manager.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConnectionOptions {
    /// Connection descriptor URL (e.g. `redis://:secret@127.0.0.1:6379/0`).
    ///
    /// Use `rediss://` for TLS and `redis+unix:///path/to.sock` for Unix
    /// sockets. Host, port, credentials and database all come from here.
    pub configuration: String,

    /// Database index overriding the one in `configuration`. A negative
    /// value, or `None`, keeps the descriptor's (or the server's) default.
    pub default_database: Option<i64>,

    /// Prefix prepended to every cache key, so several logical caches can
    /// share one store.
    pub instance_name: String,

    /// Fail on the first unsuccessful connect instead of retrying it with
    /// the [`reconnect`](Self::reconnect) policy.
    pub abort_on_connect_fail: bool,

    /// Timeout for a single connect attempt, in milliseconds.
    pub connection_timeout_ms: u64,

    /// Timeout for a command response, in milliseconds. `None` waits forever.
    pub response_timeout_ms: Option<u64>,

    /// Backoff used when (re)establishing the connection.
    pub reconnect: ReconnectPolicy,
}

impl RedisConnectionOptions {
    /// Options pointing at `url` with every other setting at its default.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            configuration: url.into(),
            ..Self::default()
        }
    }

    /// The database override, if one was configured with a valid index.
    pub fn effective_database(&self) -> Option<i64> {
        self.default_database.filter(|db| *db >= 0)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for RedisConnectionOptions {
    fn default() -> Self {
        Self {
            configuration: String::from("redis://127.0.0.1:6379"),
            default_database: None,
            instance_name: String::new(),
            abort_on_connect_fail: true,
            connection_timeout_ms: 5_000,
            response_timeout_ms: None,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Exponential backoff for connection (re)establishment.
///
/// Before the first handle exists, the delay before retry `n` (zero-based)
/// is `base_delay_ms * exponent_base^n`, clamped to `max_delay_ms`. Once
/// established, the handle reconnects through the `redis` crate, which
/// honours `max_retries`, `exponent_base` and `max_delay_ms` but always
/// starts from a one second delay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: usize,
    /// Delay multiplier, in milliseconds.
    pub base_delay_ms: u64,
    /// Growth factor applied on each successive retry.
    pub exponent_base: u64,
    /// Upper bound on a single delay, in milliseconds.
    pub max_delay_ms: Option<u64>,
}

impl ReconnectPolicy {
    /// Compute the delay for the given zero-based retry number.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use keyward_connection::ReconnectPolicy;
    ///
    /// let policy = ReconnectPolicy::default();
    /// assert_eq!(policy.delay_for(0), Duration::from_millis(100));
    /// assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let raw = self
            .exponent_base
            .saturating_pow(attempt)
            .saturating_mul(self.base_delay_ms);
        let clamped = match self.max_delay_ms {
            Some(max) => raw.min(max),
            None => raw,
        };
        Duration::from_millis(clamped)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay_ms: 100,
            exponent_base: 2,
            max_delay_ms: Some(10_000),
        }
    }
}
