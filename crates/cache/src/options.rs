use std::time::Duration;

use chrono::{DateTime, Utc};

/// Expiration settings for a single cache entry.
///
/// Absolute and sliding expiration are independent and may be combined; an
/// entry with neither lives until it is removed.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keyward_cache::CacheEntryOptions;
///
/// let options = CacheEntryOptions::new()
///     .with_absolute_expiration_relative_to_now(Duration::from_secs(3600))
///     .with_sliding_expiration(Duration::from_secs(300));
/// assert!(options.has_expiration());
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheEntryOptions {
    /// Wall-clock instant after which the entry is gone. Takes precedence
    /// over [`absolute_expiration_relative_to_now`](Self::absolute_expiration_relative_to_now).
    pub absolute_expiration: Option<DateTime<Utc>>,
    /// Absolute expiration expressed relative to the moment of the write.
    pub absolute_expiration_relative_to_now: Option<Duration>,
    /// Inactivity window: every read pushes expiry out by this much.
    pub sliding_expiration: Option<Duration>,
}

impl CacheEntryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_absolute_expiration(mut self, at: DateTime<Utc>) -> Self {
        self.absolute_expiration = Some(at);
        self
    }

    #[must_use]
    pub fn with_absolute_expiration_relative_to_now(mut self, after: Duration) -> Self {
        self.absolute_expiration_relative_to_now = Some(after);
        self
    }

    #[must_use]
    pub fn with_sliding_expiration(mut self, window: Duration) -> Self {
        self.sliding_expiration = Some(window);
        self
    }

    pub fn has_expiration(&self) -> bool {
        self.absolute_expiration.is_some()
            || self.absolute_expiration_relative_to_now.is_some()
            || self.sliding_expiration.is_some()
    }
}
