//! Expiration bookkeeping for cache entries.
//!
//! Every entry is a Redis hash with three fields: `absexp` (absolute
//! expiration instant), `sldexp` (sliding window length) and `data`. Both
//! expiration fields are integer tick counts, 100 ns units, with instants
//! counted from 0001-01-01T00:00:00Z, the same encoding .NET uses for
//! `DateTimeOffset.Ticks`. A missing component is stored as [`NOT_PRESENT`].
//!
//! The store-level TTL on the key is what actually evicts an entry. The two
//! fields exist so that the TTL can be recomputed on every read, which is
//! what makes sliding expiration slide.

use std::time::Duration;

use chrono::{DateTime, Utc};
use keyward_connection::StoreError;

use crate::options::CacheEntryOptions;

/// Sentinel stored for an absent expiration component.
pub const NOT_PRESENT: i64 = -1;

pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Ticks between 0001-01-01 and 1970-01-01.
const UNIX_EPOCH_TICKS: i64 = 621_355_968_000_000_000;

pub fn ticks_from_datetime(at: DateTime<Utc>) -> i64 {
    at.timestamp()
        .saturating_mul(TICKS_PER_SECOND)
        .saturating_add(i64::from(at.timestamp_subsec_nanos() / 100))
        .saturating_add(UNIX_EPOCH_TICKS)
}

pub fn datetime_from_ticks(ticks: i64) -> Option<DateTime<Utc>> {
    let since_epoch = ticks.checked_sub(UNIX_EPOCH_TICKS)?;
    let secs = since_epoch.div_euclid(TICKS_PER_SECOND);
    let nanos = u32::try_from(since_epoch.rem_euclid(TICKS_PER_SECOND) * 100).ok()?;
    DateTime::from_timestamp(secs, nanos)
}

pub fn ticks_from_duration(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos() / 100).unwrap_or(i64::MAX)
}

/// Negative tick counts map to [`Duration::ZERO`].
pub fn duration_from_ticks(ticks: i64) -> Duration {
    u64::try_from(ticks).map_or(Duration::ZERO, |t| {
        Duration::from_nanos(t.saturating_mul(100))
    })
}

/// Whole seconds handed to `EXPIRE`, never less than one so that a
/// sub-second window does not delete the entry on the spot.
pub fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

/// The stored form of a [`CacheEntryOptions`], evaluated at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryExpiration {
    pub absolute: Option<DateTime<Utc>>,
    pub sliding: Option<Duration>,
    /// TTL applied to the key by the write; `None` leaves it persistent.
    pub ttl: Option<Duration>,
}

impl EntryExpiration {
    /// Resolve `options` against `now`.
    ///
    /// `absolute_expiration` wins over `absolute_expiration_relative_to_now`.
    /// The TTL is the smaller of the time left until the absolute instant and
    /// the sliding window.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidArgument`] when the absolute instant is not in the
    /// future, or a relative or sliding duration is zero.
    pub fn compute(
        options: &CacheEntryOptions,
        now: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        if let Some(at) = options.absolute_expiration {
            if at <= now {
                return Err(StoreError::invalid_argument(
                    "absolute_expiration",
                    format!("{at} must be in the future (now is {now})"),
                ));
            }
        }
        if options.absolute_expiration_relative_to_now == Some(Duration::ZERO) {
            return Err(StoreError::invalid_argument(
                "absolute_expiration_relative_to_now",
                "must be positive",
            ));
        }
        if options.sliding_expiration == Some(Duration::ZERO) {
            return Err(StoreError::invalid_argument(
                "sliding_expiration",
                "must be positive",
            ));
        }

        let absolute = match (
            options.absolute_expiration,
            options.absolute_expiration_relative_to_now,
        ) {
            (Some(at), _) => Some(at),
            (None, Some(after)) => Some(
                chrono::Duration::from_std(after)
                    .ok()
                    .and_then(|after| now.checked_add_signed(after))
                    .ok_or_else(|| {
                        StoreError::invalid_argument(
                            "absolute_expiration_relative_to_now",
                            "out of range",
                        )
                    })?,
            ),
            (None, None) => None,
        };
        let sliding = options.sliding_expiration;

        let until_absolute = absolute.map(|at| (at - now).to_std().unwrap_or(Duration::ZERO));
        let ttl = match (until_absolute, sliding) {
            (Some(a), Some(s)) => Some(a.min(s)),
            (a, s) => a.or(s),
        };

        Ok(Self {
            absolute,
            sliding,
            ttl,
        })
    }

    pub fn absolute_ticks(&self) -> i64 {
        self.absolute.map_or(NOT_PRESENT, ticks_from_datetime)
    }

    pub fn sliding_ticks(&self) -> i64 {
        self.sliding.map_or(NOT_PRESENT, ticks_from_duration)
    }

    /// Seconds for `EXPIRE`, or [`NOT_PRESENT`] for a persistent entry.
    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.map_or(NOT_PRESENT, ttl_seconds)
    }
}

/// Whether an entry with this absolute component is past its ceiling at
/// `now_ticks`. Such an entry reads as a miss even if a previous refresh
/// left its key alive for longer.
pub fn absolute_reached(absolute_ticks: i64, now_ticks: i64) -> bool {
    absolute_ticks > NOT_PRESENT && absolute_ticks <= now_ticks
}

/// TTL to re-apply when an entry is read at `now_ticks`.
///
/// Entries without a sliding component are never touched (`None`): their
/// TTL was fixed at write time and only counts down. Otherwise the result is
/// the *larger* of the sliding window and the time left until the absolute
/// instant. Components equal to [`NOT_PRESENT`] (or any negative value) are
/// treated as absent.
///
/// The `GET_AND_REFRESH` script applies the same rule server-side.
pub fn refresh_ttl(absolute_ticks: i64, sliding_ticks: i64, now_ticks: i64) -> Option<Duration> {
    if sliding_ticks <= NOT_PRESENT {
        return None;
    }
    let sliding = duration_from_ticks(sliding_ticks);
    if absolute_ticks <= NOT_PRESENT {
        return Some(sliding);
    }
    let remaining = duration_from_ticks(absolute_ticks.saturating_sub(now_ticks));
    Some(remaining.max(sliding))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("valid timestamp")
    }

    const NOW: i64 = 1_700_000_000;

    #[test]
    fn ticks_match_dotnet_encoding() {
        assert_eq!(ticks_from_datetime(at(0)), 621_355_968_000_000_000);
        // 2024-01-01T00:00:00Z
        assert_eq!(ticks_from_datetime(at(1_704_067_200)), 638_396_640_000_000_000);
    }

    #[test]
    fn ticks_round_trip_with_sub_second_precision() {
        let instant = DateTime::from_timestamp(NOW, 123_456_700).expect("valid timestamp");
        let ticks = ticks_from_datetime(instant);
        assert_eq!(datetime_from_ticks(ticks), Some(instant));
    }

    #[test]
    fn duration_ticks() {
        assert_eq!(ticks_from_duration(Duration::from_secs(5)), 50_000_000);
        assert_eq!(duration_from_ticks(50_000_000), Duration::from_secs(5));
        assert_eq!(duration_from_ticks(-10), Duration::ZERO);
    }

    #[test]
    fn no_options_means_no_ttl() {
        let exp = EntryExpiration::compute(&CacheEntryOptions::new(), at(NOW)).expect("valid");
        assert_eq!(exp.absolute_ticks(), NOT_PRESENT);
        assert_eq!(exp.sliding_ticks(), NOT_PRESENT);
        assert_eq!(exp.ttl_seconds(), NOT_PRESENT);
    }

    #[test]
    fn sliding_only() {
        let options = CacheEntryOptions::new().with_sliding_expiration(Duration::from_secs(30));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.absolute_ticks(), NOT_PRESENT);
        assert_eq!(exp.sliding_ticks(), 300_000_000);
        assert_eq!(exp.ttl_seconds(), 30);
    }

    #[test]
    fn absolute_only() {
        let options = CacheEntryOptions::new().with_absolute_expiration(at(NOW + 90));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.absolute_ticks(), ticks_from_datetime(at(NOW + 90)));
        assert_eq!(exp.sliding_ticks(), NOT_PRESENT);
        assert_eq!(exp.ttl_seconds(), 90);
    }

    #[test]
    fn relative_absolute_is_anchored_at_now() {
        let options = CacheEntryOptions::new()
            .with_absolute_expiration_relative_to_now(Duration::from_secs(45));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.absolute, Some(at(NOW + 45)));
        assert_eq!(exp.ttl_seconds(), 45);
    }

    #[test]
    fn explicit_absolute_wins_over_relative() {
        let options = CacheEntryOptions::new()
            .with_absolute_expiration(at(NOW + 20))
            .with_absolute_expiration_relative_to_now(Duration::from_secs(45));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.absolute, Some(at(NOW + 20)));
        assert_eq!(exp.ttl_seconds(), 20);
    }

    #[test]
    fn both_components_take_the_smaller_ttl() {
        let options = CacheEntryOptions::new()
            .with_absolute_expiration(at(NOW + 10))
            .with_sliding_expiration(Duration::from_secs(3));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.ttl_seconds(), 3);

        let options = CacheEntryOptions::new()
            .with_absolute_expiration(at(NOW + 2))
            .with_sliding_expiration(Duration::from_secs(60));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.ttl_seconds(), 2);
    }

    #[test]
    fn absolute_in_the_past_is_rejected() {
        for when in [at(NOW - 1), at(NOW)] {
            let options = CacheEntryOptions::new().with_absolute_expiration(when);
            let err = EntryExpiration::compute(&options, at(NOW)).expect_err("not in the future");
            assert!(matches!(
                err,
                StoreError::InvalidArgument {
                    name: "absolute_expiration",
                    ..
                }
            ));
        }
    }

    #[test]
    fn zero_durations_are_rejected() {
        let options = CacheEntryOptions::new().with_sliding_expiration(Duration::ZERO);
        assert!(EntryExpiration::compute(&options, at(NOW)).is_err());

        let options =
            CacheEntryOptions::new().with_absolute_expiration_relative_to_now(Duration::ZERO);
        assert!(EntryExpiration::compute(&options, at(NOW)).is_err());
    }

    #[test]
    fn sub_second_ttl_rounds_up_to_one_second() {
        let options = CacheEntryOptions::new().with_sliding_expiration(Duration::from_millis(300));
        let exp = EntryExpiration::compute(&options, at(NOW)).expect("valid");
        assert_eq!(exp.ttl_seconds(), 1);
    }

    #[test]
    fn absolute_ceiling() {
        let now = ticks_from_datetime(at(NOW));
        assert!(absolute_reached(now, now));
        assert!(absolute_reached(now - 1, now));
        assert!(!absolute_reached(now + 1, now));
        assert!(!absolute_reached(NOT_PRESENT, now));
    }

    #[test]
    fn refresh_ignores_absolute_only_entries() {
        let now = ticks_from_datetime(at(NOW));
        let absolute = ticks_from_datetime(at(NOW + 30));
        assert_eq!(refresh_ttl(absolute, NOT_PRESENT, now), None);
        assert_eq!(refresh_ttl(NOT_PRESENT, NOT_PRESENT, now), None);
    }

    #[test]
    fn refresh_uses_sliding_window_alone() {
        let now = ticks_from_datetime(at(NOW));
        let sliding = ticks_from_duration(Duration::from_secs(5));
        assert_eq!(
            refresh_ttl(NOT_PRESENT, sliding, now),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn refresh_takes_the_larger_remaining_duration() {
        let now = ticks_from_datetime(at(NOW));
        let sliding = ticks_from_duration(Duration::from_secs(3));

        // Eight seconds left on the absolute limit beats a three second window.
        let absolute = ticks_from_datetime(at(NOW + 8));
        assert_eq!(
            refresh_ttl(absolute, sliding, now),
            Some(Duration::from_secs(8))
        );

        // One second left: the window is larger.
        let absolute = ticks_from_datetime(at(NOW + 1));
        assert_eq!(
            refresh_ttl(absolute, sliding, now),
            Some(Duration::from_secs(3))
        );

        // Absolute instant already passed.
        let absolute = ticks_from_datetime(at(NOW - 5));
        assert_eq!(
            refresh_ttl(absolute, sliding, now),
            Some(Duration::from_secs(3))
        );
    }
}
