//! Distributed cache on top of a shared Redis connection.
//!
//! Entries carry an optional absolute expiration (a fixed instant) and an
//! optional sliding expiration (an inactivity window renewed on every read).
//! The store-level TTL does the evicting; the expiration fields stored next
//! to the payload let every read recompute it.
//!
//! # Storage layout
//!
//! One Redis hash per entry, at `{instance_name}{key}`:
//!
//! | Field    | Content                                              |
//! |----------|------------------------------------------------------|
//! | `absexp` | absolute expiration, ticks since 0001-01-01, or `-1` |
//! | `sldexp` | sliding window length in ticks, or `-1`              |
//! | `data`   | payload bytes                                        |
//!
//! A tick is 100 ns, which keeps the layout readable by .NET clients using
//! the same format.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use keyward_cache::{CacheEntryOptions, RedisDistributedCache};
//! use keyward_connection::RedisConnectionOptions;
//!
//! let mut options = RedisConnectionOptions::new("redis://localhost:6379");
//! options.instance_name = "web:".into();
//! let cache = RedisDistributedCache::from_options(&options)?;
//!
//! let entry = CacheEntryOptions::new().with_sliding_expiration(Duration::from_secs(600));
//! cache.set("session:42", b"...", &entry).await?;
//! let session = cache.get("session:42").await?;
//! ```

mod cache;
mod clock;
mod distributed;
pub mod expiration;
mod options;
pub mod scripts;
pub mod testing;

pub use cache::RedisDistributedCache;
pub use clock::{Clock, ManualClock, SystemClock};
pub use distributed::{DistributedCache, DistributedCacheExt};
pub use expiration::EntryExpiration;
pub use keyward_connection::StoreError;
pub use options::CacheEntryOptions;
