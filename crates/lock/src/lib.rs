//! Cooperative distributed locks on a shared Redis connection.
//!
//! Locks are advisory: correctness rests entirely on Redis executing
//! `SET NX PX` and the compare-and-delete release script atomically. No
//! in-process mutex is involved, so any number of processes can contend for
//! the same key.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use keyward_lock::{LockManager, LockRetry};
//!
//! let locks = LockManager::from_options(&options)?;
//!
//! // Single attempt, manual release.
//! if let Some(lock) = locks.acquire("report:daily", Duration::from_secs(30)).await? {
//!     build_report().await?;
//!     lock.release().await?;
//! }
//!
//! // Up to three attempts, pausing a second after each failure; released
//! // even on error.
//! let outcome = locks
//!     .run_locked_with_retry(
//!         "report:daily",
//!         Duration::from_secs(30),
//!         LockRetry::new(2, Duration::from_secs(1)),
//!         || build_report(),
//!     )
//!     .await?;
//! ```

mod lock;
mod manager;
pub mod scripts;
pub mod testing;

pub use keyward_connection::StoreError;
pub use lock::RedisLock;
pub use manager::{LockManager, LockRetry};
