//! Shared Redis connection for keyward.
//!
//! This crate owns the lifecycle of the single Redis handle that the cache
//! and lock layers build on.
//!
//! # Features
//!
//! - **Lazy connect**: nothing touches the network until the first handle is
//!   requested.
//! - **Single flight**: concurrent first callers share one connect attempt;
//!   a failed attempt is reported to all of them and retried on next use.
//! - **Blocking and async**: every accessor has an async form and a blocking
//!   form that borrows the ambient tokio runtime.
//! - **Self-healing handle**: the first connection is retried with the
//!   delays of the configured [`ReconnectPolicy`]; the established
//!   [`redis::aio::ConnectionManager`] then reconnects on its own.
//!
//! # Example
//!
//! ```ignore
//! use keyward_connection::{ConnectionManager, RedisConnectionOptions};
//!
//! let options = RedisConnectionOptions::new("redis://localhost:6379");
//! let manager = ConnectionManager::from_options(&options)?;
//!
//! let mut handle = manager.get_handle().await?;
//! let pong: String = redis::cmd("PING").query_async(&mut handle).await?;
//! ```

mod batch;
pub mod blocking;
mod config;
mod connector;
mod error;
mod manager;
pub mod testing;

pub use batch::Batch;
pub use config::{ReconnectPolicy, RedisConnectionOptions};
pub use connector::{Connector, RedisConnector};
pub use error::StoreError;
pub use manager::ConnectionManager;
