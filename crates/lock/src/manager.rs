//! Acquisition of named locks and the "acquire, run, release" helpers.
//!
//! A lock is a plain Redis string `key = token` created with
//! `SET key token NX PX expiry`. Only the holder of the token can release or
//! extend it, which the Lua scripts in [`scripts`](crate::scripts) check
//! atomically. Failing to acquire is not an error: it is reported as `None`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use keyward_connection::{
    ConnectionManager, Connector, RedisConnectionOptions, RedisConnector, StoreError, blocking,
};

use crate::lock::{RedisLock, expiry_millis};

/// How often [`LockManager::run_locked_with_retry`] tries again after the
/// first failed acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockRetry {
    /// Additional attempts after the first; `0` means a single attempt.
    pub count: u32,
    /// Pause after each failed attempt. A zero interval retries immediately.
    pub interval: Duration,
}

impl LockRetry {
    pub fn new(count: u32, interval: Duration) -> Self {
        Self { count, interval }
    }

    /// Retry `count` times without pausing.
    pub fn immediate(count: u32) -> Self {
        Self::new(count, Duration::ZERO)
    }
}

/// Hands out [`RedisLock`]s over a shared connection.
pub struct LockManager<C: Connector = RedisConnector> {
    manager: Arc<ConnectionManager<C>>,
}

impl LockManager<RedisConnector> {
    /// Create a lock manager with its own connection manager.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the descriptor cannot be parsed.
    pub fn from_options(options: &RedisConnectionOptions) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(ConnectionManager::from_options(options)?)))
    }
}

impl<C: Connector> LockManager<C> {
    pub fn new(manager: Arc<ConnectionManager<C>>) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<C>> {
        &self.manager
    }

    /// Try once to take `key` for `expiry`.
    ///
    /// Returns `None` when someone else holds the key. There is no retry at
    /// this level; see [`run_locked_with_retry`](Self::run_locked_with_retry).
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidArgument`] for an expiry under one millisecond,
    /// and any connection or command failure.
    pub async fn acquire(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<Option<RedisLock<C>>, StoreError> {
        let ttl_ms = expiry_millis(expiry)?;
        let token = uuid::Uuid::new_v4().simple().to_string();

        let mut handle = self.manager.get_handle().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut handle)
            .await?;

        if reply.is_none() {
            tracing::debug!(key, "lock contended");
            return Ok(None);
        }
        tracing::debug!(key, ttl_ms, "lock acquired");
        Ok(Some(RedisLock::new(
            Arc::clone(&self.manager),
            key.to_owned(),
            token,
            expiry,
        )))
    }

    pub fn acquire_blocking(
        &self,
        key: &str,
        expiry: Duration,
    ) -> Result<Option<RedisLock<C>>, StoreError> {
        blocking::block_on(self.acquire(key, expiry))?
    }

    /// Take `key`, run `action`, then release the lock.
    ///
    /// Returns `Ok(None)` without running `action` if the lock is held
    /// elsewhere. Otherwise the lock is released whether `action` succeeds,
    /// fails or panics; a panic resumes once the release is done.
    ///
    /// An error from `action` takes precedence over a failed release, which
    /// is then only logged.
    pub async fn run_locked<T, E, F, Fut>(
        &self,
        key: &str,
        expiry: Duration,
        action: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        match self.acquire(key, expiry).await? {
            Some(lock) => run_then_release(lock, action).await.map(Some),
            None => Ok(None),
        }
    }

    /// [`run_locked`](Self::run_locked) with up to `retry.count` further
    /// acquisition attempts.
    ///
    /// Every failed attempt, the last one included, is followed by a pause
    /// of `retry.interval`. The first successful acquisition runs `action`
    /// and returns its outcome; a failing `action` is not retried.
    /// `Ok(None)` once every attempt found the lock taken.
    pub async fn run_locked_with_retry<T, E, F, Fut>(
        &self,
        key: &str,
        expiry: Duration,
        retry: LockRetry,
        action: F,
    ) -> Result<Option<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<StoreError>,
    {
        for _ in 0..=retry.count {
            if let Some(lock) = self.acquire(key, expiry).await? {
                return run_then_release(lock, action).await.map(Some);
            }
            if !retry.interval.is_zero() {
                tokio::time::sleep(retry.interval).await;
            }
        }
        tracing::debug!(key, attempts = retry.count + 1, "lock not acquired");
        Ok(None)
    }
}

impl<C: Connector> std::fmt::Debug for LockManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("manager", &self.manager)
            .finish()
    }
}

async fn run_then_release<C, T, E, F, Fut>(lock: RedisLock<C>, action: F) -> Result<T, E>
where
    C: Connector,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: From<StoreError>,
{
    let outcome = AssertUnwindSafe(async { action().await })
        .catch_unwind()
        .await;
    let released = lock.release().await;

    let result = match outcome {
        Ok(result) => result,
        Err(panic) => {
            if let Err(e) = &released {
                tracing::warn!(key = lock.key(), error = %e, "lock release failed after panic");
            }
            std::panic::resume_unwind(panic);
        }
    };

    match (result, released) {
        (Ok(value), Ok(true)) => Ok(value),
        (Ok(value), Ok(false)) => {
            tracing::warn!(key = lock.key(), "lock expired before release");
            Ok(value)
        }
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), Ok(_)) => Err(e),
        (Err(e), Err(release_error)) => {
            tracing::warn!(key = lock.key(), error = %release_error, "lock release failed");
            Err(e)
        }
    }
}
