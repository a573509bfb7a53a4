use std::sync::Arc;
use std::time::Duration;

use keyward_connection::{ConnectionManager, Connector, RedisConnector, StoreError, blocking};
use redis::{AsyncCommands, Script};

use crate::scripts;

/// A lease on a named lock, identified by a token unique to this holder.
///
/// Dropping a `RedisLock` without calling [`release`](Self::release) is
/// safe: the key expires on its own once the expiry elapses. Releasing
/// explicitly frees the lock for other holders right away.
pub struct RedisLock<C: Connector = RedisConnector> {
    manager: Arc<ConnectionManager<C>>,
    key: String,
    token: String,
    expiry: Duration,
}

impl<C: Connector> RedisLock<C> {
    pub(crate) fn new(
        manager: Arc<ConnectionManager<C>>,
        key: String,
        token: String,
        expiry: Duration,
    ) -> Self {
        Self {
            manager,
            key,
            token,
            expiry,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Random value stored under the key while this lease is held.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Hold duration requested at acquisition (or by the last successful
    /// [`extend`](Self::extend)).
    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    /// Delete the key if it still holds this lease's token.
    ///
    /// Returns `false` when the lease already expired, was released before,
    /// or now belongs to someone else; in none of those cases is the key
    /// touched.
    pub async fn release(&self) -> Result<bool, StoreError> {
        let mut handle = self.manager.get_handle().await?;
        let released: i64 = Script::new(scripts::LOCK_RELEASE)
            .key(&self.key)
            .arg(&self.token)
            .invoke_async(&mut handle)
            .await?;

        let released = released == 1;
        tracing::debug!(key = %self.key, released, "lock release");
        Ok(released)
    }

    pub fn release_blocking(&self) -> Result<bool, StoreError> {
        blocking::block_on(self.release())?
    }

    /// Reset the key's TTL to `expiry` if this lease is still held.
    pub async fn extend(&mut self, expiry: Duration) -> Result<bool, StoreError> {
        let ttl_ms = expiry_millis(expiry)?;
        let mut handle = self.manager.get_handle().await?;
        let extended: i64 = Script::new(scripts::LOCK_EXTEND)
            .key(&self.key)
            .arg(&self.token)
            .arg(ttl_ms)
            .invoke_async(&mut handle)
            .await?;

        let extended = extended == 1;
        if extended {
            self.expiry = expiry;
        }
        tracing::debug!(key = %self.key, extended, ttl_ms, "lock extend");
        Ok(extended)
    }

    /// Whether the key currently holds this lease's token.
    pub async fn is_held(&self) -> Result<bool, StoreError> {
        let mut handle = self.manager.get_handle().await?;
        let owner: Option<String> = handle.get(&self.key).await?;
        Ok(owner.as_deref() == Some(self.token.as_str()))
    }
}

impl<C: Connector> std::fmt::Debug for RedisLock<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLock")
            .field("key", &self.key)
            .field("token", &self.token)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

/// Milliseconds for `PX`/`PEXPIRE`; zero is rejected because Redis refuses
/// a zero expiry on `SET` and would delete the key on `PEXPIRE`.
pub(crate) fn expiry_millis(expiry: Duration) -> Result<i64, StoreError> {
    let ms = i64::try_from(expiry.as_millis()).unwrap_or(i64::MAX);
    if ms == 0 {
        return Err(StoreError::invalid_argument(
            "expiry",
            "must be at least one millisecond",
        ));
    }
    Ok(ms)
}
