use std::sync::Arc;

use async_trait::async_trait;
use keyward_connection::{
    ConnectionManager, Connector, RedisConnectionOptions, RedisConnector, StoreError, blocking,
};
use redis::{AsyncCommands, Script};
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::distributed::DistributedCache;
use crate::expiration::{EntryExpiration, ticks_from_datetime};
use crate::options::CacheEntryOptions;
use crate::scripts;

/// `absexp`, `sldexp` and `data` as returned by the read script.
type EntryFields = (Option<i64>, Option<i64>, Option<Vec<u8>>);

/// Redis-backed [`DistributedCache`] with absolute and sliding expiration.
///
/// Each entry is stored as a hash under `{instance_name}{key}`. Writes and
/// reads each run as one Lua script, so a reader never sees an entry whose
/// fields and TTL disagree.
///
/// Every operation comes in three forms: async, async with a
/// [`CancellationToken`] observed before each remote call, and blocking.
pub struct RedisDistributedCache<C: Connector = RedisConnector> {
    manager: Arc<ConnectionManager<C>>,
    instance_name: String,
    clock: Arc<dyn Clock>,
    set_entry: Script,
    get_and_refresh: Script,
}

impl RedisDistributedCache<RedisConnector> {
    /// Create a cache with its own connection manager, using
    /// `options.instance_name` as the key prefix.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the descriptor cannot be parsed.
    pub fn from_options(options: &RedisConnectionOptions) -> Result<Self, StoreError> {
        let manager = Arc::new(ConnectionManager::from_options(options)?);
        Ok(Self::new(manager, options.instance_name.clone()))
    }
}

impl<C: Connector> RedisDistributedCache<C> {
    pub fn new(manager: Arc<ConnectionManager<C>>, instance_name: impl Into<String>) -> Self {
        Self {
            manager,
            instance_name: instance_name.into(),
            clock: Arc::new(SystemClock),
            set_entry: Script::new(scripts::SET_ENTRY),
            get_and_refresh: Script::new(scripts::GET_AND_REFRESH),
        }
    }

    /// Replace the wall clock used for expiration bookkeeping.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn manager(&self) -> &Arc<ConnectionManager<C>> {
        &self.manager
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(key, true, None).await
    }

    pub async fn get_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.read(key, true, Some(cancel)).await
    }

    pub fn get_blocking(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        blocking::block_on(self.get(key))?
    }

    /// Write an entry, replacing any previous value and expiration.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidArgument`] if `options` names an absolute
    /// expiration that is not in the future, or a zero duration. Nothing is
    /// sent to the store in that case.
    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &CacheEntryOptions,
    ) -> Result<(), StoreError> {
        self.write(key, value, options, None).await
    }

    pub async fn set_cancellable(
        &self,
        key: &str,
        value: &[u8],
        options: &CacheEntryOptions,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.write(key, value, options, Some(cancel)).await
    }

    pub fn set_blocking(
        &self,
        key: &str,
        value: &[u8],
        options: &CacheEntryOptions,
    ) -> Result<(), StoreError> {
        blocking::block_on(self.set(key, value, options))?
    }

    /// Slide the expiration of an entry as a read would, without
    /// transferring its payload. A missing key is not an error.
    pub async fn refresh(&self, key: &str) -> Result<(), StoreError> {
        self.read(key, false, None).await.map(drop)
    }

    pub async fn refresh_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.read(key, false, Some(cancel)).await.map(drop)
    }

    pub fn refresh_blocking(&self, key: &str) -> Result<(), StoreError> {
        blocking::block_on(self.refresh(key))?
    }

    pub async fn remove(&self, key: &str) -> Result<(), StoreError> {
        self.delete(key, None).await
    }

    pub async fn remove_cancellable(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.delete(key, Some(cancel)).await
    }

    pub fn remove_blocking(&self, key: &str) -> Result<(), StoreError> {
        blocking::block_on(self.remove(key))?
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}{key}", self.instance_name)
    }

    async fn handle(&self, cancel: Option<&CancellationToken>) -> Result<C::Handle, StoreError> {
        let handle = match cancel {
            Some(token) => self.manager.get_handle_cancellable(token).await?,
            None => self.manager.get_handle().await?,
        };
        ensure_active(cancel)?;
        Ok(handle)
    }

    async fn read(
        &self,
        key: &str,
        include_data: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let mut handle = self.handle(cancel).await?;
        let entry_key = self.entry_key(key);
        let now = ticks_from_datetime(self.clock.now());

        if include_data {
            let fields: Option<EntryFields> = self
                .get_and_refresh
                .key(&entry_key)
                .arg(now)
                .arg(1)
                .invoke_async(&mut handle)
                .await?;
            tracing::debug!(key = %entry_key, hit = fields.is_some(), "cache read");
            Ok(fields.and_then(|(_, _, data)| data))
        } else {
            let found: Option<i64> = self
                .get_and_refresh
                .key(&entry_key)
                .arg(now)
                .arg(0)
                .invoke_async(&mut handle)
                .await?;
            tracing::debug!(key = %entry_key, hit = found.is_some(), "cache refresh");
            Ok(None)
        }
    }

    async fn write(
        &self,
        key: &str,
        value: &[u8],
        options: &CacheEntryOptions,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), StoreError> {
        let expiration = EntryExpiration::compute(options, self.clock.now())?;
        let mut handle = self.handle(cancel).await?;
        let entry_key = self.entry_key(key);

        let _: i64 = self
            .set_entry
            .key(&entry_key)
            .arg(expiration.absolute_ticks())
            .arg(expiration.sliding_ticks())
            .arg(expiration.ttl_seconds())
            .arg(value)
            .invoke_async(&mut handle)
            .await?;

        tracing::debug!(
            key = %entry_key,
            ttl_seconds = expiration.ttl_seconds(),
            bytes = value.len(),
            "cache entry written"
        );
        Ok(())
    }

    async fn delete(&self, key: &str, cancel: Option<&CancellationToken>) -> Result<(), StoreError> {
        let mut handle = self.handle(cancel).await?;
        let entry_key = self.entry_key(key);
        let removed: i64 = handle.del(&entry_key).await?;
        tracing::debug!(key = %entry_key, removed, "cache entry removed");
        Ok(())
    }
}

fn ensure_active(cancel: Option<&CancellationToken>) -> Result<(), StoreError> {
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(StoreError::Cancelled);
    }
    Ok(())
}

#[async_trait]
impl<C: Connector> DistributedCache for RedisDistributedCache<C> {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        RedisDistributedCache::get(self, key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &CacheEntryOptions,
    ) -> Result<(), StoreError> {
        RedisDistributedCache::set(self, key, value, options).await
    }

    async fn refresh(&self, key: &str) -> Result<(), StoreError> {
        RedisDistributedCache::refresh(self, key).await
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        RedisDistributedCache::remove(self, key).await
    }
}

impl<C: Connector> std::fmt::Debug for RedisDistributedCache<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDistributedCache")
            .field("instance_name", &self.instance_name)
            .field("manager", &self.manager)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
