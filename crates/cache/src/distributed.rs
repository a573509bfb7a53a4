use async_trait::async_trait;
use keyward_connection::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::options::CacheEntryOptions;

/// A byte-oriented cache shared between processes.
///
/// Object safe, so callers can hold an `Arc<dyn DistributedCache>` and swap
/// the backing implementation in tests.
#[async_trait]
pub trait DistributedCache: Send + Sync {
    /// Read an entry, sliding its expiration. `None` on a miss.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        options: &CacheEntryOptions,
    ) -> Result<(), StoreError>;

    /// Slide an entry's expiration without reading its payload.
    async fn refresh(&self, key: &str) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// String and JSON conveniences over any [`DistributedCache`].
#[async_trait]
pub trait DistributedCacheExt: DistributedCache {
    /// Read an entry as UTF-8. Invalid sequences are replaced with U+FFFD.
    async fn get_string(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .get(key)
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn set_string(
        &self,
        key: &str,
        value: &str,
        options: &CacheEntryOptions,
    ) -> Result<(), StoreError> {
        self.set(key, value.as_bytes(), options).await
    }

    /// Read an entry and deserialize it from JSON.
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T>(
        &self,
        key: &str,
        value: &T,
        options: &CacheEntryOptions,
    ) -> Result<(), StoreError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, options).await
    }
}

impl<T: DistributedCache + ?Sized> DistributedCacheExt for T {}
