use std::ops::{Deref, DerefMut};

use redis::{FromRedisValue, Pipeline};

use crate::blocking;
use crate::connector::Connector;
use crate::error::StoreError;
use crate::manager::ConnectionManager;

/// A group of commands sent to the server in a single round trip.
///
/// By default the server may interleave other clients' commands between
/// the batched ones; call [`atomic`](Self::atomic) to wrap the batch in
/// `MULTI`/`EXEC`. Commands are added through the underlying
/// [`redis::Pipeline`], which this type dereferences to.
pub struct Batch<'a, C: Connector> {
    manager: &'a ConnectionManager<C>,
    pipeline: Pipeline,
}

impl<'a, C: Connector> Batch<'a, C> {
    pub(crate) fn new(manager: &'a ConnectionManager<C>) -> Self {
        Self {
            manager,
            pipeline: redis::pipe(),
        }
    }

    /// Execute the batch as a `MULTI`/`EXEC` transaction.
    #[must_use]
    pub fn atomic(mut self) -> Self {
        self.pipeline.atomic();
        self
    }

    /// Send every queued command and collect the non-ignored replies.
    pub async fn execute<T: FromRedisValue>(self) -> Result<T, StoreError> {
        let mut handle = self.manager.get_handle().await?;
        Ok(self.pipeline.query_async(&mut handle).await?)
    }

    pub fn execute_blocking<T: FromRedisValue>(self) -> Result<T, StoreError> {
        blocking::block_on(self.execute())?
    }
}

impl<C: Connector> Deref for Batch<'_, C> {
    type Target = Pipeline;

    fn deref(&self) -> &Pipeline {
        &self.pipeline
    }
}

impl<C: Connector> DerefMut for Batch<'_, C> {
    fn deref_mut(&mut self) -> &mut Pipeline {
        &mut self.pipeline
    }
}
