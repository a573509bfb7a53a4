//! Lazily-established Redis handle shared by every caller.
//!
//! # How It Works
//!
//! The first caller to ask for a handle starts a connect attempt; every
//! caller that arrives while the attempt is outstanding awaits the very same
//! attempt instead of starting its own. Once the attempt succeeds the handle
//! is published and all later calls return it from a read-locked fast path.
//!
//! - **Single flight**: an attempt is a [`Shared`] future tagged with a
//!   generation number. Exactly one physical connect runs per generation.
//! - **Failure**: the error is cloned to every waiter of that generation and
//!   nothing is published, so the next call starts a fresh attempt.
//! - **Cancellation**: a cancelled waiter stops *waiting*; the attempt keeps
//!   running for the remaining waiters, and if every waiter gave up the next
//!   caller resumes the same attempt rather than starting a second one.
//!
//! The guard protecting the pending attempt is a plain mutex that is never
//! held across an `.await`, so synchronous and asynchronous callers
//! interleave freely.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use redis::RedisError;
use tokio_util::sync::CancellationToken;

use crate::batch::Batch;
use crate::blocking;
use crate::config::RedisConnectionOptions;
use crate::connector::{Connector, RedisConnector};
use crate::error::StoreError;

type PendingConnect<H> = Shared<BoxFuture<'static, Result<H, Arc<RedisError>>>>;

/// An outstanding connect attempt.
struct Attempt<H> {
    generation: u64,
    future: PendingConnect<H>,
}

struct Pending<H> {
    next_generation: u64,
    attempt: Option<Attempt<H>>,
}

enum Join<H> {
    Ready(H),
    Wait(u64, PendingConnect<H>),
}

/// Owner of the single Redis handle shared by the cache and lock layers.
///
/// Cheap to share behind an [`Arc`]; safe for unlimited concurrent use.
pub struct ConnectionManager<C: Connector = RedisConnector> {
    connector: C,
    handle: RwLock<Option<C::Handle>>,
    pending: Mutex<Pending<C::Handle>>,
    disposed: AtomicBool,
}

impl ConnectionManager<RedisConnector> {
    /// Create a manager for the Redis server described by `options`.
    ///
    /// No connection is made until the first handle is requested.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Configuration`] if the descriptor cannot be parsed.
    pub fn from_options(options: &RedisConnectionOptions) -> Result<Self, StoreError> {
        Ok(Self::new(RedisConnector::new(options)?))
    }

    /// Open a dedicated pub/sub connection.
    ///
    /// Subscriptions put a connection into a mode where it can no longer
    /// serve regular commands, so this never reuses the shared handle.
    pub async fn subscriber(&self) -> Result<redis::aio::PubSub, StoreError> {
        self.get_handle().await?;
        Ok(self.connector.client().get_async_pubsub().await?)
    }

    /// Open a connection to a specific server, e.g. to run administrative
    /// commands against one node, reusing the shared credentials and TLS.
    pub async fn server(
        &self,
        host: &str,
        port: u16,
    ) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        self.get_handle().await?;
        let client = self.connector.server_client(host, port)?;
        Ok(client.get_multiplexed_async_connection().await?)
    }

    pub fn subscriber_blocking(&self) -> Result<redis::aio::PubSub, StoreError> {
        blocking::block_on(self.subscriber())?
    }

    pub fn server_blocking(
        &self,
        host: &str,
        port: u16,
    ) -> Result<redis::aio::MultiplexedConnection, StoreError> {
        blocking::block_on(self.server(host, port))?
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            handle: RwLock::new(None),
            pending: Mutex::new(Pending {
                next_generation: 0,
                attempt: None,
            }),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Return the shared handle, connecting on first use.
    pub async fn get_handle(&self) -> Result<C::Handle, StoreError> {
        self.handle_with(None).await
    }

    /// Like [`get_handle`](Self::get_handle), but stop waiting once `cancel`
    /// fires. The connect attempt itself is never aborted by a cancellation.
    pub async fn get_handle_cancellable(
        &self,
        cancel: &CancellationToken,
    ) -> Result<C::Handle, StoreError> {
        self.handle_with(Some(cancel)).await
    }

    /// Blocking form of [`get_handle`](Self::get_handle).
    ///
    /// Returns immediately once connected; otherwise blocks on the ambient
    /// tokio runtime (see [`blocking::block_on`]).
    pub fn get_handle_blocking(&self) -> Result<C::Handle, StoreError> {
        if let Some(handle) = self.published()? {
            return Ok(handle);
        }
        blocking::block_on(self.get_handle())?
    }

    /// The handle bound to the configured default database.
    pub async fn database(&self) -> Result<C::Handle, StoreError> {
        self.get_handle().await
    }

    pub fn database_blocking(&self) -> Result<C::Handle, StoreError> {
        self.get_handle_blocking()
    }

    /// Start a group of commands that is sent to the server as one unit.
    pub fn batch(&self) -> Batch<'_, C> {
        Batch::new(self)
    }

    /// Run `f` with the shared handle, connecting first if needed.
    pub async fn execute<T, F, Fut>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(C::Handle) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        let handle = self.get_handle().await?;
        Ok(f(handle).await?)
    }

    /// Whether a handle has been established and not yet disposed.
    pub fn is_connected(&self) -> bool {
        matches!(self.published(), Ok(Some(_)))
    }

    /// Drop the shared handle and refuse further use.
    ///
    /// Calling this more than once is a no-op.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        lock_pending(&self.pending).attempt = None;
        let had_handle = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        tracing::debug!(had_handle, "connection manager disposed");
    }

    fn published(&self) -> Result<Option<C::Handle>, StoreError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        Ok(self
            .handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn handle_with(
        &self,
        cancel: Option<&CancellationToken>,
    ) -> Result<C::Handle, StoreError> {
        if let Some(handle) = self.published()? {
            return Ok(handle);
        }
        if cancel.is_some_and(CancellationToken::is_cancelled) {
            return Err(StoreError::Cancelled);
        }

        let (generation, attempt) = match self.join_or_start()? {
            Join::Ready(handle) => return Ok(handle),
            Join::Wait(generation, attempt) => (generation, attempt),
        };

        let result = match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => return Err(StoreError::Cancelled),
                result = attempt => result,
            },
            None => attempt.await,
        };

        self.complete(generation, result)
    }

    /// Re-check under the guard, then join the outstanding attempt or start one.
    fn join_or_start(&self) -> Result<Join<C::Handle>, StoreError> {
        let mut pending = lock_pending(&self.pending);
        if let Some(handle) = self.published()? {
            return Ok(Join::Ready(handle));
        }

        if let Some(attempt) = &pending.attempt {
            return Ok(Join::Wait(attempt.generation, attempt.future.clone()));
        }

        let generation = pending.next_generation;
        pending.next_generation += 1;
        tracing::debug!(generation, "starting redis connect attempt");

        let future = self
            .connector
            .connect()
            .map(|result| result.map_err(Arc::new))
            .boxed()
            .shared();
        pending.attempt = Some(Attempt {
            generation,
            future: future.clone(),
        });
        Ok(Join::Wait(generation, future))
    }

    /// Publish (or discard) the outcome of `generation`. Only the first
    /// waiter to finish touches the shared state; the rest see it cleared.
    fn complete(
        &self,
        generation: u64,
        result: Result<C::Handle, Arc<RedisError>>,
    ) -> Result<C::Handle, StoreError> {
        let mut pending = lock_pending(&self.pending);
        let current = pending
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.generation == generation);

        if current {
            pending.attempt = None;
            match &result {
                Ok(handle) => {
                    if !self.disposed.load(Ordering::Acquire) {
                        *self.handle.write().unwrap_or_else(PoisonError::into_inner) =
                            Some(handle.clone());
                        tracing::info!(generation, "redis connection established");
                    }
                }
                Err(e) => {
                    tracing::warn!(generation, error = %e, "redis connect attempt failed");
                }
            }
        }
        drop(pending);

        if self.disposed.load(Ordering::Acquire) {
            return Err(StoreError::Disposed);
        }
        result.map_err(StoreError::Connect)
    }
}

impl<C: Connector> std::fmt::Debug for ConnectionManager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("connected", &self.is_connected())
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

fn lock_pending<H>(pending: &Mutex<Pending<H>>) -> std::sync::MutexGuard<'_, Pending<H>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use redis::AsyncCommands;

    use super::*;
    use crate::testing::{MemoryConnector, MemoryRedis};

    fn manager_with_delay(delay: Duration) -> Arc<ConnectionManager<MemoryConnector>> {
        let connector = MemoryConnector::new(MemoryRedis::new()).with_delay(delay);
        Arc::new(ConnectionManager::new(connector))
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_connect() {
        let manager = manager_with_delay(Duration::from_millis(200));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.get_handle().await })
            })
            .collect();

        for task in tasks {
            let handle = task.await.expect("task should not panic");
            assert!(handle.is_ok(), "every caller should receive the handle");
        }
        assert_eq!(manager.connector().attempts(), 1);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn fast_path_reuses_published_handle() {
        let manager = manager_with_delay(Duration::ZERO);
        let mut first = manager.get_handle().await.expect("connect");
        let _: () = first.set("k", "v").await.expect("set");

        let mut second = manager.get_handle().await.expect("cached handle");
        let value: Option<String> = second.get("k").await.expect("get");
        assert_eq!(value.as_deref(), Some("v"));
        assert_eq!(manager.connector().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failure_reaches_every_waiter_and_is_retried_later() {
        let manager = manager_with_delay(Duration::from_millis(100));
        manager.connector().fail_next(1);

        let results = futures::future::join_all((0..8).map(|_| manager.get_handle())).await;
        for result in results {
            let err = result.expect_err("attempt was made to fail");
            assert!(err.is_connect(), "unexpected error: {err}");
        }
        assert_eq!(manager.connector().attempts(), 1);
        assert!(!manager.is_connected());

        manager.get_handle().await.expect("second attempt succeeds");
        assert_eq!(manager.connector().attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_abort_attempt() {
        let manager = manager_with_delay(Duration::from_millis(500));
        let token = CancellationToken::new();

        let cancelled = {
            let manager = Arc::clone(&manager);
            let token = token.clone();
            tokio::spawn(async move { manager.get_handle_cancellable(&token).await })
        };
        let patient = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.get_handle().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        let err = cancelled
            .await
            .expect("task should not panic")
            .expect_err("waiter was cancelled");
        assert!(matches!(err, StoreError::Cancelled));

        patient
            .await
            .expect("task should not panic")
            .expect("remaining waiter still connects");
        assert_eq!(manager.connector().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_attempt_is_resumed_by_next_caller() {
        let manager = manager_with_delay(Duration::from_millis(500));
        let token = CancellationToken::new();

        let waiter = {
            let manager = Arc::clone(&manager);
            let token = token.clone();
            tokio::spawn(async move { manager.get_handle_cancellable(&token).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        assert!(waiter.await.expect("task should not panic").is_err());

        manager.get_handle().await.expect("resumed attempt succeeds");
        assert_eq!(manager.connector().attempts(), 1);
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let manager = manager_with_delay(Duration::ZERO);
        let token = CancellationToken::new();
        token.cancel();

        let err = manager
            .get_handle_cancellable(&token)
            .await
            .expect_err("token was already cancelled");
        assert!(matches!(err, StoreError::Cancelled));
        assert_eq!(manager.connector().attempts(), 0);
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let manager = manager_with_delay(Duration::ZERO);
        manager.get_handle().await.expect("connect");
        assert!(manager.is_connected());

        manager.dispose();
        manager.dispose();

        assert!(!manager.is_connected());
        let err = manager.get_handle().await.expect_err("manager is disposed");
        assert!(matches!(err, StoreError::Disposed));
        assert_eq!(manager.connector().attempts(), 1);
    }

    #[tokio::test]
    async fn dispose_before_connect() {
        let manager = manager_with_delay(Duration::ZERO);
        manager.dispose();
        assert!(matches!(
            manager.get_handle().await,
            Err(StoreError::Disposed)
        ));
        assert_eq!(manager.connector().attempts(), 0);
    }

    #[tokio::test]
    async fn execute_maps_command_errors() {
        let manager = manager_with_delay(Duration::ZERO);
        let err = manager
            .execute(|mut handle| async move {
                let () = handle.set("text", "abc").await?;
                handle.incr::<_, _, i64>("text", 1).await
            })
            .await
            .expect_err("incr on a non-integer fails");
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_callers_share_one_connect() {
        let manager = manager_with_delay(Duration::from_millis(50));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::task::spawn_blocking(move || manager.get_handle_blocking().map(|_| ()))
            })
            .collect();
        let async_caller = manager.get_handle().await.map(|_| ());

        for task in tasks {
            task.await
                .expect("task should not panic")
                .expect("blocking caller connects");
        }
        async_caller.expect("async caller connects");
        assert_eq!(manager.connector().attempts(), 1);
    }

    #[test]
    fn blocking_without_runtime_fails_cleanly() {
        let manager = ConnectionManager::new(MemoryConnector::new(MemoryRedis::new()));
        let err = manager
            .get_handle_blocking()
            .expect_err("no runtime available");
        assert!(matches!(err, StoreError::Runtime(_)));
        assert_eq!(manager.connector().attempts(), 0);
    }

    #[test]
    fn dedicated_connections_need_a_runtime_when_blocking() {
        let manager = ConnectionManager::from_options(&RedisConnectionOptions::new(
            "redis://127.0.0.1:6379",
        ))
        .expect("valid descriptor");

        let err = manager
            .subscriber_blocking()
            .err()
            .expect("no runtime available");
        assert!(matches!(err, StoreError::Runtime(_)));
        let err = manager
            .server_blocking("127.0.0.1", 6380)
            .expect_err("no runtime available");
        assert!(matches!(err, StoreError::Runtime(_)));
        assert!(!manager.is_connected());
    }
}
