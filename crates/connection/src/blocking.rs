//! Bridge from synchronous callers to the async connection.
//!
//! The multiplexed Redis connection is driven by the tokio runtime it was
//! created on, so blocking calls borrow that runtime rather than starting
//! their own. They must run on a multi-threaded runtime worker, a
//! `spawn_blocking` thread, or any thread that has entered such a runtime.

use std::future::Future;

use tokio::runtime::{Handle, RuntimeFlavor};

use crate::error::StoreError;

/// Run `future` to completion, blocking the current thread.
///
/// # Errors
///
/// Returns [`StoreError::Runtime`] when no tokio runtime is reachable from
/// this thread or when it is a current-thread runtime, which cannot make
/// progress while its only thread is blocked.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, StoreError> {
    let handle = Handle::try_current().map_err(|e| StoreError::Runtime(e.to_string()))?;
    if handle.runtime_flavor() == RuntimeFlavor::CurrentThread {
        return Err(StoreError::Runtime(
            "blocking calls require a multi-threaded tokio runtime".to_owned(),
        ));
    }
    Ok(tokio::task::block_in_place(|| handle.block_on(future)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fails_without_runtime() {
        let err = block_on(async { 1 }).expect_err("no runtime is entered");
        assert!(matches!(err, StoreError::Runtime(_)));
    }

    #[tokio::test]
    async fn fails_on_current_thread_runtime() {
        let err = block_on(async { 1 }).expect_err("current-thread runtime");
        assert!(matches!(err, StoreError::Runtime(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_from_spawn_blocking() {
        let value = tokio::task::spawn_blocking(|| block_on(async { 41 + 1 }))
            .await
            .expect("blocking task should not panic")
            .expect("runtime is multi-threaded");
        assert_eq!(value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_on_worker_thread() {
        let value = block_on(async {
            tokio::task::yield_now().await;
            "done"
        })
        .expect("runtime is multi-threaded");
        assert_eq!(value, "done");
    }
}
