//! Bounded concurrency primitives used by the sync pipelines.

use std::sync::Arc;

use nested_enum_utils::common_fields;
use parking_lot::Mutex;
use snafu::{Backtrace, Snafu};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[common_fields({
    backtrace: Option<Backtrace>,
    #[snafu(implicit)]
    span_trace: n0_snafu::SpanTrace,
})]
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[non_exhaustive]
#[snafu(visibility(pub(crate)))]
pub enum PoolError {
    #[snafu(display("worker pool is closed"))]
    Closed {},
}

/// A fixed number of tokens handed out to concurrent workers.
///
/// [`WorkerPool::acquire`] waits until a token is free. The token is returned to
/// the pool when the [`PoolToken`] is dropped.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    tokens: Arc<Semaphore>,
    size: usize,
}

/// A token drawn from a [`WorkerPool`].
#[derive(Debug)]
#[must_use = "the token is released when dropped"]
pub struct PoolToken {
    _permit: OwnedSemaphorePermit,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            tokens: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of tokens not currently held by a worker.
    pub fn available(&self) -> usize {
        self.tokens.available_permits()
    }

    /// Waits for a free token.
    ///
    /// Fails once the pool was closed, including for callers already waiting.
    pub async fn acquire(&self) -> Result<PoolToken, PoolError> {
        let permit = self
            .tokens
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ClosedSnafu.build())?;
        Ok(PoolToken { _permit: permit })
    }

    /// Takes a token if one is free right now.
    pub fn try_acquire(&self) -> Option<PoolToken> {
        let permit = self.tokens.clone().try_acquire_owned().ok()?;
        Some(PoolToken { _permit: permit })
    }

    /// Disables further acquisition. Tokens already handed out stay valid.
    pub fn close(&self) {
        self.tokens.close();
    }

    pub fn is_closed(&self) -> bool {
        self.tokens.is_closed()
    }
}

/// A list shared between workers, drained in batches.
///
/// The lock is only held for the push or the drain itself.
#[derive(Debug)]
pub struct LockingList<T> {
    items: Mutex<Vec<T>>,
}

impl<T> Default for LockingList<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }
}

impl<T> LockingList<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, item: T) {
        self.items.lock().push(item);
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Removes and returns exactly `n` items, or nothing if fewer are available.
    pub fn get_batch(&self, n: usize) -> Vec<T> {
        let mut items = self.items.lock();
        if n == 0 || items.len() < n {
            return Vec::new();
        }
        items.drain(..n).collect()
    }

    /// Removes and returns everything.
    pub fn get_all(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock())
    }
}
