//! Bounded offloading of synchronous adapter calls.
//!
//! Every `LocalFs` call touches local storage and may block, so it runs on
//! tokio's blocking pool. A semaphore caps how many run at once; requests
//! beyond the cap wait asynchronously instead of piling up threads.

use std::sync::Arc;

use localnfs_core::{FsError, LocalFs};
use tokio::sync::Semaphore;
use tracing::error;

/// Default number of adapter calls allowed in flight.
pub const DEFAULT_BLOCKING_PERMITS: usize = 64;

#[derive(Debug, Clone)]
pub struct BlockingPool {
    fs: Arc<LocalFs>,
    permits: Arc<Semaphore>,
}

impl BlockingPool {
    pub fn new(fs: Arc<LocalFs>, permits: usize) -> Self {
        Self {
            fs,
            permits: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub fn fs(&self) -> &Arc<LocalFs> {
        &self.fs
    }

    /// Number of calls that could start right now.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `op` against the adapter on the blocking pool.
    pub async fn run<T, F>(&self, op: F) -> Result<T, FsError>
    where
        T: Send + 'static,
        F: FnOnce(&LocalFs) -> Result<T, FsError> + Send + 'static,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FsError::Io(std::io::Error::other("blocking pool closed")))?;
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn_blocking(move || op(&fs))
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "adapter task failed");
                Err(FsError::Io(std::io::Error::other(e.to_string())))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use localnfs_core::AdapterConfig;

    fn pool(permits: usize) -> (tempfile::TempDir, BlockingPool) {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFs::new(AdapterConfig::new(dir.path())).unwrap();
        (dir, BlockingPool::new(Arc::new(fs), permits))
    }

    #[tokio::test]
    async fn test_run_returns_result() {
        let (_dir, pool) = pool(2);
        let root = pool.fs().root_handle();
        let attrs = pool.run(move |fs| fs.getattr(&root)).await.unwrap();
        assert_eq!(attrs.file_id, root.file_id());
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_zero_permits_still_runs() {
        let (_dir, pool) = pool(0);
        assert_eq!(pool.available(), 1);
        let value = pool.run(|_| Ok(7)).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_many_concurrent_calls() {
        let (_dir, pool) = pool(4);
        let tasks: Vec<_> = (0..32)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.run(move |_| Ok(i * 2)).await })
            })
            .collect();
        let mut sum = 0;
        for task in tasks {
            sum += task.await.unwrap().unwrap();
        }
        assert_eq!(sum, (0..32).map(|i| i * 2).sum::<i32>());
        assert_eq!(pool.available(), 4);
    }
}
