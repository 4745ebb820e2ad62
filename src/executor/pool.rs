//! Resizable pool of worker handles

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::worker::{WorkerConfig, WorkerError, WorkerFactory, WorkerHandle};

/// Identity of a pooled worker, stable for the worker's lifetime
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// A worker handle owned by the pool
pub struct PooledWorker {
    pub id: WorkerId,
    pub handle: Arc<dyn WorkerHandle>,
    initialized: AtomicBool,
}

impl PooledWorker {
    /// Initialize the worker unless an earlier workload already did.
    pub async fn ensure_initialized(&self, config: &WorkerConfig) -> Result<(), WorkerError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        self.handle.initialize(config).await?;
        self.initialized.store(true, Ordering::Release);
        debug!("Initialized {}", self.id);
        Ok(())
    }

    async fn close(&self) {
        if AssertUnwindSafe(self.handle.close())
            .catch_unwind()
            .await
            .is_err()
        {
            warn!("{} panicked while closing", self.id);
        }
    }
}

/// Live set of worker handles built by a factory
pub struct WorkerPool {
    workers: Mutex<Vec<Arc<PooledWorker>>>,
    factory: WorkerFactory,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(factory: WorkerFactory) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            factory,
            next_id: AtomicUsize::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the live workers
    pub fn workers(&self) -> Vec<Arc<PooledWorker>> {
        self.workers.lock().clone()
    }

    /// Grow or shrink to exactly `size` workers.
    ///
    /// Growing builds new handles with the factory. Shrinking keeps the first
    /// `size` workers and closes the rest. Not meant to run concurrently with
    /// itself.
    pub async fn resize(&self, size: usize) {
        let removed = {
            let mut workers = self.workers.lock();
            while workers.len() < size {
                let id = WorkerId(self.next_id.fetch_add(1, Ordering::Relaxed));
                workers.push(Arc::new(PooledWorker {
                    id,
                    handle: (self.factory)(),
                    initialized: AtomicBool::new(false),
                }));
            }
            if workers.len() > size {
                workers.split_off(size)
            } else {
                Vec::new()
            }
        };

        if !removed.is_empty() {
            debug!("Closing {} surplus workers", removed.len());
        }
        for worker in removed {
            worker.close().await;
        }
    }

    /// Apply `action` to every live worker.
    ///
    /// Concurrent mode spawns one task per worker and waits for all of them;
    /// sequential mode awaits each in turn. A failure or panic for one worker
    /// is logged and never stops the others.
    pub async fn for_each<F, Fut>(&self, action: F, concurrent: bool)
    where
        F: Fn(Arc<PooledWorker>) -> Fut,
        Fut: Future<Output = Result<(), WorkerError>> + Send + 'static,
    {
        let workers = self.workers();

        if concurrent {
            let handles: Vec<_> = workers
                .iter()
                .map(|worker| (worker.id, tokio::spawn(action(worker.clone()))))
                .collect();
            let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();

            for (id, joined) in ids.into_iter().zip(join_all(handles).await) {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("{}: {}", id, e),
                    Err(e) => warn!("{} task failed: {}", id, e),
                }
            }
        } else {
            for worker in workers {
                let id = worker.id;
                match AssertUnwindSafe(action(worker)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("{}: {}", id, e),
                    Err(_) => warn!("{} panicked", id),
                }
            }
        }
    }

    /// Close every worker and empty the pool.
    pub async fn dispose(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            worker.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::testing::FakeWorker;

    fn pool_of_fakes() -> (WorkerPool, Arc<Mutex<Vec<Arc<FakeWorker>>>>) {
        let created: Arc<Mutex<Vec<Arc<FakeWorker>>>> = Arc::new(Mutex::new(Vec::new()));
        let tracked = created.clone();
        let factory: WorkerFactory = Arc::new(move || {
            let worker = Arc::new(FakeWorker::new());
            tracked.lock().push(worker.clone());
            worker as Arc<dyn WorkerHandle>
        });
        (WorkerPool::new(factory), created)
    }

    #[tokio::test]
    async fn test_resize_grows_and_shrinks() {
        let (pool, created) = pool_of_fakes();

        pool.resize(5).await;
        assert_eq!(pool.len(), 5);

        pool.resize(2).await;
        assert_eq!(pool.len(), 2);

        let created = created.lock().clone();
        assert_eq!(created.len(), 5);
        let closes: Vec<usize> = created.iter().map(|w| w.close_count()).collect();
        assert_eq!(closes, vec![0, 0, 1, 1, 1]);
    }

    #[tokio::test]
    async fn test_resize_never_closes_twice() {
        let (pool, created) = pool_of_fakes();

        pool.resize(4).await;
        pool.resize(1).await;
        pool.resize(3).await;
        pool.resize(3).await;
        pool.dispose().await;
        pool.dispose().await;

        assert!(pool.is_empty());
        let created = created.lock().clone();
        assert_eq!(created.len(), 6);
        assert!(created.iter().all(|w| w.close_count() == 1));
    }

    #[tokio::test]
    async fn test_worker_ids_are_unique() {
        let (pool, _) = pool_of_fakes();
        pool.resize(2).await;
        pool.resize(0).await;
        pool.resize(2).await;

        let ids: Vec<WorkerId> = pool.workers().iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![WorkerId(3), WorkerId(4)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_for_each_survives_failures() {
        let (pool, created) = pool_of_fakes();
        pool.resize(4).await;

        // Idle fakes refuse to abort; the broadcast must still reach all.
        pool.for_each(|w| async move { w.handle.abort().await }, true)
            .await;
        pool.for_each(|w| async move { w.handle.abort().await }, false)
            .await;

        let created = created.lock().clone();
        assert!(created.iter().all(|w| w.abort_count() == 2));
    }

    #[tokio::test]
    async fn test_sequential_for_each_catches_panics() {
        let (pool, _) = pool_of_fakes();
        pool.resize(3).await;

        let visited = Arc::new(AtomicUsize::new(0));
        let counter = visited.clone();
        pool.for_each(
            move |w| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if w.id == WorkerId(1) {
                        panic!("first worker blew up");
                    }
                    Ok(())
                }
            },
            false,
        )
        .await;

        assert_eq!(visited.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_initialize_once() {
        let (pool, created) = pool_of_fakes();
        pool.resize(1).await;
        let worker = pool.workers().remove(0);

        let config = WorkerConfig::default();
        worker.ensure_initialized(&config).await.unwrap();
        worker.ensure_initialized(&config).await.unwrap();

        assert_eq!(created.lock()[0].initialize_count(), 1);
    }
}
