//! Small fixed-size pool for model inference and index work.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;
use tracing::{Instrument, Span, error};

use crate::error::{RagError, Result};

/// A bounded set of worker slots.
///
/// CPU-bound work (local inference, index scans, snapshot encoding) goes
/// through [`run`](WorkerPool::run) and executes on tokio's blocking threads,
/// so the async scheduler is never stalled by it. Network-bound futures go
/// through [`spawn`](WorkerPool::spawn). Either way at most `size` jobs run at
/// once. The workload is memory-bound, so the pool is deliberately small: two
/// concurrent model invocations already double peak memory.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool with `size` worker slots (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self { permits: Arc::new(Semaphore::new(size)), size }
    }

    /// Number of worker slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| RagError::PipelineError("worker pool is closed".to_string()))
    }

    /// Run blocking `work` on a worker slot and wait for its result.
    ///
    /// The closure runs on a blocking thread inside the caller's span. The
    /// slot is held until it returns, even if the caller stops waiting.
    ///
    /// # Errors
    ///
    /// Returns the closure's own error, or [`RagError::PipelineError`] if it
    /// panicked.
    pub async fn run<F, T>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        let span = Span::current();
        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            span.in_scope(work)
        });
        handle.await.map_err(worker_failed)?
    }

    /// Run an I/O-bound `task` on a worker slot and wait for its result.
    ///
    /// # Errors
    ///
    /// Returns the task's own error, or [`RagError::PipelineError`] if the
    /// task panicked.
    pub async fn spawn<F, T>(&self, task: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire().await?;
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                task.await
            }
            .in_current_span(),
        );
        handle.await.map_err(worker_failed)?
    }
}

fn worker_failed(e: JoinError) -> RagError {
    error!(error = %e, "worker task failed");
    RagError::PipelineError(format!("worker task failed: {e}"))
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn never_exceeds_size() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..6).map(|_| {
            let running = running.clone();
            let peak = peak.clone();
            let pool = pool.clone();
            async move {
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }
        });
        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn propagates_task_errors() {
        let pool = WorkerPool::new(1);
        let err = pool
            .spawn(async { Err::<(), _>(RagError::PipelineError("boom".to_string())) })
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::PipelineError(message) if message == "boom"));
    }

    #[tokio::test]
    async fn blocking_work_bounded_by_size() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let jobs = (0..6).map(|i| {
            let running = running.clone();
            let peak = peak.clone();
            let pool = pool.clone();
            async move {
                pool.run(move || {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(i * 2)
                })
                .await
            }
        });
        let results: Vec<usize> =
            futures::future::join_all(jobs).await.into_iter().map(|r| r.unwrap()).collect();

        assert_eq!(results, vec![0, 2, 4, 6, 8, 10]);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_work_leaves_scheduler_free() {
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let ticker = tokio::spawn(async move {
            started_rx.await.unwrap();
            release_tx.send(()).unwrap();
        });

        let pool = WorkerPool::new(1);
        let released = pool
            .run(move || {
                let _ = started_tx.send(());
                Ok(release_rx.recv_timeout(Duration::from_secs(5)).is_ok())
            })
            .await
            .unwrap();

        assert!(released, "scheduler was blocked while the job ran");
        ticker.await.unwrap();
    }

    #[tokio::test]
    async fn panicking_job_is_a_pipeline_error() {
        let pool = WorkerPool::new(1);
        let err = pool.run(|| -> Result<()> { panic!("inference crashed") }).await.unwrap_err();
        assert!(matches!(err, RagError::PipelineError(_)));
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn size_is_at_least_one() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
