use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, warn, Instrument, Span};

use super::metrics::MetricsTracker;
use crate::error::Result;

/// Bounded pool for short-lived side tasks spawned per reading.
///
/// Submission never waits. When every permit is taken the task is dropped
/// and counted in `side_tasks_rejected`.
pub struct TaskPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    metrics: Arc<MetricsTracker>,
    span: Span,
}

impl TaskPool {
    pub fn new(limit: usize, metrics: Arc<MetricsTracker>, span: Span) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limit.max(1))),
            tracker: TaskTracker::new(),
            metrics,
            span,
        }
    }

    /// Runs `task` under `timeout`. Returns `false` if the pool was full.
    pub fn submit<F, T>(&self, name: &'static str, timeout: Duration, task: F) -> bool
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = match self.permits.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!(task = name, "side task pool exhausted, dropping task");
                self.metrics.update(|m| m.side_tasks_rejected += 1);
                return false;
            }
        };

        let metrics = self.metrics.clone();
        self.tracker.spawn(
            async move {
                let _permit = permit;
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        error!(task = name, error = %e, "side task failed");
                        metrics.update(|m| m.side_tasks_failed += 1);
                    }
                    Err(_) => {
                        error!(task = name, timeout_ms = timeout.as_millis() as u64, "side task timed out");
                        metrics.update(|m| m.side_tasks_failed += 1);
                    }
                }
            }
            .instrument(self.span.clone()),
        );
        true
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Waits up to `limit` for every submitted task to finish. Returns
    /// `false` if some were still running when the limit elapsed.
    pub async fn wait(&self, limit: Duration) -> bool {
        self.tracker.close();
        let done = tokio::time::timeout(limit, self.tracker.wait()).await.is_ok();
        self.tracker.reopen();
        done
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;

    fn pool(limit: usize) -> (TaskPool, Arc<MetricsTracker>) {
        let metrics = Arc::new(MetricsTracker::new());
        (TaskPool::new(limit, metrics.clone(), Span::none()), metrics)
    }

    #[tokio::test]
    async fn test_failures_and_timeouts_are_counted() {
        let (pool, metrics) = pool(4);
        assert!(pool.submit("ok", Duration::from_secs(1), async { Ok(()) }));
        assert!(pool.submit("err", Duration::from_secs(1), async {
            Err::<(), _>(IngestError::Timeout("lookup"))
        }));
        assert!(pool.submit("slow", Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }));

        assert!(pool.wait(Duration::from_secs(2)).await);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(metrics.snapshot().side_tasks_failed, 2);
    }

    #[tokio::test]
    async fn test_full_pool_rejects_without_blocking() {
        let (pool, metrics) = pool(1);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        assert!(pool.submit("hold", Duration::from_secs(5), async move {
            let _ = rx.await;
            Ok(())
        }));
        assert!(!pool.submit("extra", Duration::from_secs(5), async { Ok(()) }));
        assert_eq!(metrics.snapshot().side_tasks_rejected, 1);

        tx.send(()).unwrap();
        assert!(pool.wait(Duration::from_secs(1)).await);
        assert!(pool.submit("again", Duration::from_secs(1), async { Ok(()) }));
        assert!(pool.wait(Duration::from_secs(1)).await);
    }
}
