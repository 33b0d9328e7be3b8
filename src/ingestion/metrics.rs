use chrono::{DateTime, Utc};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Counters and gauges describing ingestion health.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestMetrics {
    pub messages_received: u64,
    pub messages_processed: u64,
    pub messages_failed: u64,
    pub records_inserted: u64,
    pub alerts_generated: u64,
    pub last_processed_at: Option<DateTime<Utc>>,
    pub average_processing_time: Duration,
    pub queue_depth: usize,
    pub side_tasks_failed: u64,
    pub side_tasks_rejected: u64,
}

impl IngestMetrics {
    /// Blends a new sample into the average as `(old + new) / 2`.
    ///
    /// This weights recent samples heavily and is not a windowed mean.
    pub fn observe_processing_time(&mut self, elapsed: Duration) {
        self.average_processing_time = if self.average_processing_time.is_zero() {
            elapsed
        } else {
            (self.average_processing_time + elapsed) / 2
        };
    }
}

pub type MetricsListener = Box<dyn Fn(&IngestMetrics) + Send + Sync>;

struct Inner {
    metrics: IngestMetrics,
    listeners: Vec<MetricsListener>,
}

/// Thread-safe holder for [`IngestMetrics`].
///
/// Listeners run synchronously inside [`MetricsTracker::update`] while the
/// write lock is held, so they see every snapshot in order. They must not
/// call back into the tracker.
pub struct MetricsTracker {
    inner: RwLock<Inner>,
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                metrics: IngestMetrics::default(),
                listeners: Vec::new(),
            }),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut IngestMetrics)) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut inner.metrics);

        if inner.listeners.is_empty() {
            return;
        }
        let snapshot = inner.metrics.clone();
        for listener in &inner.listeners {
            listener(&snapshot);
        }
    }

    pub fn snapshot(&self) -> IngestMetrics {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics
            .clone()
    }

    /// Zeroes every counter. Listeners are kept and not notified.
    pub fn reset(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .metrics = IngestMetrics::default();
    }

    pub fn on_change(&self, listener: impl Fn(&IngestMetrics) + Send + Sync + 'static) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .listeners
            .push(Box::new(listener));
    }
}
