use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};
use uuid::Uuid;

use super::alert_engine::AlertEngine;
use super::metrics::{IngestMetrics, MetricsTracker};
use super::tasks::TaskPool;
use super::validator::{device_uuid, validate_location, validate_sensor};
use crate::db::TelemetryStore;
use crate::error::{IngestError, Result};
use crate::models::{LocationReading, NormalizedRecord, SensorReading};

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Buffered records that trigger an immediate flush.
    pub batch_size: usize,
    /// Interval of the periodic flush.
    pub batch_timeout: Duration,
    pub worker_count: usize,
    /// Capacity of each input channel.
    pub buffer_size: usize,
    /// Concurrent alert/heartbeat tasks allowed in flight.
    pub side_task_limit: usize,
    pub alert_timeout: Duration,
    pub heartbeat_timeout: Duration,
    /// Upper bound for a single bulk write.
    pub insert_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_timeout: Duration::from_secs(5),
            worker_count: 4,
            buffer_size: 1_000,
            side_task_limit: 256,
            alert_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(3),
            insert_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorState {
    Created,
    Started,
    Stopped,
}

/// State shared between the processor handle and its workers.
struct Shared {
    store: Arc<dyn TelemetryStore>,
    alert_engine: AlertEngine,
    config: ProcessorConfig,
    buffer: Mutex<Vec<NormalizedRecord>>,
    locations: Mutex<HashMap<Uuid, LocationReading>>,
    sensor_queued: AtomicUsize,
    metrics: Arc<MetricsTracker>,
    tasks: TaskPool,
}

type Receivers = (mpsc::Receiver<SensorReading>, mpsc::Receiver<LocationReading>);

/// Batches sensor readings for storage and fans them out to alerting.
///
/// Inputs go through bounded channels and are dropped when a channel is
/// full; callers are never blocked.
pub struct Processor {
    shared: Arc<Shared>,
    state: Mutex<ProcessorState>,
    sensor_tx: RwLock<Option<mpsc::Sender<SensorReading>>>,
    location_tx: RwLock<Option<mpsc::Sender<LocationReading>>>,
    receivers: Mutex<Option<Receivers>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    span: Span,
}

impl Processor {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        alert_engine: AlertEngine,
        config: ProcessorConfig,
        span: Span,
    ) -> Self {
        let (sensor_tx, sensor_rx) = mpsc::channel(config.buffer_size.max(1));
        let (location_tx, location_rx) = mpsc::channel(config.buffer_size.max(1));
        let metrics = Arc::new(MetricsTracker::new());
        let tasks = TaskPool::new(config.side_task_limit, metrics.clone(), span.clone());

        let shared = Shared {
            store,
            alert_engine,
            buffer: Mutex::new(Vec::with_capacity(config.batch_size)),
            locations: Mutex::new(HashMap::new()),
            sensor_queued: AtomicUsize::new(0),
            metrics,
            tasks,
            config,
        };

        Self {
            shared: Arc::new(shared),
            state: Mutex::new(ProcessorState::Created),
            sensor_tx: RwLock::new(Some(sensor_tx)),
            location_tx: RwLock::new(Some(location_tx)),
            receivers: Mutex::new(Some((sensor_rx, location_rx))),
            workers: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
            span,
        }
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the sensor workers, the location worker and the batch flusher.
    /// Calling it again while running is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            ProcessorState::Started => return Ok(()),
            ProcessorState::Stopped => return Err(IngestError::AlreadyStopped),
            ProcessorState::Created => {}
        }

        let (sensor_rx, location_rx) = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(IngestError::AlreadyStopped)?;

        let config = &self.shared.config;
        info!(
            workers = config.worker_count,
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            "Starting processor"
        );

        let sensor_rx = Arc::new(tokio::sync::Mutex::new(sensor_rx));
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);

        for id in 0..config.worker_count.max(1) {
            let worker = sensor_worker(
                self.shared.clone(),
                sensor_rx.clone(),
                self.cancel.clone(),
                id,
            );
            workers.push(tokio::spawn(worker.instrument(self.span.clone())));
        }

        let worker = location_worker(self.shared.clone(), location_rx, self.cancel.clone());
        workers.push(tokio::spawn(worker.instrument(self.span.clone())));

        let flusher = batch_flusher(self.shared.clone(), self.cancel.clone());
        workers.push(tokio::spawn(flusher.instrument(self.span.clone())));

        *state = ProcessorState::Started;
        info!("Processor started");
        Ok(())
    }

    /// Closes the inputs, waits for the workers to drain them and writes
    /// whatever is still buffered. Side tasks already submitted keep running
    /// until their own timeout; see [`Processor::wait_side_tasks`].
    pub async fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == ProcessorState::Stopped {
                return;
            }
            *state = ProcessorState::Stopped;
        }
        info!("Stopping processor...");

        self.sensor_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.location_tx
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.cancel.cancel();

        // Never started: nothing consumed the queues, so drain them here.
        let pending = self
            .receivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((mut sensor_rx, mut location_rx)) = pending {
            while let Ok(msg) = location_rx.try_recv() {
                self.shared.handle_location(msg);
            }
            while let Ok(msg) = sensor_rx.try_recv() {
                self.shared.handle_sensor(msg, 0).await;
            }
        }

        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in workers {
            if let Err(e) = handle.await {
                error!(error = %e, "Processor task ended abnormally");
            }
        }

        if let Err(e) = self.shared.flush().await {
            error!(error = %e, "Final flush failed");
        }

        info!("Processor stopped");
    }

    /// Queues a validated sensor reading. Dropped and counted as failed when
    /// the queue is full; silently discarded once the processor is stopped.
    pub fn process_sensor_data(&self, msg: SensorReading) {
        let guard = self.sensor_tx.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            debug!(device_id = %msg.device_id, "Processor stopped, discarding sensor reading");
            return;
        };

        let queued = &self.shared.sensor_queued;
        queued.fetch_add(1, Ordering::SeqCst);
        match tx.try_send(msg) {
            Ok(()) => {
                let depth = queued.load(Ordering::SeqCst);
                self.shared.metrics.update(|m| {
                    m.messages_received += 1;
                    m.queue_depth = depth;
                });
            }
            Err(TrySendError::Full(msg)) => {
                queued.fetch_sub(1, Ordering::SeqCst);
                warn!(device_id = %msg.device_id, "Sensor buffer full, dropping message");
                self.shared.metrics.update(|m| m.messages_failed += 1);
            }
            Err(TrySendError::Closed(msg)) => {
                queued.fetch_sub(1, Ordering::SeqCst);
                debug!(device_id = %msg.device_id, "Sensor channel closed, discarding reading");
            }
        }
    }

    /// Validates and queues a location fix, with the same drop-on-full
    /// policy as sensor readings.
    pub fn process_location_data(&self, msg: LocationReading) {
        if let Err(e) = validate_location(&msg) {
            warn!(device_id = %msg.device_id, error = %e, "Invalid location message");
            self.shared.metrics.update(|m| m.messages_failed += 1);
            return;
        }

        let guard = self.location_tx.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            debug!(device_id = %msg.device_id, "Processor stopped, discarding location");
            return;
        };

        match tx.try_send(msg) {
            Ok(()) => self.shared.metrics.update(|m| m.messages_received += 1),
            Err(TrySendError::Full(msg)) => {
                warn!(device_id = %msg.device_id, "Location buffer full, dropping message");
                self.shared.metrics.update(|m| m.messages_failed += 1);
            }
            Err(TrySendError::Closed(msg)) => {
                debug!(device_id = %msg.device_id, "Location channel closed, discarding fix");
            }
        }
    }

    /// Writes the current buffer now. Returns the number of records written.
    pub async fn flush(&self) -> Result<usize> {
        self.shared.flush().await
    }

    /// Waits up to `limit` for in-flight alert and heartbeat tasks.
    pub async fn wait_side_tasks(&self, limit: Duration) -> bool {
        self.shared.tasks.wait(limit).await
    }

    pub fn metrics(&self) -> Arc<MetricsTracker> {
        self.shared.metrics.clone()
    }

    pub fn get_metrics(&self) -> IngestMetrics {
        self.shared.metrics.snapshot()
    }

    /// Latest cached location of a device, if any has arrived.
    pub fn latest_location(&self, device_id: Uuid) -> Option<LocationReading> {
        self.shared
            .locations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&device_id)
            .cloned()
    }
}

impl Shared {
    async fn handle_sensor(&self, msg: SensorReading, worker: usize) {
        let depth = self
            .sensor_queued
            .fetch_sub(1, Ordering::SeqCst)
            .saturating_sub(1);
        let started = Instant::now();
        let device_id = msg.device_id.clone();

        match self.process_sensor(msg).await {
            Ok(()) => self.metrics.update(|m| {
                m.messages_processed += 1;
                m.last_processed_at = Some(Utc::now());
                m.queue_depth = depth;
                m.observe_processing_time(started.elapsed());
            }),
            Err(e) => {
                warn!(worker, device_id = %device_id, error = %e, "Failed to process sensor message");
                self.metrics.update(|m| {
                    m.messages_failed += 1;
                    m.queue_depth = depth;
                });
            }
        }
    }

    fn handle_location(&self, msg: LocationReading) {
        match device_uuid(&msg.device_id) {
            Ok(device_id) => {
                self.locations
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(device_id, msg);
                self.metrics.update(|m| m.messages_processed += 1);
            }
            Err(e) => {
                warn!(error = %e, "Dropping location with invalid device id");
                self.metrics.update(|m| m.messages_failed += 1);
            }
        }
    }

    async fn process_sensor(&self, msg: SensorReading) -> Result<()> {
        validate_sensor(&msg)?;
        let device_id = device_uuid(&msg.device_id)?;

        let record = {
            let locations = self.locations.lock().unwrap_or_else(PoisonError::into_inner);
            NormalizedRecord::merge(device_id, &msg, locations.get(&device_id))
        };

        self.spawn_side_tasks(&record);

        let full_batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            buffer.push(record);
            if buffer.len() >= self.config.batch_size {
                Some(buffer.drain(..self.config.batch_size).collect::<Vec<_>>())
            } else {
                None
            }
        };

        if let Some(batch) = full_batch {
            // failure is logged and counted by write_batch
            let _ = self.write_batch(batch).await;
        }

        Ok(())
    }

    fn spawn_side_tasks(&self, record: &NormalizedRecord) {
        let engine = self.alert_engine.clone();
        let metrics = self.metrics.clone();
        let alert_record = record.clone();
        self.tasks
            .submit("alert_check", self.config.alert_timeout, async move {
                let alerts = engine.check_violations(&alert_record).await?;
                if !alerts.is_empty() {
                    let saved = engine.save_alerts(&alerts).await as u64;
                    metrics.update(|m| m.alerts_generated += saved);
                }
                Ok(())
            });

        let store = self.store.clone();
        let device_id = record.device_id;
        let battery_level = record.battery_level;
        self.tasks
            .submit("device_heartbeat", self.config.heartbeat_timeout, async move {
                store.update_device_heartbeat(device_id, battery_level).await
            });
    }

    /// Swaps the buffer out and writes it. An empty buffer is a no-op.
    async fn flush(&self) -> Result<usize> {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
            if buffer.is_empty() {
                return Ok(0);
            }
            std::mem::replace(&mut *buffer, Vec::with_capacity(self.config.batch_size))
        };
        self.write_batch(batch).await
    }

    async fn write_batch(&self, batch: Vec<NormalizedRecord>) -> Result<usize> {
        let count = batch.len();
        let started = Instant::now();

        let result =
            match tokio::time::timeout(self.config.insert_timeout, self.store.batch_insert(&batch))
                .await
            {
                Ok(result) => result,
                Err(_) => Err(IngestError::Timeout("batch insert")),
            };

        match result {
            Ok(()) => {
                info!(
                    records = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Inserted batch"
                );
                self.metrics.update(|m| m.records_inserted += count as u64);
                Ok(count)
            }
            Err(e) => {
                error!(records = count, error = %e, "Failed to insert batch, discarding it");
                self.metrics.update(|m| m.messages_failed += count as u64);
                Err(e)
            }
        }
    }
}

async fn sensor_worker(
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<SensorReading>>>,
    cancel: CancellationToken,
    id: usize,
) {
    debug!(worker = id, "Sensor worker started");

    loop {
        // Queued readings win over cancellation so that stop() drains them.
        let next = tokio::select! {
            biased;
            msg = async {
                let mut rx = rx.lock().await;
                rx.recv().await
            } => msg,
            _ = cancel.cancelled() => break,
        };
        let Some(msg) = next else { break };
        shared.handle_sensor(msg, id).await;
    }

    debug!(worker = id, "Sensor worker stopped");
}

async fn location_worker(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<LocationReading>,
    cancel: CancellationToken,
) {
    debug!("Location worker started");

    loop {
        let next = tokio::select! {
            biased;
            msg = rx.recv() => msg,
            _ = cancel.cancelled() => break,
        };
        let Some(msg) = next else { break };
        shared.handle_location(msg);
    }

    debug!("Location worker stopped");
}

async fn batch_flusher(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(shared.config.batch_timeout);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // failure is logged and counted by write_batch
                let _ = shared.flush().await;
            }
        }
    }
}
