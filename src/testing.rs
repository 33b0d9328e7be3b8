//! In-memory store and fixtures shared by unit tests.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::db::TelemetryStore;
use crate::error::{IngestError, Result};
use crate::models::{Alert, LocationReading, NormalizedRecord, SensorReading, ShipmentRuleContext};

pub const DEVICE: &str = "11111111-1111-1111-1111-111111111111";

pub fn device_id() -> Uuid {
    Uuid::parse_str(DEVICE).unwrap()
}

pub fn sensor(temperature: Option<f64>) -> SensorReading {
    SensorReading {
        device_id: DEVICE.to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 8, 30, 0).unwrap(),
        temperature,
        humidity: None,
        light_level: None,
        tilt_angle: None,
        impact_g: None,
        battery_level: None,
        signal_strength: None,
    }
}

pub fn location(latitude: f64, longitude: f64) -> LocationReading {
    LocationReading {
        device_id: DEVICE.to_string(),
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 8, 29, 0).unwrap(),
        latitude,
        longitude,
        altitude: None,
        speed: Some(12.0),
        accuracy: None,
    }
}

pub fn record(device_id: Uuid) -> NormalizedRecord {
    NormalizedRecord::merge(device_id, &sensor(Some(5.0)), None)
}

pub fn rules() -> ShipmentRuleContext {
    ShipmentRuleContext {
        shipment_id: Uuid::parse_str("22222222-2222-2222-2222-222222222222").unwrap(),
        shipment_status: "in_transit".to_string(),
        has_rules: true,
        ..ShipmentRuleContext::default()
    }
}

#[derive(Default)]
pub struct MemoryStore {
    pub batches: Mutex<Vec<Vec<NormalizedRecord>>>,
    pub alerts: Mutex<Vec<Alert>>,
    pub heartbeats: Mutex<Vec<(Uuid, Option<i32>)>>,
    pub contexts: Mutex<HashMap<Uuid, ShipmentRuleContext>>,
    pub fail_inserts: AtomicBool,
    pub fail_lookups: AtomicBool,
    /// Delay applied to every batch insert before it is recorded.
    pub insert_delay: Mutex<Option<Duration>>,
    /// Alerts whose message contains this text fail to insert.
    pub reject_alerts_containing: Mutex<Option<String>>,
}

impl MemoryStore {
    pub fn with_context(device_id: Uuid, ctx: ShipmentRuleContext) -> Self {
        let store = Self::default();
        store.contexts.lock().unwrap().insert(device_id, ctx);
        store
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn inserted(&self) -> Vec<NormalizedRecord> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn batch_insert(&self, records: &[NormalizedRecord]) -> Result<()> {
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(IngestError::Persistence(sqlx::Error::PoolTimedOut));
        }
        let delay = *self.insert_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if !records.is_empty() {
            self.batches.lock().unwrap().push(records.to_vec());
        }
        Ok(())
    }

    async fn get_active_context(&self, device_id: Uuid) -> Result<Option<ShipmentRuleContext>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(IngestError::Persistence(sqlx::Error::PoolTimedOut));
        }
        Ok(self.contexts.lock().unwrap().get(&device_id).cloned())
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        if let Some(needle) = self.reject_alerts_containing.lock().unwrap().as_deref() {
            if alert.message.contains(needle) {
                return Err(IngestError::Persistence(sqlx::Error::PoolTimedOut));
            }
        }
        self.alerts.lock().unwrap().push(alert.clone());
        Ok(())
    }

    async fn update_device_heartbeat(
        &self,
        device_id: Uuid,
        battery_level: Option<i32>,
    ) -> Result<()> {
        self.heartbeats
            .lock()
            .unwrap()
            .push((device_id, battery_level));
        Ok(())
    }
}
