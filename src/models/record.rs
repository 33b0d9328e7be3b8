use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::message::{LocationReading, SensorReading};

/// A sensor reading enriched with the latest known location of its device.
/// This is the row shape written to `sensor_data`.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRecord {
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub speed: Option<f64>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub light_level: Option<f64>,
    pub tilt_angle: Option<f64>,
    pub impact_g: Option<f64>,
    pub battery_level: Option<i32>,
    pub signal_strength: Option<i32>,
}

impl NormalizedRecord {
    pub fn merge(device_id: Uuid, reading: &SensorReading, location: Option<&LocationReading>) -> Self {
        Self {
            time: reading.timestamp,
            device_id,
            latitude: location.map(|l| l.latitude),
            longitude: location.map(|l| l.longitude),
            altitude: location.and_then(|l| l.altitude),
            speed: location.and_then(|l| l.speed),
            temperature: reading.temperature,
            humidity: reading.humidity,
            light_level: reading.light_level,
            tilt_angle: reading.tilt_angle,
            impact_g: reading.impact_g,
            battery_level: reading.battery_level,
            signal_strength: reading.signal_strength,
        }
    }
}

/// Active shipment of a device together with its shipping rules.
///
/// Only produced for shipments whose status is `in_transit`. Fetched per
/// reading and never cached, since rules can change at any time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShipmentRuleContext {
    pub shipment_id: Uuid,
    pub shipment_status: String,
    pub customer_id: Option<Uuid>,
    pub provider_id: Option<Uuid>,
    pub shipper_id: Option<Uuid>,
    pub has_rules: bool,
    pub report_cycle_sec: Option<i32>,
    pub temp_min: Option<f64>,
    pub temp_max: Option<f64>,
    pub humidity_min: Option<f64>,
    pub humidity_max: Option<f64>,
    pub light_max: Option<f64>,
    pub tilt_max_angle: Option<f64>,
    pub impact_threshold_g: Option<f64>,
}
