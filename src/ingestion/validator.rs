use chrono::Utc;
use std::ops::RangeInclusive;
use thiserror::Error;
use uuid::Uuid;

use crate::error::IngestError;
use crate::models::message::is_unset;
use crate::models::{LocationReading, SensorReading};

const TEMPERATURE_RANGE: RangeInclusive<f64> = -100.0..=100.0;
const HUMIDITY_RANGE: RangeInclusive<f64> = 0.0..=100.0;
const TILT_RANGE: RangeInclusive<f64> = 0.0..=180.0;
const IMPACT_RANGE: RangeInclusive<f64> = 0.0..=50.0;
const BATTERY_RANGE: RangeInclusive<i32> = 0..=100;
const SIGNAL_RANGE: RangeInclusive<i32> = -120..=0;
const LATITUDE_RANGE: RangeInclusive<f64> = -90.0..=90.0;
const LONGITUDE_RANGE: RangeInclusive<f64> = -180.0..=180.0;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("validation error [{field}]: {message}")]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

/// Decodes a sensor payload. Unknown fields are ignored and a missing
/// timestamp is replaced with the time of receipt.
pub fn parse_sensor(payload: &[u8]) -> Result<SensorReading, IngestError> {
    let mut msg: SensorReading = serde_json::from_slice(payload)?;
    if is_unset(&msg.timestamp) {
        msg.timestamp = Utc::now();
    }
    Ok(msg)
}

pub fn parse_location(payload: &[u8]) -> Result<LocationReading, IngestError> {
    let mut msg: LocationReading = serde_json::from_slice(payload)?;
    if is_unset(&msg.timestamp) {
        msg.timestamp = Utc::now();
    }
    Ok(msg)
}

/// Parses and validates the device identifier shared by every payload type.
pub fn device_uuid(device_id: &str) -> Result<Uuid, ValidationError> {
    if device_id.trim().is_empty() {
        return Err(ValidationError::new("device_id", "device_id is required"));
    }
    Uuid::parse_str(device_id)
        .map_err(|_| ValidationError::new("device_id", "device_id must be valid UUID"))
}

fn check_f64(
    field: &'static str,
    value: Option<f64>,
    range: RangeInclusive<f64>,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !range.contains(&v) => Err(ValidationError::new(
            field,
            format!("{} must be between {} and {}", field, range.start(), range.end()),
        )),
        _ => Ok(()),
    }
}

fn check_i32(
    field: &'static str,
    value: Option<i32>,
    range: RangeInclusive<i32>,
) -> Result<(), ValidationError> {
    match value {
        Some(v) if !range.contains(&v) => Err(ValidationError::new(
            field,
            format!("{} must be between {} and {}", field, range.start(), range.end()),
        )),
        _ => Ok(()),
    }
}

fn check_non_negative(field: &'static str, value: Option<f64>) -> Result<(), ValidationError> {
    match value {
        Some(v) if v < 0.0 || !v.is_finite() => Err(ValidationError::new(
            field,
            format!("{} must be a finite non-negative number", field),
        )),
        _ => Ok(()),
    }
}

/// Checks a sensor reading field by field and stops at the first failure.
pub fn validate_sensor(msg: &SensorReading) -> Result<(), ValidationError> {
    device_uuid(&msg.device_id)?;

    if is_unset(&msg.timestamp) {
        return Err(ValidationError::new("timestamp", "timestamp is required"));
    }

    check_f64("temperature", msg.temperature, TEMPERATURE_RANGE)?;
    check_f64("humidity", msg.humidity, HUMIDITY_RANGE)?;
    check_non_negative("light_level", msg.light_level)?;
    check_f64("tilt_angle", msg.tilt_angle, TILT_RANGE)?;
    check_f64("impact_g", msg.impact_g, IMPACT_RANGE)?;
    check_i32("battery_level", msg.battery_level, BATTERY_RANGE)?;
    check_i32("signal_strength", msg.signal_strength, SIGNAL_RANGE)?;

    Ok(())
}

pub fn validate_location(msg: &LocationReading) -> Result<(), ValidationError> {
    device_uuid(&msg.device_id)?;

    if is_unset(&msg.timestamp) {
        return Err(ValidationError::new("timestamp", "timestamp is required"));
    }

    check_f64("latitude", Some(msg.latitude), LATITUDE_RANGE)?;
    check_f64("longitude", Some(msg.longitude), LONGITUDE_RANGE)?;
    check_non_negative("speed", msg.speed)?;

    Ok(())
}
