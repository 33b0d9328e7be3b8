use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Sensor payload published by a tracking device.
///
/// Every measurement is optional; `None` means the device did not report it,
/// which is different from a reported zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "unset_timestamp", deserialize_with = "timestamp_or_unset")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub temperature: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub humidity: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub light_level: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub tilt_angle: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub impact_g: Option<f64>,
    #[serde(default, deserialize_with = "parse_i32_option")]
    pub battery_level: Option<i32>,
    #[serde(default, deserialize_with = "parse_i32_option")]
    pub signal_strength: Option<i32>,
}

/// GPS fix published by a tracking device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReading {
    #[serde(default)]
    pub device_id: String,
    #[serde(default = "unset_timestamp", deserialize_with = "timestamp_or_unset")]
    pub timestamp: DateTime<Utc>,
    #[serde(deserialize_with = "parse_f64")]
    pub latitude: f64,
    #[serde(deserialize_with = "parse_f64")]
    pub longitude: f64,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub altitude: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub speed: Option<f64>,
    #[serde(default, deserialize_with = "parse_f64_option")]
    pub accuracy: Option<f64>,
}

/// Device status update. Only logged for now.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusMessage {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "parse_i32_option")]
    pub battery_level: Option<i32>,
    #[serde(default)]
    pub firmware_version: Option<String>,
}

/// Device heartbeat. Only logged for now.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatMessage {
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub online: Option<bool>,
}

/// Placeholder for a timestamp the device did not send. Anything at or
/// before the Unix epoch counts as unset.
pub fn unset_timestamp() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

pub fn is_unset(ts: &DateTime<Utc>) -> bool {
    *ts <= DateTime::<Utc>::UNIX_EPOCH
}

fn timestamp_or_unset<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<DateTime<Utc>> = Option::deserialize(deserializer)?;
    Ok(v.unwrap_or_else(unset_timestamp))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrFloat {
    String(String),
    Float(f64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrInt {
    String(String),
    Int(i64),
}

fn parse_f64_option<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<StringOrFloat> = Option::deserialize(deserializer)?;
    let value = match v {
        Some(StringOrFloat::Float(f)) => f,
        Some(StringOrFloat::String(s)) => {
            if s.trim().is_empty() {
                return Ok(None);
            }
            s.trim().parse::<f64>().map_err(serde::de::Error::custom)?
        }
        None => return Ok(None),
    };
    // "inf" and "NaN" parse as f64 but are never valid readings
    if !value.is_finite() {
        return Err(serde::de::Error::custom(format!(
            "expected a finite number, found {}",
            value
        )));
    }
    Ok(Some(value))
}

fn parse_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    parse_f64_option(deserializer)?
        .ok_or_else(|| serde::de::Error::custom("expected a number, found an empty value"))
}

fn parse_i32_option<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    let v: Option<StringOrInt> = Option::deserialize(deserializer)?;
    let wide = match v {
        Some(StringOrInt::Int(i)) => i,
        Some(StringOrInt::String(s)) => {
            if s.trim().is_empty() {
                return Ok(None);
            }
            s.trim().parse::<i64>().map_err(serde::de::Error::custom)?
        }
        None => return Ok(None),
    };
    i32::try_from(wide)
        .map(Some)
        .map_err(|_| serde::de::Error::custom(format!("integer {} out of range", wide)))
}
