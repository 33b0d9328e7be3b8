//! Telemetry ingestion and quality-violation alerting for shipment tracking devices.
//!
//! Readings arrive over MQTT, are validated, merged with the latest known
//! location of their device and written to Postgres in batches. Every accepted
//! sensor reading is also checked against the rules of the device's in-transit
//! shipment, and violations are stored as alert rows.

pub mod config;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod models;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{IngestError, Result};
