pub mod alert;
pub mod message;
pub mod record;

pub use alert::{Alert, AlertClass, Severity, ViolationKind};
pub use message::{HeartbeatMessage, LocationReading, SensorReading, StatusMessage};
pub use record::{NormalizedRecord, ShipmentRuleContext};
