use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// Battery level (percent) below which a battery alert is raised.
pub const BATTERY_WARNING_LEVEL: i32 = 20;
/// Battery level (percent) below which the battery alert escalates to medium.
pub const BATTERY_CRITICAL_LEVEL: i32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViolationKind {
    Temperature,
    Humidity,
    Light,
    Tilt,
    Impact,
    Battery,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::Temperature => "temperature",
            ViolationKind::Humidity => "humidity",
            ViolationKind::Light => "light",
            ViolationKind::Tilt => "tilt",
            ViolationKind::Impact => "impact",
            ViolationKind::Battery => "battery",
        }
    }

    /// Fixed severity of a threshold violation on this dimension.
    ///
    /// Battery escalates with the reported level, see [`Severity::for_battery`].
    pub fn severity(&self) -> Severity {
        match self {
            ViolationKind::Temperature | ViolationKind::Tilt => Severity::High,
            ViolationKind::Humidity | ViolationKind::Light => Severity::Medium,
            ViolationKind::Impact => Severity::Critical,
            ViolationKind::Battery => Severity::Low,
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn for_battery(level: i32) -> Self {
        if level < BATTERY_CRITICAL_LEVEL {
            Severity::Medium
        } else {
            ViolationKind::Battery.severity()
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertClass {
    Immediate,
}

impl AlertClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertClass::Immediate => "immediate",
        }
    }
}

/// Append-only alert row. Never modified after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub time: DateTime<Utc>,
    pub device_id: Uuid,
    pub shipment_id: Uuid,
    pub class: AlertClass,
    pub severity: Severity,
    pub violation: ViolationKind,
    pub trigger_value: String,
    pub threshold_value: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_per_dimension() {
        assert_eq!(ViolationKind::Temperature.severity(), Severity::High);
        assert_eq!(ViolationKind::Tilt.severity(), Severity::High);
        assert_eq!(ViolationKind::Humidity.severity(), Severity::Medium);
        assert_eq!(ViolationKind::Light.severity(), Severity::Medium);
        assert_eq!(ViolationKind::Impact.severity(), Severity::Critical);
        assert_eq!(ViolationKind::Battery.severity(), Severity::Low);
    }

    #[test]
    fn test_battery_severity_escalates() {
        assert_eq!(Severity::for_battery(19), Severity::Low);
        assert_eq!(Severity::for_battery(10), Severity::Low);
        assert_eq!(Severity::for_battery(9), Severity::Medium);
        assert_eq!(Severity::for_battery(0), Severity::Medium);
    }
}
