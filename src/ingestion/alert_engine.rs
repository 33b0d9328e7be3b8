use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, warn};

use crate::db::TelemetryStore;
use crate::error::Result;
use crate::models::alert::BATTERY_WARNING_LEVEL;
use crate::models::{
    Alert, AlertClass, NormalizedRecord, Severity, ShipmentRuleContext, ViolationKind,
};

/// Evaluates readings against the rules of the device's in-transit shipment.
#[derive(Clone)]
pub struct AlertEngine {
    store: Arc<dyn TelemetryStore>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Returns the alerts triggered by `record`.
    ///
    /// A device without an in-transit shipment, or a shipment without rules,
    /// yields an empty list rather than an error.
    pub async fn check_violations(&self, record: &NormalizedRecord) -> Result<Vec<Alert>> {
        let ctx = match self.store.get_active_context(record.device_id).await? {
            Some(ctx) if ctx.has_rules => ctx,
            _ => return Ok(Vec::new()),
        };

        Ok(evaluate(record, &ctx))
    }

    /// Persists each alert on its own. Returns how many were stored.
    pub async fn save_alerts(&self, alerts: &[Alert]) -> usize {
        let results = join_all(alerts.iter().map(|alert| self.store.insert_alert(alert))).await;

        let mut saved = 0;
        for (alert, result) in alerts.iter().zip(results) {
            match result {
                Ok(()) => {
                    saved += 1;
                    warn!(
                        device_id = %alert.device_id,
                        shipment_id = %alert.shipment_id,
                        severity = %alert.severity,
                        violation = %alert.violation,
                        "ALERT: {}",
                        alert.message
                    );
                }
                Err(e) => {
                    error!(
                        device_id = %alert.device_id,
                        violation = %alert.violation,
                        error = %e,
                        "Failed to save alert"
                    );
                }
            }
        }
        saved
    }
}

struct AlertBuilder<'a> {
    record: &'a NormalizedRecord,
    ctx: &'a ShipmentRuleContext,
    alerts: Vec<Alert>,
}

impl AlertBuilder<'_> {
    fn push(
        &mut self,
        violation: ViolationKind,
        severity: Severity,
        trigger_value: String,
        threshold_value: String,
        message: String,
    ) {
        self.alerts.push(Alert {
            time: self.record.time,
            device_id: self.record.device_id,
            shipment_id: self.ctx.shipment_id,
            class: AlertClass::Immediate,
            severity,
            violation,
            trigger_value,
            threshold_value,
            message,
        });
    }

    fn below_min(&mut self, violation: ViolationKind, name: &str, value: f64, min: f64, unit: &str) {
        self.push(
            violation,
            violation.severity(),
            format!("{:.2}{}", value, unit),
            format!("min: {:.2}{}", min, unit),
            format!(
                "{} {:.2}{} is below minimum threshold {:.2}{}",
                name, value, unit, min, unit
            ),
        );
    }

    fn above_max(&mut self, violation: ViolationKind, name: &str, value: f64, max: f64, unit: &str) {
        self.push(
            violation,
            violation.severity(),
            format!("{:.2}{}", value, unit),
            format!("max: {:.2}{}", max, unit),
            format!(
                "{} {:.2}{} exceeds maximum threshold {:.2}{}",
                name, value, unit, max, unit
            ),
        );
    }

    /// Temperature and humidity have independent bounds; a reading trips at most one.
    fn check_range(
        &mut self,
        violation: ViolationKind,
        name: &str,
        value: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
        unit: &str,
    ) {
        let Some(value) = value else { return };
        match (min, max) {
            (Some(min), _) if value < min => self.below_min(violation, name, value, min, unit),
            (_, Some(max)) if value > max => self.above_max(violation, name, value, max, unit),
            _ => {}
        }
    }
}

/// Pure rule evaluation, split out from the store lookup.
pub fn evaluate(record: &NormalizedRecord, ctx: &ShipmentRuleContext) -> Vec<Alert> {
    let mut b = AlertBuilder {
        record,
        ctx,
        alerts: Vec::new(),
    };

    b.check_range(
        ViolationKind::Temperature,
        "Temperature",
        record.temperature,
        ctx.temp_min,
        ctx.temp_max,
        "°C",
    );
    b.check_range(
        ViolationKind::Humidity,
        "Humidity",
        record.humidity,
        ctx.humidity_min,
        ctx.humidity_max,
        "%",
    );

    if let (Some(light), Some(max)) = (record.light_level, ctx.light_max) {
        if light > max {
            b.push(
                ViolationKind::Light,
                ViolationKind::Light.severity(),
                format!("{:.2} lux", light),
                format!("max: {:.2} lux", max),
                format!("Light exposure {:.2} lux exceeds threshold {:.2} lux", light, max),
            );
        }
    }

    if let (Some(tilt), Some(max)) = (record.tilt_angle, ctx.tilt_max_angle) {
        if tilt > max {
            b.push(
                ViolationKind::Tilt,
                ViolationKind::Tilt.severity(),
                format!("{:.2}°", tilt),
                format!("max: {:.2}°", max),
                format!("Package tilted {:.2}° exceeding threshold {:.2}°", tilt, max),
            );
        }
    }

    if let (Some(impact), Some(max)) = (record.impact_g, ctx.impact_threshold_g) {
        if impact > max {
            b.push(
                ViolationKind::Impact,
                ViolationKind::Impact.severity(),
                format!("{:.2}G", impact),
                format!("max: {:.2}G", max),
                format!(
                    "Impact detected: {:.2}G exceeds threshold {:.2}G - potential damage!",
                    impact, max
                ),
            );
        }
    }

    if let Some(level) = record.battery_level {
        if level < BATTERY_WARNING_LEVEL {
            b.push(
                ViolationKind::Battery,
                Severity::for_battery(level),
                format!("{}%", level),
                format!("{}%", BATTERY_WARNING_LEVEL),
                format!("Low battery: {}%", level),
            );
        }
    }

    b.alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device_id, record, rules, MemoryStore};
    use std::sync::atomic::Ordering;

    fn engine_with(ctx: ShipmentRuleContext) -> (AlertEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_context(device_id(), ctx));
        (AlertEngine::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_temperature_above_max() {
        let ctx = ShipmentRuleContext {
            temp_max: Some(30.0),
            ..rules()
        };
        let (engine, _) = engine_with(ctx.clone());
        let mut rec = record(device_id());
        rec.temperature = Some(45.0);

        let alerts = engine.check_violations(&rec).await.unwrap();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.severity, Severity::High);
        assert_eq!(alert.violation, ViolationKind::Temperature);
        assert_eq!(alert.class, AlertClass::Immediate);
        assert_eq!(alert.shipment_id, ctx.shipment_id);
        assert_eq!(alert.trigger_value, "45.00°C");
        assert_eq!(alert.threshold_value, "max: 30.00°C");
        assert!(alert.message.contains("45.00°C"));
        assert!(alert.message.contains("30.00°C"));
    }

    #[tokio::test]
    async fn test_temperature_outside_range_yields_exactly_one_alert() {
        let ctx = ShipmentRuleContext {
            temp_min: Some(2.0),
            temp_max: Some(8.0),
            ..rules()
        };
        let (engine, _) = engine_with(ctx);

        for temp in [-40.0, 1.99, 8.01, 99.0] {
            let mut rec = record(device_id());
            rec.temperature = Some(temp);
            let alerts = engine.check_violations(&rec).await.unwrap();
            assert_eq!(alerts.len(), 1, "temperature {}", temp);
            assert_eq!(alerts[0].violation, ViolationKind::Temperature);
            assert_eq!(alerts[0].severity, Severity::High);
        }

        // bounds are strict
        for temp in [2.0, 5.0, 8.0] {
            let mut rec = record(device_id());
            rec.temperature = Some(temp);
            assert!(engine.check_violations(&rec).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_no_active_shipment_is_not_an_error() {
        let engine = AlertEngine::new(Arc::new(MemoryStore::default()));
        let mut rec = record(device_id());
        rec.temperature = Some(99.0);
        rec.battery_level = Some(1);

        let alerts = engine.check_violations(&rec).await.unwrap();
        assert!(alerts.is_empty());
    }

    #[tokio::test]
    async fn test_shipment_without_rules_skips_alerting() {
        let ctx = ShipmentRuleContext {
            has_rules: false,
            temp_max: Some(1.0),
            ..rules()
        };
        let (engine, _) = engine_with(ctx);
        let mut rec = record(device_id());
        rec.temperature = Some(50.0);
        assert!(engine.check_violations(&rec).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_returned() {
        let (engine, store) = engine_with(rules());
        store.fail_lookups.store(true, Ordering::SeqCst);
        assert!(engine.check_violations(&record(device_id())).await.is_err());
    }

    #[test]
    fn test_low_battery_severity() {
        let mut rec = record(device_id());
        rec.battery_level = Some(8);
        let alerts = evaluate(&rec, &rules());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Medium);
        assert_eq!(alerts[0].violation, ViolationKind::Battery);
        assert_eq!(alerts[0].trigger_value, "8%");
        assert_eq!(alerts[0].threshold_value, "20%");

        rec.battery_level = Some(15);
        assert_eq!(evaluate(&rec, &rules())[0].severity, Severity::Low);

        rec.battery_level = Some(20);
        assert!(evaluate(&rec, &rules()).is_empty());
    }

    #[test]
    fn test_every_dimension_severity() {
        let ctx = ShipmentRuleContext {
            humidity_max: Some(60.0),
            light_max: Some(10.0),
            tilt_max_angle: Some(45.0),
            impact_threshold_g: Some(3.0),
            ..rules()
        };
        let mut rec = record(device_id());
        rec.temperature = None;
        rec.humidity = Some(75.0);
        rec.light_level = Some(250.0);
        rec.tilt_angle = Some(90.0);
        rec.impact_g = Some(12.5);

        let got: Vec<_> = evaluate(&rec, &ctx)
            .into_iter()
            .map(|a| (a.violation, a.severity))
            .collect();
        assert_eq!(
            got,
            vec![
                (ViolationKind::Humidity, Severity::Medium),
                (ViolationKind::Light, Severity::Medium),
                (ViolationKind::Tilt, Severity::High),
                (ViolationKind::Impact, Severity::Critical),
            ]
        );
    }

    #[test]
    fn test_unreported_dimensions_never_alert() {
        let ctx = ShipmentRuleContext {
            temp_min: Some(2.0),
            humidity_min: Some(30.0),
            impact_threshold_g: Some(0.0),
            ..rules()
        };
        let mut rec = record(device_id());
        rec.temperature = None;
        assert!(evaluate(&rec, &ctx).is_empty());
    }

    #[tokio::test]
    async fn test_save_alerts_continues_past_failures() {
        let ctx = ShipmentRuleContext {
            temp_max: Some(30.0),
            impact_threshold_g: Some(3.0),
            ..rules()
        };
        let (engine, store) = engine_with(ctx);
        *store.reject_alerts_containing.lock().unwrap() = Some("Temperature".to_string());

        let mut rec = record(device_id());
        rec.temperature = Some(40.0);
        rec.impact_g = Some(9.0);
        rec.battery_level = Some(5);
        let alerts = engine.check_violations(&rec).await.unwrap();
        assert_eq!(alerts.len(), 3);

        let saved = engine.save_alerts(&alerts).await;
        assert_eq!(saved, 2);
        let stored: Vec<_> = store
            .alerts
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.violation)
            .collect();
        assert_eq!(stored, vec![ViolationKind::Impact, ViolationKind::Battery]);
    }
}
