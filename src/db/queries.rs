pub const INSERT_SENSOR_DATA_PREFIX: &str = r#"
INSERT INTO sensor_data (
    time, device_id, latitude, longitude, altitude, speed,
    temperature, humidity, light_level, tilt_angle, impact_g,
    battery_level, signal_strength
) "#;

pub const SELECT_ACTIVE_SHIPMENT_CONTEXT: &str = r#"
SELECT
    s.id AS shipment_id,
    s.status AS shipment_status,
    s.customer_id,
    s.provider_id,
    s.shipper_id,
    sr.id AS rules_id,
    sr.report_cycle_sec,
    sr.temp_min,
    sr.temp_max,
    sr.humidity_min,
    sr.humidity_max,
    sr.light_max,
    sr.tilt_max_angle,
    sr.impact_threshold_g
FROM devices d
INNER JOIN shipments s ON d.current_shipment_id = s.id
LEFT JOIN shipping_rules sr ON s.id = sr.shipment_id
WHERE d.id = $1 AND s.status = 'in_transit'
LIMIT 1;
"#;

pub const INSERT_ALERT: &str = r#"
INSERT INTO alerts (
    time, device_id, shipment_id, alert_type, severity, violation_type,
    trigger_value, threshold_value, message
) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9);
"#;

pub const UPDATE_DEVICE_LAST_SEEN: &str = r#"
UPDATE devices
SET last_seen_at = $2,
    updated_at = $2
WHERE id = $1;
"#;

pub const UPDATE_DEVICE_LAST_SEEN_BATTERY: &str = r#"
UPDATE devices
SET last_seen_at = $2,
    updated_at = $2,
    battery_level = $3
WHERE id = $1;
"#;
