use anyhow::Result;
use dotenvy::dotenv;
use rumqttc::QoS;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::ingestion::client::{IngestionConfig, MqttSettings, TopicConfig};
use crate::ingestion::processor::ProcessorConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub mqtt_client_id: String,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_keep_alive_secs: u64,
    pub mqtt_clean_session: bool,
    pub mqtt_connect_timeout_secs: u64,
    pub mqtt_max_retries: u32,
    pub mqtt_circuit_breaker_cooldown: u64,
    pub mqtt_sensor_topic: String,
    pub mqtt_location_topic: String,
    pub mqtt_status_topic: String,
    pub mqtt_heartbeat_topic: String,
    pub mqtt_sensor_qos: QoS,
    pub mqtt_location_qos: QoS,
    pub mqtt_status_qos: QoS,
    pub mqtt_heartbeat_qos: QoS,
    pub ingest_batch_size: usize,
    pub ingest_batch_timeout_ms: u64,
    pub ingest_workers: usize,
    pub ingest_buffer_size: usize,
    pub ingest_side_task_limit: usize,
    pub database_url: String,
    pub db_max_connections: u32,
    pub log_level: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv().ok();

        let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
        let mqtt_port = parse_or("MQTT_PORT", 1883);
        let mqtt_client_id = env::var("MQTT_CLIENT_ID")
            .unwrap_or_else(|_| format!("shipment-telemetry-{}", Uuid::new_v4()));
        let mqtt_username = env::var("MQTT_USERNAME").unwrap_or_default();
        let mqtt_password = env::var("MQTT_PASSWORD").unwrap_or_default();
        let mqtt_keep_alive_secs = parse_or("MQTT_KEEP_ALIVE_SECS", 30);
        let mqtt_clean_session = parse_or("MQTT_CLEAN_SESSION", false);
        let mqtt_connect_timeout_secs = parse_or("MQTT_CONNECT_TIMEOUT_SECS", 10);
        let mqtt_max_retries = parse_or("MQTT_MAX_RETRIES", 5);
        let mqtt_circuit_breaker_cooldown = parse_or("MQTT_CIRCUIT_BREAKER_COOLDOWN", 60);

        let mqtt_sensor_topic =
            env::var("MQTT_SENSOR_TOPIC").unwrap_or_else(|_| "devices/+/sensors".to_string());
        let mqtt_location_topic =
            env::var("MQTT_LOCATION_TOPIC").unwrap_or_else(|_| "devices/+/location".to_string());
        let mqtt_status_topic =
            env::var("MQTT_STATUS_TOPIC").unwrap_or_else(|_| "devices/+/status".to_string());
        let mqtt_heartbeat_topic =
            env::var("MQTT_HEARTBEAT_TOPIC").unwrap_or_else(|_| "devices/+/heartbeat".to_string());

        let default_qos = qos_from_env("MQTT_QOS", QoS::AtLeastOnce);
        let mqtt_sensor_qos = qos_from_env("MQTT_SENSOR_QOS", default_qos);
        let mqtt_location_qos = qos_from_env("MQTT_LOCATION_QOS", default_qos);
        let mqtt_status_qos = qos_from_env("MQTT_STATUS_QOS", default_qos);
        let mqtt_heartbeat_qos = qos_from_env("MQTT_HEARTBEAT_QOS", default_qos);

        let ingest_batch_size = parse_or("INGEST_BATCH_SIZE", 100);
        let ingest_batch_timeout_ms = parse_or("INGEST_BATCH_TIMEOUT_MS", 5_000);
        let ingest_workers = parse_or("INGEST_WORKERS", 4);
        let ingest_buffer_size = parse_or("INGEST_BUFFER_SIZE", 1_000);
        let ingest_side_task_limit = parse_or("INGEST_SIDE_TASK_LIMIT", 256);

        let db_host = env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string());
        let db_port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
        let db_name = env::var("DB_DATABASE").unwrap_or_else(|_| "logistics".to_string());
        let db_user = env::var("DB_USER").unwrap_or_else(|_| "postgres".to_string());
        let db_pwd = env::var("DB_PWD").unwrap_or_else(|_| "postgres".to_string());
        let db_max_connections = parse_or("DB_MAX_CONNECTIONS", 20);

        let database_url = format!(
            "postgres://{}:{}@{}:{}/{}",
            db_user, db_pwd, db_host, db_port, db_name
        );

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            mqtt_broker,
            mqtt_port,
            mqtt_client_id,
            mqtt_username,
            mqtt_password,
            mqtt_keep_alive_secs,
            mqtt_clean_session,
            mqtt_connect_timeout_secs,
            mqtt_max_retries,
            mqtt_circuit_breaker_cooldown,
            mqtt_sensor_topic,
            mqtt_location_topic,
            mqtt_status_topic,
            mqtt_heartbeat_topic,
            mqtt_sensor_qos,
            mqtt_location_qos,
            mqtt_status_qos,
            mqtt_heartbeat_qos,
            ingest_batch_size,
            ingest_batch_timeout_ms,
            ingest_workers,
            ingest_buffer_size,
            ingest_side_task_limit,
            database_url,
            db_max_connections,
            log_level,
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            batch_size: self.ingest_batch_size.max(1),
            batch_timeout: Duration::from_millis(self.ingest_batch_timeout_ms.max(1)),
            worker_count: self.ingest_workers.max(1),
            buffer_size: self.ingest_buffer_size.max(1),
            side_task_limit: self.ingest_side_task_limit.max(1),
            ..ProcessorConfig::default()
        }
    }

    pub fn ingestion_config(&self) -> IngestionConfig {
        IngestionConfig {
            mqtt: MqttSettings {
                broker: self.mqtt_broker.clone(),
                port: self.mqtt_port,
                client_id: self.mqtt_client_id.clone(),
                username: self.mqtt_username.clone(),
                password: self.mqtt_password.clone(),
                keep_alive: Duration::from_secs(self.mqtt_keep_alive_secs.max(5)),
                clean_session: self.mqtt_clean_session,
                connect_timeout: Duration::from_secs(self.mqtt_connect_timeout_secs.max(1)),
                max_retries: self.mqtt_max_retries,
                circuit_breaker_cooldown: Duration::from_secs(self.mqtt_circuit_breaker_cooldown),
            },
            sensor: TopicConfig::new(&self.mqtt_sensor_topic, self.mqtt_sensor_qos),
            location: TopicConfig::new(&self.mqtt_location_topic, self.mqtt_location_qos),
            status: TopicConfig::new(&self.mqtt_status_topic, self.mqtt_status_qos),
            heartbeat: TopicConfig::new(&self.mqtt_heartbeat_topic, self.mqtt_heartbeat_qos),
        }
    }
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn qos_from_env(key: &str, default: QoS) -> QoS {
    env::var(key)
        .ok()
        .and_then(|v| parse_qos(&v))
        .unwrap_or(default)
}

/// Maps the numeric MQTT delivery level (0, 1, 2) to a `QoS`.
pub fn parse_qos(value: &str) -> Option<QoS> {
    match value.trim() {
        "0" => Some(QoS::AtMostOnce),
        "1" => Some(QoS::AtLeastOnce),
        "2" => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_qos_levels() {
        assert_eq!(parse_qos("0"), Some(QoS::AtMostOnce));
        assert_eq!(parse_qos(" 1 "), Some(QoS::AtLeastOnce));
        assert_eq!(parse_qos("2"), Some(QoS::ExactlyOnce));
        assert_eq!(parse_qos("3"), None);
        assert_eq!(parse_qos("high"), None);
    }

    #[test]
    fn test_component_configs_are_clamped() {
        let mut config = AppConfig::load().unwrap();
        config.ingest_batch_size = 0;
        config.ingest_workers = 0;
        config.mqtt_status_topic = String::new();

        let processor = config.processor_config();
        assert_eq!(processor.batch_size, 1);
        assert_eq!(processor.worker_count, 1);

        let ingestion = config.ingestion_config();
        assert!(ingestion.status.is_none());
    }
}
