use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use super::processor::Processor;
use super::validator::{parse_location, parse_sensor, validate_location, validate_sensor};
use crate::error::{IngestError, Result};
use crate::models::{HeartbeatMessage, StatusMessage};

const REQUEST_CHANNEL_CAPACITY: usize = 100;
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    /// Consecutive event loop errors before the circuit breaker trips.
    /// Zero disables the breaker.
    pub max_retries: u32,
    pub circuit_breaker_cooldown: Duration,
}

impl MqttSettings {
    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.broker, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(self.clean_session);
        if !self.username.is_empty() {
            options.set_credentials(&self.username, &self.password);
        }
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicConfig {
    pub topic: String,
    pub qos: QoS,
}

impl TopicConfig {
    /// Returns `None` for an empty topic, which disables that subscription.
    pub fn new(topic: &str, qos: QoS) -> Option<Self> {
        let topic = topic.trim();
        if topic.is_empty() {
            None
        } else {
            Some(Self {
                topic: topic.to_string(),
                qos,
            })
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionConfig {
    pub mqtt: MqttSettings,
    pub sensor: Option<TopicConfig>,
    pub location: Option<TopicConfig>,
    pub status: Option<TopicConfig>,
    pub heartbeat: Option<TopicConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicKind {
    Sensor,
    Location,
    Status,
    Heartbeat,
}

#[derive(Debug, Clone)]
struct Route {
    topic: TopicConfig,
    kind: TopicKind,
}

impl IngestionConfig {
    fn routes(&self) -> Vec<Route> {
        [
            (&self.sensor, TopicKind::Sensor),
            (&self.location, TopicKind::Location),
            (&self.status, TopicKind::Status),
            (&self.heartbeat, TopicKind::Heartbeat),
        ]
        .into_iter()
        .filter_map(|(topic, kind)| {
            topic.clone().map(|topic| Route { topic, kind })
        })
        .collect()
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(f), Some(t)) if f == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Routes inbound publishes to the handler bound to their topic.
#[derive(Clone)]
pub struct Dispatcher {
    routes: Arc<Vec<Route>>,
    processor: Arc<Processor>,
}

impl Dispatcher {
    fn new(routes: Vec<Route>, processor: Arc<Processor>) -> Self {
        Self {
            routes: Arc::new(routes),
            processor,
        }
    }

    pub fn route(&self, topic: &str) -> Option<TopicKind> {
        self.routes
            .iter()
            .find(|r| topic_matches(&r.topic.topic, topic))
            .map(|r| r.kind)
    }

    pub fn dispatch(&self, topic: &str, payload: &[u8]) {
        match self.route(topic) {
            Some(TopicKind::Sensor) => self.handle_sensor(topic, payload),
            Some(TopicKind::Location) => self.handle_location(topic, payload),
            Some(TopicKind::Status) => handle_status(topic, payload),
            Some(TopicKind::Heartbeat) => handle_heartbeat(topic, payload),
            None => debug!(topic, "Ignoring message on unrouted topic"),
        }
    }

    fn reject(&self, topic: &str, kind: &str, error: &dyn std::fmt::Display) {
        warn!(topic, error = %error, "invalid {} payload", kind);
        self.processor.metrics().update(|m| m.messages_failed += 1);
    }

    fn handle_sensor(&self, topic: &str, payload: &[u8]) {
        let msg = match parse_sensor(payload) {
            Ok(msg) => msg,
            Err(e) => return self.reject(topic, "sensor", &e),
        };
        if let Err(e) = validate_sensor(&msg) {
            return self.reject(topic, "sensor", &e);
        }
        self.processor.process_sensor_data(msg);
    }

    fn handle_location(&self, topic: &str, payload: &[u8]) {
        let msg = match parse_location(payload) {
            Ok(msg) => msg,
            Err(e) => return self.reject(topic, "location", &e),
        };
        if let Err(e) = validate_location(&msg) {
            return self.reject(topic, "location", &e);
        }
        self.processor.process_location_data(msg);
    }
}

// Status and heartbeat updates are only observed for now.
fn handle_status(topic: &str, payload: &[u8]) {
    match serde_json::from_slice::<StatusMessage>(payload) {
        Ok(msg) => info!(
            topic,
            device_id = %msg.device_id,
            status = msg.status.as_deref().unwrap_or(""),
            battery_level = ?msg.battery_level,
            firmware = msg.firmware_version.as_deref().unwrap_or(""),
            "Status update received"
        ),
        Err(_) => info!(topic, payload = %String::from_utf8_lossy(payload), "Status update received"),
    }
}

fn handle_heartbeat(topic: &str, payload: &[u8]) {
    match serde_json::from_slice::<HeartbeatMessage>(payload) {
        Ok(msg) => debug!(topic, device_id = %msg.device_id, online = ?msg.online, "Heartbeat received"),
        Err(_) => debug!(topic, payload = %String::from_utf8_lossy(payload), "Heartbeat received"),
    }
}

struct Running {
    client: AsyncClient,
    topics: Vec<String>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Bridges the MQTT broker to the [`Processor`].
pub struct IngestionClient {
    config: IngestionConfig,
    processor: Arc<Processor>,
    running: Mutex<Option<Running>>,
    span: Span,
}

impl IngestionClient {
    pub fn new(config: IngestionConfig, processor: Arc<Processor>, span: Span) -> Self {
        Self {
            config,
            processor,
            running: Mutex::new(None),
            span,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Connects, subscribes every configured topic and starts the event
    /// loop. A no-op when already started.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }

        let routes = self.config.routes();
        if routes.is_empty() {
            return Err(IngestError::NoTopics);
        }

        let settings = &self.config.mqtt;
        info!(broker = %settings.broker, port = settings.port, "Connecting to MQTT broker");

        let (client, mut eventloop) = AsyncClient::new(settings.options(), REQUEST_CHANNEL_CAPACITY);
        tokio::time::timeout(settings.connect_timeout, wait_for_connack(&mut eventloop))
            .await
            .map_err(|_| IngestError::Timeout("MQTT connect"))??;
        info!("MQTT Connected!");

        let mut topics = Vec::with_capacity(routes.len());
        for route in &routes {
            if let Err(e) = client.subscribe(&route.topic.topic, route.topic.qos).await {
                let _ = client.try_disconnect();
                return Err(IngestError::Transport(format!(
                    "subscribe failed for topic {}: {}",
                    route.topic.topic, e
                )));
            }
            info!(topic = %route.topic.topic, qos = ?route.topic.qos, kind = ?route.kind, "Listening for MQTT messages");
            topics.push(route.topic.topic.clone());
        }

        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(routes, self.processor.clone());
        let handle = tokio::spawn(
            run_event_loop(eventloop, dispatcher, settings.clone(), cancel.clone())
                .instrument(self.span.clone()),
        );

        *running = Some(Running {
            client,
            topics,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Unsubscribes and disconnects. Safe to call when not started.
    pub async fn stop(&self) {
        let Some(mut running) = self.running.lock().await.take() else {
            return;
        };

        for topic in &running.topics {
            if let Err(e) = running.client.try_unsubscribe(topic.as_str()) {
                warn!(topic = %topic, error = %e, "failed to unsubscribe from MQTT topic");
            }
        }
        if let Err(e) = running.client.try_disconnect() {
            warn!(error = %e, "failed to request MQTT disconnect");
        }

        if tokio::time::timeout(STOP_GRACE, &mut running.handle).await.is_err() {
            running.cancel.cancel();
            if let Err(e) = running.handle.await {
                error!(error = %e, "MQTT event loop ended abnormally");
            }
        }
        info!("Disconnected from MQTT broker");
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<()> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => continue,
            Err(e) => {
                return Err(IngestError::Transport(format!(
                    "failed to connect to MQTT broker: {}",
                    e
                )))
            }
        }
    }
}

/// Polls the broker until cancelled or disconnected. Polling again after an
/// error makes rumqttc reconnect; repeated failures trip a circuit breaker
/// that pauses polling for the configured cooldown.
async fn run_event_loop(
    mut eventloop: EventLoop,
    dispatcher: Dispatcher,
    settings: MqttSettings,
    cancel: CancellationToken,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if settings.max_retries > 0 && consecutive_failures >= settings.max_retries {
            warn!(
                failures = consecutive_failures,
                cooldown_secs = settings.circuit_breaker_cooldown.as_secs(),
                "Circuit breaker tripped, pausing MQTT polling"
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(settings.circuit_breaker_cooldown) => {}
            }
            consecutive_failures = 0;
            info!("Circuit breaker reset. Resuming consumption.");
        }

        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                consecutive_failures = 0;
                dispatcher.dispatch(&publish.topic, &publish.payload);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                consecutive_failures = 0;
                info!("MQTT reconnected");
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    error!(pkid = ack.pkid, "Broker rejected subscription");
                } else {
                    debug!(pkid = ack.pkid, "Subscription confirmed");
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, leaving MQTT event loop");
                break;
            }
            Ok(_) => {}
            Err(ConnectionError::RequestsDone) => break,
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    error = %e,
                    failures = consecutive_failures,
                    max_retries = settings.max_retries,
                    "MQTT connection error"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::TelemetryStore;
    use crate::ingestion::alert_engine::AlertEngine;
    use crate::ingestion::processor::ProcessorConfig;
    use crate::testing::{MemoryStore, DEVICE};

    fn settings() -> MqttSettings {
        MqttSettings {
            broker: "127.0.0.1".to_string(),
            port: 1,
            client_id: "test-client".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            connect_timeout: Duration::from_secs(2),
            max_retries: 5,
            circuit_breaker_cooldown: Duration::from_secs(60),
        }
    }

    fn config() -> IngestionConfig {
        IngestionConfig {
            mqtt: settings(),
            sensor: TopicConfig::new("devices/+/sensors", QoS::AtLeastOnce),
            location: TopicConfig::new("devices/+/location", QoS::AtMostOnce),
            status: TopicConfig::new("devices/+/status", QoS::AtMostOnce),
            heartbeat: TopicConfig::new("devices/#", QoS::AtMostOnce),
        }
    }

    fn processor() -> Arc<Processor> {
        let store: Arc<dyn TelemetryStore> = Arc::new(MemoryStore::default());
        Arc::new(Processor::new(
            store.clone(),
            AlertEngine::new(store),
            ProcessorConfig::default(),
            Span::none(),
        ))
    }

    #[test]
    fn test_topic_matching() {
        assert!(topic_matches("devices/+/sensors", "devices/abc/sensors"));
        assert!(!topic_matches("devices/+/sensors", "devices/abc/location"));
        assert!(!topic_matches("devices/+/sensors", "devices/abc/sensors/extra"));
        assert!(topic_matches("devices/#", "devices/abc/sensors"));
        assert!(topic_matches("devices/#", "devices"));
        assert!(topic_matches("sensors", "sensors"));
        assert!(!topic_matches("#", "$SYS/broker/uptime"));
    }

    #[test]
    fn test_empty_topic_is_disabled() {
        assert_eq!(TopicConfig::new("  ", QoS::AtLeastOnce), None);
    }

    #[test]
    fn test_first_matching_route_wins() {
        let dispatcher = Dispatcher::new(config().routes(), processor());
        assert_eq!(dispatcher.route("devices/x/sensors"), Some(TopicKind::Sensor));
        assert_eq!(dispatcher.route("devices/x/location"), Some(TopicKind::Location));
        assert_eq!(dispatcher.route("devices/x/status"), Some(TopicKind::Status));
        assert_eq!(dispatcher.route("devices/x/other"), Some(TopicKind::Heartbeat));
        assert_eq!(dispatcher.route("fleet/x"), None);
    }

    #[test]
    fn test_sensor_payload_reaches_processor() {
        let p = processor();
        let dispatcher = Dispatcher::new(config().routes(), p.clone());

        let payload = format!(r#"{{"device_id": "{}", "temperature": 45.0}}"#, DEVICE);
        dispatcher.dispatch("devices/1/sensors", payload.as_bytes());

        let m = p.get_metrics();
        assert_eq!(m.messages_received, 1);
        assert_eq!(m.messages_failed, 0);
    }

    #[test]
    fn test_malformed_and_invalid_payloads_are_counted() {
        let p = processor();
        let dispatcher = Dispatcher::new(config().routes(), p.clone());

        dispatcher.dispatch("devices/1/sensors", b"{broken");
        let payload = format!(r#"{{"device_id": "{}", "humidity": 140}}"#, DEVICE);
        dispatcher.dispatch("devices/1/sensors", payload.as_bytes());
        let payload = format!(r#"{{"device_id": "{}", "latitude": 12.0}}"#, DEVICE);
        dispatcher.dispatch("devices/1/location", payload.as_bytes());

        let m = p.get_metrics();
        assert_eq!(m.messages_failed, 3);
        assert_eq!(m.messages_received, 0);
    }

    #[test]
    fn test_status_and_heartbeat_are_only_observed() {
        let p = processor();
        let dispatcher = Dispatcher::new(config().routes(), p.clone());

        dispatcher.dispatch("devices/1/status", br#"{"device_id": "x", "status": "ok"}"#);
        dispatcher.dispatch("devices/1/ping", b"not json");

        assert_eq!(p.get_metrics(), Default::default());
    }

    #[tokio::test]
    async fn test_start_without_topics_fails_fast() {
        let config = IngestionConfig {
            mqtt: settings(),
            sensor: None,
            location: None,
            status: None,
            heartbeat: None,
        };
        let client = IngestionClient::new(config, processor(), Span::none());
        assert!(matches!(client.start().await, Err(IngestError::NoTopics)));
        assert!(!client.is_running().await);
    }

    #[tokio::test]
    async fn test_start_fails_when_broker_unreachable() {
        let client = IngestionClient::new(config(), processor(), Span::none());
        assert!(client.start().await.is_err());
        assert!(!client.is_running().await);
        // stop on a client that never started is a no-op
        client.stop().await;
    }
}
