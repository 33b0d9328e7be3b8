use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Alert, NormalizedRecord, ShipmentRuleContext};

/// Persistence boundary used by the ingestion pipeline.
///
/// Implementations do not retry and do not impose deadlines of their own;
/// callers wrap each call in `tokio::time::timeout`.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Writes all records in a single transaction. An empty slice is a no-op.
    async fn batch_insert(&self, records: &[NormalizedRecord]) -> Result<()>;

    /// Returns `None` when the device has no in-transit shipment.
    async fn get_active_context(&self, device_id: Uuid) -> Result<Option<ShipmentRuleContext>>;

    async fn insert_alert(&self, alert: &Alert) -> Result<()>;

    /// Refreshes `last_seen_at`, and `battery_level` when one was reported.
    async fn update_device_heartbeat(&self, device_id: Uuid, battery_level: Option<i32>)
        -> Result<()>;
}
