use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use super::queries;
use super::store::TelemetryStore;
use super::DbPool;
use crate::error::Result;
use crate::models::{Alert, NormalizedRecord, ShipmentRuleContext};

/// Rows per multi-value INSERT. 13 binds per row keeps this far below the
/// Postgres limit of 65535 bind parameters.
pub const INSERT_CHUNK_SIZE: usize = 500;

#[derive(Debug, FromRow)]
struct ActiveShipmentRow {
    shipment_id: Uuid,
    shipment_status: String,
    customer_id: Option<Uuid>,
    provider_id: Option<Uuid>,
    shipper_id: Option<Uuid>,
    rules_id: Option<Uuid>,
    report_cycle_sec: Option<i32>,
    temp_min: Option<f64>,
    temp_max: Option<f64>,
    humidity_min: Option<f64>,
    humidity_max: Option<f64>,
    light_max: Option<f64>,
    tilt_max_angle: Option<f64>,
    impact_threshold_g: Option<f64>,
}

impl From<ActiveShipmentRow> for ShipmentRuleContext {
    fn from(row: ActiveShipmentRow) -> Self {
        Self {
            shipment_id: row.shipment_id,
            shipment_status: row.shipment_status,
            customer_id: row.customer_id,
            provider_id: row.provider_id,
            shipper_id: row.shipper_id,
            has_rules: row.rules_id.is_some(),
            report_cycle_sec: row.report_cycle_sec,
            temp_min: row.temp_min,
            temp_max: row.temp_max,
            humidity_min: row.humidity_min,
            humidity_max: row.humidity_max,
            light_max: row.light_max,
            tilt_max_angle: row.tilt_max_angle,
            impact_threshold_g: row.impact_threshold_g,
        }
    }
}

/// Postgres implementation of [`TelemetryStore`].
#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: DbPool,
}

impl PgRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn build_insert(chunk: &[NormalizedRecord]) -> QueryBuilder<'_, Postgres> {
    let mut builder = QueryBuilder::new(queries::INSERT_SENSOR_DATA_PREFIX);
    builder.push_values(chunk, |mut b, r| {
        b.push_bind(r.time)
            .push_bind(r.device_id)
            .push_bind(r.latitude)
            .push_bind(r.longitude)
            .push_bind(r.altitude)
            .push_bind(r.speed)
            .push_bind(r.temperature)
            .push_bind(r.humidity)
            .push_bind(r.light_level)
            .push_bind(r.tilt_angle)
            .push_bind(r.impact_g)
            .push_bind(r.battery_level)
            .push_bind(r.signal_strength);
    });
    builder
}

#[async_trait]
impl TelemetryStore for PgRepository {
    async fn batch_insert(&self, records: &[NormalizedRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for chunk in records.chunks(INSERT_CHUNK_SIZE) {
            build_insert(chunk).build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        debug!(records = records.len(), "sensor batch committed");
        Ok(())
    }

    async fn get_active_context(&self, device_id: Uuid) -> Result<Option<ShipmentRuleContext>> {
        let row = sqlx::query_as::<_, ActiveShipmentRow>(queries::SELECT_ACTIVE_SHIPMENT_CONTEXT)
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(ShipmentRuleContext::from))
    }

    async fn insert_alert(&self, alert: &Alert) -> Result<()> {
        sqlx::query(queries::INSERT_ALERT)
            .bind(alert.time)
            .bind(alert.device_id)
            .bind(alert.shipment_id)
            .bind(alert.class.as_str())
            .bind(alert.severity.as_str())
            .bind(alert.violation.as_str())
            .bind(&alert.trigger_value)
            .bind(&alert.threshold_value)
            .bind(&alert.message)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_device_heartbeat(
        &self,
        device_id: Uuid,
        battery_level: Option<i32>,
    ) -> Result<()> {
        let now = Utc::now();
        let query = match battery_level {
            Some(level) => sqlx::query(queries::UPDATE_DEVICE_LAST_SEEN_BATTERY)
                .bind(device_id)
                .bind(now)
                .bind(level),
            None => sqlx::query(queries::UPDATE_DEVICE_LAST_SEEN)
                .bind(device_id)
                .bind(now),
        };
        query.execute(&self.pool).await?;
        Ok(())
    }
}
