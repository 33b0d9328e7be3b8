use shipment_telemetry::config::AppConfig;
use shipment_telemetry::db::{self, PgRepository, TelemetryStore};
use shipment_telemetry::ingestion::{AlertEngine, IngestionClient, Processor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn};

const SIDE_TASK_DRAIN: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load config
    let config = AppConfig::load()?;

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(&config.log_level)
        .init();

    info!("Starting shipment telemetry ingestion...");

    // Init DB
    let pool = db::init_pool(&config.database_url, config.db_max_connections).await?;
    info!("Connected to database");

    let store: Arc<dyn TelemetryStore> = Arc::new(PgRepository::new(pool));
    let alert_engine = AlertEngine::new(store.clone());

    let processor = Arc::new(Processor::new(
        store,
        alert_engine,
        config.processor_config(),
        info_span!("processor"),
    ));
    processor.start()?;

    let client = IngestionClient::new(
        config.ingestion_config(),
        processor.clone(),
        info_span!("mqtt"),
    );
    if let Err(e) = client.start().await {
        processor.stop().await;
        return Err(e.into());
    }

    shutdown_signal().await;
    info!("Shutdown signal received");

    client.stop().await;
    processor.stop().await;
    if !processor.wait_side_tasks(SIDE_TASK_DRAIN).await {
        warn!("Some alert or heartbeat tasks were still running at exit");
    }

    let m = processor.get_metrics();
    info!(
        received = m.messages_received,
        processed = m.messages_processed,
        failed = m.messages_failed,
        inserted = m.records_inserted,
        alerts = m.alerts_generated,
        "Final ingestion metrics"
    );

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
