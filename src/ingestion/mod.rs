pub mod alert_engine;
pub mod client;
pub mod metrics;
pub mod processor;
pub mod tasks;
pub mod validator;

pub use alert_engine::AlertEngine;
pub use client::{IngestionClient, IngestionConfig};
pub use metrics::{IngestMetrics, MetricsTracker};
pub use processor::{Processor, ProcessorConfig, ProcessorState};
pub use validator::ValidationError;
