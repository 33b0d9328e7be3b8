use thiserror::Error;

use crate::ingestion::validator::ValidationError;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("failed to decode payload: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("no MQTT topics configured for ingestion")]
    NoTopics,

    #[error("persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("processor has already been stopped")]
    AlreadyStopped,
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
