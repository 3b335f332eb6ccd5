use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid start index: {0:?}")]
    InvalidStartIndex(String),
}
