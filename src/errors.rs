use thiserror::Error;

#[derive(Debug, Error)]
pub enum DjrError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DjrError {
    /// Short machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            DjrError::NotFound(_) => "not_found",
            DjrError::Conflict(_) => "conflict",
            DjrError::Validation(_) => "validation_error",
            DjrError::Spawn(_) => "spawn_error",
            DjrError::Storage(_) => "storage_error",
            DjrError::Timeout(_) => "timeout",
            DjrError::Internal(_) => "internal_error",
        }
    }
}

impl From<std::io::Error> for DjrError {
    fn from(err: std::io::Error) -> Self {
        DjrError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DjrError {
    fn from(err: serde_json::Error) -> Self {
        DjrError::Storage(err.to_string())
    }
}

impl From<uuid::Error> for DjrError {
    fn from(err: uuid::Error) -> Self {
        DjrError::Validation(err.to_string())
    }
}
