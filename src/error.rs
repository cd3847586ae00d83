use thiserror::Error;

/// Error taxonomy for the orchestration core.
///
/// `Config` is fatal at startup. `Io`, `Capture`, and `Sync` are transient —
/// callers log and retry on the next cycle rather than propagating. `Store`
/// covers store errors recoverable by retry; `StoreFatal` is the corrupt/
/// unreachable case that drives the service into `Stopping`. `Duplicate` is
/// a non-error skip, never retried.
#[derive(Debug, Error)]
pub enum SurveillanceError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("camera '{id}' capture failed: {reason}")]
    Capture { id: String, reason: String },

    #[error("local store error: {0}")]
    Store(String),

    #[error("local store is unreachable or corrupt: {0}")]
    StoreFatal(String),

    #[error("segment index error: {0}")]
    Index(String),

    #[error("dispatcher error: {0}")]
    Dispatch(String),

    #[error("duplicate session for ({camera_id}, {filename})")]
    Duplicate { camera_id: String, filename: String },

    #[error("cloud sync error: {0}")]
    Sync(String),

    #[error("GPU telemetry error: {0}")]
    Gpu(String),

    #[error("service error: {0}")]
    Service(String),
}

impl From<rusqlite::Error> for SurveillanceError {
    fn from(e: rusqlite::Error) -> Self {
        SurveillanceError::Store(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SurveillanceError>;
