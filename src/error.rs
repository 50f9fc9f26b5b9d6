use thiserror::Error;

/// Failures talking to a monitored router.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectionError {
    #[error("device {0} is not connected")]
    NotConnected(i64),
    #[error("device {device_id} is unreachable: {reason}")]
    Unreachable { device_id: i64, reason: String },
    #[error("authentication failed for device {0}")]
    AuthFailed(i64),
    #[error("device {0} did not answer in time")]
    Timeout(i64),
}

/// Rejected user input. Never changes state.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The external anomaly predictor could not produce a verdict.
#[derive(Debug, Error)]
pub enum PredictorError {
    #[error("failed to start predictor: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("predictor exited with status {code:?}: {stderr}")]
    Exited { code: Option<i32>, stderr: String },
    #[error("predictor returned malformed output: {0}")]
    Malformed(String),
    #[error("predictor reported an error: {0}")]
    Reported(String),
    #[error("predictor did not answer within {0} ms")]
    Timeout(u64),
    #[error("predictor request failed: {0}")]
    Http(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Why a single device poll did not complete.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("poll exceeded {0} ms")]
    TimedOut(u64),
    #[error("device {0} is already being polled or no poll slot is free")]
    Busy(i64),
    #[error("poll was cancelled")]
    Cancelled,
}

/// A traffic analysis that produced no verdict, or whose verdict was not stored.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error(transparent)]
    Predictor(#[from] PredictorError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
