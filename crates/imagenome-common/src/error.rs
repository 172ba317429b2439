use thiserror::Error;

/// Failures reported by an inference capability (classifier or annotator).
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CapabilityError {
    #[error("capability timed out: {0}")]
    Timeout(String),

    #[error("capability resources exhausted: {0}")]
    Resource(String),

    /// The batch contained input the model rejected. Callers isolate the
    /// offending records by retrying them one at a time.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("capability returned {actual} outputs for {expected} inputs")]
    OutputMismatch { expected: usize, actual: usize },

    #[error("capability unavailable: {0}")]
    Unavailable(String),
}

impl CapabilityError {
    /// Timeouts and resource exhaustion are retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, CapabilityError::Timeout(_) | CapabilityError::Resource(_))
    }

    /// Map a failed HTTP status from a remote inference endpoint.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("[{status}] {}", message.into());
        match status {
            408 | 504 => CapabilityError::Timeout(message),
            429 | 503 => CapabilityError::Resource(message),
            400 | 413 | 422 => CapabilityError::MalformedInput(message),
            _ => CapabilityError::Unavailable(message),
        }
    }
}

/// Transport failures from an HTTP capability: timeouts are transient, a
/// status maps like any other failed response, anything else means the
/// endpoint is unusable.
impl From<reqwest::Error> for CapabilityError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CapabilityError::Timeout(err.to_string())
        } else if let Some(status) = err.status() {
            CapabilityError::from_status(status.as_u16(), err.to_string())
        } else {
            CapabilityError::Unavailable(err.to_string())
        }
    }
}

/// Run-level error taxonomy surfaced to the operator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("parse error in {unit}: {message}")]
    Parse { unit: String, message: String },

    #[error("archive integrity error in shard {shard_id}: {message}")]
    ArchiveIntegrity { shard_id: u64, message: String },

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("store write failed after {attempts} attempts: {message}")]
    StoreWrite { attempts: u32, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
