use thiserror::Error;

use super::types::{LimitStatus, RateLimitError};

/// Errors raised by the admission-control subsystem.
///
/// Backend failures (`BackendConnection`, `BackendOperation`) are kept
/// distinct from `RateLimitExceeded`: an unreachable store is neither an
/// allow nor a deny, and callers surface it as a 5xx.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("rate limit store is closed")]
    StoreClosed,

    #[error("rate limit store capacity exceeded")]
    StoreCapacityExceeded,

    #[error("unable to determine client identity: {0}")]
    InvalidIdentity(String),

    #[error("invalid rate limit configuration: {0}")]
    InvalidConfiguration(String),

    #[error("rate limit backend connection failed: {0}")]
    BackendConnection(String),

    #[error("rate limit backend operation failed: {0}")]
    BackendOperation(String),

    #[error("{error}")]
    RateLimitExceeded {
        status: Box<LimitStatus>,
        error: Box<RateLimitError>,
    },
}

impl AdmissionError {
    /// Whether the error means the backing store cannot currently be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            AdmissionError::StoreClosed | AdmissionError::BackendConnection(_)
        )
    }

    pub fn rejection(status: LimitStatus, error: RateLimitError) -> Self {
        AdmissionError::RateLimitExceeded {
            status: Box::new(status),
            error: Box::new(error),
        }
    }
}

impl From<redis::RedisError> for AdmissionError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            AdmissionError::BackendConnection(err.to_string())
        } else {
            AdmissionError::BackendOperation(err.to_string())
        }
    }
}

pub type AdmissionResult<T> = Result<T, AdmissionError>;
