//! Errors raised by flow control and its configuration

use http::StatusCode;
use thiserror::Error;

/// Why a request was not admitted
///
/// # Example
///
/// ```
/// use flowgate::FlowError;
/// use http::StatusCode;
///
/// let err = FlowError::TooManyRequests { context: "wms.getmap".into() };
/// assert_eq!(err.status_code(), StatusCode::TOO_MANY_REQUESTS);
/// ```
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FlowError {
    /// The request waited its whole budget without being admitted
    #[error("request timed out waiting to be executed by {controller}, please lower your request rate")]
    Timeout { controller: String },
    /// A rate limit was exhausted and the controller rejects excess requests
    #[error(
        "too many requests in the current time period for {context}, check the X-RateLimit response headers"
    )]
    TooManyRequests { context: String },
}

impl FlowError {
    /// HTTP status the dispatch layer should answer with
    pub fn status_code(&self) -> StatusCode {
        match self {
            FlowError::Timeout { .. } => StatusCode::SERVICE_UNAVAILABLE,
            FlowError::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }
}

/// Invalid flow control configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid IP address {value:?} in {list}")]
    InvalidIp { list: &'static str, value: String },
    #[error("invalid rate specification {value:?}: {reason}")]
    InvalidRate { value: String, reason: String },
    #[error("invalid controller #{index}: {reason}")]
    InvalidController { index: usize, reason: String },
}
