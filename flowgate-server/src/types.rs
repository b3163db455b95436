//! Common types used by the HTTP surface
//!
//! - [`OwsParams`]: the OWS coordinates read from a request's KVP parameters
//! - [`StatusResponse`]: body of `GET /status`
//! - [`DispatchResponse`]: body answered for admitted requests when no
//!   upstream is configured
//! - [`ErrorResponse`]: body of every refusal

use flowgate::ControllerStatus;
use serde::{Deserialize, Serialize};

/// OWS coordinates of a request, taken from its KVP parameters
///
/// Parameter names are matched ignoring case, as OGC clients send them in
/// any case (`SERVICE`, `service`, `Service`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwsParams {
    pub service: Option<String>,
    pub request: Option<String>,
    pub output_format: Option<String>,
}

impl OwsParams {
    /// Extract from decoded query pairs
    ///
    /// `outputFormat` wins over `format` when both are present.
    pub fn from_pairs(pairs: &[(String, String)]) -> Self {
        let find = |name: &str| {
            pairs
                .iter()
                .find(|(key, value)| key.eq_ignore_ascii_case(name) && !value.trim().is_empty())
                .map(|(_, value)| value.trim().to_string())
        };
        Self {
            service: find("service"),
            request: find("request"),
            output_format: find("outputformat").or_else(|| find("format")),
        }
    }

    /// Fill a missing service from a service-specific endpoint (`/wms`)
    pub fn with_default_service(mut self, service: &str) -> Self {
        if self.service.is_none() && !service.is_empty() {
            self.service = Some(service.to_uppercase());
        }
        self
    }
}

/// Body of `GET /status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub uptime_seconds: u64,
    /// Overall admission timeout in force
    pub timeout_secs: u64,
    pub controllers: Vec<ControllerReport>,
}

/// Serializable mirror of [`ControllerStatus`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ControllerReport {
    pub name: String,
    pub kind: String,
    pub priority: i64,
    pub capacity: usize,
    pub running: usize,
    pub queued: usize,
    pub keys: usize,
}

impl From<ControllerStatus> for ControllerReport {
    fn from(status: ControllerStatus) -> Self {
        ControllerReport {
            name: status.name,
            kind: status.kind.to_string(),
            priority: status.priority,
            capacity: status.capacity,
            running: status.running,
            queued: status.queued,
            keys: status.keys,
        }
    }
}

/// Answer for an admitted request when there is no upstream to forward to
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchResponse {
    pub admitted: bool,
    pub service: Option<String>,
    pub request: Option<String>,
    pub output_format: Option<String>,
    /// Controllers that admitted the request
    pub controllers: usize,
}

/// Error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}
