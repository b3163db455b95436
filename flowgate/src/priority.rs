//! Request priorities for ranking queued waiters

use crate::Request;

/// Extracts a numeric priority from a request
///
/// Higher values are served first among queued requests. Priorities never
/// affect requests that are already running.
pub trait PriorityProvider: Send + Sync {
    fn priority(&self, request: &Request) -> i64;
}

/// Reads the priority from an HTTP request header
///
/// # Example
///
/// ```
/// use flowgate::{HttpHeaderPriorityProvider, PriorityProvider, Request};
///
/// let provider = HttpHeaderPriorityProvider::new("gs-priority", 0);
/// let request = Request::builder().header("gs-priority", "5").build();
/// assert_eq!(provider.priority(&request), 5);
/// ```
#[derive(Debug, Clone)]
pub struct HttpHeaderPriorityProvider {
    header: String,
    default_priority: i64,
}

impl HttpHeaderPriorityProvider {
    pub fn new(header: impl Into<String>, default_priority: i64) -> Self {
        Self {
            header: header.into(),
            default_priority,
        }
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    pub fn default_priority(&self) -> i64 {
        self.default_priority
    }
}

impl PriorityProvider for HttpHeaderPriorityProvider {
    fn priority(&self, request: &Request) -> i64 {
        match request.header(&self.header).map(str::trim) {
            Some(value) => value.parse().unwrap_or_else(|_| {
                tracing::debug!(
                    "Ignoring unparseable priority {:?} in header {}",
                    value,
                    self.header
                );
                self.default_priority
            }),
            None => self.default_priority,
        }
    }
}
