//! Request matching by OWS service, operation and output format

use crate::Request;
use std::fmt;

/// Decides whether a flow controller applies to a request
///
/// Matching is hierarchical: an empty matcher accepts every request; a
/// service restricts to that service; an operation additionally restricts to
/// that operation; an output format additionally restricts to that format.
/// All comparisons ignore ASCII case.
///
/// # Example
///
/// ```
/// use flowgate::{OwsRequestMatcher, Request};
///
/// let matcher = OwsRequestMatcher::new()
///     .with_service("WMS")
///     .with_operation("GetMap");
///
/// let request = Request::builder().service("wms").operation("GETMAP").build();
/// assert!(matcher.matches(&request));
/// assert_eq!(matcher.to_string(), "wms.getmap");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwsRequestMatcher {
    service: Option<String>,
    operation: Option<String>,
    output_format: Option<String>,
}

impl OwsRequestMatcher {
    /// A matcher accepting every request
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Only meaningful together with a service
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    /// Only meaningful together with a service and an operation
    pub fn with_output_format(mut self, output_format: impl Into<String>) -> Self {
        self.output_format = Some(output_format.into());
        self
    }

    /// Build from optional parts, ignoring blank values
    pub fn from_parts(
        service: Option<&str>,
        operation: Option<&str>,
        output_format: Option<&str>,
    ) -> Self {
        let non_blank = |v: Option<&str>| {
            v.map(str::trim)
                .filter(|v| !v.is_empty() && *v != "*")
                .map(str::to_string)
        };
        Self {
            service: non_blank(service),
            operation: non_blank(operation),
            output_format: non_blank(output_format),
        }
    }

    /// Whether this matcher accepts every request
    pub fn is_any(&self) -> bool {
        self.service.is_none()
    }

    pub fn matches(&self, request: &Request) -> bool {
        let Some(service) = &self.service else {
            return true;
        };
        if !eq_ignore_case(service, request.service()) {
            return false;
        }

        let Some(operation) = &self.operation else {
            return true;
        };
        if !eq_ignore_case(operation, request.operation()) {
            return false;
        }

        match &self.output_format {
            Some(format) => eq_ignore_case(format, request.output_format()),
            None => true,
        }
    }
}

fn eq_ignore_case(expected: &str, actual: Option<&str>) -> bool {
    actual.is_some_and(|actual| actual.eq_ignore_ascii_case(expected))
}

impl fmt::Display for OwsRequestMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(service) = &self.service else {
            return f.write_str("Any OGC request");
        };
        write!(f, "{}", service.to_lowercase())?;
        if let Some(operation) = &self.operation {
            write!(f, ".{}", operation.to_lowercase())?;
            if let Some(format) = &self.output_format {
                write!(f, ".{}", format.to_lowercase())?;
            }
        }
        Ok(())
    }
}
