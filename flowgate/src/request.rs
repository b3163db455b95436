//! The request view consumed by flow controllers
//!
//! A [`Request`] is built once per inbound call by the dispatch layer. It carries
//! the few OWS coordinates the controllers match on (service, operation, output
//! format), the resolved client address, the raw request headers, and a sink
//! for headers the controllers want added to the response (rate limit headers,
//! the session cookie).

use http::header::{HeaderMap, HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;

/// Header carrying the original client address when behind proxies
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Abstract view of one inbound OWS request
///
/// # Example
///
/// ```
/// use flowgate::Request;
///
/// let request = Request::builder()
///     .service("WMS")
///     .operation("GetMap")
///     .output_format("image/png")
///     .remote_ip("10.0.0.1".parse().unwrap())
///     .build();
///
/// assert_eq!(request.service(), Some("WMS"));
/// assert_eq!(request.remote_address(), Some("10.0.0.1"));
/// ```
#[derive(Debug)]
pub struct Request {
    service: Option<String>,
    operation: Option<String>,
    output_format: Option<String>,
    remote_address: Option<String>,
    headers: HeaderMap,
    sessions: Mutex<HashMap<String, String>>,
    response_headers: Mutex<HeaderMap>,
}

impl Request {
    /// Start building a request
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// OWS service name, as sent by the client (e.g. "WMS")
    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// OWS operation name, as sent by the client (e.g. "GetMap")
    pub fn operation(&self) -> Option<&str> {
        self.operation.as_deref()
    }

    /// Requested output format (e.g. "image/png")
    pub fn output_format(&self) -> Option<&str> {
        self.output_format.as_deref()
    }

    /// Client address: the first hop of `X-Forwarded-For` when present,
    /// otherwise the socket peer address
    pub fn remote_address(&self) -> Option<&str> {
        self.remote_address.as_deref()
    }

    /// Inbound request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Value of an inbound header, if present and valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Session identity under `name`, resolved once per request and name
    ///
    /// The first call for a name runs `resolve`; later calls for that name
    /// return the same value, so admission and completion always see one
    /// identity even when it had to be created for this request. Distinct
    /// names (one per session cookie) resolve independently.
    pub fn session_id(&self, name: &str, resolve: impl FnOnce(&Request) -> String) -> String {
        let mut sessions = self.sessions.lock();
        if let Some(id) = sessions.get(name) {
            return id.clone();
        }
        let id = resolve(self);
        sessions.insert(name.to_string(), id.clone());
        id
    }

    /// Append a header to the response
    pub fn append_response_header(&self, name: HeaderName, value: HeaderValue) {
        self.response_headers.lock().append(name, value);
    }

    /// Set (replace) a header on the response
    pub fn set_response_header(&self, name: HeaderName, value: HeaderValue) {
        self.response_headers.lock().insert(name, value);
    }

    /// Headers the controllers asked to add to the response
    pub fn response_headers(&self) -> HeaderMap {
        self.response_headers.lock().clone()
    }
}

/// Builder for [`Request`]
#[derive(Debug, Default)]
pub struct RequestBuilder {
    service: Option<String>,
    operation: Option<String>,
    output_format: Option<String>,
    peer: Option<IpAddr>,
    headers: HeaderMap,
}

impl RequestBuilder {
    pub fn service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }

    pub fn output_format(mut self, output_format: impl Into<String>) -> Self {
        self.output_format = Some(output_format.into());
        self
    }

    /// Socket peer address of the connection
    pub fn remote_ip(mut self, ip: IpAddr) -> Self {
        self.peer = Some(ip);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Add one inbound header; invalid names or values are ignored
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn build(self) -> Request {
        let remote_address =
            forwarded_for(&self.headers).or_else(|| self.peer.map(|ip| ip.to_string()));

        Request {
            service: self.service,
            operation: self.operation,
            output_format: self.output_format,
            remote_address,
            headers: self.headers,
            sessions: Mutex::new(HashMap::new()),
            response_headers: Mutex::new(HeaderMap::new()),
        }
    }
}

/// First non-empty hop of the `X-Forwarded-For` chain
fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|hop| !hop.is_empty())
        .map(str::to_string)
}
