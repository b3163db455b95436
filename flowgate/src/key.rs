//! Queuing keys for per-client flow control
//!
//! A [`KeyGenerator`] names the scope a request is throttled in. Per-key
//! controllers keep one gate (or one rate bucket) per distinct key.

use crate::Request;
use cookie::Cookie;
use http::header::{COOKIE, HeaderValue, SET_COOKIE};

/// Key used when a request carries no usable client address
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Default name of the cookie identifying a client session
pub const DEFAULT_SESSION_COOKIE: &str = "FLOWGATE_SESSION";

/// Derives the throttling key for a request
pub trait KeyGenerator: Send + Sync {
    /// Key for the request; must be stable across calls on one request
    fn key(&self, request: &Request) -> String;

    /// Short label used in logs and status output
    fn kind(&self) -> &'static str;
}

/// Keys requests by client address
///
/// The address already honours `X-Forwarded-For` (see
/// [`Request::remote_address`]), so clients behind a proxy are told apart.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpKeyGenerator;

impl KeyGenerator for IpKeyGenerator {
    fn key(&self, request: &Request) -> String {
        request
            .remote_address()
            .unwrap_or(UNKNOWN_CLIENT)
            .to_string()
    }

    fn kind(&self) -> &'static str {
        "ip"
    }
}

/// Keys requests by a dedicated session cookie
///
/// Clients presenting the cookie are keyed by its value. Clients without it
/// get a fresh random identity, sent back with `Set-Cookie` so follow-up
/// requests share the key. This does not require the client to log in and is
/// unrelated to any authentication cookie.
#[derive(Debug, Clone)]
pub struct CookieKeyGenerator {
    cookie_name: String,
}

impl CookieKeyGenerator {
    pub fn new() -> Self {
        Self::with_cookie_name(DEFAULT_SESSION_COOKIE)
    }

    pub fn with_cookie_name(cookie_name: impl Into<String>) -> Self {
        Self {
            cookie_name: cookie_name.into(),
        }
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    fn read_cookie(&self, request: &Request) -> Option<String> {
        request
            .headers()
            .get_all(COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| Cookie::split_parse(v.to_string()))
            .filter_map(Result::ok)
            .find(|c| c.name() == self.cookie_name && !c.value().is_empty())
            .map(|c| c.value().to_string())
    }

    fn issue_cookie(&self, request: &Request) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let cookie = Cookie::build((self.cookie_name.clone(), id.clone()))
            .path("/")
            .http_only(true)
            .build();

        match HeaderValue::from_str(&cookie.to_string()) {
            Ok(value) => request.append_response_header(SET_COOKIE, value),
            Err(e) => tracing::warn!("Unable to encode session cookie: {}", e),
        }
        tracing::debug!("Issued session cookie {}={}", self.cookie_name, id);
        id
    }
}

impl Default for CookieKeyGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyGenerator for CookieKeyGenerator {
    fn key(&self, request: &Request) -> String {
        request.session_id(&self.cookie_name, |request| {
            self.read_cookie(request)
                .unwrap_or_else(|| self.issue_cookie(request))
        })
    }

    fn kind(&self) -> &'static str {
        "cookie"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_key() {
        let request = Request::builder()
            .remote_ip("10.0.0.7".parse().unwrap())
            .build();
        assert_eq!(IpKeyGenerator.key(&request), "10.0.0.7");
    }

    #[test]
    fn test_ip_key_behind_proxy() {
        let request = Request::builder()
            .remote_ip("10.0.0.1".parse().unwrap())
            .header("X-Forwarded-For", "192.168.1.8")
            .build();
        assert_eq!(IpKeyGenerator.key(&request), "192.168.1.8");
    }

    #[test]
    fn test_ip_key_unknown() {
        let request = Request::builder().build();
        assert_eq!(IpKeyGenerator.key(&request), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_cookie_key_reads_existing_cookie() {
        let request = Request::builder()
            .header("Cookie", "JSESSIONID=xyz; FLOWGATE_SESSION=client-1")
            .build();
        let generator = CookieKeyGenerator::new();

        assert_eq!(generator.key(&request), "client-1");
        assert!(request.response_headers().get(SET_COOKIE).is_none());
    }

    #[test]
    fn test_cookie_key_issues_cookie_once() {
        let request = Request::builder().build();
        let generator = CookieKeyGenerator::new();

        let first = generator.key(&request);
        let second = generator.key(&request);
        assert_eq!(first, second);

        let headers = request.response_headers();
        let cookies: Vec<_> = headers.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        let cookie = cookies[0].to_str().unwrap();
        assert!(cookie.starts_with(&format!("FLOWGATE_SESSION={first}")));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/"));
    }

    #[test]
    fn test_cookie_key_custom_name() {
        let generator = CookieKeyGenerator::with_cookie_name("GS_FLOW_CONTROL");
        let request = Request::builder()
            .header("Cookie", "FLOWGATE_SESSION=a; GS_FLOW_CONTROL=b")
            .build();
        assert_eq!(generator.key(&request), "b");
    }

    #[test]
    fn test_generators_keep_their_own_cookie() {
        let request = Request::builder()
            .header("Cookie", "GS_USER=alice; GS_RATE=bob")
            .build();
        let user = CookieKeyGenerator::with_cookie_name("GS_USER");
        let rate = CookieKeyGenerator::with_cookie_name("GS_RATE");

        assert_eq!(user.key(&request), "alice");
        assert_eq!(rate.key(&request), "bob");
        assert_eq!(user.key(&request), "alice");
    }

    #[test]
    fn test_each_missing_cookie_is_issued() {
        let request = Request::builder().header("Cookie", "GS_USER=alice").build();
        let user = CookieKeyGenerator::with_cookie_name("GS_USER");
        let rate = CookieKeyGenerator::with_cookie_name("GS_RATE");

        assert_eq!(user.key(&request), "alice");
        let issued = rate.key(&request);
        assert_ne!(issued, "alice");
        assert_eq!(rate.key(&request), issued);

        let headers = request.response_headers();
        let cookies: Vec<_> = headers.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0]
            .to_str()
            .unwrap()
            .starts_with(&format!("GS_RATE={issued}")));
    }

    #[test]
    fn test_distinct_clients_get_distinct_keys() {
        let generator = CookieKeyGenerator::new();
        let a = generator.key(&Request::builder().build());
        let b = generator.key(&Request::builder().build());
        assert_ne!(a, b);
    }
}
