use super::{ControllerStatus, FlowController};
use crate::{ConfigError, FlowError, KeyGenerator, OwsRequestMatcher, Request};
use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

pub const X_RATE_LIMIT_CONTEXT: HeaderName = HeaderName::from_static("x-ratelimit-context");
pub const X_RATE_LIMIT_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
pub const X_RATE_LIMIT_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");
pub const X_RATE_LIMIT_RESET: HeaderName = HeaderName::from_static("x-ratelimit-reset");
pub const X_RATE_LIMIT_ACTION: HeaderName = HeaderName::from_static("x-ratelimit-action");

/// Request budget of one client: `limit` requests per `window`
///
/// Parses from the compact form `<limit>/<unit>[;<delay>]`, where the unit
/// is one of `s`, `m`, `h`, `d` and the optional delay is written as `<n>ms`
/// or `<n>s`. Without a delay, excess requests are rejected outright.
///
/// ```
/// use flowgate::RateSpec;
/// use std::time::Duration;
///
/// let spec: RateSpec = "10/s;3s".parse().unwrap();
/// assert_eq!(spec.limit(), 10);
/// assert_eq!(spec.window(), Duration::from_secs(1));
/// assert_eq!(spec.max_wait(), Duration::from_secs(3));
/// ```
///
/// A spec is only built through [`RateSpec::new`] or parsing, both of which
/// reject a zero limit or window:
///
/// ```compile_fail
/// use flowgate::RateSpec;
/// use std::time::Duration;
///
/// let spec = RateSpec { limit: 1, window: Duration::ZERO, max_wait: Duration::ZERO };
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateSpec {
    limit: u64,
    /// `Duration::MAX` for a budget that never refills
    window: Duration,
    /// Longest an excess request is delayed; zero rejects with 429
    max_wait: Duration,
}

impl RateSpec {
    pub fn new(limit: u64, window: Duration, max_wait: Duration) -> Result<Self, ConfigError> {
        let spec = Self {
            limit,
            window,
            max_wait,
        };
        spec.validate(&format!("{limit}/{window:?}"))?;
        Ok(spec)
    }

    /// Requests allowed per window
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// `Duration::MAX` for a budget that never refills
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Longest an excess request is delayed; zero rejects with 429
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    fn validate(&self, value: &str) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidRate {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        if self.limit == 0 {
            return Err(invalid("limit must be greater than 0"));
        }
        if self.window.is_zero() {
            return Err(invalid("window must be greater than 0"));
        }
        Ok(())
    }
}

impl FromStr for RateSpec {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidRate {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (rate, delay) = match value.split_once(';') {
            Some((rate, delay)) => (rate, Some(delay.trim())),
            None => (value, None),
        };
        let (limit, unit) = rate
            .split_once('/')
            .ok_or_else(|| invalid("expected <limit>/<unit>"))?;
        let limit: u64 = limit
            .trim()
            .parse()
            .map_err(|_| invalid("limit is not a number"))?;
        let window = match unit.trim() {
            "s" => Duration::from_secs(1),
            "m" => Duration::from_secs(60),
            "h" => Duration::from_secs(3600),
            "d" => Duration::from_secs(86400),
            _ => return Err(invalid("unit must be one of s, m, h, d")),
        };
        let max_wait = match delay {
            None => Duration::ZERO,
            Some(delay) => {
                parse_delay(delay).ok_or_else(|| invalid("delay must be <n>ms or <n>s"))?
            }
        };

        let spec = Self {
            limit,
            window,
            max_wait,
        };
        spec.validate(value)?;
        Ok(spec)
    }
}

fn parse_delay(delay: &str) -> Option<Duration> {
    if let Some(ms) = delay.strip_suffix("ms") {
        ms.trim().parse().ok().map(Duration::from_millis)
    } else if let Some(secs) = delay.strip_suffix('s') {
        secs.trim().parse().ok().map(Duration::from_secs)
    } else {
        None
    }
}

/// Limits how many requests a client may issue per time window
///
/// Each key (client address or session cookie) owns a bucket of `limit`
/// tokens that refills at the start of every window. Excess requests are
/// delayed until the window resets, for at most `max_wait`, or rejected with
/// [`FlowError::TooManyRequests`] when `max_wait` is zero. Every matching
/// response carries the `X-RateLimit-*` headers.
///
/// Nothing is held between admission and completion, so
/// [`request_complete`](FlowController::request_complete) is a no-op.
pub struct RateFlowController {
    matcher: OwsRequestMatcher,
    key_generator: Box<dyn KeyGenerator>,
    spec: RateSpec,
    context: String,
    buckets: Mutex<Buckets>,
    delayed: AtomicUsize,
}

struct Buckets {
    entries: HashMap<String, Bucket>,
    next_sweep: Option<Instant>,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: Instant,
    remaining: u64,
}

/// Bucket state right after a lookup
enum Outcome {
    Admitted {
        remaining: u64,
        reset: Option<Duration>,
    },
    Exhausted {
        reset: Option<Duration>,
    },
}

impl RateFlowController {
    pub fn new(
        matcher: OwsRequestMatcher,
        key_generator: impl KeyGenerator + 'static,
        spec: RateSpec,
    ) -> Self {
        let now = Instant::now();
        Self {
            context: matcher.to_string(),
            matcher,
            key_generator: Box::new(key_generator),
            spec,
            buckets: Mutex::new(Buckets {
                entries: HashMap::new(),
                next_sweep: now.checked_add(spec.window),
            }),
            delayed: AtomicUsize::new(0),
        }
    }

    pub fn spec(&self) -> &RateSpec {
        &self.spec
    }

    pub fn matcher(&self) -> &OwsRequestMatcher {
        &self.matcher
    }

    /// Number of clients with a live bucket
    pub fn key_count(&self) -> usize {
        self.buckets.lock().entries.len()
    }

    /// Take one token, or report how long until the window resets
    fn try_consume(&self, key: &str, now: Instant) -> Outcome {
        let mut buckets = self.buckets.lock();
        if buckets.next_sweep.is_some_and(|at| now >= at) {
            buckets.sweep(now, self.spec.window);
        }

        let bucket = buckets
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                window_start: now,
                remaining: self.spec.limit,
            });
        bucket.refill(now, &self.spec);
        let reset = bucket.until_reset(now, self.spec.window);
        if bucket.remaining > 0 {
            bucket.remaining -= 1;
            Outcome::Admitted {
                remaining: bucket.remaining,
                reset,
            }
        } else {
            Outcome::Exhausted { reset }
        }
    }

    /// Take one token after a delay, even if the bucket is still empty
    fn consume_after_delay(&self, key: &str, now: Instant) -> (u64, Option<Duration>) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entries
            .entry(key.to_string())
            .or_insert_with(|| Bucket {
                window_start: now,
                remaining: self.spec.limit,
            });
        bucket.refill(now, &self.spec);
        bucket.remaining = bucket.remaining.saturating_sub(1);
        (bucket.remaining, bucket.until_reset(now, self.spec.window))
    }

    fn write_headers(&self, request: &Request, remaining: u64, reset: Option<Duration>) {
        let set = |name: HeaderName, value: String| match HeaderValue::from_str(&value) {
            Ok(value) => request.set_response_header(name, value),
            Err(e) => tracing::warn!("Unable to encode {} header: {}", name, e),
        };

        set(X_RATE_LIMIT_CONTEXT, self.context.clone());
        set(X_RATE_LIMIT_LIMIT, self.spec.limit.to_string());
        set(X_RATE_LIMIT_REMAINING, remaining.to_string());
        if let Some(reset) = reset {
            set(X_RATE_LIMIT_RESET, reset_seconds(reset).to_string());
        }
        set(X_RATE_LIMIT_ACTION, self.action());
    }

    fn action(&self) -> String {
        if self.spec.max_wait.is_zero() {
            "Reject excess requests".to_string()
        } else {
            format!("Delay excess requests {}ms", self.spec.max_wait.as_millis())
        }
    }
}

#[async_trait]
impl FlowController for RateFlowController {
    /// The request limit per window
    fn priority(&self) -> i64 {
        i64::try_from(self.spec.limit).unwrap_or(i64::MAX)
    }

    fn name(&self) -> String {
        let kind = self.key_generator.kind();
        if self.matcher.is_any() {
            format!("rate {kind}")
        } else {
            format!("rate {kind} {}", self.matcher)
        }
    }

    async fn request_incoming(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<bool, FlowError> {
        if !self.matcher.matches(request) {
            return Ok(true);
        }
        let key = self.key_generator.key(request);

        let reset = match self.try_consume(&key, Instant::now()) {
            Outcome::Admitted { remaining, reset } => {
                self.write_headers(request, remaining, reset);
                return Ok(true);
            }
            Outcome::Exhausted { reset } => reset,
        };

        self.write_headers(request, 0, reset);
        if self.spec.max_wait.is_zero() {
            tracing::debug!("Rejecting {} over {} rate limit", key, self.context);
            return Err(FlowError::TooManyRequests {
                context: self.context.clone(),
            });
        }

        let wait = reset.map_or(self.spec.max_wait, |r| r.min(self.spec.max_wait));
        if wait > timeout {
            tracing::debug!(
                "Delay of {:?} for {} exceeds the {:?} left to wait",
                wait,
                key,
                timeout
            );
            return Ok(false);
        }

        tracing::trace!("Delaying {} by {:?} over {} rate limit", key, wait, self.context);
        {
            let _delayed = DelayedGuard::enter(&self.delayed);
            tokio::time::sleep(wait).await;
        }

        let (remaining, reset) = self.consume_after_delay(&key, Instant::now());
        self.write_headers(request, remaining, reset);
        Ok(true)
    }

    fn request_complete(&self, _request: &Request) {}

    fn status(&self) -> ControllerStatus {
        ControllerStatus {
            name: self.name(),
            kind: "rate",
            priority: self.priority(),
            capacity: usize::try_from(self.spec.limit).unwrap_or(usize::MAX),
            running: 0,
            queued: self.delayed.load(Ordering::Relaxed),
            keys: self.key_count(),
        }
    }
}

impl Bucket {
    /// Start a fresh window when the current one has elapsed
    fn refill(&mut self, now: Instant, spec: &RateSpec) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if spec.window == Duration::MAX || elapsed < spec.window {
            return;
        }
        // Align to the window containing `now`
        let into_window = elapsed.as_nanos() % spec.window.as_nanos();
        self.window_start = now - Duration::from_nanos(into_window as u64);
        self.remaining = spec.limit;
    }

    /// `None` for a window that never resets
    fn until_reset(&self, now: Instant, window: Duration) -> Option<Duration> {
        if window == Duration::MAX {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.window_start);
        Some(window.saturating_sub(elapsed))
    }
}

impl Buckets {
    /// Drop buckets whose window has elapsed; a refill would reset them anyway
    fn sweep(&mut self, now: Instant, window: Duration) {
        let before = self.entries.len();
        self.entries
            .retain(|_, b| now.saturating_duration_since(b.window_start) < window);
        self.next_sweep = now.checked_add(window);

        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::trace!("Swept {} expired rate buckets", removed);
        }
    }
}

/// Whole seconds, rounded up so a client never retries too early
fn reset_seconds(reset: Duration) -> u64 {
    let secs = reset.as_secs();
    if reset.subsec_nanos() > 0 { secs + 1 } else { secs }
}

struct DelayedGuard<'a>(&'a AtomicUsize);

impl<'a> DelayedGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for DelayedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CookieKeyGenerator, IpKeyGenerator};
    use http::header::{COOKIE, SET_COOKIE};

    const LONG: Duration = Duration::from_secs(60);

    fn header(request: &Request, name: HeaderName) -> Option<String> {
        request
            .response_headers()
            .get(name)
            .map(|v| v.to_str().unwrap().to_string())
    }

    fn from_ip(ip: &str) -> Request {
        Request::builder()
            .service("WMS")
            .operation("GetMap")
            .remote_ip(ip.parse().unwrap())
            .build()
    }

    /// Session cookie value issued on a first response
    fn issued_cookie(request: &Request) -> String {
        let set_cookie = header(request, SET_COOKIE).unwrap();
        set_cookie.split(';').next().unwrap().to_string()
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_then_times_out_with_unbounded_window() {
        let spec = RateSpec::new(2, Duration::MAX, Duration::from_millis(1000)).unwrap();
        let controller =
            RateFlowController::new(OwsRequestMatcher::new(), CookieKeyGenerator::new(), spec);

        let first = Request::builder().build();
        assert!(controller.request_incoming(&first, LONG).await.unwrap());
        assert_eq!(header(&first, X_RATE_LIMIT_REMAINING).as_deref(), Some("1"));
        assert_eq!(header(&first, X_RATE_LIMIT_LIMIT).as_deref(), Some("2"));
        assert_eq!(
            header(&first, X_RATE_LIMIT_CONTEXT).as_deref(),
            Some("Any OGC request")
        );
        assert_eq!(header(&first, X_RATE_LIMIT_RESET), None);
        let cookie = issued_cookie(&first);

        let same_client = || Request::builder().header(COOKIE.as_str(), &cookie).build();

        let second = same_client();
        assert!(controller.request_incoming(&second, LONG).await.unwrap());
        assert_eq!(header(&second, X_RATE_LIMIT_REMAINING).as_deref(), Some("0"));
        assert_eq!(header(&second, SET_COOKIE), None);

        let third = same_client();
        let started = Instant::now();
        assert!(controller.request_incoming(&third, LONG).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(header(&third, X_RATE_LIMIT_REMAINING).as_deref(), Some("0"));
        assert_eq!(
            header(&third, X_RATE_LIMIT_ACTION).as_deref(),
            Some("Delay excess requests 1000ms")
        );

        let fourth = same_client();
        let started = Instant::now();
        assert!(
            !controller
                .request_incoming(&fourth, Duration::from_millis(500))
                .await
                .unwrap()
        );
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_rejects_when_no_delay_allowed() {
        let spec: RateSpec = "1/h".parse().unwrap();
        let controller = RateFlowController::new(
            OwsRequestMatcher::new().with_service("WMS"),
            IpKeyGenerator,
            spec,
        );

        let first = from_ip("10.0.0.1");
        assert!(controller.request_incoming(&first, LONG).await.unwrap());

        let second = from_ip("10.0.0.1");
        let err = controller.request_incoming(&second, LONG).await.unwrap_err();
        assert_eq!(
            err,
            FlowError::TooManyRequests {
                context: "wms".into()
            }
        );
        assert_eq!(header(&second, X_RATE_LIMIT_REMAINING).as_deref(), Some("0"));
        assert_eq!(
            header(&second, X_RATE_LIMIT_ACTION).as_deref(),
            Some("Reject excess requests")
        );
        assert_eq!(header(&second, X_RATE_LIMIT_RESET).as_deref(), Some("3600"));

        // Another client has its own budget
        let other = from_ip("10.0.0.2");
        assert!(controller.request_incoming(&other, LONG).await.unwrap());
        assert_eq!(controller.key_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_refills() {
        let controller =
            RateFlowController::new(OwsRequestMatcher::new(), IpKeyGenerator, "2/s".parse().unwrap());

        for _ in 0..2 {
            assert!(controller.request_incoming(&from_ip("10.0.0.1"), LONG).await.unwrap());
        }
        assert!(
            controller
                .request_incoming(&from_ip("10.0.0.1"), LONG)
                .await
                .is_err()
        );

        tokio::time::advance(Duration::from_millis(1500)).await;
        let request = from_ip("10.0.0.1");
        assert!(controller.request_incoming(&request, LONG).await.unwrap());
        assert_eq!(header(&request, X_RATE_LIMIT_REMAINING).as_deref(), Some("1"));
        assert_eq!(header(&request, X_RATE_LIMIT_RESET).as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_is_capped_by_window_reset() {
        let controller = RateFlowController::new(
            OwsRequestMatcher::new(),
            IpKeyGenerator,
            "1/s;10s".parse().unwrap(),
        );
        assert!(controller.request_incoming(&from_ip("10.0.0.1"), LONG).await.unwrap());

        tokio::time::advance(Duration::from_millis(400)).await;
        let started = Instant::now();
        let delayed = from_ip("10.0.0.1");
        assert!(controller.request_incoming(&delayed, LONG).await.unwrap());
        let waited = started.elapsed();
        assert!(waited >= Duration::from_millis(600) && waited < Duration::from_millis(700));
        // A fresh window started while sleeping
        assert_eq!(header(&delayed, X_RATE_LIMIT_REMAINING).as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_unmatched_requests_are_untouched() {
        let controller = RateFlowController::new(
            OwsRequestMatcher::new().with_service("WFS"),
            IpKeyGenerator,
            "1/d".parse().unwrap(),
        );
        let request = from_ip("10.0.0.1");
        for _ in 0..3 {
            assert!(controller.request_incoming(&request, LONG).await.unwrap());
        }
        assert!(request.response_headers().is_empty());
        assert_eq!(controller.key_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_buckets_are_swept() {
        let controller =
            RateFlowController::new(OwsRequestMatcher::new(), IpKeyGenerator, "5/s".parse().unwrap());
        for i in 0..4 {
            let request = from_ip(&format!("10.0.0.{i}"));
            assert!(controller.request_incoming(&request, LONG).await.unwrap());
        }
        assert_eq!(controller.key_count(), 4);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(controller.request_incoming(&from_ip("10.0.1.1"), LONG).await.unwrap());
        assert_eq!(controller.key_count(), 1);
    }

    #[test]
    fn test_status() {
        let controller = RateFlowController::new(
            OwsRequestMatcher::new().with_service("WMS").with_operation("GetMap"),
            CookieKeyGenerator::new(),
            "30/m;2s".parse().unwrap(),
        );
        let status = controller.status();
        assert_eq!(status.name, "rate cookie wms.getmap");
        assert_eq!(status.kind, "rate");
        assert_eq!(status.priority, 30);
        assert_eq!(status.capacity, 30);
        assert_eq!(status.queued, 0);
    }

    #[test]
    fn test_parse_rate_spec() {
        let spec: RateSpec = "10/s;3s".parse().unwrap();
        assert_eq!(
            spec,
            RateSpec::new(10, Duration::from_secs(1), Duration::from_secs(3)).unwrap()
        );

        let spec: RateSpec = "100/d;500ms".parse().unwrap();
        assert_eq!(spec.window(), Duration::from_secs(86400));
        assert_eq!(spec.max_wait(), Duration::from_millis(500));

        let spec: RateSpec = " 60 / m ".parse().unwrap();
        assert_eq!(spec.limit(), 60);
        assert_eq!(spec.max_wait(), Duration::ZERO);
    }

    #[test]
    fn test_parse_rate_spec_errors() {
        for bad in ["", "10", "x/s", "10/w", "10/s;3", "10/s;fast", "0/s", "-1/s"] {
            assert!(
                matches!(bad.parse::<RateSpec>(), Err(ConfigError::InvalidRate { .. })),
                "{bad:?} should not parse"
            );
        }
    }

    #[test]
    fn test_rate_spec_new_validates() {
        assert!(RateSpec::new(0, Duration::from_secs(1), Duration::ZERO).is_err());
        assert!(RateSpec::new(1, Duration::ZERO, Duration::ZERO).is_err());
        assert!(RateSpec::new(1, Duration::MAX, Duration::from_secs(1)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shortest_window_refills_repeatedly() {
        let spec = RateSpec::new(1, Duration::from_nanos(1), Duration::ZERO).unwrap();
        let controller = RateFlowController::new(OwsRequestMatcher::new(), IpKeyGenerator, spec);
        let request = Request::builder()
            .remote_ip("10.0.0.1".parse().unwrap())
            .build();

        for _ in 0..3 {
            assert!(controller.request_incoming(&request, LONG).await.unwrap());
            tokio::time::advance(Duration::from_millis(1)).await;
        }
    }
}
