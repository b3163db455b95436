use super::{ControllerStatus, FlowController};
use crate::{
    CookieKeyGenerator, FlowError, IpKeyGenerator, KeyGenerator, OwsRequestMatcher, Request,
    ThreadBlocker,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "ahash")]
use ahash::AHashMap as HashMap;
#[cfg(not(feature = "ahash"))]
use std::collections::HashMap;

/// How long a per-key gate may sit unused before it is dropped
pub const DEFAULT_KEY_IDLE: Duration = Duration::from_secs(300);

/// Caps concurrent requests per client address
pub type IpFlowController = KeyedFlowController<IpKeyGenerator>;

/// Caps concurrent requests per client session (cookie)
pub type UserFlowController = KeyedFlowController<CookieKeyGenerator>;

/// One gate per key, created on first sight and dropped once idle
///
/// Gates unused for longer than the idle period, with nothing running and
/// nobody waiting, are evicted by a sweep that runs during lookups. A gate
/// that is being waited on or is still held is never evicted, so two gates
/// can never exist for one key at the same time.
///
/// # Example
///
/// ```
/// use flowgate::{FlowController, IpFlowController, Request};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let controller = IpFlowController::new(1);
/// let a = Request::builder().remote_ip("10.0.0.1".parse().unwrap()).build();
/// let b = Request::builder().remote_ip("10.0.0.2".parse().unwrap()).build();
///
/// // Different clients never contend
/// assert!(controller.request_incoming(&a, Duration::ZERO).await.unwrap());
/// assert!(controller.request_incoming(&b, Duration::ZERO).await.unwrap());
/// # });
/// ```
pub struct KeyedFlowController<K: KeyGenerator> {
    key_generator: K,
    matcher: OwsRequestMatcher,
    gates: KeyedGates,
    kind: &'static str,
}

impl IpFlowController {
    pub fn new(capacity: usize) -> Self {
        Self::with_key_generator(IpKeyGenerator, capacity, "ip")
    }
}

impl UserFlowController {
    pub fn new(capacity: usize) -> Self {
        Self::with_key_generator(CookieKeyGenerator::new(), capacity, "user")
    }
}

impl<K: KeyGenerator> KeyedFlowController<K> {
    pub fn with_key_generator(key_generator: K, capacity: usize, kind: &'static str) -> Self {
        Self {
            key_generator,
            matcher: OwsRequestMatcher::new(),
            gates: KeyedGates::new(capacity, DEFAULT_KEY_IDLE),
            kind,
        }
    }

    /// Restrict the controller to the requests `matcher` accepts
    pub fn matching(mut self, matcher: OwsRequestMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    /// Idle period after which unused gates are dropped
    pub fn idle_timeout(mut self, max_idle: Duration) -> Self {
        self.gates.max_idle = max_idle;
        self.gates.inner.get_mut().next_sweep = Instant::now() + max_idle;
        self
    }

    pub fn key_generator(&self) -> &K {
        &self.key_generator
    }

    /// Applies to existing gates and to gates created later
    pub fn set_capacity(&self, capacity: usize) {
        self.gates.set_capacity(capacity);
    }

    /// Number of keys currently tracked
    pub fn key_count(&self) -> usize {
        self.gates.len()
    }

    /// Gate for a key, if one exists
    pub fn blocker(&self, key: &str) -> Option<Arc<ThreadBlocker>> {
        self.gates.get(key)
    }

    /// Drop idle gates now instead of waiting for the next sweep
    pub fn evict_idle(&self) -> usize {
        self.gates.evict_idle(Instant::now())
    }
}

#[async_trait]
impl<K: KeyGenerator> FlowController for KeyedFlowController<K> {
    fn priority(&self) -> i64 {
        self.gates.capacity() as i64
    }

    fn name(&self) -> String {
        if self.matcher.is_any() {
            self.kind.to_string()
        } else {
            format!("{} {}", self.kind, self.matcher)
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
        let gate = self.gates.get_or_create(&key);
        let admitted = gate.acquire(timeout, 0).await;
        if !admitted {
            tracing::debug!("{} {} timed out waiting in its queue", self.kind, key);
        }
        Ok(admitted)
    }

    fn request_complete(&self, request: &Request) {
        if !self.matcher.matches(request) {
            return;
        }
        let key = self.key_generator.key(request);
        match self.gates.get(&key) {
            Some(gate) => gate.release(),
            None => tracing::warn!("No {} gate to release for {}", self.kind, key),
        }
    }

    fn status(&self) -> ControllerStatus {
        let (keys, running, queued) = self.gates.totals();
        ControllerStatus {
            name: self.name(),
            kind: self.kind,
            priority: self.priority(),
            capacity: self.gates.capacity(),
            running,
            queued,
            keys,
        }
    }
}

/// Lazily populated map of per-key gates
struct KeyedGates {
    inner: Mutex<GateMap>,
    max_idle: Duration,
}

struct GateMap {
    gates: HashMap<String, GateEntry>,
    capacity: usize,
    next_sweep: Instant,
}

struct GateEntry {
    blocker: Arc<ThreadBlocker>,
    last_used: Instant,
}

impl GateEntry {
    /// Unused for `max_idle`, not borrowed by any caller, nothing held or queued
    fn is_evictable(&self, now: Instant, max_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_used) >= max_idle
            && Arc::strong_count(&self.blocker) == 1
            && self.blocker.is_idle()
    }
}

impl KeyedGates {
    fn new(capacity: usize, max_idle: Duration) -> Self {
        Self {
            inner: Mutex::new(GateMap {
                gates: HashMap::new(),
                capacity,
                next_sweep: Instant::now() + max_idle,
            }),
            max_idle,
        }
    }

    fn get_or_create(&self, key: &str) -> Arc<ThreadBlocker> {
        let now = Instant::now();
        let mut map = self.inner.lock();
        if now >= map.next_sweep {
            let evicted = Self::sweep(&mut map, now, self.max_idle);
            if evicted > 0 {
                tracing::debug!("Evicted {} idle gates", evicted);
            }
        }

        let capacity = map.capacity;
        let entry = map
            .gates
            .entry(key.to_string())
            .or_insert_with(|| GateEntry {
                blocker: Arc::new(ThreadBlocker::new(capacity)),
                last_used: now,
            });
        entry.last_used = now;
        entry.blocker.clone()
    }

    fn get(&self, key: &str) -> Option<Arc<ThreadBlocker>> {
        let mut map = self.inner.lock();
        let entry = map.gates.get_mut(key)?;
        entry.last_used = Instant::now();
        Some(entry.blocker.clone())
    }

    fn evict_idle(&self, now: Instant) -> usize {
        let mut map = self.inner.lock();
        Self::sweep(&mut map, now, self.max_idle)
    }

    fn sweep(map: &mut GateMap, now: Instant, max_idle: Duration) -> usize {
        let before = map.gates.len();
        map.gates.retain(|_, entry| !entry.is_evictable(now, max_idle));
        map.next_sweep = now + max_idle;
        before - map.gates.len()
    }

    fn set_capacity(&self, capacity: usize) {
        let mut map = self.inner.lock();
        map.capacity = capacity;
        for entry in map.gates.values() {
            entry.blocker.set_capacity(capacity);
        }
    }

    fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    fn len(&self) -> usize {
        self.inner.lock().gates.len()
    }

    /// (keys, running, queued) summed over all gates
    fn totals(&self) -> (usize, usize, usize) {
        let map = self.inner.lock();
        let (running, queued) = map.gates.values().fold((0, 0), |(r, q), e| {
            (r + e.blocker.running(), q + e.blocker.queued())
        });
        (map.gates.len(), running, queued)
    }
}
