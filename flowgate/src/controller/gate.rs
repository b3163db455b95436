use super::ControllerStatus;
use crate::{OwsRequestMatcher, PriorityProvider, Request, ThreadBlocker};
use std::sync::Arc;
use std::time::Duration;

/// A matcher in front of one shared gate
pub(super) struct SharedGate {
    matcher: OwsRequestMatcher,
    blocker: ThreadBlocker,
    priority_provider: Option<Arc<dyn PriorityProvider>>,
}

impl SharedGate {
    pub(super) fn new(
        matcher: OwsRequestMatcher,
        capacity: usize,
        priority_provider: Option<Arc<dyn PriorityProvider>>,
    ) -> Self {
        let blocker = if priority_provider.is_some() {
            ThreadBlocker::prioritized(capacity)
        } else {
            ThreadBlocker::new(capacity)
        };
        Self {
            matcher,
            blocker,
            priority_provider,
        }
    }

    pub(super) fn matcher(&self) -> &OwsRequestMatcher {
        &self.matcher
    }

    pub(super) fn blocker(&self) -> &ThreadBlocker {
        &self.blocker
    }

    pub(super) async fn enter(&self, request: &Request, timeout: Duration) -> bool {
        if !self.matcher.matches(request) {
            return true;
        }
        let priority = self
            .priority_provider
            .as_ref()
            .map_or(0, |p| p.priority(request));
        self.blocker.acquire(timeout, priority).await
    }

    pub(super) fn leave(&self, request: &Request) {
        if self.matcher.matches(request) {
            self.blocker.release();
        }
    }

    pub(super) fn status(&self, name: String, kind: &'static str) -> ControllerStatus {
        ControllerStatus {
            name,
            kind,
            priority: self.blocker.capacity() as i64,
            capacity: self.blocker.capacity(),
            running: self.blocker.running(),
            queued: self.blocker.queued(),
            keys: 0,
        }
    }
}
