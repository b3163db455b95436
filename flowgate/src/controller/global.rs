use super::gate::SharedGate;
use super::{ControllerStatus, FlowController};
use crate::{FlowError, OwsRequestMatcher, PriorityProvider, Request, ThreadBlocker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Caps the number of requests processed at once, server wide
///
/// # Example
///
/// ```
/// use flowgate::{FlowController, GlobalFlowController, Request};
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let controller = GlobalFlowController::new(1);
/// let request = Request::builder().service("WMS").build();
///
/// assert!(controller.request_incoming(&request, Duration::ZERO).await.unwrap());
/// assert!(!controller.request_incoming(&request, Duration::ZERO).await.unwrap());
/// controller.request_complete(&request);
/// # });
/// ```
pub struct GlobalFlowController {
    gate: SharedGate,
}

impl GlobalFlowController {
    pub fn new(capacity: usize) -> Self {
        Self {
            gate: SharedGate::new(OwsRequestMatcher::new(), capacity, None),
        }
    }

    /// Queued requests are served by priority instead of arrival order
    pub fn with_priority(capacity: usize, provider: Arc<dyn PriorityProvider>) -> Self {
        Self {
            gate: SharedGate::new(OwsRequestMatcher::new(), capacity, Some(provider)),
        }
    }

    /// Restrict the controller to the requests `matcher` accepts
    pub fn with_matcher(
        matcher: OwsRequestMatcher,
        capacity: usize,
        provider: Option<Arc<dyn PriorityProvider>>,
    ) -> Self {
        Self {
            gate: SharedGate::new(matcher, capacity, provider),
        }
    }

    pub fn blocker(&self) -> &ThreadBlocker {
        self.gate.blocker()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.gate.blocker().set_capacity(capacity);
    }
}

#[async_trait]
impl FlowController for GlobalFlowController {
    fn priority(&self) -> i64 {
        self.gate.blocker().capacity() as i64
    }

    fn name(&self) -> String {
        if self.gate.matcher().is_any() {
            "global".to_string()
        } else {
            format!("global {}", self.gate.matcher())
        }
    }

    async fn request_incoming(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<bool, FlowError> {
        Ok(self.gate.enter(request, timeout).await)
    }

    fn request_complete(&self, request: &Request) {
        self.gate.leave(request);
    }

    fn status(&self) -> ControllerStatus {
        self.gate.status(self.name(), "global")
    }
}
