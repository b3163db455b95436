use super::gate::SharedGate;
use super::{ControllerStatus, FlowController};
use crate::{FlowError, OwsRequestMatcher, PriorityProvider, Request, ThreadBlocker};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Caps concurrent requests for one service, optionally narrowed to an
/// operation and an output format
///
/// # Example
///
/// ```
/// use flowgate::{BasicOwsController, FlowController, Request};
///
/// let controller = BasicOwsController::with_operation("WMS", "GetMap", 4);
/// assert_eq!(controller.name(), "wms.getmap");
/// assert_eq!(controller.priority(), 4);
/// ```
pub struct BasicOwsController {
    gate: SharedGate,
}

impl BasicOwsController {
    pub fn new(service: &str, capacity: usize) -> Self {
        Self::with_matcher(OwsRequestMatcher::new().with_service(service), capacity, None)
    }

    pub fn with_operation(service: &str, operation: &str, capacity: usize) -> Self {
        let matcher = OwsRequestMatcher::new()
            .with_service(service)
            .with_operation(operation);
        Self::with_matcher(matcher, capacity, None)
    }

    pub fn with_output_format(
        service: &str,
        operation: &str,
        output_format: &str,
        capacity: usize,
    ) -> Self {
        let matcher = OwsRequestMatcher::new()
            .with_service(service)
            .with_operation(operation)
            .with_output_format(output_format);
        Self::with_matcher(matcher, capacity, None)
    }

    /// Full control over matching and queue ordering
    pub fn with_matcher(
        matcher: OwsRequestMatcher,
        capacity: usize,
        priority_provider: Option<Arc<dyn PriorityProvider>>,
    ) -> Self {
        Self {
            gate: SharedGate::new(matcher, capacity, priority_provider),
        }
    }

    pub fn matcher(&self) -> &OwsRequestMatcher {
        self.gate.matcher()
    }

    pub fn matches(&self, request: &Request) -> bool {
        self.gate.matcher().matches(request)
    }

    pub fn blocker(&self) -> &ThreadBlocker {
        self.gate.blocker()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.gate.blocker().set_capacity(capacity);
    }
}

#[async_trait]
impl FlowController for BasicOwsController {
    /// Equal to the queue capacity
    fn priority(&self) -> i64 {
        self.gate.blocker().capacity() as i64
    }

    fn name(&self) -> String {
        self.gate.matcher().to_string()
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
        self.gate.status(self.name(), "ows")
    }
}
