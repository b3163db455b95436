use super::gate::SharedGate;
use super::{ControllerStatus, FlowController};
use crate::{FlowError, OwsRequestMatcher, Request, ThreadBlocker};
use async_trait::async_trait;
use std::net::IpAddr;
use std::time::Duration;

/// Caps concurrent requests from one pinned client address
///
/// Every other client bypasses the controller entirely.
pub struct SingleIpFlowController {
    ip: IpAddr,
    gate: SharedGate,
}

impl SingleIpFlowController {
    pub fn new(ip: IpAddr, capacity: usize) -> Self {
        Self::with_matcher(ip, OwsRequestMatcher::new(), capacity)
    }

    pub fn with_matcher(ip: IpAddr, matcher: OwsRequestMatcher, capacity: usize) -> Self {
        Self {
            ip,
            gate: SharedGate::new(matcher, capacity, None),
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn blocker(&self) -> &ThreadBlocker {
        self.gate.blocker()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.gate.blocker().set_capacity(capacity);
    }

    fn applies_to(&self, request: &Request) -> bool {
        request
            .remote_address()
            .and_then(|addr| addr.parse::<IpAddr>().ok())
            .is_some_and(|addr| addr == self.ip)
    }
}

#[async_trait]
impl FlowController for SingleIpFlowController {
    fn priority(&self) -> i64 {
        self.gate.blocker().capacity() as i64
    }

    fn name(&self) -> String {
        if self.gate.matcher().is_any() {
            format!("single-ip {}", self.ip)
        } else {
            format!("single-ip {} {}", self.ip, self.gate.matcher())
        }
    }

    async fn request_incoming(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<bool, FlowError> {
        if !self.applies_to(request) {
            return Ok(true);
        }
        Ok(self.gate.enter(request, timeout).await)
    }

    fn request_complete(&self, request: &Request) {
        if self.applies_to(request) {
            self.gate.leave(request);
        }
    }

    fn status(&self) -> ControllerStatus {
        self.gate.status(self.name(), "single-ip")
    }
}
