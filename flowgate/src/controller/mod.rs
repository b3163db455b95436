//! Flow controllers
//!
//! A [`FlowController`] admits, delays or rejects requests according to one
//! policy. The dispatch layer brackets every request with
//! [`request_incoming`](FlowController::request_incoming) and, only when that
//! returned `Ok(true)`, [`request_complete`](FlowController::request_complete).
//!
//! - [`GlobalFlowController`]: one gate for every request
//! - [`BasicOwsController`]: one gate per service/operation/format
//! - [`IpFlowController`], [`UserFlowController`]: one gate per client
//! - [`SingleIpFlowController`]: one gate for one pinned address
//! - [`RateFlowController`]: a request budget per client and time window

mod gate;
mod global;
mod keyed;
mod ows;
mod rate;
mod single_ip;

pub use global::GlobalFlowController;
pub use keyed::{IpFlowController, KeyedFlowController, UserFlowController};
pub use ows::BasicOwsController;
pub use rate::{
    RateFlowController, RateSpec, X_RATE_LIMIT_ACTION, X_RATE_LIMIT_CONTEXT, X_RATE_LIMIT_LIMIT,
    X_RATE_LIMIT_REMAINING, X_RATE_LIMIT_RESET,
};
pub use single_ip::SingleIpFlowController;

use crate::{FlowError, Request};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// An admission policy applied around request processing
#[async_trait]
pub trait FlowController: Send + Sync {
    /// Display and ordering number (queue capacity for gate-based controllers)
    fn priority(&self) -> i64;

    /// Human readable name, used in logs, errors and status output
    fn name(&self) -> String;

    /// Wait for admission
    ///
    /// Returns `Ok(true)` when the request may proceed (including when this
    /// controller does not apply to it) and `Ok(false)` when `timeout` ran out
    /// first. Only after `Ok(true)` must the caller invoke
    /// [`request_complete`](Self::request_complete).
    async fn request_incoming(
        &self,
        request: &Request,
        timeout: Duration,
    ) -> Result<bool, FlowError>;

    /// Release whatever [`request_incoming`](Self::request_incoming) acquired
    fn request_complete(&self, request: &Request);

    /// Current occupancy snapshot
    fn status(&self) -> ControllerStatus;
}

/// Point-in-time view of a controller's occupancy
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControllerStatus {
    pub name: String,
    pub kind: &'static str,
    pub priority: i64,
    /// Permits per gate
    pub capacity: usize,
    /// Permits held, summed over all gates
    pub running: usize,
    /// Waiters, summed over all gates
    pub queued: usize,
    /// Distinct keys tracked (per-client controllers only)
    pub keys: usize,
}
