//! Transport layer for the flow control gateway
//!
//! A transport accepts client connections, turns each inbound call into a
//! [`flowgate::Request`], runs it through the shared flow chain and answers
//! or forwards it. All transports share one [`FlowState`].
//!
//! # Available Transports
//!
//! - [`http`]: OGC KVP requests over HTTP, forwarded to the upstream server

pub mod http;

#[cfg(test)]
mod http_test;

use crate::state::FlowState;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for all transport implementations
#[async_trait]
pub trait Transport {
    /// Start the transport server
    ///
    /// Runs until an error occurs or the server shuts down.
    async fn start(self, state: Arc<FlowState>) -> Result<()>;
}
