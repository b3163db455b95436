//! # Flowgate
//!
//! Request flow control for OGC web services: concurrency gates, priority
//! queues and per-client rate limits, applied around request processing.
//!
//! ## Overview
//!
//! A server keeps a [`FlowChain`] of [`FlowController`]s. Every inbound
//! request is described by a [`Request`] and admitted through the chain
//! before it is processed:
//! - **Concurrency gates**: at most N requests processed at once, globally
//!   ([`GlobalFlowController`]), per service/operation/format
//!   ([`BasicOwsController`]) or per client ([`IpFlowController`],
//!   [`UserFlowController`], [`SingleIpFlowController`])
//! - **Queueing**: requests over capacity wait in FIFO order, or by priority
//!   when a [`PriorityProvider`] is configured
//! - **Rate limits**: a request budget per client and time window with
//!   `X-RateLimit-*` response headers ([`RateFlowController`])
//! - **Timeouts**: a request that waits longer than the chain timeout is
//!   refused with [`FlowError::Timeout`]
//!
//! ## Quick Start
//!
//! ```
//! use flowgate::{BasicOwsController, FlowChain, FlowController, GlobalFlowController, Request};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let chain = FlowChain::new(
//!     vec![
//!         Arc::new(GlobalFlowController::new(100)),
//!         Arc::new(BasicOwsController::with_operation("WMS", "GetMap", 8)),
//!     ],
//!     Duration::from_secs(60),
//! );
//!
//! let request = Arc::new(
//!     Request::builder()
//!         .service("WMS")
//!         .operation("GetMap")
//!         .remote_ip("10.0.0.1".parse().unwrap())
//!         .build(),
//! );
//!
//! match chain.admit(request).await {
//!     Ok(admission) => {
//!         // Process the request; dropping the admission releases the gates
//!         drop(admission);
//!     }
//!     Err(e) => println!("Refused with {}: {}", e.status_code(), e),
//! }
//! # });
//! ```
//!
//! ## Configuration
//!
//! [`FlowConfig`] describes a chain as data (TOML, YAML or JSON):
//!
//! ```
//! use flowgate::FlowConfig;
//!
//! let config: FlowConfig = serde_json::from_str(r#"{
//!     "timeout_secs": 30,
//!     "controllers": [
//!         { "type": "global", "capacity": 100 },
//!         { "type": "rate", "key": "ip", "service": "WMS", "rate": "10/s;3s" }
//!     ]
//! }"#).unwrap();
//!
//! let controllers = config.build().unwrap();
//! assert_eq!(controllers.len(), 2);
//! ```
//!
//! ## Features
//!
//! - `ahash` (default): Use AHash for the per-client maps

pub mod blocker;
pub mod chain;
pub mod config;
pub mod controller;
pub mod error;
pub mod filter;
pub mod key;
pub mod matcher;
pub mod priority;
pub mod request;

pub use blocker::ThreadBlocker;
pub use chain::{Admission, FlowChain};
pub use config::{ControllerRule, FlowConfig};
pub use controller::{
    BasicOwsController, ControllerStatus, FlowController, GlobalFlowController, IpFlowController,
    KeyedFlowController, RateFlowController, RateSpec, SingleIpFlowController, UserFlowController,
};
pub use error::{ConfigError, FlowError};
pub use filter::IpFilter;
pub use key::{CookieKeyGenerator, IpKeyGenerator, KeyGenerator};
pub use matcher::OwsRequestMatcher;
pub use priority::{HttpHeaderPriorityProvider, PriorityProvider};
pub use request::{Request, RequestBuilder};
