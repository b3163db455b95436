//! # Flowgate Server
//!
//! A flow control gateway for OGC web services (WMS, WFS, WCS, ...).
//!
//! ## Purpose
//!
//! Map servers degrade badly under bursts of expensive requests. Flowgate
//! sits in front of one and decides, per request, whether it runs now, waits
//! in a queue, or is refused:
//!
//! - **Cap concurrency** globally, per service/operation/format, per client
//!   address or per user session
//! - **Order queued requests** by a priority header
//! - **Rate limit clients** with a request budget per time window, delaying
//!   or rejecting the excess
//! - **Refuse blacklisted addresses** outright
//!
//! ## Quick Start
//!
//! ```bash
//! # Show all available options
//! flowgate --help
//!
//! # Protect a local GeoServer with a rule file
//! flowgate --port 8080 --rules flow.toml --upstream http://localhost:8081/geoserver
//!
//! # Try a rule file without an upstream: admitted requests get a JSON answer
//! flowgate --rules flow.toml
//! ```
//!
//! ## Configuration
//!
//! Process options come from CLI arguments or `FLOWGATE_` environment
//! variables (CLI takes precedence), see [`config`]. The flow control rules
//! live in a TOML, YAML or JSON file described by [`flowgate::FlowConfig`]:
//!
//! ```toml
//! timeout_secs = 30
//! blacklist = "192.168.1.8"
//!
//! [[controllers]]
//! type = "global"
//! capacity = 100
//!
//! [[controllers]]
//! type = "ows"
//! service = "WMS"
//! operation = "GetMap"
//! capacity = 16
//!
//! [[controllers]]
//! type = "rate"
//! key = "ip"
//! rate = "10/s;3s"
//! ```
//!
//! Sending `SIGHUP` re-reads the rule file. Requests already admitted finish
//! under the rules they were admitted with; a rule file that fails to parse
//! is logged and ignored.
//!
//! ## Endpoints
//!
//! - `/ows`, `/{service}`, `/{workspace}/{service}`: flow controlled dispatch
//! - `GET /status`: controller occupancy as JSON
//! - `GET /metrics`: Prometheus metrics
//! - `GET /health`: health check

pub mod config;
pub mod metrics;
pub mod state;
pub mod transport;
pub mod types;
