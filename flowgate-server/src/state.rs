//! Flow control state shared by every transport
//!
//! Holds the [`FlowChain`], the IP filter, the metrics and the upstream
//! client. [`FlowState::reload`] re-reads the rule file and swaps the chain
//! and filter in place; a rule file that fails to load leaves both untouched.

use crate::config::Config;
use crate::metrics::Metrics;
use anyhow::{Context, Result};
use flowgate::{FlowChain, FlowConfig, IpFilter, Request};
use parking_lot::RwLock;
use std::sync::Arc;

/// Where admitted requests go
pub struct Upstream {
    pub base_url: String,
    pub client: reqwest::Client,
}

impl Upstream {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(100)
            .build()
            .context("Failed to build upstream HTTP client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

pub struct FlowState {
    chain: FlowChain,
    filter: RwLock<IpFilter>,
    metrics: Metrics,
    upstream: Option<Upstream>,
    config: Option<Config>,
}

impl FlowState {
    /// Build from process configuration, loading the rule file
    pub fn from_config(config: &Config) -> Result<Arc<Self>> {
        let flow = config.load_rules()?;
        let mut state = Self::new(&flow, config.upstream.as_deref())?;
        state.config = Some(config.clone());
        Ok(Arc::new(state))
    }

    /// Build from rules directly; such a state has nothing to reload from
    pub fn new(flow: &FlowConfig, upstream: Option<&str>) -> Result<Self> {
        let controllers = flow.build().context("Invalid flow control rules")?;
        let filter = flow.ip_filter().context("Invalid IP filter")?;
        if controllers.is_empty() {
            tracing::warn!("No flow controllers configured, every request will be admitted");
        }

        Ok(Self {
            chain: FlowChain::new(controllers, flow.timeout()),
            filter: RwLock::new(filter),
            metrics: Metrics::new(),
            upstream: upstream.map(Upstream::new).transpose()?,
            config: None,
        })
    }

    /// Wrap an existing chain, with no IP filter
    pub fn with_chain(chain: FlowChain, upstream: Option<&str>) -> Result<Self> {
        Ok(Self {
            chain,
            filter: RwLock::new(IpFilter::default()),
            metrics: Metrics::new(),
            upstream: upstream.map(Upstream::new).transpose()?,
            config: None,
        })
    }

    pub fn chain(&self) -> &FlowChain {
        &self.chain
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn upstream(&self) -> Option<&Upstream> {
        self.upstream.as_ref()
    }

    pub fn is_blocked(&self, request: &Request) -> bool {
        self.filter.read().is_blocked(request)
    }

    pub fn set_filter(&self, filter: IpFilter) {
        *self.filter.write() = filter;
    }

    /// Re-read the rule file and swap in the new chain and filter
    ///
    /// Requests already admitted finish against the controllers they were
    /// admitted by.
    pub fn reload(&self) -> Result<()> {
        let Some(config) = &self.config else {
            tracing::info!("No rule source to reload from");
            return Ok(());
        };
        let flow = config.load_rules()?;
        self.apply(&flow)
    }

    /// Validate `flow` completely, then replace the chain and filter
    pub fn apply(&self, flow: &FlowConfig) -> Result<()> {
        let controllers = flow.build().context("Invalid flow control rules")?;
        let filter = flow.ip_filter().context("Invalid IP filter")?;

        self.chain.reload(controllers, flow.timeout());
        self.set_filter(filter);
        Ok(())
    }
}
