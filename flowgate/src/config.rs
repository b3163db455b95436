//! Serializable flow control rules
//!
//! A [`FlowConfig`] is usually loaded from a TOML, YAML or JSON file by the
//! server. [`FlowConfig::build`] turns the rules into controllers, rejecting
//! malformed values up front.
//!
//! ```toml
//! timeout_secs = 30
//! blacklist = "192.168.1.8"
//!
//! [priority]
//! header = "gs-priority"
//! default = 0
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
//! service = "WMS"
//! rate = "10/s;3s"
//! ```

use crate::controller::{
    BasicOwsController, FlowController, GlobalFlowController, IpFlowController,
    KeyedFlowController, RateFlowController, RateSpec, SingleIpFlowController, UserFlowController,
};
use crate::{
    ConfigError, CookieKeyGenerator, HttpHeaderPriorityProvider, IpFilter, IpKeyGenerator,
    OwsRequestMatcher, PriorityProvider,
};
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Complete flow control setup
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FlowConfig {
    /// Overall time a request may wait for admission
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Orders queued requests by a header value on global and OWS gates
    #[serde(default)]
    pub priority: Option<PriorityConfig>,

    /// Comma separated client addresses to refuse
    #[serde(default)]
    pub blacklist: Option<String>,

    /// Comma separated client addresses exempt from the blacklist
    #[serde(default)]
    pub whitelist: Option<String>,

    /// Idle time after which per-client gates are dropped
    #[serde(default = "default_key_idle_secs")]
    pub key_idle_secs: u64,

    /// Controllers, applied in this order
    #[serde(default)]
    pub controllers: Vec<ControllerRule>,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_key_idle_secs() -> u64 {
    300
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            priority: None,
            blacklist: None,
            whitelist: None,
            key_idle_secs: default_key_idle_secs(),
            controllers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PriorityConfig {
    pub header: String,
    #[serde(default)]
    pub default: i64,
}

/// Optional request restriction shared by the rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MatcherRule {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub operation: Option<String>,
    #[serde(default)]
    pub output_format: Option<String>,
}

impl MatcherRule {
    fn matcher(&self) -> OwsRequestMatcher {
        OwsRequestMatcher::from_parts(
            self.service.as_deref(),
            self.operation.as_deref(),
            self.output_format.as_deref(),
        )
    }
}

/// How a rate rule tells clients apart
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateKey {
    #[default]
    Cookie,
    Ip,
}

/// One controller, tagged by `type`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControllerRule {
    Global {
        capacity: usize,
        #[serde(flatten)]
        matcher: MatcherRule,
    },
    Ows {
        capacity: usize,
        #[serde(flatten)]
        matcher: MatcherRule,
    },
    Ip {
        capacity: usize,
        #[serde(flatten)]
        matcher: MatcherRule,
    },
    SingleIp {
        ip: String,
        capacity: usize,
        #[serde(flatten)]
        matcher: MatcherRule,
    },
    User {
        capacity: usize,
        #[serde(default)]
        cookie: Option<String>,
        #[serde(flatten)]
        matcher: MatcherRule,
    },
    Rate {
        #[serde(default)]
        key: RateKey,
        #[serde(default)]
        cookie: Option<String>,
        /// Compact form, e.g. `10/s;3s`
        #[serde(default)]
        rate: Option<String>,
        #[serde(default)]
        limit: Option<u64>,
        /// Unbounded when absent
        #[serde(default)]
        window_ms: Option<u64>,
        #[serde(default)]
        max_wait_ms: Option<u64>,
        #[serde(flatten)]
        matcher: MatcherRule,
    },
}

impl FlowConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn key_idle(&self) -> Duration {
        Duration::from_secs(self.key_idle_secs)
    }

    pub fn ip_filter(&self) -> Result<IpFilter, ConfigError> {
        IpFilter::parse(
            self.blacklist.as_deref().unwrap_or_default(),
            self.whitelist.as_deref().unwrap_or_default(),
        )
    }

    /// Build the controllers in configured order
    pub fn build(&self) -> Result<Vec<Arc<dyn FlowController>>, ConfigError> {
        let priority: Option<Arc<dyn PriorityProvider>> = self.priority.as_ref().map(|p| {
            Arc::new(HttpHeaderPriorityProvider::new(p.header.clone(), p.default))
                as Arc<dyn PriorityProvider>
        });

        self.controllers
            .iter()
            .enumerate()
            .map(|(index, rule)| rule.build(index, priority.clone(), self.key_idle()))
            .collect()
    }
}

impl ControllerRule {
    fn build(
        &self,
        index: usize,
        priority: Option<Arc<dyn PriorityProvider>>,
        key_idle: Duration,
    ) -> Result<Arc<dyn FlowController>, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidController { index, reason };

        let controller: Arc<dyn FlowController> = match self {
            ControllerRule::Global { capacity, matcher } => Arc::new(
                GlobalFlowController::with_matcher(matcher.matcher(), *capacity, priority),
            ),
            ControllerRule::Ows { capacity, matcher } => {
                let matcher = matcher.matcher();
                if matcher.is_any() {
                    return Err(invalid("ows controller requires a service".to_string()));
                }
                Arc::new(BasicOwsController::with_matcher(matcher, *capacity, priority))
            }
            ControllerRule::Ip { capacity, matcher } => Arc::new(
                IpFlowController::new(*capacity)
                    .matching(matcher.matcher())
                    .idle_timeout(key_idle),
            ),
            ControllerRule::SingleIp {
                ip,
                capacity,
                matcher,
            } => {
                let ip: IpAddr = ip
                    .trim()
                    .parse()
                    .map_err(|_| invalid(format!("invalid IP address {ip:?}")))?;
                Arc::new(SingleIpFlowController::with_matcher(
                    ip,
                    matcher.matcher(),
                    *capacity,
                ))
            }
            ControllerRule::User {
                capacity,
                cookie,
                matcher,
            } => {
                let controller = match cookie {
                    Some(name) => KeyedFlowController::with_key_generator(
                        CookieKeyGenerator::with_cookie_name(name.as_str()),
                        *capacity,
                        "user",
                    ),
                    None => UserFlowController::new(*capacity),
                };
                Arc::new(
                    controller
                        .matching(matcher.matcher())
                        .idle_timeout(key_idle),
                )
            }
            ControllerRule::Rate {
                key,
                cookie,
                rate,
                limit,
                window_ms,
                max_wait_ms,
                matcher,
            } => {
                let spec = match (rate, limit) {
                    (Some(_), None) if window_ms.is_some() || max_wait_ms.is_some() => {
                        return Err(invalid(
                            "window_ms and max_wait_ms go with limit, not rate".to_string(),
                        ));
                    }
                    (Some(rate), None) => rate.parse::<RateSpec>()?,
                    (None, Some(limit)) => RateSpec::new(
                        *limit,
                        window_ms.map_or(Duration::MAX, Duration::from_millis),
                        Duration::from_millis(max_wait_ms.unwrap_or_default()),
                    )?,
                    (Some(_), Some(_)) => {
                        return Err(invalid("set either rate or limit, not both".to_string()));
                    }
                    (None, None) => {
                        return Err(invalid(
                            "rate controller requires rate or limit".to_string(),
                        ));
                    }
                };
                let matcher = matcher.matcher();
                match key {
                    RateKey::Ip => {
                        Arc::new(RateFlowController::new(matcher, IpKeyGenerator, spec))
                    }
                    RateKey::Cookie => {
                        let generator = match cookie {
                            Some(name) => CookieKeyGenerator::with_cookie_name(name.as_str()),
                            None => CookieKeyGenerator::new(),
                        };
                        Arc::new(RateFlowController::new(matcher, generator, spec))
                    }
                }
            }
        };

        tracing::debug!("Configured controller #{}: {}", index, controller.name());
        Ok(controller)
    }
}
