//! Client address blacklist, applied before flow control

use crate::{ConfigError, Request};
use std::collections::HashSet;
use std::net::IpAddr;

/// Rejects requests from blacklisted addresses unless whitelisted
///
/// ```
/// use flowgate::{IpFilter, Request};
///
/// let filter = IpFilter::parse("192.168.1.8, 192.168.1.9", "192.168.1.9").unwrap();
/// let blocked = Request::builder().remote_ip("192.168.1.8".parse().unwrap()).build();
/// let allowed = Request::builder().remote_ip("192.168.1.9".parse().unwrap()).build();
///
/// assert!(filter.is_blocked(&blocked));
/// assert!(!filter.is_blocked(&allowed));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpFilter {
    blacklist: HashSet<IpAddr>,
    whitelist: HashSet<IpAddr>,
}

impl IpFilter {
    /// Parse comma separated address lists; blank entries are skipped
    pub fn parse(blacklist: &str, whitelist: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            blacklist: parse_list("blacklist", blacklist)?,
            whitelist: parse_list("whitelist", whitelist)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.blacklist.is_empty()
    }

    pub fn is_blocked(&self, request: &Request) -> bool {
        let Some(addr) = request
            .remote_address()
            .and_then(|addr| addr.parse::<IpAddr>().ok())
        else {
            return false;
        };
        self.is_blocked_ip(addr)
    }

    pub fn is_blocked_ip(&self, addr: IpAddr) -> bool {
        self.blacklist.contains(&addr) && !self.whitelist.contains(&addr)
    }
}

fn parse_list(list: &'static str, value: &str) -> Result<HashSet<IpAddr>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry.parse().map_err(|_| ConfigError::InvalidIp {
                list,
                value: entry.to_string(),
            })
        })
        .collect()
}
