//! Group path -> API endpoint routing
//!
//! Groups living on a different GitLab instance are routed through an ordered
//! list of `pattern -> api_url` rules supplied in configuration. The first
//! pattern matching the group path wins; unmatched groups use the default API.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use reqwest::Url;

use crate::config::Config;

/// A resolved GitLab API base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    api_url: Url,
}

impl Endpoint {
    pub fn parse(api_url: &str) -> Result<Self> {
        let api_url = Url::parse(api_url.trim_end_matches('/'))
            .with_context(|| format!("Invalid API URL: {}", api_url))?;

        if api_url.cannot_be_a_base() || api_url.host_str().is_none() {
            return Err(anyhow!("API URL has no host: {}", api_url));
        }

        Ok(Self { api_url })
    }

    pub fn url(&self) -> &Url {
        &self.api_url
    }

    pub fn host(&self) -> &str {
        self.api_url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.api_url.port_or_known_default().unwrap_or(443)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.api_url.as_str())
    }
}

#[derive(Debug, Clone)]
struct Route {
    pattern: Regex,
    endpoint: Endpoint,
}

/// Ordered routing table
#[derive(Debug, Clone)]
pub struct EndpointRouter {
    routes: Vec<Route>,
    default: Endpoint,
}

impl EndpointRouter {
    pub fn new(default: Endpoint) -> Self {
        Self {
            routes: Vec::new(),
            default,
        }
    }

    /// Build the routing table from configuration; invalid patterns or URLs are errors
    pub fn from_config(config: &Config) -> Result<Self> {
        let default = Endpoint::parse(&config.gitlab.api_url)?;
        let mut router = Self::new(default);

        for route in &config.gitlab.routes {
            router = router.with_route(&route.pattern, &route.api_url)?;
        }

        Ok(router)
    }

    pub fn with_route(mut self, pattern: &str, api_url: &str) -> Result<Self> {
        let pattern = Regex::new(pattern)
            .with_context(|| format!("Invalid route pattern: {}", pattern))?;
        let endpoint = Endpoint::parse(api_url)?;
        self.routes.push(Route { pattern, endpoint });
        Ok(self)
    }

    pub fn resolve(&self, group: &str) -> &Endpoint {
        self.routes
            .iter()
            .find(|route| route.pattern.is_match(group))
            .map(|route| &route.endpoint)
            .unwrap_or(&self.default)
    }

    /// Every distinct endpoint the table can resolve to
    pub fn endpoints(&self) -> Vec<&Endpoint> {
        let mut endpoints = vec![&self.default];
        for route in &self.routes {
            if !endpoints.contains(&&route.endpoint) {
                endpoints.push(&route.endpoint);
            }
        }
        endpoints
    }
}
