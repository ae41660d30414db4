//! Core gateway orchestration service.
//!
//! The `GatewayService` pairs the immutable configuration (`GatewayConfig`)
//! with the runtime state built from it once at load time: one
//! [`VirtualHost`] per configured vhost, each owning its balancer and
//! backend client. It provides:
//! * Host normalization
//! * Virtual host resolution (exact server name first, then regex fallback)
//!
//! No global maps are involved: the pipeline holds an `Arc` to the resolved
//! virtual host for the lifetime of the request.
use std::sync::Arc;

use eyre::Result;

use crate::{
    config::{GatewayConfig, VHostConfig},
    core::vhost::VirtualHost,
    ports::http_client::HttpClient,
};

/// Central resolver from request host to virtual host.
pub struct GatewayService {
    vhosts: Vec<Arc<VirtualHost>>,
}

impl GatewayService {
    /// Build the runtime virtual hosts.
    ///
    /// `client_for` is called once per vhost to build the backend client
    /// carrying that vhost's connection parameters.
    pub fn new<F>(config: Arc<GatewayConfig>, client_for: F) -> Result<Self>
    where
        F: Fn(&VHostConfig) -> Result<Arc<dyn HttpClient>>,
    {
        let mut vhosts = Vec::with_capacity(config.vhosts.len());
        for vhost_config in &config.vhosts {
            let client = client_for(vhost_config)?;
            let vhost = VirtualHost::new(vhost_config.clone(), client)?;
            tracing::debug!(
                "Prepared vhost {} ({} upstreams, strategy {})",
                vhost.label(),
                vhost_config.upstreams.len(),
                vhost.strategy_name()
            );
            vhosts.push(Arc::new(vhost));
        }

        Ok(Self { vhosts })
    }

    /// Resolve a raw host (header value or authority) to a virtual host.
    ///
    /// Exact server names are scanned first in configuration order, then the
    /// first vhost whose pattern matches wins. `None` when nothing matches.
    pub fn resolve(&self, raw_host: &str) -> Option<Arc<VirtualHost>> {
        let host = Self::normalize_host(raw_host);
        if host.is_empty() {
            return None;
        }

        self.vhosts
            .iter()
            .find(|vhost| vhost.matches_server_name(&host))
            .or_else(|| self.vhosts.iter().find(|vhost| vhost.matches_pattern(&host)))
            .cloned()
    }

    /// Lowercase the host and drop any port suffix and trailing dot.
    pub fn normalize_host(raw_host: &str) -> String {
        let raw_host = raw_host.trim();
        let host = if raw_host.starts_with('[') {
            // IPv6 literal, keep the brackets
            match raw_host.find(']') {
                Some(end) => &raw_host[..=end],
                None => raw_host,
            }
        } else if raw_host.matches(':').count() == 1 {
            raw_host.split(':').next().unwrap_or(raw_host)
        } else {
            raw_host
        };
        host.trim_end_matches('.').to_ascii_lowercase()
    }
}
