use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use regex::Regex;

use crate::{
    config::{HashKey, UpstreamConfig, VHostConfig},
    core::load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
    ports::http_client::HttpClient,
};

/// Runtime view of one configured virtual host.
///
/// Bundles the immutable config with the state built for it at load time:
/// its balancer (the only mutable per-vhost state), the compiled host
/// pattern and the backend client carrying its connection parameters.
pub struct VirtualHost {
    config: VHostConfig,
    strategy: Box<dyn LoadBalancingStrategy>,
    host_pattern: Option<Regex>,
    client: Arc<dyn HttpClient>,
}

impl VirtualHost {
    pub fn new(config: VHostConfig, client: Arc<dyn HttpClient>) -> Result<Self> {
        let host_pattern = if config.regex.is_empty() {
            None
        } else {
            Some(
                Regex::new(&config.regex)
                    .wrap_err_with(|| format!("Invalid regex for vhost {}", config.label()))?,
            )
        };
        let strategy = LoadBalancerFactory::create_strategy(&config.load_balance);

        Ok(Self {
            config,
            strategy,
            host_pattern,
            client,
        })
    }

    pub fn config(&self) -> &VHostConfig {
        &self.config
    }

    pub fn label(&self) -> &str {
        self.config.label()
    }

    pub fn client(&self) -> &Arc<dyn HttpClient> {
        &self.client
    }

    pub fn hash_key(&self) -> HashKey {
        self.config.hash_key
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Exact (case-insensitive) server name match. `host` must already be normalized.
    pub fn matches_server_name(&self, host: &str) -> bool {
        self.config
            .server_name
            .iter()
            .any(|name| name.eq_ignore_ascii_case(host))
    }

    /// Regex fallback match.
    pub fn matches_pattern(&self, host: &str) -> bool {
        self.host_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(host))
    }

    /// Pick the upstream for one request.
    pub fn select_upstream(&self, key: Option<&str>) -> Option<&UpstreamConfig> {
        self.strategy.select(&self.config.upstreams, key)
    }
}

/// Connect timeout for a vhost config; non-positive values fall back to one second.
pub fn connect_timeout(config: &VHostConfig) -> Duration {
    Duration::from_secs(config.max_timeout.max(1) as u64)
}

impl std::fmt::Debug for VirtualHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualHost")
            .field("server_name", &self.config.server_name)
            .field("strategy", &self.strategy.name())
            .field("upstreams", &self.config.upstreams.len())
            .finish()
    }
}
