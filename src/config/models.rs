//! Configuration data structures for Echoes.
//!
//! These types map directly to the YAML (also TOML / JSON) configuration
//! document. They are serde‑friendly and carry defaults so that minimal
//! configs stay concise. The tree is loaded once at startup and treated as
//! immutable afterwards.
use serde::{Deserialize, Serialize};

fn default_listen_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_certs_dir() -> String {
    "resources/certs/".to_string()
}

fn default_access_log_queue() -> usize {
    4096
}

fn default_max_timeout() -> i64 {
    30
}

fn default_weight() -> u32 {
    1
}

fn default_scheme() -> String {
    "http".to_string()
}

/// Process-wide gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    /// Tokio worker threads, `0` means one per CPU
    #[serde(default)]
    pub worker: usize,
    /// Directory receiving `access.log`
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    /// Directory holding `<domain>.pem` / `<domain>.key` pairs
    #[serde(default = "default_certs_dir")]
    pub certs_dir: String,
    /// TLS listener address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Optional plain HTTP listener address
    #[serde(default)]
    pub http_listen_addr: Option<String>,
    /// Capacity of the access log submission queue
    #[serde(default = "default_access_log_queue")]
    pub access_log_queue: usize,
    #[serde(default)]
    pub vhosts: Vec<VHostConfig>,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }

    /// Whether any virtual host asks for TLS termination.
    pub fn tls_enabled(&self) -> bool {
        self.vhosts.iter().any(|v| v.enable_https)
    }

    /// Server names that need a certificate, in configuration order without duplicates.
    pub fn tls_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for name in self
            .vhosts
            .iter()
            .filter(|v| v.enable_https)
            .flat_map(|v| v.server_name.iter())
        {
            if !domains.iter().any(|d| d.eq_ignore_ascii_case(name)) {
                domains.push(name.clone());
            }
        }
        domains
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            worker: 0,
            log_dir: default_log_dir(),
            certs_dir: default_certs_dir(),
            listen_addr: default_listen_addr(),
            http_listen_addr: None,
            access_log_queue: default_access_log_queue(),
            vhosts: Vec::new(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by tests and embedders
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    pub fn certs_dir(mut self, dir: impl Into<String>) -> Self {
        self.config.certs_dir = dir.into();
        self
    }

    pub fn http_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.http_listen_addr = Some(addr.into());
        self
    }

    /// Append a virtual host
    pub fn vhost(mut self, vhost: VHostConfig) -> Self {
        self.config.vhosts.push(vhost);
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> Result<GatewayConfig, String> {
        if self.config.vhosts.is_empty() {
            return Err("At least one vhost must be configured".to_string());
        }
        if let Some(vhost) = self.config.vhosts.iter().find(|v| v.upstreams.is_empty()) {
            return Err(format!(
                "vhost {:?} must have at least one upstream",
                vhost.server_name
            ));
        }
        Ok(self.config)
    }
}

/// A virtual host: server names bound to a pool of upstreams and a policy.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct VHostConfig {
    #[serde(default)]
    pub max_fails: u32,
    /// Connect timeout towards upstreams, in seconds
    #[serde(default = "default_max_timeout")]
    pub max_timeout: i64,
    #[serde(default)]
    pub enable_https: bool,
    /// Fallback host pattern used when no server name matches exactly
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,
    #[serde(default)]
    pub hash_key: HashKey,
    #[serde(default)]
    pub server_name: Vec<String>,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl VHostConfig {
    /// Minimal vhost answering for `server_name` with the given upstreams.
    pub fn new(server_name: impl Into<String>, upstreams: Vec<UpstreamConfig>) -> Self {
        Self {
            max_fails: 0,
            max_timeout: default_max_timeout(),
            enable_https: false,
            regex: String::new(),
            load_balance: LoadBalanceStrategy::default(),
            hash_key: HashKey::default(),
            server_name: vec![server_name.into()],
            upstreams,
        }
    }

    pub fn with_strategy(mut self, strategy: LoadBalanceStrategy) -> Self {
        self.load_balance = strategy;
        self
    }

    pub fn with_https(mut self, enabled: bool) -> Self {
        self.enable_https = enabled;
        self
    }

    /// Display label used in logs and access records.
    pub fn label(&self) -> &str {
        self.server_name.first().map(String::as_str).unwrap_or("-")
    }
}

/// One backend target. Identity inside a vhost is its position.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl UpstreamConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            weight: default_weight(),
            scheme: default_scheme(),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// `host:port` authority, port omitted when it is the scheme default.
    pub fn authority(&self) -> String {
        let default_port = match self.scheme.as_str() {
            "https" => 443,
            _ => 80,
        };
        if self.port == default_port {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalanceStrategy {
    #[default]
    #[serde(rename = "RR", alias = "round_robin")]
    RoundRobin,
    #[serde(rename = "WRR", alias = "weighted_round_robin")]
    WeightedRoundRobin,
    #[serde(rename = "HASH", alias = "hash")]
    Hash,
}

/// Which request attribute feeds the HASH strategy.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum HashKey {
    #[default]
    ClientIp,
    Path,
    Host,
}
