#![allow(clippy::collapsible_if)]

use std::net::SocketAddr;

use regex::Regex;

use crate::config::models::{GatewayConfig, LoadBalanceStrategy, UpstreamConfig, VHostConfig};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration, reporting every problem at once.
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }
        if let Some(addr) = &config.http_listen_addr {
            if let Err(e) = Self::validate_listen_address(addr) {
                errors.push(e);
            }
        }

        if config.access_log_queue == 0 {
            errors.push(ValidationError::InvalidField {
                field: "access_log_queue".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if config.vhosts.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "vhosts".to_string(),
            });
        }

        for (index, vhost) in config.vhosts.iter().enumerate() {
            if let Err(mut vhost_errors) = Self::validate_vhost(index, vhost) {
                errors.append(&mut vhost_errors);
            }
        }

        if !config.vhosts.is_empty() && !config.tls_enabled() && config.http_listen_addr.is_none()
        {
            errors.push(ValidationError::InvalidField {
                field: "http_listen_addr".to_string(),
                message: "No listener would start: enable_https is off for every vhost and no plain HTTP listener is configured".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '0.0.0.0:443')".to_string(),
            });
        }
        Ok(())
    }

    fn validate_vhost(index: usize, vhost: &VHostConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let context = format!("vhost #{} ({})", index + 1, vhost.label());

        if vhost.upstreams.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} upstreams"),
                message: "A vhost must have at least one upstream".to_string(),
            });
        }

        if vhost.server_name.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} server_name"),
                message: "A vhost must declare at least one server name".to_string(),
            });
        }
        for name in &vhost.server_name {
            if let Err(e) = Self::validate_server_name(name, &context) {
                errors.push(e);
            }
        }

        if vhost.max_timeout <= 0 {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} max_timeout"),
                message: format!("Must be greater than 0 seconds, got {}", vhost.max_timeout),
            });
        }

        if !vhost.regex.is_empty() {
            if let Err(e) = Regex::new(&vhost.regex) {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} regex"),
                    message: format!("Invalid pattern: {e}"),
                });
            }
        }

        for (i, upstream) in vhost.upstreams.iter().enumerate() {
            if let Err(e) =
                Self::validate_upstream(upstream, &format!("{context} upstream {}", i + 1))
            {
                errors.push(e);
            }
        }

        if vhost.load_balance == LoadBalanceStrategy::WeightedRoundRobin
            && !vhost.upstreams.is_empty()
            && vhost.upstreams.iter().all(|u| u.weight == 0)
        {
            errors.push(ValidationError::InvalidField {
                field: format!("{context} upstreams"),
                message: "Weighted round robin needs a positive total weight".to_string(),
            });
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_server_name(name: &str, context: &str) -> ValidationResult<()> {
        if name.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: format!("{context} server_name"),
                message: "Server name cannot be empty".to_string(),
            });
        }

        if name.contains("://") || name.contains('/') {
            return Err(ValidationError::InvalidField {
                field: format!("{context} server_name"),
                message: format!(
                    "Server name should be a bare host (e.g., 'example.com'), got '{name}'"
                ),
            });
        }

        Ok(())
    }

    /// Validate one upstream: scheme, host and port must form a usable URL.
    fn validate_upstream(upstream: &UpstreamConfig, context: &str) -> ValidationResult<()> {
        if upstream.scheme != "http" && upstream.scheme != "https" {
            return Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!(
                    "Upstream scheme must be 'http' or 'https', got '{}'",
                    upstream.scheme
                ),
            });
        }

        if upstream.host.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: "Upstream host cannot be empty".to_string(),
            });
        }

        if upstream.port == 0 {
            return Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: "Upstream port must be greater than 0".to_string(),
            });
        }

        match url::Url::parse(&upstream.to_string()) {
            Ok(url) if url.host().is_some() => Ok(()),
            Ok(_) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: "Upstream must have a valid host".to_string(),
            }),
            Err(e) => Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Invalid upstream address: {e}"),
            }),
        }
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
