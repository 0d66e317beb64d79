use std::net::SocketAddr;
use std::time::Duration;

use crate::logging::LogFormat;
use crate::{GatewayError, Result};

/// Process settings, read from the environment at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub listen_addr: SocketAddr,
    pub prometheus_url: String,
    pub kubernetes_api_url: String,
    pub kubernetes_token_file: Option<String>,
    /// Upstream tap feed. Tap calls fail with `UNAVAILABLE` when unset.
    pub tap_url: Option<String>,
    pub controller_namespace: String,
    pub backend_timeout: Duration,
    pub log_format: LogFormat,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8085)),
            prometheus_url: "http://127.0.0.1:9090".to_string(),
            kubernetes_api_url: "https://kubernetes.default.svc".to_string(),
            kubernetes_token_file: None,
            tap_url: None,
            controller_namespace: "conduit".to_string(),
            backend_timeout: Duration::from_secs(30),
            log_format: LogFormat::Text,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(addr) = lookup("GATEWAY_ADDR") {
            config.listen_addr = addr.parse().map_err(|e| {
                GatewayError::Config(format!("GATEWAY_ADDR {:?} is invalid: {}", addr, e))
            })?;
        }

        if let Some(url) = lookup("PROMETHEUS_URL") {
            config.prometheus_url = url;
        }

        if let Some(url) = lookup("KUBERNETES_API_URL") {
            config.kubernetes_api_url = url;
        }

        config.kubernetes_token_file = lookup("KUBERNETES_TOKEN_FILE");
        config.tap_url = lookup("TAP_URL");

        if let Some(namespace) = lookup("CONTROLLER_NAMESPACE") {
            config.controller_namespace = namespace;
        }

        if let Some(secs) = lookup("BACKEND_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|_| {
                GatewayError::Config(format!("BACKEND_TIMEOUT_SECS must be a number: {:?}", secs))
            })?;
            config.backend_timeout = Duration::from_secs(secs);
        }

        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = format.parse()?;
        }

        Ok(config)
    }

    /// Reads the bearer token for the Kubernetes API, if one is configured.
    pub fn kubernetes_token(&self) -> Result<Option<String>> {
        let Some(path) = &self.kubernetes_token_file else {
            return Ok(None);
        };
        let token = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!("Failed to read token file {}: {}", path, e))
        })?;
        Ok(Some(token.trim().to_string()))
    }
}
