//! Configuration types and loading logic.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use anyhow::Context;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use relay_tracing::TracingConfig;
use serde::Deserialize;

use crate::headers::{DELETE, KEEP};

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub tracing: TracingConfig,

    /// Ordered hostname-pattern rules; the first match wins.
    #[serde(default = "default_header_rules")]
    pub header_rules: Vec<HeaderRuleConfig>,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

/// Outbound client limits.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Longest wait for any single read from the target.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Largest inbound body buffered for non-GET/HEAD requests.
    #[serde(default = "default_max_request_body")]
    pub max_request_body_bytes: usize,
}

/// One entry of the header rule table.
///
/// `rules` maps a header name to `"DELETE"`, `"KEEP"`, or a literal value.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HeaderRuleConfig {
    pub pattern: String,
    #[serde(default)]
    pub rules: BTreeMap<String, String>,
}

fn default_listen_address() -> String {
    "0.0.0.0:8020".to_string()
}

fn default_read_timeout() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_request_body() -> usize {
    64 * 1024 * 1024
}

/// Catch-all rule: never leak the caller's origin, keep its Host.
pub fn default_header_rules() -> Vec<HeaderRuleConfig> {
    vec![HeaderRuleConfig {
        pattern: ".*".to_string(),
        rules: BTreeMap::from([
            ("origin".to_string(), DELETE.to_string()),
            ("referer".to_string(), DELETE.to_string()),
            ("host".to_string(), KEEP.to_string()),
        ]),
    }]
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            tracing: TracingConfig::default(),
            header_rules: default_header_rules(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_request_body_bytes: default_max_request_body(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. `PORT` (port of the listen address only)
    /// 2. Environment variables (RELAY_ prefix, __ for nesting)
    /// 3. TOML config file
    /// 4. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let mut config: RelayConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("RELAY_").split("__"))
            .extract()?;

        if let Ok(port) = std::env::var("PORT") {
            config.server.listen_address =
                with_port(&config.server.listen_address, &port)?;
        }

        Ok(config)
    }
}

/// Replace the port of `listen_address` with `port`.
fn with_port(listen_address: &str, port: &str) -> anyhow::Result<String> {
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("PORT must be a number between 0 and 65535, got `{port}`"))?;
    let mut addr: SocketAddr = listen_address
        .parse()
        .with_context(|| format!("invalid listen address `{listen_address}`"))?;
    addr.set_port(port);
    Ok(addr.to_string())
}
