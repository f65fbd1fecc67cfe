//! Logging and export settings, read from the `[tracing]` config section.

use serde::Deserialize;

/// Settings for the relay's log output and optional span export.
///
/// With no `otlp_endpoint` the relay only writes fmt logs to stderr.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// `EnvFilter` directives, e.g. `info` or `cors_relay=debug,tower_http=info`.
    pub log_level: String,

    pub format: LogFormat,

    /// Collector address such as `http://collector:4317`.
    pub otlp_endpoint: Option<String>,

    pub protocol: OtlpProtocol,

    /// `service.name` resource attribute on exported spans.
    pub service_name: String,
}

/// Shape of the stderr log lines.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// OTLP transport protocol.
#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OtlpProtocol {
    #[default]
    Grpc,
    Http,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            format: LogFormat::default(),
            otlp_endpoint: None,
            protocol: OtlpProtocol::default(),
            service_name: "cors-relay".to_string(),
        }
    }
}
