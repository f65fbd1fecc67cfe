//! cors-relay: forward `/<absolute-url>` requests and add permissive CORS headers.

use cors_relay::config::RelayConfig;
use cors_relay::server::{self, AppState};

fn main() -> anyhow::Result<()> {
    // --config <path>, then a positional path, then RELAY_CONFIG
    let args: Vec<String> = std::env::args().collect();
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1).cloned())
        .or_else(|| args.get(1).filter(|a| !a.starts_with('-')).cloned())
        .or_else(|| std::env::var("RELAY_CONFIG").ok())
        .unwrap_or_else(|| "cors-relay.toml".to_string());

    let config = RelayConfig::load(&config_path)?;

    // The gRPC span exporter needs a reactor, so the runtime comes first
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let _tracing_guard = relay_tracing::init_tracing(&config.tracing);

        tracing::info!(
            config_path = %config_path,
            listen_address = %config.server.listen_address,
            header_rules = config.header_rules.len(),
            "Starting cors-relay"
        );

        let state = AppState::from_config(config)?;
        server::run(state).await
    })
}
