//! Relay server entry point

use anyhow::{bail, Context};
use clap::Parser;
use realtime_relay::{Credential, RelayConfig, RelayServer};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1")]
    bind_address: String,

    /// Port
    #[arg(short, long, default_value_t = 8081)]
    port: u16,

    /// Upstream realtime API WebSocket URL
    #[arg(long, default_value = "wss://api.openai.com/v1/realtime")]
    upstream_url: String,

    /// Upstream API key; falls back to the OPENAI_API_KEY environment variable
    #[arg(long)]
    api_key: Option<String>,

    /// Upstream connect timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Maximum concurrent relay sessions
    #[arg(long, default_value_t = 1000)]
    max_sessions: usize,

    /// Enable CORS for the HTTP endpoints
    #[arg(long)]
    enable_cors: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "realtime_relay=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    info!("Starting Realtime Relay Server");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // The credential is mandatory; the whole point of the relay is that
    // clients never hold it themselves.
    let api_key = match args.api_key.clone().or_else(|| std::env::var("OPENAI_API_KEY").ok()) {
        Some(key) if !key.is_empty() => key,
        _ => bail!(
            "Upstream API key is required. Set the OPENAI_API_KEY environment \
             variable or pass --api-key."
        ),
    };

    let config = if let Some(config_path) = &args.config {
        load_config_from_file(config_path).await?
    } else {
        RelayConfig {
            bind_address: args.bind_address,
            port: args.port,
            upstream_url: args.upstream_url,
            connect_timeout_ms: args.connect_timeout_ms,
            max_sessions: args.max_sessions,
            enable_cors: args.enable_cors,
        }
    };

    info!("Configuration loaded: {:?}", config);

    let server = Arc::new(RelayServer::new(config, Credential::new(api_key)));

    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C signal handler");
        info!("Shutdown signal received");
    };

    tokio::select! {
        result = server.start() => {
            if let Err(e) = result {
                error!("Relay server error: {}", e);
                return Err(e.into());
            }
        }
        _ = shutdown_signal => {
            info!("Shutting down relay server");
        }
    }

    Ok(())
}

async fn load_config_from_file(path: &PathBuf) -> anyhow::Result<RelayConfig> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config file {}", path.display()))?;

    if path.extension().and_then(|s| s.to_str()) == Some("json") {
        Ok(serde_json::from_str(&contents)?)
    } else {
        // Default to TOML
        Ok(toml::from_str(&contents)?)
    }
}
