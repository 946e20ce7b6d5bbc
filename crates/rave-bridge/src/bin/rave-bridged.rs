use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rave_bridge::auth::{AuthConfig, IdentityValidator};
use rave_bridge::server::{self, BridgeState};
use rave_bridge::BridgeConfig;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "rave-bridged",
    version,
    about = "Chat command bridge for RAVE agent services"
)]
struct Cli {
    /// Path to the bridge TOML config.
    #[arg(long, default_value = "/etc/rave/bridge.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if cli.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = BridgeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let auth_config = AuthConfig {
        idp_url: config.idp_url.clone(),
        client_id: config.oidc_client_id.clone(),
        client_secret: config.oidc_client_secret.clone(),
        allowed_groups: if config.allowed_groups.is_empty() {
            None
        } else {
            Some(config.allowed_groups.iter().cloned().collect())
        },
        ..AuthConfig::default()
    };
    let validator = IdentityValidator::over_http(auth_config)?;

    let state = BridgeState::build(config, validator)?;
    state.controller.initialize().await?;

    info!("starting bridge");
    server::serve(Arc::clone(&state), async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;

    Ok(())
}
