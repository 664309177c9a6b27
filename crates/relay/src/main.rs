use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use relay::config::Config;
use relay::server::{build_router, AppState};

#[derive(Parser)]
#[command(author, version, about = "AI inference gateway")]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, short, default_value = "relay.yaml")]
    config: PathBuf,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    let listen = cli.listen.clone().unwrap_or_else(|| config.listen.clone());

    let gateway = std::sync::Arc::new(config.provision()?);
    let app = build_router(AppState::new(gateway, config.default_router_name()));

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(addr = %listen, "relay listening");
    axum::serve(listener, app).await?;
    Ok(())
}
