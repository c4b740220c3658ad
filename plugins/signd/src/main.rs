use anyhow::Result;
use clap::Parser;
use signd::{api::AppState, config, plugin};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();
    let state = AppState::new(cfg)?;
    plugin::run(cli.stdio, state).await
}
