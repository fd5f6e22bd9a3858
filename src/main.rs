mod cli;
mod crawl;
mod flush_wal;
mod indexer;
mod serve;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

// mimalloc keeps memory flat under high task concurrency.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use vigilare_core::AppConfig;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_str = std::fs::read_to_string(&cli.config).unwrap_or_else(|_| {
        warn!(path = %cli.config, "config file not found, using defaults");
        include_str!("../config/default.toml").to_string()
    });
    let config: AppConfig = toml::from_str(&config_str)?;

    match cli.command {
        Commands::Crawl { seeds, seed } => {
            crawl::run_crawl(config, seeds, seed).await?;
        }
        Commands::Index => {
            indexer::run_indexer(config).await?;
        }
        Commands::Serve => {
            serve::run_server(config).await?;
        }
        Commands::FlushWal => {
            flush_wal::run_flush_wal(config).await?;
        }
    }

    Ok(())
}
