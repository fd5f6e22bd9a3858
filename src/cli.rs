use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vigilare", about = "Small-scale web search: crawler, indexer, query engine")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the crawl pipeline (dispatcher, fetchers, parsers, DB writer)
    Crawl {
        /// Seed URLs (comma-separated or file path)
        #[arg(short, long)]
        seeds: Option<String>,

        /// Single seed URL
        #[arg(long)]
        seed: Option<String>,
    },
    /// Run the indexer loop (full-text index, vocabulary, PageRank)
    Index,
    /// Serve the search API
    Serve,
    /// Checkpoint the WAL files of all three databases
    FlushWal,
}
