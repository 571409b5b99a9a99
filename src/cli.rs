use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "driftnet", about = "Distributed web crawler & search indexer")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config/default.toml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish seed domains or URLs to the discovery queue
    Seed {
        /// Domains or URLs (comma-separated, or a file path)
        entries: Vec<String>,
    },
    /// Run discovery coordinators (domains -> crawl work)
    Discover,
    /// Run crawl workers
    Crawl {
        /// Parallel in-flight crawl slots
        #[arg(short = 'j', long)]
        slots: Option<usize>,
    },
    /// Run index workers
    Index {
        /// Parallel in-flight index slots
        #[arg(short = 'j', long)]
        slots: Option<usize>,
    },
    /// Run discovery, crawl and index workers in one process
    Run,
    /// Show queue depths and URL state counts
    Status,
}
