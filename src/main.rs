mod cli;
mod commands;
mod pipeline;

use anyhow::Result;
use clap::Parser;
use tracing::warn;

// mimalloc keeps memory bounded under high slot concurrency where glibc
// malloc does not release.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use driftnet_core::AppConfig;

use crate::cli::{Cli, Commands};
use crate::pipeline::Pipeline;

fn main() -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_stack_size(4 * 1024 * 1024)
        .enable_all()
        .build()?;
    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
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
    let mut config: AppConfig = toml::from_str(&config_str)?;

    apply_env_overrides(&mut config);

    match cli.command {
        Commands::Seed { entries } => {
            let pipeline = Pipeline::build(config).await?;
            commands::seed::run(&pipeline, entries).await?;
        }
        Commands::Discover => {
            let pipeline = Pipeline::build(config).await?;
            let (shutdown, _) = tokio::sync::broadcast::channel::<()>(1);
            let handles = pipeline::spawn_discovery(&pipeline, &shutdown)?;
            pipeline::wait_for_shutdown(shutdown, handles).await?;
        }
        Commands::Crawl { slots } => {
            let mut pipeline = Pipeline::build(config).await?;
            let (shutdown, _) = tokio::sync::broadcast::channel::<()>(1);
            let handles = pipeline::spawn_crawl(&mut pipeline, &shutdown, slots)?;
            pipeline::wait_for_shutdown(shutdown, handles).await?;
        }
        Commands::Index { slots } => {
            let pipeline = Pipeline::build(config).await?;
            let (shutdown, _) = tokio::sync::broadcast::channel::<()>(1);
            let handles = pipeline::spawn_index(&pipeline, &shutdown, slots).await?;
            pipeline::wait_for_shutdown(shutdown, handles).await?;
        }
        Commands::Run => {
            let mut pipeline = Pipeline::build(config).await?;
            let (shutdown, _) = tokio::sync::broadcast::channel::<()>(1);
            let mut handles = pipeline::spawn_discovery(&pipeline, &shutdown)?;
            handles.extend(pipeline::spawn_crawl(&mut pipeline, &shutdown, None)?);
            handles.extend(pipeline::spawn_index(&pipeline, &shutdown, None).await?);
            pipeline::wait_for_shutdown(shutdown, handles).await?;
        }
        Commands::Status => {
            let pipeline = Pipeline::build(config).await?;
            commands::status::run(&pipeline).await?;
        }
    }

    Ok(())
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database.postgres_url = v;
    }
    if let Ok(v) = std::env::var("DATA_DIR") {
        config.general.data_dir = v;
    }
    if let Ok(v) = std::env::var("QUEUE_BACKEND") {
        config.queues.backend = v;
    }
    if let Ok(v) = std::env::var("EMBEDDING_ENDPOINT") {
        config.embedding.endpoint = v;
    }
    if let Ok(v) = std::env::var("SEARCH_ENDPOINT") {
        config.search.endpoint = v;
    }
    let parse_workers =
        |v: &str| -> Option<usize> { v.parse::<usize>().ok().filter(|&n| n > 0 && n <= 256) };
    if let Ok(v) = std::env::var("CRAWL_WORKERS") {
        if let Some(n) = parse_workers(&v) {
            config.fetch.max_concurrent = n;
        }
    }
    if let Ok(v) = std::env::var("INDEX_WORKERS") {
        if let Some(n) = parse_workers(&v) {
            config.indexer.max_concurrent = n;
        }
    }
    if let Ok(v) = std::env::var("DISCOVERY_WORKERS") {
        if let Some(n) = parse_workers(&v) {
            config.discovery.max_concurrent = n;
        }
    }
}
