//! Process wiring: builds the shared backends (queues, state store, gate,
//! object store) from config and spawns worker roles against them. The
//! "memory" backend runs the whole pipeline in-process for dev and tests;
//! "postgres" is the fleet configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use driftnet_core::{
    make_worker_id, AppConfig, CrawlMessage, DiscoveryMessage, FetchConfig, IndexMessage,
};
use driftnet_crawler::{spawn_reclaimer, CrawlWorker, CrawlerOptions, Fetcher};
use driftnet_discovery::DiscoveryCoordinator;
use driftnet_gate::{CounterStore, DomainSitemaps, Gate, MemoryCounterStore, PgCounterStore};
use driftnet_indexer::{
    EmbeddingClient, HttpEmbeddingClient, HttpSearchIndex, IndexWorker, IndexerOptions, SearchIndex,
};
use driftnet_queue::{MemoryQueue, PgQueue, Queue, QueueOptions, TypedQueue};
use driftnet_state::{MemoryStateStore, PgStateStore, StateOptions, StateStore};
use driftnet_store::{FsObjectStore, ObjectStore};

pub struct QueueSet {
    pub discovery: TypedQueue<DiscoveryMessage>,
    pub crawl: TypedQueue<CrawlMessage>,
    pub index: TypedQueue<IndexMessage>,
    /// DLQs by name, for the status surface.
    pub dead_letter: Vec<(String, Arc<dyn Queue>)>,
}

pub struct Pipeline {
    pub config: AppConfig,
    pub queues: QueueSet,
    pub state: Arc<dyn StateStore>,
    pub gate: Arc<Gate>,
    pub store: Arc<dyn ObjectStore>,
    sitemap_rx: Option<mpsc::Receiver<DomainSitemaps>>,
}

impl Pipeline {
    pub async fn build(config: AppConfig) -> Result<Self> {
        let state_opts = StateOptions {
            max_retries: config.state.max_retries,
            recrawl_after: Duration::from_secs(config.state.recrawl_after_seconds),
        };
        let qopts = |visibility_seconds: u64| QueueOptions {
            visibility: Duration::from_secs(visibility_seconds),
            max_receive_count: config.queues.max_receive_count,
        };
        let (sitemap_tx, sitemap_rx) = mpsc::channel::<DomainSitemaps>(256);

        let (queues, state, counters): (QueueSet, Arc<dyn StateStore>, Arc<dyn CounterStore>) =
            if config.queues.backend == "memory" {
                let discovery_dlq = MemoryQueue::dead_letter("discovery-dlq");
                let crawl_dlq = MemoryQueue::dead_letter("crawl-dlq");
                let index_dlq = MemoryQueue::dead_letter("index-dlq");
                let discovery: Arc<dyn Queue> = Arc::new(MemoryQueue::new(
                    "discovery",
                    qopts(config.queues.discovery_visibility_seconds),
                    Some(discovery_dlq.clone()),
                ));
                let crawl: Arc<dyn Queue> = Arc::new(MemoryQueue::new(
                    "crawl",
                    qopts(config.queues.crawl_visibility_seconds),
                    Some(crawl_dlq.clone()),
                ));
                let index: Arc<dyn Queue> = Arc::new(MemoryQueue::new(
                    "index",
                    qopts(config.queues.index_visibility_seconds),
                    Some(index_dlq.clone()),
                ));
                info!("in-memory backends ready");
                (
                    QueueSet {
                        discovery: TypedQueue::new(discovery),
                        crawl: TypedQueue::new(crawl),
                        index: TypedQueue::new(index),
                        dead_letter: vec![
                            ("discovery-dlq".to_string(), discovery_dlq as Arc<dyn Queue>),
                            ("crawl-dlq".to_string(), crawl_dlq as Arc<dyn Queue>),
                            ("index-dlq".to_string(), index_dlq as Arc<dyn Queue>),
                        ],
                    },
                    Arc::new(MemoryStateStore::new(state_opts)),
                    Arc::new(MemoryCounterStore::new()),
                )
            } else {
                let pool_size = (config.fetch.max_concurrent
                    + config.indexer.max_concurrent
                    + config.discovery.max_concurrent
                    + 10) as u32;
                let pool = PgPoolOptions::new()
                    .max_connections(pool_size)
                    .connect(&config.database.postgres_url)
                    .await
                    .context("postgres connect")?;
                PgQueue::run_migrations(&pool).await?;
                PgCounterStore::run_migrations(&pool).await?;
                let state = PgStateStore::with_pool(pool.clone(), state_opts);
                state.run_migrations().await?;

                let primary = |name: &str, visibility: u64| -> Arc<dyn Queue> {
                    Arc::new(PgQueue::new(
                        pool.clone(),
                        name,
                        Some(format!("{}-dlq", name)),
                        qopts(visibility),
                    ))
                };
                let dead = |name: &str| -> Arc<dyn Queue> {
                    Arc::new(PgQueue::new(pool.clone(), name, None, qopts(60)))
                };
                (
                    QueueSet {
                        discovery: TypedQueue::new(primary(
                            "discovery",
                            config.queues.discovery_visibility_seconds,
                        )),
                        crawl: TypedQueue::new(primary(
                            "crawl",
                            config.queues.crawl_visibility_seconds,
                        )),
                        index: TypedQueue::new(primary(
                            "index",
                            config.queues.index_visibility_seconds,
                        )),
                        dead_letter: vec![
                            ("discovery-dlq".to_string(), dead("discovery-dlq")),
                            ("crawl-dlq".to_string(), dead("crawl-dlq")),
                            ("index-dlq".to_string(), dead("index-dlq")),
                        ],
                    },
                    Arc::new(state),
                    Arc::new(PgCounterStore::new(pool)),
                )
            };

        let gate = Arc::new(Gate::new(config.gate.clone(), counters, Some(sitemap_tx))?);
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.general.data_dir));

        Ok(Self {
            config,
            queues,
            state,
            gate,
            store,
            sitemap_rx: Some(sitemap_rx),
        })
    }
}

pub fn spawn_discovery(
    pipeline: &Pipeline,
    shutdown: &broadcast::Sender<()>,
) -> Result<Vec<JoinHandle<()>>> {
    let mut handles = Vec::new();
    for _ in 0..pipeline.config.discovery.max_concurrent.max(1) {
        let coordinator = DiscoveryCoordinator::new(
            pipeline.gate.clone(),
            pipeline.state.clone(),
            pipeline.queues.discovery.clone(),
            pipeline.queues.crawl.clone(),
            pipeline.config.discovery.clone(),
        )?;
        let shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            coordinator.run(shutdown_rx).await;
        }));
    }
    Ok(handles)
}

pub fn spawn_crawl(
    pipeline: &mut Pipeline,
    shutdown: &broadcast::Sender<()>,
    slots: Option<usize>,
) -> Result<Vec<JoinHandle<()>>> {
    let cfg = &pipeline.config;
    let fetcher = Fetcher::new(
        FetchConfig {
            timeout: Duration::from_secs(cfg.fetch.request_timeout_seconds),
            max_body_size: cfg.fetch.max_body_size_mb * 1024 * 1024,
            max_redirects: cfg.fetch.max_redirects,
            user_agent: cfg.general.user_agent.clone(),
        },
        cfg.fetch.per_host_connections,
    )?;
    // Lease outlives the message's visibility so the queue never redelivers
    // work that is still validly owned.
    let lease = Duration::from_secs(cfg.queues.crawl_visibility_seconds + 30)
        .max(Duration::from_secs(cfg.state.lease_seconds));
    let worker = Arc::new(CrawlWorker::new(
        pipeline.state.clone(),
        pipeline.gate.clone(),
        pipeline.store.clone(),
        pipeline.queues.crawl.clone(),
        pipeline.queues.index.clone(),
        pipeline.queues.discovery.clone(),
        fetcher,
        CrawlerOptions {
            user_agent: cfg.general.user_agent.clone(),
            lease,
            wait_threshold: Duration::from_millis(cfg.fetch.wait_threshold_ms),
            max_links_per_page: cfg.fetch.max_links_per_page,
            backoff: driftnet_core::Backoff::default(),
        },
        make_worker_id("crawl"),
    ));

    let slot_count = slots.unwrap_or(cfg.fetch.max_concurrent).max(1);
    info!(slots = slot_count, "spawning crawl slots");
    let mut handles = driftnet_crawler::spawn_slots(worker, slot_count, shutdown);
    handles.push(spawn_reclaimer(
        pipeline.state.clone(),
        Duration::from_secs(cfg.state.reclaim_interval_seconds),
        cfg.state.reclaim_batch_size,
        shutdown,
    ));

    // Robots sitemaps hints feed back into discovery.
    if let Some(mut sitemap_rx) = pipeline.sitemap_rx.take() {
        let discovery = pipeline.queues.discovery.clone();
        let mut shutdown_rx = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    hint = sitemap_rx.recv() => {
                        let Some(hint) = hint else { break };
                        let domain = hint
                            .host
                            .strip_prefix("www.")
                            .unwrap_or(&hint.host)
                            .to_string();
                        if let Err(e) = discovery
                            .send(&DiscoveryMessage::new(domain, "robots"), 0.0)
                            .await
                        {
                            warn!(error = %e, "sitemap hint enqueue failed");
                        }
                    }
                }
            }
        }));
    }
    Ok(handles)
}

pub async fn spawn_index(
    pipeline: &Pipeline,
    shutdown: &broadcast::Sender<()>,
    slots: Option<usize>,
) -> Result<Vec<JoinHandle<()>>> {
    let cfg = &pipeline.config;
    let embeddings: Arc<dyn EmbeddingClient> = Arc::new(HttpEmbeddingClient::new(
        cfg.embedding.endpoint.clone(),
        cfg.embedding.model.clone(),
        cfg.embedding.max_batch,
        Duration::from_secs(cfg.embedding.request_timeout_seconds),
    )?);
    let index: Arc<dyn SearchIndex> = Arc::new(HttpSearchIndex::new(
        cfg.search.endpoint.clone(),
        Duration::from_secs(cfg.search.request_timeout_seconds),
    )?);
    let worker = Arc::new(IndexWorker::new(
        pipeline.queues.index.clone(),
        pipeline.store.clone(),
        embeddings,
        index,
        IndexerOptions {
            index_name: cfg.indexer.index_name.clone(),
            bulk_size: cfg.indexer.bulk_size,
            embedding_concurrency: cfg.indexer.embedding_concurrency,
            bulk_retry_attempts: cfg.indexer.bulk_retry_attempts,
            enable_embeddings: cfg.embedding.enabled,
            max_chunk_tokens: cfg.embedding.max_chunk_tokens,
            chunk_overlap_tokens: cfg.embedding.chunk_overlap_tokens,
        },
    ));

    // Dimension negotiation gates startup: a populated index mapped at a
    // different dimension refuses to come up.
    let dimension = worker.negotiate_dimension().await?;
    info!(?dimension, index = %cfg.indexer.index_name, "index mapping verified");

    let slot_count = slots.unwrap_or(cfg.indexer.max_concurrent).max(1);
    info!(slots = slot_count, "spawning index slots");
    Ok(driftnet_indexer::spawn_slots(worker, slot_count, shutdown))
}

/// Two-phase shutdown: stop polling on ctrl-c, then drain in-flight slots up
/// to a deadline. Whatever is force-aborted is recovered by lease expiry and
/// queue redelivery.
pub async fn wait_for_shutdown(
    shutdown: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
) -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining");
    let _ = shutdown.send(());

    let drain = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain)
        .await
        .is_err()
    {
        warn!("drain deadline exceeded, aborting remaining slots");
    }
    info!("shutdown complete");
    Ok(())
}
