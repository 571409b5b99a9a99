//! Discovery coordinator: turns a domain into pending URL records and crawl
//! messages. Resolves the robots policy, walks sitemaps (recursing into
//! indices up to a bounded depth), inserts `pending` records idempotently and
//! batch-enqueues crawl work for whatever is new.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use driftnet_core::config::DiscoveryConfig;
use driftnet_core::{urlnorm, Backoff, CrawlError, CrawlMessage, DiscoveryMessage, SCHEMA_VERSION};
use driftnet_gate::Gate;
use driftnet_queue::TypedQueue;
use driftnet_state::StateStore;

pub mod sitemap;

/// Priority assigned to sitemap-discovered URLs; seeds and outlinks set
/// their own when they enqueue directly.
const DISCOVERY_PRIORITY: f64 = 0.5;

#[derive(Debug, Default)]
pub struct DomainDiscovery {
    pub urls_seen: usize,
    pub enqueued: usize,
    pub sitemaps_fetched: usize,
    pub sitemap_errors: usize,
}

pub struct DiscoveryCoordinator {
    gate: Arc<Gate>,
    state: Arc<dyn StateStore>,
    discovery_queue: TypedQueue<DiscoveryMessage>,
    crawl_queue: TypedQueue<CrawlMessage>,
    client: reqwest::Client,
    cfg: DiscoveryConfig,
    backoff: Backoff,
}

impl DiscoveryCoordinator {
    pub fn new(
        gate: Arc<Gate>,
        state: Arc<dyn StateStore>,
        discovery_queue: TypedQueue<DiscoveryMessage>,
        crawl_queue: TypedQueue<CrawlMessage>,
        cfg: DiscoveryConfig,
    ) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            gate,
            state,
            discovery_queue,
            crawl_queue,
            client,
            cfg,
            backoff: Backoff::default(),
        })
    }

    /// Poll loop. One message at a time per coordinator; run several
    /// coordinators for parallelism.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("discovery coordinator started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("discovery coordinator shutting down");
                    break;
                }
                polled = self.poll_once() => {
                    match polled {
                        Ok(true) => {}
                        Ok(false) => tokio::time::sleep(Duration::from_secs(2)).await,
                        Err(e) => {
                            warn!(error = %e, "discovery receive failed");
                            tokio::time::sleep(Duration::from_secs(2)).await;
                        }
                    }
                }
            }
        }
    }

    /// Receive and settle one discovery message. Returns false when the
    /// queue had nothing visible.
    pub async fn poll_once(&self) -> Result<bool, CrawlError> {
        let msgs = self.discovery_queue.receive(1).await?;
        let Some(msg) = msgs.into_iter().next() else {
            return Ok(false);
        };
        self.process(msg).await;
        Ok(true)
    }

    async fn process(&self, msg: driftnet_queue::Received<DiscoveryMessage>) {
        // Backpressure: if the crawl queue is already deep, return the
        // message to visibility and try again later.
        match self.crawl_queue.approx_depth().await {
            Ok(depth) if depth > self.cfg.crawl_queue_ceiling => {
                debug!(domain = %msg.body.domain, depth, "crawl queue over ceiling, deferring discovery");
                let _ = self
                    .discovery_queue
                    .nack(
                        &msg.receipt,
                        Some(Duration::from_secs(self.cfg.backpressure_delay_seconds)),
                    )
                    .await;
                return;
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "crawl queue depth check failed"),
        }

        match self.handle_domain(&msg.body).await {
            Ok(stats) => {
                info!(
                    domain = %msg.body.domain,
                    source = %msg.body.source,
                    urls = stats.urls_seen,
                    enqueued = stats.enqueued,
                    sitemaps = stats.sitemaps_fetched,
                    sitemap_errors = stats.sitemap_errors,
                    "domain discovered"
                );
                if let Err(e) = self.discovery_queue.ack(&msg.receipt).await {
                    warn!(error = %e, "discovery ack failed");
                }
            }
            Err(e) => {
                warn!(domain = %msg.body.domain, error = %e, "discovery failed, deferring");
                let delay = self.backoff.delay(msg.receive_count.saturating_sub(1));
                let _ = self.discovery_queue.nack(&msg.receipt, Some(delay)).await;
            }
        }
    }

    /// Enumerate one domain. Individual sitemap failures are non-fatal; the
    /// pass continues with whatever was reachable.
    pub async fn handle_domain(
        &self,
        msg: &DiscoveryMessage,
    ) -> Result<DomainDiscovery, CrawlError> {
        let mut stats = DomainDiscovery::default();
        let scheme = self.cfg.assume_scheme.as_str();
        let policy = self.gate.policy(scheme, &msg.domain).await;

        let mut queue: VecDeque<(String, u32)> = if policy.sitemaps.is_empty() {
            // Conventional location when robots names none.
            VecDeque::from([(format!("{}://{}/sitemap.xml", scheme, msg.domain), 0)])
        } else {
            policy.sitemaps.iter().map(|s| (s.clone(), 0)).collect()
        };

        let mut page_urls: Vec<String> = Vec::new();
        while let Some((sitemap_url, depth)) = queue.pop_front() {
            if page_urls.len() >= self.cfg.max_urls_per_domain {
                debug!(domain = %msg.domain, cap = self.cfg.max_urls_per_domain, "per-domain URL cap hit, dropping remaining sitemaps");
                break;
            }
            let body = match self.fetch_sitemap(&sitemap_url).await {
                Ok(body) => {
                    stats.sitemaps_fetched += 1;
                    body
                }
                Err(e) => {
                    debug!(sitemap = %sitemap_url, error = %e, "sitemap unreachable");
                    stats.sitemap_errors += 1;
                    continue;
                }
            };
            let locs = sitemap::parse_locs(&body);
            if sitemap::is_sitemap_index(&body) {
                if depth < self.cfg.max_sitemap_depth {
                    for child in locs {
                        queue.push_back((child, depth + 1));
                    }
                }
            } else {
                let room = self.cfg.max_urls_per_domain - page_urls.len();
                page_urls.extend(locs.into_iter().take(room));
            }
        }

        // Seed the domain root when sitemaps gave us nothing to start from.
        if page_urls.is_empty() {
            page_urls.push(format!("{}://{}/", scheme, msg.domain));
        }

        let mut batch: Vec<(CrawlMessage, f64)> = Vec::new();
        for raw_url in page_urls {
            let Ok(canonical) = urlnorm::normalize(&raw_url) else {
                continue;
            };
            let Ok(domain) = urlnorm::registrable_domain(&canonical) else {
                continue;
            };
            if domain != msg.domain {
                // Sitemaps occasionally list foreign hosts; those go through
                // their own discovery message, not this domain's pass.
                continue;
            }
            stats.urls_seen += 1;
            let url_hash = urlnorm::url_hash(&canonical);
            if self
                .state
                .insert_pending(canonical.as_str(), &url_hash, &domain)
                .await?
            {
                batch.push((
                    CrawlMessage {
                        v: SCHEMA_VERSION,
                        url: canonical.to_string(),
                        domain,
                        url_hash,
                        priority: DISCOVERY_PRIORITY,
                        attempt: 0,
                        enqueued_at: Utc::now(),
                    },
                    DISCOVERY_PRIORITY,
                ));
            }
        }

        stats.enqueued = batch.len();
        if !batch.is_empty() {
            self.crawl_queue.send_batch(&batch).await?;
        }
        Ok(stats)
    }

    async fn fetch_sitemap(&self, url: &str) -> Result<String, CrawlError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CrawlError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(CrawlError::HttpStatus(resp.status().as_u16()));
        }
        resp.text()
            .await
            .map_err(|e| CrawlError::Network(e.to_string()))
    }
}
