//! Rate & politeness gate: robots.txt evaluation and fleet-wide
//! sliding-window QPS, fused behind one interface. The gate is advisory and
//! never blocks beyond a bounded robots fetch; long waits are returned to
//! the caller as `WaitFor`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use url::Url;

use driftnet_core::config::GateConfig;
use driftnet_core::CrawlError;

pub mod counter;
pub mod robots;

pub use counter::{CounterStore, MemoryCounterStore, PgCounterStore, SlotDecision};
pub use robots::RobotsPolicy;

/// Sitemaps discovered on the first robots fetch of a host, surfaced to the
/// discovery coordinator.
#[derive(Debug, Clone)]
pub struct DomainSitemaps {
    pub host: String,
    pub sitemaps: Vec<String>,
}

pub struct Gate {
    cfg: GateConfig,
    client: reqwest::Client,
    counters: Arc<dyn CounterStore>,
    robots: DashMap<String, Arc<RobotsPolicy>>,
    sitemap_tx: Option<mpsc::Sender<DomainSitemaps>>,
}

impl Gate {
    pub fn new(
        cfg: GateConfig,
        counters: Arc<dyn CounterStore>,
        sitemap_tx: Option<mpsc::Sender<DomainSitemaps>>,
    ) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.robots_fetch_timeout_seconds))
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            cfg,
            client,
            counters,
            robots: DashMap::new(),
            sitemap_tx,
        })
    }

    /// Cached policy for a host, fetching robots.txt on miss or TTL expiry.
    /// A fetch failure yields a permissive default with a short TTL.
    pub async fn policy(&self, scheme: &str, host: &str) -> Arc<RobotsPolicy> {
        if let Some(cached) = self.robots.get(host) {
            if !cached.is_expired() {
                return cached.clone();
            }
        }
        let first_fetch = !self.robots.contains_key(host);

        let robots_url = format!("{}://{}/robots.txt", scheme, host);
        let policy = match self.client.get(&robots_url).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => Arc::new(RobotsPolicy::from_body(
                    host,
                    body,
                    Duration::from_secs(self.cfg.robots_ttl_seconds),
                )),
                Err(e) => {
                    warn!(host, error = %e, "robots body read failed, caching permissive default");
                    Arc::new(RobotsPolicy::permissive(
                        host,
                        Duration::from_secs(self.cfg.robots_failure_ttl_seconds),
                    ))
                }
            },
            Ok(resp) => {
                debug!(host, status = resp.status().as_u16(), "no usable robots.txt");
                // 4xx means no policy; cache permissive for the full TTL.
                let ttl = if resp.status().is_client_error() {
                    self.cfg.robots_ttl_seconds
                } else {
                    self.cfg.robots_failure_ttl_seconds
                };
                Arc::new(RobotsPolicy::permissive(host, Duration::from_secs(ttl)))
            }
            Err(e) => {
                warn!(host, error = %e, "robots fetch failed, caching permissive default");
                Arc::new(RobotsPolicy::permissive(
                    host,
                    Duration::from_secs(self.cfg.robots_failure_ttl_seconds),
                ))
            }
        };

        self.robots.insert(host.to_string(), policy.clone());

        if first_fetch && !policy.sitemaps.is_empty() {
            if let Some(tx) = &self.sitemap_tx {
                let _ = tx
                    .send(DomainSitemaps {
                        host: host.to_string(),
                        sitemaps: policy.sitemaps.clone(),
                    })
                    .await;
            }
        }
        policy
    }

    pub async fn is_allowed(&self, url: &Url, user_agent: &str) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let policy = self.policy(url.scheme(), host).await;
        policy.is_allowed(url.as_str(), user_agent)
    }

    /// Sliding-window QPS check against the shared counter store.
    pub async fn acquire_slot(
        &self,
        domain: &str,
        crawl_delay: Option<f64>,
    ) -> Result<SlotDecision, CrawlError> {
        let (window, ceiling) = self.effective_limit(domain, crawl_delay);
        self.counters.acquire(domain, window, ceiling).await
    }

    /// Effective (window, ceiling) for a domain: QPS is the minimum of the
    /// domain override, the default, and `1 / crawl_delay`; the window grows
    /// past the configured size when QPS drops below one request per window.
    pub fn effective_limit(&self, domain: &str, crawl_delay: Option<f64>) -> (Duration, u32) {
        let mut qps = self.cfg.default_qps;
        if let Some(override_qps) = self.cfg.domain_qps.get(domain) {
            qps = qps.min(*override_qps);
        }
        if let Some(delay) = crawl_delay.filter(|d| *d > 0.0) {
            qps = qps.min(1.0 / delay);
        }
        let qps = qps.max(0.001);

        let mut window = self.cfg.window_seconds.max(1) as f64;
        if window < 1.0 / qps {
            window = 1.0 / qps;
        }
        let ceiling = ((qps * window).floor() as u32).max(1);
        (Duration::from_secs_f64(window), ceiling)
    }
}
