//! Crawl worker: consumes crawl messages, locks the URL, honors the
//! politeness gate, fetches, persists raw and parsed content and hands off
//! to the indexer. Acking is always the last step; everything upstream is
//! idempotent under redelivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use driftnet_core::{
    urlnorm, Backoff, CrawlError, CrawlMessage, DiscoveryMessage, IndexMessage, ObjectLocation,
    SCHEMA_VERSION,
};
use driftnet_gate::{Gate, SlotDecision};
use driftnet_queue::{Received, TypedQueue};
use driftnet_state::{Acquire, Conditional, Outcome, RetryDecision, StateStore};
use driftnet_store::{object_key, ObjectStore, ParsedMeta, RawMeta, PARSED_BUCKET, RAW_BUCKET};

pub mod fetch;
pub mod lease;

pub use fetch::{FetchResult, Fetcher};

/// Priority for same-domain outlinks; below sitemap-discovered work so broad
/// discovery wins over depth.
const OUTLINK_PRIORITY: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    pub user_agent: String,
    /// Lock lease; visibility timeout plus margin.
    pub lease: Duration,
    /// Gate waits at or below this are slept in-process.
    pub wait_threshold: Duration,
    pub max_links_per_page: usize,
    pub backoff: Backoff,
}

pub struct CrawlWorker {
    state: Arc<dyn StateStore>,
    gate: Arc<Gate>,
    store: Arc<dyn ObjectStore>,
    crawl_queue: TypedQueue<CrawlMessage>,
    index_queue: TypedQueue<IndexMessage>,
    discovery_queue: TypedQueue<DiscoveryMessage>,
    fetcher: Fetcher,
    opts: CrawlerOptions,
    worker_id: String,
    backoff: Backoff,
}

impl CrawlWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: Arc<dyn StateStore>,
        gate: Arc<Gate>,
        store: Arc<dyn ObjectStore>,
        crawl_queue: TypedQueue<CrawlMessage>,
        index_queue: TypedQueue<IndexMessage>,
        discovery_queue: TypedQueue<DiscoveryMessage>,
        fetcher: Fetcher,
        opts: CrawlerOptions,
        worker_id: String,
    ) -> Self {
        let backoff = opts.backoff.clone();
        Self {
            state,
            gate,
            store,
            crawl_queue,
            index_queue,
            discovery_queue,
            fetcher,
            opts,
            worker_id,
            backoff,
        }
    }

    fn attempt(msg: &Received<CrawlMessage>) -> u32 {
        msg.body.attempt.max(msg.receive_count.saturating_sub(1))
    }

    /// One message through the slot state machine:
    /// lock → gate → fetch → persist → emit → ack.
    pub async fn process(&self, msg: Received<CrawlMessage>) {
        let m = &msg.body;
        let url = match Url::parse(&m.url) {
            Ok(url) => url,
            Err(e) => {
                warn!(url = %m.url, error = %e, "unparseable URL in crawl message");
                let _ = self
                    .crawl_queue
                    .to_dlq(&msg.receipt, &format!("invalid URL: {}", e))
                    .await;
                return;
            }
        };

        match self
            .state
            .try_acquire(&m.url, &m.url_hash, &m.domain, &self.worker_id, self.opts.lease)
            .await
        {
            Ok(Acquire::Acquired(_)) => {}
            Ok(Acquire::AlreadyHeld) => {
                // Another worker holds the lock. Keep the message alive as
                // the liveness backstop: if the holder dies, redelivery plus
                // lease reclaim finish the work.
                debug!(url = %m.url, "already held elsewhere, returning to visibility");
                let _ = self
                    .crawl_queue
                    .nack(&msg.receipt, Some(self.opts.lease))
                    .await;
                return;
            }
            Ok(Acquire::Terminal) => {
                debug!(url = %m.url, "record terminal, dropping");
                let _ = self.crawl_queue.ack(&msg.receipt).await;
                return;
            }
            Err(e) => {
                warn!(url = %m.url, error = %e, "acquire failed");
                let _ = self
                    .crawl_queue
                    .nack(&msg.receipt, Some(self.backoff.delay(Self::attempt(&msg))))
                    .await;
                return;
            }
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (lost_tx, mut lost_rx) = watch::channel(false);
        let _renewer = lease::spawn_renewer(
            self.state.clone(),
            m.url_hash.clone(),
            self.worker_id.clone(),
            self.opts.lease,
            cancel_rx,
            lost_tx,
        );

        tokio::select! {
            // Lease reclaimed by someone else: cancel in-flight work, leave
            // the message unacked and write nothing.
            _ = lost_rx.changed() => {
                warn!(url = %m.url, "lease lost mid-flight, aborting slot");
            }
            _ = self.process_locked(&msg, &url) => {}
        }
        let _ = cancel_tx.send(true);
    }

    async fn process_locked(&self, msg: &Received<CrawlMessage>, url: &Url) {
        let m = &msg.body;
        let host = urlnorm::host_key(url).unwrap_or_else(|| m.domain.clone());
        let policy = self.gate.policy(url.scheme(), &host).await;

        if !policy.is_allowed(url.as_str(), &self.opts.user_agent) {
            // We saw the rule and respected it: done, nothing stored.
            info!(url = %m.url, "disallowed by robots");
            if let Ok(Conditional::Applied) = self
                .complete_with_retry(
                    &m.url_hash,
                    Outcome::Success {
                        raw_location: None,
                        crawled_at: Utc::now(),
                    },
                )
                .await
            {
                let _ = self.crawl_queue.ack(&msg.receipt).await;
            }
            return;
        }

        let mut in_process_waits = 0u32;
        loop {
            match self.gate.acquire_slot(&m.domain, policy.crawl_delay).await {
                Ok(SlotDecision::Ready) => break,
                Ok(SlotDecision::WaitFor(d))
                    if d <= self.opts.wait_threshold && in_process_waits < 3 =>
                {
                    tokio::time::sleep(d).await;
                    in_process_waits += 1;
                }
                Ok(SlotDecision::WaitFor(d)) => {
                    debug!(url = %m.url, wait_ms = d.as_millis() as u64, "gate wait over threshold, deferring");
                    self.schedule_and_settle(msg, d, "domain rate limit").await;
                    return;
                }
                Err(e) => {
                    warn!(url = %m.url, error = %e, "counter store error");
                    self.schedule_and_settle(
                        msg,
                        self.backoff.delay(Self::attempt(msg)),
                        "counter store error",
                    )
                    .await;
                    return;
                }
            }
        }

        match self.fetcher.fetch(url).await {
            FetchResult::Success(resp) => self.persist_and_emit(msg, url, resp).await,
            FetchResult::Permanent { status, reason } => {
                info!(url = %m.url, ?status, %reason, "permanent fetch failure");
                if let Ok(Conditional::Applied) = self
                    .complete_with_retry(&m.url_hash, Outcome::PermanentFailure { reason })
                    .await
                {
                    // Expected terminal outcome, not dead-letter material.
                    let _ = self.crawl_queue.ack(&msg.receipt).await;
                }
            }
            FetchResult::Transient { reason, retry_after } => {
                let delay =
                    retry_after.unwrap_or_else(|| self.backoff.delay(Self::attempt(msg)));
                debug!(url = %m.url, %reason, delay_ms = delay.as_millis() as u64, "transient fetch failure");
                self.schedule_and_settle(msg, delay, &reason).await;
            }
        }
    }

    async fn persist_and_emit(
        &self,
        msg: &Received<CrawlMessage>,
        url: &Url,
        resp: driftnet_core::FetchResponse,
    ) {
        let m = &msg.body;

        let final_domain = urlnorm::registrable_domain(&resp.final_url).unwrap_or_default();
        if final_domain != m.domain {
            warn!(url = %m.url, final_url = %resp.final_url, "cross-domain redirect");
            if let Ok(Conditional::Applied) = self
                .complete_with_retry(
                    &m.url_hash,
                    Outcome::PermanentFailure {
                        reason: format!("cross-domain redirect to {}", resp.final_url),
                    },
                )
                .await
            {
                let _ = self
                    .crawl_queue
                    .to_dlq(&msg.receipt, "cross-domain redirect")
                    .await;
            }
            return;
        }

        let content_hash = driftnet_parser::content_hash(&resp.body);
        let prev_hash = self.previous_content_hash(&m.url_hash).await;

        let is_html = resp
            .content_type
            .as_deref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(true);
        let parsed = is_html.then(|| driftnet_parser::parse_page(&resp.body, url));

        let lang = parsed
            .as_ref()
            .and_then(|p| p.language.clone())
            .or_else(|| resp.headers.get("content-language").cloned())
            .map(|l| l.split('-').next().unwrap_or("en").to_ascii_lowercase())
            .unwrap_or_else(|| "en".to_string());

        let raw_key = object_key(&m.domain, resp.fetched_at, &m.url_hash, ".html");
        let meta_key = object_key(&m.domain, resp.fetched_at, &m.url_hash, ".meta.json");
        let raw_meta = RawMeta {
            url: m.url.clone(),
            final_url: resp.final_url.to_string(),
            status: resp.status,
            headers: resp.headers.clone(),
            fetched_at: resp.fetched_at,
            truncated: resp.truncated,
            content_hash: content_hash.clone(),
            lang: Some(lang.clone()),
        };

        let parsed_location = if let Some(parsed) = &parsed {
            let txt_key = object_key(&m.domain, resp.fetched_at, &m.url_hash, ".txt");
            let json_key = object_key(&m.domain, resp.fetched_at, &m.url_hash, ".json");
            let parsed_meta = ParsedMeta {
                url: m.url.clone(),
                title: parsed.title.clone(),
                lang: Some(lang.clone()),
                fetched_at: resp.fetched_at,
            };
            let stored = async {
                self.store
                    .put(PARSED_BUCKET, &txt_key, parsed.body_text.as_bytes())
                    .await?;
                self.store
                    .put(
                        PARSED_BUCKET,
                        &json_key,
                        &serde_json::to_vec(&parsed_meta)
                            .map_err(|e| CrawlError::Storage(e.to_string()))?,
                    )
                    .await?;
                Ok::<_, CrawlError>(())
            }
            .await;
            match stored {
                Ok(()) => Some(ObjectLocation {
                    bucket: PARSED_BUCKET.to_string(),
                    key: txt_key,
                }),
                Err(e) => {
                    warn!(url = %m.url, error = %e, "parsed persist failed");
                    self.schedule_and_settle(
                        msg,
                        self.backoff.delay(Self::attempt(msg)),
                        "object store error",
                    )
                    .await;
                    return;
                }
            }
        } else {
            None
        };

        let stored = async {
            self.store.put(RAW_BUCKET, &raw_key, &resp.body).await?;
            self.store
                .put(
                    RAW_BUCKET,
                    &meta_key,
                    &serde_json::to_vec(&raw_meta)
                        .map_err(|e| CrawlError::Storage(e.to_string()))?,
                )
                .await?;
            Ok::<_, CrawlError>(())
        }
        .await;
        if let Err(e) = stored {
            warn!(url = %m.url, error = %e, "raw persist failed");
            self.schedule_and_settle(
                msg,
                self.backoff.delay(Self::attempt(msg)),
                "object store error",
            )
            .await;
            return;
        }

        let raw_location = ObjectLocation {
            bucket: RAW_BUCKET.to_string(),
            key: raw_key,
        };
        match self
            .complete_with_retry(
                &m.url_hash,
                Outcome::Success {
                    raw_location: Some(raw_location.clone()),
                    crawled_at: resp.fetched_at,
                },
            )
            .await
        {
            Ok(Conditional::Applied) => {}
            Ok(Conditional::Lost) => {
                debug!(url = %m.url, "ownership lost at completion, dropping");
                return;
            }
            Err(e) => {
                warn!(url = %m.url, error = %e, "completion failed");
                let _ = self
                    .crawl_queue
                    .nack(&msg.receipt, Some(self.backoff.delay(Self::attempt(msg))))
                    .await;
                return;
            }
        }

        if prev_hash.as_deref() == Some(content_hash.as_str()) {
            debug!(url = %m.url, "content unchanged, skipping index message");
        } else {
            let index_msg = IndexMessage {
                v: SCHEMA_VERSION,
                url: m.url.clone(),
                url_hash: m.url_hash.clone(),
                domain: m.domain.clone(),
                raw_location,
                parsed_location,
                detected_lang: lang,
                fetched_at: resp.fetched_at,
            };
            if let Err(e) = self.index_queue.send(&index_msg, 0.0).await {
                // No ack: redelivery will re-run this idempotently.
                warn!(url = %m.url, error = %e, "index enqueue failed");
                return;
            }
        }

        if let Some(parsed) = &parsed {
            self.emit_outlinks(&m.domain, parsed).await;
        }

        let _ = self.crawl_queue.ack(&msg.receipt).await;
        info!(
            url = %m.url,
            status = resp.status,
            bytes = resp.body.len(),
            truncated = resp.truncated,
            "page crawled"
        );
    }

    /// Outlink fan-out: same-domain links insert pending records and go
    /// straight to the crawl queue; foreign domains go through discovery,
    /// coalesced to one message per domain per page.
    async fn emit_outlinks(&self, domain: &str, parsed: &driftnet_parser::ParsedPage) {
        let mut same: Vec<(CrawlMessage, f64)> = Vec::new();
        let mut foreign: HashSet<String> = HashSet::new();
        let mut emitted = 0usize;

        for link in &parsed.links {
            if emitted >= self.opts.max_links_per_page {
                break;
            }
            let Ok(canonical) = urlnorm::normalize(&link.url) else {
                continue;
            };
            let Ok(link_domain) = urlnorm::registrable_domain(&canonical) else {
                continue;
            };
            if link_domain == domain {
                let url_hash = urlnorm::url_hash(&canonical);
                match self
                    .state
                    .insert_pending(canonical.as_str(), &url_hash, &link_domain)
                    .await
                {
                    Ok(true) => {
                        same.push((
                            CrawlMessage {
                                v: SCHEMA_VERSION,
                                url: canonical.to_string(),
                                domain: link_domain,
                                url_hash,
                                priority: OUTLINK_PRIORITY,
                                attempt: 0,
                                enqueued_at: Utc::now(),
                            },
                            OUTLINK_PRIORITY,
                        ));
                        emitted += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(url = %canonical, error = %e, "pending insert failed"),
                }
            } else if foreign.insert(link_domain) {
                emitted += 1;
            }
        }

        if !same.is_empty() {
            let count = same.len();
            if let Err(e) = self.crawl_queue.send_batch(&same).await {
                warn!(error = %e, "outlink enqueue failed");
            } else {
                debug!(count, "same-domain outlinks enqueued");
            }
        }
        for d in foreign {
            let _ = self
                .discovery_queue
                .send(&DiscoveryMessage::new(d, "outlink"), 0.0)
                .await;
        }
    }

    async fn schedule_and_settle(&self, msg: &Received<CrawlMessage>, delay: Duration, reason: &str) {
        let m = &msg.body;
        match self
            .state
            .schedule_retry(&m.url_hash, &self.worker_id, delay, reason)
            .await
        {
            Ok(RetryDecision::Deferred { retries }) => {
                info!(url = %m.url, retries, delay_ms = delay.as_millis() as u64, %reason, "deferred for retry");
                let _ = self.crawl_queue.nack(&msg.receipt, Some(delay)).await;
            }
            Ok(RetryDecision::Exhausted) => {
                warn!(url = %m.url, %reason, "retry budget exhausted");
                let _ = self.crawl_queue.to_dlq(&msg.receipt, reason).await;
            }
            Ok(RetryDecision::Lost) => {
                debug!(url = %m.url, "ownership lost while deferring, dropping");
            }
            Err(e) => {
                warn!(url = %m.url, error = %e, "schedule_retry failed");
                let _ = self.crawl_queue.nack(&msg.receipt, Some(delay)).await;
            }
        }
    }

    async fn complete_with_retry(
        &self,
        url_hash: &str,
        outcome: Outcome,
    ) -> Result<Conditional, CrawlError> {
        self.backoff
            .retry(3, || {
                self.state
                    .complete(url_hash, &self.worker_id, outcome.clone())
            })
            .await
    }

    /// Content hash of the previous successful fetch, read from the sidecar
    /// of the record's current raw location.
    async fn previous_content_hash(&self, url_hash: &str) -> Option<String> {
        let record = self.state.get(url_hash).await.ok()??;
        let location = record.raw_location?;
        let meta_key = location.key.strip_suffix(".html")?.to_string() + ".meta.json";
        let bytes = self.store.get(&location.bucket, &meta_key).await.ok()??;
        let meta: RawMeta = serde_json::from_slice(&bytes).ok()?;
        Some(meta.content_hash)
    }
}

/// Spawn `slots` cooperative crawl slots sharing one worker.
pub fn spawn_slots(
    worker: Arc<CrawlWorker>,
    slots: usize,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(slots);
    for slot_id in 0..slots {
        let worker = Arc::clone(&worker);
        let mut shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            debug!(slot_id, "crawl slot started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(slot_id, "crawl slot shutting down");
                        break;
                    }
                    msgs = worker.crawl_queue.receive(1) => {
                        match msgs {
                            Ok(msgs) if msgs.is_empty() => {
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                            Ok(msgs) => {
                                for msg in msgs {
                                    worker.process(msg).await;
                                }
                            }
                            Err(e) => {
                                warn!(slot_id, error = %e, "crawl receive failed");
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                        }
                    }
                }
            }
        }));
    }
    handles
}

/// Periodic sweep returning expired leases to `pending`, so work owned by
/// dead workers is redelivered without operator action.
pub fn spawn_reclaimer(
    state: Arc<dyn StateStore>,
    interval: Duration,
    batch_size: u32,
    shutdown: &broadcast::Sender<()>,
) -> JoinHandle<()> {
    let mut shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {
                    match state.reclaim_expired(batch_size).await {
                        Ok(0) => {}
                        Ok(n) => info!(reclaimed = n, "expired leases reclaimed"),
                        Err(e) => warn!(error = %e, "reclaim sweep failed"),
                    }
                }
            }
        }
    })
}
