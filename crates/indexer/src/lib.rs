//! Index worker: loads extracted text, chunks it against the embedding
//! model's token budget, embeds, and bulk-upserts document + chunk records
//! keyed by `url_hash`. The worker never touches the URL lock; its writes
//! are a downstream projection made idempotent by the upsert key.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use driftnet_core::{Backoff, CrawlError, IndexMessage};
use driftnet_queue::{Received, TypedQueue};
use driftnet_store::{ObjectStore, ParsedMeta};

pub mod chunk;
pub mod embedding;
pub mod search;

pub use embedding::{EmbeddingClient, FixedEmbeddingClient, HttpEmbeddingClient};
pub use search::{
    BulkFailure, BulkReport, HttpSearchIndex, IndexDocument, MappingStatus, MemorySearchIndex,
    SearchIndex,
};

#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub index_name: String,
    pub bulk_size: usize,
    pub embedding_concurrency: usize,
    pub bulk_retry_attempts: u32,
    pub enable_embeddings: bool,
    pub max_chunk_tokens: usize,
    pub chunk_overlap_tokens: usize,
}

impl Default for IndexerOptions {
    fn default() -> Self {
        Self {
            index_name: "pages".to_string(),
            bulk_size: 200,
            embedding_concurrency: 2,
            bulk_retry_attempts: 3,
            enable_embeddings: true,
            max_chunk_tokens: 512,
            chunk_overlap_tokens: 64,
        }
    }
}

/// Slots pause this long once the breaker trips.
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const BREAKER_THRESHOLD: u32 = 5;

pub struct IndexWorker {
    index_queue: TypedQueue<IndexMessage>,
    store: Arc<dyn ObjectStore>,
    embeddings: Arc<dyn EmbeddingClient>,
    index: Arc<dyn SearchIndex>,
    opts: IndexerOptions,
    embed_permits: Arc<Semaphore>,
    backoff: Backoff,
    /// Consecutive retryable failures across slots; sustained downstream
    /// outage trips the breaker and slows polling instead of hammering.
    consecutive_failures: AtomicU32,
}

impl IndexWorker {
    pub fn new(
        index_queue: TypedQueue<IndexMessage>,
        store: Arc<dyn ObjectStore>,
        embeddings: Arc<dyn EmbeddingClient>,
        index: Arc<dyn SearchIndex>,
        opts: IndexerOptions,
    ) -> Self {
        let embed_permits = Arc::new(Semaphore::new(opts.embedding_concurrency.max(1)));
        Self {
            index_queue,
            store,
            embeddings,
            index,
            opts,
            embed_permits,
            backoff: Backoff::default(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Cooldown to observe before the next poll, once sustained downstream
    /// failures trip the breaker.
    pub fn breaker_cooldown(&self) -> Option<Duration> {
        (self.consecutive_failures.load(Ordering::Relaxed) >= BREAKER_THRESHOLD)
            .then_some(BREAKER_COOLDOWN)
    }

    /// Boot-time dimension negotiation. Probes the model, checks the live
    /// mapping: a missing index is created, an empty index with the wrong
    /// dims is recreated, a non-empty mismatch aborts startup.
    pub async fn negotiate_dimension(&self) -> Result<Option<usize>, CrawlError> {
        if !self.opts.enable_embeddings {
            if self.index.mapping_status(&self.opts.index_name).await? == MappingStatus::Missing {
                self.index.create_index(&self.opts.index_name, None).await?;
                info!(index = %self.opts.index_name, "created index without vector field");
            }
            return Ok(None);
        }

        let model_dim = self.embeddings.dimension().await?;
        match self.index.mapping_status(&self.opts.index_name).await? {
            MappingStatus::Missing => {
                self.index
                    .create_index(&self.opts.index_name, Some(model_dim))
                    .await?;
                info!(index = %self.opts.index_name, dimension = model_dim, "created index");
                Ok(Some(model_dim))
            }
            MappingStatus::Present {
                dimension: Some(mapped),
                ..
            } if mapped == model_dim => {
                debug!(index = %self.opts.index_name, dimension = model_dim, "mapping dimension verified");
                Ok(Some(model_dim))
            }
            MappingStatus::Present {
                dimension,
                doc_count,
            } => {
                if doc_count == 0 {
                    info!(
                        index = %self.opts.index_name,
                        mapped = ?dimension,
                        model = model_dim,
                        "empty index with stale mapping, recreating"
                    );
                    self.index.delete_index(&self.opts.index_name).await?;
                    self.index
                        .create_index(&self.opts.index_name, Some(model_dim))
                        .await?;
                    Ok(Some(model_dim))
                } else {
                    Err(CrawlError::Config(format!(
                        "index {:?} is mapped for {:?}-dim vectors but model emits {}-dim \
                         ({} documents present); refusing to start",
                        self.opts.index_name, dimension, model_dim, doc_count
                    )))
                }
            }
        }
    }

    pub async fn process(&self, msg: Received<IndexMessage>) {
        match self.handle(&msg.body).await {
            Ok(docs) => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                info!(url = %msg.body.url, docs, "indexed");
                let _ = self.index_queue.ack(&msg.receipt).await;
            }
            Err(e) if e.is_retryable() => {
                self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                let delay = match &e {
                    CrawlError::RateLimited {
                        retry_after_seconds: Some(s),
                    } => Duration::from_secs(*s),
                    _ => self.backoff.delay(msg.receive_count.saturating_sub(1)),
                };
                warn!(url = %msg.body.url, error = %e, delay_ms = delay.as_millis() as u64, "index attempt failed, deferring");
                let _ = self.index_queue.nack(&msg.receipt, Some(delay)).await;
            }
            Err(e) => {
                warn!(url = %msg.body.url, error = %e, "index message dead-lettered");
                let _ = self.index_queue.to_dlq(&msg.receipt, &e.to_string()).await;
            }
        }
    }

    /// Returns the number of documents written.
    async fn handle(&self, m: &IndexMessage) -> Result<usize, CrawlError> {
        let (text, title) = self.load_content(m).await?;
        let site = Url::parse(&m.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| m.domain.clone());

        let chunks = chunk::chunk_text(&text, self.opts.max_chunk_tokens, self.opts.chunk_overlap_tokens);

        let vectors = if self.opts.enable_embeddings && !chunks.is_empty() {
            Some(self.embed_chunks(&chunks).await?)
        } else {
            None
        };

        let mut docs: Vec<IndexDocument> = Vec::with_capacity(chunks.len() + 1);
        docs.push(IndexDocument {
            id: m.url_hash.clone(),
            url_hash: m.url_hash.clone(),
            url: m.url.clone(),
            domain: m.domain.clone(),
            site: site.clone(),
            lang: m.detected_lang.clone(),
            title: title.clone(),
            body: text,
            fetched_at: m.fetched_at,
            popularity_score: 0.0,
            chunk_idx: None,
            embedding: vectors.as_ref().and_then(|v| v.first().cloned()),
        });
        if chunks.len() > 1 {
            for (i, chunk_body) in chunks.iter().enumerate() {
                docs.push(IndexDocument {
                    id: format!("{}:{}", m.url_hash, i),
                    url_hash: m.url_hash.clone(),
                    url: m.url.clone(),
                    domain: m.domain.clone(),
                    site: site.clone(),
                    lang: m.detected_lang.clone(),
                    title: title.clone(),
                    body: chunk_body.clone(),
                    fetched_at: m.fetched_at,
                    popularity_score: 0.0,
                    chunk_idx: Some(i as u32),
                    embedding: vectors.as_ref().and_then(|v| v.get(i).cloned()),
                });
            }
        }

        let total = docs.len();
        for batch in docs.chunks(self.opts.bulk_size.max(1)) {
            self.ingest_batch(batch).await?;
        }
        Ok(total)
    }

    /// Parsed text when the crawler wrote it, otherwise extraction from raw.
    async fn load_content(&self, m: &IndexMessage) -> Result<(String, Option<String>), CrawlError> {
        if let Some(parsed) = &m.parsed_location {
            if let Some(bytes) = self.store.get(&parsed.bucket, &parsed.key).await? {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                let title = match parsed.key.strip_suffix(".txt") {
                    Some(base) => self
                        .store
                        .get(&parsed.bucket, &format!("{}.json", base))
                        .await?
                        .and_then(|b| serde_json::from_slice::<ParsedMeta>(&b).ok())
                        .and_then(|meta| meta.title),
                    None => None,
                };
                return Ok((text, title));
            }
        }

        let Some(raw) = self.store.get(&m.raw_location.bucket, &m.raw_location.key).await? else {
            // Raw is gone too: nothing to index, preserve nothing.
            return Err(CrawlError::Parse(format!(
                "no content at {}/{}",
                m.raw_location.bucket, m.raw_location.key
            )));
        };
        let base = Url::parse(&m.url).map_err(|e| CrawlError::InvalidUrl(e.to_string()))?;
        let page = driftnet_parser::parse_page(&raw, &base);
        Ok((page.body_text, page.title))
    }

    async fn embed_chunks(&self, chunks: &[String]) -> Result<Vec<Vec<f32>>, CrawlError> {
        let batch_size = self.opts.bulk_size.min(self.embeddings.max_batch()).max(1);
        let mut vectors = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(batch_size) {
            let _permit = self
                .embed_permits
                .acquire()
                .await
                .map_err(|e| CrawlError::Embedding(e.to_string()))?;
            vectors.extend(self.embeddings.embed(batch).await?);
        }
        Ok(vectors)
    }

    /// Bulk ingest with per-record retry: retryable failures are re-sent
    /// alone with backoff; permanent per-record failures fail the message.
    async fn ingest_batch(&self, batch: &[IndexDocument]) -> Result<(), CrawlError> {
        let mut pending: Vec<IndexDocument> = batch.to_vec();
        let mut attempt = 0u32;
        loop {
            let report = self.index.bulk_upsert(&self.opts.index_name, &pending).await?;
            if report.failures.is_empty() {
                return Ok(());
            }
            if report.failures.iter().any(|f| !f.retryable) {
                let first = &report.failures[0];
                return Err(CrawlError::Parse(format!(
                    "index rejected record {:?}: {}",
                    first.id, first.reason
                )));
            }
            attempt += 1;
            if attempt >= self.opts.bulk_retry_attempts {
                return Err(CrawlError::Index(format!(
                    "{} records still failing after {} attempts",
                    report.failures.len(),
                    attempt
                )));
            }
            let failed_ids: std::collections::HashSet<String> =
                report.failures.iter().map(|f| f.id.clone()).collect();
            pending.retain(|d| failed_ids.contains(&d.id));
            tokio::time::sleep(self.backoff.delay(attempt - 1)).await;
        }
    }
}

/// Spawn `slots` cooperative index slots sharing one worker.
pub fn spawn_slots(
    worker: Arc<IndexWorker>,
    slots: usize,
    shutdown: &broadcast::Sender<()>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(slots);
    for slot_id in 0..slots {
        let worker = Arc::clone(&worker);
        let mut shutdown = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            debug!(slot_id, "index slot started");
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(slot_id, "index slot shutting down");
                        break;
                    }
                    msgs = worker.index_queue.receive(1) => {
                        match msgs {
                            Ok(msgs) if msgs.is_empty() => {
                                tokio::time::sleep(Duration::from_secs(2)).await;
                            }
                            Ok(msgs) => {
                                for msg in msgs {
                                    worker.process(msg).await;
                                }
                                if let Some(cooldown) = worker.breaker_cooldown() {
                                    warn!(slot_id, cooldown_secs = cooldown.as_secs(), "downstream failing, breaker open");
                                    tokio::time::sleep(cooldown).await;
                                }
                            }
                            Err(e) => {
                                warn!(slot_id, error = %e, "index receive failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use driftnet_core::{ObjectLocation, SCHEMA_VERSION};
    use driftnet_queue::{MemoryQueue, QueueOptions, TypedQueue};
    use driftnet_store::MemoryObjectStore;

    fn worker_with(
        embeddings: Arc<dyn EmbeddingClient>,
        index: Arc<dyn SearchIndex>,
        store: Arc<MemoryObjectStore>,
        opts: IndexerOptions,
    ) -> IndexWorker {
        let queue: Arc<dyn driftnet_queue::Queue> =
            Arc::new(MemoryQueue::new("index", QueueOptions::default(), None));
        IndexWorker::new(TypedQueue::new(queue), store, embeddings, index, opts)
    }

    fn message(url_hash: &str) -> IndexMessage {
        IndexMessage {
            v: SCHEMA_VERSION,
            url: "https://example.test/a".to_string(),
            url_hash: url_hash.to_string(),
            domain: "example.test".to_string(),
            raw_location: ObjectLocation {
                bucket: "raw".to_string(),
                key: "example.test/2026/01/01/h.html".to_string(),
            },
            parsed_location: Some(ObjectLocation {
                bucket: "parsed".to_string(),
                key: "example.test/2026/01/01/h.txt".to_string(),
            }),
            detected_lang: "en".to_string(),
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn negotiation_creates_missing_index() {
        let index = Arc::new(MemorySearchIndex::new());
        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(8)),
            index.clone(),
            Arc::new(MemoryObjectStore::new()),
            IndexerOptions::default(),
        );
        assert_eq!(worker.negotiate_dimension().await.unwrap(), Some(8));
        assert_eq!(
            index.mapping_status("pages").await.unwrap(),
            MappingStatus::Present {
                dimension: Some(8),
                doc_count: 0
            }
        );
    }

    #[tokio::test]
    async fn negotiation_recreates_empty_mismatched_index() {
        let index = Arc::new(MemorySearchIndex::with_mapping("pages", Some(1024)).await);
        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(1536)),
            index.clone(),
            Arc::new(MemoryObjectStore::new()),
            IndexerOptions::default(),
        );
        assert_eq!(worker.negotiate_dimension().await.unwrap(), Some(1536));
        assert_eq!(
            index.mapping_status("pages").await.unwrap(),
            MappingStatus::Present {
                dimension: Some(1536),
                doc_count: 0
            }
        );
    }

    #[tokio::test]
    async fn negotiation_aborts_on_populated_mismatch() {
        let index = Arc::new(MemorySearchIndex::with_mapping("pages", Some(1024)).await);
        index
            .seed_doc(
                "pages",
                IndexDocument {
                    id: "existing".to_string(),
                    url_hash: "existing".to_string(),
                    url: "https://example.test/x".to_string(),
                    domain: "example.test".to_string(),
                    site: "example.test".to_string(),
                    lang: "en".to_string(),
                    title: None,
                    body: "x".to_string(),
                    fetched_at: Utc::now(),
                    popularity_score: 0.0,
                    chunk_idx: None,
                    embedding: Some(vec![0.0; 1024]),
                },
            )
            .await;

        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(1536)),
            index.clone(),
            Arc::new(MemoryObjectStore::new()),
            IndexerOptions::default(),
        );
        let err = worker.negotiate_dimension().await.unwrap_err().to_string();
        assert!(err.contains("1024"), "error names mapped dims: {}", err);
        assert!(err.contains("1536"), "error names model dims: {}", err);
        // Nothing was written or destroyed.
        assert_eq!(index.doc_count("pages").await, 1);
    }

    #[tokio::test]
    async fn embeddings_disabled_skips_probe_and_vector_field() {
        let index = Arc::new(MemorySearchIndex::new());
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("parsed", "example.test/2026/01/01/h.txt", b"plain words here")
            .await
            .unwrap();
        let opts = IndexerOptions {
            enable_embeddings: false,
            ..IndexerOptions::default()
        };
        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(8)),
            index.clone(),
            store,
            opts,
        );
        assert_eq!(worker.negotiate_dimension().await.unwrap(), None);

        worker.handle(&message("h1")).await.unwrap();
        let doc = index.get("pages", "h1").await.unwrap();
        assert!(doc.embedding.is_none());
        assert_eq!(doc.body, "plain words here");
    }

    #[tokio::test]
    async fn document_and_chunk_records_share_url_hash() {
        let index = Arc::new(MemorySearchIndex::new());
        let store = Arc::new(MemoryObjectStore::new());
        let words: Vec<String> = (0..400).map(|i| format!("word{:03}", i)).collect();
        store
            .put(
                "parsed",
                "example.test/2026/01/01/h.txt",
                words.join(" ").as_bytes(),
            )
            .await
            .unwrap();

        let opts = IndexerOptions {
            max_chunk_tokens: 50,
            chunk_overlap_tokens: 5,
            ..IndexerOptions::default()
        };
        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(8)),
            index.clone(),
            store,
            opts,
        );
        worker.negotiate_dimension().await.unwrap();
        let written = worker.handle(&message("h1")).await.unwrap();
        assert!(written > 2, "expected doc + chunks, got {}", written);

        let doc = index.get("pages", "h1").await.unwrap();
        assert!(doc.chunk_idx.is_none());
        assert_eq!(doc.embedding.as_ref().unwrap().len(), 8);
        let chunk0 = index.get("pages", "h1:0").await.unwrap();
        assert_eq!(chunk0.url_hash, "h1");
        assert_eq!(chunk0.chunk_idx, Some(0));
    }

    #[tokio::test]
    async fn sustained_downstream_failure_trips_breaker() {
        // The index was never created, so every bulk upsert fails retryably.
        let index = Arc::new(MemorySearchIndex::new());
        let store = Arc::new(MemoryObjectStore::new());
        store
            .put("parsed", "example.test/2026/01/01/h.txt", b"some words")
            .await
            .unwrap();
        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(8)),
            index,
            store,
            IndexerOptions::default(),
        );
        assert!(worker.breaker_cooldown().is_none());

        for i in 0..5 {
            worker
                .index_queue
                .send(&message(&format!("h{}", i)), 0.0)
                .await
                .unwrap();
            let msgs = worker.index_queue.receive(1).await.unwrap();
            worker.process(msgs.into_iter().next().unwrap()).await;
        }
        assert!(worker.breaker_cooldown().is_some());
    }

    #[tokio::test]
    async fn missing_content_is_permanent() {
        let index = Arc::new(MemorySearchIndex::new());
        let worker = worker_with(
            Arc::new(FixedEmbeddingClient::new(8)),
            index,
            Arc::new(MemoryObjectStore::new()),
            IndexerOptions::default(),
        );
        worker.negotiate_dimension().await.unwrap();
        let err = worker.handle(&message("h1")).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
