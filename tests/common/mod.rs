//! Shared scaffolding for pipeline scenario tests: a canned-response HTTP
//! server the crawler fetches from, and an in-memory wiring of the whole
//! pipeline (queues, state store, gate, object store).

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use driftnet_core::config::{DiscoveryConfig, GateConfig};
use driftnet_core::{
    urlnorm, Backoff, CrawlMessage, DiscoveryMessage, FetchConfig, IndexMessage, SCHEMA_VERSION,
};
use driftnet_crawler::{CrawlWorker, CrawlerOptions, Fetcher};
use driftnet_discovery::DiscoveryCoordinator;
use driftnet_gate::{Gate, MemoryCounterStore};
use driftnet_indexer::{EmbeddingClient, IndexWorker, IndexerOptions, SearchIndex};
use driftnet_queue::{MemoryQueue, Queue, QueueOptions, TypedQueue};
use driftnet_state::{MemoryStateStore, StateOptions, StateStore};
use driftnet_store::MemoryObjectStore;

// ---------- canned-response HTTP server ----------

#[derive(Clone)]
pub struct Canned {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

pub fn ok_html(body: &str) -> Canned {
    Canned {
        status: 200,
        content_type: "text/html; charset=utf-8".to_string(),
        body: body.as_bytes().to_vec(),
        headers: Vec::new(),
    }
}

pub fn ok_text(body: &str) -> Canned {
    Canned {
        status: 200,
        content_type: "text/plain".to_string(),
        body: body.as_bytes().to_vec(),
        headers: Vec::new(),
    }
}

pub fn ok_xml(body: &str) -> Canned {
    Canned {
        status: 200,
        content_type: "application/xml".to_string(),
        body: body.as_bytes().to_vec(),
        headers: Vec::new(),
    }
}

pub fn status(code: u16) -> Canned {
    Canned {
        status: code,
        content_type: "text/plain".to_string(),
        body: Vec::new(),
        headers: Vec::new(),
    }
}

pub fn redirect(location: &str) -> Canned {
    Canned {
        status: 302,
        content_type: "text/plain".to_string(),
        body: Vec::new(),
        headers: vec![("location".to_string(), location.to_string())],
    }
}

struct ServerState {
    /// Responses per path, consumed in order; the last entry repeats.
    routes: Mutex<HashMap<String, Vec<Canned>>>,
    counts: Mutex<HashMap<String, usize>>,
    hits: Mutex<Vec<(String, Instant)>>,
}

pub struct TestServer {
    pub addr: SocketAddr,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let state = Arc::new(ServerState {
            routes: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            hits: Mutex::new(Vec::new()),
        });

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 16 * 1024];
                    let mut read = 0usize;
                    loop {
                        match sock.read(&mut buf[read..]).await {
                            Ok(0) => break,
                            Ok(n) => {
                                read += n;
                                if buf[..read].windows(4).any(|w| w == b"\r\n\r\n")
                                    || read == buf.len()
                                {
                                    break;
                                }
                            }
                            Err(_) => return,
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]);
                    let path = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();

                    state.hits.lock().await.push((path.clone(), Instant::now()));
                    let canned = {
                        let routes = state.routes.lock().await;
                        let mut counts = state.counts.lock().await;
                        routes.get(&path).map(|responses| {
                            let n = counts.entry(path.clone()).or_insert(0);
                            let canned = responses[(*n).min(responses.len() - 1)].clone();
                            *n += 1;
                            canned
                        })
                    }
                    .unwrap_or_else(|| status(404));

                    let mut response = format!(
                        "HTTP/1.1 {} X\r\ncontent-type: {}\r\ncontent-length: {}\r\nconnection: close\r\n",
                        canned.status,
                        canned.content_type,
                        canned.body.len()
                    );
                    for (name, value) in &canned.headers {
                        response.push_str(&format!("{}: {}\r\n", name, value));
                    }
                    response.push_str("\r\n");
                    let _ = sock.write_all(response.as_bytes()).await;
                    let _ = sock.write_all(&canned.body).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        Self { addr, state }
    }

    /// `host:port`, which is also the pipeline's domain key for this server.
    pub fn host(&self) -> String {
        format!("{}", self.addr)
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn route(&self, path: &str, responses: Vec<Canned>) {
        assert!(!responses.is_empty());
        self.state
            .routes
            .lock()
            .await
            .insert(path.to_string(), responses);
    }

    pub async fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .await
            .iter()
            .filter(|(p, _)| p == path)
            .count()
    }
}

// ---------- in-memory pipeline wiring ----------

pub struct HarnessOptions {
    pub max_retries: u32,
    pub recrawl_after: Duration,
    pub default_qps: f64,
    pub window_seconds: u64,
    pub visibility: Duration,
    pub max_receive: u32,
    pub lease: Duration,
    pub backoff_base: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            recrawl_after: Duration::from_secs(3600),
            default_qps: 100.0,
            window_seconds: 1,
            visibility: Duration::from_millis(100),
            max_receive: 10,
            lease: Duration::from_secs(5),
            backoff_base: Duration::from_millis(50),
        }
    }
}

pub struct Harness {
    pub opts: HarnessOptions,
    pub state: Arc<MemoryStateStore>,
    pub store: Arc<MemoryObjectStore>,
    pub gate: Arc<Gate>,
    pub discovery_q: TypedQueue<DiscoveryMessage>,
    pub crawl_q: TypedQueue<CrawlMessage>,
    pub index_q: TypedQueue<IndexMessage>,
    pub discovery_dlq: Arc<MemoryQueue>,
    pub crawl_dlq: Arc<MemoryQueue>,
    pub index_dlq: Arc<MemoryQueue>,
}

impl Harness {
    pub fn new(opts: HarnessOptions) -> Self {
        let state = Arc::new(MemoryStateStore::new(StateOptions {
            max_retries: opts.max_retries,
            recrawl_after: opts.recrawl_after,
        }));
        let store = Arc::new(MemoryObjectStore::new());
        let gate = Arc::new(
            Gate::new(
                GateConfig {
                    window_seconds: opts.window_seconds,
                    default_qps: opts.default_qps,
                    robots_failure_ttl_seconds: 1,
                    ..GateConfig::default()
                },
                Arc::new(MemoryCounterStore::new()),
                None,
            )
            .expect("gate"),
        );

        let qopts = QueueOptions {
            visibility: opts.visibility,
            max_receive_count: opts.max_receive,
        };
        let discovery_dlq = MemoryQueue::dead_letter("discovery-dlq");
        let crawl_dlq = MemoryQueue::dead_letter("crawl-dlq");
        let index_dlq = MemoryQueue::dead_letter("index-dlq");
        let discovery: Arc<dyn Queue> = Arc::new(MemoryQueue::new(
            "discovery",
            qopts.clone(),
            Some(discovery_dlq.clone()),
        ));
        let crawl: Arc<dyn Queue> =
            Arc::new(MemoryQueue::new("crawl", qopts.clone(), Some(crawl_dlq.clone())));
        let index: Arc<dyn Queue> =
            Arc::new(MemoryQueue::new("index", qopts, Some(index_dlq.clone())));

        Self {
            opts,
            state,
            store,
            gate,
            discovery_q: TypedQueue::new(discovery),
            crawl_q: TypedQueue::new(crawl),
            index_q: TypedQueue::new(index),
            discovery_dlq,
            crawl_dlq,
            index_dlq,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: self.opts.backoff_base,
            factor: 2.0,
            max: Duration::from_secs(2),
            jitter: 0.0,
        }
    }

    pub fn crawl_worker(&self, worker_id: &str) -> Arc<CrawlWorker> {
        let fetcher = Fetcher::new(
            FetchConfig {
                timeout: Duration::from_secs(5),
                max_body_size: 1024 * 1024,
                max_redirects: 5,
                user_agent: "driftnet-test/0.1".to_string(),
            },
            4,
        )
        .expect("fetcher");
        Arc::new(CrawlWorker::new(
            self.state.clone(),
            self.gate.clone(),
            self.store.clone(),
            self.crawl_q.clone(),
            self.index_q.clone(),
            self.discovery_q.clone(),
            fetcher,
            CrawlerOptions {
                user_agent: "driftnet-test/0.1".to_string(),
                lease: self.opts.lease,
                wait_threshold: Duration::from_millis(200),
                max_links_per_page: 32,
                backoff: self.backoff(),
            },
            worker_id.to_string(),
        ))
    }

    pub fn coordinator(&self) -> DiscoveryCoordinator {
        self.coordinator_with(DiscoveryConfig {
            assume_scheme: "http".to_string(),
            ..DiscoveryConfig::default()
        })
    }

    pub fn coordinator_with(&self, cfg: DiscoveryConfig) -> DiscoveryCoordinator {
        DiscoveryCoordinator::new(
            self.gate.clone(),
            self.state.clone(),
            self.discovery_q.clone(),
            self.crawl_q.clone(),
            cfg,
        )
        .expect("coordinator")
    }

    pub fn index_worker(
        &self,
        embeddings: Arc<dyn EmbeddingClient>,
        index: Arc<dyn SearchIndex>,
    ) -> IndexWorker {
        IndexWorker::new(
            self.index_q.clone(),
            self.store.clone(),
            embeddings,
            index,
            IndexerOptions::default(),
        )
    }

    /// Enqueue one crawl message for a URL and create its pending record,
    /// the way discovery would.
    pub async fn seed_url(&self, url: &str) -> CrawlMessage {
        let canonical = urlnorm::normalize(url).expect("normalize");
        let domain = urlnorm::registrable_domain(&canonical).expect("domain");
        let url_hash = urlnorm::url_hash(&canonical);
        self.state
            .insert_pending(canonical.as_str(), &url_hash, &domain)
            .await
            .expect("insert");
        let msg = CrawlMessage {
            v: SCHEMA_VERSION,
            url: canonical.to_string(),
            domain,
            url_hash,
            priority: 0.5,
            attempt: 0,
            enqueued_at: chrono::Utc::now(),
        };
        self.crawl_q.send(&msg, msg.priority).await.expect("send");
        msg
    }

    /// Receive-and-process crawl messages until the queue stays empty or the
    /// deadline passes. Waits out visibility delays between rounds.
    pub async fn drain_crawl(&self, worker: &CrawlWorker, deadline: Duration) {
        let start = Instant::now();
        loop {
            let msgs = self.crawl_q.receive(4).await.expect("receive");
            if msgs.is_empty() {
                if self.crawl_q.approx_depth().await.expect("depth") == 0 {
                    return;
                }
                if start.elapsed() > deadline {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                continue;
            }
            for msg in msgs {
                worker.process(msg).await;
            }
            if start.elapsed() > deadline {
                return;
            }
        }
    }
}
