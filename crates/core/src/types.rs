use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Version stamped into every queue message.
pub const SCHEMA_VERSION: u32 = 1;

/// Lifecycle of a URL record in the state store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlState {
    Pending,
    InProgress,
    Done,
    Failed,
    Deferred,
}

impl UrlState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlState::Pending => "pending",
            UrlState::InProgress => "in_progress",
            UrlState::Done => "done",
            UrlState::Failed => "failed",
            UrlState::Deferred => "deferred",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(UrlState::Pending),
            "in_progress" => Some(UrlState::InProgress),
            "done" => Some(UrlState::Done),
            "failed" => Some(UrlState::Failed),
            "deferred" => Some(UrlState::Deferred),
            _ => None,
        }
    }

    /// Terminal states never transition again (except stale-`done` re-crawl).
    pub fn is_terminal(&self) -> bool {
        matches!(self, UrlState::Done | UrlState::Failed)
    }
}

impl std::fmt::Display for UrlState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pointer to a stored object: bucket + key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

/// One row in the state store, keyed by `url_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UrlRecord {
    pub url_hash: String,
    pub url: String,
    pub domain: String,
    pub state: UrlState,
    pub owner_id: Option<String>,
    pub acquired_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub raw_location: Option<ObjectLocation>,
}

/// Asks the discovery coordinator to enumerate one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub v: u32,
    pub domain: String,
    /// Where the domain came from: "seed", "outlink", "sitemap".
    pub source: String,
}

impl DiscoveryMessage {
    pub fn new(domain: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            v: SCHEMA_VERSION,
            domain: domain.into(),
            source: source.into(),
        }
    }
}

/// One unit of crawl work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlMessage {
    pub v: u32,
    pub url: String,
    pub domain: String,
    pub url_hash: String,
    pub priority: f64,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Hand-off from crawler to indexer after raw content is persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMessage {
    pub v: u32,
    pub url: String,
    pub url_hash: String,
    pub domain: String,
    pub raw_location: ObjectLocation,
    pub parsed_location: Option<ObjectLocation>,
    pub detected_lang: String,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub timeout: Duration,
    pub max_body_size: usize,
    pub max_redirects: usize,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024,
            max_redirects: 5,
            user_agent: "driftnet/0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: Url,
    pub final_url: Url,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub fetched_at: DateTime<Utc>,
    pub response_time_ms: u64,
    /// Body hit the size cap and was cut short.
    pub truncated: bool,
}

/// Worker identity used as the lock owner in the state store.
pub fn make_worker_id(role: &str) -> String {
    format!("{}-{}-{:04x}", role, std::process::id(), rand::random::<u16>())
}
