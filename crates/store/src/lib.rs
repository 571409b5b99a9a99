//! Object storage for raw and parsed page content. Keys are date-partitioned
//! under the page's domain; consumers other than the bucket owners treat them
//! as opaque.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use driftnet_core::CrawlError;

pub mod fs;
pub mod memory;

pub use fs::FsObjectStore;
pub use memory::MemoryObjectStore;

pub const RAW_BUCKET: &str = "raw";
pub const PARSED_BUCKET: &str = "parsed";

/// `{domain}/{YYYY}/{MM}/{DD}/{url_hash}` plus a suffix for the concrete
/// object (`.html`, `.meta.json`, `.txt`, `.json`).
pub fn object_key(domain: &str, fetched_at: DateTime<Utc>, url_hash: &str, suffix: &str) -> String {
    format!(
        "{}/{:04}/{:02}/{:02}/{}{}",
        domain,
        fetched_at.year(),
        fetched_at.month(),
        fetched_at.day(),
        url_hash,
        suffix
    )
}

/// Sidecar stored next to every raw object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMeta {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub fetched_at: DateTime<Utc>,
    pub truncated: bool,
    pub content_hash: String,
    pub lang: Option<String>,
}

/// Sidecar for the parsed bucket: metadata next to the extracted `.txt`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParsedMeta {
    pub url: String,
    pub title: Option<String>,
    pub lang: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync + 'static {
    async fn put(&self, bucket: &str, key: &str, bytes: &[u8]) -> Result<(), CrawlError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, CrawlError>;
}
