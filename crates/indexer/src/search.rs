//! Search index client. Documents are keyed by `url_hash` (chunks by
//! `url_hash:chunk_idx`) so every write is an idempotent upsert; bulk
//! ingestion reports per-record outcomes for individual retry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use driftnet_core::CrawlError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Document id in the index; not part of the source body.
    #[serde(skip)]
    pub id: String,
    pub url_hash: String,
    pub url: String,
    pub domain: String,
    pub site: String,
    pub lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    pub fetched_at: DateTime<Utc>,
    pub popularity_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_idx: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingStatus {
    Missing,
    Present {
        /// Dims of the dense-vector field, when the mapping has one.
        dimension: Option<usize>,
        doc_count: u64,
    },
}

#[derive(Debug, Clone)]
pub struct BulkFailure {
    pub id: String,
    pub reason: String,
    pub retryable: bool,
}

#[derive(Debug, Default)]
pub struct BulkReport {
    pub ok: usize,
    pub failures: Vec<BulkFailure>,
}

#[async_trait]
pub trait SearchIndex: Send + Sync + 'static {
    async fn mapping_status(&self, index: &str) -> Result<MappingStatus, CrawlError>;

    async fn create_index(&self, index: &str, dimension: Option<usize>)
        -> Result<(), CrawlError>;

    async fn delete_index(&self, index: &str) -> Result<(), CrawlError>;

    async fn bulk_upsert(
        &self,
        index: &str,
        docs: &[IndexDocument],
    ) -> Result<BulkReport, CrawlError>;
}

fn mapping_body(dimension: Option<usize>) -> serde_json::Value {
    let mut properties = json!({
        "url_hash": {"type": "keyword"},
        "url": {"type": "keyword"},
        "domain": {"type": "keyword"},
        "site": {"type": "keyword"},
        "lang": {"type": "keyword"},
        "title": {"type": "text"},
        "body": {"type": "text"},
        "fetched_at": {"type": "date"},
        "popularity_score": {"type": "float"},
        "chunk_idx": {"type": "integer"},
    });
    if let Some(dims) = dimension {
        properties["embedding"] = json!({
            "type": "dense_vector",
            "dims": dims,
            "index": true,
            "similarity": "cosine",
        });
    }
    json!({"mappings": {"properties": properties}})
}

/// Elasticsearch-compatible HTTP surface: `GET /{index}` for the mapping,
/// `PUT /{index}` to create, `POST /_bulk` NDJSON for ingestion.
pub struct HttpSearchIndex {
    client: reqwest::Client,
    endpoint: String,
}

fn http_err(e: reqwest::Error) -> CrawlError {
    CrawlError::Index(e.to_string())
}

impl HttpSearchIndex {
    pub fn new(
        endpoint: impl Into<String>,
        timeout: std::time::Duration,
    ) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn mapping_status(&self, index: &str) -> Result<MappingStatus, CrawlError> {
        let resp = self
            .client
            .get(format!("{}/{}", self.endpoint, index))
            .send()
            .await
            .map_err(http_err)?;
        if resp.status().as_u16() == 404 {
            return Ok(MappingStatus::Missing);
        }
        if !resp.status().is_success() {
            return Err(CrawlError::Index(format!(
                "mapping fetch: HTTP {}",
                resp.status().as_u16()
            )));
        }
        let body: serde_json::Value = resp.json().await.map_err(http_err)?;
        let dimension = body[index]["mappings"]["properties"]["embedding"]["dims"]
            .as_u64()
            .map(|d| d as usize);

        let count_resp = self
            .client
            .get(format!("{}/{}/_count", self.endpoint, index))
            .send()
            .await
            .map_err(http_err)?;
        let doc_count = if count_resp.status().is_success() {
            let body: serde_json::Value = count_resp.json().await.map_err(http_err)?;
            body["count"].as_u64().unwrap_or(0)
        } else {
            0
        };
        Ok(MappingStatus::Present {
            dimension,
            doc_count,
        })
    }

    async fn create_index(
        &self,
        index: &str,
        dimension: Option<usize>,
    ) -> Result<(), CrawlError> {
        let resp = self
            .client
            .put(format!("{}/{}", self.endpoint, index))
            .json(&mapping_body(dimension))
            .send()
            .await
            .map_err(http_err)?;
        if !resp.status().is_success() {
            return Err(CrawlError::Index(format!(
                "index create: HTTP {}",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), CrawlError> {
        let resp = self
            .client
            .delete(format!("{}/{}", self.endpoint, index))
            .send()
            .await
            .map_err(http_err)?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(CrawlError::Index(format!(
                "index delete: HTTP {}",
                resp.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        docs: &[IndexDocument],
    ) -> Result<BulkReport, CrawlError> {
        if docs.is_empty() {
            return Ok(BulkReport::default());
        }
        let mut ndjson = String::new();
        for doc in docs {
            let action = json!({"index": {"_index": index, "_id": doc.id}});
            ndjson.push_str(&action.to_string());
            ndjson.push('\n');
            ndjson.push_str(
                &serde_json::to_string(doc).map_err(|e| CrawlError::Index(e.to_string()))?,
            );
            ndjson.push('\n');
        }

        let resp = self
            .client
            .post(format!("{}/_bulk", self.endpoint))
            .header("content-type", "application/x-ndjson")
            .body(ndjson)
            .send()
            .await
            .map_err(http_err)?;
        let status = resp.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(CrawlError::Index(format!("bulk: HTTP {}", status.as_u16())));
        }
        if !status.is_success() {
            return Err(CrawlError::Parse(format!(
                "bulk rejected: HTTP {}",
                status.as_u16()
            )));
        }

        let body: serde_json::Value = resp.json().await.map_err(http_err)?;
        let mut report = BulkReport::default();
        let Some(items) = body["items"].as_array() else {
            report.ok = docs.len();
            return Ok(report);
        };
        for item in items {
            let entry = &item["index"];
            let code = entry["status"].as_u64().unwrap_or(200) as u16;
            if (200..300).contains(&code) {
                report.ok += 1;
            } else {
                report.failures.push(BulkFailure {
                    id: entry["_id"].as_str().unwrap_or_default().to_string(),
                    reason: entry["error"].to_string(),
                    retryable: code == 429 || code >= 500,
                });
            }
        }
        Ok(report)
    }
}

struct MemIndex {
    dimension: Option<usize>,
    docs: HashMap<String, IndexDocument>,
}

/// In-memory index for tests: enforces the dense-vector dimension the way a
/// live mapping would.
#[derive(Default)]
pub struct MemorySearchIndex {
    indices: Mutex<HashMap<String, MemIndex>>,
}

impl MemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-create an index with a fixed mapping, as if provisioned earlier.
    pub async fn with_mapping(index: &str, dimension: Option<usize>) -> Self {
        let this = Self::default();
        this.create_index(index, dimension).await.expect("create");
        this
    }

    pub async fn doc_count(&self, index: &str) -> usize {
        self.indices
            .lock()
            .await
            .get(index)
            .map(|i| i.docs.len())
            .unwrap_or(0)
    }

    pub async fn get(&self, index: &str, id: &str) -> Option<IndexDocument> {
        self.indices
            .lock()
            .await
            .get(index)
            .and_then(|i| i.docs.get(id).cloned())
    }

    pub async fn seed_doc(&self, index: &str, doc: IndexDocument) {
        if let Some(idx) = self.indices.lock().await.get_mut(index) {
            idx.docs.insert(doc.id.clone(), doc);
        }
    }
}

#[async_trait]
impl SearchIndex for MemorySearchIndex {
    async fn mapping_status(&self, index: &str) -> Result<MappingStatus, CrawlError> {
        Ok(match self.indices.lock().await.get(index) {
            None => MappingStatus::Missing,
            Some(i) => MappingStatus::Present {
                dimension: i.dimension,
                doc_count: i.docs.len() as u64,
            },
        })
    }

    async fn create_index(
        &self,
        index: &str,
        dimension: Option<usize>,
    ) -> Result<(), CrawlError> {
        self.indices.lock().await.insert(
            index.to_string(),
            MemIndex {
                dimension,
                docs: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<(), CrawlError> {
        self.indices.lock().await.remove(index);
        Ok(())
    }

    async fn bulk_upsert(
        &self,
        index: &str,
        docs: &[IndexDocument],
    ) -> Result<BulkReport, CrawlError> {
        let mut indices = self.indices.lock().await;
        let Some(idx) = indices.get_mut(index) else {
            return Err(CrawlError::Index(format!("no such index {:?}", index)));
        };
        let mut report = BulkReport::default();
        for doc in docs {
            match (&doc.embedding, idx.dimension) {
                (Some(v), Some(d)) if v.len() != d => {
                    report.failures.push(BulkFailure {
                        id: doc.id.clone(),
                        reason: format!("dense_vector dims mismatch: {} != {}", v.len(), d),
                        retryable: false,
                    });
                    continue;
                }
                (Some(_), None) => {
                    report.failures.push(BulkFailure {
                        id: doc.id.clone(),
                        reason: "no dense_vector field in mapping".to_string(),
                        retryable: false,
                    });
                    continue;
                }
                _ => {}
            }
            idx.docs.insert(doc.id.clone(), doc.clone());
            report.ok += 1;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, embedding: Option<Vec<f32>>) -> IndexDocument {
        IndexDocument {
            id: id.to_string(),
            url_hash: id.to_string(),
            url: format!("https://example.test/{}", id),
            domain: "example.test".to_string(),
            site: "example.test".to_string(),
            lang: "en".to_string(),
            title: Some("t".to_string()),
            body: "b".to_string(),
            fetched_at: Utc::now(),
            popularity_score: 0.0,
            chunk_idx: None,
            embedding,
        }
    }

    #[tokio::test]
    async fn upsert_by_id_is_idempotent() {
        let index = MemorySearchIndex::with_mapping("pages", Some(4)).await;
        let d = doc("h1", Some(vec![0.0; 4]));
        index.bulk_upsert("pages", &[d.clone()]).await.unwrap();
        index.bulk_upsert("pages", &[d]).await.unwrap();
        assert_eq!(index.doc_count("pages").await, 1);
    }

    #[tokio::test]
    async fn wrong_dimension_is_per_record_failure() {
        let index = MemorySearchIndex::with_mapping("pages", Some(4)).await;
        let report = index
            .bulk_upsert("pages", &[doc("h1", Some(vec![0.0; 8]))])
            .await
            .unwrap();
        assert_eq!(report.ok, 0);
        assert_eq!(report.failures.len(), 1);
        assert!(!report.failures[0].retryable);
        assert_eq!(index.doc_count("pages").await, 0);
    }

    #[test]
    fn document_source_omits_id_and_empty_fields() {
        let d = doc("h1", None);
        let v = serde_json::to_value(&d).unwrap();
        assert!(v.get("id").is_none());
        assert!(v.get("embedding").is_none());
        assert_eq!(v["url_hash"], "h1");
    }

    #[test]
    fn mapping_includes_vector_field_only_when_dimensioned() {
        let with = mapping_body(Some(768));
        assert_eq!(with["mappings"]["properties"]["embedding"]["dims"], 768);
        let without = mapping_body(None);
        assert!(without["mappings"]["properties"]["embedding"].is_null());
    }
}
