use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("timeout after {0}s")]
    Timeout(u64),

    #[error("HTTP status {0}")]
    HttpStatus(u16),

    #[error("rate limited by upstream")]
    RateLimited { retry_after_seconds: Option<u64> },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("state store error: {0}")]
    State(String),

    #[error("object store error: {0}")]
    Storage(String),

    #[error("embedding service error: {0}")]
    Embedding(String),

    #[error("search index error: {0}")]
    Index(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("body too large: {size} bytes (max {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl CrawlError {
    /// Whether the failure may succeed on a later attempt. Conditional-write
    /// rejections are modeled as typed results, not errors, so a `State`
    /// error here is always a transport failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CrawlError::Network(_)
                | CrawlError::Timeout(_)
                | CrawlError::RateLimited { .. }
                | CrawlError::Queue(_)
                | CrawlError::State(_)
                | CrawlError::Storage(_)
                | CrawlError::Embedding(_)
                | CrawlError::Index(_)
        )
    }
}
