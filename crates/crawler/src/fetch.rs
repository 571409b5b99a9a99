//! HTTP fetch and outcome classification. Every response lands in one of
//! three buckets: success, permanent failure (never retried) or transient
//! failure (retried with backoff, or after the server's own hint).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;
use url::Url;

use driftnet_core::{CrawlError, FetchConfig, FetchResponse};

#[derive(Debug)]
pub enum FetchResult {
    Success(FetchResponse),
    Permanent {
        status: Option<u16>,
        reason: String,
    },
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },
}

pub struct Fetcher {
    client: reqwest::Client,
    cfg: FetchConfig,
}

impl Fetcher {
    pub fn new(cfg: FetchConfig, per_host_connections: usize) -> Result<Self, CrawlError> {
        let client = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .timeout(cfg.timeout)
            .redirect(reqwest::redirect::Policy::limited(cfg.max_redirects))
            .pool_max_idle_per_host(per_host_connections)
            .build()
            .map_err(|e| CrawlError::Config(e.to_string()))?;
        Ok(Self { client, cfg })
    }

    pub async fn fetch(&self, url: &Url) -> FetchResult {
        let start = Instant::now();
        let mut resp = match self.client.get(url.as_str()).send().await {
            Ok(resp) => resp,
            Err(e) => {
                if e.is_redirect() {
                    return FetchResult::Permanent {
                        status: None,
                        reason: "redirect limit exceeded".to_string(),
                    };
                }
                let reason = if e.is_timeout() {
                    format!("timeout after {}s", self.cfg.timeout.as_secs())
                } else {
                    e.to_string()
                };
                return FetchResult::Transient {
                    reason,
                    retry_after: None,
                };
            }
        };

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return FetchResult::Transient {
                reason: "HTTP 429".to_string(),
                retry_after,
            };
        }
        if status.is_server_error() {
            return FetchResult::Transient {
                reason: format!("HTTP {}", status.as_u16()),
                retry_after: None,
            };
        }
        if !status.is_success() {
            // 401/403/404/410 and the rest of the 4xx family, plus any 3xx
            // the redirect policy left unfollowed.
            return FetchResult::Permanent {
                status: Some(status.as_u16()),
                reason: format!("HTTP {}", status.as_u16()),
            };
        }

        let final_url = Url::parse(resp.url().as_str()).unwrap_or_else(|_| url.clone());
        let mut headers = HashMap::new();
        for (k, v) in resp.headers() {
            if let Ok(val) = v.to_str() {
                headers.insert(k.as_str().to_string(), val.to_string());
            }
        }
        let content_type = headers.get("content-type").cloned();

        // Stream the body up to the cap; over-limit bodies are truncated with
        // a flag, not failed.
        let mut body: Vec<u8> = Vec::new();
        let mut truncated = false;
        loop {
            match resp.chunk().await {
                Ok(Some(chunk)) => {
                    let room = self.cfg.max_body_size.saturating_sub(body.len());
                    if chunk.len() >= room {
                        body.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        debug!(url = %url, max = self.cfg.max_body_size, "body truncated at size cap");
                        break;
                    }
                    body.extend_from_slice(&chunk);
                }
                Ok(None) => break,
                Err(e) => {
                    return FetchResult::Transient {
                        reason: format!("body read: {}", e),
                        retry_after: None,
                    }
                }
            }
        }

        FetchResult::Success(FetchResponse {
            url: url.clone(),
            final_url,
            status: status.as_u16(),
            headers,
            body,
            content_type,
            fetched_at: chrono::Utc::now(),
            response_time_ms: start.elapsed().as_millis() as u64,
            truncated,
        })
    }
}
