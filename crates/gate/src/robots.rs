//! Cached robots.txt policy per host. Matching is delegated to the
//! `robotstxt` matcher over the cached body; crawl-delay and sitemap
//! directives are extracted once at parse time.

use chrono::{DateTime, Utc};
use robotstxt::DefaultMatcher;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    pub host: String,
    /// Raw robots.txt body. `None` is the permissive default cached after a
    /// fetch failure.
    pub body: Option<String>,
    pub crawl_delay: Option<f64>,
    pub sitemaps: Vec<String>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

fn ttl_expiry(ttl: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1))
}

impl RobotsPolicy {
    pub fn from_body(host: &str, body: String, ttl: Duration) -> Self {
        let crawl_delay = extract_crawl_delay(&body);
        let sitemaps = extract_sitemaps(&body);
        Self {
            host: host.to_string(),
            body: Some(body),
            crawl_delay,
            sitemaps,
            fetched_at: Utc::now(),
            expires_at: ttl_expiry(ttl),
        }
    }

    /// Everything-allowed policy, cached briefly so a robots outage does not
    /// turn into a fetch stampede.
    pub fn permissive(host: &str, ttl: Duration) -> Self {
        Self {
            host: host.to_string(),
            body: None,
            crawl_delay: None,
            sitemaps: Vec::new(),
            fetched_at: Utc::now(),
            expires_at: ttl_expiry(ttl),
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    pub fn is_allowed(&self, url: &str, user_agent: &str) -> bool {
        match &self.body {
            None => true,
            Some(body) => {
                DefaultMatcher::default().one_agent_allowed_by_robots(body, user_agent, url)
            }
        }
    }
}

fn extract_crawl_delay(body: &str) -> Option<f64> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("crawl-delay") {
                value.trim().parse::<f64>().ok().filter(|d| *d > 0.0)
            } else {
                None
            }
        })
        .next()
}

fn extract_sitemaps(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let url = value.trim();
                (!url.is_empty()).then(|| url.to_string())
            } else {
                None
            }
        })
        .collect()
}
