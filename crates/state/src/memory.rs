//! In-memory state store with the same conditional-write semantics as the
//! Postgres backend. Single mutex; every operation is atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use driftnet_core::{CrawlError, UrlRecord, UrlState};

use crate::{
    Acquire, Conditional, Lease, Outcome, Renewal, RetryDecision, StateOptions, StateStore,
};

pub struct MemoryStateStore {
    opts: StateOptions,
    records: Mutex<HashMap<String, UrlRecord>>,
}

impl MemoryStateStore {
    pub fn new(opts: StateOptions) -> Self {
        Self {
            opts,
            records: Mutex::new(HashMap::new()),
        }
    }
}

fn chrono_dur(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::seconds(i64::MAX / 1000))
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn try_acquire(
        &self,
        url: &str,
        url_hash: &str,
        domain: &str,
        owner_id: &str,
        lease: Duration,
    ) -> Result<Acquire, CrawlError> {
        let now = Utc::now();
        let expires_at = now + chrono_dur(lease);
        let mut records = self.records.lock().await;

        let acquirable = match records.get(url_hash) {
            None => true,
            Some(r) => match r.state {
                UrlState::Pending | UrlState::Deferred => true,
                UrlState::InProgress => r.lease_expires_at.map(|t| t < now).unwrap_or(true),
                UrlState::Done => r
                    .last_crawled_at
                    .map(|t| now - t > chrono_dur(self.opts.recrawl_after))
                    .unwrap_or(true),
                UrlState::Failed => false,
            },
        };

        if !acquirable {
            let state = records.get(url_hash).map(|r| r.state);
            return Ok(match state {
                Some(UrlState::Done) | Some(UrlState::Failed) => Acquire::Terminal,
                _ => Acquire::AlreadyHeld,
            });
        }

        let record = records.entry(url_hash.to_string()).or_insert(UrlRecord {
            url_hash: url_hash.to_string(),
            url: url.to_string(),
            domain: domain.to_string(),
            state: UrlState::Pending,
            owner_id: None,
            acquired_at: None,
            lease_expires_at: None,
            retries: 0,
            last_crawled_at: None,
            last_error: None,
            raw_location: None,
        });
        record.state = UrlState::InProgress;
        record.owner_id = Some(owner_id.to_string());
        record.acquired_at = Some(now);
        record.lease_expires_at = Some(expires_at);
        record.last_error = None;

        Ok(Acquire::Acquired(Lease {
            url_hash: url_hash.to_string(),
            owner_id: owner_id.to_string(),
            expires_at,
        }))
    }

    async fn renew_lease(
        &self,
        url_hash: &str,
        owner_id: &str,
        extend: Duration,
    ) -> Result<Renewal, CrawlError> {
        let mut records = self.records.lock().await;
        let Some(r) = records.get_mut(url_hash) else {
            return Ok(Renewal::Lost);
        };
        if r.state != UrlState::InProgress || r.owner_id.as_deref() != Some(owner_id) {
            return Ok(Renewal::Lost);
        }
        let new_expiry = Utc::now() + chrono_dur(extend);
        r.lease_expires_at = Some(new_expiry);
        Ok(Renewal::Renewed(new_expiry))
    }

    async fn complete(
        &self,
        url_hash: &str,
        owner_id: &str,
        outcome: Outcome,
    ) -> Result<Conditional, CrawlError> {
        let mut records = self.records.lock().await;
        let Some(r) = records.get_mut(url_hash) else {
            return Ok(Conditional::Lost);
        };
        if r.state != UrlState::InProgress || r.owner_id.as_deref() != Some(owner_id) {
            return Ok(Conditional::Lost);
        }
        match outcome {
            Outcome::Success {
                raw_location,
                crawled_at,
            } => {
                r.state = UrlState::Done;
                r.raw_location = raw_location;
                r.last_crawled_at = Some(crawled_at);
                r.last_error = None;
            }
            Outcome::PermanentFailure { reason } => {
                r.state = UrlState::Failed;
                r.last_error = Some(reason);
            }
        }
        r.owner_id = None;
        r.acquired_at = None;
        r.lease_expires_at = None;
        Ok(Conditional::Applied)
    }

    async fn schedule_retry(
        &self,
        url_hash: &str,
        owner_id: &str,
        _delay: Duration,
        reason: &str,
    ) -> Result<RetryDecision, CrawlError> {
        let mut records = self.records.lock().await;
        let Some(r) = records.get_mut(url_hash) else {
            return Ok(RetryDecision::Lost);
        };
        if r.state != UrlState::InProgress || r.owner_id.as_deref() != Some(owner_id) {
            return Ok(RetryDecision::Lost);
        }
        r.retries += 1;
        r.last_error = Some(reason.to_string());
        r.owner_id = None;
        r.acquired_at = None;
        r.lease_expires_at = None;
        if r.retries > self.opts.max_retries {
            r.state = UrlState::Failed;
            Ok(RetryDecision::Exhausted)
        } else {
            r.state = UrlState::Deferred;
            Ok(RetryDecision::Deferred { retries: r.retries })
        }
    }

    async fn insert_pending(
        &self,
        url: &str,
        url_hash: &str,
        domain: &str,
    ) -> Result<bool, CrawlError> {
        let mut records = self.records.lock().await;
        if records.contains_key(url_hash) {
            return Ok(false);
        }
        records.insert(
            url_hash.to_string(),
            UrlRecord {
                url_hash: url_hash.to_string(),
                url: url.to_string(),
                domain: domain.to_string(),
                state: UrlState::Pending,
                owner_id: None,
                acquired_at: None,
                lease_expires_at: None,
                retries: 0,
                last_crawled_at: None,
                last_error: None,
                raw_location: None,
            },
        );
        Ok(true)
    }

    async fn reclaim_expired(&self, batch_size: u32) -> Result<u64, CrawlError> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let mut reclaimed = 0u64;
        for r in records.values_mut() {
            if reclaimed >= batch_size as u64 {
                break;
            }
            if r.state == UrlState::InProgress
                && r.lease_expires_at.map(|t| t < now).unwrap_or(true)
            {
                r.state = UrlState::Pending;
                r.owner_id = None;
                r.acquired_at = None;
                r.lease_expires_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, url_hash: &str) -> Result<Option<UrlRecord>, CrawlError> {
        Ok(self.records.lock().await.get(url_hash).cloned())
    }

    async fn counts_by_state(&self) -> Result<HashMap<UrlState, u64>, CrawlError> {
        let records = self.records.lock().await;
        let mut counts = HashMap::new();
        for r in records.values() {
            *counts.entry(r.state).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftnet_core::ObjectLocation;
    use std::sync::Arc;

    fn store() -> Arc<MemoryStateStore> {
        Arc::new(MemoryStateStore::new(StateOptions {
            max_retries: 2,
            recrawl_after: Duration::from_secs(3600),
        }))
    }

    const HASH: &str = "abc123";
    const URL: &str = "https://example.test/a";
    const DOMAIN: &str = "example.test";

    #[tokio::test]
    async fn concurrent_acquires_grant_exactly_one() {
        let store = store();
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .try_acquire(URL, HASH, DOMAIN, &format!("w{}", i), Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }
        let mut acquired = 0;
        let mut held = 0;
        for h in handles {
            match h.await.unwrap() {
                Acquire::Acquired(_) => acquired += 1,
                Acquire::AlreadyHeld => held += 1,
                Acquire::Terminal => panic!("no terminal records here"),
            }
        }
        assert_eq!(acquired, 1);
        assert_eq!(held, 15);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimable() {
        let store = store();
        let got = store
            .try_acquire(URL, HASH, DOMAIN, "w1", Duration::from_millis(10))
            .await
            .unwrap();
        assert!(matches!(got, Acquire::Acquired(_)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let got = store
            .try_acquire(URL, HASH, DOMAIN, "w2", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(matches!(got, Acquire::Acquired(_)));

        // The original owner lost everything.
        assert_eq!(
            store
                .renew_lease(HASH, "w1", Duration::from_secs(60))
                .await
                .unwrap(),
            Renewal::Lost
        );
        assert_eq!(
            store
                .complete(
                    HASH,
                    "w1",
                    Outcome::Success {
                        raw_location: Some(ObjectLocation {
                            bucket: "raw".into(),
                            key: "k".into(),
                        }),
                        crawled_at: Utc::now(),
                    },
                )
                .await
                .unwrap(),
            Conditional::Lost
        );
    }

    #[tokio::test]
    async fn retry_budget_exhaustion_goes_terminal() {
        let store = store();
        for attempt in 0..3 {
            store
                .try_acquire(URL, HASH, DOMAIN, "w1", Duration::from_secs(60))
                .await
                .unwrap();
            let decision = store
                .schedule_retry(HASH, "w1", Duration::from_secs(1), "503")
                .await
                .unwrap();
            match attempt {
                0 => assert_eq!(decision, RetryDecision::Deferred { retries: 1 }),
                1 => assert_eq!(decision, RetryDecision::Deferred { retries: 2 }),
                _ => assert_eq!(decision, RetryDecision::Exhausted),
            }
        }
        let record = store.get(HASH).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Failed);
        assert_eq!(record.retries, 3);
        assert_eq!(record.last_error.as_deref(), Some("503"));

        // Terminal records are not acquirable.
        assert_eq!(
            store
                .try_acquire(URL, HASH, DOMAIN, "w2", Duration::from_secs(60))
                .await
                .unwrap(),
            Acquire::Terminal
        );
    }

    #[tokio::test]
    async fn done_record_is_terminal_until_stale() {
        let store = Arc::new(MemoryStateStore::new(StateOptions {
            max_retries: 2,
            recrawl_after: Duration::from_millis(40),
        }));
        store
            .try_acquire(URL, HASH, DOMAIN, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        store
            .complete(
                HASH,
                "w1",
                Outcome::Success {
                    raw_location: Some(ObjectLocation {
                        bucket: "raw".into(),
                        key: "k".into(),
                    }),
                    crawled_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store
                .try_acquire(URL, HASH, DOMAIN, "w2", Duration::from_secs(60))
                .await
                .unwrap(),
            Acquire::Terminal
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(matches!(
            store
                .try_acquire(URL, HASH, DOMAIN, "w2", Duration::from_secs(60))
                .await
                .unwrap(),
            Acquire::Acquired(_)
        ));
    }

    #[tokio::test]
    async fn insert_pending_is_idempotent() {
        let store = store();
        assert!(store.insert_pending(URL, HASH, DOMAIN).await.unwrap());
        assert!(!store.insert_pending(URL, HASH, DOMAIN).await.unwrap());

        // Existing state is never clobbered by a duplicate discovery.
        store
            .try_acquire(URL, HASH, DOMAIN, "w1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!store.insert_pending(URL, HASH, DOMAIN).await.unwrap());
        let record = store.get(HASH).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::InProgress);
    }

    #[tokio::test]
    async fn reclaim_moves_expired_to_pending() {
        let store = store();
        store
            .try_acquire(URL, HASH, DOMAIN, "w1", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(store.reclaim_expired(100).await.unwrap(), 1);
        let record = store.get(HASH).await.unwrap().unwrap();
        assert_eq!(record.state, UrlState::Pending);
        assert!(record.owner_id.is_none());

        // Nothing left to reclaim.
        assert_eq!(store.reclaim_expired(100).await.unwrap(), 0);
    }
}
