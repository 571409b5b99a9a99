//! URL lifecycle over a conditional-write store. The state store is the only
//! source of truth for which worker owns a URL; every transition is a guarded
//! write, and a rejected guard is a typed result (`AlreadyHeld`, `Lost`),
//! never an error. Transport failures are errors and retryable.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use driftnet_core::{CrawlError, ObjectLocation, UrlRecord, UrlState};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStateStore;
pub use postgres::PgStateStore;

/// Behavior knobs shared by every backend.
#[derive(Debug, Clone)]
pub struct StateOptions {
    pub max_retries: u32,
    /// `done` records older than this become acquirable again for re-crawl.
    pub recrawl_after: Duration,
}

impl Default for StateOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            recrawl_after: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub url_hash: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Acquire {
    Acquired(Lease),
    /// Another worker holds an unexpired lease.
    AlreadyHeld,
    /// The record is `done`/`failed`; the caller must drop the work.
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Renewal {
    Renewed(DateTime<Utc>),
    /// Ownership is gone; the worker must abort in-flight work and not ack.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conditional {
    Applied,
    Lost,
}

#[derive(Debug, Clone)]
pub enum Outcome {
    /// `raw_location` is `None` for pages we saw but did not fetch (robots
    /// deny): the record is still `done`.
    Success {
        raw_location: Option<ObjectLocation>,
        crawled_at: DateTime<Utc>,
    },
    PermanentFailure {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Deferred for redelivery; `retries` is the new attempt count.
    Deferred { retries: u32 },
    /// Retry budget exhausted; the record is now `failed`.
    Exhausted,
    Lost,
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Conditional acquire: succeeds when no record exists, the record is
    /// `pending`/`deferred`, an `in_progress` lease has expired (reclaim),
    /// or a `done` record is stale enough for re-crawl.
    async fn try_acquire(
        &self,
        url: &str,
        url_hash: &str,
        domain: &str,
        owner_id: &str,
        lease: Duration,
    ) -> Result<Acquire, CrawlError>;

    /// Extend a held lease. `Lost` when ownership moved or the state changed.
    async fn renew_lease(
        &self,
        url_hash: &str,
        owner_id: &str,
        extend: Duration,
    ) -> Result<Renewal, CrawlError>;

    /// Terminal transition out of `in_progress`, conditional on ownership.
    async fn complete(
        &self,
        url_hash: &str,
        owner_id: &str,
        outcome: Outcome,
    ) -> Result<Conditional, CrawlError>;

    /// Count a retryable failure: `deferred` with `retries + 1`, or `failed`
    /// once the budget is exceeded. The delay itself is carried by queue
    /// visibility; the store only records the transition.
    async fn schedule_retry(
        &self,
        url_hash: &str,
        owner_id: &str,
        delay: Duration,
        reason: &str,
    ) -> Result<RetryDecision, CrawlError>;

    /// Idempotent insert of a `pending` record. Returns true when the record
    /// is new; existing records (any state) are left untouched.
    async fn insert_pending(
        &self,
        url: &str,
        url_hash: &str,
        domain: &str,
    ) -> Result<bool, CrawlError>;

    /// Move expired `in_progress` records back to `pending` so queue
    /// redelivery can pick them up. Returns the number reclaimed.
    async fn reclaim_expired(&self, batch_size: u32) -> Result<u64, CrawlError>;

    async fn get(&self, url_hash: &str) -> Result<Option<UrlRecord>, CrawlError>;

    async fn counts_by_state(&self) -> Result<HashMap<UrlState, u64>, CrawlError>;
}
