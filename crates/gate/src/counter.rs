//! Shared per-domain request counters for the sliding-window QPS check.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::info;

use driftnet_core::CrawlError;

/// Outcome of a slot request. The gate never sleeps on the caller's behalf;
/// long waits come back as `WaitFor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDecision {
    Ready,
    WaitFor(Duration),
}

#[async_trait]
pub trait CounterStore: Send + Sync + 'static {
    /// Count requests for `domain` in the trailing `window`; if under
    /// `ceiling`, record one and return `Ready`, else `WaitFor` until the
    /// oldest recorded request leaves the window. Atomic per domain.
    async fn acquire(
        &self,
        domain: &str,
        window: Duration,
        ceiling: u32,
    ) -> Result<SlotDecision, CrawlError>;
}

/// Single-process counter store.
#[derive(Default)]
pub struct MemoryCounterStore {
    domains: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn acquire(
        &self,
        domain: &str,
        window: Duration,
        ceiling: u32,
    ) -> Result<SlotDecision, CrawlError> {
        let now = Instant::now();
        let mut domains = self.domains.lock().await;
        let stamps = domains.entry(domain.to_string()).or_default();
        while stamps
            .front()
            .map(|t| now.duration_since(*t) >= window)
            .unwrap_or(false)
        {
            stamps.pop_front();
        }
        if (stamps.len() as u32) < ceiling {
            stamps.push_back(now);
            Ok(SlotDecision::Ready)
        } else {
            let wait = match stamps.front() {
                Some(oldest) => window.saturating_sub(now.duration_since(*oldest)),
                None => window,
            };
            Ok(SlotDecision::WaitFor(wait))
        }
    }
}

/// Fleet-wide counter store: one-second buckets per domain, incremented with
/// a guarded single-statement upsert. Check-then-increment is not serialized
/// across workers, so brief overruns under contention are possible; the gate
/// is advisory.
pub struct PgCounterStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> CrawlError {
    CrawlError::State(e.to_string())
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), CrawlError> {
        sqlx::raw_sql(include_str!("../migrations/001_counters.sql"))
            .execute(pool)
            .await
            .map_err(db_err)?;
        info!("counter migrations complete");
        Ok(())
    }

    /// Drop buckets older than any plausible window. Housekeeping, called
    /// periodically by whoever owns the pool.
    pub async fn evict_stale(&self, older_than: Duration) -> Result<u64, CrawlError> {
        let res = sqlx::query(
            "DELETE FROM rate_counters WHERE bucket < now() - make_interval(secs => $1)",
        )
        .bind(older_than.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn acquire(
        &self,
        domain: &str,
        window: Duration,
        ceiling: u32,
    ) -> Result<SlotDecision, CrawlError> {
        let recorded: Option<(i32,)> = sqlx::query_as(
            r#"WITH current AS (
                   SELECT COALESCE(SUM(count), 0) AS n FROM rate_counters
                   WHERE domain = $1 AND bucket > now() - make_interval(secs => $2)
               )
               INSERT INTO rate_counters (domain, bucket, count)
               SELECT $1, date_trunc('second', now()), 1
               WHERE (SELECT n FROM current) < $3
               ON CONFLICT (domain, bucket) DO UPDATE SET count = rate_counters.count + 1
               RETURNING count"#,
        )
        .bind(domain)
        .bind(window.as_secs_f64())
        .bind(ceiling as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        if recorded.is_some() {
            return Ok(SlotDecision::Ready);
        }

        let oldest: Option<(Option<f64>,)> = sqlx::query_as(
            r#"SELECT EXTRACT(EPOCH FROM (min(bucket) + make_interval(secs => $2) - now()))::float8
               FROM rate_counters
               WHERE domain = $1 AND bucket > now() - make_interval(secs => $2)"#,
        )
        .bind(domain)
        .bind(window.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        let wait = oldest
            .and_then(|(secs,)| secs)
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(Duration::from_secs(1));
        Ok(SlotDecision::WaitFor(wait))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_until_ceiling_then_wait() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(10);
        for _ in 0..3 {
            assert_eq!(
                store.acquire("example.test", window, 3).await.unwrap(),
                SlotDecision::Ready
            );
        }
        match store.acquire("example.test", window, 3).await.unwrap() {
            SlotDecision::WaitFor(d) => assert!(d <= window),
            SlotDecision::Ready => panic!("expected saturation"),
        }
    }

    #[tokio::test]
    async fn window_expiry_frees_capacity() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_millis(40);
        assert_eq!(
            store.acquire("example.test", window, 1).await.unwrap(),
            SlotDecision::Ready
        );
        assert!(matches!(
            store.acquire("example.test", window, 1).await.unwrap(),
            SlotDecision::WaitFor(_)
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            store.acquire("example.test", window, 1).await.unwrap(),
            SlotDecision::Ready
        );
    }

    #[tokio::test]
    async fn domains_are_independent() {
        let store = MemoryCounterStore::new();
        let window = Duration::from_secs(10);
        assert_eq!(
            store.acquire("a.test", window, 1).await.unwrap(),
            SlotDecision::Ready
        );
        assert_eq!(
            store.acquire("b.test", window, 1).await.unwrap(),
            SlotDecision::Ready
        );
        assert!(matches!(
            store.acquire("a.test", window, 1).await.unwrap(),
            SlotDecision::WaitFor(_)
        ));
    }
}
