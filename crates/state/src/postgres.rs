//! Postgres state store. Each transition is one guarded `UPDATE`; a guard
//! that matches zero rows is the conditional-write rejection, which callers
//! receive as a typed result. Transport errors surface as `CrawlError::State`
//! and are retried by the caller's backoff policy.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use driftnet_core::{CrawlError, ObjectLocation, UrlRecord, UrlState};

use crate::{
    Acquire, Conditional, Lease, Outcome, Renewal, RetryDecision, StateOptions, StateStore,
};

pub struct PgStateStore {
    pool: PgPool,
    opts: StateOptions,
}

fn db_err(e: sqlx::Error) -> CrawlError {
    CrawlError::State(e.to_string())
}

type RecordRow = (
    String,                        // url_hash
    String,                        // url
    String,                        // domain
    String,                        // state
    Option<String>,                // owner_id
    Option<DateTime<Utc>>,         // acquired_at
    Option<DateTime<Utc>>,         // lease_expires_at
    i32,                           // retries
    Option<DateTime<Utc>>,         // last_crawled_at
    Option<String>,                // last_error
    Option<String>,                // raw_bucket
    Option<String>,                // raw_key
);

fn record_from_row(row: RecordRow) -> Result<UrlRecord, CrawlError> {
    let state = UrlState::parse(&row.3)
        .ok_or_else(|| CrawlError::State(format!("unknown state {:?}", row.3)))?;
    Ok(UrlRecord {
        url_hash: row.0,
        url: row.1,
        domain: row.2,
        state,
        owner_id: row.4,
        acquired_at: row.5,
        lease_expires_at: row.6,
        retries: row.7 as u32,
        last_crawled_at: row.8,
        last_error: row.9,
        raw_location: match (row.10, row.11) {
            (Some(bucket), Some(key)) => Some(ObjectLocation { bucket, key }),
            _ => None,
        },
    })
}

impl PgStateStore {
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        opts: StateOptions,
    ) -> Result<Self, CrawlError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        info!(max_connections, "connected to postgres state store");
        Ok(Self { pool, opts })
    }

    pub fn with_pool(pool: PgPool, opts: StateOptions) -> Self {
        Self { pool, opts }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), CrawlError> {
        sqlx::raw_sql(include_str!("../migrations/001_state.sql"))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        info!("state migrations complete");
        Ok(())
    }
}

#[async_trait]
impl StateStore for PgStateStore {
    async fn try_acquire(
        &self,
        url: &str,
        url_hash: &str,
        domain: &str,
        owner_id: &str,
        lease: Duration,
    ) -> Result<Acquire, CrawlError> {
        let lease_secs = lease.as_secs_f64();

        // Fresh record: insert straight into in_progress.
        let inserted = sqlx::query(
            r#"INSERT INTO url_records
                   (url_hash, url, domain, state, owner_id, acquired_at, lease_expires_at)
               VALUES ($1, $2, $3, 'in_progress', $4, now(), now() + make_interval(secs => $5))
               ON CONFLICT (url_hash) DO NOTHING"#,
        )
        .bind(url_hash)
        .bind(url)
        .bind(domain)
        .bind(owner_id)
        .bind(lease_secs)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 0 {
            // Guarded takeover: pending/deferred, expired lease, or stale done.
            let updated: Option<(DateTime<Utc>,)> = sqlx::query_as(
                r#"UPDATE url_records
                   SET state = 'in_progress', owner_id = $2, acquired_at = now(),
                       lease_expires_at = now() + make_interval(secs => $3),
                       last_error = NULL
                   WHERE url_hash = $1
                     AND (state IN ('pending', 'deferred')
                          OR (state = 'in_progress' AND lease_expires_at < now())
                          OR (state = 'done'
                              AND last_crawled_at < now() - make_interval(secs => $4)))
                   RETURNING lease_expires_at"#,
            )
            .bind(url_hash)
            .bind(owner_id)
            .bind(lease_secs)
            .bind(self.opts.recrawl_after.as_secs_f64())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

            let Some((expires_at,)) = updated else {
                let row: Option<(String,)> =
                    sqlx::query_as("SELECT state FROM url_records WHERE url_hash = $1")
                        .bind(url_hash)
                        .fetch_optional(&self.pool)
                        .await
                        .map_err(db_err)?;
                return Ok(match row.as_ref().map(|r| r.0.as_str()) {
                    Some("done") | Some("failed") => Acquire::Terminal,
                    _ => Acquire::AlreadyHeld,
                });
            };
            return Ok(Acquire::Acquired(Lease {
                url_hash: url_hash.to_string(),
                owner_id: owner_id.to_string(),
                expires_at,
            }));
        }

        Ok(Acquire::Acquired(Lease {
            url_hash: url_hash.to_string(),
            owner_id: owner_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::from_std(lease).unwrap_or_default(),
        }))
    }

    async fn renew_lease(
        &self,
        url_hash: &str,
        owner_id: &str,
        extend: Duration,
    ) -> Result<Renewal, CrawlError> {
        let row: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"UPDATE url_records
               SET lease_expires_at = now() + make_interval(secs => $3)
               WHERE url_hash = $1 AND owner_id = $2 AND state = 'in_progress'
               RETURNING lease_expires_at"#,
        )
        .bind(url_hash)
        .bind(owner_id)
        .bind(extend.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(match row {
            Some((expires_at,)) => Renewal::Renewed(expires_at),
            None => Renewal::Lost,
        })
    }

    async fn complete(
        &self,
        url_hash: &str,
        owner_id: &str,
        outcome: Outcome,
    ) -> Result<Conditional, CrawlError> {
        let res = match outcome {
            Outcome::Success {
                raw_location,
                crawled_at,
            } => sqlx::query(
                r#"UPDATE url_records
                   SET state = 'done', raw_bucket = $3, raw_key = $4,
                       last_crawled_at = $5, last_error = NULL,
                       owner_id = NULL, acquired_at = NULL, lease_expires_at = NULL
                   WHERE url_hash = $1 AND owner_id = $2 AND state = 'in_progress'"#,
            )
            .bind(url_hash)
            .bind(owner_id)
            .bind(raw_location.as_ref().map(|l| l.bucket.clone()))
            .bind(raw_location.as_ref().map(|l| l.key.clone()))
            .bind(crawled_at)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
            Outcome::PermanentFailure { reason } => sqlx::query(
                r#"UPDATE url_records
                   SET state = 'failed', last_error = $3,
                       owner_id = NULL, acquired_at = NULL, lease_expires_at = NULL
                   WHERE url_hash = $1 AND owner_id = $2 AND state = 'in_progress'"#,
            )
            .bind(url_hash)
            .bind(owner_id)
            .bind(&reason)
            .execute(&self.pool)
            .await
            .map_err(db_err)?,
        };
        Ok(if res.rows_affected() == 1 {
            Conditional::Applied
        } else {
            Conditional::Lost
        })
    }

    async fn schedule_retry(
        &self,
        url_hash: &str,
        owner_id: &str,
        _delay: Duration,
        reason: &str,
    ) -> Result<RetryDecision, CrawlError> {
        let row: Option<(i32, String)> = sqlx::query_as(
            r#"UPDATE url_records
               SET retries = retries + 1,
                   state = CASE WHEN retries + 1 > $3 THEN 'failed' ELSE 'deferred' END,
                   last_error = $4,
                   owner_id = NULL, acquired_at = NULL, lease_expires_at = NULL
               WHERE url_hash = $1 AND owner_id = $2 AND state = 'in_progress'
               RETURNING retries, state"#,
        )
        .bind(url_hash)
        .bind(owner_id)
        .bind(self.opts.max_retries as i32)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(match row {
            None => RetryDecision::Lost,
            Some((_, state)) if state == "failed" => RetryDecision::Exhausted,
            Some((retries, _)) => RetryDecision::Deferred {
                retries: retries as u32,
            },
        })
    }

    async fn insert_pending(
        &self,
        url: &str,
        url_hash: &str,
        domain: &str,
    ) -> Result<bool, CrawlError> {
        let res = sqlx::query(
            r#"INSERT INTO url_records (url_hash, url, domain, state)
               VALUES ($1, $2, $3, 'pending')
               ON CONFLICT (url_hash) DO NOTHING"#,
        )
        .bind(url_hash)
        .bind(url)
        .bind(domain)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected() == 1)
    }

    async fn reclaim_expired(&self, batch_size: u32) -> Result<u64, CrawlError> {
        let res = sqlx::query(
            r#"WITH expired AS (
                   SELECT url_hash FROM url_records
                   WHERE state = 'in_progress' AND lease_expires_at < now()
                   ORDER BY lease_expires_at
                   LIMIT $1
                   FOR UPDATE SKIP LOCKED
               )
               UPDATE url_records u
               SET state = 'pending', owner_id = NULL,
                   acquired_at = NULL, lease_expires_at = NULL
               FROM expired
               WHERE u.url_hash = expired.url_hash"#,
        )
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(res.rows_affected())
    }

    async fn get(&self, url_hash: &str) -> Result<Option<UrlRecord>, CrawlError> {
        let row: Option<RecordRow> = sqlx::query_as(
            r#"SELECT url_hash, url, domain, state, owner_id, acquired_at, lease_expires_at,
                      retries, last_crawled_at, last_error, raw_bucket, raw_key
               FROM url_records WHERE url_hash = $1"#,
        )
        .bind(url_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.map(record_from_row).transpose()
    }

    async fn counts_by_state(&self) -> Result<HashMap<UrlState, u64>, CrawlError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM url_records GROUP BY state")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        let mut counts = HashMap::new();
        for (state, count) in rows {
            if let Some(state) = UrlState::parse(&state) {
                counts.insert(state, count as u64);
            }
        }
        Ok(counts)
    }
}
