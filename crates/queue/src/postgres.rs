//! Durable queue backend on Postgres. Claims use `FOR UPDATE SKIP LOCKED` so
//! any number of workers can poll the same queue without double delivery
//! inside the visibility window.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;

use driftnet_core::CrawlError;

use crate::{dead_letter_body, Queue, QueueOptions, RawMessage};

pub struct PgQueue {
    pool: PgPool,
    name: String,
    dlq_name: Option<String>,
    opts: QueueOptions,
}

fn db_err(e: sqlx::Error) -> CrawlError {
    CrawlError::Queue(e.to_string())
}

impl PgQueue {
    pub fn new(
        pool: PgPool,
        name: impl Into<String>,
        dlq_name: Option<String>,
        opts: QueueOptions,
    ) -> Self {
        Self {
            pool,
            name: name.into(),
            dlq_name,
            opts,
        }
    }

    pub async fn run_migrations(pool: &PgPool) -> Result<(), CrawlError> {
        sqlx::raw_sql(include_str!("../migrations/001_queue.sql"))
            .execute(pool)
            .await
            .map_err(db_err)?;
        info!("queue migrations complete");
        Ok(())
    }
}

#[async_trait]
impl Queue for PgQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        body: Value,
        priority: f64,
        delay: Option<Duration>,
    ) -> Result<(), CrawlError> {
        sqlx::query(
            r#"INSERT INTO queue_messages (queue, body, priority, visible_at)
               VALUES ($1, $2, $3, now() + make_interval(secs => $4))"#,
        )
        .bind(&self.name)
        .bind(&body)
        .bind(priority)
        .bind(delay.unwrap_or(Duration::ZERO).as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn send_batch(&self, bodies: Vec<(Value, f64)>) -> Result<(), CrawlError> {
        if bodies.is_empty() {
            return Ok(());
        }
        let (values, priorities): (Vec<Value>, Vec<f64>) = bodies.into_iter().unzip();
        sqlx::query(
            r#"INSERT INTO queue_messages (queue, body, priority)
               SELECT $1, * FROM UNNEST($2::jsonb[], $3::float8[])"#,
        )
        .bind(&self.name)
        .bind(&values)
        .bind(&priorities)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<RawMessage>, CrawlError> {
        // Route budget-exhausted messages to the DLQ before claiming.
        if let Some(dlq) = &self.dlq_name {
            sqlx::query(
                r#"UPDATE queue_messages
                   SET queue = $1,
                       body = jsonb_build_object(
                           'v', 1, 'queue', $2::text,
                           'reason', 'receive count exceeded', 'message', body),
                       priority = 0, receive_count = 0, receipt = NULL, visible_at = now()
                   WHERE queue = $2 AND visible_at <= now() AND receive_count >= $3"#,
            )
            .bind(dlq)
            .bind(&self.name)
            .bind(self.opts.max_receive_count as i32)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        }

        let rows: Vec<(Value, String, i32)> = sqlx::query_as(
            r#"WITH due AS (
                   SELECT id FROM queue_messages
                   WHERE queue = $1 AND visible_at <= now()
                   ORDER BY priority DESC, id
                   LIMIT $2
                   FOR UPDATE SKIP LOCKED
               )
               UPDATE queue_messages m
               SET receive_count = m.receive_count + 1,
                   visible_at = now() + make_interval(secs => $3),
                   receipt = m.id::text || ':' || (m.receive_count + 1)::text
               FROM due
               WHERE m.id = due.id
               RETURNING m.body, m.receipt, m.receive_count"#,
        )
        .bind(&self.name)
        .bind(max as i64)
        .bind(self.opts.visibility.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|(body, receipt, receive_count)| RawMessage {
                body,
                receipt,
                receive_count: receive_count as u32,
            })
            .collect())
    }

    async fn ack(&self, receipt: &str) -> Result<(), CrawlError> {
        let res = sqlx::query("DELETE FROM queue_messages WHERE queue = $1 AND receipt = $2")
            .bind(&self.name)
            .bind(receipt)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CrawlError::Queue(format!("unknown receipt {}", receipt)));
        }
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay: Option<Duration>) -> Result<(), CrawlError> {
        let res = sqlx::query(
            r#"UPDATE queue_messages
               SET visible_at = now() + make_interval(secs => $3), receipt = NULL
               WHERE queue = $1 AND receipt = $2"#,
        )
        .bind(&self.name)
        .bind(receipt)
        .bind(delay.unwrap_or(Duration::ZERO).as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if res.rows_affected() == 0 {
            return Err(CrawlError::Queue(format!("unknown receipt {}", receipt)));
        }
        Ok(())
    }

    async fn to_dlq(&self, receipt: &str, reason: &str) -> Result<(), CrawlError> {
        let Some(dlq) = &self.dlq_name else {
            // No DLQ configured: drop the message.
            return self.ack(receipt).await;
        };
        let row: Option<(Value,)> = sqlx::query_as(
            r#"DELETE FROM queue_messages WHERE queue = $1 AND receipt = $2 RETURNING body"#,
        )
        .bind(&self.name)
        .bind(receipt)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        let Some((body,)) = row else {
            return Err(CrawlError::Queue(format!("unknown receipt {}", receipt)));
        };
        sqlx::query(r#"INSERT INTO queue_messages (queue, body) VALUES ($1, $2)"#)
            .bind(dlq)
            .bind(dead_letter_body(&self.name, reason, body))
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn approx_depth(&self) -> Result<u64, CrawlError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM queue_messages WHERE queue = $1")
            .bind(&self.name)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.0 as u64)
    }
}
