//! In-memory queue for tests and single-process runs. Same visibility and
//! dead-letter semantics as the Postgres backend.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use priority_queue::PriorityQueue;
use serde_json::Value;
use tokio::sync::Mutex;

use driftnet_core::CrawlError;

use crate::{dead_letter_body, Queue, QueueOptions, RawMessage};

/// Priority ordering: higher value first, then FIFO by sequence.
#[derive(Debug, Clone)]
struct Priority {
    value: f64,
    seq: u64,
}

impl PartialEq for Priority {
    fn eq(&self, other: &Self) -> bool {
        self.value.to_bits() == other.value.to_bits() && self.seq == other.seq
    }
}

impl Eq for Priority {}

impl PartialOrd for Priority {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Priority {
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .partial_cmp(&other.value)
            .unwrap_or(Ordering::Equal)
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct MsgKey(u64);

struct Entry {
    body: Value,
    priority: f64,
    visible_at: Instant,
    receive_count: u32,
    receipt: Option<String>,
}

struct Inner {
    ready: PriorityQueue<MsgKey, Priority>,
    entries: HashMap<u64, Entry>,
    seq: u64,
}

pub struct MemoryQueue {
    name: String,
    opts: QueueOptions,
    dlq: Option<Arc<MemoryQueue>>,
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, opts: QueueOptions, dlq: Option<Arc<MemoryQueue>>) -> Self {
        Self {
            name: name.into(),
            opts,
            dlq,
            inner: Mutex::new(Inner {
                ready: PriorityQueue::new(),
                entries: HashMap::new(),
                seq: 0,
            }),
        }
    }

    /// A queue with no DLQ and no receive budget, for use as a DLQ itself.
    pub fn dead_letter(name: impl Into<String>) -> Arc<MemoryQueue> {
        Arc::new(Self::new(
            name,
            QueueOptions {
                visibility: Duration::from_secs(60),
                max_receive_count: u32::MAX,
            },
            None,
        ))
    }

    fn push_locked(inner: &mut Inner, body: Value, priority: f64, visible_at: Instant) {
        let id = inner.seq;
        inner.seq += 1;
        inner.entries.insert(
            id,
            Entry {
                body,
                priority,
                visible_at,
                receive_count: 0,
                receipt: None,
            },
        );
        if visible_at <= Instant::now() {
            inner.ready.push(
                MsgKey(id),
                Priority {
                    value: priority,
                    seq: id,
                },
            );
        }
    }

    /// Move due entries (delayed sends, lapsed visibility) back into the
    /// ready queue.
    fn restore_due(inner: &mut Inner, now: Instant) {
        let mut due: Vec<(u64, f64)> = Vec::new();
        for (id, entry) in inner.entries.iter() {
            if entry.visible_at <= now && inner.ready.get(&MsgKey(*id)).is_none() {
                due.push((*id, entry.priority));
            }
        }
        for (id, priority) in due {
            if let Some(entry) = inner.entries.get_mut(&id) {
                entry.receipt = None;
            }
            inner.ready.push(
                MsgKey(id),
                Priority {
                    value: priority,
                    seq: id,
                },
            );
        }
    }

    fn find_by_receipt(inner: &Inner, receipt: &str) -> Option<u64> {
        let id: u64 = receipt.split(':').next()?.parse().ok()?;
        let entry = inner.entries.get(&id)?;
        (entry.receipt.as_deref() == Some(receipt)).then_some(id)
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(
        &self,
        body: Value,
        priority: f64,
        delay: Option<Duration>,
    ) -> Result<(), CrawlError> {
        let mut inner = self.inner.lock().await;
        let visible_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
        Self::push_locked(&mut inner, body, priority, visible_at);
        Ok(())
    }

    async fn send_batch(&self, bodies: Vec<(Value, f64)>) -> Result<(), CrawlError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        for (body, priority) in bodies {
            Self::push_locked(&mut inner, body, priority, now);
        }
        Ok(())
    }

    async fn receive(&self, max: usize) -> Result<Vec<RawMessage>, CrawlError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        Self::restore_due(&mut inner, now);

        let mut out = Vec::new();
        let mut dead = Vec::new();
        while out.len() < max {
            let Some((key, _)) = inner.ready.pop() else {
                break;
            };
            let Some(entry) = inner.entries.get_mut(&key.0) else {
                continue;
            };
            entry.receive_count += 1;
            if entry.receive_count > self.opts.max_receive_count {
                if let Some(entry) = inner.entries.remove(&key.0) {
                    dead.push(entry.body);
                }
                continue;
            }
            entry.visible_at = now + self.opts.visibility;
            let receipt = format!("{}:{}", key.0, entry.receive_count);
            entry.receipt = Some(receipt.clone());
            out.push(RawMessage {
                body: entry.body.clone(),
                receipt,
                receive_count: entry.receive_count,
            });
        }
        drop(inner);

        if let Some(dlq) = &self.dlq {
            for body in dead {
                dlq.send(
                    dead_letter_body(&self.name, "receive count exceeded", body),
                    0.0,
                    None,
                )
                .await?;
            }
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<(), CrawlError> {
        let mut inner = self.inner.lock().await;
        match Self::find_by_receipt(&inner, receipt) {
            Some(id) => {
                inner.entries.remove(&id);
                inner.ready.remove(&MsgKey(id));
                Ok(())
            }
            None => Err(CrawlError::Queue(format!("unknown receipt {}", receipt))),
        }
    }

    async fn nack(&self, receipt: &str, delay: Option<Duration>) -> Result<(), CrawlError> {
        let mut inner = self.inner.lock().await;
        match Self::find_by_receipt(&inner, receipt) {
            Some(id) => {
                if let Some(entry) = inner.entries.get_mut(&id) {
                    entry.visible_at = Instant::now() + delay.unwrap_or(Duration::ZERO);
                    entry.receipt = None;
                }
                Ok(())
            }
            None => Err(CrawlError::Queue(format!("unknown receipt {}", receipt))),
        }
    }

    async fn to_dlq(&self, receipt: &str, reason: &str) -> Result<(), CrawlError> {
        let body = {
            let mut inner = self.inner.lock().await;
            let id = Self::find_by_receipt(&inner, receipt)
                .ok_or_else(|| CrawlError::Queue(format!("unknown receipt {}", receipt)))?;
            inner.ready.remove(&MsgKey(id));
            inner.entries.remove(&id).map(|e| e.body)
        };
        if let (Some(dlq), Some(body)) = (&self.dlq, body) {
            dlq.send(dead_letter_body(&self.name, reason, body), 0.0, None)
                .await?;
        }
        Ok(())
    }

    async fn approx_depth(&self) -> Result<u64, CrawlError> {
        let inner = self.inner.lock().await;
        Ok(inner.entries.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opts(visibility_ms: u64, max_receive: u32) -> QueueOptions {
        QueueOptions {
            visibility: Duration::from_millis(visibility_ms),
            max_receive_count: max_receive,
        }
    }

    #[tokio::test]
    async fn ack_removes_message() {
        let q = MemoryQueue::new("crawl", opts(100, 5), None);
        q.send(json!({"a": 1}), 0.0, None).await.unwrap();
        let msgs = q.receive(10).await.unwrap();
        assert_eq!(msgs.len(), 1);
        q.ack(&msgs[0].receipt).await.unwrap();
        assert_eq!(q.approx_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invisible_while_in_flight_then_redelivered() {
        let q = MemoryQueue::new("crawl", opts(50, 5), None);
        q.send(json!({"a": 1}), 0.0, None).await.unwrap();

        let first = q.receive(10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(q.receive(10).await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let again = q.receive(10).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);

        // The first receipt went stale on redelivery.
        assert!(q.ack(&first[0].receipt).await.is_err());
    }

    #[tokio::test]
    async fn nack_makes_message_visible_again() {
        let q = MemoryQueue::new("crawl", opts(60_000, 5), None);
        q.send(json!({"a": 1}), 0.0, None).await.unwrap();
        let msgs = q.receive(10).await.unwrap();
        q.nack(&msgs[0].receipt, None).await.unwrap();
        let again = q.receive(10).await.unwrap();
        assert_eq!(again.len(), 1);
    }

    #[tokio::test]
    async fn higher_priority_delivered_first() {
        let q = MemoryQueue::new("crawl", opts(100, 5), None);
        q.send(json!({"p": "low"}), 0.1, None).await.unwrap();
        q.send(json!({"p": "high"}), 9.0, None).await.unwrap();
        let msgs = q.receive(2).await.unwrap();
        assert_eq!(msgs[0].body["p"], "high");
        assert_eq!(msgs[1].body["p"], "low");
    }

    #[tokio::test]
    async fn exhausted_receives_route_to_dlq() {
        let dlq = MemoryQueue::dead_letter("crawl-dlq");
        let q = MemoryQueue::new("crawl", opts(10, 2), Some(dlq.clone()));
        q.send(json!({"a": 1}), 0.0, None).await.unwrap();

        for _ in 0..2 {
            let msgs = q.receive(10).await.unwrap();
            assert_eq!(msgs.len(), 1);
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        // Third delivery attempt exceeds the budget.
        assert!(q.receive(10).await.unwrap().is_empty());
        assert_eq!(q.approx_depth().await.unwrap(), 0);
        assert_eq!(dlq.approx_depth().await.unwrap(), 1);

        let dead = dlq.receive(1).await.unwrap();
        assert_eq!(dead[0].body["reason"], "receive count exceeded");
        assert_eq!(dead[0].body["message"]["a"], 1);
    }

    #[tokio::test]
    async fn to_dlq_moves_in_flight_message() {
        let dlq = MemoryQueue::dead_letter("crawl-dlq");
        let q = MemoryQueue::new("crawl", opts(1000, 5), Some(dlq.clone()));
        q.send(json!({"url": "bad"}), 0.0, None).await.unwrap();
        let msgs = q.receive(1).await.unwrap();
        q.to_dlq(&msgs[0].receipt, "cross-domain redirect")
            .await
            .unwrap();
        assert_eq!(q.approx_depth().await.unwrap(), 0);
        let dead = dlq.receive(1).await.unwrap();
        assert_eq!(dead[0].body["reason"], "cross-domain redirect");
    }

    #[tokio::test]
    async fn delayed_send_not_visible_immediately() {
        let q = MemoryQueue::new("crawl", opts(100, 5), None);
        q.send(json!({"a": 1}), 0.0, Some(Duration::from_millis(60)))
            .await
            .unwrap();
        assert!(q.receive(10).await.unwrap().is_empty());
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert_eq!(q.receive(10).await.unwrap().len(), 1);
    }
}
