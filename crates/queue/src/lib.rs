//! Message queues with visibility timeouts, receipt handles and dead-letter
//! routing. Workers never lock messages themselves: a received message is
//! hidden from other consumers until its visibility timeout lapses, and
//! reappears if not acknowledged in time.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use driftnet_core::CrawlError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryQueue;
pub use postgres::PgQueue;

#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub visibility: Duration,
    /// Deliveries beyond this count route the message to the DLQ.
    pub max_receive_count: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility: Duration::from_secs(60),
            max_receive_count: 5,
        }
    }
}

/// A delivered message before payload decoding.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub body: Value,
    /// Server-side handle; valid until the visibility timeout lapses or the
    /// message is acked/nacked.
    pub receipt: String,
    pub receive_count: u32,
}

#[async_trait]
pub trait Queue: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send(&self, body: Value, priority: f64, delay: Option<Duration>)
        -> Result<(), CrawlError>;

    async fn send_batch(&self, bodies: Vec<(Value, f64)>) -> Result<(), CrawlError>;

    /// Claim up to `max` visible messages, hiding each for the visibility
    /// timeout. Messages over the receive-count budget are moved to the DLQ
    /// instead of being delivered.
    async fn receive(&self, max: usize) -> Result<Vec<RawMessage>, CrawlError>;

    /// Delete a message. Fails if the receipt is stale (the message was
    /// redelivered to someone else in the meantime).
    async fn ack(&self, receipt: &str) -> Result<(), CrawlError>;

    /// Return a message to visibility, optionally after a delay.
    async fn nack(&self, receipt: &str, delay: Option<Duration>) -> Result<(), CrawlError>;

    /// Move an in-flight message straight to the DLQ with a reason.
    async fn to_dlq(&self, receipt: &str, reason: &str) -> Result<(), CrawlError>;

    async fn approx_depth(&self) -> Result<u64, CrawlError>;
}

/// Envelope written to a DLQ: the original payload plus why it died.
pub fn dead_letter_body(queue: &str, reason: &str, body: Value) -> Value {
    serde_json::json!({
        "v": 1,
        "queue": queue,
        "reason": reason,
        "message": body,
    })
}

/// A decoded message plus the handle needed to settle it.
#[derive(Debug)]
pub struct Received<T> {
    pub body: T,
    pub receipt: String,
    pub receive_count: u32,
}

/// Serde layer over an untyped queue. Payloads that fail to decode are routed
/// to the DLQ rather than redelivered forever.
#[derive(Clone)]
pub struct TypedQueue<T> {
    inner: Arc<dyn Queue>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned + Send> TypedQueue<T> {
    pub fn new(inner: Arc<dyn Queue>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn inner(&self) -> &Arc<dyn Queue> {
        &self.inner
    }

    pub async fn send(&self, msg: &T, priority: f64) -> Result<(), CrawlError> {
        self.send_delayed(msg, priority, None).await
    }

    pub async fn send_delayed(
        &self,
        msg: &T,
        priority: f64,
        delay: Option<Duration>,
    ) -> Result<(), CrawlError> {
        let body = serde_json::to_value(msg).map_err(|e| CrawlError::Queue(e.to_string()))?;
        self.inner.send(body, priority, delay).await
    }

    pub async fn send_batch(&self, msgs: &[(T, f64)]) -> Result<(), CrawlError> {
        let mut bodies = Vec::with_capacity(msgs.len());
        for (msg, priority) in msgs {
            let body = serde_json::to_value(msg).map_err(|e| CrawlError::Queue(e.to_string()))?;
            bodies.push((body, *priority));
        }
        self.inner.send_batch(bodies).await
    }

    pub async fn receive(&self, max: usize) -> Result<Vec<Received<T>>, CrawlError> {
        let raw = self.inner.receive(max).await?;
        let mut out = Vec::with_capacity(raw.len());
        for msg in raw {
            match serde_json::from_value::<T>(msg.body.clone()) {
                Ok(body) => out.push(Received {
                    body,
                    receipt: msg.receipt,
                    receive_count: msg.receive_count,
                }),
                Err(e) => {
                    warn!(queue = self.inner.name(), error = %e, "undecodable message, dead-lettering");
                    self.inner
                        .to_dlq(&msg.receipt, &format!("malformed payload: {}", e))
                        .await?;
                }
            }
        }
        Ok(out)
    }

    pub async fn ack(&self, receipt: &str) -> Result<(), CrawlError> {
        self.inner.ack(receipt).await
    }

    pub async fn nack(&self, receipt: &str, delay: Option<Duration>) -> Result<(), CrawlError> {
        self.inner.nack(receipt, delay).await
    }

    pub async fn to_dlq(&self, receipt: &str, reason: &str) -> Result<(), CrawlError> {
        self.inner.to_dlq(receipt, reason).await
    }

    pub async fn approx_depth(&self) -> Result<u64, CrawlError> {
        self.inner.approx_depth().await
    }
}
