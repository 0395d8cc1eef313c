//! Async execution fabric.
//!
//! Three durable-infrastructure-backed sub-services that decouple request
//! acceptance from generation: a job queue, a status/result store, and a
//! token stream bus. Grounded on `docify`'s `celery_app.py` (`task_acks_late`,
//! `worker_prefetch_multiplier=1`, `task_time_limit=600`,
//! `task_soft_time_limit=540`, `max_retries=3`, `2 ** retries` backoff),
//! `cache.py` (`MessageStreamCache`: `msg:{id}:status`, `msg:{id}:tokens`,
//! pub/sub `msg:{id}:stream`, one-hour TTLs) and `tasks/message_generation.py`
//! (the worker's pending->streaming->terminal transition and retry-on-error
//! shape). Stands in for the Redis-backed broker/cache with an explicit
//! durable queue and a status store rather than in-process futures; a
//! production deployment swaps these traits for a real broker/Redis client
//! without touching the orchestrator.

use crate::config::RagConfig;
use crate::error::FabricError;
use crate::types::{GenerationJob, GenerationParams, MessageStatus, MessageStatusSnapshot};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: GenerationJob) -> anyhow::Result<()>;
    /// Blocks until a job is available, or returns `None` if the queue is
    /// closed. At-least-once delivery: a job that is `nack`ed is requeued
    /// with an incremented attempt count up to the bounded retry limit.
    async fn dequeue(&self) -> Option<GenerationJob>;
    /// Acknowledge successful completion (`acks_late`-style: only called
    /// after the job's work is done).
    async fn ack(&self, job_id: Uuid) -> anyhow::Result<()>;
    /// Requeue after failure with exponential backoff, or give up past the
    /// bounded attempt count.
    async fn nack(&self, job: GenerationJob) -> anyhow::Result<()>;
}

/// In-process stand-in for the Celery+Redis broker: an mpsc channel plus a
/// retry-tracking map, capacity-1 concurrency enforced by the worker loop
/// rather than the queue itself, since the generation queue has pool size 1
/// per worker process.
pub struct InMemoryJobQueue {
    sender: mpsc::UnboundedSender<GenerationJob>,
    receiver: Mutex<mpsc::UnboundedReceiver<GenerationJob>>,
    max_retries: u32,
}

impl InMemoryJobQueue {
    pub fn new(config: &RagConfig) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        Arc::new(Self {
            sender,
            receiver: Mutex::new(receiver),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: GenerationJob) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .map_err(|_| FabricError::QueueClosed)?;
        Ok(())
    }

    async fn dequeue(&self) -> Option<GenerationJob> {
        self.receiver.lock().await.recv().await
    }

    async fn ack(&self, job_id: Uuid) -> anyhow::Result<()> {
        info!(%job_id, "job acknowledged");
        Ok(())
    }

    async fn nack(&self, mut job: GenerationJob) -> anyhow::Result<()> {
        if job.attempt >= self.max_retries {
            warn!(job_id = %job.job_id, attempts = job.attempt, "retries exhausted");
            return Err(FabricError::RetriesExhausted(job.attempt).into());
        }
        // Backoff is `2 ** retries` against the pre-increment attempt count,
        // matching the upstream task's `self.request.retries` read before
        // Celery bumps it for the next try.
        let backoff = job.backoff();
        job.attempt += 1;
        let sender = self.sender.clone();
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = sender.send(job);
        });
        Ok(())
    }
}

struct TtlEntry<T> {
    value: T,
    expires_at: Instant,
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn set_status(&self, message_id: Uuid, snapshot: MessageStatusSnapshot);
    async fn get_status(&self, message_id: Uuid) -> Option<MessageStatusSnapshot>;
}

/// TTL-respecting in-memory key/value store standing in for Redis
/// `SETEX`/`GET` over `message:{id}:status` and `message:{id}:result`.
pub struct InMemoryStatusStore {
    entries: DashMap<Uuid, TtlEntry<MessageStatusSnapshot>>,
    ttl: Duration,
}

impl InMemoryStatusStore {
    pub fn new(config: &RagConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            ttl: config.status_ttl,
        })
    }
}

#[async_trait]
impl StatusStore for InMemoryStatusStore {
    async fn set_status(&self, message_id: Uuid, snapshot: MessageStatusSnapshot) {
        self.entries.insert(
            message_id,
            TtlEntry {
                value: snapshot,
                expires_at: Instant::now() + self.ttl,
            },
        );
    }

    async fn get_status(&self, message_id: Uuid) -> Option<MessageStatusSnapshot> {
        match self.entries.get(&message_id) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            _ => None,
        }
    }
}

#[async_trait]
pub trait TokenBus: Send + Sync {
    /// Ordered append, mirroring `RPUSH message:{id}:tokens`.
    async fn push_token(&self, message_id: Uuid, token: String);
    /// Ordered read from `start`, mirroring `LRANGE message:{id}:tokens start -1`.
    async fn get_tokens(&self, message_id: Uuid, start: usize) -> Vec<String>;
    /// Subscribe for push delivery, mirroring `SUBSCRIBE message:{id}:stream`.
    fn subscribe(&self, message_id: Uuid) -> broadcast::Receiver<String>;
}

struct TokenStream {
    log: Vec<String>,
    tx: broadcast::Sender<String>,
}

/// `tokio::sync::broadcast` for the pub/sub half, a mutex-guarded `Vec`
/// for the ordered-log half — mirroring the Redis list + pub/sub pairing
/// `MessageStreamCache` uses for `message:{id}:tokens`/`message:{id}:stream`.
pub struct InMemoryTokenBus {
    streams: DashMap<Uuid, Mutex<TokenStream>>,
}

impl InMemoryTokenBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            streams: DashMap::new(),
        })
    }
}

#[async_trait]
impl TokenBus for InMemoryTokenBus {
    async fn push_token(&self, message_id: Uuid, token: String) {
        let entry = self
            .streams
            .entry(message_id)
            .or_insert_with(|| Mutex::new(TokenStream { log: Vec::new(), tx: broadcast::channel(256).0 }));
        let mut stream = entry.lock().await;
        stream.log.push(token.clone());
        let _ = stream.tx.send(token);
    }

    async fn get_tokens(&self, message_id: Uuid, start: usize) -> Vec<String> {
        match self.streams.get(&message_id) {
            Some(entry) => {
                let stream = entry.lock().await;
                stream.log.get(start..).map(|s| s.to_vec()).unwrap_or_default()
            }
            None => Vec::new(),
        }
    }

    fn subscribe(&self, message_id: Uuid) -> broadcast::Receiver<String> {
        let entry = self
            .streams
            .entry(message_id)
            .or_insert_with(|| Mutex::new(TokenStream { log: Vec::new(), tx: broadcast::channel(256).0 }));
        // `try_lock` is safe here: the entry was just created or already
        // exists and this call never awaits while holding the DashMap guard.
        entry.try_lock().expect("token stream lock uncontended on subscribe").tx.subscribe()
    }
}

/// Shared handles to the three fabric sub-services plus the store, wired
/// together for the worker loop and the HTTP/WebSocket layer.
pub struct Fabric {
    pub queue: Arc<dyn JobQueue>,
    pub status: Arc<dyn StatusStore>,
    pub tokens: Arc<dyn TokenBus>,
}

impl Fabric {
    pub fn new(config: &RagConfig) -> Self {
        Self {
            queue: InMemoryJobQueue::new(config),
            status: InMemoryStatusStore::new(config),
            tokens: InMemoryTokenBus::new(),
        }
    }

    /// Enqueue on accept: create the pending snapshot, write params-bearing
    /// job, return immediately. The caller returns 202 with `message_id`.
    pub async fn enqueue_generation(
        &self,
        message_id: Uuid,
        params: GenerationParams,
    ) -> anyhow::Result<Uuid> {
        let job = GenerationJob::new(message_id, params);
        let job_id = job.job_id;

        self.status
            .set_status(
                message_id,
                MessageStatusSnapshot {
                    message_id,
                    status: MessageStatus::Pending,
                    content: String::new(),
                    sources: Vec::new(),
                    citations: None,
                    tokens_used: None,
                    generation_time_ms: None,
                    model_used: None,
                    error_message: None,
                },
            )
            .await;

        self.queue.enqueue(job).await?;
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_transitions_are_monotonic() {
        assert!(MessageStatus::Pending.can_transition_to(MessageStatus::Streaming));
        assert!(MessageStatus::Streaming.can_transition_to(MessageStatus::Complete));
        assert!(!MessageStatus::Complete.can_transition_to(MessageStatus::Streaming));
        assert!(!MessageStatus::Error.can_transition_to(MessageStatus::Complete));
    }

    #[tokio::test]
    async fn enqueue_sets_pending_snapshot_and_delivers_job() {
        let config = RagConfig::default();
        let fabric = Fabric::new(&config);
        let message_id = Uuid::new_v4();

        fabric
            .enqueue_generation(message_id, GenerationParams::default())
            .await
            .unwrap();

        let snapshot = fabric.status.get_status(message_id).await.unwrap();
        assert_eq!(snapshot.status, MessageStatus::Pending);

        let job = fabric.queue.dequeue().await.unwrap();
        assert_eq!(job.message_id, message_id);
    }

    #[tokio::test]
    async fn token_bus_preserves_order_and_broadcasts() {
        let bus = InMemoryTokenBus::new();
        let message_id = Uuid::new_v4();
        let mut rx = bus.subscribe(message_id);

        bus.push_token(message_id, "hello".into()).await;
        bus.push_token(message_id, "world".into()).await;

        let tokens = bus.get_tokens(message_id, 0).await;
        assert_eq!(tokens, vec!["hello".to_string(), "world".to_string()]);

        let first = rx.recv().await.unwrap();
        assert_eq!(first, "hello");
    }

    #[tokio::test]
    async fn nack_requeues_up_to_max_retries_then_gives_up() {
        let mut config = RagConfig::default();
        config.max_retries = 1;
        let queue = InMemoryJobQueue::new(&config);

        let job = GenerationJob::new(Uuid::new_v4(), GenerationParams::default());
        assert!(queue.nack(job.clone()).await.is_ok());

        let mut retried = job.clone();
        retried.attempt = 1;
        assert!(queue.nack(retried).await.is_err());
    }
}
