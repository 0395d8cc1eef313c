//! Worker loop: pulls `GenerationJob`s off the fabric's queue, runs the
//! orchestrator, and writes status transitions back to the fabric. Grounded
//! on `docify`'s `tasks/message_generation.py` (`generate_response_async`):
//! pending -> streaming on pick, complete/error on terminal outcome, retry
//! resets status back to streaming. Pool size for the generation queue is 1,
//! since generation holds an embedding model and an LLM client in memory at
//! once, enforced here with a capacity-1 `tokio::sync::Semaphore` rather
//! than multiple spawned loops.

use crate::config::RagConfig;
use crate::embedder::Embedder;
use crate::error::GenerationError;
use crate::fabric::Fabric;
use crate::llm::Llm;
use crate::orchestrator::Orchestrator;
use crate::store::Store;
use crate::types::{GenerationJob, MessageStatus, MessageStatusSnapshot};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

pub struct Worker {
    pub config: Arc<RagConfig>,
    pub embedder: Arc<dyn Embedder>,
    pub llm: Arc<dyn Llm>,
    pub store: Arc<dyn Store>,
    pub fabric: Arc<Fabric>,
    permit: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        config: Arc<RagConfig>,
        embedder: Arc<dyn Embedder>,
        llm: Arc<dyn Llm>,
        store: Arc<dyn Store>,
        fabric: Arc<Fabric>,
    ) -> Self {
        Self {
            config,
            embedder,
            llm,
            store,
            fabric,
            permit: Arc::new(Semaphore::new(1)),
        }
    }

    /// Runs until the queue is closed. Intended to be spawned once per
    /// process for the generation queue, which runs at concurrency 1.
    pub async fn run(&self) {
        while let Some(job) = self.fabric.queue.dequeue().await {
            let _permit = self.permit.acquire().await.expect("semaphore not closed");
            self.run_one(job).await;
        }
        info!("worker loop exiting: queue closed");
    }

    async fn run_one(&self, job: GenerationJob) {
        let message_id = job.message_id;
        info!(%message_id, job_id = %job.job_id, attempt = job.attempt, "picked up job");

        self.fabric
            .status
            .set_status(
                message_id,
                MessageStatusSnapshot {
                    message_id,
                    status: MessageStatus::Streaming,
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

        let orchestrator = Orchestrator::new(&self.config, self.embedder.as_ref(), self.llm.as_ref(), self.store.as_ref());

        // Soft limit nested inside the hard limit, mirroring Celery's
        // `task_soft_time_limit`/`task_time_limit` pair: the soft limit gives
        // the task a chance to fail as a recoverable error, the hard limit
        // is the backstop that kills it outright with no further retry.
        let hard_outcome = tokio::time::timeout(
            self.config.task_time_limit,
            tokio::time::timeout(self.config.task_soft_time_limit, orchestrator.generate(&job.params)),
        )
        .await;

        let outcome = match hard_outcome {
            Err(_) => {
                error!(%message_id, "hard time limit exceeded, aborting without retry");
                self.fail_terminal(
                    message_id,
                    GenerationError::Timeout(self.config.task_time_limit).to_string(),
                )
                .await;
                return;
            }
            Ok(soft_outcome) => soft_outcome,
        };

        match outcome {
            Ok(Ok(generated)) => {
                if let Some(conversation_id) = job.params.conversation_id {
                    if job.params.save_message {
                        if let Err(e) = orchestrator
                            .persist(
                                conversation_id,
                                uuid::Uuid::new_v4(),
                                message_id,
                                &job.params,
                                &generated,
                                Some(job.job_id.to_string()),
                            )
                            .await
                        {
                            warn!(%message_id, "failed to persist generated message: {e}");
                        }
                    }
                }

                self.fabric
                    .status
                    .set_status(
                        message_id,
                        MessageStatusSnapshot {
                            message_id,
                            status: generated.status,
                            content: generated.content.clone(),
                            sources: generated.sources.clone(),
                            citations: generated.citations.clone(),
                            tokens_used: Some(generated.metrics.tokens_used),
                            generation_time_ms: Some(generated.metrics.total_time_ms),
                            model_used: generated.metrics.model_used.clone(),
                            error_message: generated.error_message.clone(),
                        },
                    )
                    .await;

                let _ = self.fabric.queue.ack(job.job_id).await;
            }
            Ok(Err(e)) => {
                error!(%message_id, "generation failed: {e}");
                self.fail_and_maybe_retry(job, e.to_string()).await;
            }
            Err(_) => {
                warn!(%message_id, "soft time limit exceeded, treating as recoverable failure");
                let message = GenerationError::Timeout(self.config.task_soft_time_limit).to_string();
                self.fail_and_maybe_retry(job, message).await;
            }
        }
    }

    /// Requeue via the fabric's bounded-retry `nack`, or mark the message
    /// terminally failed once `nack` reports retries exhausted. The queue's
    /// own attempt/backoff gate is the sole retry-vs-exhaust decision point.
    async fn fail_and_maybe_retry(&self, job: GenerationJob, error_message: String) {
        let message_id = job.message_id;
        let attempt = job.attempt;

        match self.fabric.queue.nack(job).await {
            Ok(()) => {
                info!(%message_id, attempt, "requeuing after failure");
                self.fabric
                    .status
                    .set_status(
                        message_id,
                        MessageStatusSnapshot {
                            message_id,
                            status: MessageStatus::Streaming,
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
            }
            Err(_) => {
                self.fail_terminal(message_id, error_message).await;
            }
        }
    }

    async fn fail_terminal(&self, message_id: Uuid, error_message: String) {
        self.fabric
            .status
            .set_status(
                message_id,
                MessageStatusSnapshot {
                    message_id,
                    status: MessageStatus::Error,
                    content: String::new(),
                    sources: Vec::new(),
                    citations: None,
                    tokens_used: None,
                    generation_time_ms: None,
                    model_used: None,
                    error_message: Some(error_message),
                },
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::MockEmbedder;
    use crate::llm::MockLlm;
    use crate::store::InMemoryStore;
    use crate::types::GenerationParams;

    #[tokio::test]
    async fn job_runs_to_completion_exactly_once() {
        let config = Arc::new(RagConfig::default());
        let embedder: Arc<dyn Embedder> = Arc::new(MockEmbedder);
        let llm: Arc<dyn Llm> = Arc::new(MockLlm);
        let store: Arc<dyn Store> = InMemoryStore::new();
        let fabric = Arc::new(Fabric::new(&config));

        let worker = Worker::new(config, embedder, llm, store, fabric.clone());
        let message_id = uuid::Uuid::new_v4();
        let params = GenerationParams {
            query: "foo bar baz".into(),
            save_message: false,
            ..Default::default()
        };
        fabric.enqueue_generation(message_id, params).await.unwrap();

        let job = fabric.queue.dequeue().await.unwrap();
        worker.run_one(job).await;

        let snapshot = fabric.status.get_status(message_id).await.unwrap();
        assert_eq!(snapshot.status, MessageStatus::Complete);
    }
}
