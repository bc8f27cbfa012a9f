//! Per-thread job consumer.
//!
//! One consumer owns one conversation thread. Jobs arrive from the broker,
//! are normalized and filtered by owner, buffered, and processed one batch
//! at a time so the thread's agent session never runs two turns at once.

pub mod broker;
pub mod buffer;
pub mod envelope;
pub mod payload;
pub mod processor;
pub mod reclaim;
pub mod session;
pub mod unit;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::config::{Config, PolicyConfig};
use crate::error::ConsumerError;
use broker::{Broker, JobHandler};
use payload::{QueuedMessage, accepts};
use processor::{Inbox, Processor, ProcessorHandle, ProcessorState};
use reclaim::DeploymentReclaimer;
use session::SessionContext;
use unit::UnitFactory;

pub use broker::queue_name;

/// Resolved settings for one consumer.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub deployment: String,
    pub owner_user_id: String,
    pub policy: PolicyConfig,
    pub stuck_after: Duration,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            deployment: config.deployment()?.to_string(),
            owner_user_id: config.user_id()?.to_string(),
            policy: config.policy.clone(),
            stuck_after: Duration::from_secs(config.consumer.stuck_after_secs),
        })
    }
}

/// Read-only consumer status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStatus {
    pub is_running: bool,
    pub is_processing: bool,
    pub user_id: String,
    pub queue_name: String,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub batches_completed: u64,
    pub batches_failed: u64,
}

/// Bound to the consumer's queue: extract, filter, enqueue.
struct ThreadJobHandler {
    owner_user_id: String,
    inbox: Inbox,
}

#[async_trait]
impl JobHandler for ThreadJobHandler {
    async fn handle(&self, job: Value) -> Result<(), ConsumerError> {
        let payload = match envelope::extract_job(job) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting job");
                return Err(e);
            }
        };

        if !accepts(&payload, &self.owner_user_id) {
            tracing::debug!(
                thread_id = %payload.thread_id,
                user_id = %payload.user_id,
                "dropping job for another user"
            );
            return Ok(());
        }

        tracing::info!(
            thread_id = %payload.thread_id,
            message_id = %payload.message_id,
            "accepted message"
        );
        self.inbox.append(QueuedMessage::now(payload))
    }
}

/// Lifecycle of the consumer: broker binding, the processor task and the
/// shutdown signal.
pub struct ThreadConsumer {
    settings: ConsumerSettings,
    queue: String,
    broker: Arc<dyn Broker>,
    units: Arc<dyn UnitFactory>,
    reclaimer: Arc<dyn DeploymentReclaimer>,
    processor: Option<ProcessorHandle>,
}

impl ThreadConsumer {
    pub fn new(
        settings: ConsumerSettings,
        broker: Arc<dyn Broker>,
        units: Arc<dyn UnitFactory>,
        reclaimer: Arc<dyn DeploymentReclaimer>,
    ) -> Self {
        let queue = queue_name(&settings.deployment);
        Self {
            settings,
            queue,
            broker,
            units,
            reclaimer,
            processor: None,
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub const fn is_running(&self) -> bool {
        self.processor.is_some()
    }

    /// Start the processor and bind the queue. A second call is a no-op.
    pub async fn start(&mut self) -> Result<(), ConsumerError> {
        if self.processor.is_some() {
            return Ok(());
        }

        let ctx = SessionContext {
            deployment: self.settings.deployment.clone(),
            policy: self.settings.policy.clone(),
        };
        let processor = Processor::spawn(ctx, Arc::clone(&self.units));
        let handler = Arc::new(ThreadJobHandler {
            owner_user_id: self.settings.owner_user_id.clone(),
            inbox: processor.inbox(),
        });

        if let Err(e) = self.broker.subscribe(&self.queue, handler).await {
            let _ = processor.shutdown().await;
            return Err(ConsumerError::Broker(e));
        }

        tracing::info!(
            queue = %self.queue,
            user_id = %self.settings.owner_user_id,
            "consumer listening"
        );
        self.processor = Some(processor);
        Ok(())
    }

    /// Stop taking jobs, process every message already accepted, release the
    /// last unit, then signal that the deployment can be reclaimed. Only the unbind and
    /// processor exit are awaited for correctness; the reclaim signal is
    /// best effort.
    pub async fn stop(&mut self) -> Result<(), ConsumerError> {
        let Some(processor) = self.processor.take() else {
            return Ok(());
        };
        tracing::info!(queue = %self.queue, "stopping consumer");

        if let Err(e) = self.broker.unsubscribe(&self.queue).await {
            tracing::warn!(queue = %self.queue, error = format!("{e:#}"), "failed to unbind queue");
        }

        if let Err(e) = processor.shutdown().await {
            tracing::error!(error = format!("{e:#}"), "processor did not stop cleanly");
        }

        if let Err(e) = self.reclaimer.reclaim(&self.settings.deployment).await {
            tracing::warn!(
                deployment = %self.settings.deployment,
                error = format!("{e:#}"),
                "deployment reclaim signal failed"
            );
        }
        Ok(())
    }

    /// Wait until every message accepted so far has been processed.
    pub async fn settle(&self) -> Result<(), ConsumerError> {
        match self.processor {
            Some(ref processor) => processor.settle().await,
            None => Err(ConsumerError::NotRunning),
        }
    }

    /// Listening, processor alive, and no drain running past `stuck_after`.
    pub fn is_healthy(&self) -> bool {
        let Some(ref processor) = self.processor else {
            return false;
        };
        if !processor.is_alive() {
            return false;
        }
        processor
            .snapshot()
            .draining_since
            .is_none_or(|since| since.elapsed() <= self.settings.stuck_after)
    }

    pub fn status(&self) -> ConsumerStatus {
        let snapshot = self
            .processor
            .as_ref()
            .map(ProcessorHandle::snapshot)
            .unwrap_or_default();
        ConsumerStatus {
            is_running: self.processor.is_some(),
            is_processing: snapshot.state == ProcessorState::Draining,
            user_id: self.settings.owner_user_id.clone(),
            queue_name: self.queue.clone(),
            pending: snapshot.pending,
            session_id: snapshot.session_id,
            batches_completed: snapshot.batches_completed,
            batches_failed: snapshot.batches_failed,
        }
    }
}
