use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::ConsumerError;

const QUEUE_PREFIX: &str = "thread_message_";

/// Queue bound by the consumer for `deployment`.
pub fn queue_name(deployment: &str) -> String {
    format!("{QUEUE_PREFIX}{}", deployment.replace('-', "_"))
}

/// Handles one delivered job. `Ok` acknowledges it; `Err` hands it back to
/// the broker's retry policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Value) -> Result<(), ConsumerError>;
}

/// The job queue transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Bind `handler` to `queue`, replacing any previous binding.
    async fn subscribe(&self, queue: &str, handler: Arc<dyn JobHandler>) -> anyhow::Result<()>;

    async fn unsubscribe(&self, queue: &str) -> anyhow::Result<()>;
}

/// In-process broker. Delivery is a direct call into the bound handler.
#[derive(Default)]
pub struct MemoryBroker {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `job` to whoever is bound to `queue`.
    pub async fn publish(&self, queue: &str, job: Value) -> Result<(), ConsumerError> {
        let handler = self
            .handlers
            .read()
            .await
            .get(queue)
            .cloned()
            .ok_or_else(|| ConsumerError::Broker(anyhow!("no handler bound to queue {queue}")))?;
        handler.handle(job).await
    }

    pub async fn is_bound(&self, queue: &str) -> bool {
        self.handlers.read().await.contains_key(queue)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&self, queue: &str, handler: Arc<dyn JobHandler>) -> anyhow::Result<()> {
        self.handlers.write().await.insert(queue.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, queue: &str) -> anyhow::Result<()> {
        self.handlers.write().await.remove(queue);
        Ok(())
    }
}
