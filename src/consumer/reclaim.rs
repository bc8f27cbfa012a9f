//! The "this deployment may be reclaimed" signal sent at shutdown.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::config::ReclaimConfig;

#[async_trait]
pub trait DeploymentReclaimer: Send + Sync {
    async fn reclaim(&self, deployment: &str) -> anyhow::Result<()>;
}

/// Used when no reclaim endpoint is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopReclaimer;

#[async_trait]
impl DeploymentReclaimer for NoopReclaimer {
    async fn reclaim(&self, deployment: &str) -> anyhow::Result<()> {
        tracing::debug!(deployment, "no reclaim endpoint configured");
        Ok(())
    }
}

/// POSTs `{"deployment": ..., "replicas": 0}` to an orchestrator endpoint.
#[derive(Debug, Clone)]
pub struct HttpReclaimer {
    url: String,
    token: Option<String>,
}

impl HttpReclaimer {
    pub const fn new(url: String, token: Option<String>) -> Self {
        Self { url, token }
    }
}

#[async_trait]
impl DeploymentReclaimer for HttpReclaimer {
    async fn reclaim(&self, deployment: &str) -> anyhow::Result<()> {
        let body = serde_json::json!({ "deployment": deployment, "replicas": 0 }).to_string();
        let url = self.url.clone();
        let token = self.token.clone();

        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut request = ureq::post(&url).header("Content-Type", "application/json");
            if let Some(token) = token {
                request = request.header("Authorization", format!("Bearer {token}"));
            }
            request
                .send(body.as_str())
                .with_context(|| format!("posting reclaim request to {url}"))?;
            Ok(())
        })
        .await
        .context("reclaim task failed")?
    }
}

/// Pick the reclaimer for `[reclaim]` config.
pub fn from_config(config: &ReclaimConfig) -> Arc<dyn DeploymentReclaimer> {
    match config.url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(HttpReclaimer::new(url.to_string(), config.token.clone())),
        _ => Arc::new(NoopReclaimer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_always_succeeds() {
        NoopReclaimer.reclaim("d").await.unwrap();
    }

    #[tokio::test]
    async fn http_reclaimer_reports_unreachable_endpoint() {
        // Port 9 on localhost is reserved for discard and not listening here
        let reclaimer = HttpReclaimer::new("http://127.0.0.1:9/scale".into(), None);
        let err = reclaimer.reclaim("d").await.unwrap_err();
        assert!(format!("{err:#}").contains("posting reclaim request"));
    }

    #[tokio::test]
    async fn blank_url_means_noop() {
        let reclaimer = from_config(&ReclaimConfig {
            url: Some("  ".into()),
            token: None,
        });
        reclaimer.reclaim("d").await.unwrap();
    }
}
