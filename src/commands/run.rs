use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::consumer::broker::MemoryBroker;
use crate::consumer::unit::{CommandUnitFactory, LogProgress};
use crate::consumer::{ConsumerSettings, ThreadConsumer, reclaim};

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Config file (defaults to .thread-worker.toml or .thread-worker.json in the current directory)
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Deployment identifier (overrides config and DEPLOYMENT_NAME)
    #[arg(long)]
    pub deployment: Option<String>,
    /// User that owns this thread (overrides config and USER_ID)
    #[arg(long)]
    pub user_id: Option<String>,
    /// Worker command to run per batch (overrides config and WORKER_COMMAND)
    #[arg(long)]
    pub worker: Option<String>,
}

impl RunArgs {
    pub fn execute(&self) -> anyhow::Result<()> {
        let config = self.resolve_config()?;
        let runtime = tokio::runtime::Runtime::new().context("starting async runtime")?;
        runtime.block_on(run_consumer(config))
    }

    fn resolve_config(&self) -> anyhow::Result<Config> {
        let cwd = std::env::current_dir().context("determining working directory")?;
        let mut config = Config::discover(self.config.as_deref(), &cwd)?;
        config.apply_env()?;

        // CLI flag > env > config file
        if let Some(ref deployment) = self.deployment {
            config.consumer.deployment = Some(deployment.clone());
        }
        if let Some(ref user_id) = self.user_id {
            config.consumer.user_id = Some(user_id.clone());
        }
        if let Some(ref worker) = self.worker {
            config.worker.command.clone_from(worker);
        }
        Ok(config)
    }
}

/// Run a consumer fed by newline-delimited job envelopes on stdin.
///
/// EOF waits for accepted messages to finish before stopping. Ctrl-C stops
/// right away; the consumer still works off everything it already accepted.
async fn run_consumer(config: Config) -> anyhow::Result<()> {
    let settings = ConsumerSettings::from_config(&config)?;
    let broker = Arc::new(MemoryBroker::new());
    let units = Arc::new(CommandUnitFactory::from_config(&config.worker, Arc::new(LogProgress)));
    let reclaimer = reclaim::from_config(&config.reclaim);

    let mut consumer = ThreadConsumer::new(settings, broker.clone(), units, reclaimer);
    consumer.start().await?;
    let queue = consumer.queue_name().to_string();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        tokio::select! {
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => deliver(&broker, &queue, &line).await,
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                interrupted = true;
                break;
            }
        }
    }

    if !interrupted {
        consumer.settle().await?;
    }
    consumer.stop().await?;
    Ok(())
}

async fn deliver(broker: &MemoryBroker, queue: &str, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let job = match serde_json::from_str(line) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(error = %e, "skipping input line that is not JSON");
            return;
        }
    };
    if let Err(e) = broker.publish(queue, job).await {
        if e.is_job_rejection() {
            tracing::warn!(queue, error = %e, "job rejected");
        } else {
            tracing::error!(queue, error = format!("{:#}", anyhow::Error::new(e)), "job delivery failed");
        }
    }
}
