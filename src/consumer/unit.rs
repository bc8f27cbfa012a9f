//! Processing units: the single-use handles that execute one agent turn.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use super::session::WorkerConfig;
use crate::config::WorkerCommandConfig;
use crate::subprocess::{RunningTool, Tool};

/// Partial output from a running turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub thread_id: String,
    pub session_id: String,
    pub text: String,
}

/// Receives streamed output for the originating platform.
pub trait ProgressSink: Send + Sync {
    fn send(&self, update: ProgressUpdate);
}

/// Writes progress to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn send(&self, update: ProgressUpdate) {
        tracing::info!(
            thread_id = %update.thread_id,
            session_id = %update.session_id,
            "{}",
            update.text
        );
    }
}

/// What a finished turn reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitOutcome {
    pub exit_code: i32,
    pub output: String,
}

/// Executes exactly one batch. `release` is always called after `run`,
/// whatever `run` returned.
#[async_trait]
pub trait ProcessingUnit: Send {
    async fn run(&mut self, config: &WorkerConfig) -> anyhow::Result<UnitOutcome>;

    async fn release(&mut self) -> anyhow::Result<()>;
}

/// Creates a fresh unit per batch.
pub trait UnitFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn ProcessingUnit>>;
}

/// Run `unit` and release it, returning the run result. A release failure
/// is logged, never returned.
pub async fn run_and_release(
    mut unit: Box<dyn ProcessingUnit>,
    config: WorkerConfig,
) -> anyhow::Result<UnitOutcome> {
    let result = unit.run(&config).await;
    if let Err(e) = unit.release().await {
        tracing::warn!(
            thread_id = %config.thread_id,
            error = format!("{e:#}"),
            "failed to release processing unit"
        );
    }
    result
}

/// Runs the configured worker command with the batch's config in its
/// environment. Each stdout line is forwarded as progress.
pub struct CommandUnit {
    tool: Tool,
    progress: Arc<dyn ProgressSink>,
    running: Option<RunningTool>,
}

impl CommandUnit {
    pub fn new(tool: Tool, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            tool,
            progress,
            running: None,
        }
    }
}

#[async_trait]
impl ProcessingUnit for CommandUnit {
    async fn run(&mut self, config: &WorkerConfig) -> anyhow::Result<UnitOutcome> {
        let mut tool = self.tool.clone().envs(config.to_env());
        if let Some(limit) = config.timeout() {
            tool = tool.timeout(limit);
        }

        let running = self.running.insert(tool.spawn()?);
        let progress = Arc::clone(&self.progress);
        let thread_id = config.thread_id.clone();
        let session_id = config.session_key().to_string();
        let output = running
            .wait_streaming(|line| {
                progress.send(ProgressUpdate {
                    thread_id: thread_id.clone(),
                    session_id: session_id.clone(),
                    text: line.to_string(),
                });
            })
            .await?
            .into_ok(tool.program())?;

        Ok(UnitOutcome {
            exit_code: output.exit_code,
            output: output.stdout,
        })
    }

    async fn release(&mut self) -> anyhow::Result<()> {
        if let Some(mut running) = self.running.take() {
            running.kill().await?;
        }
        Ok(())
    }
}

/// Builds a `CommandUnit` per batch from `[worker]` config.
pub struct CommandUnitFactory {
    command: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    progress: Arc<dyn ProgressSink>,
}

impl CommandUnitFactory {
    pub fn from_config(config: &WorkerCommandConfig, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            workdir: config.workdir.clone(),
            progress,
        }
    }
}

impl UnitFactory for CommandUnitFactory {
    fn create(&self) -> anyhow::Result<Box<dyn ProcessingUnit>> {
        let mut tool = Tool::new(&self.command).args(&self.args);
        if let Some(ref dir) = self.workdir {
            tool = tool.current_dir(dir.clone());
        }
        Ok(Box::new(CommandUnit::new(tool, Arc::clone(&self.progress))))
    }
}
