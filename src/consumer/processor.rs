//! The sequential processor.
//!
//! A single task owns the pending buffer, the session state and the
//! `Idle`/`Draining` state. Everything else talks to it through an
//! unbounded inbox, so accepting a job never waits for a running batch and
//! no two batches can overlap.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::buffer::PendingBuffer;
use super::payload::QueuedMessage;
use super::session::{SessionContext, SessionState, build_config};
use super::unit::{UnitFactory, run_and_release};
use crate::error::ConsumerError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorState {
    #[default]
    Idle,
    Draining,
}

/// Read-only view published after every state change.
#[derive(Debug, Clone, Default)]
pub struct ProcessorSnapshot {
    pub state: ProcessorState,
    pub pending: usize,
    pub session_id: Option<String>,
    pub batches_completed: u64,
    pub batches_failed: u64,
    pub draining_since: Option<Instant>,
}

enum Command {
    Enqueue(QueuedMessage),
    /// Reply once everything accepted before this command has been processed.
    Settle(oneshot::Sender<()>),
    Shutdown,
}

/// Cloneable sender side used by job handlers.
#[derive(Clone)]
pub struct Inbox {
    tx: mpsc::UnboundedSender<Command>,
}

impl Inbox {
    pub fn append(&self, message: QueuedMessage) -> Result<(), ConsumerError> {
        self.tx
            .send(Command::Enqueue(message))
            .map_err(|_| ConsumerError::NotRunning)
    }
}

/// Owner's handle on a running processor.
pub struct ProcessorHandle {
    inbox: Inbox,
    snapshot: watch::Receiver<ProcessorSnapshot>,
    task: JoinHandle<()>,
}

impl ProcessorHandle {
    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn snapshot(&self) -> ProcessorSnapshot {
        self.snapshot.borrow().clone()
    }

    /// False once the processor task has exited.
    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Wait until every message accepted so far has been through a batch
    /// (or its drain failed).
    pub async fn settle(&self) -> Result<(), ConsumerError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .tx
            .send(Command::Settle(tx))
            .map_err(|_| ConsumerError::NotRunning)?;
        // A dropped reply means the processor shut down first.
        let _ = rx.await;
        Ok(())
    }

    /// Stop accepting messages, then process everything accepted before the
    /// shutdown and release the last unit.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.inbox.tx.send(Command::Shutdown);
        self.task
            .await
            .map_err(|e| anyhow!("processor task failed: {e}"))
    }
}

pub struct Processor {
    rx: mpsc::UnboundedReceiver<Command>,
    buffer: PendingBuffer,
    session: SessionState,
    ctx: SessionContext,
    units: Arc<dyn UnitFactory>,
    snapshot: watch::Sender<ProcessorSnapshot>,
    state: ProcessorState,
    draining_since: Option<Instant>,
    batches_completed: u64,
    batches_failed: u64,
    settle_waiters: Vec<oneshot::Sender<()>>,
    shutting_down: bool,
    inbox_closed: bool,
}

impl Processor {
    /// Start the processor task.
    pub fn spawn(ctx: SessionContext, units: Arc<dyn UnitFactory>) -> ProcessorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(ProcessorSnapshot::default());
        let processor = Self {
            rx,
            buffer: PendingBuffer::new(),
            session: SessionState::default(),
            ctx,
            units,
            snapshot: snapshot_tx,
            state: ProcessorState::Idle,
            draining_since: None,
            batches_completed: 0,
            batches_failed: 0,
            settle_waiters: Vec::new(),
            shutting_down: false,
            inbox_closed: false,
        };
        let task = tokio::spawn(processor.run());
        ProcessorHandle {
            inbox: Inbox { tx },
            snapshot: snapshot_rx,
            task,
        }
    }

    async fn run(mut self) {
        while !self.shutting_down {
            let Some(command) = self.rx.recv().await else {
                break;
            };
            let kicked = matches!(command, Command::Enqueue(_));
            self.accept(command);
            if kicked {
                self.drain().await;
            }
            self.release_settled();
        }
        self.finish().await;
    }

    /// Close the inbox and work off everything it already holds. Each drain
    /// consumes at least one batch and nothing new can arrive, so this ends
    /// even when batches keep failing.
    async fn finish(&mut self) {
        self.rx.close();
        self.accept_ready();
        while !self.buffer.is_empty() {
            tracing::info!(pending = self.buffer.len(), "processing backlog before shutdown");
            self.drain().await;
        }
        self.release_settled();
        tracing::debug!(
            batches_completed = self.batches_completed,
            batches_failed = self.batches_failed,
            "processor stopped"
        );
    }

    fn accept(&mut self, command: Command) {
        match command {
            Command::Enqueue(message) => {
                self.buffer.append(message);
                self.publish();
            }
            Command::Settle(reply) => self.settle_waiters.push(reply),
            Command::Shutdown => {
                // Later appends fail with NotRunning instead of being acknowledged.
                self.rx.close();
                self.shutting_down = true;
            }
        }
    }

    /// Pull in whatever is already waiting in the inbox.
    fn accept_ready(&mut self) {
        while let Ok(command) = self.rx.try_recv() {
            self.accept(command);
        }
    }

    async fn drain(&mut self) {
        self.state = ProcessorState::Draining;
        self.draining_since = Some(Instant::now());
        self.publish();
        tracing::debug!(pending = self.buffer.len(), "drain started");

        let result = self.drain_batches().await;

        self.state = ProcessorState::Idle;
        self.draining_since = None;
        self.publish();
        match result {
            Ok(()) => tracing::debug!("drain finished"),
            Err(e) => {
                self.batches_failed += 1;
                self.publish();
                tracing::error!(
                    error = format!("{:#}", anyhow::Error::new(e)),
                    pending = self.buffer.len(),
                    "drain failed; remaining messages wait for the next append"
                );
            }
        }
    }

    async fn drain_batches(&mut self) -> Result<(), ConsumerError> {
        loop {
            self.accept_ready();
            if self.buffer.is_empty() {
                return Ok(());
            }
            let batch = self.buffer.drain_all();
            self.publish();
            self.process_batch(batch).await?;
        }
    }

    async fn process_batch(&mut self, batch: Vec<QueuedMessage>) -> Result<(), ConsumerError> {
        let batch_size = batch.len();
        let failed = move |source: anyhow::Error| ConsumerError::BatchProcessing { batch_size, source };

        let config = build_config(&batch, &mut self.session, &self.ctx).map_err(failed)?;
        self.publish();
        let unit = self.units.create().map_err(failed)?;
        tracing::info!(
            thread_id = %config.thread_id,
            session_id = %config.session_key(),
            resume = config.is_resume(),
            batch_size,
            "processing batch"
        );

        let mut task = tokio::spawn(run_and_release(unit, config));
        let joined = loop {
            tokio::select! {
                joined = &mut task => break joined,
                command = self.rx.recv(), if !self.inbox_closed => match command {
                    Some(command) => self.accept(command),
                    None => self.inbox_closed = true,
                },
            }
        };

        match joined {
            Ok(Ok(outcome)) => {
                self.batches_completed += 1;
                self.publish();
                tracing::info!(batch_size, exit_code = outcome.exit_code, "batch finished");
                Ok(())
            }
            Ok(Err(e)) => Err(failed(e)),
            Err(e) => Err(failed(anyhow!("processing unit panicked: {e}"))),
        }
    }

    fn release_settled(&mut self) {
        for waiter in self.settle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(ProcessorSnapshot {
            state: self.state,
            pending: self.buffer.len(),
            session_id: self.session.current().map(String::from),
            batches_completed: self.batches_completed,
            batches_failed: self.batches_failed,
            draining_since: self.draining_since,
        });
    }
}
