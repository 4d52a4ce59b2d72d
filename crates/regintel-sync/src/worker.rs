//! Supervised background runner: cron ticks and manual triggers share one
//! bounded queue drained by a single task.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{IngestionPipeline, RunOptions, RunOutcome, RunState};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub cron: String,
    pub scheduler_enabled: bool,
    pub run_on_start: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerResult {
    Queued,
    Busy,
    Stopped,
}

/// Cloneable trigger side of a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<RunOptions>,
    state: Arc<RunState>,
}

impl WorkerHandle {
    /// Queues a run unless one is in progress or already pending.
    pub fn trigger(&self, options: RunOptions) -> TriggerResult {
        if self.state.is_running() {
            return TriggerResult::Busy;
        }
        enqueue(&self.tx, options, "manual")
    }
}

pub struct IngestionWorker {
    handle: WorkerHandle,
    scheduler: Option<JobScheduler>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl IngestionWorker {
    /// Fails on an invalid cron expression or scheduler startup error; nothing
    /// is spawned in that case.
    pub async fn start(pipeline: Arc<IngestionPipeline>, config: WorkerConfig) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler = if config.scheduler_enabled {
            Some(build_scheduler(&config.cron, tx.clone()).await?)
        } else {
            info!("ingestion scheduler disabled");
            None
        };

        let handle = WorkerHandle {
            tx,
            state: pipeline.state(),
        };
        let task = tokio::spawn(worker_loop(pipeline, rx, shutdown_rx));

        if config.run_on_start {
            enqueue(&handle.tx, RunOptions::default(), "startup");
        }

        Ok(Self {
            handle,
            scheduler,
            shutdown_tx,
            task,
        })
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    pub fn trigger(&self, options: RunOptions) -> TriggerResult {
        self.handle.trigger(options)
    }

    /// Stops the scheduler, then lets an in-flight run finish before joining.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown().await.context("stopping scheduler")?;
        }
        self.shutdown_tx.send_replace(true);
        self.task.await.context("joining ingestion worker")?;
        Ok(())
    }
}

async fn build_scheduler(cron: &str, tx: mpsc::Sender<RunOptions>) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_id, _scheduler| {
        let tx = tx.clone();
        Box::pin(async move {
            enqueue(&tx, RunOptions::default(), "schedule");
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    scheduler.add(job).await.context("adding scheduler job")?;
    scheduler.start().await.context("starting scheduler")?;
    info!(cron, "ingestion scheduler started");
    Ok(scheduler)
}

fn enqueue(tx: &mpsc::Sender<RunOptions>, options: RunOptions, origin: &'static str) -> TriggerResult {
    match tx.try_send(options) {
        Ok(()) => {
            info!(origin, dry_run = options.dry_run, "ingestion run queued");
            TriggerResult::Queued
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(origin, "ingestion run already pending, trigger dropped");
            TriggerResult::Busy
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(origin, "ingestion worker stopped, trigger dropped");
            TriggerResult::Stopped
        }
    }
}

async fn worker_loop(
    pipeline: Arc<IngestionPipeline>,
    mut rx: mpsc::Receiver<RunOptions>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = rx.recv() => {
                let Some(options) = next else { break };
                match pipeline.run_cycle(options).await {
                    RunOutcome::Completed(report) => {
                        if !report.errors.is_empty() {
                            error!(run_id = %report.run_id, errors = ?report.errors, "ingestion run finished with source errors");
                        }
                    }
                    RunOutcome::AlreadyRunning => {
                        info!("queued ingestion run skipped, another run is active");
                    }
                }
            }
        }
    }
    info!("ingestion worker stopped");
}
