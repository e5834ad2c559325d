//! Per-job-item tokio task.
//!
//! Each job item runs its phases in its own task and owns its source
//! connection and record channel. A sibling persister task flushes the
//! item's progress on an interval.
//!
//! ```text
//!   Preparing ──► ExecuteInventoryTask ──► ExecuteIncrementalTask ──► Finished
//!       │                 │                         │
//!       ▼                 ▼                         ▼
//!   PreparingFailure  ExecuteInventoryTaskFailure  ExecuteIncrementalTaskFailure
//! ```
//!
//! A stop request is honored at the dumper's next batch boundary and
//! leaves the item `Stopped`. An already finished inventory position
//! skips straight to the incremental phase; without a change-log factory
//! the item finishes after the inventory phase.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use tidewater_connectors::dialect::Dialect;
use tidewater_connectors::incremental::{IncrementalDumper, IncrementalDumperConfig, LogEventSource};
use tidewater_connectors::inventory::{InventoryDumper, InventoryDumperConfig};
use tidewater_connectors::lifecycle::{Lifecycle, LifecycleState};
use tidewater_connectors::position::destroy_best_effort;
use tidewater_core::channel::{create_channel, AckCallback, RecordReceiver, RecordSender};
use tidewater_core::error::{IngestError, SourceError};
use tidewater_core::metadata::TableMetadata;
use tidewater_core::position::IngestPosition;
use tidewater_core::rate_limit::RateLimiter;
use tidewater_core::source::DataSource;

use crate::config::{ProcessConfig, TableRef};
use crate::error::JobError;
use crate::progress::{JobItemProgress, JobItemProgressTracker, JobStatus};
use crate::repository::JobRepository;

/// Opens change-log readers for the incremental phase.
#[async_trait]
pub trait LogSourceFactory: Send + Sync {
    /// Opens a reader for `item` positioned at `position`.
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` if the change log cannot be opened.
    async fn open(
        &self,
        item: &JobItemSpec,
        position: &IngestPosition,
    ) -> Result<Box<dyn LogEventSource>, SourceError>;
}

/// What one job item migrates.
#[derive(Debug, Clone)]
pub struct JobItemSpec {
    /// Owning job id.
    pub job_id: String,
    /// Item number within the job.
    pub item: u32,
    /// Table reference from the job definition.
    pub table: TableRef,
    /// Source metadata of the table.
    pub metadata: TableMetadata,
}

impl JobItemSpec {
    /// Name of source-side resources reserved for this item.
    #[must_use]
    pub fn slot_suffix(&self) -> String {
        format!("{}_{}", self.job_id, self.item)
    }
}

/// Everything a job item task needs.
pub struct JobItemRunner {
    /// Item description.
    pub spec: JobItemSpec,
    /// Source connection pool.
    pub data_source: Arc<dyn DataSource>,
    /// Resolved source dialect.
    pub dialect: Dialect,
    /// Process tuning.
    pub process: ProcessConfig,
    /// Read throttle shared by the job's items.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
    /// Change-log factory; `None` ends the item after the inventory phase.
    pub log_sources: Option<Arc<dyn LogSourceFactory>>,
    /// Progress persistence.
    pub repository: JobRepository,
}

impl fmt::Debug for JobItemRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobItemRunner")
            .field("spec", &self.spec)
            .field("data_source", &self.data_source.name())
            .field("dialect", &self.dialect.name())
            .field("process", &self.process)
            .finish_non_exhaustive()
    }
}

/// Stop signal spanning both phases of an item.
#[derive(Debug, Default)]
struct ItemControl {
    cancel: CancellationToken,
    phase: Mutex<Option<Arc<Lifecycle>>>,
}

impl ItemControl {
    fn stop(&self) {
        self.cancel.cancel();
        if let Some(lifecycle) = self.phase.lock().as_ref() {
            lifecycle.stop();
        }
    }

    /// Installs the lifecycle of the next phase. Returns `false` if a stop
    /// already arrived, in which case the phase must not run.
    fn begin_phase(&self, lifecycle: Arc<Lifecycle>) -> bool {
        *self.phase.lock() = Some(lifecycle);
        !self.cancel.is_cancelled()
    }
}

enum ItemExit {
    Completed,
    Stopped,
}

struct ItemFailure {
    status: JobStatus,
    error: JobError,
}

impl ItemFailure {
    fn new(status: JobStatus, error: impl Into<JobError>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }
}

/// Handle to a running job item.
pub struct JobItemHandle {
    job_id: String,
    item: u32,
    receiver: Option<RecordReceiver>,
    tracker: Arc<JobItemProgressTracker>,
    control: Arc<ItemControl>,
    task: JoinHandle<Result<JobStatus, JobError>>,
    persister: JoinHandle<()>,
    persist_cancel: CancellationToken,
}

impl JobItemHandle {
    /// Owning job id.
    #[must_use]
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Item number.
    #[must_use]
    pub fn item(&self) -> u32 {
        self.item
    }

    /// Takes the consumer half of the item's channel (once).
    pub fn take_receiver(&mut self) -> Option<RecordReceiver> {
        self.receiver.take()
    }

    /// Live progress tracker.
    #[must_use]
    pub fn tracker(&self) -> &Arc<JobItemProgressTracker> {
        &self.tracker
    }

    /// Copy of the live progress.
    #[must_use]
    pub fn progress(&self) -> JobItemProgress {
        self.tracker.snapshot()
    }

    /// Whether the item task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Requests a cooperative stop.
    pub fn stop(&self) {
        if !self.task.is_finished() {
            self.tracker.set_status(JobStatus::Stopping);
        }
        self.control.stop();
    }

    /// Waits for the item to exit, then flushes its progress a last time.
    ///
    /// Returns the final status, `Finished` or `Stopped`.
    ///
    /// # Errors
    ///
    /// Returns the error that failed the item, or `JobError::TaskPanicked`
    /// if its task panicked.
    pub async fn join(self) -> Result<JobStatus, JobError> {
        let outcome = match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = JobError::TaskPanicked {
                    task: format!("job item {} of {}", self.item, self.job_id),
                    message: e.to_string(),
                };
                let status = self.tracker.snapshot().phase_failure();
                tracing::error!(job_id = %self.job_id, item = self.item, status = %status, error = %error, "Job item failed");
                self.tracker.fail(status, error.to_string());
                Err(error)
            }
        };
        self.persist_cancel.cancel();
        if let Err(e) = self.persister.await {
            tracing::warn!(job_id = %self.job_id, item = self.item, error = %e, "Progress persister panicked");
        }
        outcome
    }
}

impl fmt::Debug for JobItemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobItemHandle")
            .field("job_id", &self.job_id)
            .field("item", &self.item)
            .field("status", &self.tracker.status())
            .finish_non_exhaustive()
    }
}

/// Spawns the item task and its progress persister.
///
/// `progress` is the item's starting state: fresh for a new job, or the
/// persisted progress when resuming.
#[must_use]
pub fn spawn_job_item(runner: JobItemRunner, progress: JobItemProgress) -> JobItemHandle {
    let job_id = runner.spec.job_id.clone();
    let item = runner.spec.item;
    let tracker = Arc::new(JobItemProgressTracker::new(progress));

    let ack_tracker = Arc::clone(&tracker);
    let on_ack: AckCallback = Arc::new(move |records| ack_tracker.on_ack(records));
    let (sender, receiver) = create_channel(runner.process.channel_capacity, Some(on_ack));

    let persist_cancel = CancellationToken::new();
    let persister = tokio::spawn(persist_loop(
        Arc::clone(&tracker),
        runner.repository.clone(),
        job_id.clone(),
        item,
        runner.process.persist_interval,
        persist_cancel.clone(),
    ));

    let control = Arc::new(ItemControl::default());
    let task = tokio::spawn(run_item(
        runner,
        Arc::clone(&tracker),
        Arc::clone(&control),
        sender,
    ));

    JobItemHandle {
        job_id,
        item,
        receiver: Some(receiver),
        tracker,
        control,
        task,
        persister,
        persist_cancel,
    }
}

async fn run_item(
    runner: JobItemRunner,
    tracker: Arc<JobItemProgressTracker>,
    control: Arc<ItemControl>,
    sender: RecordSender,
) -> Result<JobStatus, JobError> {
    let job_id = runner.spec.job_id.clone();
    let item = runner.spec.item;
    tracing::debug!(job_id = %job_id, item, table = %runner.spec.table.name, "Job item started");
    let outcome = execute(&runner, &tracker, &control, sender).await;
    match outcome {
        Ok(ItemExit::Completed) => {
            tracker.set_status(JobStatus::Finished);
            tracker.set_active(false);
            tracing::info!(job_id = %job_id, item, "Job item finished");
            Ok(JobStatus::Finished)
        }
        Ok(ItemExit::Stopped) => {
            tracker.set_status(JobStatus::Stopped);
            tracker.set_active(false);
            tracing::info!(job_id = %job_id, item, "Job item stopped");
            Ok(JobStatus::Stopped)
        }
        Err(failure) => {
            tracing::error!(job_id = %job_id, item, status = %failure.status, error = %failure.error, "Job item failed");
            tracker.fail(failure.status, failure.error.to_string());
            Err(failure.error)
        }
    }
}

async fn execute(
    runner: &JobItemRunner,
    tracker: &JobItemProgressTracker,
    control: &ItemControl,
    sender: RecordSender,
) -> Result<ItemExit, ItemFailure> {
    let spec = &runner.spec;
    let fail_prepare = |e: JobError| ItemFailure::new(JobStatus::PreparingFailure, e);
    tracker.set_status(JobStatus::Preparing);

    // The change-log position is taken before the snapshot so no change
    // made during the inventory phase is lost.
    let mut incremental_position = tracker.snapshot().incremental_position;
    if runner.log_sources.is_some() && incremental_position.is_none() {
        let manager = runner.dialect.position_manager().ok_or_else(|| {
            fail_prepare(JobError::Ingest(IngestError::UnsupportedConfiguration(
                format!("dialect {} has no change-log support", runner.dialect.name()),
            )))
        })?;
        let mut connection = runner
            .data_source
            .connection()
            .await
            .map_err(|e| fail_prepare(e.into()))?;
        let position = manager
            .init(connection.as_mut(), &spec.slot_suffix())
            .await
            .map_err(|e| fail_prepare(e.into()))?;
        tracing::debug!(job_id = %spec.job_id, item = spec.item, position = %position, "Incremental position initialized");
        tracker.set_incremental_position(position.clone());
        incremental_position = Some(position);
    }

    let inventory_position = tracker.snapshot().inventory_position;
    if !inventory_position.is_finished() {
        tracker.set_status(JobStatus::ExecuteInventoryTask);
        let fail = |e: JobError| ItemFailure::new(JobStatus::ExecuteInventoryTaskFailure, e);
        let connection = runner
            .data_source
            .connection()
            .await
            .map_err(|e| fail(e.into()))?;
        let mut config = InventoryDumperConfig::new(spec.metadata.clone(), inventory_position);
        config.logic_table_name = spec.table.logic_name().to_string();
        config.batch_size = runner.process.batch_size;
        config.fetch_size = runner.process.fetch_size;
        config.rate_limiter = runner.rate_limiter.clone();
        let dumper = InventoryDumper::new(config, runner.dialect.clone(), connection, sender.clone())
            .map_err(|e| fail(e.into()))?;
        if !control.begin_phase(dumper.lifecycle()) {
            return Ok(ItemExit::Stopped);
        }
        match dumper.run().await {
            Ok(IngestPosition::Finished) => tracker.complete_phase(),
            Ok(_) => return Ok(ItemExit::Stopped),
            Err(e) => return Err(fail(e.into())),
        }
    }

    let Some(factory) = &runner.log_sources else {
        return Ok(ItemExit::Completed);
    };
    let position = match incremental_position {
        Some(IngestPosition::Finished) => return Ok(ItemExit::Completed),
        Some(position) => position,
        None => return Ok(ItemExit::Completed),
    };
    if control.cancel.is_cancelled() {
        return Ok(ItemExit::Stopped);
    }
    tracker.set_status(JobStatus::ExecuteIncrementalTask);
    let fail = |e: JobError| ItemFailure::new(JobStatus::ExecuteIncrementalTaskFailure, e);
    let source = factory
        .open(spec, &position)
        .await
        .map_err(|e| fail(e.into()))?;
    let mut config = IncrementalDumperConfig::new(position);
    config.poll_max_records = runner.process.poll_max_records;
    config.idle_interval = runner.process.idle_interval;
    let dumper = IncrementalDumper::new(config, source, sender).map_err(|e| fail(e.into()))?;
    let lifecycle = dumper.lifecycle();
    if !control.begin_phase(Arc::clone(&lifecycle)) {
        return Ok(ItemExit::Stopped);
    }
    dumper.run().await.map_err(|e| fail(e.into()))?;
    if lifecycle.state() != LifecycleState::Finished {
        return Ok(ItemExit::Stopped);
    }
    tracker.complete_phase();

    if let Some(manager) = runner.dialect.position_manager() {
        match runner.data_source.connection().await {
            Ok(mut connection) => {
                destroy_best_effort(manager.as_ref(), connection.as_mut(), &spec.slot_suffix()).await;
            }
            Err(e) => {
                tracing::warn!(job_id = %spec.job_id, item = spec.item, error = %e, "No connection to release incremental position");
            }
        }
    }
    Ok(ItemExit::Completed)
}

async fn persist_loop(
    tracker: Arc<JobItemProgressTracker>,
    repository: JobRepository,
    job_id: String,
    item: u32,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            _ = ticker.tick() => flush(&tracker, &repository, &job_id, item),
        }
    }
    flush(&tracker, &repository, &job_id, item);
}

fn flush(tracker: &JobItemProgressTracker, repository: &JobRepository, job_id: &str, item: u32) {
    let Some(progress) = tracker.take_dirty() else {
        return;
    };
    if let Err(e) = repository.save_item_progress(job_id, item, &progress) {
        tracing::warn!(job_id, item, error = %e, "Failed to persist job item progress; will retry");
        tracker.mark_dirty();
    }
}
