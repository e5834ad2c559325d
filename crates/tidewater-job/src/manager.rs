//! Job lifecycle and the administrative read surface.
//!
//! The manager owns the running job items of every job, resolves data
//! sources and dialects, and answers the status queries. Status queries
//! never fail: missing or unreadable state is logged and reported as an
//! empty result, because operators poll them during start/stop races.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use tidewater_connectors::dialect::{Dialect, DialectRegistry};
use tidewater_connectors::position::split_inventory_positions;
use tidewater_core::channel::RecordReceiver;
use tidewater_core::config::Properties;
use tidewater_core::metadata::{TableMetadata, TableMetadataLoader};
use tidewater_core::position::IngestPosition;
use tidewater_core::source::DataSource;

use crate::config::{JobConfig, TableRef};
use crate::consistency::{CheckEndpoint, ConsistencyCheckHandle, ConsistencyCheckJob, DataConsistencyChecker};
use crate::error::JobError;
use crate::progress::{JobItemProgress, JobStatus};
use crate::report::{ConsistencyCheckJobItemInfo, JobInfo, JobItemInfo};
use crate::repository::{JobMeta, JobRepository};
use crate::runner::{spawn_job_item, JobItemHandle, JobItemRunner, JobItemSpec, LogSourceFactory};

#[derive(Clone)]
struct RegisteredSource {
    data_source: Arc<dyn DataSource>,
    metadata: Arc<dyn TableMetadataLoader>,
}

/// Consumer half of one running job item.
#[derive(Debug)]
pub struct JobItemReceiver {
    /// Item number.
    pub item: u32,
    /// Logical table the item writes.
    pub table: String,
    /// Records pushed by the item's dumpers.
    pub receiver: RecordReceiver,
}

/// Starts, stops and reports on migration jobs.
pub struct JobManager {
    repository: JobRepository,
    registry: DialectRegistry,
    sources: RwLock<HashMap<String, RegisteredSource>>,
    log_sources: Option<Arc<dyn LogSourceFactory>>,
    running: Mutex<HashMap<String, Vec<JobItemHandle>>>,
    checks: ConsistencyCheckJob,
    check_handles: Mutex<HashMap<String, ConsistencyCheckHandle>>,
}

impl JobManager {
    /// Creates a manager persisting through `repository`, with the
    /// built-in dialects.
    #[must_use]
    pub fn new(repository: JobRepository) -> Self {
        Self {
            checks: ConsistencyCheckJob::new(repository.clone()),
            repository,
            registry: DialectRegistry::with_defaults(),
            sources: RwLock::new(HashMap::new()),
            log_sources: None,
            running: Mutex::new(HashMap::new()),
            check_handles: Mutex::new(HashMap::new()),
        }
    }

    /// Enables the incremental phase, reading change logs from `factory`.
    #[must_use]
    pub fn with_log_sources(mut self, factory: Arc<dyn LogSourceFactory>) -> Self {
        self.log_sources = Some(factory);
        self
    }

    /// Dialects known to this manager.
    #[must_use]
    pub fn dialects(&self) -> &DialectRegistry {
        &self.registry
    }

    /// Backing repository.
    #[must_use]
    pub fn repository(&self) -> &JobRepository {
        &self.repository
    }

    /// Registers a source under its [`DataSource::name`].
    pub fn register_source(
        &self,
        data_source: Arc<dyn DataSource>,
        metadata: Arc<dyn TableMetadataLoader>,
    ) {
        let name = data_source.name().to_string();
        tracing::debug!(data_source = %name, "Data source registered");
        self.sources.write().insert(
            name,
            RegisteredSource {
                data_source,
                metadata,
            },
        );
    }

    /// Starts (or resumes) a job and returns one receiver per running item.
    ///
    /// A job with persisted item progress resumes every unfinished item
    /// from its stored positions. Otherwise each table is split into
    /// items from live source state.
    ///
    /// # Errors
    ///
    /// Returns `JobError::AlreadyRunning` if the job has live items,
    /// `JobError::InvalidDefinition` for an invalid definition or an
    /// unregistered data source, and configuration or source errors raised
    /// while preparing the items.
    pub async fn start_job(&self, config: JobConfig) -> Result<Vec<JobItemReceiver>, JobError> {
        config.validate()?;
        {
            let mut running = self.running.lock();
            if running.contains_key(&config.job_id) {
                return Err(JobError::AlreadyRunning(config.job_id));
            }
            running.insert(config.job_id.clone(), Vec::new());
        }
        match self.spawn_items(&config).await {
            Ok((handles, receivers)) => {
                self.running.lock().insert(config.job_id.clone(), handles);
                Ok(receivers)
            }
            Err(e) => {
                self.running.lock().remove(&config.job_id);
                Err(e)
            }
        }
    }

    async fn spawn_items(
        &self,
        config: &JobConfig,
    ) -> Result<(Vec<JobItemHandle>, Vec<JobItemReceiver>), JobError> {
        let source = self.source(&config.data_source)?;
        let dialect = self.registry.resolve(&config.dialect)?;
        let process = config.process_config()?;
        let rate_limiter = process.build_rate_limiter()?;
        let previous = self.repository.load_job(&config.job_id)?;

        let mut metadata = HashMap::new();
        for table in &config.tables {
            let loaded = source
                .metadata
                .load(table.schema.as_deref(), &table.name)
                .await?;
            metadata.insert(table.logic_name().to_string(), (table.clone(), loaded));
        }

        let stored = self.repository.item_progresses(&config.job_id)?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let planned = if stored.is_empty() {
            self.plan_items(config, &source, &dialect, &metadata, process.shard_size, now_ms)
                .await?
        } else {
            tracing::info!(job_id = %config.job_id, items = stored.len(), "Resuming job from persisted progress");
            stored
                .into_iter()
                .map(|(item, mut progress)| {
                    progress.active = true;
                    progress.status = JobStatus::Running;
                    progress.error_message = None;
                    progress.started_at_ms = now_ms;
                    // An unordered pass restarts from the first row.
                    if matches!(progress.inventory_position, IngestPosition::Placeholder) {
                        progress.processed_records_count = 0;
                    }
                    (item, progress)
                })
                .collect()
        };

        // Every item is validated before the first one is spawned.
        let item_count = u32::try_from(planned.len()).unwrap_or(u32::MAX);
        let mut pending = Vec::new();
        for (item, progress) in planned {
            if progress.status == JobStatus::Finished
                || (progress.inventory_position.is_finished()
                    && matches!(progress.incremental_position, Some(IngestPosition::Finished)))
            {
                tracing::debug!(job_id = %config.job_id, item, "Job item already finished");
                continue;
            }
            let Some((table, table_metadata)) = metadata.get(&progress.table_names) else {
                return Err(JobError::InvalidDefinition(format!(
                    "persisted item {item} of job {} refers to unknown table {}",
                    config.job_id, progress.table_names
                )));
            };
            pending.push((item, progress, table.clone(), table_metadata.clone()));
        }

        let meta = JobMeta {
            config: config.clone(),
            active: true,
            create_time_ms: previous.map_or(now_ms, |m| m.create_time_ms),
            stop_time_ms: None,
            job_item_count: item_count,
        };
        self.repository.save_job(&meta)?;

        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for (item, progress, table, table_metadata) in pending {
            let logic_name = table.logic_name().to_string();
            let runner = JobItemRunner {
                spec: JobItemSpec {
                    job_id: config.job_id.clone(),
                    item,
                    table,
                    metadata: table_metadata,
                },
                data_source: Arc::clone(&source.data_source),
                dialect: dialect.clone(),
                process: process.clone(),
                rate_limiter: rate_limiter.clone(),
                log_sources: self.log_sources.clone(),
                repository: self.repository.clone(),
            };
            let mut handle = spawn_job_item(runner, progress);
            if let Some(receiver) = handle.take_receiver() {
                receivers.push(JobItemReceiver {
                    item,
                    table: logic_name,
                    receiver,
                });
            }
            handles.push(handle);
        }
        tracing::info!(job_id = %config.job_id, items = handles.len(), tables = %config.table_names(), "Job started");
        Ok((handles, receivers))
    }

    async fn plan_items(
        &self,
        config: &JobConfig,
        source: &RegisteredSource,
        dialect: &Dialect,
        metadata: &HashMap<String, (TableRef, TableMetadata)>,
        shard_size: u64,
        now_ms: i64,
    ) -> Result<Vec<(u32, JobItemProgress)>, JobError> {
        let mut connection = source.data_source.connection().await?;
        let mut planned = Vec::new();
        let mut item: u32 = 0;
        for table in &config.tables {
            let Some((_, table_metadata)) = metadata.get(table.logic_name()) else {
                continue;
            };
            let positions =
                split_inventory_positions(connection.as_mut(), dialect, table_metadata, shard_size)
                    .await?;
            let shards = positions.len() as u64;
            let per_shard = table_metadata
                .estimated_rows
                .map_or(0, |rows| rows.div_ceil(shards.max(1)));
            for position in positions {
                let mut progress = JobItemProgress::new(
                    config.data_source.clone(),
                    table.logic_name(),
                    dialect.name(),
                    position,
                    now_ms,
                );
                progress.inventory_records_count = per_shard;
                planned.push((item, progress));
                item += 1;
            }
        }
        Ok(planned)
    }

    /// Requests a cooperative stop of every live item of a job.
    ///
    /// # Errors
    ///
    /// Returns `JobError::JobNotFound` if the job is not running.
    pub fn stop_job(&self, job_id: &str) -> Result<(), JobError> {
        let running = self.running.lock();
        let handles = running
            .get(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
        tracing::info!(job_id, items = handles.len(), "Stopping job");
        for handle in handles {
            handle.stop();
        }
        Ok(())
    }

    /// Waits for every item of a job to exit and marks the job inactive.
    ///
    /// Returns `Finished` if every item finished, `Stopped` otherwise.
    ///
    /// # Errors
    ///
    /// Returns `JobError::JobNotFound` if the job is not running, or the
    /// first item failure once all items exited.
    pub async fn join_job(&self, job_id: &str) -> Result<JobStatus, JobError> {
        let handles = self
            .running
            .lock()
            .remove(job_id)
            .ok_or_else(|| JobError::JobNotFound(job_id.to_string()))?;
        let mut status = JobStatus::Finished;
        let mut failure = None;
        for handle in handles {
            let item = handle.item();
            match handle.join().await {
                Ok(JobStatus::Finished) => {}
                Ok(_) => status = JobStatus::Stopped,
                Err(e) => {
                    tracing::debug!(job_id, item, error = %e, "Job item exited with error");
                    failure.get_or_insert(e);
                }
            }
        }
        if let Some(mut meta) = self.repository.load_job(job_id)? {
            meta.active = false;
            meta.stop_time_ms = Some(chrono::Utc::now().timestamp_millis());
            self.repository.save_job(&meta)?;
        }
        match failure {
            Some(e) => Err(e),
            None => {
                tracing::info!(job_id, status = %status, "Job exited");
                Ok(status)
            }
        }
    }

    /// Whether a job has live items.
    #[must_use]
    pub fn is_running(&self, job_id: &str) -> bool {
        self.running.lock().contains_key(job_id)
    }

    /// Removes a stopped job and everything persisted for it.
    ///
    /// # Errors
    ///
    /// Returns `JobError::AlreadyRunning` while the job has live items.
    pub fn drop_job(&self, job_id: &str) -> Result<(), JobError> {
        if self.is_running(job_id) {
            return Err(JobError::AlreadyRunning(job_id.to_string()));
        }
        self.repository.delete_job(job_id)?;
        tracing::info!(job_id, "Job dropped");
        Ok(())
    }

    /// Rows of the "list migrations" command.
    #[must_use]
    pub fn list_jobs(&self) -> Vec<JobInfo> {
        match self.repository.list_jobs() {
            Ok(jobs) => jobs.iter().map(JobInfo::from_meta).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list jobs");
                Vec::new()
            }
        }
    }

    /// Rows of the "show status" command, one per job item.
    ///
    /// Live items report their in-memory progress; items that are not
    /// running report what was last persisted.
    #[must_use]
    pub fn job_item_infos(&self, job_id: &str) -> Vec<JobItemInfo> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut items: Vec<(u32, JobItemProgress)> = match self.repository.item_progresses(job_id) {
            Ok(items) => items,
            Err(e) => {
                tracing::warn!(job_id, error = %e, "Failed to load job item progress");
                Vec::new()
            }
        };
        if let Some(handles) = self.running.lock().get(job_id) {
            for handle in handles {
                let live = handle.progress();
                match items.iter_mut().find(|(item, _)| *item == handle.item()) {
                    Some((_, progress)) => *progress = live,
                    None => items.push((handle.item(), live)),
                }
            }
        }
        items.sort_by_key(|(item, _)| *item);
        items
            .iter()
            .map(|(item, progress)| JobItemInfo::from_progress(*item, progress, now_ms))
            .collect()
    }

    /// Starts a consistency check of a migration job's tables against
    /// `target`. Returns the check job id.
    ///
    /// # Errors
    ///
    /// Returns `JobError::JobNotFound` for an unknown job, `JobError::Config`
    /// for an unknown algorithm or bad properties, and
    /// `JobError::CheckInProgress` while the latest check is unfinished.
    pub fn start_check(
        &self,
        parent_job_id: &str,
        algorithm_type: &str,
        props: Properties,
        target: CheckEndpoint,
    ) -> Result<String, JobError> {
        let meta = self
            .repository
            .load_job(parent_job_id)?
            .ok_or_else(|| JobError::JobNotFound(parent_job_id.to_string()))?;
        let source = self.source(&meta.config.data_source)?;
        let dialect = self.registry.resolve(&meta.config.dialect)?;
        let checker = DataConsistencyChecker::new(
            algorithm_type,
            props,
            CheckEndpoint::new(source.data_source, source.metadata, dialect),
            target,
        )?;
        let handle = self
            .checks
            .start(parent_job_id, meta.config.tables.clone(), checker)?;
        let check_job_id = handle.check_job_id().to_string();
        self.check_handles
            .lock()
            .insert(parent_job_id.to_string(), handle);
        Ok(check_job_id)
    }

    /// Requests a stop of the running check of a migration job.
    ///
    /// # Errors
    ///
    /// Returns `JobError::CheckNotFound` if no check is running.
    pub fn stop_check(&self, parent_job_id: &str) -> Result<(), JobError> {
        self.check_handles
            .lock()
            .get(parent_job_id)
            .ok_or_else(|| JobError::CheckNotFound(parent_job_id.to_string()))?
            .stop();
        Ok(())
    }

    /// Waits for the running check of a migration job to end.
    ///
    /// # Errors
    ///
    /// Returns `JobError::CheckNotFound` if no check is running, or the
    /// check's failure.
    pub async fn wait_check(&self, parent_job_id: &str) -> Result<(), JobError> {
        let handle = self
            .check_handles
            .lock()
            .remove(parent_job_id)
            .ok_or_else(|| JobError::CheckNotFound(parent_job_id.to_string()))?;
        handle.join().await
    }

    /// Drops the latest check of a migration job.
    ///
    /// # Errors
    ///
    /// See [`ConsistencyCheckJob::drop_latest`].
    pub fn drop_check(&self, parent_job_id: &str) -> Result<(), JobError> {
        self.checks.drop_latest(parent_job_id)
    }

    /// Rows of the "show check status" command for the latest check.
    #[must_use]
    pub fn consistency_check_infos(&self, parent_job_id: &str) -> Vec<ConsistencyCheckJobItemInfo> {
        let latest = match self.checks.latest(parent_job_id) {
            Ok(Some(latest)) => latest,
            Ok(None) => return Vec::new(),
            Err(e) => {
                tracing::warn!(job_id = parent_job_id, error = %e, "Failed to load consistency check");
                return Vec::new();
            }
        };
        let (_, progress, results) = latest;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let idle = self.running.lock().get(parent_job_id).and_then(|handles| {
            handles
                .iter()
                .filter_map(|h| h.progress().incremental_idle_seconds(now_ms))
                .min()
        });
        ConsistencyCheckJobItemInfo::rows(progress.as_ref(), &results, idle, now_ms)
    }

    fn source(&self, name: &str) -> Result<RegisteredSource, JobError> {
        self.sources
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::InvalidDefinition(format!("unknown data source {name}")))
    }
}

impl fmt::Debug for JobManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sources: Vec<String> = self.sources.read().keys().cloned().collect();
        sources.sort();
        let mut running: Vec<String> = self.running.lock().keys().cloned().collect();
        running.sort();
        f.debug_struct("JobManager")
            .field("sources", &sources)
            .field("running", &running)
            .field("incremental", &self.log_sources.is_some())
            .finish_non_exhaustive()
    }
}
