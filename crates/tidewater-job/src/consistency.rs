//! Post-migration consistency check.
//!
//! A check job walks every table of a migration job in unique-key order,
//! reading the same key chunk from source and target and comparing them:
//!
//! ```text
//!   source: SELECT .. WHERE k > last ORDER BY k LIMIT chunk   ──► rows S
//!   target: SELECT .. WHERE k > last AND k <= max(S) ...      ──► rows T
//!           compare(S, T) ── mismatch ──► table not matched, stop
//!                          └─ match ────► last = max(S), next chunk
//! ```
//!
//! Tables without a usable unique key are ignored and reported with the
//! reason. Check job ids are the parent job id followed by a sequence
//! number; a new check cannot start while the latest one is unfinished.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tidewater_connectors::dialect::{Dialect, RangeScan};
use tidewater_core::config::Properties;
use tidewater_core::error::{ConfigError, SourceError};
use tidewater_core::metadata::{ColumnMetadata, TableMetadata, TableMetadataLoader};
use tidewater_core::position::UniqueKeyValue;
use tidewater_core::source::{DataSource, KeyBound, SourceConnection};
use tidewater_core::value::ColumnValue;

use crate::config::TableRef;
use crate::error::JobError;
use crate::progress::JobStatus;
use crate::repository::JobRepository;

/// Algorithm property: rows compared per chunk.
pub const CHUNK_SIZE_KEY: &str = "chunk-size";

const DEFAULT_CHUNK_SIZE: usize = 1000;

const NO_UNIQUE_KEY: &str = "Data consistency check is not supported for tables without a unique key";

/// Comparison algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckAlgorithm {
    /// Compare every column of every row.
    DataMatch,
    /// Compare row counts only.
    RecordCount,
}

impl CheckAlgorithm {
    /// Type name, as configured and reported.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DataMatch => "DATA_MATCH",
            Self::RecordCount => "RECORD_COUNT",
        }
    }
}

impl FromStr for CheckAlgorithm {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DATA_MATCH" => Ok(Self::DataMatch),
            "RECORD_COUNT" => Ok(Self::RecordCount),
            _ => Err(ConfigError::Unsupported {
                kind: "consistency check algorithm",
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for CheckAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of checking one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCheckResult {
    /// Source rows compared. Partial when a mismatch stopped the check.
    pub source_records_count: u64,
    /// Target rows compared.
    pub target_records_count: u64,
    /// Whether every compared chunk matched.
    pub matched: bool,
    /// Why the table was skipped, if it was.
    #[serde(default)]
    pub ignored_reason: Option<String>,
}

impl TableCheckResult {
    /// A skipped table.
    #[must_use]
    pub fn ignored(reason: impl Into<String>) -> Self {
        Self {
            source_records_count: 0,
            target_records_count: 0,
            matched: false,
            ignored_reason: Some(reason.into()),
        }
    }

    /// Whether the table was skipped.
    #[must_use]
    pub fn is_ignored(&self) -> bool {
        self.ignored_reason.is_some()
    }
}

/// Persisted state of one consistency check job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyCheckProgress {
    /// Current status.
    pub status: JobStatus,
    /// Whether the check task is running.
    pub active: bool,
    /// Comma-separated tables being checked, ignored ones included.
    pub table_names: String,
    /// Comma-separated ignored tables.
    pub ignored_table_names: String,
    /// Source rows compared so far; unset until the check has prepared.
    #[serde(default)]
    pub checked_records_count: Option<u64>,
    /// Estimated source rows of the checked tables.
    #[serde(default)]
    pub records_count: Option<u64>,
    /// Start time, epoch milliseconds.
    pub check_begin_time_ms: i64,
    /// Completion time, set when finished.
    #[serde(default)]
    pub check_end_time_ms: Option<i64>,
    /// Stop time, set when stopped before completion.
    #[serde(default)]
    pub stop_time_ms: Option<i64>,
    /// Algorithm type name.
    pub algorithm_type: String,
    /// Algorithm properties.
    #[serde(default)]
    pub algorithm_props: Properties,
    /// Failure description.
    #[serde(default)]
    pub error_message: Option<String>,
}

/// One side of a check: where rows come from and how to query them.
#[derive(Clone)]
pub struct CheckEndpoint {
    data_source: Arc<dyn DataSource>,
    metadata: Arc<dyn TableMetadataLoader>,
    dialect: Dialect,
}

impl CheckEndpoint {
    /// Creates an endpoint.
    #[must_use]
    pub fn new(
        data_source: Arc<dyn DataSource>,
        metadata: Arc<dyn TableMetadataLoader>,
        dialect: Dialect,
    ) -> Self {
        Self {
            data_source,
            metadata,
            dialect,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn read_chunk(
        &self,
        connection: &mut dyn SourceConnection,
        schema: Option<&str>,
        table: &str,
        columns: &[String],
        key: &ColumnMetadata,
        lower: &KeyBound,
        upper: Option<&UniqueKeyValue>,
        limit: usize,
    ) -> Result<Vec<Vec<ColumnValue>>, SourceError> {
        let mut statement = self.dialect.query_builder().range_scan(&RangeScan {
            schema,
            table,
            columns,
            key_column: &key.name,
            key_type: key.column_type,
            lower,
            upper,
            limit,
        });
        statement.fetch_size = limit;
        let mut cursor = connection.query(&statement).await?;
        let projection = columns
            .iter()
            .map(|name| {
                cursor
                    .columns()
                    .iter()
                    .position(|c| &c.name == name)
                    .map(|i| (i, cursor.columns()[i].clone()))
                    .ok_or_else(|| {
                        SourceError::Metadata(format!("column {name} missing from {table}"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let reader = self.dialect.column_reader();
        let mut rows = Vec::new();
        while cursor.next().await? {
            let mut row = Vec::with_capacity(projection.len());
            for (index, column) in &projection {
                row.push(reader.read(cursor.as_mut(), column, *index)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

impl fmt::Debug for CheckEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckEndpoint")
            .field("data_source", &self.data_source.name())
            .field("dialect", &self.dialect.name())
            .finish_non_exhaustive()
    }
}

/// Compares source and target tables chunk by chunk.
#[derive(Debug, Clone)]
pub struct DataConsistencyChecker {
    algorithm: CheckAlgorithm,
    props: Properties,
    chunk_size: usize,
    source: CheckEndpoint,
    target: CheckEndpoint,
}

impl DataConsistencyChecker {
    /// Creates a checker.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for an unknown algorithm or a malformed
    /// `chunk-size`.
    pub fn new(
        algorithm_type: &str,
        props: Properties,
        source: CheckEndpoint,
        target: CheckEndpoint,
    ) -> Result<Self, ConfigError> {
        let algorithm = algorithm_type.parse()?;
        let chunk_size = match props.get_parsed::<usize>(CHUNK_SIZE_KEY)? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    key: CHUNK_SIZE_KEY.to_string(),
                    value: "0".to_string(),
                    message: "must be positive".to_string(),
                })
            }
            Some(n) => n,
            None => DEFAULT_CHUNK_SIZE,
        };
        Ok(Self {
            algorithm,
            props,
            chunk_size,
            source,
            target,
        })
    }

    /// Configured algorithm.
    #[must_use]
    pub fn algorithm(&self) -> CheckAlgorithm {
        self.algorithm
    }

    /// Algorithm properties.
    #[must_use]
    pub fn props(&self) -> &Properties {
        &self.props
    }

    /// Loads the source metadata of `table`.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Source` if the metadata cannot be loaded.
    pub async fn source_metadata(&self, table: &TableRef) -> Result<TableMetadata, JobError> {
        Ok(self
            .source
            .metadata
            .load(table.schema.as_deref(), &table.name)
            .await?)
    }

    /// Why `metadata` cannot be checked, if it cannot.
    #[must_use]
    pub fn ignore_reason(metadata: &TableMetadata) -> Option<String> {
        match metadata.unique_key_column() {
            None => Some(NO_UNIQUE_KEY.to_string()),
            Some(key) if !key.is_range_key() => {
                Some(format!(
                    "Data consistency check is not supported for unique key {} of type {}",
                    key.name, key.type_name
                ))
            }
            Some(_) => None,
        }
    }

    /// Checks one table. `on_chunk` is called with the source rows of each
    /// compared chunk. Returns `None` if `cancel` fired first.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Source` on read failure.
    pub async fn check_table(
        &self,
        table: &TableRef,
        source_metadata: &TableMetadata,
        on_chunk: &mut (dyn FnMut(u64) + Send),
        cancel: &CancellationToken,
    ) -> Result<Option<TableCheckResult>, JobError> {
        if let Some(reason) = Self::ignore_reason(source_metadata) {
            return Ok(Some(TableCheckResult::ignored(reason)));
        }
        let Some(key) = source_metadata.unique_key_column() else {
            return Ok(Some(TableCheckResult::ignored(NO_UNIQUE_KEY)));
        };
        let columns = source_metadata.column_names();
        let Some(key_pos) = columns.iter().position(|c| c == &key.name) else {
            return Ok(Some(TableCheckResult::ignored(NO_UNIQUE_KEY)));
        };
        let schema = table.schema.as_deref();
        let mut source_conn = self.source.data_source.connection().await?;
        let mut target_conn = self.target.data_source.connection().await?;

        let mut result = TableCheckResult {
            source_records_count: 0,
            target_records_count: 0,
            matched: true,
            ignored_reason: None,
        };
        let mut lower = KeyBound::Unbounded;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let source_rows = self
                .source
                .read_chunk(
                    source_conn.as_mut(),
                    schema,
                    &table.name,
                    &columns,
                    key,
                    &lower,
                    None,
                    self.chunk_size,
                )
                .await?;
            let full = source_rows.len() == self.chunk_size;
            let upper = match source_rows.last() {
                Some(row) if full => Some(row[key_pos].to_unique_key().ok_or_else(|| {
                    SourceError::Read {
                        index: key_pos,
                        message: format!(
                            "{}.{} value {} is not a range key",
                            table.name, key.name, row[key_pos]
                        ),
                    }
                })?),
                _ => None,
            };
            // One extra row exposes surplus target rows in the final chunk.
            let target_rows = self
                .target
                .read_chunk(
                    target_conn.as_mut(),
                    schema,
                    table.logic_name(),
                    &columns,
                    key,
                    &lower,
                    upper.as_ref(),
                    self.chunk_size + 1,
                )
                .await?;

            result.source_records_count += source_rows.len() as u64;
            result.target_records_count += target_rows.len() as u64;
            on_chunk(source_rows.len() as u64);

            if !self.chunk_matches(&source_rows, &target_rows) {
                result.matched = false;
                tracing::info!(
                    table = %table.name,
                    algorithm = %self.algorithm,
                    lower = ?lower,
                    "Consistency check mismatch"
                );
                return Ok(Some(result));
            }
            match upper {
                Some(last) => lower = KeyBound::Exclusive(last),
                None => return Ok(Some(result)),
            }
        }
    }

    fn chunk_matches(&self, source: &[Vec<ColumnValue>], target: &[Vec<ColumnValue>]) -> bool {
        if source.len() != target.len() {
            return false;
        }
        match self.algorithm {
            CheckAlgorithm::RecordCount => true,
            CheckAlgorithm::DataMatch => source.iter().zip(target).all(|(s, t)| {
                s.len() == t.len() && s.iter().zip(t).all(|(a, b)| a.content_eq(b))
            }),
        }
    }
}

/// Handle to a running consistency check.
#[derive(Debug)]
pub struct ConsistencyCheckHandle {
    check_job_id: String,
    cancel: CancellationToken,
    join: JoinHandle<Result<(), JobError>>,
}

impl ConsistencyCheckHandle {
    /// Id of the check job.
    #[must_use]
    pub fn check_job_id(&self) -> &str {
        &self.check_job_id
    }

    /// Requests a stop at the next chunk boundary.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Waits for the check to end.
    ///
    /// # Errors
    ///
    /// Returns the check's failure, or `JobError::TaskPanicked` if its task
    /// panicked.
    pub async fn join(self) -> Result<(), JobError> {
        let check_job_id = self.check_job_id;
        self.join.await.map_err(|e| JobError::TaskPanicked {
            task: format!("consistency check {check_job_id}"),
            message: e.to_string(),
        })?
    }
}

/// Starts, drops and reads consistency check jobs.
#[derive(Debug, Clone)]
pub struct ConsistencyCheckJob {
    repository: JobRepository,
}

impl ConsistencyCheckJob {
    /// Creates the check job API over `repository`.
    #[must_use]
    pub fn new(repository: JobRepository) -> Self {
        Self { repository }
    }

    /// Starts a check of `tables` for `parent_job_id`.
    ///
    /// # Errors
    ///
    /// Returns `JobError::CheckInProgress` if the latest check has not
    /// finished, or `JobError::Store` on persistence failure.
    pub fn start(
        &self,
        parent_job_id: &str,
        tables: Vec<TableRef>,
        checker: DataConsistencyChecker,
    ) -> Result<ConsistencyCheckHandle, JobError> {
        let latest = self.repository.latest_check_id(parent_job_id)?;
        if let Some(latest) = &latest {
            let finished = self
                .repository
                .load_check_progress(parent_job_id, latest)?
                .is_some_and(|p| p.status == JobStatus::Finished);
            if !finished {
                tracing::info!(job_id = parent_job_id, check_job_id = %latest, "Unfinished consistency check exists");
                return Err(JobError::CheckInProgress {
                    job_id: parent_job_id.to_string(),
                    check_job_id: latest.clone(),
                });
            }
        }
        let check_job_id = next_check_job_id(parent_job_id, latest.as_deref());
        self.repository.delete_check(parent_job_id, &check_job_id)?;
        self.repository
            .set_latest_check_id(parent_job_id, &check_job_id)?;

        let progress = ConsistencyCheckProgress {
            status: JobStatus::Running,
            active: true,
            table_names: tables
                .iter()
                .map(TableRef::logic_name)
                .collect::<Vec<_>>()
                .join(","),
            ignored_table_names: String::new(),
            checked_records_count: None,
            records_count: None,
            check_begin_time_ms: chrono::Utc::now().timestamp_millis(),
            check_end_time_ms: None,
            stop_time_ms: None,
            algorithm_type: checker.algorithm().as_str().to_string(),
            algorithm_props: checker.props().clone(),
            error_message: None,
        };
        self.repository
            .save_check_progress(parent_job_id, &check_job_id, &progress)?;
        tracing::info!(job_id = parent_job_id, check_job_id = %check_job_id, algorithm = %checker.algorithm(), "Consistency check started");

        let cancel = CancellationToken::new();
        let task = CheckTask {
            repository: self.repository.clone(),
            parent_job_id: parent_job_id.to_string(),
            check_job_id: check_job_id.clone(),
            tables,
            checker,
            cancel: cancel.clone(),
        };
        let join = tokio::spawn(task.run(progress));
        Ok(ConsistencyCheckHandle {
            check_job_id,
            cancel,
            join,
        })
    }

    /// Removes the latest check; the previous one, if still stored,
    /// becomes the latest.
    ///
    /// # Errors
    ///
    /// Returns `JobError::CheckNotFound` without a check, and
    /// `JobError::CheckInProgress` while it is still running.
    pub fn drop_latest(&self, parent_job_id: &str) -> Result<(), JobError> {
        let Some(latest) = self.repository.latest_check_id(parent_job_id)? else {
            return Err(JobError::CheckNotFound(parent_job_id.to_string()));
        };
        if self
            .repository
            .load_check_progress(parent_job_id, &latest)?
            .is_some_and(|p| p.active)
        {
            return Err(JobError::CheckInProgress {
                job_id: parent_job_id.to_string(),
                check_job_id: latest,
            });
        }
        self.repository.delete_check(parent_job_id, &latest)?;
        match previous_check_job_id(parent_job_id, &latest) {
            Some(previous)
                if self
                    .repository
                    .load_check_progress(parent_job_id, &previous)?
                    .is_some() =>
            {
                self.repository
                    .set_latest_check_id(parent_job_id, &previous)?;
            }
            _ => self.repository.clear_latest_check_id(parent_job_id)?,
        }
        tracing::info!(job_id = parent_job_id, check_job_id = %latest, "Consistency check dropped");
        Ok(())
    }

    /// Latest check id, progress and results, if a check exists.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Store` on persistence failure.
    #[allow(clippy::type_complexity)]
    pub fn latest(
        &self,
        parent_job_id: &str,
    ) -> Result<
        Option<(
            String,
            Option<ConsistencyCheckProgress>,
            BTreeMap<String, TableCheckResult>,
        )>,
        JobError,
    > {
        let Some(check_job_id) = self.repository.latest_check_id(parent_job_id)? else {
            return Ok(None);
        };
        let progress = self
            .repository
            .load_check_progress(parent_job_id, &check_job_id)?;
        let results = self
            .repository
            .load_check_results(parent_job_id, &check_job_id)?;
        Ok(Some((check_job_id, progress, results)))
    }
}

fn next_check_job_id(parent_job_id: &str, latest: Option<&str>) -> String {
    let sequence = latest
        .and_then(|id| id.strip_prefix(parent_job_id))
        .and_then(|s| s.parse::<u32>().ok())
        .map_or(1, |s| s + 1);
    format!("{parent_job_id}{sequence}")
}

fn previous_check_job_id(parent_job_id: &str, check_job_id: &str) -> Option<String> {
    let sequence = check_job_id
        .strip_prefix(parent_job_id)?
        .parse::<u32>()
        .ok()?;
    (sequence > 1).then(|| format!("{parent_job_id}{}", sequence - 1))
}

struct CheckTask {
    repository: JobRepository,
    parent_job_id: String,
    check_job_id: String,
    tables: Vec<TableRef>,
    checker: DataConsistencyChecker,
    cancel: CancellationToken,
}

impl CheckTask {
    async fn run(self, mut progress: ConsistencyCheckProgress) -> Result<(), JobError> {
        let outcome = self.check_all(&mut progress).await;
        progress.active = false;
        let now = chrono::Utc::now().timestamp_millis();
        match &outcome {
            Ok(true) => {
                progress.status = JobStatus::Finished;
                progress.check_end_time_ms = Some(now);
                tracing::info!(check_job_id = %self.check_job_id, "Consistency check finished");
            }
            Ok(false) => {
                progress.status = JobStatus::Stopped;
                progress.stop_time_ms = Some(now);
                tracing::info!(check_job_id = %self.check_job_id, "Consistency check stopped");
            }
            Err(e) => {
                progress.status = JobStatus::ConsistencyCheckFailure;
                progress.error_message = Some(e.to_string());
                tracing::error!(check_job_id = %self.check_job_id, error = %e, "Consistency check failed");
            }
        }
        self.repository
            .save_check_progress(&self.parent_job_id, &self.check_job_id, &progress)?;
        outcome.map(|_| ())
    }

    /// Returns `Ok(false)` when cancelled.
    async fn check_all(&self, progress: &mut ConsistencyCheckProgress) -> Result<bool, JobError> {
        let mut results = BTreeMap::new();
        let mut pending = Vec::new();
        let mut ignored = Vec::new();
        let mut records_count = 0u64;
        for table in &self.tables {
            let metadata = self.checker.source_metadata(table).await?;
            match DataConsistencyChecker::ignore_reason(&metadata) {
                Some(reason) => {
                    tracing::info!(table = %table.name, reason = %reason, "Table ignored by consistency check");
                    ignored.push(table.logic_name().to_string());
                    results.insert(table.logic_name().to_string(), TableCheckResult::ignored(reason));
                }
                None => {
                    records_count += metadata.estimated_rows.unwrap_or(0);
                    pending.push((table, metadata));
                }
            }
        }
        progress.ignored_table_names = ignored.join(",");
        progress.records_count = Some(records_count);
        progress.checked_records_count = Some(0);
        self.save(progress, &results)?;

        for (table, metadata) in pending {
            let mut checked = progress.checked_records_count.unwrap_or(0);
            let mut on_chunk = |rows: u64| {
                checked += rows;
                let mut snapshot = progress.clone();
                snapshot.checked_records_count = Some(checked);
                if let Err(e) = self.repository.save_check_progress(
                    &self.parent_job_id,
                    &self.check_job_id,
                    &snapshot,
                ) {
                    tracing::warn!(check_job_id = %self.check_job_id, error = %e, "Failed to persist check progress");
                }
            };
            let outcome = self
                .checker
                .check_table(table, &metadata, &mut on_chunk, &self.cancel)
                .await?;
            progress.checked_records_count = Some(checked);
            let Some(result) = outcome else {
                self.save(progress, &results)?;
                return Ok(false);
            };
            tracing::info!(
                table = %table.name,
                matched = result.matched,
                source_rows = result.source_records_count,
                target_rows = result.target_records_count,
                "Table checked"
            );
            results.insert(table.logic_name().to_string(), result);
            self.save(progress, &results)?;
        }
        Ok(true)
    }

    fn save(
        &self,
        progress: &ConsistencyCheckProgress,
        results: &BTreeMap<String, TableCheckResult>,
    ) -> Result<(), JobError> {
        self.repository
            .save_check_results(&self.parent_job_id, &self.check_job_id, results)?;
        self.repository
            .save_check_progress(&self.parent_job_id, &self.check_job_id, progress)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryProgressStore;
    use tidewater_connectors::testing::{order_row, orders_table, MemoryDataSource};
    use tidewater_core::metadata::ColumnType;

    fn endpoint(source: &MemoryDataSource) -> CheckEndpoint {
        CheckEndpoint::new(
            Arc::new(source.clone()),
            Arc::new(source.clone()),
            Dialect::standard(),
        )
    }

    fn pair(rows: i64) -> (MemoryDataSource, MemoryDataSource) {
        let source = MemoryDataSource::new("source");
        let target = MemoryDataSource::new("target");
        for ds in [&source, &target] {
            ds.create_table(orders_table());
            ds.insert_orders(1..=rows);
        }
        (source, target)
    }

    fn checker(
        algorithm: &str,
        chunk: &str,
        source: &MemoryDataSource,
        target: &MemoryDataSource,
    ) -> DataConsistencyChecker {
        DataConsistencyChecker::new(
            algorithm,
            Properties::from_pairs([(CHUNK_SIZE_KEY, chunk)]),
            endpoint(source),
            endpoint(target),
        )
        .unwrap()
    }

    async fn check(checker: &DataConsistencyChecker, source: &MemoryDataSource) -> TableCheckResult {
        let table = TableRef::new("orders");
        let metadata = source.table_metadata("orders").unwrap();
        checker
            .check_table(&table, &metadata, &mut |_| {}, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_tables_match() {
        let (source, target) = pair(250);
        let result = check(&checker("DATA_MATCH", "100", &source, &target), &source).await;
        assert!(result.matched);
        assert_eq!(result.source_records_count, 250);
        assert_eq!(result.target_records_count, 250);
    }

    #[tokio::test]
    async fn test_changed_value_detected_by_data_match_only() {
        let (source, target) = pair(250);
        target.update_cell(
            "orders",
            &UniqueKeyValue::Integer(170),
            "status",
            ColumnValue::Text("LOST".into()),
        );
        assert!(!check(&checker("DATA_MATCH", "100", &source, &target), &source).await.matched);
        assert!(check(&checker("RECORD_COUNT", "100", &source, &target), &source).await.matched);
    }

    #[tokio::test]
    async fn test_missing_and_surplus_target_rows() {
        let (source, target) = pair(250);
        target.delete("orders", &UniqueKeyValue::Integer(42));
        assert!(!check(&checker("RECORD_COUNT", "100", &source, &target), &source).await.matched);

        let (source, target) = pair(250);
        target.insert("orders", order_row(251));
        assert!(!check(&checker("RECORD_COUNT", "100", &source, &target), &source).await.matched);
    }

    #[tokio::test]
    async fn test_table_without_unique_key_is_ignored() {
        let (source, target) = pair(0);
        let logs = TableMetadata::new("logs", vec![ColumnMetadata::new("line", ColumnType::VarChar)]);
        let result = checker("DATA_MATCH", "10", &source, &target)
            .check_table(&TableRef::new("logs"), &logs, &mut |_| {}, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ignored());
        assert_eq!(result.ignored_reason.as_deref(), Some(NO_UNIQUE_KEY));
    }

    #[tokio::test]
    async fn test_unsigned_bigint_key_is_ignored() {
        let source = MemoryDataSource::new("source");
        let target = MemoryDataSource::new("target");
        let big = TableMetadata::new(
            "big",
            vec![
                ColumnMetadata::new("id", ColumnType::BigInt).unsigned(),
                ColumnMetadata::new("v", ColumnType::VarChar),
            ],
        )
        .with_unique_key(&["id"]);
        for ds in [&source, &target] {
            ds.create_table(big.clone());
            ds.insert_rows("big", (1..=250).map(|i| vec![ColumnValue::Int64(i), ColumnValue::Text("a".into())]));
        }
        let result = checker("DATA_MATCH", "100", &source, &target)
            .check_table(&TableRef::new("big"), &big, &mut |_| {}, &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ignored());
        assert!(result.ignored_reason.unwrap().contains("BIGINT"));
        assert!(source.query_log().is_empty());
        assert!(target.query_log().is_empty());
    }

    #[test]
    fn test_checker_config_errors() {
        let (source, target) = pair(0);
        assert!(DataConsistencyChecker::new("CRC32_MATCH", Properties::new(), endpoint(&source), endpoint(&target)).is_err());
        assert!(DataConsistencyChecker::new(
            "data_match",
            Properties::from_pairs([(CHUNK_SIZE_KEY, "0")]),
            endpoint(&source),
            endpoint(&target)
        )
        .is_err());
    }

    #[test]
    fn test_check_job_id_sequence() {
        assert_eq!(next_check_job_id("j1", None), "j11");
        assert_eq!(next_check_job_id("j1", Some("j11")), "j12");
        assert_eq!(previous_check_job_id("j1", "j12").as_deref(), Some("j11"));
        assert_eq!(previous_check_job_id("j1", "j11"), None);
    }

    #[tokio::test]
    async fn test_job_start_finish_and_sequence() {
        let (source, target) = pair(120);
        let job = ConsistencyCheckJob::new(JobRepository::new(Arc::new(InMemoryProgressStore::new())));
        let handle = job
            .start("j1", vec![TableRef::new("orders")], checker("DATA_MATCH", "50", &source, &target))
            .unwrap();
        assert_eq!(handle.check_job_id(), "j11");
        handle.join().await.unwrap();

        let (id, progress, results) = job.latest("j1").unwrap().unwrap();
        assert_eq!(id, "j11");
        let progress = progress.unwrap();
        assert_eq!(progress.status, JobStatus::Finished);
        assert_eq!(progress.checked_records_count, Some(120));
        assert_eq!(progress.records_count, Some(120));
        assert!(results["orders"].matched);

        let second = job
            .start("j1", vec![TableRef::new("orders")], checker("RECORD_COUNT", "50", &source, &target))
            .unwrap();
        assert_eq!(second.check_job_id(), "j12");
        second.join().await.unwrap();

        job.drop_latest("j1").unwrap();
        assert_eq!(job.latest("j1").unwrap().unwrap().0, "j11");
        job.drop_latest("j1").unwrap();
        assert!(job.latest("j1").unwrap().is_none());
        assert!(matches!(job.drop_latest("j1"), Err(JobError::CheckNotFound(_))));
    }

    #[tokio::test]
    async fn test_unfinished_check_blocks_new_one() {
        let (source, target) = pair(10);
        source.fail_query(2);
        let job = ConsistencyCheckJob::new(JobRepository::new(Arc::new(InMemoryProgressStore::new())));
        let handle = job
            .start("j1", vec![TableRef::new("orders")], checker("DATA_MATCH", "5", &source, &target))
            .unwrap();
        assert!(handle.join().await.is_err());
        let (_, progress, _) = job.latest("j1").unwrap().unwrap();
        let progress = progress.unwrap();
        assert_eq!(progress.status, JobStatus::ConsistencyCheckFailure);
        assert!(progress.error_message.is_some());

        let err = job
            .start("j1", vec![TableRef::new("orders")], checker("DATA_MATCH", "5", &source, &target))
            .unwrap_err();
        assert!(matches!(err, JobError::CheckInProgress { ref check_job_id, .. } if check_job_id == "j11"));
    }
}
