//! Inventory (full table snapshot) dumper.
//!
//! ```text
//!   ┌──────────────── round N ────────────────┐
//!   │ rate limiter ─► range query ─► rows ─┐  │
//!   │                                      ▼  │
//!   │        ColumnValueReader ─► DataRecord ─┼─► channel
//!   └──────────────────────────────────────┬──┘
//!                  0 rows? ── yes ─► Record::Finished
//!                    │ no
//!           advance position, check stop, next round
//! ```
//!
//! With a usable unique key the table is read in key order, one page of
//! `batch_size` rows per round. The first page is bounded below
//! inclusively at `begin`; later pages exclusively at the last key seen,
//! so no boundary row is emitted twice. Every data record carries a
//! position at its own key. The dumper's committed position only
//! advances at page boundaries, and a stop request is honored there.
//!
//! Without a unique key the table is read in one unordered pass under a
//! [`IngestPosition::Placeholder`] position and cannot resume mid-way.

use std::sync::Arc;

use tokio::sync::watch;

use tidewater_core::channel::RecordSender;
use tidewater_core::error::{IngestError, SourceError};
use tidewater_core::metadata::{ColumnMetadata, TableMetadata};
use tidewater_core::position::{IngestPosition, PrimaryKeyPosition, UniqueKeyValue};
use tidewater_core::rate_limit::{OperationKind, RateLimiter};
use tidewater_core::record::{Column, DataRecord, Record, RecordKind};
use tidewater_core::source::{RowCursor, SourceConnection, Statement};

use crate::dialect::{Dialect, RangeScan};
use crate::lifecycle::Lifecycle;

/// Rounds between progress log lines.
const PROGRESS_LOG_INTERVAL: u64 = 50;

/// Default rows per page.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Inventory dumper configuration for one job item.
#[derive(Clone)]
pub struct InventoryDumperConfig {
    /// Metadata of the physical table being read.
    pub table: TableMetadata,
    /// Table name written into records (the logical name).
    pub logic_table_name: String,
    /// Position to start from.
    pub position: IngestPosition,
    /// Rows per page.
    pub batch_size: usize,
    /// Driver fetch-size hint. `None` uses `batch_size`.
    pub fetch_size: Option<usize>,
    /// Optional read throttle.
    pub rate_limiter: Option<Arc<dyn RateLimiter>>,
}

impl InventoryDumperConfig {
    /// Creates a configuration reading `table` from `position` with
    /// default batch size and no throttle.
    #[must_use]
    pub fn new(table: TableMetadata, position: IngestPosition) -> Self {
        Self {
            logic_table_name: table.name.clone(),
            table,
            position,
            batch_size: DEFAULT_BATCH_SIZE,
            fetch_size: None,
            rate_limiter: None,
        }
    }
}

impl std::fmt::Debug for InventoryDumperConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryDumperConfig")
            .field("table", &self.table.name)
            .field("logic_table_name", &self.logic_table_name)
            .field("position", &self.position.to_string())
            .field("batch_size", &self.batch_size)
            .field("fetch_size", &self.fetch_size)
            .field("rate_limited", &self.rate_limiter.is_some())
            .finish()
    }
}

enum ScanPlan {
    /// Key-ordered pages.
    Range {
        key: ColumnMetadata,
        key_index: usize,
        range: PrimaryKeyPosition,
    },
    /// One unordered pass.
    Unordered,
    /// Already finished.
    Done,
}

/// Full-table snapshot dumper for one job item.
pub struct InventoryDumper {
    config: InventoryDumperConfig,
    plan: ScanPlan,
    dialect: Dialect,
    connection: Box<dyn SourceConnection>,
    channel: RecordSender,
    lifecycle: Arc<Lifecycle>,
    position_tx: watch::Sender<IngestPosition>,
}

impl InventoryDumper {
    /// Validates the configuration and creates a dumper.
    ///
    /// The connection is owned exclusively by this dumper.
    ///
    /// # Errors
    ///
    /// - `IngestError::UnsupportedKeyType` if the unique key cannot bound a
    ///   range scan (see [`ColumnMetadata::is_range_key`]).
    /// - `IngestError::UnsupportedConfiguration` if the position does not
    ///   fit the table (a range on a table without unique key, range bounds
    ///   of the wrong key kind, a log position) or `batch_size` is zero.
    pub fn new(
        config: InventoryDumperConfig,
        dialect: Dialect,
        connection: Box<dyn SourceConnection>,
        channel: RecordSender,
    ) -> Result<Self, IngestError> {
        if config.batch_size == 0 {
            return Err(IngestError::UnsupportedConfiguration(
                "batch size must be positive".into(),
            ));
        }
        let plan = Self::plan(&config)?;
        let (position_tx, _) = watch::channel(config.position.clone());
        Ok(Self {
            config,
            plan,
            dialect,
            connection,
            channel,
            lifecycle: Arc::new(Lifecycle::new()),
            position_tx,
        })
    }

    fn plan(config: &InventoryDumperConfig) -> Result<ScanPlan, IngestError> {
        let table = &config.table;
        let key = table.unique_key_column();
        let range = match (&config.position, key) {
            (IngestPosition::Finished, _) => return Ok(ScanPlan::Done),
            (IngestPosition::Placeholder, _) => return Ok(ScanPlan::Unordered),
            (IngestPosition::Log(_), _) => {
                return Err(IngestError::UnsupportedConfiguration(format!(
                    "log position {} cannot drive an inventory scan of {}",
                    config.position, table.name
                )));
            }
            (IngestPosition::PrimaryKeyRange(_), None) => {
                return Err(IngestError::UnsupportedConfiguration(format!(
                    "range position on table {} without unique key",
                    table.name
                )));
            }
            (IngestPosition::PrimaryKeyRange(range), Some(_)) => range.clone(),
        };
        let Some(key) = key else {
            return Ok(ScanPlan::Unordered);
        };
        let integer = key.column_type.is_integer();
        if !key.is_range_key() {
            return Err(IngestError::UnsupportedKeyType {
                table: table.name.clone(),
                column: key.name.clone(),
                type_name: key.type_name.clone(),
            });
        }
        let mismatched = [&range.begin, &range.end, &range.current]
            .into_iter()
            .flatten()
            .any(|v| matches!(v, UniqueKeyValue::Integer(_)) != integer);
        if mismatched {
            return Err(IngestError::UnsupportedConfiguration(format!(
                "position {} does not match key {}.{} ({})",
                config.position, table.name, key.name, key.type_name
            )));
        }
        let key_index = table.column_index(&key.name).ok_or_else(|| {
            IngestError::UnsupportedConfiguration(format!(
                "unique key {} is not a column of {}",
                key.name, table.name
            ))
        })?;
        Ok(ScanPlan::Range {
            key: key.clone(),
            key_index,
            range,
        })
    }

    /// Shares an externally owned lifecycle (e.g. a job item's stop flag).
    #[must_use]
    pub fn with_lifecycle(mut self, lifecycle: Arc<Lifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// The lifecycle controlling this dumper.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<Lifecycle> {
        Arc::clone(&self.lifecycle)
    }

    /// Watches the committed position, updated after every full page.
    #[must_use]
    pub fn subscribe_position(&self) -> watch::Receiver<IngestPosition> {
        self.position_tx.subscribe()
    }

    /// Returns `true` if this dumper can be stopped and resumed mid-scan.
    #[must_use]
    pub fn is_resumable(&self) -> bool {
        !matches!(self.plan, ScanPlan::Unordered)
    }

    /// Runs the scan to completion, stop, or failure.
    ///
    /// Returns the committed position: `Finished` after natural
    /// completion, the last page boundary after a stop. An already
    /// finished position returns immediately without reading or pushing
    /// anything.
    ///
    /// # Errors
    ///
    /// Returns `IngestError::Dump` if a page read fails. The sentinel is
    /// still pushed first so the consumer never waits forever.
    pub async fn run(mut self) -> Result<IngestPosition, IngestError> {
        let table = self.config.table.name.clone();
        let plan = std::mem::replace(&mut self.plan, ScanPlan::Done);
        if matches!(plan, ScanPlan::Done) {
            tracing::info!(table = %table, "Inventory already finished, skipping");
            self.lifecycle.mark_finished();
            return Ok(IngestPosition::Finished);
        }
        if !self.lifecycle.start() {
            tracing::debug!(table = %table, state = ?self.lifecycle.state(), "Inventory dumper not started");
            self.lifecycle.mark_stopped();
            return Ok(self.config.position.clone());
        }
        tracing::debug!(table = %table, position = %self.config.position, "Inventory dump started");

        let result = match plan {
            ScanPlan::Range {
                key,
                key_index,
                range,
            } => self.dump_range(&key, key_index, range).await,
            ScanPlan::Unordered | ScanPlan::Done => self.dump_unordered().await,
        };
        match result {
            Ok(position) => Ok(position),
            Err(e) => {
                tracing::error!(table = %table, error = %e, "Inventory dump failed");
                if let Err(push_err) = self.channel.push(Record::Finished).await {
                    tracing::debug!(table = %table, error = %push_err, "Could not push sentinel after failure");
                }
                self.lifecycle.mark_stopped();
                Err(e)
            }
        }
    }

    async fn dump_range(
        &mut self,
        key: &ColumnMetadata,
        key_index: usize,
        mut range: PrimaryKeyPosition,
    ) -> Result<IngestPosition, IngestError> {
        let table = self.config.table.name.clone();
        let columns = self.config.table.column_names();
        let mut round: u64 = 0;
        let mut total_rows: u64 = 0;
        loop {
            round += 1;
            if let Some(limiter) = &self.config.rate_limiter {
                limiter.intercept(OperationKind::Select, 1).await;
            }
            let lower = range.lower_bound();
            let mut statement = self.dialect.query_builder().range_scan(&RangeScan {
                schema: self.config.table.schema.as_deref(),
                table: &table,
                columns: &columns,
                key_column: &key.name,
                key_type: key.column_type,
                lower: &lower,
                upper: range.end.as_ref(),
                limit: self.config.batch_size,
            });
            statement.fetch_size = self.fetch_size();

            let committed = IngestPosition::PrimaryKeyRange(range.clone());
            let (rows, max_key) = self
                .dump_page(&statement, key_index, &range, round, &committed)
                .await?;

            if rows == 0 {
                self.channel.push(Record::Finished).await?;
                self.position_tx.send_replace(IngestPosition::Finished);
                self.lifecycle.mark_finished();
                tracing::info!(table = %table, rounds = round, rows = total_rows, "Inventory dump done");
                return Ok(IngestPosition::Finished);
            }
            total_rows += rows;
            if let Some(max_key) = max_key {
                range.advance(max_key);
            }
            let position = IngestPosition::PrimaryKeyRange(range.clone());
            self.position_tx.send_replace(position.clone());
            if round % PROGRESS_LOG_INTERVAL == 0 {
                tracing::info!(table = %table, round, rows = total_rows, position = %position, "Inventory dump progress");
            }
            if !self.lifecycle.is_running() {
                tracing::info!(table = %table, round, position = %position, "Inventory dump stopped");
                self.lifecycle.mark_stopped();
                return Ok(position);
            }
        }
    }

    /// Reads one page and pushes its rows. Returns the row count and the
    /// largest key seen.
    async fn dump_page(
        &mut self,
        statement: &Statement,
        key_index: usize,
        range: &PrimaryKeyPosition,
        round: u64,
        committed: &IngestPosition,
    ) -> Result<(u64, Option<UniqueKeyValue>), IngestError> {
        let table = self.config.table.name.as_str();
        let wrap = |e: SourceError| dump_error(table, round, committed, e);
        let mut cursor = self.connection.query(statement).await.map_err(wrap)?;
        let result_columns = self.result_columns(cursor.as_ref()).map_err(wrap)?;

        let mut rows = 0;
        let mut max_key: Option<UniqueKeyValue> = None;
        while cursor.next().await.map_err(wrap)? {
            let mut record = self
                .load_record(cursor.as_mut(), &result_columns, IngestPosition::Placeholder)
                .map_err(wrap)?;
            let key_column = &record.columns[key_index];
            let key = key_column.value.to_unique_key().ok_or_else(|| {
                wrap(SourceError::Read {
                    index: key_index,
                    message: format!("{} of {} is not a range key", key_column.value, key_column.name),
                })
            })?;
            record.position = IngestPosition::PrimaryKeyRange(range.at(key.clone()));
            if max_key.as_ref().map_or(true, |m| key.partial_cmp(m).is_some_and(std::cmp::Ordering::is_gt)) {
                max_key = Some(key);
            }
            self.channel.push(Record::Data(record)).await?;
            rows += 1;
        }
        Ok((rows, max_key))
    }

    async fn dump_unordered(&mut self) -> Result<IngestPosition, IngestError> {
        let table = self.config.table.name.clone();
        let batch_size = self.config.batch_size as u64;
        if let Some(limiter) = &self.config.rate_limiter {
            limiter.intercept(OperationKind::Select, 1).await;
        }
        let mut statement = self.dialect.query_builder().full_scan(
            self.config.table.schema.as_deref(),
            &table,
            &self.config.table.column_names(),
        );
        statement.fetch_size = self.fetch_size();

        let placeholder = IngestPosition::Placeholder;
        let mut cursor = self
            .connection
            .query(&statement)
            .await
            .map_err(|e| dump_error(&table, 1, &placeholder, e))?;
        let result_columns = self
            .result_columns(cursor.as_ref())
            .map_err(|e| dump_error(&table, 1, &placeholder, e))?;

        let mut rows: u64 = 0;
        loop {
            let round = rows / batch_size + 1;
            let wrap = |e: SourceError| dump_error(&table, round, &placeholder, e);
            if !cursor.next().await.map_err(wrap)? {
                break;
            }
            let record = self
                .load_record(cursor.as_mut(), &result_columns, IngestPosition::Placeholder)
                .map_err(wrap)?;
            self.channel.push(Record::Data(record)).await?;
            rows += 1;
            if rows % batch_size == 0 {
                if let Some(limiter) = &self.config.rate_limiter {
                    limiter.intercept(OperationKind::Select, 1).await;
                }
                if !self.lifecycle.is_running() {
                    tracing::info!(table = %table, rows, "Unordered dump stopped; table has no unique key and restarts from scratch");
                    self.lifecycle.mark_stopped();
                    return Ok(IngestPosition::Placeholder);
                }
            }
        }
        self.channel.push(Record::Finished).await?;
        self.position_tx.send_replace(IngestPosition::Finished);
        self.lifecycle.mark_finished();
        tracing::info!(table = %table, rows, "Inventory dump done (unordered)");
        Ok(IngestPosition::Finished)
    }

    fn load_record(
        &self,
        cursor: &mut dyn RowCursor,
        columns: &[ColumnMetadata],
        position: IngestPosition,
    ) -> Result<DataRecord, SourceError> {
        let reader = self.dialect.column_reader();
        let mut record = DataRecord::new(
            RecordKind::Insert,
            self.config.logic_table_name.as_str(),
            position,
        );
        for (index, column) in columns.iter().enumerate() {
            let value = reader.read(cursor, column, index)?;
            let unique_key = self.config.table.is_unique_key(&column.name);
            record.push_column(Column::new(column.name.as_str(), value, unique_key));
        }
        Ok(record)
    }

    /// Result set metadata, which must line up with the selected columns.
    fn result_columns(&self, cursor: &dyn RowCursor) -> Result<Vec<ColumnMetadata>, SourceError> {
        let columns = cursor.columns();
        if columns.len() != self.config.table.columns.len() {
            return Err(SourceError::Metadata(format!(
                "{} returned {} columns, expected {}",
                self.config.table.name,
                columns.len(),
                self.config.table.columns.len()
            )));
        }
        Ok(columns.to_vec())
    }

    fn fetch_size(&self) -> usize {
        self.config.fetch_size.unwrap_or(self.config.batch_size)
    }
}

impl std::fmt::Debug for InventoryDumper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryDumper")
            .field("config", &self.config)
            .field("dialect", &self.dialect.name())
            .field("lifecycle", &self.lifecycle)
            .finish_non_exhaustive()
    }
}

fn dump_error(table: &str, round: u64, position: &IngestPosition, source: SourceError) -> IngestError {
    IngestError::Dump {
        table: table.to_string(),
        round,
        position: position.to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tidewater_core::channel::{create_channel, RecordReceiver};
    use tidewater_core::metadata::{ColumnType, TableMetadata};
    use tidewater_core::source::{DataSource, KeyBound, QueryShape};
    use tidewater_core::value::ColumnValue;

    use crate::lifecycle::LifecycleState;
    use crate::testing::{orders_table, MemoryDataSource};

    fn int(v: i64) -> Option<UniqueKeyValue> {
        Some(UniqueKeyValue::Integer(v))
    }

    async fn orders_source(rows: i64) -> MemoryDataSource {
        let source = MemoryDataSource::new("ds_0");
        source.create_table(orders_table());
        source.insert_orders(1..=rows);
        source
    }

    async fn build_dumper(
        source: &MemoryDataSource,
        config: InventoryDumperConfig,
        capacity: usize,
    ) -> (InventoryDumper, RecordReceiver) {
        let (tx, rx) = create_channel(capacity, None);
        let conn = source.connection().await.unwrap();
        let dumper = InventoryDumper::new(config, Dialect::standard(), conn, tx).unwrap();
        (dumper, rx)
    }

    async fn drain(rx: &mut RecordReceiver) -> Vec<Record> {
        let mut out = Vec::new();
        while let Some(record) = rx.recv().await {
            out.push(record);
        }
        out
    }

    fn keys(records: &[Record]) -> Vec<i64> {
        records
            .iter()
            .filter_map(Record::as_data)
            .map(|d| match d.unique_key() {
                Some(UniqueKeyValue::Integer(k)) => k,
                other => panic!("unexpected key {other:?}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_orders_example_pages_and_sentinel() {
        let source = orders_source(10_000).await;
        let config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::range(int(1), int(10_000)),
        );
        let (dumper, mut rx) = build_dumper(&source, config, 64).await;
        let task = tokio::spawn(dumper.run());
        let records = drain(&mut rx).await;
        assert_eq!(task.await.unwrap().unwrap(), IngestPosition::Finished);

        assert_eq!(records.len(), 10_001);
        assert!(records.last().unwrap().is_finished());
        assert_eq!(records.iter().filter(|r| r.is_finished()).count(), 1);
        assert_eq!(keys(&records), (1..=10_000).collect::<Vec<_>>());

        let log = source.query_log();
        assert_eq!(log.len(), 11);
        for (i, statement) in log.iter().enumerate() {
            let QueryShape::RangeScan { lower, upper, limit, .. } = &statement.shape else {
                panic!("expected range scan");
            };
            let expected = if i == 0 {
                KeyBound::Inclusive(UniqueKeyValue::Integer(1))
            } else {
                KeyBound::Exclusive(UniqueKeyValue::Integer(i as i64 * 1000))
            };
            assert_eq!(lower, &expected);
            assert_eq!(upper, &int(10_000));
            assert_eq!(*limit, 1000);
            assert_eq!(statement.fetch_size, 1000);
        }
    }

    #[tokio::test]
    async fn test_records_carry_per_row_positions() {
        let source = orders_source(5).await;
        let config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::range(int(1), int(5)),
        );
        let (dumper, mut rx) = build_dumper(&source, config, 16).await;
        dumper.run().await.unwrap();
        let records = drain(&mut rx).await;
        let third = records[2].as_data().unwrap();
        assert_eq!(third.kind, RecordKind::Insert);
        assert_eq!(third.table_name, "orders");
        assert_eq!(third.position.to_string(), "i,1,5,3");
        assert!(third.column("order_id").unwrap().unique_key);
        assert!(!third.column("status").unwrap().unique_key);
    }

    #[tokio::test]
    async fn test_fetch_size_hint_propagates() {
        let source = orders_source(10).await;
        let mut config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::range(None, None),
        );
        config.batch_size = 4;
        config.fetch_size = Some(2);
        let (dumper, mut rx) = build_dumper(&source, config, 64).await;
        dumper.run().await.unwrap();
        assert_eq!(drain(&mut rx).await.len(), 11);
        let log = source.query_log();
        assert_eq!(log.len(), 4);
        assert!(log.iter().all(|s| s.fetch_size == 2));
        assert_eq!(
            log[0].shape,
            QueryShape::RangeScan {
                table: "orders".into(),
                key_column: "order_id".into(),
                lower: KeyBound::Unbounded,
                upper: None,
                limit: 4,
            }
        );
    }

    #[tokio::test]
    async fn test_finished_position_is_a_no_op() {
        let source = orders_source(10).await;
        let config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::Finished,
        );
        let (dumper, mut rx) = build_dumper(&source, config, 16).await;
        let lifecycle = dumper.lifecycle();
        assert_eq!(dumper.run().await.unwrap(), IngestPosition::Finished);
        assert_eq!(lifecycle.state(), LifecycleState::Finished);
        assert!(source.query_log().is_empty());
        assert!(drain(&mut rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_stop_exits_at_page_boundary_and_resumes() {
        let source = orders_source(10_000).await;
        let table = source.table_metadata("orders").unwrap();
        let config = InventoryDumperConfig::new(table.clone(), IngestPosition::range(int(1), int(10_000)));
        let (dumper, mut rx) = build_dumper(&source, config, 10).await;
        let lifecycle = dumper.lifecycle();
        let task = tokio::spawn(dumper.run());

        let mut first_run = Vec::new();
        while first_run.len() < 1500 {
            first_run.push(rx.recv().await.unwrap());
        }
        lifecycle.stop();
        first_run.extend(drain(&mut rx).await);
        let stopped_at = task.await.unwrap().unwrap();

        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
        assert!(first_run.iter().all(|r| !r.is_finished()));
        assert_eq!(first_run.len(), 2000);
        assert_eq!(stopped_at.to_string(), "i,1,10000,2000");

        let resumed: IngestPosition = stopped_at.to_string().parse().unwrap();
        let config = InventoryDumperConfig::new(table, resumed);
        let (dumper, mut rx) = build_dumper(&source, config, 64).await;
        let task = tokio::spawn(dumper.run());
        let second_run = drain(&mut rx).await;
        assert_eq!(task.await.unwrap().unwrap(), IngestPosition::Finished);

        let mut all = keys(&first_run);
        all.extend(keys(&second_run));
        assert_eq!(all, (1..=10_000).collect::<Vec<_>>());
        assert!(second_run.last().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_io_failure_pushes_sentinel_then_errors() {
        let source = orders_source(5000).await;
        source.fail_query(3);
        let config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::range(int(1), int(5000)),
        );
        let (dumper, mut rx) = build_dumper(&source, config, 64).await;
        let lifecycle = dumper.lifecycle();
        let task = tokio::spawn(dumper.run());
        let records = drain(&mut rx).await;
        let err = task.await.unwrap().unwrap_err();

        assert_eq!(records.len(), 2001);
        assert!(records.last().unwrap().is_finished());
        match err {
            IngestError::Dump { table, round, position, .. } => {
                assert_eq!(table, "orders");
                assert_eq!(round, 3);
                assert_eq!(position, "i,1,5000,2000");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_no_unique_key_single_unordered_pass() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new(
            "logs",
            vec![tidewater_core::metadata::ColumnMetadata::new("line", ColumnType::VarChar)],
        );
        source.create_table(table.clone());
        for i in 0..25 {
            source.insert("logs", vec![ColumnValue::Text(format!("line {i}"))]);
        }
        let mut config = InventoryDumperConfig::new(table, IngestPosition::Placeholder);
        config.batch_size = 10;
        let (dumper, mut rx) = build_dumper(&source, config, 64).await;
        assert!(!dumper.is_resumable());
        dumper.run().await.unwrap();
        let records = drain(&mut rx).await;
        assert_eq!(records.len(), 26);
        assert!(records[..25].iter().all(|r| r.position() == &IngestPosition::Placeholder));
        assert!(records[25].is_finished());
        let log = source.query_log();
        assert_eq!(log.len(), 1);
        assert!(matches!(log[0].shape, QueryShape::FullScan { .. }));
    }

    #[tokio::test]
    async fn test_unordered_stop_restarts_from_scratch() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new(
            "logs",
            vec![tidewater_core::metadata::ColumnMetadata::new("line", ColumnType::VarChar)],
        );
        source.create_table(table.clone());
        for i in 0..100 {
            source.insert("logs", vec![ColumnValue::Text(format!("line {i}"))]);
        }
        let mut config = InventoryDumperConfig::new(table, IngestPosition::Placeholder);
        config.batch_size = 10;
        let (dumper, mut rx) = build_dumper(&source, config, 4).await;
        let lifecycle = dumper.lifecycle();
        let task = tokio::spawn(dumper.run());
        for _ in 0..5 {
            rx.recv().await.unwrap();
        }
        lifecycle.stop();
        let rest = drain(&mut rx).await;
        assert_eq!(task.await.unwrap().unwrap(), IngestPosition::Placeholder);
        assert_eq!(5 + rest.len(), 10);
        assert!(rest.iter().all(|r| !r.is_finished()));
    }

    #[tokio::test]
    async fn test_unsupported_key_type_fails_at_construction() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new(
            "metrics",
            vec![tidewater_core::metadata::ColumnMetadata::new("ts", ColumnType::Double)],
        )
        .with_unique_key(&["ts"]);
        let (tx, _rx) = create_channel(4, None);
        let conn = source.connection().await.unwrap();
        let err = InventoryDumper::new(
            InventoryDumperConfig::new(table, IngestPosition::range(None, None)),
            Dialect::standard(),
            conn,
            tx,
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedKeyType { .. }));
    }

    #[tokio::test]
    async fn test_unsigned_bigint_key_fails_at_construction() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new(
            "big",
            vec![tidewater_core::metadata::ColumnMetadata::new("id", ColumnType::BigInt).unsigned()],
        )
        .with_unique_key(&["id"]);
        source.create_table(table.clone());
        source.insert("big", vec![ColumnValue::Int64(1)]);
        let (tx, _rx) = create_channel(4, None);
        let conn = source.connection().await.unwrap();
        let err = InventoryDumper::new(
            InventoryDumperConfig::new(table, IngestPosition::range(None, None)),
            Dialect::standard(),
            conn,
            tx,
        )
        .unwrap_err();
        assert!(
            matches!(err, IngestError::UnsupportedKeyType { ref column, .. } if column == "id"),
            "{err}"
        );
    }

    #[tokio::test]
    async fn test_mismatched_positions_rejected() {
        let source = orders_source(1).await;
        let table = source.table_metadata("orders").unwrap();
        let no_key = TableMetadata::new("logs", table.columns.clone());
        for (table, position) in [
            (no_key, IngestPosition::range(None, None)),
            (
                table.clone(),
                IngestPosition::range(Some(UniqueKeyValue::Text("a".into())), None),
            ),
            (
                table,
                IngestPosition::Log(tidewater_core::position::LogPosition::new("0/1")),
            ),
        ] {
            let (tx, _rx) = create_channel(4, None);
            let conn = source.connection().await.unwrap();
            let err = InventoryDumper::new(
                InventoryDumperConfig::new(table, position),
                Dialect::standard(),
                conn,
                tx,
            )
            .unwrap_err();
            assert!(matches!(err, IngestError::UnsupportedConfiguration(_)));
        }
    }

    #[derive(Debug, Default)]
    struct CountingLimiter {
        selects: AtomicU32,
    }

    #[async_trait]
    impl RateLimiter for CountingLimiter {
        async fn intercept(&self, kind: OperationKind, units: u32) {
            assert_eq!(kind, OperationKind::Select);
            assert_eq!(units, 1);
            self.selects.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_rate_limiter_invoked_once_per_page() {
        let source = orders_source(2500).await;
        let limiter = Arc::new(CountingLimiter::default());
        let mut config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::range(int(1), int(2500)),
        );
        config.rate_limiter = Some(limiter.clone());
        let (dumper, mut rx) = build_dumper(&source, config, 4096).await;
        dumper.run().await.unwrap();
        assert_eq!(drain(&mut rx).await.len(), 2501);
        assert_eq!(limiter.selects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_position_watch_tracks_pages() {
        let source = orders_source(3000).await;
        let config = InventoryDumperConfig::new(
            source.table_metadata("orders").unwrap(),
            IngestPosition::range(int(1), int(3000)),
        );
        let (dumper, mut rx) = build_dumper(&source, config, 8192).await;
        let mut watch = dumper.subscribe_position();
        let task = tokio::spawn(dumper.run());
        let mut seen = Vec::new();
        while watch.changed().await.is_ok() {
            let current = watch.borrow_and_update().clone();
            let done = current.is_finished();
            seen.push(current);
            if done {
                break;
            }
        }
        task.await.unwrap().unwrap();
        drain(&mut rx).await;
        assert_eq!(seen.last(), Some(&IngestPosition::Finished));
        for pair in seen.windows(2) {
            assert_ne!(
                pair[0].progress_cmp(&pair[1]),
                Some(std::cmp::Ordering::Greater)
            );
        }
    }

    #[tokio::test]
    async fn test_text_keys_page_exclusively() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new(
            "skus",
            vec![
                tidewater_core::metadata::ColumnMetadata::new("sku", ColumnType::VarChar),
                tidewater_core::metadata::ColumnMetadata::new("qty", ColumnType::Integer),
            ],
        )
        .with_unique_key(&["sku"]);
        source.create_table(table.clone());
        for i in 0..7 {
            source.insert(
                "skus",
                vec![ColumnValue::Text(format!("sku-{i:03}")), ColumnValue::Int32(i)],
            );
        }
        let mut config = InventoryDumperConfig::new(table, IngestPosition::range(None, None));
        config.batch_size = 3;
        let (dumper, mut rx) = build_dumper(&source, config, 64).await;
        dumper.run().await.unwrap();
        let records = drain(&mut rx).await;
        assert_eq!(records.len(), 8);
        let log = source.query_log();
        assert_eq!(log.len(), 4);
        let QueryShape::RangeScan { lower, .. } = &log[1].shape else {
            panic!("expected range scan");
        };
        assert_eq!(lower, &KeyBound::Exclusive(UniqueKeyValue::Text("sku-002".into())));
    }

    #[tokio::test]
    async fn test_unsigned_key_above_i32() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new(
            "big",
            vec![tidewater_core::metadata::ColumnMetadata::new("id", ColumnType::Integer).unsigned()],
        )
        .with_unique_key(&["id"]);
        source.create_table(table.clone());
        source.insert("big", vec![ColumnValue::Int64(3_000_000_000)]);
        source.insert("big", vec![ColumnValue::Int64(3_000_000_001)]);
        let (dumper, mut rx) = build_dumper(
            &source,
            InventoryDumperConfig::new(table, IngestPosition::range(None, None)),
            16,
        )
        .await;
        dumper.run().await.unwrap();
        let records = drain(&mut rx).await;
        assert_eq!(keys(&records), vec![3_000_000_000, 3_000_000_001]);
        assert_eq!(
            records[0].as_data().unwrap().columns[0].value,
            ColumnValue::Int64(3_000_000_000)
        );
    }
}
