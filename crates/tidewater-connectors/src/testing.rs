//! In-memory sources for tests and demos.
//!
//! [`MemoryDataSource`] stores tables as rows of [`ColumnValue`]s and
//! executes statements by their [`QueryShape`], so dumpers run against it
//! without a database. Raw dialect statements are answered from scripted
//! responses registered with [`MemoryDataSource::on_raw`]. Every executed
//! statement is logged for assertions.
//!
//! [`MemoryLogSource`] is a change-log stand-in fed through a
//! [`MemoryLogWriter`].

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use tidewater_core::error::SourceError;
use tidewater_core::metadata::{ColumnMetadata, ColumnType, TableMetadata, TableMetadataLoader};
use tidewater_core::position::UniqueKeyValue;
use tidewater_core::record::{DataRecord, RecordKind};
use tidewater_core::source::{
    DataSource, LargeObject, QueryShape, RowCursor, SourceConnection, Statement,
};
use tidewater_core::value::ColumnValue;

use crate::incremental::LogEventSource;

/// `orders(order_id BIGINT NOT NULL, status VARCHAR, amount DECIMAL)`
/// keyed on `order_id`.
#[must_use]
pub fn orders_table() -> TableMetadata {
    TableMetadata::new(
        "orders",
        vec![
            ColumnMetadata::new("order_id", ColumnType::BigInt).not_null(),
            ColumnMetadata::new("status", ColumnType::VarChar),
            ColumnMetadata::new("amount", ColumnType::Decimal),
        ],
    )
    .with_unique_key(&["order_id"])
}

/// A row of [`orders_table`] with a deterministic status and amount.
#[must_use]
pub fn order_row(order_id: i64) -> Vec<ColumnValue> {
    let status = if order_id % 3 == 0 { "PAID" } else { "NEW" };
    vec![
        ColumnValue::Int64(order_id),
        ColumnValue::Text(status.to_string()),
        ColumnValue::Decimal(format!("{}.{:02}", order_id % 1000, order_id % 100)),
    ]
}

struct MemoryTable {
    metadata: TableMetadata,
    rows: Vec<Vec<ColumnValue>>,
}

struct Scripted {
    columns: Vec<ColumnMetadata>,
    rows: Vec<Vec<ColumnValue>>,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, MemoryTable>,
    scripted: HashMap<String, Scripted>,
    log: Vec<Statement>,
    queries: u64,
    fail_at: Option<u64>,
}

/// Shared in-memory database. Clones share state.
#[derive(Clone)]
pub struct MemoryDataSource {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDataSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Creates (or replaces) a table.
    pub fn create_table(&self, metadata: TableMetadata) {
        self.state.lock().tables.insert(
            metadata.name.clone(),
            MemoryTable {
                metadata,
                rows: Vec::new(),
            },
        );
    }

    /// Appends a row. Rows for unknown tables are dropped with a warning.
    pub fn insert(&self, table: &str, row: Vec<ColumnValue>) {
        let mut state = self.state.lock();
        match state.tables.get_mut(table) {
            Some(t) => t.rows.push(row),
            None => tracing::warn!(table, "Insert into unknown memory table ignored"),
        }
    }

    /// Appends rows.
    pub fn insert_rows(&self, table: &str, rows: impl IntoIterator<Item = Vec<ColumnValue>>) {
        for row in rows {
            self.insert(table, row);
        }
    }

    /// Appends [`order_row`]s for every id in `ids` to `orders`.
    pub fn insert_orders(&self, ids: RangeInclusive<i64>) {
        self.insert_rows("orders", ids.map(order_row));
    }

    /// Inserts or replaces the row whose unique key equals `row`'s.
    pub fn upsert(&self, table: &str, row: Vec<ColumnValue>) {
        let mut state = self.state.lock();
        let Some(t) = state.tables.get_mut(table) else {
            tracing::warn!(table, "Upsert into unknown memory table ignored");
            return;
        };
        let key_index = t
            .metadata
            .unique_key_column()
            .and_then(|k| t.metadata.column_index(&k.name));
        let existing = key_index.and_then(|i| {
            let key = row.get(i)?.to_unique_key()?;
            t.rows
                .iter()
                .position(|r| r.get(i).and_then(ColumnValue::to_unique_key).as_ref() == Some(&key))
        });
        match existing {
            Some(pos) => t.rows[pos] = row,
            None => t.rows.push(row),
        }
    }

    /// Deletes the row whose unique key is `key`. Returns `true` if found.
    pub fn delete(&self, table: &str, key: &UniqueKeyValue) -> bool {
        let mut state = self.state.lock();
        let Some(t) = state.tables.get_mut(table) else {
            return false;
        };
        let Some(i) = t
            .metadata
            .unique_key_column()
            .and_then(|k| t.metadata.column_index(&k.name))
        else {
            return false;
        };
        let before = t.rows.len();
        t.rows
            .retain(|r| r.get(i).and_then(ColumnValue::to_unique_key).as_ref() != Some(key));
        t.rows.len() != before
    }

    /// Replaces a single cell, addressed by unique key.
    pub fn update_cell(&self, table: &str, key: &UniqueKeyValue, column: &str, value: ColumnValue) {
        let mut state = self.state.lock();
        let Some(t) = state.tables.get_mut(table) else {
            return;
        };
        let (Some(k), Some(c)) = (
            t.metadata
                .unique_key_column()
                .and_then(|k| t.metadata.column_index(&k.name)),
            t.metadata.column_index(column),
        ) else {
            return;
        };
        if let Some(row) = t
            .rows
            .iter_mut()
            .find(|r| r.get(k).and_then(ColumnValue::to_unique_key).as_ref() == Some(key))
        {
            row[c] = value;
        }
    }

    /// Applies a data record the way a trivial importer would: inserts and
    /// updates upsert by unique key, deletes remove by unique key.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Query` if the record's table does not exist.
    pub fn apply(&self, record: &DataRecord) -> Result<(), SourceError> {
        let Some(metadata) = self.table_metadata(&record.table_name) else {
            return Err(SourceError::Query(format!(
                "table {} does not exist",
                record.table_name
            )));
        };
        match record.kind {
            RecordKind::Insert | RecordKind::Update => {
                let row = metadata
                    .columns
                    .iter()
                    .map(|c| {
                        record
                            .column(&c.name)
                            .map_or(ColumnValue::Null, |col| col.value.clone())
                    })
                    .collect();
                self.upsert(&record.table_name, row);
            }
            RecordKind::Delete => {
                if let Some(key) = record.unique_key() {
                    self.delete(&record.table_name, &key);
                }
            }
        }
        Ok(())
    }

    /// Number of rows in `table` (0 if unknown).
    #[must_use]
    pub fn row_count(&self, table: &str) -> usize {
        self.state.lock().tables.get(table).map_or(0, |t| t.rows.len())
    }

    /// Copy of `table`'s rows in insertion order.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Vec<ColumnValue>> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Metadata of `table`, if it exists.
    #[must_use]
    pub fn table_metadata(&self, table: &str) -> Option<TableMetadata> {
        self.state.lock().tables.get(table).map(|t| t.metadata.clone())
    }

    /// Scripts the response to a raw statement with exactly this SQL.
    pub fn on_raw(
        &self,
        sql: impl Into<String>,
        columns: Vec<ColumnMetadata>,
        rows: Vec<Vec<ColumnValue>>,
    ) {
        self.state
            .lock()
            .scripted
            .insert(sql.into(), Scripted { columns, rows });
    }

    /// Makes the `nth` query (1-based, counted across all connections)
    /// fail with `SourceError::Query`.
    pub fn fail_query(&self, nth: u64) {
        self.state.lock().fail_at = Some(nth);
    }

    /// Every statement executed so far, including failed ones.
    #[must_use]
    pub fn query_log(&self) -> Vec<Statement> {
        self.state.lock().log.clone()
    }

    fn execute(&self, statement: &Statement) -> Result<MemoryRowCursor, SourceError> {
        let mut state = self.state.lock();
        state.log.push(statement.clone());
        state.queries += 1;
        if state.fail_at == Some(state.queries) {
            return Err(SourceError::Query(format!(
                "injected failure on query {}",
                state.queries
            )));
        }
        match &statement.shape {
            QueryShape::RangeScan {
                table,
                key_column,
                lower,
                upper,
                limit,
            } => {
                let t = lookup(&state, table)?;
                let key_index = column_index(t, key_column)?;
                let mut rows: Vec<(UniqueKeyValue, Vec<ColumnValue>)> = t
                    .rows
                    .iter()
                    .filter_map(|row| {
                        let key = row.get(key_index)?.to_unique_key()?;
                        let below_upper = upper.as_ref().map_or(true, |u| {
                            key.partial_cmp(u).is_some_and(std::cmp::Ordering::is_le)
                        });
                        (lower.admits(&key) && below_upper).then(|| (key, row.clone()))
                    })
                    .collect();
                rows.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
                rows.truncate(*limit);
                Ok(MemoryRowCursor::new(
                    t.metadata.columns.clone(),
                    rows.into_iter().map(|(_, row)| row).collect(),
                ))
            }
            QueryShape::FullScan { table } => {
                let t = lookup(&state, table)?;
                Ok(MemoryRowCursor::new(t.metadata.columns.clone(), t.rows.clone()))
            }
            QueryShape::KeyBounds { table, key_column } => {
                let t = lookup(&state, table)?;
                let key_index = column_index(t, key_column)?;
                let key_meta = t.metadata.columns[key_index].clone();
                let keys = t
                    .rows
                    .iter()
                    .filter_map(|r| r.get(key_index).filter(|v| !v.is_null()));
                let mut min: Option<&ColumnValue> = None;
                let mut max: Option<&ColumnValue> = None;
                for value in keys {
                    let key = value.to_unique_key();
                    if min.map_or(true, |m| key < m.to_unique_key()) {
                        min = Some(value);
                    }
                    if max.map_or(true, |m| key > m.to_unique_key()) {
                        max = Some(value);
                    }
                }
                let mut min_meta = key_meta.clone();
                min_meta.name = format!("min({key_column})");
                let mut max_meta = key_meta;
                max_meta.name = format!("max({key_column})");
                Ok(MemoryRowCursor::new(
                    vec![min_meta, max_meta],
                    vec![vec![
                        min.cloned().unwrap_or(ColumnValue::Null),
                        max.cloned().unwrap_or(ColumnValue::Null),
                    ]],
                ))
            }
            QueryShape::Raw => state
                .scripted
                .get(&statement.sql)
                .map(|s| MemoryRowCursor::new(s.columns.clone(), s.rows.clone()))
                .ok_or_else(|| {
                    SourceError::Query(format!("no scripted response for: {}", statement.sql))
                }),
        }
    }
}

fn lookup<'a>(state: &'a MemoryState, table: &str) -> Result<&'a MemoryTable, SourceError> {
    state
        .tables
        .get(table)
        .ok_or_else(|| SourceError::Query(format!("table {table} does not exist")))
}

fn column_index(table: &MemoryTable, column: &str) -> Result<usize, SourceError> {
    table.metadata.column_index(column).ok_or_else(|| {
        SourceError::Query(format!(
            "column {column} does not exist in {}",
            table.metadata.name
        ))
    })
}

impl std::fmt::Debug for MemoryDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryDataSource")
            .field("name", &self.name)
            .field("tables", &state.tables.keys().collect::<Vec<_>>())
            .field("queries", &state.queries)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connection(&self) -> Result<Box<dyn SourceConnection>, SourceError> {
        Ok(Box::new(MemoryConnection {
            source: self.clone(),
        }))
    }
}

#[async_trait]
impl TableMetadataLoader for MemoryDataSource {
    async fn load(&self, _schema: Option<&str>, table: &str) -> Result<TableMetadata, SourceError> {
        let state = self.state.lock();
        let t = state
            .tables
            .get(table)
            .ok_or_else(|| SourceError::Metadata(format!("table {table} does not exist")))?;
        let mut metadata = t.metadata.clone();
        if metadata.estimated_rows.is_none() {
            metadata.estimated_rows = Some(t.rows.len() as u64);
        }
        Ok(metadata)
    }
}

struct MemoryConnection {
    source: MemoryDataSource,
}

#[async_trait]
impl SourceConnection for MemoryConnection {
    async fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowCursor>, SourceError> {
        let cursor = self.source.execute(statement)?;
        // Let other tasks run between pages like a real round trip would.
        tokio::task::yield_now().await;
        Ok(Box::new(cursor))
    }
}

/// Cursor over materialized rows.
///
/// Getters convert between compatible value kinds, return zero values for
/// NULL, and record the null flag for [`RowCursor::was_null`].
pub struct MemoryRowCursor {
    columns: Vec<ColumnMetadata>,
    rows: std::vec::IntoIter<Vec<ColumnValue>>,
    current: Option<Vec<ColumnValue>>,
    last_null: bool,
}

impl MemoryRowCursor {
    /// Creates a cursor positioned before the first row.
    #[must_use]
    pub fn new(columns: Vec<ColumnMetadata>, rows: Vec<Vec<ColumnValue>>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
            current: None,
            last_null: false,
        }
    }

    /// Creates a cursor already positioned on its only row.
    #[must_use]
    pub fn single_row(columns: Vec<ColumnMetadata>, values: Vec<ColumnValue>) -> Self {
        Self {
            columns,
            rows: Vec::new().into_iter(),
            current: Some(values),
            last_null: false,
        }
    }

    fn value(&mut self, index: usize) -> Result<ColumnValue, SourceError> {
        let row = self.current.as_ref().ok_or(SourceError::NoCurrentRow)?;
        let value = row.get(index).cloned().ok_or_else(|| SourceError::Read {
            index,
            message: format!("row has {} columns", row.len()),
        })?;
        self.last_null = value.is_null();
        Ok(value)
    }

    fn integer(&mut self, index: usize) -> Result<i64, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(0),
            ColumnValue::Bool(v) => Ok(i64::from(v)),
            ColumnValue::Int8(v) => Ok(i64::from(v)),
            ColumnValue::Int16(v) => Ok(i64::from(v)),
            ColumnValue::Int32(v) => Ok(i64::from(v)),
            ColumnValue::Int64(v) => Ok(v),
            ColumnValue::Decimal(v) | ColumnValue::Text(v) => v
                .parse()
                .map_err(|e: std::num::ParseIntError| mismatch(index, &e.to_string())),
            other => Err(mismatch(index, &format!("{other} is not an integer"))),
        }
    }

    fn narrow<T: TryFrom<i64>>(&mut self, index: usize) -> Result<T, SourceError> {
        let wide = self.integer(index)?;
        T::try_from(wide).map_err(|_| mismatch(index, &format!("{wide} out of range")))
    }

    fn float(&mut self, index: usize) -> Result<f64, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(0.0),
            ColumnValue::Float32(v) => Ok(f64::from(v)),
            ColumnValue::Float64(v) => Ok(v),
            ColumnValue::Int32(v) => Ok(f64::from(v)),
            ColumnValue::Decimal(v) | ColumnValue::Text(v) => v
                .parse()
                .map_err(|e: std::num::ParseFloatError| mismatch(index, &e.to_string())),
            other => Err(mismatch(index, &format!("{other} is not a float"))),
        }
    }

    fn large_object(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Bytes(b) => Ok(Some(Box::new(MemoryLargeObject(b)))),
            ColumnValue::Text(t) => Ok(Some(Box::new(MemoryLargeObject(t.into_bytes())))),
            other => Err(mismatch(index, &format!("{other} is not a large object"))),
        }
    }
}

fn mismatch(index: usize, message: &str) -> SourceError {
    SourceError::Read {
        index,
        message: message.to_string(),
    }
}

impl std::fmt::Debug for MemoryRowCursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRowCursor")
            .field("columns", &self.columns.len())
            .field("remaining", &self.rows.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RowCursor for MemoryRowCursor {
    async fn next(&mut self) -> Result<bool, SourceError> {
        self.current = self.rows.next();
        Ok(self.current.is_some())
    }

    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn was_null(&self) -> bool {
        self.last_null
    }

    fn get_bool(&mut self, index: usize) -> Result<bool, SourceError> {
        match self.value(index)? {
            ColumnValue::Bool(v) => Ok(v),
            ColumnValue::Null => Ok(false),
            _ => Ok(self.integer(index)? != 0),
        }
    }

    fn get_i8(&mut self, index: usize) -> Result<i8, SourceError> {
        self.narrow(index)
    }

    fn get_i16(&mut self, index: usize) -> Result<i16, SourceError> {
        self.narrow(index)
    }

    fn get_i32(&mut self, index: usize) -> Result<i32, SourceError> {
        self.narrow(index)
    }

    fn get_i64(&mut self, index: usize) -> Result<i64, SourceError> {
        self.integer(index)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn get_f32(&mut self, index: usize) -> Result<f32, SourceError> {
        self.float(index).map(|v| v as f32)
    }

    fn get_f64(&mut self, index: usize) -> Result<f64, SourceError> {
        self.float(index)
    }

    fn get_decimal(&mut self, index: usize) -> Result<Option<String>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Decimal(v) | ColumnValue::Text(v) => Ok(Some(v)),
            other @ (ColumnValue::Int8(_)
            | ColumnValue::Int16(_)
            | ColumnValue::Int32(_)
            | ColumnValue::Int64(_)
            | ColumnValue::Float32(_)
            | ColumnValue::Float64(_)) => Ok(Some(other.to_string())),
            other => Err(mismatch(index, &format!("{other} is not a decimal"))),
        }
    }

    fn get_date(&mut self, index: usize) -> Result<Option<NaiveDate>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Date(v) => Ok(Some(v)),
            ColumnValue::Timestamp(v) => Ok(Some(v.date())),
            other => Err(mismatch(index, &format!("{other} is not a date"))),
        }
    }

    fn get_time(&mut self, index: usize) -> Result<Option<NaiveTime>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Time(v) => Ok(Some(v)),
            ColumnValue::Timestamp(v) => Ok(Some(v.time())),
            other => Err(mismatch(index, &format!("{other} is not a time"))),
        }
    }

    fn get_timestamp(&mut self, index: usize) -> Result<Option<NaiveDateTime>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Timestamp(v) => Ok(Some(v)),
            ColumnValue::Date(v) => Ok(v.and_hms_opt(0, 0, 0)),
            other => Err(mismatch(index, &format!("{other} is not a timestamp"))),
        }
    }

    fn get_string(&mut self, index: usize) -> Result<Option<String>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Text(v) => Ok(Some(v)),
            ColumnValue::Bytes(b) => String::from_utf8(b)
                .map(Some)
                .map_err(|e| mismatch(index, &e.to_string())),
            other => Ok(Some(other.to_string())),
        }
    }

    fn get_bytes(&mut self, index: usize) -> Result<Option<Vec<u8>>, SourceError> {
        match self.value(index)? {
            ColumnValue::Null => Ok(None),
            ColumnValue::Bytes(v) => Ok(Some(v)),
            ColumnValue::Text(v) => Ok(Some(v.into_bytes())),
            other => Err(mismatch(index, &format!("{other} is not binary"))),
        }
    }

    fn get_blob(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
        self.large_object(index)
    }

    fn get_clob(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
        self.large_object(index)
    }

    fn get_object(&mut self, index: usize) -> Result<ColumnValue, SourceError> {
        self.value(index)
    }
}

struct MemoryLargeObject(Vec<u8>);

impl LargeObject for MemoryLargeObject {
    fn length(&self) -> u64 {
        self.0.len() as u64
    }

    fn read_all(&mut self) -> Result<Vec<u8>, SourceError> {
        Ok(std::mem::take(&mut self.0))
    }

    fn free(self: Box<Self>) -> Result<(), SourceError> {
        Ok(())
    }
}

enum LogEvent {
    Record(DataRecord),
    Failure(String),
}

/// Change-log stand-in. Events appended through the paired
/// [`MemoryLogWriter`] are polled in order; dropping every writer ends
/// the log.
#[derive(Debug)]
pub struct MemoryLogSource {
    events: mpsc::UnboundedReceiver<LogEvent>,
    pending_failure: Option<String>,
}

/// Appends events to a [`MemoryLogSource`].
#[derive(Debug, Clone)]
pub struct MemoryLogWriter {
    events: mpsc::UnboundedSender<LogEvent>,
}

impl std::fmt::Debug for LogEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record(r) => write!(f, "Record({:?} {})", r.kind, r.table_name),
            Self::Failure(m) => write!(f, "Failure({m})"),
        }
    }
}

impl MemoryLogSource {
    /// Creates a log and its writer.
    #[must_use]
    pub fn channel() -> (Self, MemoryLogWriter) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                events: rx,
                pending_failure: None,
            },
            MemoryLogWriter { events: tx },
        )
    }
}

impl MemoryLogWriter {
    /// Appends a change event. Returns `false` if the source is gone.
    pub fn append(&self, record: DataRecord) -> bool {
        self.events.send(LogEvent::Record(record)).is_ok()
    }

    /// Makes the next poll that reaches this point fail.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.events.send(LogEvent::Failure(message.into())).is_ok()
    }
}

#[async_trait]
impl LogEventSource for MemoryLogSource {
    async fn poll(&mut self, max: usize) -> Result<Option<Vec<DataRecord>>, SourceError> {
        if let Some(message) = self.pending_failure.take() {
            return Err(SourceError::Query(message));
        }
        let mut batch = Vec::new();
        while batch.len() < max.max(1) {
            match self.events.try_recv() {
                Ok(LogEvent::Record(record)) => batch.push(record),
                Ok(LogEvent::Failure(message)) => {
                    if batch.is_empty() {
                        return Err(SourceError::Query(message));
                    }
                    // Deliver what came before the failure first.
                    self.pending_failure = Some(message);
                    return Ok(Some(batch));
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if batch.is_empty() {
                        return Ok(None);
                    }
                    break;
                }
            }
        }
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidewater_core::position::IngestPosition;
    use tidewater_core::record::Column;
    use tidewater_core::source::KeyBound;

    #[tokio::test]
    async fn test_range_scan_filters_sorts_limits() {
        let source = MemoryDataSource::new("ds");
        source.create_table(orders_table());
        source.insert_rows("orders", [order_row(5), order_row(1), order_row(3), order_row(4)]);
        let statement = Statement {
            sql: String::new(),
            params: Vec::new(),
            fetch_size: 0,
            shape: QueryShape::RangeScan {
                table: "orders".into(),
                key_column: "order_id".into(),
                lower: KeyBound::Exclusive(UniqueKeyValue::Integer(1)),
                upper: Some(UniqueKeyValue::Integer(5)),
                limit: 2,
            },
        };
        let mut conn = source.connection().await.unwrap();
        let mut cursor = conn.query(&statement).await.unwrap();
        let mut ids = Vec::new();
        while cursor.next().await.unwrap() {
            ids.push(cursor.get_i64(0).unwrap());
        }
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn test_failure_injection_counts_queries() {
        let source = MemoryDataSource::new("ds");
        source.create_table(orders_table());
        source.fail_query(2);
        let stmt = Statement {
            sql: String::new(),
            params: Vec::new(),
            fetch_size: 0,
            shape: QueryShape::FullScan {
                table: "orders".into(),
            },
        };
        let mut conn = source.connection().await.unwrap();
        assert!(conn.query(&stmt).await.is_ok());
        assert!(conn.query(&stmt).await.is_err());
        assert!(conn.query(&stmt).await.is_ok());
        assert_eq!(source.query_log().len(), 3);
    }

    #[test]
    fn test_null_reads_zero_and_flags() {
        let columns = vec![ColumnMetadata::new("n", ColumnType::Integer)];
        let mut cursor = MemoryRowCursor::single_row(columns, vec![ColumnValue::Null]);
        assert_eq!(cursor.get_i32(0).unwrap(), 0);
        assert!(cursor.was_null());
    }

    #[test]
    fn test_upsert_and_delete_by_key() {
        let source = MemoryDataSource::new("ds");
        source.create_table(orders_table());
        source.insert_orders(1..=3);
        let mut changed = order_row(2);
        changed[1] = ColumnValue::Text("SHIPPED".into());
        source.upsert("orders", changed.clone());
        assert_eq!(source.rows("orders")[1], changed);
        assert!(source.delete("orders", &UniqueKeyValue::Integer(1)));
        assert_eq!(source.row_count("orders"), 2);
    }

    #[test]
    fn test_apply_records() {
        let source = MemoryDataSource::new("target");
        source.create_table(orders_table());
        let mut insert = DataRecord::new(RecordKind::Insert, "orders", IngestPosition::Placeholder);
        insert.push_column(Column::new("order_id", ColumnValue::Int64(7), true));
        insert.push_column(Column::new("status", ColumnValue::Text("NEW".into()), false));
        source.apply(&insert).unwrap();
        assert_eq!(
            source.rows("orders"),
            vec![vec![ColumnValue::Int64(7), ColumnValue::Text("NEW".into()), ColumnValue::Null]]
        );

        let mut delete = DataRecord::new(RecordKind::Delete, "orders", IngestPosition::Placeholder);
        delete.push_column(Column::new("order_id", ColumnValue::Int64(7), true));
        source.apply(&delete).unwrap();
        assert_eq!(source.row_count("orders"), 0);

        let unknown = DataRecord::new(RecordKind::Insert, "missing", IngestPosition::Placeholder);
        assert!(source.apply(&unknown).is_err());
    }

    #[tokio::test]
    async fn test_log_source_batches_then_ends() {
        let (mut log, writer) = MemoryLogSource::channel();
        for _ in 0..3 {
            writer.append(DataRecord::new(RecordKind::Insert, "orders", IngestPosition::Placeholder));
        }
        assert_eq!(log.poll(2).await.unwrap().unwrap().len(), 2);
        assert_eq!(log.poll(2).await.unwrap().unwrap().len(), 1);
        assert_eq!(log.poll(2).await.unwrap().unwrap().len(), 0);
        drop(writer);
        assert!(log.poll(2).await.unwrap().is_none());
    }
}
