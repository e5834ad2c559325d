//! Records pushed through a pipeline channel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::position::{IngestPosition, UniqueKeyValue};
use crate::value::ColumnValue;

static FINISHED: IngestPosition = IngestPosition::Finished;

/// Row change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordKind {
    /// Row inserted (every inventory row is an insert).
    Insert,
    /// Row updated.
    Update,
    /// Row deleted.
    Delete,
}

/// One column of a data record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Value before the change, for updates and deletes that carry it.
    pub old_value: Option<ColumnValue>,
    /// Value after the change (or the deleted value for deletes).
    pub value: ColumnValue,
    /// Whether this column is part of the unique key.
    pub unique_key: bool,
    /// Whether the change touched this column.
    pub updated: bool,
}

impl Column {
    /// Creates a column as read by an inventory scan.
    #[must_use]
    pub fn new(name: impl Into<String>, value: ColumnValue, unique_key: bool) -> Self {
        Self {
            name: name.into(),
            old_value: None,
            value,
            unique_key,
            updated: true,
        }
    }
}

/// A row change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRecord {
    /// Change kind.
    pub kind: RecordKind,
    /// Position immediately after this record.
    pub position: IngestPosition,
    /// Logical table name.
    pub table_name: String,
    /// Columns in table order.
    pub columns: Vec<Column>,
    /// Source commit time, when the change log reports one.
    pub commit_time: Option<DateTime<Utc>>,
}

impl DataRecord {
    /// Creates an empty record.
    #[must_use]
    pub fn new(kind: RecordKind, table_name: impl Into<String>, position: IngestPosition) -> Self {
        Self {
            kind,
            position,
            table_name: table_name.into(),
            columns: Vec::new(),
            commit_time: None,
        }
    }

    /// Appends a column.
    pub fn push_column(&mut self, column: Column) {
        self.columns.push(column);
    }

    /// Looks up a column by name (case-insensitive).
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Values of the unique key columns, in column order.
    #[must_use]
    pub fn unique_key_values(&self) -> Vec<&ColumnValue> {
        self.columns
            .iter()
            .filter(|c| c.unique_key)
            .map(|c| &c.value)
            .collect()
    }

    /// The first unique key value as a range-scan key.
    #[must_use]
    pub fn unique_key(&self) -> Option<UniqueKeyValue> {
        self.columns
            .iter()
            .find(|c| c.unique_key)
            .and_then(|c| c.value.to_unique_key())
    }
}

/// A unit pushed through a channel: a row change or the phase sentinel.
///
/// Exactly one [`Record::Finished`] terminates each dumper phase. It
/// carries no columns and its position is always
/// [`IngestPosition::Finished`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum Record {
    /// Row change.
    Data(DataRecord),
    /// Phase completion sentinel.
    Finished,
}

impl Record {
    /// Position after this record.
    #[must_use]
    pub fn position(&self) -> &IngestPosition {
        match self {
            Self::Data(data) => &data.position,
            Self::Finished => &FINISHED,
        }
    }

    /// Returns `true` for the phase sentinel.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// The data payload, if any.
    #[must_use]
    pub fn as_data(&self) -> Option<&DataRecord> {
        match self {
            Self::Data(data) => Some(data),
            Self::Finished => None,
        }
    }
}

impl From<DataRecord> for Record {
    fn from(data: DataRecord) -> Self {
        Self::Data(data)
    }
}
