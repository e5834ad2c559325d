//! Source connection contracts.
//!
//! A [`DataSource`] hands out exclusively-owned [`SourceConnection`]s.
//! A connection executes a [`Statement`] and returns a [`RowCursor`]
//! positioned before the first row. Getters follow the classic
//! result-set shape: primitive getters return a zero value for SQL NULL
//! and [`RowCursor::was_null`] reports whether the last read was null.
//!
//! Statements carry dialect SQL text for real drivers plus a
//! [`QueryShape`] describing the same query structurally, which lets
//! in-memory sources execute them without parsing SQL.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::SourceError;
use crate::metadata::ColumnMetadata;
use crate::position::UniqueKeyValue;
use crate::value::ColumnValue;

/// Lower bound of a key range query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBound {
    /// No lower bound.
    Unbounded,
    /// `key >= value`.
    Inclusive(UniqueKeyValue),
    /// `key > value`.
    Exclusive(UniqueKeyValue),
}

impl KeyBound {
    /// Returns `true` for the bound of a first batch (nothing consumed yet).
    #[must_use]
    pub fn is_first(&self) -> bool {
        !matches!(self, Self::Exclusive(_))
    }

    /// Returns `true` if `key` satisfies this bound.
    #[must_use]
    pub fn admits(&self, key: &UniqueKeyValue) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Inclusive(b) => key.partial_cmp(b).is_some_and(std::cmp::Ordering::is_ge),
            Self::Exclusive(b) => key.partial_cmp(b).is_some_and(std::cmp::Ordering::is_gt),
        }
    }
}

/// Structural description of a statement.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryShape {
    /// Key-ordered page: `lower < key <= upper ORDER BY key LIMIT limit`.
    RangeScan {
        /// Table name.
        table: String,
        /// Key column.
        key_column: String,
        /// Lower bound.
        lower: KeyBound,
        /// Inclusive upper bound.
        upper: Option<UniqueKeyValue>,
        /// Maximum rows returned.
        limit: usize,
    },
    /// Every row, in no particular order.
    FullScan {
        /// Table name.
        table: String,
    },
    /// One row holding `MIN(key), MAX(key)`.
    KeyBounds {
        /// Table name.
        table: String,
        /// Key column.
        key_column: String,
    },
    /// Dialect-specific statement with no structural form.
    Raw,
}

/// A statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// Dialect SQL text with placeholders.
    pub sql: String,
    /// Positional parameters.
    pub params: Vec<ColumnValue>,
    /// Rows the driver should buffer per round trip. `0` = driver default.
    pub fetch_size: usize,
    /// Structural form of the statement.
    pub shape: QueryShape,
}

impl Statement {
    /// Creates a raw statement with no parameters.
    #[must_use]
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            fetch_size: 0,
            shape: QueryShape::Raw,
        }
    }

    /// Adds a positional parameter.
    #[must_use]
    pub fn bind(mut self, value: impl Into<ColumnValue>) -> Self {
        self.params.push(value.into());
        self
    }
}

/// A handle to a large object that must be read out while the row is live.
pub trait LargeObject: Send {
    /// Length in bytes.
    fn length(&self) -> u64;

    /// Reads the full content.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the content cannot be fetched.
    fn read_all(&mut self) -> Result<Vec<u8>, SourceError>;

    /// Releases the handle on the source side.
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` if the driver fails to free the handle.
    fn free(self: Box<Self>) -> Result<(), SourceError>;
}

/// Forward-only cursor over a statement's result rows.
///
/// Column indexes are zero-based.
#[async_trait]
pub trait RowCursor: Send {
    /// Advances to the next row. Returns `false` when exhausted.
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` on I/O failure.
    async fn next(&mut self) -> Result<bool, SourceError>;

    /// Result set column metadata.
    fn columns(&self) -> &[ColumnMetadata];

    /// Whether the most recent getter call read SQL NULL.
    fn was_null(&self) -> bool;

    /// Reads a boolean. NULL reads as `false`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_bool(&mut self, index: usize) -> Result<bool, SourceError>;

    /// Reads a 1-byte integer. NULL reads as `0`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_i8(&mut self, index: usize) -> Result<i8, SourceError>;

    /// Reads a 2-byte integer. NULL reads as `0`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_i16(&mut self, index: usize) -> Result<i16, SourceError>;

    /// Reads a 4-byte integer. NULL reads as `0`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_i32(&mut self, index: usize) -> Result<i32, SourceError>;

    /// Reads an 8-byte integer. NULL reads as `0`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_i64(&mut self, index: usize) -> Result<i64, SourceError>;

    /// Reads a single precision float. NULL reads as `0.0`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_f32(&mut self, index: usize) -> Result<f32, SourceError>;

    /// Reads a double precision float. NULL reads as `0.0`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_f64(&mut self, index: usize) -> Result<f64, SourceError>;

    /// Reads an exact decimal as text. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_decimal(&mut self, index: usize) -> Result<Option<String>, SourceError>;

    /// Reads a date. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_date(&mut self, index: usize) -> Result<Option<NaiveDate>, SourceError>;

    /// Reads a time of day. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_time(&mut self, index: usize) -> Result<Option<NaiveTime>, SourceError>;

    /// Reads a timestamp. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_timestamp(&mut self, index: usize) -> Result<Option<NaiveDateTime>, SourceError>;

    /// Reads character data. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_string(&mut self, index: usize) -> Result<Option<String>, SourceError>;

    /// Reads binary data. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be converted.
    fn get_bytes(&mut self, index: usize) -> Result<Option<Vec<u8>>, SourceError>;

    /// Opens a binary large object. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value is not a large object.
    fn get_blob(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError>;

    /// Opens a character large object. NULL reads as `None`.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value is not a large object.
    fn get_clob(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError>;

    /// Best-effort generic read for type codes without a dedicated getter.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the value cannot be represented.
    fn get_object(&mut self, index: usize) -> Result<ColumnValue, SourceError>;
}

/// A live, exclusively-owned connection to a source.
#[async_trait]
pub trait SourceConnection: Send {
    /// Executes a statement and returns a cursor over its rows.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Query` if execution fails.
    async fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowCursor>, SourceError>;
}

/// Connection pool facade.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Logical name of this data source.
    fn name(&self) -> &str;

    /// Borrows a connection from the pool.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Connection` if no connection is available.
    async fn connection(&self) -> Result<Box<dyn SourceConnection>, SourceError>;
}
