//! Table and column metadata.
//!
//! Metadata discovery itself is a service the pipeline consumes through
//! [`TableMetadataLoader`]; this module only defines the shapes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// Source-independent column type code.
///
/// Readers dispatch on this code, never on a driver's native value class.
/// Codes a dialect does not map fall back to [`ColumnType::Other`] and
/// are read with the cursor's generic getter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    /// Boolean or single bit.
    Boolean,
    /// 1-byte integer.
    TinyInt,
    /// 2-byte integer.
    SmallInt,
    /// 4-byte integer.
    Integer,
    /// 8-byte integer.
    BigInt,
    /// Exact decimal.
    Decimal,
    /// Exact numeric.
    Numeric,
    /// Single precision float.
    Real,
    /// Float (double precision).
    Float,
    /// Double precision float.
    Double,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// Timestamp.
    Timestamp,
    /// Fixed-width character.
    Char,
    /// Variable-width character.
    VarChar,
    /// Long character.
    LongVarChar,
    /// National fixed-width character.
    NChar,
    /// National variable-width character.
    NVarChar,
    /// National long character.
    LongNVarChar,
    /// Character large object.
    Clob,
    /// National character large object.
    NClob,
    /// Fixed-width binary.
    Binary,
    /// Variable-width binary.
    VarBinary,
    /// Long binary.
    LongVarBinary,
    /// Binary large object.
    Blob,
    /// Any other driver-specific type code.
    Other(i32),
}

impl ColumnType {
    /// Returns `true` for integer types of any width.
    #[must_use]
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            Self::TinyInt | Self::SmallInt | Self::Integer | Self::BigInt
        )
    }

    /// Returns `true` for character types that are not large objects.
    #[must_use]
    pub fn is_character(self) -> bool {
        matches!(
            self,
            Self::Char
                | Self::VarChar
                | Self::LongVarChar
                | Self::NChar
                | Self::NVarChar
                | Self::LongNVarChar
        )
    }
}

/// Metadata for one column, as reported by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name.
    pub name: String,
    /// Type code.
    pub column_type: ColumnType,
    /// Source-native type name (e.g. `"YEAR"`, `"money"`), used by
    /// dialect readers to special-case types the code alone can't tell.
    pub type_name: String,
    /// `false` when the source reports the column as unsigned.
    pub signed: bool,
    /// Whether the column accepts nulls.
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Creates a signed, nullable column whose type name is derived
    /// from the type code.
    #[must_use]
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            type_name: format!("{column_type:?}").to_uppercase(),
            signed: true,
            nullable: true,
        }
    }

    /// Marks the column unsigned.
    #[must_use]
    pub fn unsigned(mut self) -> Self {
        self.signed = false;
        self
    }

    /// Overrides the source type name.
    #[must_use]
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }

    /// Marks the column not nullable.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Returns `true` if values of this column can bound a range scan.
    ///
    /// Character columns and integers up to signed 64 bits qualify. An
    /// unsigned 8-byte integer is read as a decimal and does not.
    #[must_use]
    pub fn is_range_key(&self) -> bool {
        self.column_type.is_character()
            || (self.column_type.is_integer()
                && (self.signed || self.column_type != ColumnType::BigInt))
    }
}

/// Metadata for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Schema, when the source has one.
    pub schema: Option<String>,
    /// Table name.
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnMetadata>,
    /// Unique key columns (primary key first, then unique indexes).
    pub unique_key_columns: Vec<String>,
    /// Estimated row count from source statistics.
    pub estimated_rows: Option<u64>,
}

impl TableMetadata {
    /// Creates table metadata without a schema or unique key.
    #[must_use]
    pub fn new(name: impl Into<String>, columns: Vec<ColumnMetadata>) -> Self {
        Self {
            schema: None,
            name: name.into(),
            columns,
            unique_key_columns: Vec::new(),
            estimated_rows: None,
        }
    }

    /// Sets the unique key columns.
    #[must_use]
    pub fn with_unique_key(mut self, columns: &[&str]) -> Self {
        self.unique_key_columns = columns.iter().map(ToString::to_string).collect();
        self
    }

    /// Sets the estimated row count.
    #[must_use]
    pub fn with_estimated_rows(mut self, rows: u64) -> Self {
        self.estimated_rows = Some(rows);
        self
    }

    /// Looks up a column by name (case-insensitive).
    #[must_use]
    pub fn column(&self, name: &str) -> Option<&ColumnMetadata> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Position of a column by name (case-insensitive).
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// The column that drives range scans: the first unique key column.
    #[must_use]
    pub fn unique_key_column(&self) -> Option<&ColumnMetadata> {
        self.unique_key_columns
            .first()
            .and_then(|name| self.column(name))
    }

    /// Returns `true` if `name` is one of the unique key columns.
    #[must_use]
    pub fn is_unique_key(&self, name: &str) -> bool {
        self.unique_key_columns
            .iter()
            .any(|k| k.eq_ignore_ascii_case(name))
    }

    /// Column names in ordinal order.
    #[must_use]
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

/// Read-only metadata discovery service.
#[async_trait]
pub trait TableMetadataLoader: Send + Sync {
    /// Loads metadata for a table.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Metadata` if the table does not exist or the
    /// catalog cannot be read.
    async fn load(&self, schema: Option<&str>, table: &str) -> Result<TableMetadata, SourceError>;
}
