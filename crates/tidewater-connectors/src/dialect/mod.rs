//! Source dialects.
//!
//! A [`Dialect`] bundles everything that differs between source
//! databases: range-query text, column value reading, and change-log
//! position management. A job item resolves its dialect once from the
//! [`DialectRegistry`] and hands the resolved capabilities to its dumpers,
//! so nothing is looked up per row.

pub mod mysql;
pub mod postgresql;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use tidewater_core::error::ConfigError;
use tidewater_core::metadata::ColumnType;
use tidewater_core::position::UniqueKeyValue;
use tidewater_core::reader::{ColumnValueReader, StandardColumnValueReader};
use tidewater_core::source::{KeyBound, QueryShape, Statement};
use tidewater_core::value::ColumnValue;

use crate::position::IncrementalPositionManager;

/// Dialect identifier of the ANSI fallback.
pub const STANDARD: &str = "standard";

/// Parameters of one key-ordered page query.
#[derive(Debug, Clone, Copy)]
pub struct RangeScan<'a> {
    /// Schema, if any.
    pub schema: Option<&'a str>,
    /// Table name.
    pub table: &'a str,
    /// Columns to select, in order.
    pub columns: &'a [String],
    /// Key column to order and bound by.
    pub key_column: &'a str,
    /// Type of the key column.
    pub key_type: ColumnType,
    /// Lower bound: inclusive for a first batch, exclusive afterwards.
    pub lower: &'a KeyBound,
    /// Inclusive upper bound.
    pub upper: Option<&'a UniqueKeyValue>,
    /// Page size.
    pub limit: usize,
}

/// Builds dialect-correct inventory statements.
///
/// Implementations usually override only quoting and placeholders.
pub trait InventoryQueryBuilder: Send + Sync + fmt::Debug {
    /// Quotes an identifier.
    fn quote_identifier(&self, identifier: &str) -> String;

    /// Placeholder for the `ordinal`-th (1-based) parameter.
    fn placeholder(&self, _ordinal: usize) -> String {
        "?".to_string()
    }

    /// Placeholder for a key parameter compared against a `key_type` column.
    fn key_placeholder(&self, ordinal: usize, _key_type: ColumnType) -> String {
        self.placeholder(ordinal)
    }

    /// Schema-qualified, quoted table name.
    fn qualified_table(&self, schema: Option<&str>, table: &str) -> String {
        match schema {
            Some(schema) => format!(
                "{}.{}",
                self.quote_identifier(schema),
                self.quote_identifier(table)
            ),
            None => self.quote_identifier(table),
        }
    }

    /// `SELECT .. WHERE key >(=) ? AND key <= ? ORDER BY key LIMIT ?`.
    fn range_scan(&self, scan: &RangeScan<'_>) -> Statement {
        let key = self.quote_identifier(scan.key_column);
        let mut params = Vec::new();
        let mut conditions = Vec::new();
        match scan.lower {
            KeyBound::Unbounded => {}
            KeyBound::Inclusive(value) => {
                params.push(ColumnValue::from(value.clone()));
                conditions.push(format!(
                    "{key} >= {}",
                    self.key_placeholder(params.len(), scan.key_type)
                ));
            }
            KeyBound::Exclusive(value) => {
                params.push(ColumnValue::from(value.clone()));
                conditions.push(format!(
                    "{key} > {}",
                    self.key_placeholder(params.len(), scan.key_type)
                ));
            }
        }
        if let Some(upper) = scan.upper {
            params.push(ColumnValue::from(upper.clone()));
            conditions.push(format!(
                "{key} <= {}",
                self.key_placeholder(params.len(), scan.key_type)
            ));
        }
        let mut sql = format!(
            "SELECT {} FROM {}",
            self.column_list(scan.columns),
            self.qualified_table(scan.schema, scan.table)
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        params.push(ColumnValue::Int64(i64::try_from(scan.limit).unwrap_or(i64::MAX)));
        sql.push_str(&format!(
            " ORDER BY {key} ASC LIMIT {}",
            self.placeholder(params.len())
        ));
        Statement {
            sql,
            params,
            fetch_size: 0,
            shape: QueryShape::RangeScan {
                table: scan.table.to_string(),
                key_column: scan.key_column.to_string(),
                lower: scan.lower.clone(),
                upper: scan.upper.cloned(),
                limit: scan.limit,
            },
        }
    }

    /// Unordered `SELECT` of every row.
    fn full_scan(&self, schema: Option<&str>, table: &str, columns: &[String]) -> Statement {
        Statement {
            sql: format!(
                "SELECT {} FROM {}",
                self.column_list(columns),
                self.qualified_table(schema, table)
            ),
            params: Vec::new(),
            fetch_size: 0,
            shape: QueryShape::FullScan {
                table: table.to_string(),
            },
        }
    }

    /// `SELECT MIN(key), MAX(key)`.
    fn key_bounds(&self, schema: Option<&str>, table: &str, key_column: &str) -> Statement {
        let key = self.quote_identifier(key_column);
        Statement {
            sql: format!(
                "SELECT MIN({key}), MAX({key}) FROM {}",
                self.qualified_table(schema, table)
            ),
            params: Vec::new(),
            fetch_size: 0,
            shape: QueryShape::KeyBounds {
                table: table.to_string(),
                key_column: key_column.to_string(),
            },
        }
    }

    /// Comma-separated quoted column list.
    fn column_list(&self, columns: &[String]) -> String {
        if columns.is_empty() {
            return "*".to_string();
        }
        columns
            .iter()
            .map(|c| self.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// ANSI double-quoted identifiers with `?` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardQueryBuilder;

impl InventoryQueryBuilder for StandardQueryBuilder {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }
}

/// Resolved capabilities of one source dialect.
#[derive(Clone)]
pub struct Dialect {
    name: String,
    query_builder: Arc<dyn InventoryQueryBuilder>,
    column_reader: Arc<dyn ColumnValueReader>,
    position_manager: Option<Arc<dyn IncrementalPositionManager>>,
}

impl Dialect {
    /// Creates a dialect without change-log support.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        query_builder: Arc<dyn InventoryQueryBuilder>,
        column_reader: Arc<dyn ColumnValueReader>,
    ) -> Self {
        Self {
            name: name.into(),
            query_builder,
            column_reader,
            position_manager: None,
        }
    }

    /// Adds change-log position management.
    #[must_use]
    pub fn with_position_manager(mut self, manager: Arc<dyn IncrementalPositionManager>) -> Self {
        self.position_manager = Some(manager);
        self
    }

    /// The ANSI fallback dialect.
    #[must_use]
    pub fn standard() -> Self {
        Self::new(
            STANDARD,
            Arc::new(StandardQueryBuilder),
            Arc::new(StandardColumnValueReader),
        )
    }

    /// Dialect identifier.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inventory statement builder.
    #[must_use]
    pub fn query_builder(&self) -> &Arc<dyn InventoryQueryBuilder> {
        &self.query_builder
    }

    /// Column value reader.
    #[must_use]
    pub fn column_reader(&self) -> &Arc<dyn ColumnValueReader> {
        &self.column_reader
    }

    /// Change-log position manager, if the dialect has a change log.
    #[must_use]
    pub fn position_manager(&self) -> Option<&Arc<dyn IncrementalPositionManager>> {
        self.position_manager.as_ref()
    }
}

impl fmt::Debug for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialect")
            .field("name", &self.name)
            .field("query_builder", &self.query_builder)
            .field("incremental", &self.position_manager.is_some())
            .finish_non_exhaustive()
    }
}

/// Maps dialect identifiers to their capabilities.
///
/// Identifiers are case-insensitive.
pub struct DialectRegistry {
    dialects: RwLock<HashMap<String, Dialect>>,
}

impl DialectRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            dialects: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a registry with the standard, MySQL and PostgreSQL dialects.
    #[must_use]
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Dialect::standard());
        registry.register(mysql::dialect());
        registry.register(postgresql::dialect());
        registry
    }

    /// Registers a dialect, replacing any with the same identifier.
    pub fn register(&self, dialect: Dialect) {
        self.dialects
            .write()
            .insert(dialect.name().to_ascii_lowercase(), dialect);
    }

    /// Resolves a dialect by identifier.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Unsupported` if no dialect is registered
    /// under `name`.
    pub fn resolve(&self, name: &str) -> Result<Dialect, ConfigError> {
        self.dialects
            .read()
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ConfigError::Unsupported {
                kind: "dialect",
                name: name.to_string(),
            })
    }

    /// Registered identifiers, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.dialects.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DialectRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for DialectRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DialectRegistry")
            .field("dialects", &self.names())
            .finish()
    }
}
