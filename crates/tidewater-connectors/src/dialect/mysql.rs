//! MySQL dialect.

use std::sync::Arc;

use async_trait::async_trait;

use tidewater_core::error::SourceError;
use tidewater_core::metadata::ColumnMetadata;
use tidewater_core::position::{IngestPosition, LogPosition};
use tidewater_core::reader::{read_standard, ColumnValueReader};
use tidewater_core::source::{RowCursor, SourceConnection, Statement};
use tidewater_core::value::ColumnValue;

use super::{Dialect, InventoryQueryBuilder};
use crate::position::IncrementalPositionManager;

/// Dialect identifier.
pub const NAME: &str = "mysql";

/// Builds the MySQL dialect.
#[must_use]
pub fn dialect() -> Dialect {
    Dialect::new(
        NAME,
        Arc::new(MySqlQueryBuilder),
        Arc::new(MySqlColumnValueReader),
    )
    .with_position_manager(Arc::new(MySqlPositionManager))
}

/// Backtick-quoted identifiers with `?` placeholders.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlQueryBuilder;

impl InventoryQueryBuilder for MySqlQueryBuilder {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("`{}`", identifier.replace('`', "``"))
    }
}

/// Reads `YEAR` as a small integer and `JSON` as text.
///
/// Drivers report `YEAR` with a date type code, which the standard
/// dispatch would turn into a full date.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlColumnValueReader;

impl ColumnValueReader for MySqlColumnValueReader {
    fn read_typed(
        &self,
        cursor: &mut dyn RowCursor,
        column: &ColumnMetadata,
        index: usize,
    ) -> Result<ColumnValue, SourceError> {
        if column.type_name.eq_ignore_ascii_case("YEAR") {
            return Ok(ColumnValue::Int16(cursor.get_i16(index)?));
        }
        if column.type_name.eq_ignore_ascii_case("JSON") {
            return Ok(cursor
                .get_string(index)?
                .map_or(ColumnValue::Null, ColumnValue::Text));
        }
        read_standard(cursor, column, index)
    }
}

/// Binlog positions read from `SHOW MASTER STATUS`.
///
/// The marker is `<binlog file>:<offset>`. Nothing on the server is tied
/// to a position, so `destroy` keeps the no-op default.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlPositionManager;

#[async_trait]
impl IncrementalPositionManager for MySqlPositionManager {
    async fn init(
        &self,
        connection: &mut dyn SourceConnection,
        _slot_suffix: &str,
    ) -> Result<IngestPosition, SourceError> {
        let mut cursor = connection
            .query(&Statement::raw("SHOW MASTER STATUS"))
            .await?;
        if !cursor.next().await? {
            return Err(SourceError::Query(
                "SHOW MASTER STATUS returned no rows; is binary logging enabled?".into(),
            ));
        }
        let file = cursor
            .get_string(0)?
            .ok_or_else(|| SourceError::Query("binlog file name is null".into()))?;
        let offset = cursor.get_i64(1)?;
        Ok(IngestPosition::Log(LogPosition::new(format!("{file}:{offset}"))))
    }
}
