//! PostgreSQL dialect.

use std::sync::Arc;

use async_trait::async_trait;

use tidewater_core::error::SourceError;
use tidewater_core::metadata::{ColumnMetadata, ColumnType};
use tidewater_core::position::{IngestPosition, LogPosition};
use tidewater_core::reader::{read_standard, ColumnValueReader};
use tidewater_core::source::{RowCursor, SourceConnection, Statement};
use tidewater_core::value::ColumnValue;

use super::{Dialect, InventoryQueryBuilder};
use crate::position::IncrementalPositionManager;

/// Dialect identifier.
pub const NAME: &str = "postgresql";

/// Logical decoding output plugin used for replication slots.
pub const DECODING_PLUGIN: &str = "test_decoding";

const SLOT_NAME_PREFIX: &str = "tidewater";
const MAX_IDENTIFIER_LEN: usize = 63;

/// Builds the PostgreSQL dialect.
#[must_use]
pub fn dialect() -> Dialect {
    Dialect::new(
        NAME,
        Arc::new(PostgresQueryBuilder),
        Arc::new(PostgresColumnValueReader),
    )
    .with_position_manager(Arc::new(PostgresPositionManager))
}

/// Double-quoted identifiers with `$n` placeholders.
///
/// Key placeholders are cast so the server infers a parameter type that
/// matches the 64-bit or text key value bound to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresQueryBuilder;

impl InventoryQueryBuilder for PostgresQueryBuilder {
    fn quote_identifier(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    fn placeholder(&self, ordinal: usize) -> String {
        format!("${ordinal}")
    }

    fn key_placeholder(&self, ordinal: usize, key_type: ColumnType) -> String {
        if key_type.is_integer() {
            format!("${ordinal}::int8")
        } else {
            format!("${ordinal}::text")
        }
    }
}

/// Reads `money` as a decimal and bit strings, JSON, UUID and other
/// extension types as text.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresColumnValueReader;

impl ColumnValueReader for PostgresColumnValueReader {
    fn read_typed(
        &self,
        cursor: &mut dyn RowCursor,
        column: &ColumnMetadata,
        index: usize,
    ) -> Result<ColumnValue, SourceError> {
        let type_name = column.type_name.to_ascii_lowercase();
        match type_name.as_str() {
            "money" => Ok(cursor
                .get_decimal(index)?
                .map_or(ColumnValue::Null, ColumnValue::Decimal)),
            "bit" | "varbit" | "json" | "jsonb" | "uuid" | "xml" | "interval" | "inet"
            | "cidr" => Ok(cursor
                .get_string(index)?
                .map_or(ColumnValue::Null, ColumnValue::Text)),
            _ => read_standard(cursor, column, index),
        }
    }
}

/// Replication-slot backed positions.
///
/// `init` makes sure a logical slot named after the suffix exists and
/// returns the current WAL LSN as the marker; `destroy` drops the slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresPositionManager;

impl PostgresPositionManager {
    /// Replication slot name for a suffix: lowercase, `[a-z0-9_]` only,
    /// at most 63 characters.
    #[must_use]
    pub fn slot_name(slot_suffix: &str) -> String {
        let mut name = format!("{SLOT_NAME_PREFIX}_{slot_suffix}");
        name = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '_'
                }
            })
            .collect();
        name.truncate(MAX_IDENTIFIER_LEN);
        name
    }

    async fn slot_exists(
        connection: &mut dyn SourceConnection,
        slot: &str,
    ) -> Result<bool, SourceError> {
        let mut cursor = connection
            .query(
                &Statement::raw("SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1")
                    .bind(slot),
            )
            .await?;
        cursor.next().await
    }
}

#[async_trait]
impl IncrementalPositionManager for PostgresPositionManager {
    async fn init(
        &self,
        connection: &mut dyn SourceConnection,
        slot_suffix: &str,
    ) -> Result<IngestPosition, SourceError> {
        let slot = Self::slot_name(slot_suffix);
        if !Self::slot_exists(connection, &slot).await? {
            tracing::info!(slot = %slot, plugin = DECODING_PLUGIN, "Creating replication slot");
            let mut cursor = connection
                .query(
                    &Statement::raw(
                        "SELECT slot_name FROM pg_create_logical_replication_slot($1, $2)",
                    )
                    .bind(slot.as_str())
                    .bind(DECODING_PLUGIN),
                )
                .await?;
            cursor.next().await?;
        }
        let mut cursor = connection
            .query(&Statement::raw("SELECT pg_current_wal_lsn()::text"))
            .await?;
        if !cursor.next().await? {
            return Err(SourceError::Query("pg_current_wal_lsn returned no rows".into()));
        }
        let lsn = cursor
            .get_string(0)?
            .ok_or_else(|| SourceError::Query("current WAL LSN is null".into()))?;
        Ok(IngestPosition::Log(LogPosition::new(lsn)))
    }

    async fn destroy(
        &self,
        connection: &mut dyn SourceConnection,
        slot_suffix: &str,
    ) -> Result<(), SourceError> {
        let slot = Self::slot_name(slot_suffix);
        let mut cursor = connection
            .query(
                &Statement::raw(
                    "SELECT pg_drop_replication_slot(slot_name) FROM pg_replication_slots WHERE slot_name = $1",
                )
                .bind(slot.as_str()),
            )
            .await?;
        while cursor.next().await? {}
        tracing::info!(slot = %slot, "Dropped replication slot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::RangeScan;
    use crate::position::destroy_best_effort;
    use crate::testing::MemoryDataSource;
    use tidewater_core::position::UniqueKeyValue;
    use tidewater_core::source::{DataSource, KeyBound};

    #[test]
    fn test_numbered_placeholders_with_casts() {
        let columns = vec!["id".to_string()];
        let lower = KeyBound::Exclusive(UniqueKeyValue::Integer(10));
        let upper = UniqueKeyValue::Integer(20);
        let stmt = PostgresQueryBuilder.range_scan(&RangeScan {
            schema: Some("public"),
            table: "orders",
            columns: &columns,
            key_column: "id",
            key_type: ColumnType::Integer,
            lower: &lower,
            upper: Some(&upper),
            limit: 100,
        });
        assert_eq!(
            stmt.sql,
            "SELECT \"id\" FROM \"public\".\"orders\" WHERE \"id\" > $1::int8 AND \"id\" <= $2::int8 ORDER BY \"id\" ASC LIMIT $3"
        );
    }

    #[test]
    fn test_text_key_cast() {
        assert_eq!(PostgresQueryBuilder.key_placeholder(1, ColumnType::VarChar), "$1::text");
    }

    #[test]
    fn test_slot_name_sanitized() {
        assert_eq!(
            PostgresPositionManager::slot_name("Job-01:ds_0"),
            "tidewater_job_01_ds_0"
        );
        assert_eq!(PostgresPositionManager::slot_name(&"x".repeat(100)).len(), 63);
    }

    fn slot_columns() -> Vec<ColumnMetadata> {
        vec![ColumnMetadata::new("slot_name", ColumnType::VarChar)]
    }

    #[tokio::test]
    async fn test_init_creates_missing_slot() {
        let source = MemoryDataSource::new("pg");
        source.on_raw(
            "SELECT slot_name FROM pg_replication_slots WHERE slot_name = $1",
            slot_columns(),
            Vec::new(),
        );
        source.on_raw(
            "SELECT slot_name FROM pg_create_logical_replication_slot($1, $2)",
            slot_columns(),
            vec![vec![ColumnValue::Text("tidewater_j1".into())]],
        );
        source.on_raw(
            "SELECT pg_current_wal_lsn()::text",
            vec![ColumnMetadata::new("lsn", ColumnType::VarChar)],
            vec![vec![ColumnValue::Text("0/16B3748".into())]],
        );
        let mut conn = source.connection().await.unwrap();
        let position = PostgresPositionManager.init(conn.as_mut(), "j1").await.unwrap();
        assert_eq!(position, IngestPosition::Log(LogPosition::new("0/16B3748")));

        let log = source.query_log();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].params[0], ColumnValue::Text("tidewater_j1".into()));
        assert_eq!(log[1].params[1], ColumnValue::Text(DECODING_PLUGIN.into()));
    }

    #[tokio::test]
    async fn test_destroy_failure_is_swallowed() {
        let source = MemoryDataSource::new("pg");
        let mut conn = source.connection().await.unwrap();
        // No scripted response: the drop statement fails.
        assert!(PostgresPositionManager.destroy(conn.as_mut(), "j1").await.is_err());
        destroy_best_effort(&PostgresPositionManager, conn.as_mut(), "j1").await;
    }

    #[test]
    fn test_money_reads_as_decimal() {
        let column = ColumnMetadata::new("price", ColumnType::Double).with_type_name("money");
        let mut cursor = crate::testing::MemoryRowCursor::single_row(
            vec![column.clone()],
            vec![ColumnValue::Decimal("12.50".into())],
        );
        assert_eq!(
            PostgresColumnValueReader.read(&mut cursor, &column, 0).unwrap(),
            ColumnValue::Decimal("12.50".into())
        );
    }
}
