//! Deriving positions from live source state.
//!
//! Two initializers exist, one per phase:
//!
//! - [`split_inventory_positions`] reads the unique key bounds of a table
//!   and splits them into job-item ranges for the inventory phase;
//! - [`IncrementalPositionManager::init`] asks the source for its
//!   current change-log marker for the incremental phase.
//!
//! Reloading a persisted position is pure and never touches the source:
//! see [`IncrementalPositionManager::init_from_str`].

use std::fmt;

use async_trait::async_trait;

use tidewater_core::error::{IngestError, PositionError, SourceError};
use tidewater_core::metadata::TableMetadata;
use tidewater_core::position::{IngestPosition, UniqueKeyValue};
use tidewater_core::source::SourceConnection;

use crate::dialect::Dialect;

/// Creates and releases change-log positions for one dialect.
#[async_trait]
pub trait IncrementalPositionManager: Send + Sync + fmt::Debug {
    /// Derives the starting position for the incremental phase and
    /// reserves whatever the source needs to keep it valid (e.g. a
    /// replication slot named from `slot_suffix`).
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` if the source cannot report its position.
    async fn init(
        &self,
        connection: &mut dyn SourceConnection,
        slot_suffix: &str,
    ) -> Result<IngestPosition, SourceError>;

    /// Reloads a persisted position. No I/O.
    ///
    /// # Errors
    ///
    /// Returns a `PositionError` if `serialized` is not a position.
    fn init_from_str(&self, serialized: &str) -> Result<IngestPosition, PositionError> {
        serialized.parse()
    }

    /// Releases source-side resources reserved by [`init`](Self::init).
    ///
    /// # Errors
    ///
    /// Returns a `SourceError` if the release fails. Callers tearing a
    /// job down should use [`destroy_best_effort`] instead.
    async fn destroy(
        &self,
        _connection: &mut dyn SourceConnection,
        _slot_suffix: &str,
    ) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Calls [`IncrementalPositionManager::destroy`], logging and swallowing
/// any failure so teardown always proceeds.
pub async fn destroy_best_effort(
    manager: &dyn IncrementalPositionManager,
    connection: &mut dyn SourceConnection,
    slot_suffix: &str,
) {
    if let Err(e) = manager.destroy(connection, slot_suffix).await {
        tracing::warn!(slot_suffix, error = %e, "Failed to release incremental position resources");
    }
}

/// Splits a table into inventory positions, one per job item.
///
/// - No unique key: a single [`IngestPosition::Placeholder`].
/// - Text key: a single unbounded range.
/// - Integer key: `MIN`/`MAX` are read from the source and split into
///   `ceil(estimated_rows / shard_size)` contiguous inclusive ranges.
///   Without a row estimate, or for an empty table, one range results.
///
/// # Errors
///
/// Returns `IngestError::Source` if the bounds query fails and
/// `IngestError::UnsupportedKeyType` for keys that cannot be ranged.
pub async fn split_inventory_positions(
    connection: &mut dyn SourceConnection,
    dialect: &Dialect,
    table: &TableMetadata,
    shard_size: u64,
) -> Result<Vec<IngestPosition>, IngestError> {
    let Some(key) = table.unique_key_column() else {
        return Ok(vec![IngestPosition::Placeholder]);
    };
    if !key.is_range_key() {
        return Err(IngestError::UnsupportedKeyType {
            table: table.name.clone(),
            column: key.name.clone(),
            type_name: key.type_name.clone(),
        });
    }
    if key.column_type.is_character() {
        return Ok(vec![IngestPosition::range(None, None)]);
    }

    let statement = dialect
        .query_builder()
        .key_bounds(table.schema.as_deref(), &table.name, &key.name);
    let mut cursor = connection.query(&statement).await?;
    if !cursor.next().await? {
        return Ok(vec![IngestPosition::range(None, None)]);
    }
    let reader = dialect.column_reader();
    let min = reader.read(cursor.as_mut(), key, 0)?;
    let max = reader.read(cursor.as_mut(), key, 1)?;
    let (min, max) = match (min.to_unique_key(), max.to_unique_key()) {
        (Some(UniqueKeyValue::Integer(min)), Some(UniqueKeyValue::Integer(max))) => (min, max),
        // MIN/MAX of an empty table.
        _ if min.is_null() && max.is_null() => return Ok(vec![IngestPosition::range(None, None)]),
        _ => {
            return Err(IngestError::InvalidKeyValue {
                table: table.name.clone(),
                column: key.name.clone(),
                message: format!("bounds {min}..{max} are not integer range keys"),
            });
        }
    };

    let shards = match table.estimated_rows {
        Some(rows) if shard_size > 0 && rows > shard_size => rows.div_ceil(shard_size),
        _ => 1,
    };
    Ok(split_range(min, max, shards))
}

/// Splits `[min, max]` into at most `shards` contiguous inclusive ranges.
fn split_range(min: i64, max: i64, shards: u64) -> Vec<IngestPosition> {
    let span = i128::from(max) - i128::from(min) + 1;
    let shards = i128::from(shards).clamp(1, span.max(1));
    let step = span / shards + i128::from(span % shards != 0);
    let mut positions = Vec::new();
    let mut begin = i128::from(min);
    while begin <= i128::from(max) {
        let end = (begin + step - 1).min(i128::from(max));
        positions.push(IngestPosition::range(
            Some(UniqueKeyValue::Integer(narrow(begin))),
            Some(UniqueKeyValue::Integer(narrow(end))),
        ));
        begin = end + 1;
    }
    positions
}

/// `value` is always within `[min, max]` of two `i64`s.
#[allow(clippy::cast_possible_truncation)]
fn narrow(value: i128) -> i64 {
    value as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{orders_table, MemoryDataSource};
    use tidewater_core::metadata::{ColumnMetadata, ColumnType};
    use tidewater_core::source::DataSource;

    fn range(begin: i64, end: i64) -> IngestPosition {
        IngestPosition::range(
            Some(UniqueKeyValue::Integer(begin)),
            Some(UniqueKeyValue::Integer(end)),
        )
    }

    #[test]
    fn test_split_range_even() {
        assert_eq!(
            split_range(1, 100, 4),
            vec![range(1, 25), range(26, 50), range(51, 75), range(76, 100)]
        );
    }

    #[test]
    fn test_split_range_uneven_and_tiny() {
        assert_eq!(split_range(1, 10, 3), vec![range(1, 4), range(5, 8), range(9, 10)]);
        assert_eq!(split_range(5, 5, 10), vec![range(5, 5)]);
    }

    #[test]
    fn test_split_range_extremes() {
        let positions = split_range(i64::MIN, i64::MAX, 2);
        assert_eq!(positions.len(), 2);
        assert_eq!(positions[0], range(i64::MIN, -1));
        assert_eq!(positions[1], range(0, i64::MAX));
    }

    #[tokio::test]
    async fn test_split_by_estimate() {
        let source = MemoryDataSource::new("ds_0");
        source.create_table(orders_table().with_estimated_rows(10_000));
        source.insert_orders(1..=10_000);
        let mut conn = source.connection().await.unwrap();
        let table = source.table_metadata("orders").unwrap();
        let positions = split_inventory_positions(conn.as_mut(), &Dialect::standard(), &table, 2500)
            .await
            .unwrap();
        assert_eq!(
            positions,
            vec![range(1, 2500), range(2501, 5000), range(5001, 7500), range(7501, 10_000)]
        );
    }

    #[tokio::test]
    async fn test_split_empty_table() {
        let source = MemoryDataSource::new("ds_0");
        source.create_table(orders_table());
        let mut conn = source.connection().await.unwrap();
        let table = source.table_metadata("orders").unwrap();
        let positions = split_inventory_positions(conn.as_mut(), &Dialect::standard(), &table, 10)
            .await
            .unwrap();
        assert_eq!(positions, vec![IngestPosition::range(None, None)]);
    }

    #[tokio::test]
    async fn test_split_without_unique_key() {
        let source = MemoryDataSource::new("ds_0");
        let mut conn = source.connection().await.unwrap();
        let table = TableMetadata::new("logs", vec![ColumnMetadata::new("line", ColumnType::VarChar)]);
        let positions = split_inventory_positions(conn.as_mut(), &Dialect::standard(), &table, 10)
            .await
            .unwrap();
        assert_eq!(positions, vec![IngestPosition::Placeholder]);
    }

    #[tokio::test]
    async fn test_split_rejects_float_key() {
        let source = MemoryDataSource::new("ds_0");
        let mut conn = source.connection().await.unwrap();
        let table = TableMetadata::new("m", vec![ColumnMetadata::new("k", ColumnType::Double)])
            .with_unique_key(&["k"]);
        let err = split_inventory_positions(conn.as_mut(), &Dialect::standard(), &table, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedKeyType { .. }));
    }

    #[tokio::test]
    async fn test_split_rejects_unsigned_bigint_key() {
        let source = MemoryDataSource::new("ds_0");
        let table = TableMetadata::new("big", vec![ColumnMetadata::new("id", ColumnType::BigInt).unsigned()])
            .with_unique_key(&["id"]);
        source.create_table(table.clone());
        source.insert("big", vec![tidewater_core::value::ColumnValue::Int64(1)]);
        let mut conn = source.connection().await.unwrap();
        let err = split_inventory_positions(conn.as_mut(), &Dialect::standard(), &table, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::UnsupportedKeyType { ref type_name, .. } if type_name == "BIGINT"));
        assert!(source.query_log().is_empty());
    }

    #[test]
    fn test_init_from_str_is_pure() {
        let manager = crate::dialect::mysql::MySqlPositionManager;
        assert_eq!(
            manager.init_from_str("i,1,10,5").unwrap(),
            IngestPosition::PrimaryKeyRange(tidewater_core::position::PrimaryKeyPosition {
                begin: Some(UniqueKeyValue::Integer(1)),
                end: Some(UniqueKeyValue::Integer(10)),
                current: Some(UniqueKeyValue::Integer(5)),
            })
        );
    }
}
