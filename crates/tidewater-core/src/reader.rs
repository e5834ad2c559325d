//! Column value normalization.
//!
//! [`ColumnValueReader::read`] turns the current row's column into a
//! [`ColumnValue`] in two steps:
//!
//! 1. a type-specific read dispatched on [`ColumnType`]
//!    ([`ColumnValueReader::read_typed`]);
//! 2. a was-null re-check on the cursor, coercing the result to
//!    [`ColumnValue::Null`].
//!
//! Step 2 is required because primitive getters return zero values for
//! SQL NULL. Dialect readers override only step 1 and delegate the type
//! codes they don't special-case to [`read_standard`].

use crate::error::SourceError;
use crate::metadata::{ColumnMetadata, ColumnType};
use crate::source::{LargeObject, RowCursor};
use crate::value::ColumnValue;

/// Reads a column of the cursor's current row into a [`ColumnValue`].
pub trait ColumnValueReader: Send + Sync {
    /// Type-specific read, without null coercion.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the driver cannot produce the value.
    fn read_typed(
        &self,
        cursor: &mut dyn RowCursor,
        column: &ColumnMetadata,
        index: usize,
    ) -> Result<ColumnValue, SourceError>;

    /// Reads a value and applies the was-null coercion.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Read` if the driver cannot produce the value.
    fn read(
        &self,
        cursor: &mut dyn RowCursor,
        column: &ColumnMetadata,
        index: usize,
    ) -> Result<ColumnValue, SourceError> {
        let value = self.read_typed(cursor, column, index)?;
        if cursor.was_null() {
            Ok(ColumnValue::Null)
        } else {
            Ok(value)
        }
    }
}

/// Reader with no dialect overrides.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardColumnValueReader;

impl ColumnValueReader for StandardColumnValueReader {
    fn read_typed(
        &self,
        cursor: &mut dyn RowCursor,
        column: &ColumnMetadata,
        index: usize,
    ) -> Result<ColumnValue, SourceError> {
        read_standard(cursor, column, index)
    }
}

/// The default dispatch on [`ColumnType`].
///
/// Unsigned integers widen to the next signed width. Unsigned `BIGINT`
/// has no wider integer and is read as a decimal. Large objects are read
/// out completely and their handles freed before returning.
///
/// # Errors
///
/// Returns `SourceError::Read` if the driver cannot produce the value or
/// a character large object is not valid UTF-8.
pub fn read_standard(
    cursor: &mut dyn RowCursor,
    column: &ColumnMetadata,
    index: usize,
) -> Result<ColumnValue, SourceError> {
    let value = match column.column_type {
        ColumnType::Boolean => ColumnValue::Bool(cursor.get_bool(index)?),
        ColumnType::TinyInt if column.signed => ColumnValue::Int8(cursor.get_i8(index)?),
        ColumnType::TinyInt => ColumnValue::Int16(cursor.get_i16(index)?),
        ColumnType::SmallInt if column.signed => ColumnValue::Int16(cursor.get_i16(index)?),
        ColumnType::SmallInt => ColumnValue::Int32(cursor.get_i32(index)?),
        ColumnType::Integer if column.signed => ColumnValue::Int32(cursor.get_i32(index)?),
        ColumnType::Integer => ColumnValue::Int64(cursor.get_i64(index)?),
        ColumnType::BigInt if column.signed => ColumnValue::Int64(cursor.get_i64(index)?),
        ColumnType::BigInt | ColumnType::Decimal | ColumnType::Numeric => {
            cursor.get_decimal(index)?.map_or(ColumnValue::Null, ColumnValue::Decimal)
        }
        ColumnType::Real => ColumnValue::Float32(cursor.get_f32(index)?),
        ColumnType::Float | ColumnType::Double => ColumnValue::Float64(cursor.get_f64(index)?),
        ColumnType::Date => cursor.get_date(index)?.map_or(ColumnValue::Null, ColumnValue::Date),
        ColumnType::Time => cursor.get_time(index)?.map_or(ColumnValue::Null, ColumnValue::Time),
        ColumnType::Timestamp => cursor
            .get_timestamp(index)?
            .map_or(ColumnValue::Null, ColumnValue::Timestamp),
        ColumnType::Char
        | ColumnType::VarChar
        | ColumnType::LongVarChar
        | ColumnType::NChar
        | ColumnType::NVarChar
        | ColumnType::LongNVarChar => {
            cursor.get_string(index)?.map_or(ColumnValue::Null, ColumnValue::Text)
        }
        ColumnType::Clob | ColumnType::NClob => match cursor.get_clob(index)? {
            Some(lob) => {
                let bytes = drain_large_object(lob)?;
                let text = String::from_utf8(bytes).map_err(|e| SourceError::Read {
                    index,
                    message: e.to_string(),
                })?;
                ColumnValue::Text(text)
            }
            None => ColumnValue::Null,
        },
        ColumnType::Binary | ColumnType::VarBinary | ColumnType::LongVarBinary => {
            cursor.get_bytes(index)?.map_or(ColumnValue::Null, ColumnValue::Bytes)
        }
        ColumnType::Blob => match cursor.get_blob(index)? {
            Some(lob) => ColumnValue::Bytes(drain_large_object(lob)?),
            None => ColumnValue::Null,
        },
        ColumnType::Other(_) => cursor.get_object(index)?,
    };
    Ok(value)
}

fn drain_large_object(mut lob: Box<dyn LargeObject>) -> Result<Vec<u8>, SourceError> {
    let bytes = lob.read_all()?;
    lob.free()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

    /// One-row cursor over stored values.
    ///
    /// With `zero_for_null`, nullable getters also return a zero value
    /// for NULL instead of `None`, like some drivers do.
    struct FakeCursor {
        columns: Vec<ColumnMetadata>,
        values: Vec<ColumnValue>,
        zero_for_null: bool,
        last_null: bool,
    }

    struct FakeLob(Vec<u8>);

    impl LargeObject for FakeLob {
        fn length(&self) -> u64 {
            self.0.len() as u64
        }
        fn read_all(&mut self) -> Result<Vec<u8>, SourceError> {
            Ok(self.0.clone())
        }
        fn free(self: Box<Self>) -> Result<(), SourceError> {
            Ok(())
        }
    }

    impl FakeCursor {
        fn new(columns: Vec<ColumnMetadata>, values: Vec<ColumnValue>) -> Self {
            Self {
                columns,
                values,
                zero_for_null: false,
                last_null: false,
            }
        }

        fn value(&mut self, index: usize) -> ColumnValue {
            let v = self.values[index].clone();
            self.last_null = v.is_null();
            v
        }

        fn wrong(index: usize) -> SourceError {
            SourceError::Read {
                index,
                message: "type mismatch".into(),
            }
        }

        fn nullable<T>(&self, v: Option<T>, zero: impl FnOnce() -> T) -> Option<T> {
            if v.is_none() && self.zero_for_null {
                Some(zero())
            } else {
                v
            }
        }
    }

    #[async_trait]
    impl RowCursor for FakeCursor {
        async fn next(&mut self) -> Result<bool, SourceError> {
            Ok(false)
        }
        fn columns(&self) -> &[ColumnMetadata] {
            &self.columns
        }
        fn was_null(&self) -> bool {
            self.last_null
        }
        fn get_bool(&mut self, i: usize) -> Result<bool, SourceError> {
            match self.value(i) {
                ColumnValue::Bool(v) => Ok(v),
                ColumnValue::Null => Ok(false),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_i8(&mut self, i: usize) -> Result<i8, SourceError> {
            match self.value(i) {
                ColumnValue::Int8(v) => Ok(v),
                ColumnValue::Null => Ok(0),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_i16(&mut self, i: usize) -> Result<i16, SourceError> {
            match self.value(i) {
                ColumnValue::Int16(v) => Ok(v),
                ColumnValue::Null => Ok(0),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_i32(&mut self, i: usize) -> Result<i32, SourceError> {
            match self.value(i) {
                ColumnValue::Int32(v) => Ok(v),
                ColumnValue::Int64(v) => i32::try_from(v).map_err(|_| Self::wrong(i)),
                ColumnValue::Null => Ok(0),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_i64(&mut self, i: usize) -> Result<i64, SourceError> {
            match self.value(i) {
                ColumnValue::Int64(v) => Ok(v),
                ColumnValue::Null => Ok(0),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_f32(&mut self, i: usize) -> Result<f32, SourceError> {
            match self.value(i) {
                ColumnValue::Float32(v) => Ok(v),
                ColumnValue::Null => Ok(0.0),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_f64(&mut self, i: usize) -> Result<f64, SourceError> {
            match self.value(i) {
                ColumnValue::Float64(v) => Ok(v),
                ColumnValue::Null => Ok(0.0),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_decimal(&mut self, i: usize) -> Result<Option<String>, SourceError> {
            let v = match self.value(i) {
                ColumnValue::Decimal(v) => Some(v),
                ColumnValue::Null => None,
                _ => return Err(Self::wrong(i)),
            };
            Ok(self.nullable(v, || "0".to_string()))
        }
        fn get_date(&mut self, i: usize) -> Result<Option<NaiveDate>, SourceError> {
            let v = match self.value(i) {
                ColumnValue::Date(v) => Some(v),
                ColumnValue::Null => None,
                _ => return Err(Self::wrong(i)),
            };
            Ok(self.nullable(v, || NaiveDate::MIN))
        }
        fn get_time(&mut self, i: usize) -> Result<Option<NaiveTime>, SourceError> {
            let v = match self.value(i) {
                ColumnValue::Time(v) => Some(v),
                ColumnValue::Null => None,
                _ => return Err(Self::wrong(i)),
            };
            Ok(self.nullable(v, || NaiveTime::from_hms_opt(0, 0, 0).unwrap()))
        }
        fn get_timestamp(&mut self, i: usize) -> Result<Option<NaiveDateTime>, SourceError> {
            let v = match self.value(i) {
                ColumnValue::Timestamp(v) => Some(v),
                ColumnValue::Null => None,
                _ => return Err(Self::wrong(i)),
            };
            Ok(self.nullable(v, || NaiveDate::MIN.and_hms_opt(0, 0, 0).unwrap()))
        }
        fn get_string(&mut self, i: usize) -> Result<Option<String>, SourceError> {
            let v = match self.value(i) {
                ColumnValue::Text(v) => Some(v),
                ColumnValue::Null => None,
                _ => return Err(Self::wrong(i)),
            };
            Ok(self.nullable(v, String::new))
        }
        fn get_bytes(&mut self, i: usize) -> Result<Option<Vec<u8>>, SourceError> {
            let v = match self.value(i) {
                ColumnValue::Bytes(v) => Some(v),
                ColumnValue::Null => None,
                _ => return Err(Self::wrong(i)),
            };
            Ok(self.nullable(v, Vec::new))
        }
        fn get_blob(&mut self, i: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
            match self.value(i) {
                ColumnValue::Bytes(v) => Ok(Some(Box::new(FakeLob(v)))),
                ColumnValue::Null if self.zero_for_null => Ok(Some(Box::new(FakeLob(Vec::new())))),
                ColumnValue::Null => Ok(None),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_clob(&mut self, i: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
            match self.value(i) {
                ColumnValue::Text(v) => Ok(Some(Box::new(FakeLob(v.into_bytes())))),
                ColumnValue::Null if self.zero_for_null => Ok(Some(Box::new(FakeLob(Vec::new())))),
                ColumnValue::Null => Ok(None),
                _ => Err(Self::wrong(i)),
            }
        }
        fn get_object(&mut self, i: usize) -> Result<ColumnValue, SourceError> {
            Ok(self.value(i))
        }
    }

    fn all_type_codes() -> Vec<ColumnMetadata> {
        use ColumnType as T;
        let mut columns = Vec::new();
        for (i, ty) in [
            T::Boolean,
            T::TinyInt,
            T::SmallInt,
            T::Integer,
            T::BigInt,
            T::Decimal,
            T::Numeric,
            T::Real,
            T::Float,
            T::Double,
            T::Date,
            T::Time,
            T::Timestamp,
            T::Char,
            T::VarChar,
            T::LongVarChar,
            T::NChar,
            T::NVarChar,
            T::LongNVarChar,
            T::Clob,
            T::NClob,
            T::Binary,
            T::VarBinary,
            T::LongVarBinary,
            T::Blob,
            T::Other(1111),
        ]
        .into_iter()
        .enumerate()
        {
            columns.push(ColumnMetadata::new(format!("c{i}"), ty));
            if ty.is_integer() {
                columns.push(ColumnMetadata::new(format!("u{i}"), ty).unsigned());
            }
        }
        columns
    }

    #[test]
    fn test_null_reads_as_null_for_every_type_code() {
        for zero_for_null in [false, true] {
            let columns = all_type_codes();
            let values = vec![ColumnValue::Null; columns.len()];
            let mut cursor = FakeCursor::new(columns.clone(), values);
            cursor.zero_for_null = zero_for_null;
            for (index, column) in columns.iter().enumerate() {
                let value = StandardColumnValueReader
                    .read(&mut cursor, column, index)
                    .unwrap();
                assert_eq!(value, ColumnValue::Null, "column {} ({:?})", column.name, column.column_type);
            }
        }
    }

    #[test]
    fn test_zero_value_without_null_check_is_wrong() {
        let column = ColumnMetadata::new("qty", ColumnType::Integer);
        let mut cursor = FakeCursor::new(vec![column.clone()], vec![ColumnValue::Null]);
        let typed = StandardColumnValueReader
            .read_typed(&mut cursor, &column, 0)
            .unwrap();
        assert_eq!(typed, ColumnValue::Int32(0));
        let checked = StandardColumnValueReader.read(&mut cursor, &column, 0).unwrap();
        assert_eq!(checked, ColumnValue::Null);
    }

    #[test]
    fn test_unsigned_integer_widens() {
        let column = ColumnMetadata::new("id", ColumnType::Integer).unsigned();
        let mut cursor = FakeCursor::new(vec![column.clone()], vec![ColumnValue::Int64(3_000_000_000)]);
        let value = StandardColumnValueReader.read(&mut cursor, &column, 0).unwrap();
        assert_eq!(value, ColumnValue::Int64(3_000_000_000));
    }

    #[test]
    fn test_signed_integer_rejects_out_of_range() {
        let column = ColumnMetadata::new("id", ColumnType::Integer);
        let mut cursor = FakeCursor::new(vec![column.clone()], vec![ColumnValue::Int64(3_000_000_000)]);
        assert!(StandardColumnValueReader.read(&mut cursor, &column, 0).is_err());
    }

    #[test]
    fn test_unsigned_small_widths() {
        let columns = vec![
            ColumnMetadata::new("a", ColumnType::TinyInt).unsigned(),
            ColumnMetadata::new("b", ColumnType::SmallInt).unsigned(),
            ColumnMetadata::new("c", ColumnType::BigInt).unsigned(),
        ];
        let mut cursor = FakeCursor::new(
            columns.clone(),
            vec![
                ColumnValue::Int16(255),
                ColumnValue::Int32(65_535),
                ColumnValue::Decimal("18446744073709551615".into()),
            ],
        );
        let reader = StandardColumnValueReader;
        assert_eq!(reader.read(&mut cursor, &columns[0], 0).unwrap(), ColumnValue::Int16(255));
        assert_eq!(reader.read(&mut cursor, &columns[1], 1).unwrap(), ColumnValue::Int32(65_535));
        assert_eq!(
            reader.read(&mut cursor, &columns[2], 2).unwrap(),
            ColumnValue::Decimal("18446744073709551615".into())
        );
    }

    #[test]
    fn test_large_objects_are_dereferenced() {
        let columns = vec![
            ColumnMetadata::new("doc", ColumnType::Clob),
            ColumnMetadata::new("img", ColumnType::Blob),
        ];
        let mut cursor = FakeCursor::new(
            columns.clone(),
            vec![ColumnValue::Text("long text".into()), ColumnValue::Bytes(vec![1, 2, 3])],
        );
        let reader = StandardColumnValueReader;
        assert_eq!(
            reader.read(&mut cursor, &columns[0], 0).unwrap(),
            ColumnValue::Text("long text".into())
        );
        assert_eq!(
            reader.read(&mut cursor, &columns[1], 1).unwrap(),
            ColumnValue::Bytes(vec![1, 2, 3])
        );
    }

    #[test]
    fn test_character_variants_normalize_to_text() {
        let columns = vec![
            ColumnMetadata::new("a", ColumnType::NChar),
            ColumnMetadata::new("b", ColumnType::LongNVarChar),
        ];
        let mut cursor = FakeCursor::new(
            columns.clone(),
            vec![ColumnValue::Text("x".into()), ColumnValue::Text("y".into())],
        );
        assert_eq!(
            StandardColumnValueReader.read(&mut cursor, &columns[1], 1).unwrap(),
            ColumnValue::Text("y".into())
        );
    }
}
