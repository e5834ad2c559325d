//! `PostgreSQL` data source backed by `deadpool-postgres`.
//!
//! Implements [`DataSource`], [`SourceConnection`] and [`RowCursor`] over
//! `tokio-postgres`. Statements are prepared first so result metadata is
//! known before the first row; rows are then streamed with `query_raw`,
//! so a full scan never materializes the whole table.
//!
//! The fetch-size hint is not forwarded: rows already arrive as a
//! stream, and key-ordered pages are bounded by their `LIMIT`.

use std::error::Error as StdError;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use futures_util::StreamExt;
use tokio_postgres::types::{FromSql, FromSqlOwned, ToSql, Type};
use tokio_postgres::{Row, RowStream};

use tidewater_core::error::SourceError;
use tidewater_core::metadata::{ColumnMetadata, ColumnType, TableMetadata, TableMetadataLoader};
use tidewater_core::source::{DataSource, LargeObject, RowCursor, SourceConnection, Statement};
use tidewater_core::value::ColumnValue;

/// Connection settings for a [`PostgresDataSource`].
#[derive(Debug, Clone)]
pub struct PostgresSourceConfig {
    /// Data source name used in progress reports.
    pub name: String,
    /// Key-value or URI connection string.
    pub connection_string: String,
    /// Maximum pooled connections (default: 10).
    pub max_pool_size: usize,
    /// Per-statement timeout (default: 30s).
    pub query_timeout: Duration,
}

impl Default for PostgresSourceConfig {
    fn default() -> Self {
        Self {
            name: "postgres".to_string(),
            connection_string: String::new(),
            max_pool_size: 10,
            query_timeout: Duration::from_secs(30),
        }
    }
}

/// Pooled `PostgreSQL` source.
pub struct PostgresDataSource {
    config: PostgresSourceConfig,
    pool: deadpool_postgres::Pool,
}

impl PostgresDataSource {
    /// Creates the pool. Connectivity is checked on first use.
    ///
    /// # Errors
    ///
    /// Returns `SourceError::Connection` if the connection string is
    /// invalid or the pool cannot be built.
    pub fn new(config: PostgresSourceConfig) -> Result<Self, SourceError> {
        let pg_config: tokio_postgres::Config = config
            .connection_string
            .parse()
            .map_err(|e| SourceError::Connection(format!("invalid connection string: {e}")))?;
        let manager = deadpool_postgres::Manager::from_config(
            pg_config,
            tokio_postgres::NoTls,
            deadpool_postgres::ManagerConfig {
                recycling_method: deadpool_postgres::RecyclingMethod::Fast,
            },
        );
        let pool = deadpool_postgres::Pool::builder(manager)
            .max_size(config.max_pool_size)
            .build()
            .map_err(|e| SourceError::Connection(format!("pool creation failed: {e}")))?;
        Ok(Self { config, pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, SourceError> {
        self.pool
            .get()
            .await
            .map_err(|e| SourceError::Connection(format!("pool get failed: {e}")))
    }
}

impl std::fmt::Debug for PostgresDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDataSource")
            .field("name", &self.config.name)
            .field("max_pool_size", &self.config.max_pool_size)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DataSource for PostgresDataSource {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn connection(&self) -> Result<Box<dyn SourceConnection>, SourceError> {
        Ok(Box::new(PostgresConnection {
            client: self.client().await?,
            timeout: self.config.query_timeout,
        }))
    }
}

#[async_trait]
impl TableMetadataLoader for PostgresDataSource {
    async fn load(&self, schema: Option<&str>, table: &str) -> Result<TableMetadata, SourceError> {
        let client = self.client().await?;
        let schema = schema.unwrap_or("public");
        let regclass = format!(
            "\"{}\".\"{}\"",
            schema.replace('"', "\"\""),
            table.replace('"', "\"\"")
        );

        let probe = client
            .prepare(&format!("SELECT * FROM {regclass} LIMIT 0"))
            .await
            .map_err(query_error)?;
        let not_null: Vec<String> = client
            .query(
                "SELECT column_name::text FROM information_schema.columns \
                 WHERE table_schema::text = $1 AND table_name::text = $2 AND is_nullable = 'NO'",
                &[&schema, &table],
            )
            .await
            .map_err(query_error)?
            .iter()
            .map(|row| row.get::<_, String>(0))
            .collect();
        let columns = probe
            .columns()
            .iter()
            .map(|c| {
                let mut column = column_metadata(c.name(), c.type_());
                column.nullable = !not_null.iter().any(|n| n == c.name());
                column
            })
            .collect();

        let key: Vec<String> = client
            .query(
                "SELECT a.attname::text FROM pg_index i \
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
                 WHERE i.indrelid = $1::text::regclass AND i.indisprimary \
                 ORDER BY array_position(i.indkey::int2[], a.attnum)",
                &[&regclass],
            )
            .await
            .map_err(query_error)?
            .iter()
            .map(|row| row.get::<_, String>(0))
            .collect();
        let estimate: i64 = client
            .query_one(
                "SELECT reltuples::bigint FROM pg_class WHERE oid = $1::text::regclass",
                &[&regclass],
            )
            .await
            .map_err(query_error)?
            .get(0);

        let mut metadata = TableMetadata::new(table, columns);
        metadata.schema = Some(schema.to_string());
        metadata.unique_key_columns = key;
        if let Ok(rows) = u64::try_from(estimate) {
            metadata = metadata.with_estimated_rows(rows);
        }
        tracing::debug!(table = %regclass, columns = metadata.columns.len(), "Loaded table metadata");
        Ok(metadata)
    }
}

fn query_error(e: tokio_postgres::Error) -> SourceError {
    SourceError::Query(e.to_string())
}

/// Maps a server type to its column type code.
#[must_use]
pub fn column_metadata(name: &str, ty: &Type) -> ColumnMetadata {
    let column_type = match *ty {
        Type::BOOL => ColumnType::Boolean,
        Type::INT2 => ColumnType::SmallInt,
        Type::INT4 => ColumnType::Integer,
        Type::INT8 => ColumnType::BigInt,
        Type::NUMERIC => ColumnType::Numeric,
        Type::MONEY => ColumnType::Decimal,
        Type::FLOAT4 => ColumnType::Real,
        Type::FLOAT8 => ColumnType::Double,
        Type::DATE => ColumnType::Date,
        Type::TIME => ColumnType::Time,
        Type::TIMESTAMP | Type::TIMESTAMPTZ => ColumnType::Timestamp,
        Type::CHAR | Type::BPCHAR => ColumnType::Char,
        Type::VARCHAR => ColumnType::VarChar,
        Type::TEXT | Type::NAME => ColumnType::LongVarChar,
        Type::BYTEA => ColumnType::VarBinary,
        _ => ColumnType::Other(i32::try_from(ty.oid()).unwrap_or(i32::MAX)),
    };
    ColumnMetadata::new(name, column_type).with_type_name(ty.name())
}

struct PostgresConnection {
    client: deadpool_postgres::Object,
    timeout: Duration,
}

type Param = Box<dyn ToSql + Sync + Send>;

fn to_param(value: &ColumnValue) -> Param {
    match value {
        ColumnValue::Null => Box::new(Option::<String>::None),
        ColumnValue::Bool(v) => Box::new(*v),
        ColumnValue::Int8(v) => Box::new(i16::from(*v)),
        ColumnValue::Int16(v) => Box::new(*v),
        ColumnValue::Int32(v) => Box::new(*v),
        ColumnValue::Int64(v) => Box::new(*v),
        // Bound as text; statements cast where a numeric is expected.
        ColumnValue::Decimal(v) | ColumnValue::Text(v) => Box::new(v.clone()),
        ColumnValue::Float32(v) => Box::new(*v),
        ColumnValue::Float64(v) => Box::new(*v),
        ColumnValue::Date(v) => Box::new(*v),
        ColumnValue::Time(v) => Box::new(*v),
        ColumnValue::Timestamp(v) => Box::new(*v),
        ColumnValue::Bytes(v) => Box::new(v.clone()),
    }
}

#[async_trait]
impl SourceConnection for PostgresConnection {
    async fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowCursor>, SourceError> {
        let params: Vec<Param> = statement.params.iter().map(to_param).collect();
        let started = tokio::time::timeout(self.timeout, async {
            let prepared = self.client.prepare(&statement.sql).await?;
            let stream = self
                .client
                .query_raw(
                    &prepared,
                    params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)),
                )
                .await?;
            Ok::<_, tokio_postgres::Error>((prepared, stream))
        })
        .await
        .map_err(|_| SourceError::Query(format!("statement timed out after {:?}", self.timeout)))?;
        let (prepared, stream) = started.map_err(query_error)?;
        let types = prepared.columns().iter().map(|c| c.type_().clone()).collect();
        let columns = prepared
            .columns()
            .iter()
            .map(|c| column_metadata(c.name(), c.type_()))
            .collect();
        Ok(Box::new(PostgresRowCursor {
            stream: Box::pin(stream),
            columns,
            types,
            current: None,
            last_null: false,
        }))
    }
}

struct PostgresRowCursor {
    stream: Pin<Box<RowStream>>,
    columns: Vec<ColumnMetadata>,
    types: Vec<Type>,
    current: Option<Row>,
    last_null: bool,
}

impl PostgresRowCursor {
    fn get<T: FromSqlOwned>(&mut self, index: usize) -> Result<Option<T>, SourceError> {
        let row = self.current.as_ref().ok_or(SourceError::NoCurrentRow)?;
        let value: Option<T> = row.try_get(index).map_err(|e| read_error(index, &e))?;
        self.last_null = value.is_none();
        Ok(value)
    }

    fn column_type(&self, index: usize) -> Result<&Type, SourceError> {
        self.types.get(index).ok_or_else(|| SourceError::Read {
            index,
            message: format!("result has {} columns", self.types.len()),
        })
    }

    fn integer(&mut self, index: usize) -> Result<i64, SourceError> {
        let value = match self.column_type(index)?.clone() {
            Type::INT2 => self.get::<i16>(index)?.map(i64::from),
            Type::INT4 => self.get::<i32>(index)?.map(i64::from),
            Type::OID => self.get::<u32>(index)?.map(i64::from),
            _ => self.get::<i64>(index)?,
        };
        Ok(value.unwrap_or(0))
    }

    fn narrow<T: TryFrom<i64>>(&mut self, index: usize) -> Result<T, SourceError> {
        let wide = self.integer(index)?;
        T::try_from(wide).map_err(|_| SourceError::Read {
            index,
            message: format!("{wide} out of range"),
        })
    }
}

fn read_error(index: usize, e: &dyn StdError) -> SourceError {
    SourceError::Read {
        index,
        message: e.to_string(),
    }
}

#[async_trait]
impl RowCursor for PostgresRowCursor {
    async fn next(&mut self) -> Result<bool, SourceError> {
        self.current = self.stream.next().await.transpose().map_err(query_error)?;
        Ok(self.current.is_some())
    }

    fn columns(&self) -> &[ColumnMetadata] {
        &self.columns
    }

    fn was_null(&self) -> bool {
        self.last_null
    }

    fn get_bool(&mut self, index: usize) -> Result<bool, SourceError> {
        Ok(self.get::<bool>(index)?.unwrap_or(false))
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

    fn get_f32(&mut self, index: usize) -> Result<f32, SourceError> {
        Ok(self.get::<f32>(index)?.unwrap_or(0.0))
    }

    fn get_f64(&mut self, index: usize) -> Result<f64, SourceError> {
        if *self.column_type(index)? == Type::FLOAT4 {
            return Ok(self.get::<f32>(index)?.map_or(0.0, f64::from));
        }
        Ok(self.get::<f64>(index)?.unwrap_or(0.0))
    }

    fn get_decimal(&mut self, index: usize) -> Result<Option<String>, SourceError> {
        match self.column_type(index)?.clone() {
            Type::NUMERIC => Ok(self.get::<PgNumeric>(index)?.map(|n| n.0)),
            Type::MONEY => Ok(self.get::<PgMoney>(index)?.map(|m| m.0)),
            Type::INT2 | Type::INT4 | Type::INT8 => {
                let v = self.integer(index)?;
                Ok((!self.last_null).then(|| v.to_string()))
            }
            _ => self.get::<String>(index),
        }
    }

    fn get_date(&mut self, index: usize) -> Result<Option<NaiveDate>, SourceError> {
        self.get::<NaiveDate>(index)
    }

    fn get_time(&mut self, index: usize) -> Result<Option<NaiveTime>, SourceError> {
        self.get::<NaiveTime>(index)
    }

    fn get_timestamp(&mut self, index: usize) -> Result<Option<NaiveDateTime>, SourceError> {
        if *self.column_type(index)? == Type::TIMESTAMPTZ {
            return Ok(self.get::<DateTime<Utc>>(index)?.map(|t| t.naive_utc()));
        }
        self.get::<NaiveDateTime>(index)
    }

    fn get_string(&mut self, index: usize) -> Result<Option<String>, SourceError> {
        match self.column_type(index)?.clone() {
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::CHAR => {
                self.get::<String>(index)
            }
            _ => Ok(self.get::<PgText>(index)?.map(|t| t.0)),
        }
    }

    fn get_bytes(&mut self, index: usize) -> Result<Option<Vec<u8>>, SourceError> {
        self.get::<Vec<u8>>(index)
    }

    fn get_blob(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
        Ok(self
            .get_bytes(index)?
            .map(|b| Box::new(InlineObject(b)) as Box<dyn LargeObject>))
    }

    fn get_clob(&mut self, index: usize) -> Result<Option<Box<dyn LargeObject>>, SourceError> {
        Ok(self
            .get_string(index)?
            .map(|s| Box::new(InlineObject(s.into_bytes())) as Box<dyn LargeObject>))
    }

    fn get_object(&mut self, index: usize) -> Result<ColumnValue, SourceError> {
        Ok(self
            .get_string(index)?
            .map_or(ColumnValue::Null, ColumnValue::Text))
    }
}

/// `bytea` and `text` values are already inline; nothing to free.
struct InlineObject(Vec<u8>);

impl LargeObject for InlineObject {
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

type FromSqlResult<T> = Result<T, Box<dyn StdError + Sync + Send>>;

/// `numeric` decoded from the binary wire format into exact decimal text.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> FromSqlResult<Self> {
        decode_numeric(raw).map(PgNumeric)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

fn read_i16(raw: &[u8], at: usize) -> FromSqlResult<i16> {
    raw.get(at..at + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| "truncated numeric".into())
}

/// Binary layout: `ndigits`, `weight`, `sign`, `dscale`, then `ndigits`
/// base-10000 digits, all big-endian 16-bit.
fn decode_numeric(raw: &[u8]) -> FromSqlResult<String> {
    let ndigits = usize::try_from(read_i16(raw, 0)?)?;
    let weight = i32::from(read_i16(raw, 2)?);
    let sign = read_i16(raw, 4)?.to_be_bytes();
    let dscale = usize::try_from(read_i16(raw, 6)?)?;
    match sign {
        [0x00, 0x00] | [0x40, 0x00] => {}
        [0xC0, 0x00] => return Ok("NaN".to_string()),
        _ => return Err("unsupported numeric sign".into()),
    }
    let mut digits = Vec::with_capacity(ndigits);
    for i in 0..ndigits {
        digits.push(read_i16(raw, 8 + i * 2)?);
    }
    let digit_at = |position: i32| -> i16 {
        usize::try_from(position)
            .ok()
            .and_then(|p| digits.get(p).copied())
            .unwrap_or(0)
    };

    let mut text = String::new();
    if sign == [0x40, 0x00] {
        text.push('-');
    }
    if weight < 0 {
        text.push('0');
    } else {
        text.push_str(&digit_at(0).to_string());
        for position in 1..=weight {
            text.push_str(&format!("{:04}", digit_at(position)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut position = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit_at(position)));
            position += 1;
        }
        fraction.truncate(dscale);
        text.push('.');
        text.push_str(&fraction);
    }
    if text == "-0" || text.starts_with("-0.") && text[3..].bytes().all(|b| b == b'0') {
        text.remove(0);
    }
    Ok(text)
}

/// `money` is a 64-bit count of cents on the wire.
struct PgMoney(String);

impl<'a> FromSql<'a> for PgMoney {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> FromSqlResult<Self> {
        let bytes: [u8; 8] = raw.try_into().map_err(|_| "money must be 8 bytes")?;
        let cents = i64::from_be_bytes(bytes);
        let sign = if cents < 0 { "-" } else { "" };
        let abs = cents.unsigned_abs();
        Ok(PgMoney(format!("{sign}{}.{:02}", abs / 100, abs % 100)))
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::MONEY
    }
}

/// Textual rendering of types without a dedicated getter.
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(ty: &Type, raw: &'a [u8]) -> FromSqlResult<Self> {
        let text = match *ty {
            // Version byte precedes the JSON text.
            Type::JSONB => std::str::from_utf8(raw.get(1..).unwrap_or_default())?.to_string(),
            Type::UUID => {
                let hex: String = raw.iter().map(|b| format!("{b:02x}")).collect();
                if hex.len() != 32 {
                    return Err("uuid must be 16 bytes".into());
                }
                format!(
                    "{}-{}-{}-{}-{}",
                    &hex[0..8],
                    &hex[8..12],
                    &hex[12..16],
                    &hex[16..20],
                    &hex[20..32]
                )
            }
            _ => String::from_utf8_lossy(raw).into_owned(),
        };
        Ok(PgText(text))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}
