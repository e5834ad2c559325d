//! # Tidewater Core
//!
//! The ingest model shared by every Tidewater dumper and job:
//!
//! ```text
//!   source ──► RowCursor ──► ColumnValueReader ──► Record ──► RecordSender
//!                                                               │ (bounded)
//!   IngestPosition ◄── ack ◄── RecordReceiver ◄─────────────────┘
//! ```
//!
//! - [`position`]: resumable checkpoints (`IngestPosition`)
//! - [`record`]: data and sentinel records pushed through a channel
//! - [`value`] / [`metadata`]: dialect-agnostic column values and types
//! - [`source`]: connection, statement and row cursor contracts
//! - [`reader`]: column value normalization with null coercion
//! - [`channel`]: bounded FIFO between a dumper and its importer
//! - [`rate_limit`]: pluggable read/write throttles
//! - [`config`]: flat property maps

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod channel;
pub mod config;
pub mod error;
pub mod metadata;
pub mod position;
pub mod rate_limit;
pub mod reader;
pub mod record;
pub mod source;
pub mod value;

pub use channel::{create_channel, AckCallback, ChannelMetrics, RecordReceiver, RecordSender};
pub use config::{ConfigKeySpec, Properties};
pub use error::{ConfigError, IngestError, PositionError, SourceError};
pub use metadata::{ColumnMetadata, ColumnType, TableMetadata, TableMetadataLoader};
pub use position::{IngestPosition, LogPosition, PrimaryKeyPosition, UniqueKeyValue};
pub use rate_limit::{OperationKind, RateLimiter, RateLimiterConfig};
pub use reader::{ColumnValueReader, StandardColumnValueReader};
pub use record::{Column, DataRecord, Record, RecordKind};
pub use source::{DataSource, KeyBound, LargeObject, QueryShape, RowCursor, SourceConnection, Statement};
pub use value::ColumnValue;
