//! Error types shared across the ingest pipeline.
//!
//! Errors are layered: drivers raise [`SourceError`], checkpoint parsing
//! raises [`PositionError`], property parsing raises [`ConfigError`], and
//! dumpers wrap all of them into [`IngestError`] with table/round context.

/// Errors raised by a source driver (connection, query, or row access).
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// Failed to obtain or use a connection.
    #[error("connection failed: {0}")]
    Connection(String),

    /// A statement failed to execute.
    #[error("query failed: {0}")]
    Query(String),

    /// A column could not be read or converted.
    #[error("read failed for column {index}: {message}")]
    Read {
        /// Zero-based column index within the result row.
        index: usize,
        /// Driver message.
        message: String,
    },

    /// A row getter was called with no current row.
    #[error("cursor is not positioned on a row")]
    NoCurrentRow,

    /// Table or column metadata could not be resolved.
    #[error("metadata unavailable: {0}")]
    Metadata(String),
}

/// Errors raised when decoding a persisted position.
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    /// The textual form does not match any known position kind.
    #[error("unrecognized position '{0}'")]
    Unrecognized(String),

    /// A key value in the textual form is malformed.
    #[error("invalid key value '{value}' in position: {message}")]
    InvalidKey {
        /// The offending fragment.
        value: String,
        /// Parse failure detail.
        message: String,
    },

    /// The structured (JSON) form could not be decoded.
    #[error("invalid structured position: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised while reading configuration properties.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required key is absent.
    #[error("missing required property '{0}'")]
    Missing(String),

    /// A value is present but cannot be parsed.
    #[error("invalid value '{value}' for property '{key}': {message}")]
    Invalid {
        /// Property key.
        key: String,
        /// Raw value.
        value: String,
        /// Parse failure detail.
        message: String,
    },

    /// A value names an unknown implementation.
    #[error("unsupported {kind} '{name}'")]
    Unsupported {
        /// What was being selected (e.g. "rate limiter").
        kind: &'static str,
        /// The requested name.
        name: String,
    },
}

/// Errors raised by inventory and incremental dumpers.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// The table's unique key cannot drive a range scan.
    #[error("unsupported unique key type for {table}.{column}: {type_name}")]
    UnsupportedKeyType {
        /// Table name.
        table: String,
        /// Key column name.
        column: String,
        /// Source type name of the key column.
        type_name: String,
    },

    /// The dumper configuration is inconsistent (e.g. a range position
    /// on a table without a unique key).
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// A read batch failed during the inventory scan.
    #[error("inventory dump of {table} failed at round {round}, position {position}: {source}")]
    Dump {
        /// Table being dumped.
        table: String,
        /// One-based batch round.
        round: u64,
        /// Last committed position, in textual form.
        position: String,
        /// Underlying driver error.
        #[source]
        source: SourceError,
    },

    /// The log event source failed during the incremental phase.
    #[error("incremental dump failed at position {position}: {source}")]
    Incremental {
        /// Last pushed position, in textual form.
        position: String,
        /// Underlying driver error.
        #[source]
        source: SourceError,
    },

    /// A row carried a null or unusable unique key value.
    #[error("invalid unique key value in {table}.{column}: {message}")]
    InvalidKeyValue {
        /// Table name.
        table: String,
        /// Key column name.
        column: String,
        /// Detail.
        message: String,
    },

    /// The consumer side of the channel is gone.
    #[error("record channel closed")]
    ChannelClosed,

    /// A persisted position could not be decoded.
    #[error(transparent)]
    Position(#[from] PositionError),

    /// A source call outside a read batch failed.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Configuration error.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_error_carries_context() {
        let err = IngestError::Dump {
            table: "orders".into(),
            round: 3,
            position: "i,1,10000,2000".into(),
            source: SourceError::Query("timeout".into()),
        };
        let msg = err.to_string();
        assert!(msg.contains("orders"));
        assert!(msg.contains("round 3"));
        assert!(msg.contains("i,1,10000,2000"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_source_error_converts() {
        let err: IngestError = SourceError::Connection("refused".into()).into();
        assert!(matches!(err, IngestError::Source(SourceError::Connection(_))));
    }
}
