//! Error types for the ferry engine.

use crate::{conflict::ConflictType, ColumnName, ScopeId, TableName};
use thiserror::Error;

/// All possible errors from the ferry engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Schema errors
    #[error("table not found: {0}")]
    TableNotFound(TableName),

    #[error("table {0} has no primary key")]
    MissingPrimaryKey(TableName),

    #[error("invalid primary key column '{column}' on table {table}: {reason}")]
    InvalidPrimaryKey {
        table: TableName,
        column: ColumnName,
        reason: String,
    },

    #[error("duplicate column '{column}' on table {table}")]
    DuplicateColumn { table: TableName, column: ColumnName },

    #[error("invalid filter column '{column}' on table {table}: {reason}")]
    InvalidFilterColumn {
        table: TableName,
        column: ColumnName,
        reason: String,
    },

    #[error("schema mismatch for table {table}: {detail}")]
    SchemaMismatch { table: TableName, detail: String },

    // Row errors
    #[error("invalid row for table {table}: {reason}")]
    InvalidRow { table: TableName, reason: String },

    #[error("missing required field: {0}")]
    MissingRequiredField(ColumnName),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: ColumnName,
        expected: String,
        got: String,
    },

    // Storage errors
    #[error("transient storage error: {0}")]
    TransientStorage(String),

    #[error("storage error: {0}")]
    Storage(String),

    // Sync errors
    #[error("unresolved {conflict_type} conflict on {table} {key}")]
    ConflictUnresolved {
        table: TableName,
        key: String,
        conflict_type: ConflictType,
    },

    #[error("cannot synchronize replica {0} with itself")]
    SameReplica(ScopeId),

    #[error("invalid change batch: {0}")]
    InvalidBatch(String),

    #[error("unsupported by this provider: {0}")]
    Unsupported(String),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Schema errors are fatal and raised before any change moves.
    pub fn is_schema_error(&self) -> bool {
        matches!(
            self,
            Error::TableNotFound(_)
                | Error::MissingPrimaryKey(_)
                | Error::InvalidPrimaryKey { .. }
                | Error::DuplicateColumn { .. }
                | Error::InvalidFilterColumn { .. }
                | Error::SchemaMismatch { .. }
        )
    }

    /// Whether retrying the whole session may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStorage(_))
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
