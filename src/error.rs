use rusqlite::ErrorCode;
use serde::Serialize;
use std::io;
use strum::{AsRefStr, Display};
use thiserror::Error;

/// Coarse classification of a failure, carried into operation outcomes and reports.
#[derive(AsRefStr, Display, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    TableNotFound,
    TypeMismatch,
    IndexDefinitionConflict,
    PermissionDenied,
    ConnectivityFailure,
    LockContention,
    OperationFailed,
    InvalidDescriptor,
    Config,
}

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("Table '{0}' does not exist")]
    TableNotFound(String),

    #[error("Column '{table}.{column}' has type '{found}' but '{expected}' is required")]
    TypeMismatch {
        table: String,
        column: String,
        expected: String,
        found: String,
    },

    #[error("Index '{name}' already exists with a different definition (existing: {existing}, wanted: {wanted})")]
    IndexDefinitionConflict {
        name: String,
        existing: String,
        wanted: String,
    },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Database unreachable: {0}")]
    ConnectivityFailure(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Operation failed: {0}")]
    OperationFailed(String),

    #[error("Invalid schema descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Connection pool error: {0}")]
    PoolError(#[from] r2d2::Error),
}

impl MigrateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::TableNotFound(_) => ErrorKind::TableNotFound,
            MigrateError::TypeMismatch { .. } => ErrorKind::TypeMismatch,
            MigrateError::IndexDefinitionConflict { .. } => ErrorKind::IndexDefinitionConflict,
            MigrateError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            MigrateError::ConnectivityFailure(_) | MigrateError::PoolError(_) => {
                ErrorKind::ConnectivityFailure
            }
            MigrateError::LockContention(_) => ErrorKind::LockContention,
            MigrateError::OperationFailed(_) | MigrateError::IoError(_) => {
                ErrorKind::OperationFailed
            }
            MigrateError::InvalidDescriptor(_) => ErrorKind::InvalidDescriptor,
            MigrateError::Config(_) => ErrorKind::Config,
        }
    }

    /// Only lock contention is worth retrying; everything else goes to the operator.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::LockContention
    }
}

impl From<rusqlite::Error> for MigrateError {
    fn from(err: rusqlite::Error) -> Self {
        let message = err.to_string();
        match err.sqlite_error_code() {
            Some(ErrorCode::PermissionDenied)
            | Some(ErrorCode::ReadOnly)
            | Some(ErrorCode::AuthorizationForStatementDenied) => {
                MigrateError::PermissionDenied(message)
            }
            Some(ErrorCode::CannotOpen)
            | Some(ErrorCode::NotADatabase)
            | Some(ErrorCode::SystemIoFailure) => MigrateError::ConnectivityFailure(message),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                MigrateError::LockContention(message)
            }
            _ => MigrateError::OperationFailed(message),
        }
    }
}

impl From<figment::Error> for MigrateError {
    fn from(err: figment::Error) -> Self {
        MigrateError::Config(err.to_string())
    }
}
