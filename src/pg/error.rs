//! Error types for the PostgreSQL client.
//!
//! Every failure is a [`PgError`]. [`ErrorKind`] groups the variants by how far
//! the damage reaches: a connection fault retires the physical connection, a
//! query or COPY fault only poisons the enclosing transaction, and client faults
//! never touch any state.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// SQLSTATE for `invalid_sql_statement_name`.
pub const INVALID_SQL_STATEMENT_NAME: &str = "26000";

/// SQLSTATE for `in_failed_sql_transaction`.
pub const IN_FAILED_SQL_TRANSACTION: &str = "25P02";

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Connection is closed or has been marked unusable.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Authentication failed during startup.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Unexpected or malformed server message; the session is desynchronized.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server reported an SQL error.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// The server rejected a COPY in progress.
    #[error("COPY failed: {0}")]
    Copy(Box<ServerError>),

    /// Reading the COPY source or writing the COPY sink failed.
    #[error("COPY stream failed: {0}")]
    CopySource(io::Error),

    /// The transaction is in the errored state; nothing was sent to the server.
    #[error("current transaction is aborted, commands ignored until end of transaction block")]
    TxAborted,

    /// The transaction has already been committed or rolled back.
    #[error("transaction has already been committed or rolled back")]
    TxDone,

    /// The prepared statement was closed, explicitly or with its transaction.
    #[error("statement is closed")]
    StmtClosed,

    /// `query_one` got an empty result set.
    #[error("no rows in result set")]
    NoRows,

    /// `query_one` got more than one row.
    #[error("multiple rows in result set")]
    MultipleRows,

    /// Type conversion error.
    #[error("type error: {0}")]
    Type(String),

    /// Invalid options.
    #[error("configuration error: {0}")]
    Config(String),

    /// The call does not fit the statement it was given.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Deadline expired while suspended.
    #[error("operation timed out")]
    Timeout,

    /// Cancellation was requested while suspended.
    #[error("operation cancelled")]
    Cancelled,

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,
}

/// Coarse classification of a [`PgError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transport failure; the connection is retired.
    Connection,
    /// Framing desync or malformed message; the connection is retired.
    Protocol,
    /// Well-formed SQL error reported by the server.
    Query,
    /// COPY rejected by the server or failed on the caller's stream.
    Copy,
    /// Deadline expired.
    Timeout,
    /// Cancellation requested.
    Cancelled,
    /// Misuse or client-side condition; nothing changed on the wire.
    Client,
}

impl PgError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PgError::Io(_) | PgError::ConnectionClosed | PgError::Auth(_) => ErrorKind::Connection,
            PgError::Protocol(_) => ErrorKind::Protocol,
            PgError::Server(_) => ErrorKind::Query,
            PgError::Copy(_) | PgError::CopySource(_) => ErrorKind::Copy,
            PgError::Timeout => ErrorKind::Timeout,
            PgError::Cancelled => ErrorKind::Cancelled,
            PgError::TxAborted
            | PgError::TxDone
            | PgError::StmtClosed
            | PgError::NoRows
            | PgError::MultipleRows
            | PgError::Type(_)
            | PgError::Config(_)
            | PgError::InvalidOperation(_)
            | PgError::PoolClosed => ErrorKind::Client,
        }
    }

    /// Whether this error means the physical connection can no longer be trusted.
    pub fn is_connection_fault(&self) -> bool {
        matches!(self.kind(), ErrorKind::Connection | ErrorKind::Protocol)
    }

    /// Whether this error aborts the server-side transaction it happened in.
    pub fn poisons_transaction(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Query | ErrorKind::Copy | ErrorKind::Connection | ErrorKind::Protocol
        )
    }

    /// The server-reported error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) | PgError::Copy(e) => Some(e),
            _ => None,
        }
    }

    /// The SQLSTATE code of a server-reported error.
    pub fn code(&self) -> Option<&str> {
        self.server_error().map(|e| e.code.as_str())
    }
}

/// An ErrorResponse sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
    pub where_: Option<String>,
}

impl ServerError {
    /// Build from the raw field map of an ErrorResponse or NoticeResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            // 'V' is the non-localized severity, present since 9.6
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').and_then(|p| p.parse().ok()),
            where_: fields.get(&b'W').cloned(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(Box::new(e))
    }
}
