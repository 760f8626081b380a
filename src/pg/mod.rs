//! PostgreSQL wire protocol client.
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding
//! - `types`, `row`: Value codecs and row decoding
//! - `auth`: Cleartext, MD5 and SCRAM-SHA-256 authentication
//! - `connection`: One session over one transport, with health tracking
//! - `statement`: Prepared statement metadata and the per-connection cache
//! - `copy`: COPY FROM STDIN / TO STDOUT streaming and the COPY text format
//! - `pool`: Bounded connection pool with health-based eviction
//! - `context`: Deadlines and cancellation for every suspending call

pub mod auth;
pub mod config;
pub mod connection;
pub mod context;
pub mod copy;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod row;
pub mod statement;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;


pub use config::{IsolationLevel, PgOptions, TxOptions};
pub use connection::{BoxedTransport, CancelToken, Health, PgConnection, Transport};
pub use context::{CancelHandle, Ctx, Interrupt};
pub use copy::{parse_copy_text_row, CopyRowEncoder};
pub use error::{ErrorKind, PgError, PgResult, ServerError};
pub use pool::{ConnId, Connector, PgPool, PoolStats, PooledConnection, TcpConnector};
pub use row::{FromRow, FromValue, QueryResult, Row};
pub use statement::{PreparedStatement, SharedColumns};
pub use types::{Oid, PgValue};
