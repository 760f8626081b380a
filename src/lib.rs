//! pgkit - a PostgreSQL client core.
//!
//! A bounded connection pool that heals itself, transactions that poison on
//! the first error, prepared statements scoped to their transaction, and
//! COPY streaming in both directions. Every call that can wait takes a
//! [`Ctx`] carrying its deadline and cancellation.
//!
//! ```no_run
//! use pgkit::{Ctx, Db, PgOptions};
//!
//! # async fn run() -> pgkit::Result<()> {
//! let ctx = Ctx::background();
//! let db = Db::connect(&ctx, PgOptions::from_url("postgresql://app@localhost/app")?).await?;
//!
//! let tx = db.begin(&ctx).await?;
//! let mut rows: &[u8] = b"hello\t5\nworld\t5\n";
//! tx.copy_from(&ctx, &mut rows, "COPY words FROM STDIN").await?;
//! tx.commit(&ctx).await?;
//! # Ok(())
//! # }
//! ```

pub mod db;
pub mod pg;
pub mod transaction;

pub use db::Db;
pub use pg::{
    CopyRowEncoder, Ctx, FromRow, FromValue, IsolationLevel, PgError, PgError as Error, PgOptions, PgPool,
    PgResult, PgResult as Result, PgValue, PoolStats, QueryResult, Row, TxOptions,
};
pub use transaction::{Stmt, Transaction, TxState};
