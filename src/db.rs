//! The caller-facing database handle.

use std::future::Future;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::pg::config::{PgOptions, TxOptions};
use crate::pg::context::Ctx;
use crate::pg::error::{PgError, PgResult};
use crate::pg::pool::{Connector, PgPool};
use crate::pg::row::{QueryResult, Row};
use crate::pg::types::PgValue;
use crate::transaction::Transaction;

/// A pooled PostgreSQL database.
///
/// Build one per process and pass clones to whoever needs it; clones share
/// the pool.
#[derive(Debug, Clone)]
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect over TCP.
    pub async fn connect(ctx: &Ctx, options: PgOptions) -> PgResult<Self> {
        Ok(Self::from_pool(PgPool::connect(ctx, options).await?))
    }

    /// Connect through a custom [`Connector`].
    pub async fn with_connector(ctx: &Ctx, options: PgOptions, connector: Arc<dyn Connector>) -> PgResult<Self> {
        Ok(Self::from_pool(PgPool::with_connector(ctx, options, connector).await?))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction with the server's default options.
    pub async fn begin(&self, ctx: &Ctx) -> PgResult<Transaction> {
        self.begin_with(ctx, TxOptions::default()).await
    }

    /// Begin a transaction.
    ///
    /// If BEGIN fails because the dispensed connection turned out to be
    /// broken, it is retried once on a fresh connection. Nothing else is
    /// ever retried.
    pub async fn begin_with(&self, ctx: &Ctx, options: TxOptions) -> PgResult<Transaction> {
        let sql = options.begin_sql();
        let mut retried = false;
        loop {
            let mut conn = self.pool.get(ctx).await?;
            match conn.simple_query(ctx, &sql).await {
                Ok(_) => return Ok(Transaction::new(conn)),
                Err(e) if e.is_connection_fault() && !retried => {
                    warn!(conn_id = conn.id(), error = %e, "BEGIN failed on a broken connection, retrying");
                    retried = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run a statement outside any transaction and return the rows affected.
    pub async fn exec(&self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(ctx, sql, params).await?.rows_affected())
    }

    /// Run a statement outside any transaction.
    pub async fn query(&self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut conn = self.pool.get(ctx).await?;
        conn.query(ctx, sql, params).await
    }

    /// Run a statement that must return exactly one row.
    pub async fn query_one(&self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<Row> {
        self.query(ctx, sql, params).await?.into_one()
    }

    /// Run `f` in a transaction: commit if it succeeds, roll back if it fails.
    ///
    /// `f` may end the transaction itself; the final commit or rollback is
    /// then skipped. As with [`Transaction::commit`], an errored transaction
    /// is rolled back and `f`'s value is still returned.
    pub async fn run_in_transaction<F, Fut, T>(&self, ctx: &Ctx, f: F) -> PgResult<T>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = PgResult<T>>,
    {
        let tx = self.begin(ctx).await?;
        match f(tx.clone()).await {
            Ok(value) => match tx.commit(ctx).await {
                Ok(()) | Err(PgError::TxDone) => Ok(value),
                Err(e) => Err(e),
            },
            Err(e) => {
                match tx.rollback(ctx).await {
                    Ok(()) | Err(PgError::TxDone) => {}
                    Err(rollback) => debug!(error = %rollback, "rollback after failed transaction body failed"),
                }
                Err(e)
            }
        }
    }

    /// Stream `source` into `COPY ... FROM STDIN` outside any transaction.
    pub async fn copy_from<R>(&self, ctx: &Ctx, source: &mut R, sql: &str) -> PgResult<QueryResult>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut conn = self.pool.get(ctx).await?;
        conn.copy_from(ctx, source, sql).await
    }

    /// Stream `COPY ... TO STDOUT` into `sink` outside any transaction.
    pub async fn copy_to<W>(&self, ctx: &Ctx, sink: &mut W, sql: &str) -> PgResult<QueryResult>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut conn = self.pool.get(ctx).await?;
        conn.copy_to(ctx, sink, sql).await
    }

    /// Close the pool. Borrowed connections are discarded as they come back.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
