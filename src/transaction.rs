//! Transactions and the prepared statements scoped to them.
//!
//! A [`Transaction`] holds its pooled connection for its whole life. The
//! first SQL or COPY error poisons it: from then on every statement fails
//! with `TxAborted` without touching the network, until `rollback` (or a
//! `commit`, which quietly rolls back instead).
//!
//! Handles are cheap to clone and share one state behind an async mutex, so
//! statements on the same transaction run one at a time.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::pg::context::Ctx;
use crate::pg::error::{PgError, PgResult};
use crate::pg::pool::{ConnId, PooledConnection};
use crate::pg::row::{QueryResult, Row};
use crate::pg::statement::PreparedStatement;
use crate::pg::types::PgValue;

/// Bound on the ROLLBACK issued for a transaction dropped while open.
const DROP_ROLLBACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Open and accepting statements
    Active,
    /// A statement failed; only rollback (or commit-as-rollback) is left
    Errored,
    Committed,
    RolledBack,
}

impl TxState {
    /// Whether the transaction has ended.
    pub fn is_done(self) -> bool {
        matches!(self, TxState::Committed | TxState::RolledBack)
    }
}

#[derive(Debug)]
struct TxInner {
    /// Given back to the pool when the transaction ends
    conn: Option<PooledConnection>,
    state: TxState,
    /// Prepared statements still open on the server
    stmts: Vec<String>,
}

impl TxInner {
    fn usable(&self) -> PgResult<()> {
        match self.state {
            TxState::Active => Ok(()),
            TxState::Errored => Err(PgError::TxAborted),
            TxState::Committed | TxState::RolledBack => Err(PgError::TxDone),
        }
    }

    fn conn(&mut self) -> PgResult<&mut PooledConnection> {
        self.conn.as_mut().ok_or(PgError::TxDone)
    }

    /// Poison the transaction if `result` failed in a way that aborts it.
    fn observe<T>(&mut self, result: PgResult<T>) -> PgResult<T> {
        if let Err(err) = &result {
            let conn_lost = self.conn.as_ref().map_or(true, |c| !c.is_healthy());
            if self.state == TxState::Active && (err.poisons_transaction() || conn_lost) {
                debug!(error = %err, "transaction errored");
                self.state = TxState::Errored;
            }
        }
        result
    }

    /// Send the terminal `sql`, close the open statements and release the connection.
    async fn finish(&mut self, ctx: &Ctx, sql: &str) -> PgResult<Vec<QueryResult>> {
        let mut conn = self.conn.take().ok_or(PgError::TxDone)?;
        let stmts = std::mem::take(&mut self.stmts);

        let result = if conn.is_healthy() {
            conn.simple_query(ctx, sql).await
        } else {
            Err(PgError::ConnectionClosed)
        };

        if !stmts.is_empty() && conn.is_healthy() {
            if let Err(e) = conn.close_statements(ctx, &stmts).await {
                warn!(conn_id = conn.id(), error = %e, "closing transaction statements failed");
            }
        }
        result
    }
}

impl Drop for TxInner {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        if !conn.is_healthy() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(conn_id = conn.id(), "transaction dropped while open, rolling back");
                let stmts = std::mem::take(&mut self.stmts);
                handle.spawn(async move {
                    let ctx = Ctx::with_timeout(DROP_ROLLBACK_TIMEOUT);
                    if let Err(e) = conn.simple_query(&ctx, "ROLLBACK").await {
                        debug!(conn_id = conn.id(), error = %e, "background rollback failed");
                        return;
                    }
                    if !stmts.is_empty() {
                        if let Err(e) = conn.close_statements(&ctx, &stmts).await {
                            debug!(conn_id = conn.id(), error = %e, "closing statements after background rollback failed");
                        }
                    }
                });
            }
            // Nothing can run the rollback; the pool must not reuse the session
            Err(_) => conn.mark_bad(),
        }
    }
}

/// An open transaction on one pooled connection.
///
/// Obtained from [`Db::begin`](crate::Db::begin). End it with
/// [`commit`](Self::commit) or [`rollback`](Self::rollback); if every handle
/// is dropped first, a rollback runs in the background.
#[derive(Debug, Clone)]
pub struct Transaction {
    inner: Arc<Mutex<TxInner>>,
}

impl Transaction {
    /// Wrap a connection on which BEGIN has succeeded.
    pub(crate) fn new(conn: PooledConnection) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TxInner {
                conn: Some(conn),
                state: TxState::Active,
                stmts: Vec::new(),
            })),
        }
    }

    /// Current state.
    pub async fn state(&self) -> TxState {
        self.inner.lock().await.state
    }

    /// Pool id of the connection, while the transaction holds one.
    pub async fn conn_id(&self) -> Option<ConnId> {
        self.inner.lock().await.conn.as_ref().map(PooledConnection::id)
    }

    /// Prepare a statement owned by this transaction.
    pub async fn prepare(&self, ctx: &Ctx, sql: &str) -> PgResult<Stmt> {
        let mut inner = self.inner.lock().await;
        inner.usable()?;
        let result = inner.conn()?.prepare(ctx, sql).await;
        let stmt = inner.observe(result)?;
        trace!(statement = %stmt.name, "statement prepared in transaction");
        inner.stmts.push(stmt.name.clone());
        Ok(Stmt {
            tx: self.clone(),
            stmt,
            closed: false,
        })
    }

    /// Run a statement and return the number of rows it affected.
    pub async fn exec(&self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(ctx, sql, params).await?.rows_affected())
    }

    /// Run a statement and return its rows.
    pub async fn query(&self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut inner = self.inner.lock().await;
        inner.usable()?;
        let result = inner.conn()?.query(ctx, sql, params).await;
        inner.observe(result)
    }

    /// Run a statement that must return exactly one row.
    ///
    /// `NoRows` and `MultipleRows` leave the transaction active.
    pub async fn query_one(&self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<Row> {
        self.query(ctx, sql, params).await?.into_one()
    }

    /// Stream `source` into `COPY ... FROM STDIN`.
    pub async fn copy_from<R>(&self, ctx: &Ctx, source: &mut R, sql: &str) -> PgResult<QueryResult>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut inner = self.inner.lock().await;
        inner.usable()?;
        let result = inner.conn()?.copy_from(ctx, source, sql).await;
        inner.observe(result)
    }

    /// Stream `COPY ... TO STDOUT` into `sink`.
    pub async fn copy_to<W>(&self, ctx: &Ctx, sink: &mut W, sql: &str) -> PgResult<QueryResult>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut inner = self.inner.lock().await;
        inner.usable()?;
        let result = inner.conn()?.copy_to(ctx, sink, sql).await;
        inner.observe(result)
    }

    /// Commit the transaction.
    ///
    /// An errored transaction is rolled back instead and `Ok(())` is
    /// returned. If the server rejects the COMMIT the transaction ends
    /// rolled back and the error is returned.
    pub async fn commit(&self, ctx: &Ctx) -> PgResult<()> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            TxState::Active => {}
            TxState::Errored => {
                debug!("commit on errored transaction, rolling back");
                if let Err(e) = inner.finish(ctx, "ROLLBACK").await {
                    debug!(error = %e, "rollback of errored transaction failed");
                }
                inner.state = TxState::RolledBack;
                return Ok(());
            }
            TxState::Committed | TxState::RolledBack => return Err(PgError::TxDone),
        }

        let result = inner.finish(ctx, "COMMIT").await;
        match result {
            Ok(results) => {
                // The server answers ROLLBACK when the block had already failed
                let rolled_back = results
                    .last()
                    .is_some_and(|r| r.command_tag == "ROLLBACK");
                if rolled_back {
                    debug!("server rolled back the transaction on commit");
                    inner.state = TxState::RolledBack;
                } else {
                    inner.state = TxState::Committed;
                }
                Ok(())
            }
            Err(e) => {
                inner.state = TxState::RolledBack;
                Err(e)
            }
        }
    }

    /// Roll the transaction back.
    ///
    /// A connection that is already bad is not contacted: the server drops
    /// the transaction along with the session.
    pub async fn rollback(&self, ctx: &Ctx) -> PgResult<()> {
        let mut inner = self.inner.lock().await;
        if inner.state.is_done() {
            return Err(PgError::TxDone);
        }
        inner.state = TxState::RolledBack;

        let healthy = inner.conn.as_ref().is_some_and(PooledConnection::is_healthy);
        if !healthy {
            debug!("rollback skipped, connection is bad");
            inner.stmts.clear();
            inner.conn = None;
            return Ok(());
        }
        inner.finish(ctx, "ROLLBACK").await.map(|_| ())
    }

    async fn execute(&self, ctx: &Ctx, stmt: &PreparedStatement, params: &[PgValue]) -> PgResult<QueryResult> {
        let mut inner = self.inner.lock().await;
        inner.usable()?;
        let result = inner.conn()?.execute(ctx, stmt, params).await;
        inner.observe(result)
    }

    async fn close_statement(&self, ctx: &Ctx, name: &str) -> PgResult<()> {
        let mut inner = self.inner.lock().await;
        let Some(pos) = inner.stmts.iter().position(|n| n == name) else {
            // Already closed with its transaction
            return Ok(());
        };
        inner.stmts.remove(pos);
        let result = inner.conn()?.close_statements(ctx, &[name]).await;
        inner.observe(result)
    }
}

/// A prepared statement scoped to a [`Transaction`].
#[derive(Debug)]
pub struct Stmt {
    tx: Transaction,
    stmt: Arc<PreparedStatement>,
    closed: bool,
}

impl Stmt {
    /// Server-side statement name.
    pub fn name(&self) -> &str {
        &self.stmt.name
    }

    /// Statement metadata: parameter types and result columns.
    pub fn statement(&self) -> &PreparedStatement {
        &self.stmt
    }

    /// Execute and return the number of rows affected.
    pub async fn exec(&self, ctx: &Ctx, params: &[PgValue]) -> PgResult<u64> {
        Ok(self.query(ctx, params).await?.rows_affected())
    }

    /// Execute and return all rows.
    pub async fn query(&self, ctx: &Ctx, params: &[PgValue]) -> PgResult<QueryResult> {
        if self.closed {
            return Err(PgError::StmtClosed);
        }
        self.tx.execute(ctx, &self.stmt, params).await
    }

    /// Execute and return exactly one row.
    pub async fn query_one(&self, ctx: &Ctx, params: &[PgValue]) -> PgResult<Row> {
        self.query(ctx, params).await?.into_one()
    }

    /// Deallocate the statement on the server.
    ///
    /// If the server rejects the Close the connection is marked bad, the
    /// transaction is errored and the error is returned. Closing twice is a
    /// no-op.
    pub async fn close(&mut self, ctx: &Ctx) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.tx.close_statement(ctx, &self.stmt.name).await
    }
}
