//! PostgreSQL connection pool.
//!
//! A bounded set of connections shared by concurrent callers. Capacity is a
//! fair `tokio::sync::Semaphore`, so waiters are served in arrival order.
//! Connections come back through [`PooledConnection`]'s `Drop`; anything that
//! may be out of sync with its server (bad, mid-command, inside a transaction
//! block) is discarded instead of reused and its slot is freed.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::config::PgOptions;
use super::connection::{BoxedTransport, Health, PgConnection};
use super::context::{Ctx, Interrupt};
use super::error::{PgError, PgResult};
use super::protocol::TransactionStatus;
use super::row::QueryResult;
use super::statement::PreparedStatement;
use super::types::PgValue;

/// Pool-assigned connection id, unique and increasing for the pool's lifetime.
pub type ConnId = u64;

// ============================================================================
// Connector
// ============================================================================

/// Opens new physical connections for a pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, ctx: &Ctx, options: &PgOptions) -> PgResult<PgConnection>;
}

/// Connects over TCP to `options.host:options.port`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, ctx: &Ctx, options: &PgOptions) -> PgResult<PgConnection> {
        PgConnection::connect(ctx, options).await
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Requests served by an idle connection
    pub hits: u64,
    /// Requests that had to open a connection
    pub misses: u64,
    /// Requests that gave up waiting for a free slot
    pub timeouts: u64,
    /// Connections thrown away instead of reused
    pub discarded: u64,
    /// Open connections, idle or borrowed
    pub total_conns: usize,
    pub idle_conns: usize,
    pub in_use: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    discarded: AtomicU64,
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, the connection is returned to the pool, or discarded if it
/// can no longer be trusted.
pub struct PooledConnection {
    id: ConnId,
    /// The actual connection (None once returned to the pool)
    conn: Option<PgConnection>,
    /// Reference back to the pool
    pool: Arc<PgPoolInner>,
    /// Released after the connection is back in the idle set
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl PooledConnection {
    /// Pool-assigned id of the physical connection.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> PgResult<&mut PgConnection> {
        self.conn.as_mut().ok_or(PgError::ConnectionClosed)
    }

    /// Execute a simple query.
    pub async fn simple_query(&mut self, ctx: &Ctx, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.connection()?.simple_query(ctx, sql).await
    }

    /// Execute a query, prepared and cached per connection when it has parameters.
    pub async fn query(&mut self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        self.connection()?.query(ctx, sql, params).await
    }

    /// Prepare a named statement owned by the caller.
    pub async fn prepare(&mut self, ctx: &Ctx, sql: &str) -> PgResult<Arc<PreparedStatement>> {
        self.connection()?.prepare(ctx, sql).await
    }

    /// Execute a prepared statement.
    pub async fn execute(
        &mut self,
        ctx: &Ctx,
        stmt: &PreparedStatement,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.connection()?.execute(ctx, stmt, params).await
    }

    /// Deallocate prepared statements.
    pub async fn close_statements<S: AsRef<str>>(&mut self, ctx: &Ctx, names: &[S]) -> PgResult<()> {
        self.connection()?.close_statements(ctx, names).await
    }

    /// Run `COPY ... FROM STDIN` fed from `source`.
    pub async fn copy_from<R>(&mut self, ctx: &Ctx, source: &mut R, sql: &str) -> PgResult<QueryResult>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.connection()?.copy_from(ctx, source, sql).await
    }

    /// Run `COPY ... TO STDOUT` into `sink`.
    pub async fn copy_to<W>(&mut self, ctx: &Ctx, sink: &mut W, sql: &str) -> PgResult<QueryResult>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.connection()?.copy_to(ctx, sink, sql).await
    }

    /// Current health; a returned connection reads as bad.
    pub fn health(&self) -> Health {
        self.conn.as_ref().map_or(Health::Bad, PgConnection::health)
    }

    /// Check if the connection is still usable.
    pub fn is_healthy(&self) -> bool {
        self.conn.as_ref().is_some_and(|c| !c.is_bad())
    }

    /// Mark the connection bad so the pool discards it on release.
    pub fn mark_bad(&mut self) {
        if let Some(conn) = self.conn.as_mut() {
            conn.mark_bad();
        }
    }

    /// Swap the transport under the connection (fault injection).
    pub fn set_transport(&mut self, transport: BoxedTransport) {
        if let Some(conn) = self.conn.as_mut() {
            conn.set_transport(transport);
        }
    }

    /// Server transaction status as of the last ReadyForQuery.
    pub fn transaction_status(&self) -> Option<TransactionStatus> {
        self.conn.as_ref().map(PgConnection::transaction_status)
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.put(self.id, conn);
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

struct IdleConn {
    id: ConnId,
    conn: PgConnection,
    since: Instant,
}

/// Internal pool state.
struct PgPoolInner {
    options: PgOptions,
    connector: Arc<dyn Connector>,
    /// Idle connections, oldest first
    idle: Mutex<Vec<IdleConn>>,
    /// One permit per connection slot
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
    next_id: AtomicU64,
    /// Open physical connections, idle or borrowed
    open: AtomicUsize,
    counters: Counters,
}

impl PgPoolInner {
    /// Take back a released connection.
    fn put(&self, id: ConnId, conn: PgConnection) {
        let reason = if self.closed.load(Ordering::Acquire) {
            Some("pool closed")
        } else if conn.is_bad() {
            Some("connection is bad")
        } else if conn.in_flight() {
            Some("command still in flight")
        } else if conn.transaction_status() != TransactionStatus::Idle {
            Some("left inside a transaction block")
        } else {
            None
        };

        match reason {
            None => self.idle.lock().push(IdleConn {
                id,
                conn,
                since: Instant::now(),
            }),
            Some(reason) => self.discard(id, conn, reason),
        }
    }

    /// Drop a connection for good, terminating it politely if it is sound.
    fn discard(&self, id: ConnId, mut conn: PgConnection, reason: &str) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.counters.discarded.fetch_add(1, Ordering::Relaxed);
        if conn.is_bad() || conn.in_flight() {
            warn!(conn_id = id, pid = conn.backend_pid(), reason, "discarding connection");
        } else {
            debug!(conn_id = id, pid = conn.backend_pid(), reason, "discarding connection");
        }

        if conn.is_bad() || conn.in_flight() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { conn.close().await });
        }
    }

    fn is_expired(&self, idle: &IdleConn, now: Instant) -> bool {
        self.options
            .idle_timeout
            .is_some_and(|timeout| now.saturating_duration_since(idle.since) >= timeout)
    }

    /// Pop the most recently used idle connection, discarding expired and bad ones.
    fn take_idle(&self) -> Option<IdleConn> {
        let now = Instant::now();
        let mut stale = Vec::new();

        let found = {
            let mut idle = self.idle.lock();
            // Oldest first, so expired entries form a prefix
            let expired = idle.iter().take_while(|c| self.is_expired(c, now)).count();
            stale.extend(idle.drain(..expired));

            let mut found = None;
            while let Some(candidate) = idle.pop() {
                if candidate.conn.is_bad() {
                    stale.push(candidate);
                } else {
                    found = Some(candidate);
                    break;
                }
            }
            found
        };

        for IdleConn { id, conn, .. } in stale {
            let reason = if conn.is_bad() { "connection is bad" } else { "idle timeout" };
            self.discard(id, conn, reason);
        }
        found
    }

    async fn open_connection(&self, ctx: &Ctx) -> PgResult<(ConnId, PgConnection)> {
        let conn = self.connector.connect(ctx, &self.options).await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.open.fetch_add(1, Ordering::AcqRel);
        debug!(conn_id = id, pid = conn.backend_pid(), "opened connection");
        Ok((id, conn))
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A PostgreSQL connection pool.
///
/// Cloning is cheap; all clones share the same connections.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PgPoolInner>,
}

impl std::fmt::Debug for PgPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgPool")
            .field("options", &self.inner.options)
            .field("stats", &self.stats())
            .finish()
    }
}

impl PgPool {
    /// Create a TCP pool and open `min_connections` eagerly.
    pub async fn connect(ctx: &Ctx, options: PgOptions) -> PgResult<Self> {
        Self::with_connector(ctx, options, Arc::new(TcpConnector)).await
    }

    /// Create a pool whose connections come from `connector`.
    pub async fn with_connector(
        ctx: &Ctx,
        options: PgOptions,
        connector: Arc<dyn Connector>,
    ) -> PgResult<Self> {
        options.validate()?;

        let inner = Arc::new(PgPoolInner {
            semaphore: Arc::new(Semaphore::new(options.pool_size)),
            connector,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            open: AtomicUsize::new(0),
            counters: Counters::default(),
            options,
        });
        let pool = Self { inner };

        // Pre-create minimum connections
        for _ in 0..pool.inner.options.min_connections {
            let (id, conn) = pool.inner.open_connection(ctx).await?;
            pool.inner.idle.lock().push(IdleConn {
                id,
                conn,
                since: Instant::now(),
            });
        }

        Ok(pool)
    }

    /// Get a connection from the pool.
    ///
    /// Waits for a free slot at most `pool_timeout` (and never past `ctx`).
    /// Running out of time is `Timeout`/`Cancelled`, never a connection error.
    pub async fn get(&self, ctx: &Ctx) -> PgResult<PooledConnection> {
        if self.is_closed() {
            return Err(PgError::PoolClosed);
        }

        let wait = ctx.clone().timeout(self.inner.options.pool_timeout);
        let permit = match wait.run(Arc::clone(&self.inner.semaphore).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PgError::PoolClosed),
            Err(interrupt) => {
                if interrupt == Interrupt::Deadline {
                    self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                }
                debug!(?interrupt, "gave up waiting for a pooled connection");
                return Err(interrupt.into());
            }
        };

        if let Some(IdleConn { id, conn, .. }) = self.inner.take_idle() {
            self.inner.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(self.lease(id, conn, permit));
        }

        self.inner.counters.misses.fetch_add(1, Ordering::Relaxed);
        let (id, conn) = self.inner.open_connection(ctx).await?;
        Ok(self.lease(id, conn, permit))
    }

    fn lease(&self, id: ConnId, conn: PgConnection, permit: OwnedSemaphorePermit) -> PooledConnection {
        PooledConnection {
            id,
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        }
    }

    /// Close the pool.
    ///
    /// Waiters and later callers get `PoolClosed`. Idle connections are
    /// terminated now; borrowed ones when they are released.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.semaphore.close();

        let connections = std::mem::take(&mut *self.inner.idle.lock());
        debug!(idle = connections.len(), "closing pool");
        for IdleConn { mut conn, .. } in connections {
            self.inner.open.fetch_sub(1, Ordering::AcqRel);
            conn.close().await;
        }
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Current counters.
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        let total = self.inner.open.load(Ordering::Acquire);
        let idle = self.inner.idle.lock().len();
        PoolStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            total_conns: total,
            idle_conns: idle,
            in_use: total.saturating_sub(idle),
        }
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// The options the pool was built with.
    pub fn options(&self) -> &PgOptions {
        &self.inner.options
    }
}
