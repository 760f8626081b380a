//! PostgreSQL connection implementation.
//!
//! This module provides the connection type that handles:
//! - Transport setup (TCP, or any async byte stream)
//! - Startup and authentication
//! - Simple and extended query protocols
//! - Health tracking: a connection that may be out of sync with the server
//!   is marked [`Health::Bad`] and never reused
//!
//! Every command takes a [`Ctx`]. If it fires before a byte of the command is
//! written the connection is untouched; if it fires mid-command the connection
//! is marked bad and a CancelRequest is sent on a side channel.

use std::collections::HashMap;
use std::fmt;
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Poll;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use super::auth::{md5_password, ScramClient, SCRAM_SHA_256};
use super::config::PgOptions;
use super::context::{Ctx, Interrupt};
use super::error::{ErrorKind, PgError, PgResult, ServerError, INVALID_SQL_STATEMENT_NAME};
use super::protocol::*;
use super::row::{QueryResult, Row};
use super::statement::{PreparedStatement, SharedColumns, StatementCache};
use super::types::PgValue;

// ============================================================================
// Transport
// ============================================================================

/// Any bidirectional byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

/// Owned, type-erased transport.
pub type BoxedTransport = Box<dyn Transport>;

// ============================================================================
// Health
// ============================================================================

/// Whether a connection can be trusted with another command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Bad,
}

impl Health {
    /// Health after a command failed with `err`.
    ///
    /// `mid_command` is true when bytes of the command were written and its
    /// ReadyForQuery was not yet consumed. Bad is absorbing.
    pub fn after(self, err: &PgError, mid_command: bool) -> Health {
        if self == Health::Bad {
            return Health::Bad;
        }
        match err.kind() {
            ErrorKind::Connection | ErrorKind::Protocol => Health::Bad,
            // Reply not consumed: out of sync whatever the cause
            _ if mid_command => Health::Bad,
            _ => Health::Healthy,
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// Everything needed to cancel the query running on a connection.
#[derive(Debug, Clone)]
pub struct CancelToken {
    host: String,
    port: u16,
    process_id: i32,
    secret_key: i32,
}

impl CancelToken {
    /// Ask the server to cancel whatever the connection is running.
    ///
    /// Opens a fresh TCP connection, sends CancelRequest and closes it. The
    /// server gives no reply; success only means the request was delivered.
    pub async fn cancel_query(&self) -> PgResult<()> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        let msg = CancelRequestMessage {
            process_id: self.process_id,
            secret_key: self.secret_key,
        };
        stream.write_all(&msg.to_bytes()).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
pub struct PgConnection {
    reader: ReadHalf<BoxedTransport>,
    writer: WriteHalf<BoxedTransport>,
    /// Encoded frontend messages not yet written
    out: BytesMut,
    /// Bytes read but not yet decoded
    read_buffer: BytesMut,
    /// Cache of statements prepared for parameterized queries
    statement_cache: StatementCache,
    /// Evicted cached statements to close with the next extended command
    pending_close: Vec<String>,
    transaction_status: TransactionStatus,
    health: Health,
    /// Set once a command's first byte is written, cleared on ReadyForQuery
    in_flight: bool,
    backend_pid: i32,
    backend_secret_key: i32,
    /// Where to send CancelRequest; only known for TCP connections
    cancel_target: Option<(String, u16)>,
    /// Server parameters (e.g., server_version, client_encoding)
    parameters: HashMap<String, String>,
    copy_chunk_size: usize,
    closed: bool,
}

impl fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgConnection")
            .field("backend_pid", &self.backend_pid)
            .field("health", &self.health)
            .field("in_flight", &self.in_flight)
            .field("transaction_status", &self.transaction_status)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// Simple query and extended query need different cleanup after a refused COPY.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Mode {
    Simple,
    Extended,
}

fn empty_columns() -> SharedColumns {
    Arc::new(Vec::new())
}

impl PgConnection {
    /// Connect over TCP and run the startup handshake.
    ///
    /// Both steps together are bounded by `options.dial_timeout` as well as `ctx`.
    pub async fn connect(ctx: &Ctx, options: &PgOptions) -> PgResult<Self> {
        let ctx = ctx.clone().timeout(options.dial_timeout);
        let addr = (options.host.as_str(), options.port);

        let stream = ctx.run(TcpStream::connect(addr)).await??;
        stream.set_nodelay(true)?;

        let mut conn = Self::connect_with_transport(&ctx, Box::new(stream), options).await?;
        conn.cancel_target = Some((options.host.clone(), options.port));
        Ok(conn)
    }

    /// Run the startup handshake over an already established transport.
    pub async fn connect_with_transport(
        ctx: &Ctx,
        transport: BoxedTransport,
        options: &PgOptions,
    ) -> PgResult<Self> {
        let (reader, writer) = tokio::io::split(transport);

        let mut conn = Self {
            reader,
            writer,
            out: BytesMut::with_capacity(8192),
            read_buffer: BytesMut::with_capacity(32768),
            statement_cache: StatementCache::new(options.statement_cache_capacity),
            pending_close: Vec::new(),
            transaction_status: TransactionStatus::Idle,
            health: Health::Healthy,
            in_flight: false,
            backend_pid: 0,
            backend_secret_key: 0,
            cancel_target: None,
            parameters: HashMap::new(),
            copy_chunk_size: options.copy_chunk_size.max(1),
            closed: false,
        };

        ctx.run(conn.startup(options)).await??;
        conn.in_flight = false;

        debug!(
            host = %options.host,
            database = %options.database,
            pid = conn.backend_pid,
            server_version = conn.parameter("server_version").unwrap_or("unknown"),
            "connected"
        );
        Ok(conn)
    }

    /// Perform the startup handshake (authentication).
    async fn startup(&mut self, options: &PgOptions) -> PgResult<()> {
        let mut params = vec![("client_encoding".to_string(), "UTF8".to_string())];
        if let Some(name) = &options.application_name {
            params.push(("application_name".to_string(), name.clone()));
        }

        self.buffer(&StartupMessage {
            user: options.user.clone(),
            database: Some(options.database.clone()),
            options: params,
        });
        self.flush().await?;

        let password = || {
            options.password.as_deref().ok_or_else(|| {
                PgError::Auth("server requested a password but none is configured".to_string())
            })
        };
        let mut scram: Option<ScramClient> = None;

        loop {
            match self.receive().await? {
                BackendMessage::AuthenticationOk => {}
                BackendMessage::AuthenticationCleartextPassword => {
                    self.buffer(&PasswordMessage {
                        password: password()?.to_string(),
                    });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationMD5Password { salt } => {
                    self.buffer(&PasswordMessage {
                        password: md5_password(&options.user, password()?, &salt),
                    });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASL { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(PgError::Auth(format!(
                            "server requires unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    let client = ScramClient::new(&options.user, password()?);
                    self.buffer(&SaslInitialResponseMessage {
                        mechanism: SCRAM_SHA_256.to_string(),
                        data: client.client_first_message(),
                    });
                    self.flush().await?;
                    scram = Some(client);
                }
                BackendMessage::AuthenticationSASLContinue { data } => {
                    let client = scram.as_mut().ok_or_else(|| {
                        PgError::Protocol("SASL continue before SASL start".to_string())
                    })?;
                    let data = client
                        .process_server_first(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                    self.buffer(&SaslResponseMessage { data });
                    self.flush().await?;
                }
                BackendMessage::AuthenticationSASLFinal { data } => {
                    scram
                        .as_ref()
                        .ok_or_else(|| PgError::Protocol("SASL final before SASL start".to_string()))?
                        .verify_server_final(&data)
                        .map_err(|e| PgError::Auth(e.to_string()))?;
                }
                BackendMessage::AuthenticationUnsupported { code } => {
                    return Err(PgError::Auth(format!(
                        "unsupported authentication method (code {})",
                        code
                    )));
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.backend_pid = process_id;
                    self.backend_secret_key = secret_key;
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    let err = ServerError::from_fields(&fields);
                    // Class 28: invalid authorization specification
                    return Err(if err.code.starts_with("28") {
                        PgError::Auth(err.to_string())
                    } else {
                        err.into()
                    });
                }
                other => return Err(unexpected(&other, "startup")),
            }
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Run one or more `;`-separated statements with the simple query protocol.
    ///
    /// Returns one result per statement. Values are decoded from text format.
    pub async fn simple_query(&mut self, ctx: &Ctx, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.start_command(ctx)?;
        trace!(pid = self.backend_pid, sql, "simple query");
        let outcome = ctx.run(self.simple_query_inner(sql)).await;
        self.settle(outcome)
    }

    /// Run a statement and return its result.
    ///
    /// Without parameters this is a simple query (several statements allowed,
    /// the last result is returned). With parameters the statement is prepared
    /// once per connection, cached, and executed with Bind/Execute.
    pub async fn query(&mut self, ctx: &Ctx, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        if params.is_empty() {
            let results = self.simple_query(ctx, sql).await?;
            return Ok(results
                .into_iter()
                .last()
                .unwrap_or_else(|| QueryResult::new(empty_columns())));
        }

        self.start_command(ctx)?;
        trace!(pid = self.backend_pid, sql, params = params.len(), "extended query");
        let outcome = ctx.run(self.cached_query_inner(sql, params)).await;
        self.settle(outcome)
    }

    /// Parse and describe a named statement that the caller owns.
    ///
    /// Unlike statements behind [`query`](Self::query), this one is not cached;
    /// the caller must close it with [`close_statement`](Self::close_statement).
    pub async fn prepare(&mut self, ctx: &Ctx, sql: &str) -> PgResult<Arc<PreparedStatement>> {
        self.start_command(ctx)?;
        let name = self.statement_cache.next_statement_name();
        trace!(pid = self.backend_pid, statement = %name, sql, "prepare");
        let outcome = ctx.run(self.prepare_inner(name, sql)).await;
        self.settle(outcome).map(Arc::new)
    }

    /// Execute a prepared statement.
    pub async fn execute(
        &mut self,
        ctx: &Ctx,
        stmt: &PreparedStatement,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        self.start_command(ctx)?;
        trace!(pid = self.backend_pid, statement = %stmt.name, "execute");
        let outcome = ctx.run(self.execute_inner(stmt, params)).await;
        self.settle(outcome)
    }

    /// Deallocate a prepared statement on the server.
    ///
    /// The server rejecting the Close means our view of the session is wrong,
    /// so any error response is a protocol error and marks the connection bad.
    pub async fn close_statement(&mut self, ctx: &Ctx, name: &str) -> PgResult<()> {
        self.close_statements(ctx, &[name]).await
    }

    /// Deallocate several prepared statements in one round trip.
    pub async fn close_statements<S: AsRef<str>>(&mut self, ctx: &Ctx, names: &[S]) -> PgResult<()> {
        if names.is_empty() {
            return Ok(());
        }
        self.start_command(ctx)?;
        let outcome = ctx.run(self.close_statements_inner(names)).await;
        self.settle(outcome)
    }

    // ========================================================================
    // Command bodies (run inside `Ctx::run`, never directly)
    // ========================================================================

    async fn simple_query_inner(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        self.buffer(&QueryMessage { query: sql });
        self.flush().await?;

        let mut results = Vec::new();
        let mut current: Option<QueryResult> = None;
        let mut failure: Option<PgError> = None;

        loop {
            match self.receive().await? {
                BackendMessage::RowDescription { fields } => {
                    current = Some(QueryResult::new(Arc::new(fields)));
                }
                BackendMessage::DataRow { values } => {
                    let result = current.as_mut().ok_or_else(|| {
                        PgError::Protocol("DataRow without RowDescription".to_string())
                    })?;
                    if failure.is_none() {
                        match decode_row(&values, &result.columns) {
                            Ok(row) => result.rows.push(row),
                            Err(e) => failure = Some(e),
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    let mut result = current
                        .take()
                        .unwrap_or_else(|| QueryResult::new(empty_columns()));
                    result.command_tag = tag;
                    results.push(result);
                }
                BackendMessage::EmptyQueryResponse => {
                    results.push(QueryResult::new(empty_columns()));
                }
                BackendMessage::ErrorResponse { fields } => {
                    failure.get_or_insert_with(|| ServerError::from_fields(&fields).into());
                }
                msg @ (BackendMessage::CopyInResponse(_)
                | BackendMessage::CopyOutResponse(_)
                | BackendMessage::CopyBothResponse(_)) => {
                    let err = self.refuse_copy(&msg, Mode::Simple).await?;
                    failure.get_or_insert(err);
                }
                BackendMessage::CopyData { .. } | BackendMessage::CopyDone if failure.is_some() => {}
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return match failure {
                        Some(e) => Err(e),
                        None => Ok(results),
                    };
                }
                other => return Err(unexpected(&other, "simple query")),
            }
        }
    }

    async fn cached_query_inner(&mut self, sql: &str, params: &[PgValue]) -> PgResult<QueryResult> {
        let stmt = match self.statement_cache.get(sql) {
            Some(stmt) => stmt,
            None => {
                let name = self.statement_cache.next_statement_name();
                let stmt = Arc::new(self.prepare_inner(name, sql).await?);
                if let Some(evicted) = self.statement_cache.insert(Arc::clone(&stmt)) {
                    self.pending_close.push(evicted);
                }
                stmt
            }
        };

        let result = self.execute_inner(&stmt, params).await;
        if let Err(e) = &result {
            // The server forgot the statement or its plan no longer fits
            let stale = e.code() == Some(INVALID_SQL_STATEMENT_NAME)
                || (e.code() == Some("0A000")
                    && e.server_error().is_some_and(|s| s.message.contains("cached plan")));
            if stale {
                debug!(statement = %stmt.name, "dropping stale cached statement");
                self.statement_cache.remove(sql);
            }
        }
        result
    }

    async fn prepare_inner(&mut self, name: String, sql: &str) -> PgResult<PreparedStatement> {
        self.buffer_pending_closes();
        self.buffer(&ParseMessage {
            name: &name,
            query: sql,
            param_types: &[],
        });
        self.buffer(&DescribeMessage {
            kind: b'S',
            name: &name,
        });
        self.buffer(&SyncMessage);
        self.flush().await?;

        let mut stmt = PreparedStatement::new(name, sql.to_string());
        let mut failure: Option<PgError> = None;

        loop {
            match self.receive().await? {
                BackendMessage::ParseComplete | BackendMessage::CloseComplete => {}
                BackendMessage::ParameterDescription { type_oids } => {
                    stmt.set_param_types(type_oids);
                }
                BackendMessage::RowDescription { fields } => stmt.set_columns(fields),
                BackendMessage::NoData => {}
                BackendMessage::ErrorResponse { fields } => {
                    failure.get_or_insert_with(|| ServerError::from_fields(&fields).into());
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return match failure {
                        Some(e) => Err(e),
                        None => Ok(stmt),
                    };
                }
                other => return Err(unexpected(&other, "prepare")),
            }
        }
    }

    async fn execute_inner(
        &mut self,
        stmt: &PreparedStatement,
        params: &[PgValue],
    ) -> PgResult<QueryResult> {
        if params.len() != stmt.param_types.len() {
            return Err(PgError::InvalidOperation(format!(
                "statement expects {} parameters, got {}",
                stmt.param_types.len(),
                params.len()
            )));
        }
        let params = params
            .iter()
            .zip(&stmt.param_types)
            .map(|(p, oid)| p.coerce_to(*oid))
            .collect::<PgResult<Vec<_>>>()?;
        let formats: Vec<Format> = params.iter().map(PgValue::param_format).collect();

        self.buffer_pending_closes();
        self.buffer(&BindMessage {
            portal: "",
            statement: &stmt.name,
            param_formats: &formats,
            params: &params,
            result_formats: &stmt.result_formats,
        });
        self.buffer(&ExecuteMessage {
            portal: "",
            max_rows: 0,
        });
        self.buffer(&SyncMessage);
        self.flush().await?;

        let mut result = QueryResult::new(Arc::clone(&stmt.columns));
        let mut failure: Option<PgError> = None;

        loop {
            match self.receive().await? {
                BackendMessage::BindComplete | BackendMessage::CloseComplete => {}
                BackendMessage::DataRow { values } => {
                    if failure.is_none() {
                        match decode_row(&values, &stmt.columns) {
                            Ok(row) => result.rows.push(row),
                            Err(e) => failure = Some(e),
                        }
                    }
                }
                BackendMessage::CommandComplete { tag } => result.command_tag = tag,
                BackendMessage::EmptyQueryResponse | BackendMessage::PortalSuspended => {}
                BackendMessage::ErrorResponse { fields } => {
                    failure.get_or_insert_with(|| ServerError::from_fields(&fields).into());
                }
                msg @ (BackendMessage::CopyInResponse(_)
                | BackendMessage::CopyOutResponse(_)
                | BackendMessage::CopyBothResponse(_)) => {
                    let err = self.refuse_copy(&msg, Mode::Extended).await?;
                    failure.get_or_insert(err);
                }
                BackendMessage::CopyData { .. } | BackendMessage::CopyDone if failure.is_some() => {}
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return match failure {
                        Some(e) => Err(e),
                        None => Ok(result),
                    };
                }
                other => return Err(unexpected(&other, "execute")),
            }
        }
    }

    async fn close_statements_inner<S: AsRef<str>>(&mut self, names: &[S]) -> PgResult<()> {
        for name in names {
            self.buffer(&CloseMessage {
                kind: b'S',
                name: name.as_ref(),
            });
        }
        self.buffer(&SyncMessage);
        self.flush().await?;

        let mut rejected: Option<ServerError> = None;
        loop {
            match self.receive().await? {
                BackendMessage::CloseComplete => {}
                BackendMessage::ErrorResponse { fields } => {
                    rejected.get_or_insert_with(|| ServerError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return match rejected {
                        Some(e) => Err(PgError::Protocol(format!(
                            "server rejected closing a prepared statement: {}",
                            e
                        ))),
                        None => Ok(()),
                    };
                }
                other => return Err(unexpected(&other, "close")),
            }
        }
    }

    /// Get out of a COPY nobody asked for without losing sync.
    ///
    /// COPY IN is failed with CopyFail (plus Sync in extended mode, since the
    /// server ignores the batch's Sync while copying). COPY OUT data is simply
    /// discarded by the caller's loop.
    pub(super) async fn refuse_copy(&mut self, msg: &BackendMessage, mode: Mode) -> PgResult<PgError> {
        if matches!(
            msg,
            BackendMessage::CopyInResponse(_) | BackendMessage::CopyBothResponse(_)
        ) {
            self.buffer(&CopyFailMessage {
                reason: "COPY FROM STDIN is only supported through copy_from",
            });
            if mode == Mode::Extended {
                self.buffer(&SyncMessage);
            }
            self.flush().await?;
        }
        Ok(PgError::InvalidOperation(format!(
            "statement started a COPY ({}); use copy_from or copy_to",
            msg.name()
        )))
    }

    // ========================================================================
    // Command lifecycle
    // ========================================================================

    /// Check that a new command may start on this connection.
    pub(super) fn start_command(&mut self, ctx: &Ctx) -> PgResult<()> {
        if self.closed || self.health == Health::Bad {
            return Err(PgError::ConnectionClosed);
        }
        if self.in_flight {
            // A previous command was abandoned mid-flight
            return self.settle(Ok(Err(PgError::Protocol(
                "previous command did not complete; connection state is unknown".to_string(),
            ))));
        }
        ctx.check()
    }

    /// Apply the health transition for a finished command and surface its result.
    ///
    /// This is the only place health moves from Healthy to Bad, apart from an
    /// explicit [`mark_bad`](Self::mark_bad).
    pub(super) fn settle<T>(&mut self, outcome: Result<PgResult<T>, Interrupt>) -> PgResult<T> {
        let result = outcome.unwrap_or_else(|interrupt| Err(interrupt.into()));

        if let Err(err) = &result {
            let next = self.health.after(err, self.in_flight);
            if next != self.health {
                warn!(pid = self.backend_pid, error = %err, "connection marked bad");
                if self.in_flight && matches!(err.kind(), ErrorKind::Timeout | ErrorKind::Cancelled) {
                    self.request_cancel();
                }
            }
            self.health = next;
        }
        result
    }

    fn request_cancel(&self) {
        let Some(token) = self.cancel_token() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        handle.spawn(async move {
            if let Err(e) = token.cancel_query().await {
                debug!(pid = token.process_id, error = %e, "cancel request failed");
            }
        });
    }

    /// Record ReadyForQuery: the command is over.
    pub(super) fn ready(&mut self, status: TransactionStatus) {
        self.transaction_status = status;
        self.in_flight = false;
    }

    /// Discard everything up to and including ReadyForQuery.
    pub(super) async fn drain_until_ready(&mut self) -> PgResult<()> {
        loop {
            if let BackendMessage::ReadyForQuery { status } = self.receive().await? {
                self.ready(status);
                return Ok(());
            }
        }
    }

    fn buffer_pending_closes(&mut self) {
        for name in std::mem::take(&mut self.pending_close) {
            trace!(pid = self.backend_pid, statement = %name, "closing evicted statement");
            self.buffer(&CloseMessage {
                kind: b'S',
                name: &name,
            });
        }
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Close the connection, telling the server first when possible.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.health == Health::Healthy && !self.in_flight {
            self.buffer(&TerminateMessage);
            if self.flush().await.is_ok() {
                let _ = self.writer.shutdown().await;
            }
        }
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Current health.
    pub fn health(&self) -> Health {
        self.health
    }

    /// Whether the connection must be discarded.
    pub fn is_bad(&self) -> bool {
        self.health == Health::Bad || self.closed
    }

    /// Mark the connection unusable. It will be discarded when released.
    pub fn mark_bad(&mut self) {
        if self.health == Health::Healthy {
            debug!(pid = self.backend_pid, "connection marked bad by caller");
        }
        self.health = Health::Bad;
    }

    /// Whether a command was started and its ReadyForQuery not yet read.
    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Swap the underlying transport, discarding any buffered input.
    ///
    /// Meant for fault injection; the new transport must continue the same session.
    pub fn set_transport(&mut self, transport: BoxedTransport) {
        let (reader, writer) = tokio::io::split(transport);
        self.reader = reader;
        self.writer = writer;
        self.read_buffer.clear();
        self.out.clear();
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Get backend process ID.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(|s| s.as_str())
    }

    /// Token for cancelling this connection's running query; TCP connections only.
    pub fn cancel_token(&self) -> Option<CancelToken> {
        self.cancel_target.as_ref().map(|(host, port)| CancelToken {
            host: host.clone(),
            port: *port,
            process_id: self.backend_pid,
            secret_key: self.backend_secret_key,
        })
    }

    /// Number of statements in the parameterized-query cache.
    pub fn cached_statements(&self) -> usize {
        self.statement_cache.len()
    }

    pub(super) fn copy_chunk_size(&self) -> usize {
        self.copy_chunk_size
    }

    // ========================================================================
    // Framing
    // ========================================================================

    /// Queue a frontend message.
    #[inline]
    pub(super) fn buffer<M: FrontendMessage>(&mut self, msg: &M) {
        msg.encode(&mut self.out);
    }

    /// Write every queued message. From the first byte on the command is in flight.
    pub(super) async fn flush(&mut self) -> PgResult<()> {
        if self.out.is_empty() {
            return Ok(());
        }
        self.in_flight = true;
        self.writer.write_all(&self.out).await?;
        self.out.clear();
        self.writer.flush().await?;
        Ok(())
    }

    /// Receive the next backend message that belongs to the current command.
    ///
    /// Notices, notifications and parameter changes can arrive at any time;
    /// they are recorded or logged here and never returned.
    pub(super) async fn receive(&mut self) -> PgResult<BackendMessage> {
        loop {
            match self.read_message().await? {
                BackendMessage::NoticeResponse { fields } => {
                    let notice = ServerError::from_fields(&fields);
                    debug!(
                        pid = self.backend_pid,
                        severity = %notice.severity,
                        code = %notice.code,
                        "server notice: {}",
                        notice.message
                    );
                }
                BackendMessage::ParameterStatus { name, value } => {
                    trace!(pid = self.backend_pid, %name, %value, "parameter status");
                    self.parameters.insert(name, value);
                }
                BackendMessage::NotificationResponse {
                    process_id,
                    channel,
                    payload,
                } => {
                    debug!(from_pid = process_id, %channel, %payload, "notification dropped");
                }
                other => return Ok(other),
            }
        }
    }

    /// Take in whatever the server has already sent, without waiting, and
    /// report whether an ErrorResponse is among the complete frames buffered.
    pub(super) async fn error_waiting(&mut self) -> PgResult<bool> {
        let mut chunk = [0u8; 8192];
        let reader = &mut self.reader;
        let polled = poll_fn(|cx| {
            let mut buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut *reader).poll_read(cx, &mut buf) {
                Poll::Ready(Ok(())) => Poll::Ready(Ok(Some(buf.filled().len()))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Ready(Ok(None)),
            }
        })
        .await?;

        match polled {
            Some(0) => return Err(PgError::ConnectionClosed),
            Some(n) => self.read_buffer.extend_from_slice(&chunk[..n]),
            None => {}
        }

        let mut rest = &self.read_buffer[..];
        while let Some(len) = BackendMessage::frame_len(rest)? {
            if rest[0] == b'E' {
                return Ok(true);
            }
            rest = &rest[len..];
        }
        Ok(false)
    }

    async fn read_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(len) = BackendMessage::frame_len(&self.read_buffer)? {
                let mut frame: Bytes = self.read_buffer.split_to(len).freeze();
                return BackendMessage::decode(&mut frame);
            }

            self.read_buffer.reserve(8192);
            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                return Err(PgError::ConnectionClosed);
            }
        }
    }
}

/// Decode one DataRow using each column's format.
fn decode_row(values: &[Option<Bytes>], columns: &SharedColumns) -> PgResult<Row> {
    if values.len() != columns.len() {
        return Err(PgError::Protocol(format!(
            "DataRow has {} values for {} columns",
            values.len(),
            columns.len()
        )));
    }

    let mut row: SmallVec<[PgValue; 8]> = SmallVec::with_capacity(values.len());
    for (value, column) in values.iter().zip(columns.iter()) {
        row.push(match value {
            None => PgValue::Null,
            Some(data) => match column.format {
                Format::Binary => PgValue::decode_binary(column.type_oid, data)?,
                Format::Text => PgValue::decode_text(column.type_oid, data)?,
            },
        });
    }

    Ok(Row::new(Arc::clone(columns), row))
}

pub(super) fn unexpected(msg: &BackendMessage, during: &str) -> PgError {
    PgError::Protocol(format!("unexpected {} during {}", msg.name(), during))
}
