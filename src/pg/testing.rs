//! In-process fake PostgreSQL backend for tests.
//!
//! Each session runs on its own task at the far end of a `tokio::io::duplex`
//! pipe and speaks enough of the v3 protocol to exercise the client: startup
//! with optional MD5 auth, simple and extended queries, transaction blocks
//! with READ COMMITTED visibility, and COPY in both directions.
//!
//! Understood SQL:
//! - `BEGIN ...`, `START TRANSACTION`, `COMMIT`, `END`, `ROLLBACK`
//! - `SELECT 1`, `SELECT 'text'`, `SELECT $1`, `SELECT $1::int4`, `SELECT $1::int8`
//! - `SELECT pg_sleep(secs)`
//! - `SELECT COUNT(*) FROM t`, `SELECT * FROM t`
//! - `CREATE TABLE t(col type, ...)`, `DROP TABLE [IF EXISTS] t`
//! - `INSERT INTO t VALUES ('a', 1, NULL, $1, ...)`
//! - `COPY t FROM STDIN`, `COPY t TO STDOUT`
//! - `DEALLOCATE name`
//!
//! Anything else is a syntax error (42601). Unlike a real server, closing an
//! unknown prepared statement is an error (26000).

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::task::JoinHandle;

use super::auth::md5_password;
use super::config::PgOptions;
use super::connection::PgConnection;
use super::context::Ctx;
use super::copy::{parse_copy_text_row, CopyRowEncoder};
use super::error::PgResult;
use super::pool::Connector;
use super::protocol::CANCEL_REQUEST_CODE;
use super::types::{Oid, PgValue};

type Row = Vec<Option<String>>;

// ============================================================================
// Server
// ============================================================================

#[derive(Default)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

#[derive(Default)]
struct ServerInner {
    tables: Mutex<HashMap<String, Table>>,
    sessions: Mutex<Vec<JoinHandle<()>>>,
    password: Mutex<Option<String>>,
    next_pid: AtomicI32,
    messages: AtomicUsize,
}

/// A fake server shared by every session it spawns.
#[derive(Clone, Default)]
pub(crate) struct FakeServer {
    inner: Arc<ServerInner>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Require MD5 authentication with this password.
    pub(crate) fn with_password(self, password: &str) -> Self {
        *self.inner.password.lock() = Some(password.to_string());
        self
    }

    /// Connector that opens a fresh session per connection.
    pub(crate) fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(FakeConnector {
            server: self.clone(),
        })
    }

    /// Start a session and return the client end of its pipe.
    pub(crate) fn connect_client(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(1 << 20);
        let pid = 1000 + self.inner.next_pid.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(Arc::clone(&self.inner), pid);
        let handle = tokio::spawn(async move {
            let _ = session.serve(server).await;
        });
        self.inner.sessions.lock().push(handle);
        client
    }

    /// Connect a client through the full startup handshake.
    pub(crate) async fn connect(&self, options: &PgOptions) -> PgResult<PgConnection> {
        PgConnection::connect_with_transport(&Ctx::background(), Box::new(self.connect_client()), options)
            .await
    }

    /// Kill every live session, dropping the server end of its pipe.
    pub(crate) async fn kill_sessions(&self) {
        let handles = std::mem::take(&mut *self.inner.sessions.lock());
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Frontend messages received after startup, over all sessions.
    pub(crate) fn messages_received(&self) -> usize {
        self.inner.messages.load(Ordering::SeqCst)
    }

    /// Committed rows in `table`.
    pub(crate) fn committed_rows(&self, table: &str) -> usize {
        self.inner
            .tables
            .lock()
            .get(table)
            .map_or(0, |t| t.rows.len())
    }
}

struct FakeConnector {
    server: FakeServer,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, ctx: &Ctx, options: &PgOptions) -> PgResult<PgConnection> {
        let client = self.server.connect_client();
        PgConnection::connect_with_transport(ctx, Box::new(client), options).await
    }
}

// ============================================================================
// Transports and streams that fail
// ============================================================================

/// Transport whose every read and write fails.
pub(crate) struct BrokenTransport;

fn broken() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "broken transport")
}

impl AsyncRead for BrokenTransport {
    fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(broken()))
    }
}

impl AsyncWrite for BrokenTransport {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(broken()))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Reader that yields `data` once, then fails.
pub(crate) struct FailingReader {
    data: Option<Vec<u8>>,
}

impl FailingReader {
    pub(crate) fn new(data: &[u8]) -> Self {
        Self {
            data: Some(data.to_vec()),
        }
    }
}

impl AsyncRead for FailingReader {
    fn poll_read(mut self: Pin<&mut Self>, _: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.data.take() {
            Some(data) => {
                buf.put_slice(&data[..data.len().min(buf.remaining())]);
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "source exploded"))),
        }
    }
}

/// Writer that rejects every write.
pub(crate) struct FailingWriter;

impl AsyncWrite for FailingWriter {
    fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
        Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, "sink exploded")))
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ============================================================================
// SQL
// ============================================================================

#[derive(Debug, Clone)]
enum Value {
    Lit(Option<String>),
    Param(usize),
}

#[derive(Debug, Clone)]
enum Command {
    Begin,
    Commit,
    Rollback,
    Literal { oid: Oid, value: String },
    Param(Oid),
    Sleep(Duration),
    Count(String),
    SelectAll(String),
    Create { table: String, columns: Vec<String> },
    Drop { table: String, if_exists: bool },
    Insert { table: String, values: Vec<Value> },
    CopyIn(String),
    CopyOut(String),
    Deallocate(String),
    Invalid(String),
}

impl Command {
    fn param_types(&self) -> Vec<Oid> {
        match self {
            Command::Param(oid) => vec![*oid],
            Command::Insert { values, .. } => {
                let n = values
                    .iter()
                    .filter_map(|v| match v {
                        Value::Param(n) => Some(*n),
                        Value::Lit(_) => None,
                    })
                    .max()
                    .unwrap_or(0);
                vec![Oid::TEXT; n]
            }
            _ => Vec::new(),
        }
    }

    fn is_transaction_control(&self) -> bool {
        matches!(self, Command::Commit | Command::Rollback)
    }
}

fn classify(sql: &str) -> Command {
    let sql = sql.trim().trim_end_matches(';').trim();
    let lower = sql.to_ascii_lowercase();
    let words: Vec<&str> = lower.split_whitespace().collect();

    match words.as_slice() {
        ["begin", ..] | ["start", "transaction", ..] => Command::Begin,
        ["commit"] | ["end"] => Command::Commit,
        ["rollback"] | ["abort"] => Command::Rollback,
        ["select", "count(*)", "from", table] => Command::Count(table.to_string()),
        ["select", "*", "from", table] => Command::SelectAll(table.to_string()),
        ["select", ..] => classify_select(sql[6..].trim(), sql),
        ["create", "table", ..] => parse_create(&lower).unwrap_or_else(|| Command::Invalid(sql.to_string())),
        ["drop", "table", "if", "exists", table] => Command::Drop {
            table: table.to_string(),
            if_exists: true,
        },
        ["drop", "table", table] => Command::Drop {
            table: table.to_string(),
            if_exists: false,
        },
        ["insert", "into", table, ..] => match lower.find("values") {
            Some(at) => Command::Insert {
                table: table.to_string(),
                values: parse_values(&sql[at + "values".len()..]),
            },
            None => Command::Invalid(sql.to_string()),
        },
        ["copy", table, "from", "stdin", ..] => Command::CopyIn(table.to_string()),
        ["copy", table, "to", "stdout", ..] => Command::CopyOut(table.to_string()),
        ["deallocate", name] => Command::Deallocate(name.to_string()),
        _ => Command::Invalid(sql.to_string()),
    }
}

fn classify_select(expr: &str, sql: &str) -> Command {
    let lower = expr.to_ascii_lowercase();
    if let Some(text) = expr.strip_prefix('\'').and_then(|e| e.strip_suffix('\'')) {
        return Command::Literal {
            oid: Oid::TEXT,
            value: text.to_string(),
        };
    }
    if let Ok(n) = expr.parse::<i64>() {
        let oid = if i32::try_from(n).is_ok() { Oid::INT4 } else { Oid::INT8 };
        return Command::Literal {
            oid,
            value: n.to_string(),
        };
    }
    match lower.as_str() {
        "$1" => return Command::Param(Oid::TEXT),
        "$1::int4" => return Command::Param(Oid::INT4),
        "$1::int8" => return Command::Param(Oid::INT8),
        _ => {}
    }
    if let Some(secs) = lower
        .strip_prefix("pg_sleep(")
        .and_then(|s| s.strip_suffix(')'))
        .and_then(|s| s.parse::<f64>().ok())
    {
        return Command::Sleep(Duration::from_secs_f64(secs));
    }
    Command::Invalid(sql.to_string())
}

fn parse_create(lower: &str) -> Option<Command> {
    let rest = lower.strip_prefix("create table")?.trim();
    let open = rest.find('(')?;
    let close = rest.rfind(')')?;
    let table = rest[..open].trim().to_string();
    let columns = rest[open + 1..close]
        .split(',')
        .filter_map(|c| c.split_whitespace().next())
        .map(str::to_string)
        .collect();
    Some(Command::Create { table, columns })
}

fn parse_values(list: &str) -> Vec<Value> {
    let list = list.trim().trim_start_matches('(').trim_end_matches(')');
    list.split(',')
        .map(str::trim)
        .map(|token| {
            if let Some(n) = token.strip_prefix('$').and_then(|n| n.parse().ok()) {
                Value::Param(n)
            } else if token.eq_ignore_ascii_case("null") {
                Value::Lit(None)
            } else {
                let text = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')).unwrap_or(token);
                Value::Lit(Some(text.to_string()))
            }
        })
        .collect()
}

// ============================================================================
// Session
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tx {
    Idle,
    InBlock,
    Failed,
}

struct FakeError {
    code: &'static str,
    message: String,
}

impl FakeError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn aborted() -> Self {
        Self::new(
            "25P02",
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }
}

enum Outcome {
    Rows {
        columns: Vec<(String, Oid)>,
        rows: Vec<Row>,
    },
    Command(String),
    CopyIn { table: String, columns: usize },
    CopyOut(Vec<Row>),
}

struct FakeStatement {
    command: Command,
    param_types: Vec<Oid>,
}

#[derive(Clone)]
struct Portal {
    command: Command,
    params: Vec<Option<String>>,
    result_formats: Vec<i16>,
}

struct CopyIn {
    table: String,
    columns: usize,
    pending: Vec<u8>,
    rows: Vec<Row>,
    extended: bool,
}

impl CopyIn {
    fn feed(&mut self, data: &[u8]) -> Result<(), FakeError> {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.line(&line)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<Vec<Row>, FakeError> {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            self.line(&line)?;
        }
        Ok(std::mem::take(&mut self.rows))
    }

    fn line(&mut self, line: &[u8]) -> Result<(), FakeError> {
        let fields = parse_copy_text_row(line, b'\t')
            .map_err(|e| FakeError::new("22P04", e.to_string()))?;
        if fields.len() > self.columns {
            return Err(FakeError::new("22P04", "extra data after last expected column"));
        }
        if fields.len() < self.columns {
            return Err(FakeError::new("22P04", "missing data for column"));
        }
        self.rows.push(fields);
        Ok(())
    }
}

struct Session {
    server: Arc<ServerInner>,
    pid: i32,
    tx: Tx,
    /// Rows written inside the open transaction block
    uncommitted: Vec<(String, Vec<Row>)>,
    statements: HashMap<String, FakeStatement>,
    portals: HashMap<String, Portal>,
    /// Set after an extended-protocol error until the next Sync
    skipping: bool,
    copy_in: Option<CopyIn>,
    out: BytesMut,
}

impl Session {
    fn new(server: Arc<ServerInner>, pid: i32) -> Self {
        Self {
            server,
            pid,
            tx: Tx::Idle,
            uncommitted: Vec::new(),
            statements: HashMap::new(),
            portals: HashMap::new(),
            skipping: false,
            copy_in: None,
            out: BytesMut::new(),
        }
    }

    async fn serve(mut self, stream: DuplexStream) -> io::Result<()> {
        let (mut rd, mut wr) = tokio::io::split(stream);
        if !self.startup(&mut rd, &mut wr).await? {
            return Ok(());
        }

        loop {
            let Ok(tag) = rd.read_u8().await else {
                return Ok(());
            };
            let body = read_body(&mut rd).await?;
            self.server.messages.fetch_add(1, Ordering::SeqCst);

            let keep_going = self.handle(tag, &body).await;
            self.flush(&mut wr).await?;
            if !keep_going {
                return Ok(());
            }
        }
    }

    async fn flush(&mut self, wr: &mut WriteHalf<DuplexStream>) -> io::Result<()> {
        wr.write_all(&self.out).await?;
        self.out.clear();
        wr.flush().await
    }

    async fn startup(
        &mut self,
        rd: &mut ReadHalf<DuplexStream>,
        wr: &mut WriteHalf<DuplexStream>,
    ) -> io::Result<bool> {
        let len = rd.read_i32().await?;
        let mut body = vec![0u8; len as usize - 4];
        rd.read_exact(&mut body).await?;
        let mut cur = Cursor::new(&body);
        if cur.i32() == CANCEL_REQUEST_CODE {
            return Ok(false);
        }

        let mut params = HashMap::new();
        loop {
            let key = cur.cstr();
            if key.is_empty() {
                break;
            }
            params.insert(key, cur.cstr());
        }
        let user = params.remove("user").unwrap_or_default();

        let password = self.server.password.lock().clone();
        if let Some(password) = password {
            let salt = [1u8, 2, 3, 4];
            put_msg(&mut self.out, b'R', |b| {
                b.put_i32(5);
                b.put_slice(&salt);
            });
            self.flush(wr).await?;

            let tag = rd.read_u8().await?;
            let body = read_body(rd).await?;
            let given = if tag == b'p' { Cursor::new(&body).cstr() } else { String::new() };
            if given != md5_password(&user, &password, &salt) {
                self.error_response(&FakeError::new(
                    "28P01",
                    format!("password authentication failed for user \"{}\"", user),
                ));
                self.flush(wr).await?;
                return Ok(false);
            }
        }

        put_msg(&mut self.out, b'R', |b| b.put_i32(0));
        for (name, value) in [("server_version", "16.0 (fake)"), ("client_encoding", "UTF8")] {
            put_msg(&mut self.out, b'S', |b| {
                put_cstr(b, name);
                put_cstr(b, value);
            });
        }
        let pid = self.pid;
        put_msg(&mut self.out, b'K', |b| {
            b.put_i32(pid);
            b.put_i32(pid.wrapping_mul(7919));
        });
        self.ready();
        self.flush(wr).await?;
        Ok(true)
    }

    /// Handle one frontend message; false ends the session.
    async fn handle(&mut self, tag: u8, body: &[u8]) -> bool {
        let mut cur = Cursor::new(body);

        if self.copy_in.is_some() {
            match tag {
                b'd' => {
                    let fed = match self.copy_in.as_mut() {
                        Some(copy) => copy.feed(body),
                        None => Ok(()),
                    };
                    if let Err(e) = fed {
                        self.end_copy(Err(e));
                    }
                }
                b'c' => {
                    let finished = match self.copy_in.as_mut() {
                        Some(copy) => copy.finish(),
                        None => Ok(Vec::new()),
                    };
                    self.end_copy(finished);
                }
                b'f' => {
                    let reason = cur.cstr();
                    self.end_copy(Err(FakeError::new(
                        "57014",
                        format!("COPY from stdin failed: {}", reason),
                    )));
                }
                b'X' => return false,
                // Sync and Flush are ignored while copying
                _ => {}
            }
            return true;
        }

        match tag {
            b'Q' => {
                let sql = cur.cstr();
                self.simple_query(&sql).await;
            }
            b'S' => {
                self.skipping = false;
                self.portals.remove("");
                self.ready();
            }
            b'H' => {}
            b'X' => return false,
            // Leftovers of a COPY that already failed
            b'd' | b'c' | b'f' => {}
            _ if self.skipping => {}
            b'P' => {
                let name = cur.cstr();
                let sql = cur.cstr();
                let result = self.parse(name, &sql);
                self.extended(result);
            }
            b'D' => {
                let kind = cur.u8();
                let name = cur.cstr();
                let result = self.describe(kind, &name);
                self.extended(result);
            }
            b'B' => {
                let portal = cur.cstr();
                let statement = cur.cstr();
                let param_formats: Vec<i16> = (0..cur.i16()).map(|_| cur.i16()).collect();
                let params: Vec<Option<Vec<u8>>> = (0..cur.i16())
                    .map(|_| match cur.i32() {
                        -1 => None,
                        n => Some(cur.bytes(n as usize).to_vec()),
                    })
                    .collect();
                let result_formats: Vec<i16> = (0..cur.i16()).map(|_| cur.i16()).collect();
                let result = self.bind(portal, &statement, &param_formats, params, result_formats);
                self.extended(result);
            }
            b'E' => {
                let portal = cur.cstr();
                let result = self.execute_portal(&portal).await;
                self.extended(result);
            }
            b'C' => {
                let kind = cur.u8();
                let name = cur.cstr();
                let result = self.close(kind, &name);
                self.extended(result);
            }
            other => self.extended(Err(FakeError::new(
                "08P01",
                format!("invalid frontend message type {}", other as char),
            ))),
        }
        true
    }

    // ------------------------------------------------------------------------
    // Simple query
    // ------------------------------------------------------------------------

    async fn simple_query(&mut self, sql: &str) {
        let statements: Vec<&str> = sql.split(';').map(str::trim).filter(|s| !s.is_empty()).collect();
        if statements.is_empty() {
            put_msg(&mut self.out, b'I', |_| {});
        }

        for statement in statements {
            let command = classify(statement);
            match self.execute(&command, &[]).await {
                Ok(Outcome::Rows { columns, rows }) => {
                    self.row_description(&columns, &[]);
                    for row in &rows {
                        self.data_row(&columns, row, &[]);
                    }
                    self.complete(&format!("SELECT {}", rows.len()));
                }
                Ok(Outcome::Command(tag)) => self.complete(&tag),
                Ok(Outcome::CopyIn { table, columns }) => {
                    self.start_copy_in(table, columns, false);
                    // ReadyForQuery follows the end of the COPY
                    return;
                }
                Ok(Outcome::CopyOut(rows)) => self.copy_out(&rows),
                Err(e) => {
                    self.fail(e);
                    break;
                }
            }
        }
        self.ready();
    }

    // ------------------------------------------------------------------------
    // Extended query
    // ------------------------------------------------------------------------

    fn extended(&mut self, result: Result<(), FakeError>) {
        if let Err(e) = result {
            self.fail(e);
            self.skipping = true;
        }
    }

    fn parse(&mut self, name: String, sql: &str) -> Result<(), FakeError> {
        let command = classify(sql);
        if let Command::Invalid(sql) = &command {
            return Err(syntax_error(sql));
        }
        if self.tx == Tx::Failed && !command.is_transaction_control() {
            return Err(FakeError::aborted());
        }
        if !name.is_empty() && self.statements.contains_key(&name) {
            return Err(FakeError::new(
                "42P05",
                format!("prepared statement \"{}\" already exists", name),
            ));
        }
        let param_types = command.param_types();
        self.statements.insert(name, FakeStatement { command, param_types });
        put_msg(&mut self.out, b'1', |_| {});
        Ok(())
    }

    fn describe(&mut self, kind: u8, name: &str) -> Result<(), FakeError> {
        let (command, param_types, formats) = match kind {
            b'S' => {
                let stmt = self.statements.get(name).ok_or_else(|| unknown_statement(name))?;
                (stmt.command.clone(), Some(stmt.param_types.clone()), Vec::new())
            }
            _ => {
                let portal = self
                    .portals
                    .get(name)
                    .ok_or_else(|| FakeError::new("34000", format!("portal \"{}\" does not exist", name)))?;
                (portal.command.clone(), None, portal.result_formats.clone())
            }
        };

        if let Some(types) = param_types {
            put_msg(&mut self.out, b't', |b| {
                b.put_i16(types.len() as i16);
                for oid in &types {
                    b.put_i32(oid.0);
                }
            });
        }
        match self.columns_of(&command)? {
            Some(columns) => self.row_description(&columns, &formats),
            None => put_msg(&mut self.out, b'n', |_| {}),
        }
        Ok(())
    }

    fn bind(
        &mut self,
        portal: String,
        statement: &str,
        formats: &[i16],
        params: Vec<Option<Vec<u8>>>,
        result_formats: Vec<i16>,
    ) -> Result<(), FakeError> {
        let stmt = self.statements.get(statement).ok_or_else(|| unknown_statement(statement))?;
        if self.tx == Tx::Failed && !stmt.command.is_transaction_control() {
            return Err(FakeError::aborted());
        }
        if params.len() != stmt.param_types.len() {
            return Err(FakeError::new(
                "08P01",
                format!(
                    "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                    params.len(),
                    statement,
                    stmt.param_types.len()
                ),
            ));
        }

        let params = params
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                value.map(|data| {
                    if format_at(formats, i) == 1 {
                        binary_to_text(stmt.param_types[i], &data)
                    } else {
                        String::from_utf8_lossy(&data).into_owned()
                    }
                })
            })
            .collect();

        let command = stmt.command.clone();
        self.portals.insert(
            portal,
            Portal {
                command,
                params,
                result_formats,
            },
        );
        put_msg(&mut self.out, b'2', |_| {});
        Ok(())
    }

    async fn execute_portal(&mut self, name: &str) -> Result<(), FakeError> {
        let portal = self
            .portals
            .get(name)
            .cloned()
            .ok_or_else(|| FakeError::new("34000", format!("portal \"{}\" does not exist", name)))?;

        match self.execute(&portal.command, &portal.params).await? {
            Outcome::Rows { columns, rows } => {
                for row in &rows {
                    self.data_row(&columns, row, &portal.result_formats);
                }
                self.complete(&format!("SELECT {}", rows.len()));
            }
            Outcome::Command(tag) => self.complete(&tag),
            Outcome::CopyIn { table, columns } => self.start_copy_in(table, columns, true),
            Outcome::CopyOut(rows) => self.copy_out(&rows),
        }
        Ok(())
    }

    fn close(&mut self, kind: u8, name: &str) -> Result<(), FakeError> {
        match kind {
            b'S' => {
                self.statements.remove(name).ok_or_else(|| unknown_statement(name))?;
            }
            _ => {
                self.portals.remove(name);
            }
        }
        put_msg(&mut self.out, b'3', |_| {});
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    async fn execute(&mut self, command: &Command, params: &[Option<String>]) -> Result<Outcome, FakeError> {
        if self.tx == Tx::Failed && !command.is_transaction_control() {
            return Err(FakeError::aborted());
        }

        match command {
            Command::Begin => {
                if self.tx == Tx::InBlock {
                    self.notice("25001", "there is already a transaction in progress");
                }
                self.tx = Tx::InBlock;
                Ok(Outcome::Command("BEGIN".to_string()))
            }
            Command::Commit => {
                let tag = match self.tx {
                    Tx::InBlock => {
                        let mut tables = self.server.tables.lock();
                        for (table, rows) in self.uncommitted.drain(..) {
                            if let Some(t) = tables.get_mut(&table) {
                                t.rows.extend(rows);
                            }
                        }
                        "COMMIT"
                    }
                    Tx::Failed => "ROLLBACK",
                    Tx::Idle => {
                        self.notice("25P01", "there is no transaction in progress");
                        "COMMIT"
                    }
                };
                self.uncommitted.clear();
                self.tx = Tx::Idle;
                Ok(Outcome::Command(tag.to_string()))
            }
            Command::Rollback => {
                if self.tx == Tx::Idle {
                    self.notice("25P01", "there is no transaction in progress");
                }
                self.uncommitted.clear();
                self.tx = Tx::Idle;
                Ok(Outcome::Command("ROLLBACK".to_string()))
            }
            Command::Literal { oid, value } => Ok(Outcome::Rows {
                columns: vec![("?column?".to_string(), *oid)],
                rows: vec![vec![Some(value.clone())]],
            }),
            Command::Param(oid) => Ok(Outcome::Rows {
                columns: vec![("?column?".to_string(), *oid)],
                rows: vec![vec![params.first().cloned().flatten()]],
            }),
            Command::Sleep(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(Outcome::Rows {
                    columns: vec![("pg_sleep".to_string(), Oid::TEXT)],
                    rows: vec![vec![Some(String::new())]],
                })
            }
            Command::Count(table) => {
                let n = self.visible_rows(table)?.len();
                Ok(Outcome::Rows {
                    columns: vec![("count".to_string(), Oid::INT8)],
                    rows: vec![vec![Some(n.to_string())]],
                })
            }
            Command::SelectAll(table) => {
                let columns = self
                    .table_columns(table)?
                    .into_iter()
                    .map(|c| (c, Oid::TEXT))
                    .collect();
                let rows = self.visible_rows(table)?;
                Ok(Outcome::Rows { columns, rows })
            }
            Command::Create { table, columns } => {
                let mut tables = self.server.tables.lock();
                if tables.contains_key(table) {
                    return Err(FakeError::new(
                        "42P07",
                        format!("relation \"{}\" already exists", table),
                    ));
                }
                tables.insert(
                    table.clone(),
                    Table {
                        columns: columns.clone(),
                        rows: Vec::new(),
                    },
                );
                Ok(Outcome::Command("CREATE TABLE".to_string()))
            }
            Command::Drop { table, if_exists } => {
                let removed = self.server.tables.lock().remove(table).is_some();
                if !removed {
                    if !if_exists {
                        return Err(missing_table(table));
                    }
                    self.notice("00000", &format!("table \"{}\" does not exist, skipping", table));
                }
                Ok(Outcome::Command("DROP TABLE".to_string()))
            }
            Command::Insert { table, values } => {
                let columns = self.table_columns(table)?;
                if values.len() != columns.len() {
                    return Err(FakeError::new(
                        "42601",
                        "INSERT has more expressions than target columns",
                    ));
                }
                let row = values
                    .iter()
                    .map(|v| match v {
                        Value::Lit(text) => text.clone(),
                        Value::Param(n) => params.get(n.saturating_sub(1)).cloned().flatten(),
                    })
                    .collect();
                self.write_rows(table, vec![row]);
                Ok(Outcome::Command("INSERT 0 1".to_string()))
            }
            Command::CopyIn(table) => {
                let columns = self.table_columns(table)?.len();
                Ok(Outcome::CopyIn {
                    table: table.clone(),
                    columns,
                })
            }
            Command::CopyOut(table) => Ok(Outcome::CopyOut(self.visible_rows(table)?)),
            Command::Deallocate(name) => {
                self.statements.remove(name).ok_or_else(|| unknown_statement(name))?;
                Ok(Outcome::Command("DEALLOCATE".to_string()))
            }
            Command::Invalid(sql) => Err(syntax_error(sql)),
        }
    }

    fn columns_of(&self, command: &Command) -> Result<Option<Vec<(String, Oid)>>, FakeError> {
        Ok(match command {
            Command::Literal { oid, .. } | Command::Param(oid) => Some(vec![("?column?".to_string(), *oid)]),
            Command::Sleep(_) => Some(vec![("pg_sleep".to_string(), Oid::TEXT)]),
            Command::Count(_) => Some(vec![("count".to_string(), Oid::INT8)]),
            Command::SelectAll(table) => Some(
                self.table_columns(table)?
                    .into_iter()
                    .map(|c| (c, Oid::TEXT))
                    .collect(),
            ),
            _ => None,
        })
    }

    fn table_columns(&self, table: &str) -> Result<Vec<String>, FakeError> {
        self.server
            .tables
            .lock()
            .get(table)
            .map(|t| t.columns.clone())
            .ok_or_else(|| missing_table(table))
    }

    /// Committed rows plus this session's own uncommitted ones.
    fn visible_rows(&self, table: &str) -> Result<Vec<Row>, FakeError> {
        let mut rows = self
            .server
            .tables
            .lock()
            .get(table)
            .map(|t| t.rows.clone())
            .ok_or_else(|| missing_table(table))?;
        for (t, pending) in &self.uncommitted {
            if t == table {
                rows.extend(pending.iter().cloned());
            }
        }
        Ok(rows)
    }

    fn write_rows(&mut self, table: &str, rows: Vec<Row>) {
        if self.tx == Tx::InBlock {
            self.uncommitted.push((table.to_string(), rows));
        } else if let Some(t) = self.server.tables.lock().get_mut(table) {
            t.rows.extend(rows);
        }
    }

    // ------------------------------------------------------------------------
    // COPY
    // ------------------------------------------------------------------------

    fn start_copy_in(&mut self, table: String, columns: usize, extended: bool) {
        put_msg(&mut self.out, b'G', |b| {
            b.put_i8(0);
            b.put_i16(columns as i16);
            for _ in 0..columns {
                b.put_i16(0);
            }
        });
        self.copy_in = Some(CopyIn {
            table,
            columns,
            pending: Vec::new(),
            rows: Vec::new(),
            extended,
        });
    }

    fn end_copy(&mut self, result: Result<Vec<Row>, FakeError>) {
        let Some(copy) = self.copy_in.take() else {
            return;
        };
        match result {
            Ok(rows) => {
                let n = rows.len();
                self.write_rows(&copy.table, rows);
                self.complete(&format!("COPY {}", n));
            }
            Err(e) => {
                self.fail(e);
                if copy.extended {
                    self.skipping = true;
                }
            }
        }
        if !copy.extended {
            self.ready();
        }
    }

    fn copy_out(&mut self, rows: &[Row]) {
        let columns = rows.first().map_or(0, Vec::len);
        put_msg(&mut self.out, b'H', |b| {
            b.put_i8(0);
            b.put_i16(columns as i16);
            for _ in 0..columns {
                b.put_i16(0);
            }
        });
        for row in rows {
            let values: Vec<PgValue> = row
                .iter()
                .map(|v| v.clone().map_or(PgValue::Null, PgValue::Text))
                .collect();
            let mut encoder = CopyRowEncoder::new();
            if encoder.encode_row(&values).is_ok() {
                put_msg(&mut self.out, b'd', |b| b.put_slice(encoder.as_bytes()));
            }
        }
        put_msg(&mut self.out, b'c', |_| {});
        self.complete(&format!("COPY {}", rows.len()));
    }

    // ------------------------------------------------------------------------
    // Responses
    // ------------------------------------------------------------------------

    fn fail(&mut self, e: FakeError) {
        self.error_response(&e);
        if self.tx == Tx::InBlock {
            self.tx = Tx::Failed;
        }
    }

    fn ready(&mut self) {
        let status = match self.tx {
            Tx::Idle => b'I',
            Tx::InBlock => b'T',
            Tx::Failed => b'E',
        };
        put_msg(&mut self.out, b'Z', |b| b.put_u8(status));
    }

    fn complete(&mut self, tag: &str) {
        put_msg(&mut self.out, b'C', |b| put_cstr(b, tag));
    }

    fn error_response(&mut self, e: &FakeError) {
        put_msg(&mut self.out, b'E', |b| {
            for (field, value) in [(b'S', "ERROR"), (b'V', "ERROR"), (b'C', e.code), (b'M', e.message.as_str())] {
                b.put_u8(field);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }

    fn notice(&mut self, code: &str, message: &str) {
        put_msg(&mut self.out, b'N', |b| {
            for (field, value) in [(b'S', "NOTICE"), (b'C', code), (b'M', message)] {
                b.put_u8(field);
                put_cstr(b, value);
            }
            b.put_u8(0);
        });
    }

    fn row_description(&mut self, columns: &[(String, Oid)], formats: &[i16]) {
        put_msg(&mut self.out, b'T', |b| {
            b.put_i16(columns.len() as i16);
            for (i, (name, oid)) in columns.iter().enumerate() {
                put_cstr(b, name);
                b.put_i32(0);
                b.put_i16(0);
                b.put_i32(oid.0);
                b.put_i16(-1);
                b.put_i32(-1);
                b.put_i16(format_at(formats, i));
            }
        });
    }

    fn data_row(&mut self, columns: &[(String, Oid)], row: &[Option<String>], formats: &[i16]) {
        put_msg(&mut self.out, b'D', |b| {
            b.put_i16(row.len() as i16);
            for (i, value) in row.iter().enumerate() {
                match value {
                    None => b.put_i32(-1),
                    Some(text) => {
                        let oid = columns.get(i).map_or(Oid::TEXT, |c| c.1);
                        let data = if format_at(formats, i) == 1 {
                            text_to_binary(oid, text)
                        } else {
                            text.as_bytes().to_vec()
                        };
                        b.put_i32(data.len() as i32);
                        b.put_slice(&data);
                    }
                }
            }
        });
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn syntax_error(sql: &str) -> FakeError {
    let near = sql.split_whitespace().next().unwrap_or("");
    FakeError::new("42601", format!("syntax error at or near \"{}\"", near))
}

fn missing_table(table: &str) -> FakeError {
    FakeError::new("42P01", format!("relation \"{}\" does not exist", table))
}

fn unknown_statement(name: &str) -> FakeError {
    FakeError::new("26000", format!("prepared statement \"{}\" does not exist", name))
}

/// Format code for column or parameter `i` (none: text, one: all, else per item).
fn format_at(formats: &[i16], i: usize) -> i16 {
    match formats {
        [] => 0,
        [only] => *only,
        many => many.get(i).copied().unwrap_or(0),
    }
}

fn binary_to_text(oid: Oid, data: &[u8]) -> String {
    match (oid, data.len()) {
        (Oid::INT2, 2) => i16::from_be_bytes([data[0], data[1]]).to_string(),
        (Oid::INT4, 4) => i32::from_be_bytes([data[0], data[1], data[2], data[3]]).to_string(),
        (Oid::INT8, 8) => {
            let mut b = [0u8; 8];
            b.copy_from_slice(data);
            i64::from_be_bytes(b).to_string()
        }
        (Oid::BOOL, 1) => (if data[0] != 0 { "t" } else { "f" }).to_string(),
        _ => String::from_utf8_lossy(data).into_owned(),
    }
}

fn text_to_binary(oid: Oid, text: &str) -> Vec<u8> {
    let parsed = match oid {
        Oid::INT2 => text.parse::<i16>().map(|v| v.to_be_bytes().to_vec()),
        Oid::INT4 => text.parse::<i32>().map(|v| v.to_be_bytes().to_vec()),
        Oid::INT8 => text.parse::<i64>().map(|v| v.to_be_bytes().to_vec()),
        Oid::BOOL => return vec![u8::from(text == "t")],
        _ => return text.as_bytes().to_vec(),
    };
    parsed.unwrap_or_else(|_| text.as_bytes().to_vec())
}

fn put_msg(out: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    out.put_u8(tag);
    let at = out.len();
    out.put_i32(0);
    body(out);
    let len = (out.len() - at) as i32;
    out[at..at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(b: &mut BytesMut, s: &str) {
    b.put_slice(s.as_bytes());
    b.put_u8(0);
}

async fn read_body(rd: &mut ReadHalf<DuplexStream>) -> io::Result<Vec<u8>> {
    let len = rd.read_i32().await?;
    let mut body = vec![0u8; (len as usize).saturating_sub(4)];
    rd.read_exact(&mut body).await?;
    Ok(body)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> &'a [u8] {
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        out
    }

    fn u8(&mut self) -> u8 {
        self.bytes(1)[0]
    }

    fn i16(&mut self) -> i16 {
        let b = self.bytes(2);
        i16::from_be_bytes([b[0], b[1]])
    }

    fn i32(&mut self) -> i32 {
        let b = self.bytes(4);
        i32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    fn cstr(&mut self) -> String {
        let rest = &self.buf[self.pos..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        s
    }
}
