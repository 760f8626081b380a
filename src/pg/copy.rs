//! COPY protocol methods for PostgreSQL bulk operations.
//!
//! `copy_from` streams an `AsyncRead` to `COPY ... FROM STDIN` in bounded
//! chunks; `copy_to` writes every CopyData frame of `COPY ... TO STDOUT` to an
//! `AsyncWrite` as it arrives. Neither buffers the whole data set.
//!
//! Both issue the COPY through the simple query protocol. After a server-side
//! error the server answers ErrorResponse + ReadyForQuery and ignores any
//! Copy* messages that follow, so the stream stays in sync whatever we send.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::connection::{unexpected, Mode, PgConnection};
use super::context::Ctx;
use super::error::{PgError, PgResult, ServerError};
use super::protocol::*;
use super::row::QueryResult;
use super::types::{PgValue, PG_EPOCH_DAYS_FROM_CE, PG_EPOCH_OFFSET_MICROS};

impl PgConnection {
    /// Run `COPY ... FROM STDIN`, feeding it from `source`.
    ///
    /// The returned result's `rows_affected()` is the server's row count.
    /// A read error on `source` sends CopyFail and yields `CopySource`; the
    /// server discards every row of the command.
    pub async fn copy_from<R>(&mut self, ctx: &Ctx, source: &mut R, sql: &str) -> PgResult<QueryResult>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.start_command(ctx)?;
        trace!(pid = self.backend_pid(), sql, "copy from");
        let outcome = ctx.run(self.copy_from_inner(source, sql)).await;
        self.settle(outcome)
    }

    /// Run `COPY ... TO STDOUT`, writing every chunk to `sink`.
    ///
    /// A write error on `sink` does not stop the server; the rest of the
    /// stream is read and discarded, then `CopySource` is returned.
    pub async fn copy_to<W>(&mut self, ctx: &Ctx, sink: &mut W, sql: &str) -> PgResult<QueryResult>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.start_command(ctx)?;
        trace!(pid = self.backend_pid(), sql, "copy to");
        let outcome = ctx.run(self.copy_to_inner(sink, sql)).await;
        self.settle(outcome)
    }

    async fn copy_from_inner<R>(&mut self, source: &mut R, sql: &str) -> PgResult<QueryResult>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.buffer(&QueryMessage { query: sql });
        self.flush().await?;
        self.await_copy_start(true).await?;

        let mut chunk = vec![0u8; self.copy_chunk_size()];
        let mut sent = 0usize;
        loop {
            match source.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    self.buffer(&CopyDataMessage { data: &chunk[..n] });
                    self.flush().await?;
                    sent += n;
                    // The server drops the rest of a rejected copy
                    if self.error_waiting().await? {
                        debug!(pid = self.backend_pid(), sent, "server rejected copy, ending upload early");
                        break;
                    }
                }
                Err(e) => {
                    debug!(pid = self.backend_pid(), error = %e, sent, "copy source failed, aborting copy");
                    let reason = format!("client source failed: {}", e);
                    self.buffer(&CopyFailMessage { reason: &reason });
                    self.flush().await?;
                    self.drain_until_ready().await?;
                    return Err(PgError::CopySource(e));
                }
            }
        }

        self.buffer(&CopyDoneMessage);
        self.flush().await?;

        let mut result = QueryResult::new(Arc::new(Vec::new()));
        let mut failure: Option<ServerError> = None;
        loop {
            match self.receive().await? {
                BackendMessage::CommandComplete { tag } => result.command_tag = tag,
                BackendMessage::ErrorResponse { fields } => {
                    failure.get_or_insert_with(|| ServerError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return match failure {
                        Some(e) => Err(PgError::Copy(Box::new(e))),
                        None => {
                            debug!(pid = self.backend_pid(), bytes = sent, rows = result.rows_affected(), "copy from complete");
                            Ok(result)
                        }
                    };
                }
                other => return Err(unexpected(&other, "copy from")),
            }
        }
    }

    async fn copy_to_inner<W>(&mut self, sink: &mut W, sql: &str) -> PgResult<QueryResult>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        self.buffer(&QueryMessage { query: sql });
        self.flush().await?;
        self.await_copy_start(false).await?;

        let mut result = QueryResult::new(Arc::new(Vec::new()));
        let mut failure: Option<ServerError> = None;
        let mut sink_error: Option<std::io::Error> = None;
        let mut received = 0usize;

        loop {
            match self.receive().await? {
                BackendMessage::CopyData { data } => {
                    received += data.len();
                    if sink_error.is_none() {
                        if let Err(e) = sink.write_all(&data).await {
                            debug!(pid = self.backend_pid(), error = %e, "copy sink failed, draining");
                            sink_error = Some(e);
                        }
                    }
                }
                BackendMessage::CopyDone => {}
                BackendMessage::CommandComplete { tag } => result.command_tag = tag,
                BackendMessage::ErrorResponse { fields } => {
                    failure.get_or_insert_with(|| ServerError::from_fields(&fields));
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    break;
                }
                other => return Err(unexpected(&other, "copy to")),
            }
        }

        if sink_error.is_none() {
            if let Err(e) = sink.flush().await {
                sink_error = Some(e);
            }
        }
        if let Some(e) = sink_error {
            return Err(PgError::CopySource(e));
        }
        if let Some(e) = failure {
            return Err(PgError::Copy(Box::new(e)));
        }
        debug!(pid = self.backend_pid(), bytes = received, rows = result.rows_affected(), "copy to complete");
        Ok(result)
    }

    /// Wait for the server to enter the expected COPY direction.
    ///
    /// A rejected statement, or one that is not a COPY in that direction,
    /// is drained to ReadyForQuery before the error is returned.
    async fn await_copy_start(&mut self, copy_in: bool) -> PgResult<()> {
        loop {
            let msg = self.receive().await?;
            match msg {
                BackendMessage::CopyInResponse(_) if copy_in => return Ok(()),
                BackendMessage::CopyOutResponse(_) if !copy_in => return Ok(()),
                BackendMessage::ErrorResponse { fields } => {
                    let err = ServerError::from_fields(&fields);
                    self.drain_until_ready().await?;
                    return Err(PgError::Copy(Box::new(err)));
                }
                BackendMessage::CopyInResponse(_)
                | BackendMessage::CopyOutResponse(_)
                | BackendMessage::CopyBothResponse(_) => {
                    let err = self.refuse_copy(&msg, Mode::Simple).await?;
                    self.drain_until_ready().await?;
                    return Err(err);
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.ready(status);
                    return Err(not_a_copy(copy_in));
                }
                BackendMessage::RowDescription { .. }
                | BackendMessage::DataRow { .. }
                | BackendMessage::CommandComplete { .. }
                | BackendMessage::EmptyQueryResponse => {
                    self.drain_until_ready().await?;
                    return Err(not_a_copy(copy_in));
                }
                other => return Err(unexpected(&other, "copy start")),
            }
        }
    }
}

fn not_a_copy(copy_in: bool) -> PgError {
    PgError::InvalidOperation(if copy_in {
        "copy_from requires a COPY ... FROM STDIN statement".to_string()
    } else {
        "copy_to requires a COPY ... TO STDOUT statement".to_string()
    })
}

// ============================================================================
// COPY text format
// ============================================================================

/// Encodes rows in COPY text format.
///
/// Rules:
/// - NULL: `\N`
/// - Boolean: `t` or `f`
/// - Strings: `\\`, `\t`, `\n`, `\r` and the delimiter are backslash-escaped
/// - Bytea: `\\x` followed by lowercase hex
/// - Timestamps and dates: ISO 8601, UTC
#[derive(Debug)]
pub struct CopyRowEncoder {
    delimiter: u8,
    buf: BytesMut,
}

impl Default for CopyRowEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl CopyRowEncoder {
    /// Encoder using the default tab delimiter.
    pub fn new() -> Self {
        Self::with_delimiter(b'\t')
    }

    /// Encoder for `COPY ... WITH (DELIMITER 'c')`.
    pub fn with_delimiter(delimiter: u8) -> Self {
        Self {
            delimiter,
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// Append one row terminated by a newline.
    ///
    /// On error nothing of the row is kept.
    pub fn encode_row(&mut self, values: &[PgValue]) -> PgResult<()> {
        let start = self.buf.len();
        for (i, value) in values.iter().enumerate() {
            if i > 0 {
                self.buf.extend_from_slice(&[self.delimiter]);
            }
            if let Err(e) = self.encode_value(value) {
                self.buf.truncate(start);
                return Err(e);
            }
        }
        self.buf.extend_from_slice(b"\n");
        Ok(())
    }

    fn encode_value(&mut self, value: &PgValue) -> PgResult<()> {
        match value {
            PgValue::Null => self.buf.extend_from_slice(b"\\N"),
            PgValue::Bool(b) => self.buf.extend_from_slice(if *b { b"t" } else { b"f" }),
            PgValue::Int2(n) => self.buf.extend_from_slice(n.to_string().as_bytes()),
            PgValue::Int4(n) => self.buf.extend_from_slice(n.to_string().as_bytes()),
            PgValue::Int8(n) => self.buf.extend_from_slice(n.to_string().as_bytes()),
            PgValue::Float4(f) => self.put_float(f64::from(*f), f.to_string()),
            PgValue::Float8(f) => self.put_float(*f, f.to_string()),
            PgValue::Text(s) | PgValue::Json(s) => self.put_escaped(s.as_bytes()),
            PgValue::Bytea(bytes) => {
                self.buf.extend_from_slice(b"\\\\x");
                for b in bytes {
                    self.buf.extend_from_slice(format!("{:02x}", b).as_bytes());
                }
            }
            PgValue::Uuid(bytes) => {
                let text = uuid::Uuid::from_bytes(*bytes).hyphenated().to_string();
                self.buf.extend_from_slice(text.as_bytes());
            }
            PgValue::Timestamp(micros) => {
                let ts = micros
                    .checked_add(PG_EPOCH_OFFSET_MICROS)
                    .and_then(DateTime::<Utc>::from_timestamp_micros)
                    .ok_or_else(|| PgError::Type(format!("timestamp out of range: {}", micros)))?;
                let text = ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.6f").to_string();
                self.buf.extend_from_slice(text.as_bytes());
            }
            PgValue::Date(days) => {
                let date = days
                    .checked_add(PG_EPOCH_DAYS_FROM_CE)
                    .and_then(NaiveDate::from_num_days_from_ce_opt)
                    .ok_or_else(|| PgError::Type(format!("date out of range: {}", days)))?;
                self.buf.extend_from_slice(date.format("%Y-%m-%d").to_string().as_bytes());
            }
            PgValue::Time(micros) => {
                let secs = u32::try_from(micros.div_euclid(1_000_000)).ok();
                let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
                let time = secs
                    .and_then(|s| NaiveTime::from_num_seconds_from_midnight_opt(s, nanos))
                    .ok_or_else(|| PgError::Type(format!("time out of range: {}", micros)))?;
                self.buf.extend_from_slice(time.format("%H:%M:%S%.6f").to_string().as_bytes());
            }
            PgValue::Raw { data, .. } => self.put_escaped(data),
        }
        Ok(())
    }

    fn put_float(&mut self, f: f64, display: String) {
        let text = if f.is_nan() {
            "NaN"
        } else if f == f64::INFINITY {
            "Infinity"
        } else if f == f64::NEG_INFINITY {
            "-Infinity"
        } else {
            &display
        };
        self.buf.extend_from_slice(text.as_bytes());
    }

    fn put_escaped(&mut self, bytes: &[u8]) {
        for &c in bytes {
            match c {
                b'\\' => self.buf.extend_from_slice(b"\\\\"),
                b'\t' => self.buf.extend_from_slice(b"\\t"),
                b'\n' => self.buf.extend_from_slice(b"\\n"),
                b'\r' => self.buf.extend_from_slice(b"\\r"),
                c if c == self.delimiter => self.buf.extend_from_slice(&[b'\\', c]),
                c => self.buf.extend_from_slice(&[c]),
            }
        }
    }

    /// Encoded bytes so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Number of encoded bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take the encoded bytes, leaving the encoder empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Decode one line of COPY text output into its fields; `None` is NULL.
///
/// A trailing `\n` (or `\r\n`) is ignored. Backslash escapes follow the
/// server's rules, including octal (`\123`) and hex (`\x41`) forms.
pub fn parse_copy_text_row(line: &[u8], delimiter: u8) -> PgResult<Vec<Option<String>>> {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let mut fields = Vec::new();
    let mut field: Vec<u8> = Vec::new();
    // Set while the field so far is exactly `\N`
    let mut null_marker = false;
    let mut i = 0;

    let mut finish = |field: &mut Vec<u8>, null_marker: bool| -> PgResult<()> {
        if null_marker {
            fields.push(None);
            field.clear();
            return Ok(());
        }
        let text = String::from_utf8(std::mem::take(field))
            .map_err(|e| PgError::Type(format!("COPY field is not valid UTF-8: {}", e)))?;
        fields.push(Some(text));
        Ok(())
    };

    while i < line.len() {
        let c = line[i];
        if c == delimiter {
            finish(&mut field, null_marker)?;
            null_marker = false;
            i += 1;
            continue;
        }
        if c != b'\\' {
            field.push(c);
            null_marker = false;
            i += 1;
            continue;
        }

        let Some(&esc) = line.get(i + 1) else {
            return Err(PgError::Type("COPY line ends with a lone backslash".to_string()));
        };
        i += 2;
        let at_field_start = field.is_empty() && !null_marker;
        null_marker = false;
        match esc {
            b'N' if at_field_start => null_marker = true,
            b'b' => field.push(0x08),
            b'f' => field.push(0x0c),
            b'n' => field.push(b'\n'),
            b'r' => field.push(b'\r'),
            b't' => field.push(b'\t'),
            b'v' => field.push(0x0b),
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                let mut digits = 1;
                while digits < 3 {
                    match line.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                            digits += 1;
                        }
                        _ => break,
                    }
                }
                field.push((value & 0xff) as u8);
            }
            b'x' if line.get(i).is_some_and(u8::is_ascii_hexdigit) => {
                let mut value = 0u8;
                let mut digits = 0;
                while digits < 2 {
                    match line.get(i).and_then(|d| (*d as char).to_digit(16)) {
                        Some(d) => {
                            value = value * 16 + d as u8;
                            i += 1;
                            digits += 1;
                        }
                        None => break,
                    }
                }
                field.push(value);
            }
            other => field.push(other),
        }
    }
    finish(&mut field, null_marker)?;

    Ok(fields)
}
