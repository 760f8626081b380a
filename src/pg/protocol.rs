//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html
//!
//! Decoding never panics: a short or malformed frame is a [`PgError::Protocol`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::{Oid, PgValue};

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Magic code that replaces the protocol version in a CancelRequest.
pub const CANCEL_REQUEST_CODE: i32 = 80877102; // (1234 << 16) | 5678

/// Largest backend frame we accept. Anything bigger means we lost framing.
pub const MAX_FRAME_LEN: usize = 1 << 30;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    fn from_code(code: i16) -> PgResult<Self> {
        match code {
            0 => Ok(Format::Text),
            1 => Ok(Format::Binary),
            other => Err(PgError::Protocol(format!("invalid format code {}", other))),
        }
    }
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "invalid transaction status {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Append the encoded message to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Encode into a fresh buffer.
    fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf
    }
}

/// Write a tagged frame: tag, length placeholder, body, then patch the length.
fn tagged(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let len_at = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - len_at) as i32;
    buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self, buf: &mut BytesMut) {
        let len_at = buf.len();
        buf.put_i32(0);
        buf.put_i32(PROTOCOL_VERSION);

        put_cstr(buf, "user");
        put_cstr(buf, &self.user);

        if let Some(ref db) = self.database {
            put_cstr(buf, "database");
            put_cstr(buf, db);
        }

        for (key, value) in &self.options {
            put_cstr(buf, key);
            put_cstr(buf, value);
        }

        buf.put_u8(0);

        // Untagged: the length covers the whole message
        let len = (buf.len() - len_at) as i32;
        buf[len_at..len_at + 4].copy_from_slice(&len.to_be_bytes());
    }
}

/// CancelRequest, sent on a fresh connection to interrupt a running query.
#[derive(Debug, Clone, Copy)]
pub struct CancelRequestMessage {
    pub process_id: i32,
    pub secret_key: i32,
}

impl FrontendMessage for CancelRequestMessage {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(self.process_id);
        buf.put_i32(self.secret_key);
    }
}

/// Password message (for MD5 or plaintext auth)
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'p', |b| put_cstr(b, &self.password));
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'p', |b| {
            put_cstr(b, &self.mechanism);
            b.put_i32(self.data.len() as i32);
            b.put_slice(&self.data);
        });
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'p', |b| b.put_slice(&self.data));
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'Q', |b| put_cstr(b, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'P', |b| {
            put_cstr(b, self.name);
            put_cstr(b, self.query);
            b.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                b.put_i32(oid.as_i32());
            }
        });
    }
}

/// Bind message ('B') - Binds parameters to a prepared statement
///
/// Each parameter is sent in the format given at the same index of
/// `param_formats`; text values use their UTF-8 bytes either way.
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    pub param_formats: &'a [Format],
    pub params: &'a [PgValue],
    pub result_formats: &'a [Format],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'B', |b| {
            put_cstr(b, self.portal);
            put_cstr(b, self.statement);

            b.put_i16(self.param_formats.len() as i16);
            for fmt in self.param_formats {
                b.put_i16(*fmt as i16);
            }

            b.put_i16(self.params.len() as i16);
            for param in self.params {
                if param.is_null() {
                    b.put_i32(-1);
                } else {
                    let encoded = param.encode_binary();
                    b.put_i32(encoded.len() as i32);
                    b.put_slice(&encoded);
                }
            }

            b.put_i16(self.result_formats.len() as i16);
            for fmt in self.result_formats {
                b.put_i16(*fmt as i16);
            }
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'E', |b| {
            put_cstr(b, self.portal);
            b.put_i32(self.max_rows);
        });
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'D', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Close message ('C') - Deallocate a prepared statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'C', |b| {
            b.put_u8(self.kind);
            put_cstr(b, self.name);
        });
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'S', |_| {});
    }
}

/// Flush message ('H') - Request server to flush output buffer
#[derive(Debug, Clone, Copy)]
pub struct FlushMessage;

impl FrontendMessage for FlushMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'H', |_| {});
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'X', |_| {});
    }
}

/// CopyData message ('d') - one chunk of COPY FROM STDIN input
#[derive(Debug, Clone)]
pub struct CopyDataMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for CopyDataMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(5 + self.data.len());
        tagged(buf, b'd', |b| b.put_slice(self.data));
    }
}

/// CopyDone message ('c') - end of COPY FROM STDIN input
#[derive(Debug, Clone, Copy)]
pub struct CopyDoneMessage;

impl FrontendMessage for CopyDoneMessage {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'c', |_| {});
    }
}

/// CopyFail message ('f') - abort COPY FROM STDIN with a reason
#[derive(Debug, Clone)]
pub struct CopyFailMessage<'a> {
    pub reason: &'a str,
}

impl FrontendMessage for CopyFailMessage<'_> {
    fn encode(&self, buf: &mut BytesMut) {
        tagged(buf, b'f', |b| put_cstr(b, self.reason));
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Overall format and per-column formats announced by a Copy*Response.
#[derive(Debug, Clone, PartialEq)]
pub struct CopyFormat {
    pub format: Format,
    pub column_formats: Vec<Format>,
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    // Authentication
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMD5Password { salt: [u8; 4] },
    AuthenticationSASL { mechanisms: Vec<String> },
    AuthenticationSASLContinue { data: Bytes },
    AuthenticationSASLFinal { data: Bytes },
    /// Kerberos, GSSAPI, SSPI and anything newer
    AuthenticationUnsupported { code: i32 },

    // Query responses
    RowDescription { fields: Vec<FieldDescription> },
    DataRow { values: Vec<Option<Bytes>> },
    CommandComplete { tag: String },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription { type_oids: Vec<Oid> },

    // COPY sub-protocol
    CopyInResponse(CopyFormat),
    CopyOutResponse(CopyFormat),
    CopyBothResponse(CopyFormat),
    CopyData { data: Bytes },
    CopyDone,

    // Status
    ReadyForQuery { status: TransactionStatus },
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },

    // Errors and notices
    ErrorResponse { fields: HashMap<u8, String> },
    NoticeResponse { fields: HashMap<u8, String> },

    // Asynchronous
    NotificationResponse { process_id: i32, channel: String, payload: String },
}

impl BackendMessage {
    /// Length of the complete frame at the start of `buf`, if fully buffered.
    ///
    /// Returns `Ok(None)` when more bytes are needed, and a protocol error when
    /// the header cannot belong to a well-formed frame.
    pub fn frame_len(buf: &[u8]) -> PgResult<Option<usize>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 || len as usize > MAX_FRAME_LEN {
            return Err(PgError::Protocol(format!(
                "invalid frame length {} for message {:?}",
                len, buf[0] as char
            )));
        }
        let total = 1 + len as usize;
        Ok((buf.len() >= total).then_some(total))
    }

    /// Decode a backend message from bytes.
    ///
    /// The input buffer should start with the message type byte.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        let total = Self::frame_len(buf)?
            .ok_or_else(|| PgError::Protocol("incomplete message".to_string()))?;

        let mut frame = buf.split_to(total);
        let msg_type = frame.get_u8();
        frame.advance(4);
        let mut body = Body { buf: frame, msg_type };

        let msg = match msg_type {
            b'R' => body.decode_auth()?,
            b'T' => body.decode_row_description()?,
            b'D' => body.decode_data_row()?,
            b'C' => BackendMessage::CommandComplete { tag: body.cstring()? },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(body.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse { fields: body.error_fields()? },
            b'N' => BackendMessage::NoticeResponse { fields: body.error_fields()? },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstring()?,
                value: body.cstring()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let n = body.count()?;
                let mut type_oids = Vec::with_capacity(n);
                for _ in 0..n {
                    type_oids.push(Oid::from_i32(body.i32()?));
                }
                BackendMessage::ParameterDescription { type_oids }
            }
            b'G' => BackendMessage::CopyInResponse(body.copy_format()?),
            b'H' => BackendMessage::CopyOutResponse(body.copy_format()?),
            b'W' => BackendMessage::CopyBothResponse(body.copy_format()?),
            b'd' => BackendMessage::CopyData { data: body.rest() },
            b'c' => BackendMessage::CopyDone,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstring()?,
                payload: body.cstring()?,
            },
            other => {
                return Err(PgError::Protocol(format!(
                    "unknown message type {:?}",
                    other as char
                )))
            }
        };

        Ok(msg)
    }

    /// Short name for logs and protocol errors.
    pub fn name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::AuthenticationCleartextPassword => "AuthenticationCleartextPassword",
            BackendMessage::AuthenticationMD5Password { .. } => "AuthenticationMD5Password",
            BackendMessage::AuthenticationSASL { .. } => "AuthenticationSASL",
            BackendMessage::AuthenticationSASLContinue { .. } => "AuthenticationSASLContinue",
            BackendMessage::AuthenticationSASLFinal { .. } => "AuthenticationSASLFinal",
            BackendMessage::AuthenticationUnsupported { .. } => "Authentication",
            BackendMessage::RowDescription { .. } => "RowDescription",
            BackendMessage::DataRow { .. } => "DataRow",
            BackendMessage::CommandComplete { .. } => "CommandComplete",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::NoData => "NoData",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::ParameterDescription { .. } => "ParameterDescription",
            BackendMessage::CopyInResponse(_) => "CopyInResponse",
            BackendMessage::CopyOutResponse(_) => "CopyOutResponse",
            BackendMessage::CopyBothResponse(_) => "CopyBothResponse",
            BackendMessage::CopyData { .. } => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::ReadyForQuery { .. } => "ReadyForQuery",
            BackendMessage::ParameterStatus { .. } => "ParameterStatus",
            BackendMessage::BackendKeyData { .. } => "BackendKeyData",
            BackendMessage::ErrorResponse { .. } => "ErrorResponse",
            BackendMessage::NoticeResponse { .. } => "NoticeResponse",
            BackendMessage::NotificationResponse { .. } => "NotificationResponse",
        }
    }
}

// ============================================================================
// Body reader
// ============================================================================

/// Bounds-checked cursor over one message body.
struct Body {
    buf: Bytes,
    msg_type: u8,
}

impl Body {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol(format!(
                "truncated {:?} message: need {} bytes, have {}",
                self.msg_type as char,
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// A non-negative Int16 count.
    fn count(&mut self) -> PgResult<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| PgError::Protocol(format!("negative count {}", n)))
    }

    fn bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        self.buf.split_off(0)
    }

    /// Read a null-terminated string.
    fn cstring(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("missing null terminator in string".to_string()))?;

        let raw = self.buf.split_to(end);
        self.buf.advance(1);

        Ok(match std::str::from_utf8(&raw) {
            Ok(s) => s.to_owned(),
            Err(_) => String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    fn decode_auth(&mut self) -> PgResult<BackendMessage> {
        let auth_type = self.i32()?;

        Ok(match auth_type {
            0 => BackendMessage::AuthenticationOk,
            3 => BackendMessage::AuthenticationCleartextPassword,
            5 => {
                let raw = self.bytes(4)?;
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&raw);
                BackendMessage::AuthenticationMD5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while self.buf.has_remaining() {
                    let mech = self.cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                BackendMessage::AuthenticationSASL { mechanisms }
            }
            11 => BackendMessage::AuthenticationSASLContinue { data: self.rest() },
            12 => BackendMessage::AuthenticationSASLFinal { data: self.rest() },
            code => BackendMessage::AuthenticationUnsupported { code },
        })
    }

    fn decode_row_description(&mut self) -> PgResult<BackendMessage> {
        let num_fields = self.count()?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            fields.push(FieldDescription {
                name: self.cstring()?,
                table_oid: self.i32()?,
                column_attr: self.i16()?,
                type_oid: Oid::from_i32(self.i32()?),
                type_size: self.i16()?,
                type_modifier: self.i32()?,
                format: Format::from_code(self.i16()?)?,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(&mut self) -> PgResult<BackendMessage> {
        let num_cols = self.count()?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = self.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(self.bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn copy_format(&mut self) -> PgResult<CopyFormat> {
        let format = Format::from_code(i16::from(self.u8()?))?;
        let n = self.count()?;
        let mut column_formats = Vec::with_capacity(n);
        for _ in 0..n {
            column_formats.push(Format::from_code(self.i16()?)?);
        }
        Ok(CopyFormat { format, column_formats })
    }

    fn error_fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();

        while self.buf.has_remaining() {
            let field_type = self.u8()?;
            if field_type == 0 {
                break;
            }
            let value = self.cstring()?;
            fields.insert(field_type, value);
        }

        Ok(fields)
    }
}
