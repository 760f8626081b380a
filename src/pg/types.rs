//! PostgreSQL type encoding and decoding.
//!
//! This module provides binary format encoding/decoding for PostgreSQL types,
//! plus the text-format decoding used by the simple query protocol.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use chrono::{Datelike, NaiveDate, NaiveDateTime};

use super::error::{PgError, PgResult};
use super::protocol::Format;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Unspecified; the server infers the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);

    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);

    // Floating point types
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);

    pub const UNKNOWN: Oid = Oid(705);

    // String types
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);

    // Date/time types
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);

    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8)
    }

    /// Check if this is a floating point type
    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Whether results of this type can be requested in binary format.
    pub fn has_binary_decoder(self) -> bool {
        matches!(
            self,
            Oid::BOOL
                | Oid::BYTEA
                | Oid::INT2
                | Oid::INT4
                | Oid::INT8
                | Oid::FLOAT4
                | Oid::FLOAT8
                | Oid::UUID
                | Oid::TIMESTAMP
                | Oid::TIMESTAMPTZ
                | Oid::DATE
                | Oid::TIME
                | Oid::JSON
                | Oid::JSONB
        ) || self.is_text_like()
    }
}

/// Microseconds between the Unix epoch and the PostgreSQL epoch (2000-01-01).
pub const PG_EPOCH_OFFSET_MICROS: i64 = 946_684_800_000_000;

/// Day number of 2000-01-01 counted from 0001-01-01 (day 1).
pub const PG_EPOCH_DAYS_FROM_CE: i32 = 730_120;

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    // Timestamps stored as microseconds since 2000-01-01
    Timestamp(i64),
    Date(i32),
    Time(i64),
    Json(String),
    // For types we don't handle specially - store raw bytes
    Raw { oid: Oid, data: Vec<u8> },
}

fn fixed<const N: usize>(data: &[u8], type_name: &str) -> PgResult<[u8; N]> {
    data.try_into()
        .map_err(|_| PgError::Type(format!("invalid {} length: {}", type_name, data.len())))
}

impl PgValue {
    /// Check if this value is NULL
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Wire format used when this value is sent as a parameter.
    ///
    /// Text travels in text format so the server can coerce it to whatever
    /// type the parameter was inferred as; everything else is binary.
    pub fn param_format(&self) -> Format {
        match self {
            PgValue::Null | PgValue::Text(_) => Format::Text,
            _ => Format::Binary,
        }
    }

    /// Encode this value for the wire. Text values yield their UTF-8 bytes.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![u8::from(*v)],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) => v.to_be_bytes().to_vec(),
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Time(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // Sent as jsonb: version byte, then the text
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Get the OID for this value's type
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Text(_) => Oid::UNSPECIFIED,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Adapt this value to the parameter type the server described.
    ///
    /// Integer widths and float widths are converted when the value fits;
    /// anything else is passed through and left for the server to judge.
    pub fn coerce_to(&self, target: Oid) -> PgResult<PgValue> {
        let int = match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        };
        let out_of_range =
            |v: i64| PgError::Type(format!("value {} out of range for parameter type {}", v, target.0));

        Ok(match (int, target) {
            (Some(v), Oid::INT2) => PgValue::Int2(i16::try_from(v).map_err(|_| out_of_range(v))?),
            (Some(v), Oid::INT4) => PgValue::Int4(i32::try_from(v).map_err(|_| out_of_range(v))?),
            (Some(v), Oid::INT8) => PgValue::Int8(v),
            (Some(v), Oid::FLOAT4) => PgValue::Float4(v as f32),
            (Some(v), Oid::FLOAT8) => PgValue::Float8(v as f64),
            (Some(v), Oid::NUMERIC) | (Some(v), Oid::OID_TYPE) => PgValue::Text(v.to_string()),
            (Some(v), t) if t.is_text_like() => PgValue::Text(v.to_string()),
            _ => match (self, target) {
                (PgValue::Float4(v), Oid::FLOAT8) => PgValue::Float8(f64::from(*v)),
                (PgValue::Float8(v), Oid::FLOAT4) => PgValue::Float4(*v as f32),
                (PgValue::Float4(v), Oid::NUMERIC) => PgValue::Text(v.to_string()),
                (PgValue::Float8(v), Oid::NUMERIC) => PgValue::Text(v.to_string()),
                (PgValue::Json(v), Oid::JSON) => PgValue::Raw {
                    oid: Oid::JSON,
                    data: v.as_bytes().to_vec(),
                },
                (PgValue::Timestamp(v), Oid::TIMESTAMPTZ) => PgValue::Raw {
                    oid: Oid::TIMESTAMPTZ,
                    data: v.to_be_bytes().to_vec(),
                },
                _ => self.clone(),
            },
        })
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> PgResult<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(PgValue::Bool(*b != 0)),
                _ => Err(PgError::Type(format!("invalid BOOL length: {}", data.len()))),
            },
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?))),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?))),

            _ if oid.is_text_like() => std::str::from_utf8(data)
                .map(|s| PgValue::Text(s.to_owned()))
                .map_err(|e| PgError::Type(format!("invalid UTF-8 in TEXT: {}", e))),

            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(fixed(data, "UUID")?)),
            Oid::TIMESTAMP | Oid::TIMESTAMPTZ => Ok(PgValue::Timestamp(i64::from_be_bytes(
                fixed(data, "TIMESTAMP")?,
            ))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed(data, "DATE")?))),
            Oid::TIME => Ok(PgValue::Time(i64::from_be_bytes(fixed(data, "TIME")?))),

            Oid::JSON | Oid::JSONB => {
                // JSONB has a version byte prefix
                let json_data = match (oid, data) {
                    (Oid::JSONB, [_, rest @ ..]) => rest,
                    _ => data,
                };
                std::str::from_utf8(json_data)
                    .map(|s| PgValue::Json(s.to_owned()))
                    .map_err(|e| PgError::Type(format!("invalid UTF-8 in JSON: {}", e)))
            }

            // For unknown types, store raw bytes
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (simple query protocol and text-format columns).
    pub fn decode_text(oid: Oid, data: &[u8]) -> PgResult<Self> {
        let text = std::str::from_utf8(data)
            .map_err(|e| PgError::Type(format!("invalid UTF-8 in text value: {}", e)))?;
        let bad = |what: &str, e: &dyn std::fmt::Display| {
            PgError::Type(format!("invalid {} {:?}: {}", what, text, e))
        };

        match oid {
            Oid::BOOL => match text {
                "t" | "true" | "1" => Ok(PgValue::Bool(true)),
                "f" | "false" | "0" => Ok(PgValue::Bool(false)),
                _ => Err(PgError::Type(format!("invalid BOOL {:?}", text))),
            },
            Oid::INT2 => text.parse().map(PgValue::Int2).map_err(|e| bad("INT2", &e)),
            Oid::INT4 => text.parse().map(PgValue::Int4).map_err(|e| bad("INT4", &e)),
            Oid::INT8 => text.parse().map(PgValue::Int8).map_err(|e| bad("INT8", &e)),
            Oid::FLOAT4 => text.parse().map(PgValue::Float4).map_err(|e| bad("FLOAT4", &e)),
            Oid::FLOAT8 => text.parse().map(PgValue::Float8).map_err(|e| bad("FLOAT8", &e)),
            Oid::UUID => uuid::Uuid::parse_str(text)
                .map(|u| PgValue::Uuid(*u.as_bytes()))
                .map_err(|e| bad("UUID", &e)),
            Oid::BYTEA => decode_bytea_hex(text).map(PgValue::Bytea),
            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text.to_owned())),
            Oid::TIMESTAMP => NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                .map(|ts| PgValue::Timestamp(ts.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS))
                .map_err(|e| bad("TIMESTAMP", &e)),
            Oid::DATE => NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .map(|d| PgValue::Date(d.num_days_from_ce() - PG_EPOCH_DAYS_FROM_CE))
                .map_err(|e| bad("DATE", &e)),
            // Everything else, text types included, stays as text
            _ => Ok(PgValue::Text(text.to_owned())),
        }
    }
}

/// Decode bytea's `\x` hex output format.
fn decode_bytea_hex(text: &str) -> PgResult<Vec<u8>> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| PgError::Type("bytea text value is not in hex format".to_string()))?;
    if hex.len() % 2 != 0 {
        return Err(PgError::Type("odd-length bytea hex value".to_string()));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| PgError::Type(format!("invalid bytea hex digit in {:?}", text)))
        })
        .collect()
}

// ============================================================================
// Conversions into parameters
// ============================================================================

macro_rules! impl_from_value {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for PgValue {
                fn from(v: $ty) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
}

impl From<uuid::Uuid> for PgValue {
    fn from(v: uuid::Uuid) -> Self {
        PgValue::Uuid(*v.as_bytes())
    }
}

impl From<NaiveDateTime> for PgValue {
    fn from(v: NaiveDateTime) -> Self {
        PgValue::Timestamp(v.and_utc().timestamp_micros() - PG_EPOCH_OFFSET_MICROS)
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v.to_string())
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}
