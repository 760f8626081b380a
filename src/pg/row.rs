//! Result rows and the decoding traits that map column values to Rust types.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use smallvec::SmallVec;

use super::error::{PgError, PgResult};
use super::statement::SharedColumns;
use super::types::{PgValue, PG_EPOCH_DAYS_FROM_CE, PG_EPOCH_OFFSET_MICROS};

/// Inline capacity of a row before it spills to the heap.
const INLINE_COLUMNS: usize = 8;

// ============================================================================
// Row
// ============================================================================

/// One result row: decoded values plus the shared column descriptions.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: SmallVec<[PgValue; INLINE_COLUMNS]>,
}

impl Row {
    pub(crate) fn new(columns: SharedColumns, values: SmallVec<[PgValue; INLINE_COLUMNS]>) -> Self {
        Self { columns, values }
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Column descriptions.
    pub fn columns(&self) -> &SharedColumns {
        &self.columns
    }

    /// Raw values in column order.
    pub fn values(&self) -> &[PgValue] {
        &self.values
    }

    /// Raw value at `idx`.
    pub fn value(&self, idx: usize) -> Option<&PgValue> {
        self.values.get(idx)
    }

    /// Decode column `idx` as `T`.
    pub fn get<T: FromValue>(&self, idx: usize) -> PgResult<T> {
        let value = self.values.get(idx).ok_or_else(|| {
            PgError::Type(format!(
                "column index {} out of range for row of {} columns",
                idx,
                self.values.len()
            ))
        })?;
        T::from_value(value)
    }

    /// Decode the column called `name` as `T`.
    pub fn get_named<T: FromValue>(&self, name: &str) -> PgResult<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| PgError::Type(format!("no column named {:?}", name)))?;
        self.get(idx)
    }

    /// Decode the whole row.
    pub fn decode<T: FromRow>(&self) -> PgResult<T> {
        T::from_row(self)
    }
}

// ============================================================================
// Query Result
// ============================================================================

/// Result of one statement.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Column descriptions, shared with every row
    pub columns: SharedColumns,
    /// Row data
    pub rows: Vec<Row>,
    /// Command tag (e.g., "SELECT 5", "INSERT 0 1", "COPY 4")
    pub command_tag: String,
}

impl QueryResult {
    pub(crate) fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    /// Rows affected according to the command tag; 0 for tags without a count.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }

    /// Exactly one row, or `NoRows` / `MultipleRows`.
    pub fn into_one(self) -> PgResult<Row> {
        let mut rows = self.rows.into_iter();
        match (rows.next(), rows.next()) {
            (Some(row), None) => Ok(row),
            (None, _) => Err(PgError::NoRows),
            (Some(_), Some(_)) => Err(PgError::MultipleRows),
        }
    }

    /// Decode every row as `T`.
    pub fn decode<T: FromRow>(&self) -> PgResult<Vec<T>> {
        self.rows.iter().map(T::from_row).collect()
    }
}

/// Parse the row count out of a command tag.
///
/// `INSERT oid rows` carries the count third; `SELECT n`, `UPDATE n`,
/// `DELETE n`, `COPY n`, `MOVE n`, `FETCH n` and `MERGE n` carry it second.
pub fn parse_rows_affected(tag: &str) -> u64 {
    let mut parts = tag.split_whitespace();
    let count = match parts.next() {
        Some("INSERT") => parts.nth(1),
        Some("SELECT" | "UPDATE" | "DELETE" | "COPY" | "MOVE" | "FETCH" | "MERGE") => parts.next(),
        _ => None,
    };
    count.and_then(|n| n.parse().ok()).unwrap_or(0)
}

// ============================================================================
// FromValue
// ============================================================================

/// Conversion from one column value.
pub trait FromValue: Sized {
    fn from_value(value: &PgValue) -> PgResult<Self>;
}

fn mismatch<T>(value: &PgValue, target: &str) -> PgResult<T> {
    match value {
        PgValue::Null => Err(PgError::Type(format!(
            "unexpected NULL decoding {}; use Option<{}>",
            target, target
        ))),
        other => Err(PgError::Type(format!("cannot decode {:?} as {}", other, target))),
    }
}

macro_rules! impl_from_value_int {
    ($($ty:ty),*) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &PgValue) -> PgResult<Self> {
                    let wide: i64 = match value {
                        PgValue::Int2(v) => i64::from(*v),
                        PgValue::Int4(v) => i64::from(*v),
                        PgValue::Int8(v) => *v,
                        PgValue::Text(s) => s.trim().parse().map_err(|_| {
                            PgError::Type(format!("cannot parse {:?} as {}", s, stringify!($ty)))
                        })?,
                        other => return mismatch(other, stringify!($ty)),
                    };
                    <$ty>::try_from(wide).map_err(|_| {
                        PgError::Type(format!("{} out of range for {}", wide, stringify!($ty)))
                    })
                }
            }
        )*
    };
}

impl_from_value_int!(i16, i32, i64);

impl FromValue for f64 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Float4(v) => Ok(f64::from(*v)),
            PgValue::Float8(v) => Ok(*v),
            PgValue::Int2(v) => Ok(f64::from(*v)),
            PgValue::Int4(v) => Ok(f64::from(*v)),
            // NUMERIC arrives as text
            PgValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| PgError::Type(format!("cannot parse {:?} as f64", s))),
            other => mismatch(other, "f64"),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Float4(v) => Ok(*v),
            other => mismatch(other, "f32"),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Bool(v) => Ok(*v),
            other => mismatch(other, "bool"),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Text(s) | PgValue::Json(s) => Ok(s.clone()),
            other => mismatch(other, "String"),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Bytea(b) => Ok(b.clone()),
            PgValue::Raw { data, .. } => Ok(data.clone()),
            other => mismatch(other, "Vec<u8>"),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Uuid(b) => Ok(uuid::Uuid::from_bytes(*b)),
            other => mismatch(other, "Uuid"),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Timestamp(micros) => micros
                .checked_add(PG_EPOCH_OFFSET_MICROS)
                .and_then(DateTime::<Utc>::from_timestamp_micros)
                .ok_or_else(|| PgError::Type(format!("timestamp {} out of range", micros))),
            other => mismatch(other, "DateTime<Utc>"),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        DateTime::<Utc>::from_value(value).map(|ts| ts.naive_utc())
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Date(days) => days
                .checked_add(PG_EPOCH_DAYS_FROM_CE)
                .and_then(NaiveDate::from_num_days_from_ce_opt)
                .ok_or_else(|| PgError::Type(format!("date {} out of range", days))),
            other => mismatch(other, "NaiveDate"),
        }
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Json(s) | PgValue::Text(s) => {
                serde_json::from_str(s).map_err(|e| PgError::Type(format!("invalid JSON: {}", e)))
            }
            other => mismatch(other, "serde_json::Value"),
        }
    }
}

impl FromValue for PgValue {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &PgValue) -> PgResult<Self> {
        match value {
            PgValue::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ============================================================================
// FromRow
// ============================================================================

/// Conversion from a whole row. Implement this to map rows onto your own types.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> PgResult<Self>;
}

impl FromRow for Row {
    fn from_row(row: &Row) -> PgResult<Self> {
        Ok(row.clone())
    }
}

macro_rules! impl_from_row_tuple {
    ($len:expr => $($idx:tt $ty:ident),+) => {
        impl<$($ty: FromValue),+> FromRow for ($($ty,)+) {
            fn from_row(row: &Row) -> PgResult<Self> {
                if row.len() != $len {
                    return Err(PgError::Type(format!(
                        "expected {} columns, row has {}",
                        $len,
                        row.len()
                    )));
                }
                Ok(($(row.get::<$ty>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1 => 0 A);
impl_from_row_tuple!(2 => 0 A, 1 B);
impl_from_row_tuple!(3 => 0 A, 1 B, 2 C);
impl_from_row_tuple!(4 => 0 A, 1 B, 2 C, 3 D);
impl_from_row_tuple!(5 => 0 A, 1 B, 2 C, 3 D, 4 E);
impl_from_row_tuple!(6 => 0 A, 1 B, 2 C, 3 D, 4 E, 5 F);
