//! Model schema: column definitions and type casting

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::AttributeValue;

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.9fZ";
pub(crate) const DATE_FORMAT: &str = "%Y-%m-%d";
pub(crate) const TIME_FORMAT: &str = "%H:%M:%S%.9f";

/// Declared type of a model column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    Integer,
    Float,
    Decimal,
    String,
    Timestamp,
    Date,
    Time,
    /// Structured column with its own storage-level coder
    Json,
    /// Ordered list of values of one element type
    Array(Box<ColumnType>),
    /// Enumerated column; live values are labels, ordinals index into the list
    Enum(Vec<String>),
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "boolean"),
            Self::Integer => write!(f, "integer"),
            Self::Float => write!(f, "float"),
            Self::Decimal => write!(f, "decimal"),
            Self::String => write!(f, "string"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Date => write!(f, "date"),
            Self::Time => write!(f, "time"),
            Self::Json => write!(f, "json"),
            Self::Array(inner) => write!(f, "{}[]", inner),
            Self::Enum(_) => write!(f, "enum"),
        }
    }
}

/// A value that cannot be coerced into a column type
#[derive(Debug, Clone, PartialEq)]
pub struct CastError {
    pub expected: ColumnType,
    pub found: &'static str,
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot cast {} value to {}", self.found, self.expected)
    }
}

impl std::error::Error for CastError {}

impl ColumnType {
    pub fn array_of(element: ColumnType) -> Self {
        Self::Array(Box::new(element))
    }

    pub fn enumeration<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Enum(labels.into_iter().map(Into::into).collect())
    }

    /// Coerce a value into this column type.
    ///
    /// Used when reifying against a schema that may have evolved since the
    /// snapshot was taken.
    pub fn cast(&self, value: AttributeValue) -> Result<AttributeValue, CastError> {
        use AttributeValue as V;

        if value.is_null() {
            return Ok(V::Null);
        }

        let found = value.kind();
        let fail = || CastError {
            expected: self.clone(),
            found,
        };

        match (self, value) {
            (Self::Boolean, V::Boolean(b)) => Ok(V::Boolean(b)),
            (Self::Boolean, V::Integer(0)) => Ok(V::Boolean(false)),
            (Self::Boolean, V::Integer(1)) => Ok(V::Boolean(true)),
            (Self::Boolean, V::String(s)) => parse_boolean(&s).map(V::Boolean).ok_or_else(fail),

            (Self::Integer, V::Integer(i)) => Ok(V::Integer(i)),
            (Self::Integer, V::Boolean(b)) => Ok(V::Integer(b as i64)),
            (Self::Integer, V::Float(f)) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(V::Integer(f as i64))
            }
            (Self::Integer, V::String(s) | V::Decimal(s)) => {
                s.trim().parse().map(V::Integer).map_err(|_| fail())
            }

            (Self::Float, V::Float(f)) => Ok(V::Float(f)),
            (Self::Float, V::Integer(i)) => Ok(V::Float(i as f64)),
            (Self::Float, V::String(s) | V::Decimal(s)) => {
                parse_float(&s).map(V::Float).ok_or_else(fail)
            }

            (Self::Decimal, V::Decimal(s)) => Ok(V::Decimal(s)),
            (Self::Decimal, V::Integer(i)) => Ok(V::Decimal(i.to_string())),
            (Self::Decimal, V::Float(f)) if f.is_finite() => Ok(V::Decimal(f.to_string())),
            (Self::Decimal, V::String(s)) if is_decimal(s.trim()) => {
                Ok(V::Decimal(s.trim().to_string()))
            }

            (Self::String, V::String(s) | V::Decimal(s)) => Ok(V::String(s)),
            (Self::String, V::Integer(i)) => Ok(V::String(i.to_string())),
            (Self::String, V::Float(f)) => Ok(V::String(f.to_string())),
            (Self::String, V::Boolean(b)) => Ok(V::String(b.to_string())),
            (Self::String, V::Timestamp(t)) => Ok(V::String(t.format(TIMESTAMP_FORMAT).to_string())),
            (Self::String, V::Date(d)) => Ok(V::String(d.format(DATE_FORMAT).to_string())),
            (Self::String, V::Time(t)) => Ok(V::String(t.format(TIME_FORMAT).to_string())),
            (Self::String, V::Json(j)) => Ok(V::String(j.to_string())),

            (Self::Timestamp, V::Timestamp(t)) => Ok(V::Timestamp(t)),
            (Self::Timestamp, V::Date(d)) => Ok(V::Timestamp(
                Utc.from_utc_datetime(&d.and_time(NaiveTime::MIN)),
            )),
            (Self::Timestamp, V::String(s)) => parse_timestamp(&s).map(V::Timestamp).ok_or_else(fail),

            (Self::Date, V::Date(d)) => Ok(V::Date(d)),
            (Self::Date, V::Timestamp(t)) => Ok(V::Date(t.date_naive())),
            (Self::Date, V::String(s)) => parse_date(&s).map(V::Date).ok_or_else(fail),

            (Self::Time, V::Time(t)) => Ok(V::Time(t)),
            (Self::Time, V::Timestamp(t)) => Ok(V::Time(t.time())),
            (Self::Time, V::String(s)) => parse_time(&s).map(V::Time).ok_or_else(fail),

            (Self::Json, V::Json(j)) => Ok(V::Json(j)),
            // Text that the codec did not read as a document stays text
            (Self::Json, V::String(s)) => Ok(V::String(s)),
            (Self::Json, other) => Ok(V::Json(crate::codec::plain_json(&other))),

            (Self::Array(element), V::Array(items)) => items
                .into_iter()
                .map(|item| element.cast(item))
                .collect::<Result<Vec<_>, _>>()
                .map(V::Array),

            (Self::Enum(labels), V::String(s)) if labels.contains(&s) => Ok(V::String(s)),
            (Self::Enum(labels), V::Integer(i)) => usize::try_from(i)
                .ok()
                .and_then(|index| labels.get(index))
                .map(|label| V::String(label.clone()))
                .ok_or_else(fail),

            _ => Err(fail()),
        }
    }
}

/// A column of a model schema
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub default: AttributeValue,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            default: AttributeValue::Null,
        }
    }
}

/// Ordered column definitions of a model as it exists now
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    primary_key: String,
    columns: Vec<Column>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::new()
    }
}

impl Schema {
    /// Empty schema with an `id` primary key
    pub fn new() -> Self {
        Self {
            primary_key: "id".to_string(),
            columns: Vec::new(),
        }
    }

    pub fn with_primary_key(mut self, name: impl Into<String>) -> Self {
        self.primary_key = name.into();
        self
    }

    /// Append a column
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.push(Column::new(name, column_type));
        self
    }

    /// Append a column with a declared default
    pub fn column_with_default(
        mut self,
        name: impl Into<String>,
        column_type: ColumnType,
        default: impl Into<AttributeValue>,
    ) -> Self {
        let mut column = Column::new(name, column_type);
        column.default = default.into();
        self.columns.push(column);
        self
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn get(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn column_type(&self, name: &str) -> Option<&ColumnType> {
        self.get(name).map(|c| &c.column_type)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

pub(crate) fn parse_boolean(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "t" | "true" | "1" | "y" | "yes" => Some(true),
        "f" | "false" | "0" | "n" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_float(s: &str) -> Option<f64> {
    match s.trim() {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}

pub(crate) fn is_decimal(s: &str) -> bool {
    let digits = s.strip_prefix(['-', '+']).unwrap_or(s);
    let mut parts = digits.splitn(2, '.');
    let whole = parts.next().unwrap_or_default();
    let fraction = parts.next();
    let all_digits = |p: &str| p.chars().all(|c| c.is_ascii_digit());
    match fraction {
        Some(f) => !(whole.is_empty() && f.is_empty()) && all_digits(whole) && all_digits(f),
        None => !whole.is_empty() && all_digits(whole),
    }
}

/// Parse the timestamp spellings found in stored snapshots: RFC 3339, the
/// older `YYYY-MM-DD HH:MM:SS[.f] UTC` form, and naive datetimes taken as UTC.
pub(crate) fn parse_timestamp(s: &str) -> Option<chrono::DateTime<Utc>> {
    let s = s.trim();
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    let naive = s.strip_suffix(" UTC").unwrap_or(s);
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(t) = NaiveDateTime::parse_from_str(naive, format) {
            return Some(Utc.from_utc_datetime(&t));
        }
    }
    if let Ok(t) = chrono::DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f %z") {
        return Some(t.with_timezone(&Utc));
    }
    None
}

pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .ok()
        .or_else(|| parse_timestamp(s).map(|t| t.date_naive()))
}

/// Times were once stored attached to a dummy date; accept both forms.
pub(crate) fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f")
        .ok()
        .or_else(|| NaiveTime::parse_from_str(s.trim(), "%H:%M").ok())
        .or_else(|| parse_timestamp(s).map(|t| t.time()))
}
