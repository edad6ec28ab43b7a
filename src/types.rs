//! Core value and type definitions for stored routines
//!
//! Values flowing through routine variables, declared field types with their
//! store-time coercion rules, SQL mode flags, and routine naming.

use std::cmp::Ordering;
use std::fmt;

use bitflags::bitflags;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

use crate::error::{Error, ErrorCode, Result};

// ============================================================================
// Routine Naming
// ============================================================================

/// Stored routine kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutineKind {
    Procedure,
    Function,
}

impl fmt::Display for RoutineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoutineKind::Procedure => write!(f, "PROCEDURE"),
            RoutineKind::Function => write!(f, "FUNCTION"),
        }
    }
}

/// Schema-qualified routine name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    pub db: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(db: impl Into<String>, name: impl Into<String>) -> Self {
        QualifiedName {
            db: db.into(),
            name: name.into(),
        }
    }

    /// Case-folded form used for cache keys and catalog lookups
    pub fn normalized(&self) -> QualifiedName {
        QualifiedName {
            db: self.db.to_lowercase(),
            name: self.name.to_lowercase(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.name)
    }
}

// ============================================================================
// SQL Mode
// ============================================================================

bitflags! {
    /// SQL mode flags captured when a routine is defined
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SqlMode: u32 {
        const STRICT_TRANS_TABLES = 0x0001;
        const STRICT_ALL_TABLES = 0x0002;
        const ERROR_FOR_DIVISION_BY_ZERO = 0x0004;
        const NO_ZERO_DATE = 0x0008;
        const PIPES_AS_CONCAT = 0x0010;
        const ANSI_QUOTES = 0x0020;
    }
}

impl SqlMode {
    /// Strict modes turn lossy stores into errors
    pub fn is_strict(&self) -> bool {
        self.intersects(SqlMode::STRICT_TRANS_TABLES | SqlMode::STRICT_ALL_TABLES)
    }
}

impl Default for SqlMode {
    fn default() -> Self {
        SqlMode::STRICT_TRANS_TABLES | SqlMode::ERROR_FOR_DIVISION_BY_ZERO | SqlMode::NO_ZERO_DATE
    }
}

// ============================================================================
// Value
// ============================================================================

/// Runtime value held by a routine variable, argument or return slot
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// NULL value
    #[default]
    Null,
    /// Signed integer
    Int(i64),
    /// Unsigned integer
    UInt(u64),
    /// Floating point (also carries DECIMAL values)
    Double(f64),
    /// Character string
    Text(String),
    /// Binary string
    Blob(Vec<u8>),
    /// DATE
    Date(NaiveDate),
    /// TIME
    Time(NaiveTime),
    /// DATETIME, no time zone
    DateTime(NaiveDateTime),
    /// TIMESTAMP, stored in UTC
    Timestamp(DateTime<Utc>),
}

impl Value {
    /// Check if value is NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the value's family, used in error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Int(_) => "integer",
            Value::UInt(_) => "unsigned integer",
            Value::Double(_) => "double",
            Value::Text(_) => "string",
            Value::Blob(_) => "binary",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::Timestamp(_) => "timestamp",
        }
    }

    /// Numeric view of the value, if it has one
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::UInt(u) => Some(*u as f64),
            Value::Double(f) => Some(*f),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Integer view of the value, if it is integral
    pub fn as_i128(&self) -> Option<i128> {
        match self {
            Value::Int(i) => Some(*i as i128),
            Value::UInt(u) => Some(*u as i128),
            Value::Double(f) if f.is_finite() => Some(f.round() as i128),
            Value::Text(s) => {
                let s = s.trim();
                s.parse::<i128>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i128))
            }
            _ => None,
        }
    }

    /// Truth value as seen by IF, WHILE and friends; NULL is false
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Double(f) => *f != 0.0,
            Value::Text(s) => s.trim().parse::<f64>().map(|f| f != 0.0).unwrap_or(false),
            Value::Blob(b) => !b.is_empty(),
            _ => true,
        }
    }

    /// Text rendering without quoting
    pub fn to_text(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
            other => other.to_string(),
        }
    }

    /// SQL comparison; `None` when either side is NULL or the two are incomparable
    pub fn sql_cmp(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Null, _) | (_, Null) => None,
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Blob(a), Blob(b)) => Some(a.cmp(b)),
            (Date(a), Date(b)) => Some(a.cmp(b)),
            (Time(a), Time(b)) => Some(a.cmp(b)),
            (DateTime(a), DateTime(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Int(_) | UInt(_), Int(_) | UInt(_)) => Some(self.as_i128()?.cmp(&other.as_i128()?)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => Some(a.to_text().cmp(&b.to_text())),
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Double(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "{}", s),
            Value::Blob(b) => write!(f, "X'{}'", hex::encode_upper(b)),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S")),
            Value::Timestamp(ts) => write!(f, "{}", ts.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl<T> From<Option<T>> for Value
where
    T: Into<Value>,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Value::Null,
        }
    }
}

// ============================================================================
// Declared Types
// ============================================================================

/// Declared SQL type of a variable, parameter or return value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Decimal,
    Float,
    Double,
    Char,
    VarChar,
    Text,
    Blob,
    Date,
    Time,
    DateTime,
    Timestamp,
}

impl SqlType {
    /// Wire type code (column type numbering of the client protocol)
    pub fn code(&self) -> u32 {
        match self {
            SqlType::TinyInt => 1,
            SqlType::SmallInt => 2,
            SqlType::Int => 3,
            SqlType::Float => 4,
            SqlType::Double => 5,
            SqlType::Timestamp => 7,
            SqlType::BigInt => 8,
            SqlType::Date => 10,
            SqlType::Time => 11,
            SqlType::DateTime => 12,
            SqlType::VarChar => 15,
            SqlType::Decimal => 246,
            SqlType::Blob | SqlType::Text => 252,
            SqlType::Char => 254,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SqlType::TinyInt => "TINYINT",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Int => "INT",
            SqlType::BigInt => "BIGINT",
            SqlType::Decimal => "DECIMAL",
            SqlType::Float => "FLOAT",
            SqlType::Double => "DOUBLE",
            SqlType::Char => "CHAR",
            SqlType::VarChar => "VARCHAR",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::DateTime => "DATETIME",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            SqlType::TinyInt | SqlType::SmallInt | SqlType::Int | SqlType::BigInt
        )
    }

    pub fn is_string(&self) -> bool {
        matches!(self, SqlType::Char | SqlType::VarChar | SqlType::Text)
    }

    /// Fixed storage size in bytes for non-string types
    fn fixed_size(&self) -> u32 {
        match self {
            SqlType::TinyInt => 1,
            SqlType::SmallInt => 2,
            SqlType::Int | SqlType::Float => 4,
            SqlType::BigInt | SqlType::Double | SqlType::DateTime => 8,
            SqlType::Date | SqlType::Time => 3,
            SqlType::Timestamp => 4,
            SqlType::Decimal => 16,
            SqlType::Char | SqlType::VarChar | SqlType::Text | SqlType::Blob => 0,
        }
    }

    fn integer_range(&self, unsigned: bool) -> (i128, i128) {
        let bits = match self {
            SqlType::TinyInt => 8,
            SqlType::SmallInt => 16,
            SqlType::Int => 32,
            _ => 64,
        };
        if unsigned {
            (0, (1i128 << bits) - 1)
        } else {
            (-(1i128 << (bits - 1)), (1i128 << (bits - 1)) - 1)
        }
    }
}

impl fmt::Display for SqlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Declared field: type plus its attributes
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    pub sql_type: SqlType,
    pub unsigned: bool,
    pub nullable: bool,
    /// Character length for string types, display width otherwise
    pub length: Option<u32>,
    pub decimals: Option<u32>,
    pub charset: Option<String>,
}

/// Bytes per character of the default character set
const DEFAULT_MBMAXLEN: u32 = 4;

impl FieldDef {
    pub fn new(sql_type: SqlType) -> Self {
        FieldDef {
            sql_type,
            unsigned: false,
            nullable: true,
            length: None,
            decimals: None,
            charset: None,
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_decimals(mut self, decimals: u32) -> Self {
        self.decimals = Some(decimals);
        self
    }

    pub fn with_charset(mut self, charset: impl Into<String>) -> Self {
        self.charset = Some(charset.into());
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Character set name; binary for non-string types
    pub fn charset_name(&self) -> &str {
        match (&self.charset, self.sql_type.is_string()) {
            (Some(cs), true) => cs,
            (None, true) => "utf8mb4",
            _ => "binary",
        }
    }

    /// Maximum length in characters
    pub fn char_length(&self) -> u32 {
        match self.sql_type {
            SqlType::Char => self.length.unwrap_or(1),
            SqlType::VarChar => self.length.unwrap_or(255),
            SqlType::Text | SqlType::Blob => self.length.unwrap_or(65_535),
            t => self.length.unwrap_or(t.fixed_size()),
        }
    }

    /// Maximum length in bytes
    pub fn byte_length(&self) -> u32 {
        if self.sql_type.is_string() {
            self.char_length().saturating_mul(DEFAULT_MBMAXLEN)
        } else if self.sql_type == SqlType::Blob {
            self.char_length()
        } else {
            self.sql_type.fixed_size()
        }
    }

    /// Convert a value for storage in a field of this type
    ///
    /// In strict mode lossy conversions fail; otherwise they clamp or
    /// truncate the way a non-strict column store does.
    pub fn coerce(&self, value: Value, strict: bool) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        match self.sql_type {
            t if t.is_integer() => self.coerce_integer(value, strict),
            SqlType::Float | SqlType::Double => match value.as_f64() {
                Some(f) => Ok(Value::Double(f)),
                None => self.invalid(&value, strict, Value::Double(0.0)),
            },
            SqlType::Decimal => match value.as_f64() {
                Some(f) => {
                    let scale = 10f64.powi(self.decimals.unwrap_or(0) as i32);
                    Ok(Value::Double((f * scale).round() / scale))
                }
                None => self.invalid(&value, strict, Value::Double(0.0)),
            },
            SqlType::Char | SqlType::VarChar | SqlType::Text => {
                let text = value.to_text();
                let max = self.char_length() as usize;
                if text.chars().count() > max {
                    if strict {
                        return Err(Error::with_message(
                            ErrorCode::DataTooLong,
                            format!("Data too long for {}({})", self.sql_type, max),
                        ));
                    }
                    return Ok(Value::Text(text.chars().take(max).collect()));
                }
                Ok(Value::Text(text))
            }
            SqlType::Blob => match value {
                Value::Blob(b) => Ok(Value::Blob(b)),
                other => Ok(Value::Blob(other.to_text().into_bytes())),
            },
            SqlType::Date => match to_datetime(&value) {
                Some(dt) => Ok(Value::Date(dt.date())),
                None => self.invalid(&value, strict, Value::Null),
            },
            SqlType::Time => match to_time(&value) {
                Some(t) => Ok(Value::Time(t)),
                None => self.invalid(&value, strict, Value::Null),
            },
            SqlType::DateTime => match to_datetime(&value) {
                Some(dt) => Ok(Value::DateTime(dt)),
                None => self.invalid(&value, strict, Value::Null),
            },
            SqlType::Timestamp => match value {
                Value::Timestamp(ts) => Ok(Value::Timestamp(ts)),
                other => match to_datetime(&other) {
                    Some(dt) => Ok(Value::Timestamp(Utc.from_utc_datetime(&dt))),
                    None => self.invalid(&other, strict, Value::Null),
                },
            },
            _ => Ok(value),
        }
    }

    fn coerce_integer(&self, value: Value, strict: bool) -> Result<Value> {
        let Some(n) = value.as_i128() else {
            return self.invalid(&value, strict, Value::Int(0));
        };
        let (min, max) = self.sql_type.integer_range(self.unsigned);
        let clamped = if n < min {
            min
        } else if n > max {
            max
        } else {
            n
        };
        if clamped != n && strict {
            return Err(Error::with_message(
                ErrorCode::OutOfRange,
                format!("Out of range value {} for {}", n, self.sql_type),
            ));
        }
        if self.unsigned {
            Ok(Value::UInt(clamped as u64))
        } else {
            Ok(Value::Int(clamped as i64))
        }
    }

    fn invalid(&self, value: &Value, strict: bool, fallback: Value) -> Result<Value> {
        if strict {
            Err(Error::with_message(
                ErrorCode::InvalidValue,
                format!("Incorrect {} value: '{}'", self.sql_type, value),
            ))
        } else {
            Ok(fallback)
        }
    }
}

impl fmt::Display for FieldDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.sql_type)?;
        match (self.length, self.decimals) {
            (Some(l), Some(d)) => write!(f, "({},{})", l, d)?,
            (Some(l), None) => write!(f, "({})", l)?,
            _ => {}
        }
        if self.unsigned {
            write!(f, " UNSIGNED")?;
        }
        Ok(())
    }
}

// ============================================================================
// Temporal Conversion
// ============================================================================

const DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"];

fn to_datetime(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::DateTime(dt) => Some(*dt),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        Value::Timestamp(ts) => Some(ts.naive_utc()),
        Value::Text(s) => {
            let s = s.trim();
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                return Some(ts.naive_utc());
            }
            DATETIME_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .or_else(|| {
                    NaiveDate::parse_from_str(s, "%Y-%m-%d")
                        .ok()
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                })
        }
        _ => None,
    }
}

fn to_time(value: &Value) -> Option<NaiveTime> {
    match value {
        Value::Time(t) => Some(*t),
        Value::DateTime(dt) => Some(dt.time()),
        Value::Timestamp(ts) => Some(ts.naive_utc().time()),
        Value::Text(s) => {
            let s = s.trim();
            NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
                .ok()
                .or_else(|| to_datetime(value).map(|dt| dt.time()))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_coercion_strict() {
        let tiny = FieldDef::new(SqlType::TinyInt);
        assert_eq!(tiny.coerce(Value::Int(100), true).unwrap(), Value::Int(100));
        let err = tiny.coerce(Value::Int(300), true).unwrap_err();
        assert_eq!(err.code, ErrorCode::OutOfRange);
        assert_eq!(tiny.coerce(Value::Int(300), false).unwrap(), Value::Int(127));
    }

    #[test]
    fn test_unsigned_coercion() {
        let field = FieldDef::new(SqlType::Int).unsigned();
        assert_eq!(field.coerce(Value::Text("42".into()), true).unwrap(), Value::UInt(42));
        assert!(field.coerce(Value::Int(-1), true).is_err());
        assert_eq!(field.coerce(Value::Int(-1), false).unwrap(), Value::UInt(0));
    }

    #[test]
    fn test_string_truncation() {
        let field = FieldDef::new(SqlType::VarChar).with_length(3);
        assert_eq!(field.coerce(Value::Int(12), true).unwrap(), Value::Text("12".into()));
        assert_eq!(
            field.coerce(Value::Text("abcdef".into()), false).unwrap(),
            Value::Text("abc".into())
        );
        assert_eq!(
            field.coerce(Value::Text("abcdef".into()), true).unwrap_err().code,
            ErrorCode::DataTooLong
        );
    }

    #[test]
    fn test_invalid_integer_text() {
        let field = FieldDef::new(SqlType::Int);
        assert_eq!(
            field.coerce(Value::Text("abc".into()), true).unwrap_err().code,
            ErrorCode::InvalidValue
        );
        assert_eq!(field.coerce(Value::Text("abc".into()), false).unwrap(), Value::Int(0));
    }

    #[test]
    fn test_decimal_rounding() {
        let field = FieldDef::new(SqlType::Decimal).with_length(10).with_decimals(2);
        assert_eq!(field.coerce(Value::Double(1.23456), true).unwrap(), Value::Double(1.23));
    }

    #[test]
    fn test_temporal_coercion() {
        let date = FieldDef::new(SqlType::Date);
        let expected = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(
            date.coerce(Value::Text("2024-02-29 10:11:12".into()), true).unwrap(),
            Value::Date(expected)
        );
        let ts = FieldDef::new(SqlType::Timestamp);
        match ts.coerce(Value::Text("2024-02-29T10:00:00+02:00".into()), true).unwrap() {
            Value::Timestamp(t) => assert_eq!(t.format("%H").to_string(), "08"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(date.coerce(Value::Text("not a date".into()), true).is_err());
    }

    #[test]
    fn test_lengths_and_charset() {
        let field = FieldDef::new(SqlType::VarChar).with_length(10);
        assert_eq!(field.char_length(), 10);
        assert_eq!(field.byte_length(), 40);
        assert_eq!(field.charset_name(), "utf8mb4");
        assert_eq!(FieldDef::new(SqlType::BigInt).byte_length(), 8);
        assert_eq!(FieldDef::new(SqlType::BigInt).charset_name(), "binary");
    }

    #[test]
    fn test_sql_cmp_and_truth() {
        assert_eq!(Value::Int(1).sql_cmp(&Value::Double(1.5)), Some(Ordering::Less));
        assert_eq!(Value::Int(1).sql_cmp(&Value::Null), None);
        assert_eq!(Value::UInt(u64::MAX).sql_cmp(&Value::Int(-1)), Some(Ordering::Greater));
        assert!(!Value::Null.is_true());
        assert!(Value::Text("2".into()).is_true());
        assert!(!Value::Text("abc".into()).is_true());
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Blob(vec![0xde, 0xad]).to_string(), "X'DEAD'");
        assert_eq!(QualifiedName::new("Db", "F").normalized().to_string(), "db.f");
        assert_eq!(RoutineKind::Function.to_string(), "FUNCTION");
        assert!(SqlMode::default().is_strict());
    }
}
