use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};

use crate::error::{SnowflakeError, codes, sql_state};
use crate::{Error, Result};

/// Server-side logical type of a column, as reported in `rowtype`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogicalType {
    Fixed,
    Real,
    Text,
    Date,
    Variant,
    TimestampLtz,
    TimestampNtz,
    TimestampTz,
    Object,
    Array,
    Map,
    Binary,
    Time,
    Boolean,
    Other(String),
}

impl LogicalType {
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "fixed" => Self::Fixed,
            "real" => Self::Real,
            "text" => Self::Text,
            "date" => Self::Date,
            "variant" => Self::Variant,
            "timestamp_ltz" => Self::TimestampLtz,
            "timestamp_ntz" => Self::TimestampNtz,
            "timestamp_tz" => Self::TimestampTz,
            "object" => Self::Object,
            "array" => Self::Array,
            "map" => Self::Map,
            "binary" => Self::Binary,
            "time" => Self::Time,
            "boolean" => Self::Boolean,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Fixed => "fixed",
            Self::Real => "real",
            Self::Text => "text",
            Self::Date => "date",
            Self::Variant => "variant",
            Self::TimestampLtz => "timestamp_ltz",
            Self::TimestampNtz => "timestamp_ntz",
            Self::TimestampTz => "timestamp_tz",
            Self::Object => "object",
            Self::Array => "array",
            Self::Map => "map",
            Self::Binary => "binary",
            Self::Time => "time",
            Self::Boolean => "boolean",
            Self::Other(name) => name,
        }
    }

    pub fn is_timestamp(&self) -> bool {
        matches!(
            self,
            Self::TimestampLtz | Self::TimestampNtz | Self::TimestampTz
        )
    }
}

/// The Rust type a column decodes to most naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanType {
    Int64,
    Float64,
    Decimal,
    String,
    Bool,
    Bytes,
    Date,
    Time,
    Timestamp,
    TimestampWithOffset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeColumnType {
    pub snowflake_type: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub length: Option<i64>,
    pub precision: Option<i64>,
    pub scale: Option<i64>,
    pub fields: Vec<SnowflakeColumn>,
}

impl SnowflakeColumnType {
    pub fn new(snowflake_type: &str, nullable: bool) -> Self {
        Self {
            snowflake_type: snowflake_type.to_string(),
            logical_type: LogicalType::parse(snowflake_type),
            nullable,
            length: None,
            precision: None,
            scale: None,
            fields: Vec::new(),
        }
    }

    pub(crate) fn scale(&self) -> u32 {
        self.scale.unwrap_or(0).clamp(0, 38) as u32
    }

    pub fn scan_type(&self, high_precision: bool) -> ScanType {
        match self.logical_type {
            LogicalType::Fixed if high_precision => {
                if self.scale() == 0 && self.precision.unwrap_or(0) <= 18 {
                    ScanType::Int64
                } else {
                    ScanType::Decimal
                }
            }
            LogicalType::Fixed if self.scale() == 0 => ScanType::Int64,
            LogicalType::Fixed | LogicalType::Real => ScanType::Float64,
            LogicalType::Boolean => ScanType::Bool,
            LogicalType::Binary => ScanType::Bytes,
            LogicalType::Date => ScanType::Date,
            LogicalType::Time => ScanType::Time,
            LogicalType::TimestampNtz => ScanType::Timestamp,
            LogicalType::TimestampLtz | LogicalType::TimestampTz => ScanType::TimestampWithOffset,
            _ => ScanType::String,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnowflakeColumn {
    pub name: String,
    pub index: usize,
    pub column_type: SnowflakeColumnType,
}

/// Column metadata shared by every row of a result set.
#[derive(Debug)]
pub(crate) struct RowSchema {
    pub(crate) columns: Vec<SnowflakeColumn>,
    names: HashMap<String, usize>,
    pub(crate) time_offset: FixedOffset,
    pub(crate) high_precision: bool,
}

impl RowSchema {
    pub(crate) fn new(
        columns: Vec<SnowflakeColumn>,
        time_offset: FixedOffset,
        high_precision: bool,
    ) -> Self {
        let mut names = HashMap::with_capacity(columns.len() * 2);
        for column in &columns {
            names.entry(column.name.clone()).or_insert(column.index);
            names
                .entry(column.name.to_ascii_uppercase())
                .or_insert(column.index);
        }
        Self {
            columns,
            names,
            time_offset,
            high_precision,
        }
    }

    pub(crate) fn index_of(&self, name: &str) -> Option<usize> {
        self.names
            .get(name)
            .or_else(|| self.names.get(&name.to_ascii_uppercase()))
            .copied()
    }

    pub(crate) fn column(&self, index: usize) -> Result<&SnowflakeColumn> {
        self.columns
            .get(index)
            .ok_or_else(|| column_index_out_of_range(index, self.columns.len()))
    }
}

pub(crate) fn column_index_out_of_range(index: usize, len: usize) -> Error {
    SnowflakeError::new(
        codes::COLUMN_INDEX_OUT_OF_RANGE,
        sql_state::GENERAL_ERROR,
        "column index {} is out of range for {} columns",
    )
    .with_args([index, len])
    .into()
}

/// An exact decimal: `mantissa * 10^-scale`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnowflakeDecimal {
    mantissa: i128,
    scale: u32,
}

impl SnowflakeDecimal {
    pub fn new(mantissa: i128, scale: u32) -> Self {
        Self { mantissa, scale }
    }

    pub fn mantissa(&self) -> i128 {
        self.mantissa
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn to_f64(&self) -> f64 {
        self.mantissa as f64 / 10f64.powi(self.scale as i32)
    }

    /// The integral value, when there is no fractional part and it fits.
    pub fn to_i64(&self) -> Option<i64> {
        let divisor = 10i128.checked_pow(self.scale)?;
        if self.mantissa % divisor != 0 {
            return None;
        }
        i64::try_from(self.mantissa / divisor).ok()
    }
}

impl FromStr for SnowflakeDecimal {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::Decode(format!("'{s}' is not a decimal"));
        let (negative, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }
        if !int_part.bytes().chain(frac_part.bytes()).all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let joined = format!("{int_part}{frac_part}");
        let magnitude: i128 = joined.parse().map_err(|_| invalid())?;
        Ok(Self {
            mantissa: if negative { -magnitude } else { magnitude },
            scale: frac_part.len() as u32,
        })
    }
}

impl fmt::Display for SnowflakeDecimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.mantissa);
        }
        let sign = if self.mantissa < 0 { "-" } else { "" };
        let digits = format!(
            "{:0width$}",
            self.mantissa.unsigned_abs(),
            width = self.scale as usize + 1
        );
        let (int_part, frac_part) = digits.split_at(digits.len() - self.scale as usize);
        write!(f, "{sign}{int_part}.{frac_part}")
    }
}

/// A decoded cell.
#[derive(Debug, Clone, PartialEq)]
pub enum SnowflakeValue {
    Null,
    Text(String),
    Integer(i64),
    Decimal(SnowflakeDecimal),
    Float(f64),
    Boolean(bool),
    Binary(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    TimestampNtz(NaiveDateTime),
    TimestampLtz(DateTime<FixedOffset>),
    TimestampTz(DateTime<FixedOffset>),
}

impl SnowflakeValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl fmt::Display for SnowflakeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Text(v) => write!(f, "{v}"),
            Self::Integer(v) => write!(f, "{v}"),
            Self::Decimal(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            Self::Binary(v) => write!(f, "{}", encode_hex(v)),
            Self::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            Self::Time(v) => write!(f, "{}", v.format("%H:%M:%S%.f")),
            Self::TimestampNtz(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::TimestampLtz(v) | Self::TimestampTz(v) => {
                write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f %:z"))
            }
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RowCells {
    /// Text cells from JSON results, converted on access.
    Json(Vec<Option<String>>),
    Native(Vec<SnowflakeValue>),
}

#[derive(Debug, Clone)]
pub struct SnowflakeRow {
    pub(crate) cells: RowCells,
    pub(crate) schema: Arc<RowSchema>,
}

impl SnowflakeRow {
    pub(crate) fn json(cells: Vec<Option<String>>, schema: Arc<RowSchema>) -> Self {
        Self {
            cells: RowCells::Json(cells),
            schema,
        }
    }

    pub(crate) fn native(values: Vec<SnowflakeValue>, schema: Arc<RowSchema>) -> Self {
        Self {
            cells: RowCells::Native(values),
            schema,
        }
    }

    pub fn get<T: SnowflakeDecode>(&self, column_name: &str) -> Result<T> {
        let index = self
            .schema
            .index_of(column_name)
            .ok_or_else(|| Error::Decode(format!("column not found: {column_name}")))?;
        self.get_at(index)
    }

    pub fn get_at<T: SnowflakeDecode>(&self, index: usize) -> Result<T> {
        let column = self.schema.column(index)?;
        match &self.cells {
            RowCells::Json(cells) => {
                let cell = cells
                    .get(index)
                    .ok_or_else(|| column_index_out_of_range(index, cells.len()))?;
                if let Some(raw) = cell {
                    if let Some(decoded) = T::try_decode_text(raw, &column.column_type) {
                        return decoded;
                    }
                }
                T::try_decode(&json_cell(cell.as_deref(), &column.column_type, &self.schema)?)
            }
            RowCells::Native(values) => {
                let value = values
                    .get(index)
                    .ok_or_else(|| column_index_out_of_range(index, values.len()))?;
                T::try_decode(value)
            }
        }
    }

    pub fn value(&self, index: usize) -> Result<SnowflakeValue> {
        self.get_at(index)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.schema
            .columns
            .iter()
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn column_types(&self) -> &[SnowflakeColumn] {
        &self.schema.columns
    }

    pub fn len(&self) -> usize {
        match &self.cells {
            RowCells::Json(cells) => cells.len(),
            RowCells::Native(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Conversion from a cell into a Rust value.
pub trait SnowflakeDecode: Sized {
    fn try_decode(value: &SnowflakeValue) -> Result<Self>;

    /// Shortcut for text-encoded cells; `None` falls back to [`SnowflakeDecode::try_decode`].
    fn try_decode_text(_raw: &str, _column: &SnowflakeColumnType) -> Option<Result<Self>> {
        None
    }
}

fn type_error<T>(value: &SnowflakeValue, target: &str) -> Result<T> {
    match value {
        SnowflakeValue::Null => Err(Error::Decode("value is null".into())),
        other => Err(Error::Decode(format!("'{other}' is not {target}"))),
    }
}

impl SnowflakeDecode for SnowflakeValue {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        Ok(value.clone())
    }
}

impl SnowflakeDecode for i64 {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Integer(v) => Ok(*v),
            SnowflakeValue::Decimal(d) => match d.to_i64() {
                Some(v) => Ok(v),
                None => type_error(value, "i64"),
            },
            SnowflakeValue::Float(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                Ok(*f as i64)
            }
            SnowflakeValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::Decode(format!("'{s}' is not i64"))),
            _ => type_error(value, "i64"),
        }
    }
}

impl SnowflakeDecode for i32 {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        let v = i64::try_decode(value)?;
        i32::try_from(v).map_err(|_| Error::Decode(format!("'{v}' is not i32")))
    }
}

impl SnowflakeDecode for u64 {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        let v = i64::try_decode(value)?;
        u64::try_from(v).map_err(|_| Error::Decode(format!("'{v}' is not u64")))
    }
}

impl SnowflakeDecode for f64 {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Float(v) => Ok(*v),
            SnowflakeValue::Integer(v) => Ok(*v as f64),
            SnowflakeValue::Decimal(d) => Ok(d.to_f64()),
            SnowflakeValue::Text(s) => s
                .trim()
                .parse()
                .map_err(|_| Error::Decode(format!("'{s}' is not f64"))),
            _ => type_error(value, "f64"),
        }
    }
}

impl SnowflakeDecode for SnowflakeDecimal {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Decimal(d) => Ok(*d),
            SnowflakeValue::Integer(v) => Ok(SnowflakeDecimal::new(*v as i128, 0)),
            SnowflakeValue::Text(s) => s.trim().parse(),
            _ => type_error(value, "decimal"),
        }
    }

    fn try_decode_text(raw: &str, column: &SnowflakeColumnType) -> Option<Result<Self>> {
        (column.logical_type == LogicalType::Fixed).then(|| raw.parse())
    }
}

impl SnowflakeDecode for String {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Null => type_error(value, "string"),
            SnowflakeValue::Text(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        }
    }

    fn try_decode_text(raw: &str, column: &SnowflakeColumnType) -> Option<Result<Self>> {
        match column.logical_type {
            LogicalType::Date
            | LogicalType::Time
            | LogicalType::TimestampLtz
            | LogicalType::TimestampNtz
            | LogicalType::TimestampTz => None,
            _ => Some(Ok(raw.to_string())),
        }
    }
}

impl SnowflakeDecode for bool {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Boolean(v) => Ok(*v),
            SnowflakeValue::Integer(v) => Ok(*v != 0),
            SnowflakeValue::Text(s) => parse_bool(s),
            _ => type_error(value, "bool"),
        }
    }
}

impl SnowflakeDecode for Vec<u8> {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Binary(v) => Ok(v.clone()),
            SnowflakeValue::Text(s) => Ok(s.as_bytes().to_vec()),
            _ => type_error(value, "bytes"),
        }
    }
}

impl SnowflakeDecode for NaiveDate {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Date(v) => Ok(*v),
            SnowflakeValue::TimestampNtz(v) => Ok(v.date()),
            SnowflakeValue::TimestampLtz(v) | SnowflakeValue::TimestampTz(v) => {
                Ok(v.naive_local().date())
            }
            SnowflakeValue::Text(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| Error::Decode(format!("'{s}' is not a date"))),
            _ => type_error(value, "a date"),
        }
    }
}

impl SnowflakeDecode for NaiveTime {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Time(v) => Ok(*v),
            SnowflakeValue::Text(s) => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map_err(|_| Error::Decode(format!("'{s}' is not a time"))),
            _ => type_error(value, "a time"),
        }
    }
}

impl SnowflakeDecode for NaiveDateTime {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::TimestampNtz(v) => Ok(*v),
            // wall-clock time in the value's own offset
            SnowflakeValue::TimestampLtz(v) | SnowflakeValue::TimestampTz(v) => {
                Ok(v.naive_local())
            }
            SnowflakeValue::Date(v) => Ok(v.and_time(NaiveTime::default())),
            SnowflakeValue::Text(s) => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| Error::Decode(format!("'{s}' is not datetime"))),
            _ => type_error(value, "datetime"),
        }
    }
}

impl SnowflakeDecode for DateTime<FixedOffset> {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::TimestampLtz(v) | SnowflakeValue::TimestampTz(v) => Ok(*v),
            SnowflakeValue::TimestampNtz(v) => Ok(v.and_utc().fixed_offset()),
            SnowflakeValue::Text(s) => DateTime::parse_from_rfc3339(s)
                .map_err(|_| Error::Decode(format!("'{s}' is not datetime"))),
            _ => type_error(value, "datetime"),
        }
    }
}

impl SnowflakeDecode for DateTime<Utc> {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        DateTime::<FixedOffset>::try_decode(value).map(|v| v.to_utc())
    }
}

impl SnowflakeDecode for serde_json::Value {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Null => type_error(value, "json"),
            SnowflakeValue::Text(s) => {
                serde_json::from_str(s).map_err(|_| Error::Decode(format!("'{s}' is not json")))
            }
            SnowflakeValue::Integer(v) => Ok(serde_json::json!(v)),
            SnowflakeValue::Float(v) => Ok(serde_json::json!(v)),
            SnowflakeValue::Boolean(v) => Ok(serde_json::json!(v)),
            other => Ok(serde_json::Value::String(other.to_string())),
        }
    }
}

impl SnowflakeDecode for uuid::Uuid {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        match value {
            SnowflakeValue::Text(s) => uuid::Uuid::parse_str(s)
                .map_err(|_| Error::Decode(format!("'{s}' is not uuid"))),
            _ => type_error(value, "uuid"),
        }
    }
}

impl<T: SnowflakeDecode> SnowflakeDecode for Option<T> {
    fn try_decode(value: &SnowflakeValue) -> Result<Self> {
        if value.is_null() {
            return Ok(None);
        }
        T::try_decode(value).map(Some)
    }

    fn try_decode_text(raw: &str, column: &SnowflakeColumnType) -> Option<Result<Self>> {
        T::try_decode_text(raw, column).map(|r| r.map(Some))
    }
}

fn parse_bool(s: &str) -> Result<bool> {
    if let Ok(v) = s.parse::<u16>() {
        return Ok(v > 0);
    }
    match s.to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "y" | "on" => Ok(true),
        "false" | "f" | "no" | "n" | "off" => Ok(false),
        _ => Err(Error::Decode(format!("'{s}' is not bool"))),
    }
}

/// Converts a JSON text cell using its column's logical type.
pub(crate) fn json_cell(
    cell: Option<&str>,
    column: &SnowflakeColumnType,
    schema: &RowSchema,
) -> Result<SnowflakeValue> {
    let Some(raw) = cell else {
        return Ok(SnowflakeValue::Null);
    };
    let value = match column.logical_type {
        LogicalType::Fixed => {
            if column.scale() == 0 {
                match raw.parse::<i64>() {
                    Ok(v) => SnowflakeValue::Integer(v),
                    Err(_) => SnowflakeValue::Decimal(raw.parse()?),
                }
            } else if schema.high_precision {
                SnowflakeValue::Decimal(raw.parse()?)
            } else {
                SnowflakeValue::Float(
                    raw.parse()
                        .map_err(|_| Error::Decode(format!("'{raw}' is not a number")))?,
                )
            }
        }
        LogicalType::Real => SnowflakeValue::Float(
            raw.parse()
                .map_err(|_| Error::Decode(format!("'{raw}' is not a number")))?,
        ),
        LogicalType::Boolean => SnowflakeValue::Boolean(parse_bool(raw)?),
        LogicalType::Binary => SnowflakeValue::Binary(
            decode_hex(raw).ok_or_else(|| Error::Decode(format!("'{raw}' is not hex")))?,
        ),
        LogicalType::Date => {
            let days: i64 = raw
                .parse()
                .map_err(|_| Error::Decode(format!("'{raw}' is not a date")))?;
            SnowflakeValue::Date(date_from_days(days)?)
        }
        LogicalType::Time => {
            let (secs, nanos) = parse_epoch(raw)?;
            SnowflakeValue::Time(time_from_parts(secs, nanos)?)
        }
        LogicalType::TimestampNtz => {
            let (secs, nanos) = parse_epoch(raw)?;
            SnowflakeValue::TimestampNtz(utc_from_parts(secs, nanos)?.naive_utc())
        }
        LogicalType::TimestampLtz => {
            let (secs, nanos) = parse_epoch(raw)?;
            SnowflakeValue::TimestampLtz(
                utc_from_parts(secs, nanos)?.with_timezone(&schema.time_offset),
            )
        }
        LogicalType::TimestampTz => {
            let (epoch, tz) = raw.trim().split_once(' ').ok_or_else(|| invalid_tz(raw))?;
            let (secs, nanos) = parse_epoch(epoch)?;
            let tz: i32 = tz.parse().map_err(|_| invalid_tz(raw))?;
            SnowflakeValue::TimestampTz(
                utc_from_parts(secs, nanos)?.with_timezone(&offset_from_tz_minutes(tz)?),
            )
        }
        _ => SnowflakeValue::Text(raw.to_string()),
    };
    Ok(value)
}

/// Splits `"<secs>.<fraction>"` into whole seconds and nanoseconds, flooring negatives.
pub(crate) fn parse_epoch(raw: &str) -> Result<(i64, u32)> {
    let invalid = || Error::Decode(format!("'{raw}' is not an epoch value"));
    let raw = raw.trim();
    let negative = raw.starts_with('-');
    let (int_part, frac_part) = raw.split_once('.').unwrap_or((raw, ""));
    let secs: i64 = int_part.parse().map_err(|_| invalid())?;
    if frac_part.len() > 9 || !frac_part.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let nanos: u32 = if frac_part.is_empty() {
        0
    } else {
        format!("{frac_part:0<9}").parse().map_err(|_| invalid())?
    };
    if negative && nanos > 0 {
        Ok((secs - 1, 1_000_000_000 - nanos))
    } else {
        Ok((secs, nanos))
    }
}

pub(crate) fn utc_from_parts(secs: i64, nanos: u32) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, nanos)
        .ok_or_else(|| Error::Decode(format!("timestamp out of range: {secs}.{nanos:09}")))
}

pub(crate) fn time_from_parts(secs: i64, nanos: u32) -> Result<NaiveTime> {
    u32::try_from(secs)
        .ok()
        .and_then(|secs| NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos))
        .ok_or_else(|| Error::Decode(format!("time out of range: {secs}.{nanos:09}")))
}

pub(crate) fn date_from_days(days: i64) -> Result<NaiveDate> {
    NaiveDate::from_ymd_opt(1970, 1, 1)
        .and_then(|epoch| epoch.checked_add_signed(TimeDelta::try_days(days)?))
        .ok_or_else(|| Error::Decode(format!("date out of range: {days}")))
}

/// TIMESTAMP_TZ carries its offset as minutes biased by 1440.
pub(crate) fn offset_from_tz_minutes(tz: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt((tz - 1440) * 60).ok_or_else(|| {
        SnowflakeError::new(
            codes::INVALID_OFFSET_STR,
            sql_state::INVALID_DATETIME_FORMAT,
            "invalid timezone offset: {}",
        )
        .with_args([tz])
        .into()
    })
}

fn invalid_tz(raw: &str) -> Error {
    SnowflakeError::new(
        codes::INVALID_TIMESTAMP_TZ,
        sql_state::INVALID_DATETIME_FORMAT,
        "invalid TIMESTAMP_TZ value: {}",
    )
    .with_args([raw])
    .into()
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(raw.get(i..i + 2)?, 16).ok())
        .collect()
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
