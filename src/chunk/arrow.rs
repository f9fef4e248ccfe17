//! Arrow IPC result chunks.
//!
//! The server encodes each column by its logical type: scaled integers for FIXED, TIME and
//! most timestamps, `{epoch, fraction}` structs for wide timestamps, and an extra biased
//! timezone field for TIMESTAMP_TZ.

use std::io::Read;
use std::sync::Arc;

use arrow_array::cast::AsArray;
use arrow_array::types::{
    Date32Type, Date64Type, Decimal128Type, Float32Type, Float64Type, Int8Type, Int16Type,
    Int32Type, Int64Type,
};
use arrow_array::{
    Array, ArrayRef, RecordBatch, TimestampMicrosecondArray, TimestampMillisecondArray,
    TimestampNanosecondArray, TimestampSecondArray,
};
use arrow_ipc::reader::StreamReader;
use arrow_schema::{DataType, Field, Schema};

use crate::error::{SnowflakeError, codes, sql_state};
use crate::row::{
    LogicalType, RowSchema, SnowflakeColumnType, SnowflakeDecimal, SnowflakeRow, SnowflakeValue,
    date_from_days, offset_from_tz_minutes, time_from_parts, utc_from_parts,
};
use crate::{Error, Result};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Unit for timestamp columns handed out as raw record batches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimestampResolution {
    #[default]
    Nanosecond,
    Microsecond,
    Millisecond,
    Second,
    /// Leave the server's encoding untouched.
    Original,
}

pub(crate) fn read_batches<R: Read>(reader: R) -> Result<Vec<RecordBatch>> {
    let reader = StreamReader::try_new(reader, None)?;
    let mut batches = Vec::new();
    for batch in reader {
        batches.push(batch?);
    }
    Ok(batches)
}

pub(crate) fn batch_to_rows(batch: &RecordBatch, schema: &Arc<RowSchema>) -> Result<Vec<SnowflakeRow>> {
    if batch.num_columns() != schema.columns.len() {
        return Err(Error::Decode(format!(
            "arrow batch has {} columns, expected {}",
            batch.num_columns(),
            schema.columns.len()
        )));
    }
    let mut rows = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        let mut values = Vec::with_capacity(batch.num_columns());
        for (array, column) in batch.columns().iter().zip(&schema.columns) {
            values.push(cell(array.as_ref(), row, &column.column_type, schema)?);
        }
        rows.push(SnowflakeRow::native(values, Arc::clone(schema)));
    }
    Ok(rows)
}

fn cell(
    array: &dyn Array,
    row: usize,
    column: &SnowflakeColumnType,
    schema: &RowSchema,
) -> Result<SnowflakeValue> {
    if array.is_null(row) {
        return Ok(SnowflakeValue::Null);
    }
    let value = match &column.logical_type {
        LogicalType::Fixed => {
            let mantissa = int_at(array, row).ok_or_else(|| unsupported(column, array))?;
            let scale = column.scale();
            if scale == 0 {
                match i64::try_from(mantissa) {
                    Ok(v) => SnowflakeValue::Integer(v),
                    Err(_) => SnowflakeValue::Decimal(SnowflakeDecimal::new(mantissa, 0)),
                }
            } else if schema.high_precision {
                SnowflakeValue::Decimal(SnowflakeDecimal::new(mantissa, scale))
            } else {
                SnowflakeValue::Float(SnowflakeDecimal::new(mantissa, scale).to_f64())
            }
        }
        LogicalType::Real => match array.data_type() {
            DataType::Float64 => SnowflakeValue::Float(array.as_primitive::<Float64Type>().value(row)),
            DataType::Float32 => {
                SnowflakeValue::Float(array.as_primitive::<Float32Type>().value(row) as f64)
            }
            _ => return Err(unsupported(column, array)),
        },
        LogicalType::Boolean => match array.as_boolean_opt() {
            Some(a) => SnowflakeValue::Boolean(a.value(row)),
            None => return Err(unsupported(column, array)),
        },
        LogicalType::Binary => match array.data_type() {
            DataType::Binary => SnowflakeValue::Binary(array.as_binary::<i32>().value(row).to_vec()),
            DataType::LargeBinary => {
                SnowflakeValue::Binary(array.as_binary::<i64>().value(row).to_vec())
            }
            _ => return Err(unsupported(column, array)),
        },
        LogicalType::Date => match array.data_type() {
            DataType::Date32 => SnowflakeValue::Date(date_from_days(
                array.as_primitive::<Date32Type>().value(row) as i64,
            )?),
            DataType::Date64 => SnowflakeValue::Date(date_from_days(
                array.as_primitive::<Date64Type>().value(row).div_euclid(86_400_000),
            )?),
            _ => return Err(unsupported(column, array)),
        },
        LogicalType::Time => {
            let scaled = int_at(array, row).ok_or_else(|| unsupported(column, array))?;
            let (secs, nanos) = split_scaled(scaled, column.scale())?;
            SnowflakeValue::Time(time_from_parts(secs, nanos)?)
        }
        LogicalType::TimestampNtz => {
            let (secs, nanos, _) = timestamp_parts(array, row, column)?;
            SnowflakeValue::TimestampNtz(utc_from_parts(secs, nanos)?.naive_utc())
        }
        LogicalType::TimestampLtz => {
            let (secs, nanos, _) = timestamp_parts(array, row, column)?;
            SnowflakeValue::TimestampLtz(
                utc_from_parts(secs, nanos)?.with_timezone(&schema.time_offset),
            )
        }
        LogicalType::TimestampTz => {
            let (secs, nanos, tz) = timestamp_parts(array, row, column)?;
            let tz = tz.ok_or_else(|| unsupported(column, array))?;
            SnowflakeValue::TimestampTz(
                utc_from_parts(secs, nanos)?.with_timezone(&offset_from_tz_minutes(tz)?),
            )
        }
        _ => match array.data_type() {
            DataType::Utf8 => SnowflakeValue::Text(array.as_string::<i32>().value(row).to_string()),
            DataType::LargeUtf8 => {
                SnowflakeValue::Text(array.as_string::<i64>().value(row).to_string())
            }
            _ => return Err(unsupported(column, array)),
        },
    };
    Ok(value)
}

fn int_at(array: &dyn Array, row: usize) -> Option<i128> {
    let value = match array.data_type() {
        DataType::Int8 => array.as_primitive::<Int8Type>().value(row) as i128,
        DataType::Int16 => array.as_primitive::<Int16Type>().value(row) as i128,
        DataType::Int32 => array.as_primitive::<Int32Type>().value(row) as i128,
        DataType::Int64 => array.as_primitive::<Int64Type>().value(row) as i128,
        DataType::Decimal128(_, _) => array.as_primitive::<Decimal128Type>().value(row),
        _ => return None,
    };
    Some(value)
}

/// Splits a value scaled by `10^scale` into whole seconds and nanoseconds.
fn split_scaled(scaled: i128, scale: u32) -> Result<(i64, u32)> {
    let scale = scale.min(9);
    let divisor = 10i128.pow(scale);
    let secs = i64::try_from(scaled.div_euclid(divisor))
        .map_err(|_| Error::Decode(format!("epoch value out of range: {scaled}")))?;
    let nanos = (scaled.rem_euclid(divisor) * 10i128.pow(9 - scale)) as u32;
    Ok((secs, nanos))
}

/// `(seconds, nanoseconds, biased timezone minutes)` for any timestamp encoding.
fn timestamp_parts(
    array: &dyn Array,
    row: usize,
    column: &SnowflakeColumnType,
) -> Result<(i64, u32, Option<i32>)> {
    let Some(fields) = array.as_struct_opt() else {
        let scaled = int_at(array, row).ok_or_else(|| unsupported(column, array))?;
        let (secs, nanos) = split_scaled(scaled, column.scale())?;
        return Ok((secs, nanos, None));
    };
    let field = |i: usize| -> Result<i128> {
        fields
            .columns()
            .get(i)
            .and_then(|a| int_at(a.as_ref(), row))
            .ok_or_else(|| unsupported(column, array))
    };
    let is_tz = column.logical_type == LogicalType::TimestampTz;
    match (fields.num_columns(), is_tz) {
        (2, true) => {
            let (secs, nanos) = split_scaled(field(0)?, column.scale())?;
            Ok((secs, nanos, Some(field(1)? as i32)))
        }
        (3, true) => {
            let secs = i64::try_from(field(0)?).map_err(|_| unsupported(column, array))?;
            Ok((secs, field(1)? as u32, Some(field(2)? as i32)))
        }
        (2, false) => {
            let secs = i64::try_from(field(0)?).map_err(|_| unsupported(column, array))?;
            Ok((secs, field(1)? as u32, None))
        }
        _ => Err(unsupported(column, array)),
    }
}

fn unsupported(column: &SnowflakeColumnType, array: &dyn Array) -> Error {
    SnowflakeError::new(
        codes::UNSUPPORTED_ARROW_TYPE,
        sql_state::GENERAL_ERROR,
        "unsupported arrow type {} for snowflake type {}",
    )
    .with_args([
        array.data_type().to_string(),
        column.logical_type.as_str().to_string(),
    ])
    .into()
}

/// Rewrites timestamp columns as arrow `Timestamp` arrays in the requested unit.
///
/// NTZ columns carry no timezone; LTZ and TZ columns become UTC instants.
pub(crate) fn convert_timestamps(
    batch: &RecordBatch,
    schema: &RowSchema,
    resolution: TimestampResolution,
) -> Result<RecordBatch> {
    if resolution == TimestampResolution::Original
        || !schema
            .columns
            .iter()
            .any(|c| c.column_type.logical_type.is_timestamp())
    {
        return Ok(batch.clone());
    }

    let batch_schema = batch.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(batch.num_columns());
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
    for ((array, field), column) in batch
        .columns()
        .iter()
        .zip(batch_schema.fields())
        .zip(&schema.columns)
    {
        let column_type = &column.column_type;
        if !column_type.logical_type.is_timestamp() {
            fields.push(field.as_ref().clone());
            columns.push(Arc::clone(array));
            continue;
        }
        let mut values = Vec::with_capacity(array.len());
        for row in 0..array.len() {
            if array.is_null(row) {
                values.push(None);
                continue;
            }
            let (secs, nanos, _) = timestamp_parts(array.as_ref(), row, column_type)?;
            values.push(Some(in_unit(secs, nanos, resolution)?));
        }
        let tz: Option<Arc<str>> = match column_type.logical_type {
            LogicalType::TimestampNtz => None,
            _ => Some(Arc::from("UTC")),
        };
        let converted: ArrayRef = match resolution {
            TimestampResolution::Second => {
                Arc::new(TimestampSecondArray::from(values).with_timezone_opt(tz))
            }
            TimestampResolution::Millisecond => {
                Arc::new(TimestampMillisecondArray::from(values).with_timezone_opt(tz))
            }
            TimestampResolution::Microsecond => {
                Arc::new(TimestampMicrosecondArray::from(values).with_timezone_opt(tz))
            }
            TimestampResolution::Nanosecond | TimestampResolution::Original => {
                Arc::new(TimestampNanosecondArray::from(values).with_timezone_opt(tz))
            }
        };
        fields.push(
            field
                .as_ref()
                .clone()
                .with_data_type(converted.data_type().clone()),
        );
        columns.push(converted);
    }
    let schema = Schema::new_with_metadata(fields, batch_schema.metadata().clone());
    Ok(RecordBatch::try_new(Arc::new(schema), columns)?)
}

fn in_unit(secs: i64, nanos: u32, resolution: TimestampResolution) -> Result<i64> {
    let nanos = nanos as i64;
    let value = match resolution {
        TimestampResolution::Second => Some(secs),
        TimestampResolution::Millisecond => secs
            .checked_mul(1_000)
            .and_then(|v| v.checked_add(nanos / 1_000_000)),
        TimestampResolution::Microsecond => secs
            .checked_mul(1_000_000)
            .and_then(|v| v.checked_add(nanos / 1_000)),
        TimestampResolution::Nanosecond | TimestampResolution::Original => secs
            .checked_mul(NANOS_PER_SEC)
            .and_then(|v| v.checked_add(nanos)),
    };
    value.ok_or_else(|| Error::TooHighTimestampPrecision(format!("{secs}.{nanos:09}")))
}
