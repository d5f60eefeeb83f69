use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use quarry_types::{Row as ResultRow, ScalarValue};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::types::Uuid;
use sqlx::{Row, TypeInfo, ValueRef};
use tracing::debug;

pub(crate) fn decode_row(row: &PgRow, columns: &[String]) -> ResultRow {
    ResultRow::new(
        columns
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), decode_cell(row, idx)))
            .collect(),
    )
}

/// Map one cell onto the scalar set exposed to callers. Cells of unknown types become a
/// placeholder text instead of failing the whole result.
pub(crate) fn decode_cell(row: &PgRow, idx: usize) -> ScalarValue {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return ScalarValue::Null,
        Ok(raw) => raw.type_info().name().to_ascii_uppercase(),
        Err(_) => return unsupported("UNKNOWN"),
    };

    let decoded: Result<ScalarValue, sqlx::Error> = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(idx).map(ScalarValue::Bool),
        "INT2" => row.try_get::<i16, _>(idx).map(|v| ScalarValue::Integer(v.into())),
        "INT4" => row.try_get::<i32, _>(idx).map(|v| ScalarValue::Integer(v.into())),
        "INT8" => row.try_get::<i64, _>(idx).map(ScalarValue::Integer),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| ScalarValue::Float(v.into())),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(ScalarValue::Float),
        "NUMERIC" => row.try_get::<Decimal, _>(idx).map(numeric),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" | "UNKNOWN" | "CHAR" => {
            row.try_get_unchecked::<String, _>(idx).map(ScalarValue::Text)
        }
        "TIMESTAMPTZ" => row.try_get::<DateTime<Utc>, _>(idx).map(ScalarValue::Timestamp),
        "TIMESTAMP" => row
            .try_get::<NaiveDateTime, _>(idx)
            .map(|v| ScalarValue::Timestamp(v.and_utc())),
        "DATE" => row
            .try_get::<NaiveDate, _>(idx)
            .map(|v| ScalarValue::Timestamp(v.and_time(NaiveTime::MIN).and_utc())),
        "TIME" => row
            .try_get::<NaiveTime, _>(idx)
            .map(|v| ScalarValue::Text(v.to_string())),
        "UUID" => row
            .try_get::<Uuid, _>(idx)
            .map(|v| ScalarValue::Text(v.to_string())),
        "JSON" | "JSONB" => row
            .try_get::<serde_json::Value, _>(idx)
            .map(|v| ScalarValue::Text(v.to_string())),
        other => return unsupported(other),
    };

    decoded.unwrap_or_else(|e| {
        debug!(column = idx, error = %e, "cell decode failed");
        unsupported(&type_name)
    })
}

fn numeric(v: Decimal) -> ScalarValue {
    match v.to_i64() {
        Some(i) if v.fract().is_zero() => ScalarValue::Integer(i),
        _ => v
            .to_f64()
            .map(ScalarValue::Float)
            .unwrap_or_else(|| ScalarValue::Text(v.to_string())),
    }
}

fn unsupported(type_name: &str) -> ScalarValue {
    ScalarValue::Text(format!("<unsupported type {type_name}>"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn whole_numerics_stay_integers() {
        assert_eq!(numeric(Decimal::from(42)), ScalarValue::Integer(42));
        assert_eq!(numeric(Decimal::from_str("12.50").unwrap()), ScalarValue::Float(12.5));
        assert_eq!(numeric(Decimal::from_str("3.000").unwrap()), ScalarValue::Integer(3));
    }

    #[test]
    fn placeholder_names_the_type() {
        assert_eq!(
            unsupported("INTERVAL"),
            ScalarValue::Text("<unsupported type INTERVAL>".into())
        );
    }
}
