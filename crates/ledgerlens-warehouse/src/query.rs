//! Guarded execution of composed statements and conversion of result values.

use std::time::{Duration, Instant};

use ::duckdb::types::Value as DuckValue;
use ::duckdb::{Connection, ToSql};
use serde_json::{Number, Value};
use time::Date;

use crate::{QueryGuardrails, QueryResult, SqlColumn, WarehouseError};

/// Julian day number of 1970-01-01.
const UNIX_EPOCH_JULIAN_DAY: i32 = 2_440_588;

/// Execute a read statement with guardrails (timeout, optional row limit).
///
/// Store failures are reported as [`WarehouseError::QueryExecution`] tagged with
/// `metric`.
pub(crate) fn execute_with_guardrails(
    connection: &Connection,
    metric: &str,
    sql: &str,
    params: &[&dyn ToSql],
    guardrails: QueryGuardrails,
) -> Result<QueryResult, WarehouseError> {
    guardrails.validate()?;
    let started = Instant::now();
    let timeout = guardrails.timeout();
    let wrap = |source: ::duckdb::Error| WarehouseError::QueryExecution {
        metric: metric.to_owned(),
        source,
    };

    let mut statement = connection.prepare(sql).map_err(wrap)?;
    let mut cursor = statement.query(params).map_err(wrap)?;

    // Column metadata is only available once the statement has run.
    let columns = match cursor.as_ref() {
        Some(executed) => (0..executed.column_count())
            .map(|index| {
                Ok(SqlColumn {
                    name: executed.column_name(index)?.to_string(),
                    r#type: executed.column_type(index).to_string(),
                })
            })
            .collect::<Result<Vec<_>, ::duckdb::Error>>()
            .map_err(wrap)?,
        None => Vec::new(),
    };
    let column_count = columns.len();

    let mut rows = Vec::new();
    let mut truncated = false;
    while let Some(row) = cursor.next().map_err(wrap)? {
        ensure_timeout(started, timeout)?;

        if guardrails.max_rows.is_some_and(|max_rows| rows.len() >= max_rows) {
            truncated = true;
            break;
        }

        rows.push(read_row(row, column_count).map_err(wrap)?);
    }

    ensure_timeout(started, timeout)?;

    Ok(QueryResult {
        columns,
        row_count: rows.len(),
        rows,
        truncated,
    })
}

/// Read a single row from the result set.
fn read_row(row: &::duckdb::Row<'_>, column_count: usize) -> Result<Vec<Value>, ::duckdb::Error> {
    let mut output = Vec::with_capacity(column_count);
    for index in 0..column_count {
        let value: DuckValue = row.get(index)?;
        output.push(to_json_value(value));
    }
    Ok(output)
}

/// Convert a DuckDB value to a JSON value.
pub(crate) fn to_json_value(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(value) => Value::Bool(value),
        DuckValue::TinyInt(value) => Value::Number(Number::from(value)),
        DuckValue::SmallInt(value) => Value::Number(Number::from(value)),
        DuckValue::Int(value) => Value::Number(Number::from(value)),
        DuckValue::BigInt(value) => Value::Number(Number::from(value)),
        DuckValue::HugeInt(value) => match i64::try_from(value) {
            Ok(value) => Value::Number(Number::from(value)),
            Err(_) => Value::String(value.to_string()),
        },
        DuckValue::UTinyInt(value) => Value::Number(Number::from(value)),
        DuckValue::USmallInt(value) => Value::Number(Number::from(value)),
        DuckValue::UInt(value) => Value::Number(Number::from(value)),
        DuckValue::UBigInt(value) => Value::Number(Number::from(value)),
        DuckValue::Float(value) => number_from_f64(f64::from(value)),
        DuckValue::Double(value) => number_from_f64(value),
        DuckValue::Decimal(value) => value
            .to_string()
            .parse::<f64>()
            .map(number_from_f64)
            .unwrap_or(Value::Null),
        DuckValue::Date32(days) => date_from_epoch_days(days)
            .map(|date| Value::String(date.to_string()))
            .unwrap_or(Value::Null),
        DuckValue::Text(value) => Value::String(value),
        DuckValue::Blob(value) => Value::String(hex::encode(value)),
        other => Value::String(format!("{other:?}")),
    }
}

/// Convert an f64 to a JSON number, returning Null for NaN/Inf.
fn number_from_f64(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn date_from_epoch_days(days: i32) -> Option<Date> {
    let julian_day = UNIX_EPOCH_JULIAN_DAY.checked_add(days)?;
    Date::from_julian_day(julian_day).ok()
}

/// Ensure that the query has not exceeded the timeout.
fn ensure_timeout(started: Instant, timeout: Duration) -> Result<(), WarehouseError> {
    if started.elapsed() > timeout {
        return Err(WarehouseError::QueryTimeout {
            timeout_ms: timeout.as_millis().min(u128::from(u64::MAX)) as u64,
        });
    }
    Ok(())
}

/// Escape a string for safe inclusion in SQL.
///
/// # Security Note
/// Only used for file paths handed to table functions such as `read_csv`.
/// Data values always go through bound parameters.
pub fn escape_sql_string(value: &str) -> String {
    value.replace('\'', "''")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn converts_dates_and_decimals_to_json() {
        let connection = Connection::open_in_memory().expect("connection");
        let result = execute_with_guardrails(
            &connection,
            "fixture",
            "SELECT DATE '2024-03-01' AS as_of, CAST(12.5 AS DECIMAL(18, 2)) AS amount, CAST(NULL AS DOUBLE) AS missing",
            &[],
            QueryGuardrails::default(),
        )
        .expect("query");

        assert_eq!(result.columns[0].name, "as_of");
        assert_eq!(result.rows[0][0], Value::String(String::from("2024-03-01")));
        assert_eq!(result.rows[0][1], serde_json::json!(12.5));
        assert_eq!(result.rows[0][2], Value::Null);
    }

    #[test]
    fn truncates_at_row_limit() {
        let connection = Connection::open_in_memory().expect("connection");
        let guardrails = QueryGuardrails {
            max_rows: Some(3),
            query_timeout_ms: 5_000,
        };
        let result = execute_with_guardrails(
            &connection,
            "fixture",
            "SELECT * FROM range(10)",
            &[],
            guardrails,
        )
        .expect("query");

        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
    }

    #[test]
    fn reads_every_row_without_a_limit() {
        let connection = Connection::open_in_memory().expect("connection");
        let result = execute_with_guardrails(
            &connection,
            "fixture",
            "SELECT range AS n FROM range(25000)",
            &[],
            QueryGuardrails::default(),
        )
        .expect("query");

        assert_eq!(result.columns.len(), 1);
        assert_eq!(result.columns[0].name, "n");
        assert_eq!(result.row_count, 25_000);
        assert!(!result.truncated);
    }

    #[test]
    fn malformed_statement_is_reported_with_metric_name() {
        let connection = Connection::open_in_memory().expect("connection");
        let err = execute_with_guardrails(
            &connection,
            "broken_metric",
            "SELECT missing_column FROM range(1)",
            &[],
            QueryGuardrails::default(),
        )
        .expect_err("must fail");

        match err {
            WarehouseError::QueryExecution { metric, .. } => assert_eq!(metric, "broken_metric"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn epoch_days_map_to_calendar_dates() {
        assert_eq!(date_from_epoch_days(0), Some(date!(1970 - 01 - 01)));
        assert_eq!(date_from_epoch_days(19_723), Some(date!(2024 - 01 - 01)));
    }
}
