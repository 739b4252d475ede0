//! Ledger parsing and validation.
//!
//! A ledger is the user's upload: a table with at least the columns `date`, `id`,
//! `revenue`, and `user_id`. Files are read as text through DuckDB's CSV reader
//! and coerced here, so every failure can name the offending row.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use ::duckdb::Connection;
use ledgerlens_warehouse::query::escape_sql_string;
use ledgerlens_warehouse::TransactionRecord;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::Date;

use crate::ValidationError;

/// Columns every upload must carry.
pub const REQUIRED_COLUMNS: [&str; 4] = ["date", "id", "revenue", "user_id"];

/// One uncoerced ledger row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRow {
    pub date: String,
    pub id: String,
    pub revenue: String,
    pub user_id: String,
}

impl RawRow {
    pub fn new(
        date: impl Into<String>,
        id: impl Into<String>,
        revenue: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            date: date.into(),
            id: id.into(),
            revenue: revenue.into(),
            user_id: user_id.into(),
        }
    }
}

/// A validated ledger, ready to be written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    records: Vec<TransactionRecord>,
}

impl Ledger {
    /// Coerce and validate raw rows.
    ///
    /// Dates after `today` are rejected. Transaction ids must be unique.
    pub fn from_rows<I>(rows: I, today: Date) -> Result<Self, ValidationError>
    where
        I: IntoIterator<Item = RawRow>,
    {
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (index, raw) in rows.into_iter().enumerate() {
            let record = coerce_row(index + 1, raw, today)?;
            if !seen.insert(record.transaction_id.clone()) {
                return Err(ValidationError::DuplicateKey {
                    row: index + 1,
                    transaction_id: record.transaction_id,
                });
            }
            records.push(record);
        }
        Ok(Self { records })
    }

    /// Read and validate a CSV file with a header row.
    ///
    /// The file size is checked against `max_bytes` before anything is parsed.
    pub fn read_csv(path: &Path, max_bytes: u64, today: Date) -> Result<Self, ValidationError> {
        let rows = read_csv_rows(path, max_bytes)?;
        Self::from_rows(rows, today)
    }

    pub fn records(&self) -> &[TransactionRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TransactionRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Read the required columns of a CSV file as text, in file order.
pub fn read_csv_rows(path: &Path, max_bytes: u64) -> Result<Vec<RawRow>, ValidationError> {
    let unreadable = |reason: String| ValidationError::Unreadable { reason };

    let size = fs::metadata(path)
        .map_err(|error| unreadable(format!("{}: {error}", path.display())))?
        .len();
    if size > max_bytes {
        return Err(ValidationError::FileTooLarge {
            size,
            limit: max_bytes,
        });
    }

    let connection = Connection::open_in_memory().map_err(|error| unreadable(error.to_string()))?;
    // read_csv is a DuckDB table function; the path is escaped, never user SQL.
    let source = format!(
        "read_csv('{}', header = true, all_varchar = true)",
        escape_sql_string(&path.to_string_lossy().replace('\\', "/"))
    );

    let columns = header_columns(&connection, &source).map_err(|error| unreadable(error.to_string()))?;
    let mut selected = Vec::with_capacity(REQUIRED_COLUMNS.len());
    let mut missing = Vec::new();
    for required in REQUIRED_COLUMNS {
        match columns
            .iter()
            .find(|column| column.trim().eq_ignore_ascii_case(required))
        {
            Some(column) => selected.push(quote_identifier(column)),
            None => missing.push(required.to_owned()),
        }
    }
    if !missing.is_empty() {
        return Err(ValidationError::MissingColumns { columns: missing });
    }

    let sql = format!("SELECT {} FROM {source}", selected.join(", "));
    let mut statement = connection
        .prepare(&sql)
        .map_err(|error| unreadable(error.to_string()))?;
    let mut cursor = statement
        .query([])
        .map_err(|error| unreadable(error.to_string()))?;

    let mut rows = Vec::new();
    while let Some(row) = cursor.next().map_err(|error| unreadable(error.to_string()))? {
        let field = |index: usize| -> Result<String, ValidationError> {
            let value: Option<String> = row.get(index).map_err(|error| unreadable(error.to_string()))?;
            Ok(value.unwrap_or_default())
        };
        rows.push(RawRow {
            date: field(0)?,
            id: field(1)?,
            revenue: field(2)?,
            user_id: field(3)?,
        });
    }

    tracing::debug!(path = %path.display(), bytes = size, rows = rows.len(), "read ledger csv");
    Ok(rows)
}

fn header_columns(connection: &Connection, source: &str) -> Result<Vec<String>, ::duckdb::Error> {
    let mut statement = connection.prepare(&format!("DESCRIBE SELECT * FROM {source}"))?;
    let columns = statement
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn coerce_row(row: usize, raw: RawRow, today: Date) -> Result<TransactionRecord, ValidationError> {
    let transaction_id = non_empty(row, "id", &raw.id)?;
    let user_id = non_empty(row, "user_id", &raw.user_id)?;
    let transaction_date = parse_date(row, &raw.date)?;
    if transaction_date > today {
        return Err(ValidationError::FutureDate {
            row,
            value: transaction_date.to_string(),
        });
    }
    let revenue = parse_revenue(row, &raw.revenue)?;

    Ok(TransactionRecord {
        transaction_date,
        transaction_id,
        revenue,
        user_id,
    })
}

fn non_empty(row: usize, field: &'static str, value: &str) -> Result<String, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::EmptyField { row, field });
    }
    Ok(value.to_owned())
}

/// Accepts `YYYY-MM-DD`, optionally followed by `T` or a space and a time part.
fn parse_date(row: usize, value: &str) -> Result<Date, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField { row, field: "date" });
    }
    let invalid = || ValidationError::InvalidDate {
        row,
        value: trimmed.to_owned(),
    };

    let (day, rest) = match trimmed.char_indices().nth(10) {
        Some((split, _)) => trimmed.split_at(split),
        None => (trimmed, ""),
    };
    if !(rest.is_empty() || rest.starts_with('T') || rest.starts_with(' ')) {
        return Err(invalid());
    }
    Date::parse(day, format_description!("[year]-[month]-[day]")).map_err(|_| invalid())
}

fn parse_revenue(row: usize, value: &str) -> Result<f64, ValidationError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyField {
            row,
            field: "revenue",
        });
    }
    let revenue: f64 = trimmed.parse().map_err(|_| ValidationError::InvalidRevenue {
        row,
        value: trimmed.to_owned(),
    })?;
    if !revenue.is_finite() {
        return Err(ValidationError::NonFiniteRevenue { row });
    }
    if revenue < 0.0 {
        return Err(ValidationError::NegativeRevenue { row });
    }
    if !whole_cents(trimmed, revenue) {
        return Err(ValidationError::RevenuePrecision {
            row,
            value: trimmed.to_owned(),
        });
    }
    Ok(revenue)
}

/// Revenue is stored with two decimal places; finer amounts are rejected
/// rather than rounded.
fn whole_cents(text: &str, revenue: f64) -> bool {
    if text.contains(['e', 'E']) {
        let cents = revenue * 100.0;
        return (cents - cents.round()).abs() < 1e-6;
    }
    text.split_once('.')
        .map_or(true, |(_, fraction)| fraction.trim_end_matches('0').len() <= 2)
}
