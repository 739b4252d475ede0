//! Dataset Store: raw transactions partitioned by session.
//!
//! All sessions share the `transactions` relation; every statement filters on a
//! bound `session_id`. A row in `sessions` marks the session as materialized.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use ::duckdb::{Connection, ToSql};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::{SessionId, Warehouse, WarehouseError};

/// Largest revenue magnitude representable by `DECIMAL(18, 2)`.
const MAX_REVENUE: f64 = 9_999_999_999_999_999.0;

/// One validated ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub transaction_date: Date,
    pub transaction_id: String,
    /// Stored as `DECIMAL(18, 2)`, so sub-cent amounts are rounded to the cent.
    /// Ledger parsing rejects them before they get here.
    pub revenue: f64,
    pub user_id: String,
}

impl TransactionRecord {
    /// Check the schema invariants of a single record against `today`.
    pub fn validate(&self, today: Date) -> Result<(), WarehouseError> {
        let invalid = |reason: &str| WarehouseError::InvalidRecord {
            transaction_id: self.transaction_id.clone(),
            reason: reason.to_owned(),
        };

        if self.transaction_id.trim().is_empty() {
            return Err(invalid("transaction id must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(invalid("user id must not be empty"));
        }
        if !self.revenue.is_finite() {
            return Err(invalid("revenue must be a finite number"));
        }
        if self.revenue < 0.0 {
            return Err(invalid("revenue must not be negative"));
        }
        if self.revenue > MAX_REVENUE {
            return Err(invalid("revenue exceeds the supported range"));
        }
        if self.transaction_date > today {
            return Err(invalid("transaction date is in the future"));
        }
        Ok(())
    }
}

/// Per-session write locks.
///
/// Writes to one session run one at a time, so the uniqueness check inside each
/// write transaction sees every batch committed before it.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionWriteLocks {
    locks: Arc<Mutex<HashMap<SessionId, Arc<Mutex<()>>>>>,
}

impl SessionWriteLocks {
    fn for_session(&self, session: &SessionId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(session.clone()).or_default())
    }
}

/// Externally materialized per-session summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionAggregates {
    pub session_id: SessionId,
    pub row_count: u64,
    pub user_count: u64,
    pub total_revenue: f64,
    pub first_transaction_date: Option<Date>,
    pub last_transaction_date: Option<Date>,
    pub refreshed_at: String,
}

/// Storage interface for session datasets.
///
/// One implementation is selected at startup; the ingestion pipeline and the
/// session manager only see this trait.
pub trait DatasetStore: Send + Sync {
    /// Register the session and leave it with an empty dataset.
    fn initialize_session(&self, session: &SessionId) -> Result<(), WarehouseError>;

    /// Atomically discard prior contents and insert `records`.
    fn replace_all(
        &self,
        session: &SessionId,
        records: &[TransactionRecord],
    ) -> Result<usize, WarehouseError>;

    /// Insert one batch in its own transaction.
    ///
    /// Fails with [`WarehouseError::DuplicateKey`] when an id repeats within the
    /// batch or matches a row already stored for the session.
    fn append_batch(
        &self,
        session: &SessionId,
        records: &[TransactionRecord],
    ) -> Result<usize, WarehouseError>;

    /// Remove every transaction of the session, keeping it registered.
    fn clear(&self, session: &SessionId) -> Result<(), WarehouseError>;

    fn exists(&self, session: &SessionId) -> Result<bool, WarehouseError>;

    fn row_count(&self, session: &SessionId) -> Result<u64, WarehouseError>;

    /// Recompute the session summary from its current transactions.
    fn refresh_aggregates(&self, session: &SessionId) -> Result<SessionAggregates, WarehouseError>;

    fn aggregates(&self, session: &SessionId) -> Result<Option<SessionAggregates>, WarehouseError>;

    /// Remove the session's data, summary, and registry entry.
    fn drop_session(&self, session: &SessionId) -> Result<(), WarehouseError>;
}

impl DatasetStore for Warehouse {
    fn initialize_session(&self, session: &SessionId) -> Result<(), WarehouseError> {
        let lock = self.write_locks.for_session(session);
        let _write = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = self.connection()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            register_session(&connection, session)?;
            delete_session_rows(&connection, session)?;
            Ok(())
        })();
        finalize_transaction(&connection, result)?;
        tracing::debug!(session = %session, "initialized session");
        Ok(())
    }

    fn replace_all(
        &self,
        session: &SessionId,
        records: &[TransactionRecord],
    ) -> Result<usize, WarehouseError> {
        validate_records(records)?;

        let lock = self.write_locks.for_session(session);
        let _write = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = self.connection()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            register_session(&connection, session)?;
            delete_session_rows(&connection, session)?;
            let inserted = insert_records(&connection, session, records)?;
            ensure_unique_ids(&connection, session)?;
            Ok(inserted)
        })();
        let inserted = finalize_transaction(&connection, result)?;
        tracing::debug!(session = %session, rows = inserted, "replaced session dataset");
        Ok(inserted)
    }

    fn append_batch(
        &self,
        session: &SessionId,
        records: &[TransactionRecord],
    ) -> Result<usize, WarehouseError> {
        if records.is_empty() {
            return Ok(0);
        }
        validate_records(records)?;

        let lock = self.write_locks.for_session(session);
        let _write = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = self.connection()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<usize, WarehouseError> {
            register_session(&connection, session)?;
            let inserted = insert_records(&connection, session, records)?;
            ensure_unique_ids(&connection, session)?;
            Ok(inserted)
        })();
        finalize_transaction(&connection, result)
    }

    fn clear(&self, session: &SessionId) -> Result<(), WarehouseError> {
        let lock = self.write_locks.for_session(session);
        let _write = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = self.connection()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = delete_session_rows(&connection, session);
        finalize_transaction(&connection, result)?;
        tracing::debug!(session = %session, "cleared session dataset");
        Ok(())
    }

    fn exists(&self, session: &SessionId) -> Result<bool, WarehouseError> {
        let connection = self.connection()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM sessions WHERE session_id = ?",
            [session.as_str()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn row_count(&self, session: &SessionId) -> Result<u64, WarehouseError> {
        let connection = self.connection()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM transactions WHERE session_id = ?",
            [session.as_str()],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn refresh_aggregates(&self, session: &SessionId) -> Result<SessionAggregates, WarehouseError> {
        let connection = self.connection()?;
        let params: [&dyn ToSql; 2] = [&session.as_str(), &session.as_str()];
        connection
            .execute(
                "INSERT INTO session_aggregates \
                 (session_id, row_count, user_count, total_revenue, first_transaction_date, last_transaction_date, refreshed_at) \
                 SELECT ?, COUNT(*), COUNT(DISTINCT user_id), COALESCE(CAST(SUM(revenue) AS DOUBLE), 0), \
                        MIN(transaction_date), MAX(transaction_date), CURRENT_TIMESTAMP \
                 FROM transactions WHERE session_id = ? \
                 ON CONFLICT (session_id) DO UPDATE SET \
                 row_count = excluded.row_count, \
                 user_count = excluded.user_count, \
                 total_revenue = excluded.total_revenue, \
                 first_transaction_date = excluded.first_transaction_date, \
                 last_transaction_date = excluded.last_transaction_date, \
                 refreshed_at = excluded.refreshed_at",
                params.as_slice(),
            )
            .map_err(WarehouseError::from_store)?;

        read_aggregates(&connection, session)?.ok_or_else(|| {
            WarehouseError::Transient(format!("aggregates for session {session} vanished after refresh"))
        })
    }

    fn aggregates(&self, session: &SessionId) -> Result<Option<SessionAggregates>, WarehouseError> {
        let connection = self.connection()?;
        read_aggregates(&connection, session)
    }

    fn drop_session(&self, session: &SessionId) -> Result<(), WarehouseError> {
        let lock = self.write_locks.for_session(session);
        let _write = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let connection = self.connection()?;
        connection.execute_batch("BEGIN TRANSACTION")?;
        let result = (|| -> Result<(), WarehouseError> {
            delete_session_rows(&connection, session)?;
            connection.execute(
                "DELETE FROM sessions WHERE session_id = ?",
                [session.as_str()],
            )?;
            Ok(())
        })();
        finalize_transaction(&connection, result)?;
        tracing::debug!(session = %session, "dropped session");
        Ok(())
    }
}

fn validate_records(records: &[TransactionRecord]) -> Result<(), WarehouseError> {
    let today = OffsetDateTime::now_utc().date();
    let mut seen = HashSet::with_capacity(records.len());
    for record in records {
        record.validate(today)?;
        if !seen.insert(record.transaction_id.as_str()) {
            return Err(WarehouseError::DuplicateKey {
                transaction_id: record.transaction_id.clone(),
            });
        }
    }
    Ok(())
}

fn register_session(connection: &Connection, session: &SessionId) -> Result<(), WarehouseError> {
    connection.execute(
        "INSERT INTO sessions (session_id) VALUES (?) ON CONFLICT DO NOTHING",
        [session.as_str()],
    )?;
    Ok(())
}

fn delete_session_rows(connection: &Connection, session: &SessionId) -> Result<(), WarehouseError> {
    connection.execute(
        "DELETE FROM transactions WHERE session_id = ?",
        [session.as_str()],
    )?;
    connection.execute(
        "DELETE FROM session_aggregates WHERE session_id = ?",
        [session.as_str()],
    )?;
    Ok(())
}

/// Insert records using a parameterized statement.
///
/// # Security
/// All user-provided values are passed as query parameters.
fn insert_records(
    connection: &Connection,
    session: &SessionId,
    records: &[TransactionRecord],
) -> Result<usize, WarehouseError> {
    let mut statement = connection.prepare(
        "INSERT INTO transactions (session_id, transaction_id, transaction_date, revenue, user_id) \
         VALUES (?, ?, CAST(? AS DATE), CAST(? AS DECIMAL(18, 2)), ?)",
    )?;

    for record in records {
        let transaction_date = record.transaction_date.to_string();
        let params: [&dyn ToSql; 5] = [
            &session.as_str(),
            &record.transaction_id,
            &transaction_date,
            &record.revenue,
            &record.user_id,
        ];
        statement.execute(params.as_slice())?;
    }

    Ok(records.len())
}

/// Reject the write when any id occurs twice for the session.
fn ensure_unique_ids(connection: &Connection, session: &SessionId) -> Result<(), WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT transaction_id FROM transactions WHERE session_id = ? \
         GROUP BY transaction_id HAVING COUNT(*) > 1 LIMIT 1",
    )?;
    let mut rows = statement.query([session.as_str()])?;
    if let Some(row) = rows.next()? {
        let transaction_id: String = row.get(0)?;
        return Err(WarehouseError::DuplicateKey { transaction_id });
    }
    Ok(())
}

fn read_aggregates(
    connection: &Connection,
    session: &SessionId,
) -> Result<Option<SessionAggregates>, WarehouseError> {
    let mut statement = connection.prepare(
        "SELECT row_count, user_count, total_revenue, \
                CAST(first_transaction_date AS VARCHAR), CAST(last_transaction_date AS VARCHAR), \
                CAST(refreshed_at AS VARCHAR) \
         FROM session_aggregates WHERE session_id = ?",
    )?;
    let mut rows = statement.query([session.as_str()])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };

    let row_count: i64 = row.get(0)?;
    let user_count: i64 = row.get(1)?;
    let first: Option<String> = row.get(3)?;
    let last: Option<String> = row.get(4)?;

    Ok(Some(SessionAggregates {
        session_id: session.clone(),
        row_count: u64::try_from(row_count).unwrap_or_default(),
        user_count: u64::try_from(user_count).unwrap_or_default(),
        total_revenue: row.get(2)?,
        first_transaction_date: first.as_deref().and_then(parse_iso_date),
        last_transaction_date: last.as_deref().and_then(parse_iso_date),
        refreshed_at: row.get(5)?,
    }))
}

fn parse_iso_date(value: &str) -> Option<Date> {
    Date::parse(value, format_description!("[year]-[month]-[day]")).ok()
}

/// Finalize a transaction, committing on success or rolling back on failure.
///
/// Commit conflicts are reported as [`WarehouseError::Transient`].
fn finalize_transaction<T>(
    connection: &Connection,
    result: Result<T, WarehouseError>,
) -> Result<T, WarehouseError> {
    match result {
        Ok(value) => {
            if let Err(error) = connection.execute_batch("COMMIT") {
                let _ = connection.execute_batch("ROLLBACK");
                return Err(WarehouseError::from_store(error));
            }
            Ok(value)
        }
        Err(error) => {
            let _ = connection.execute_batch("ROLLBACK");
            Err(match error {
                WarehouseError::DuckDb(error) => WarehouseError::from_store(error),
                other => other,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WarehouseConfig;
    use time::macros::date;

    fn record(id: &str, day: Date, revenue: f64, user: &str) -> TransactionRecord {
        TransactionRecord {
            transaction_date: day,
            transaction_id: id.to_string(),
            revenue,
            user_id: user.to_string(),
        }
    }

    fn warehouse() -> Warehouse {
        Warehouse::open(WarehouseConfig::in_memory()).expect("open")
    }

    #[test]
    fn replace_all_discards_previous_rows() {
        let warehouse = warehouse();
        let session = SessionId::generate();

        warehouse
            .replace_all(&session, &[record("a", date!(2024 - 01 - 01), 10.0, "u1")])
            .expect("first load");
        warehouse
            .replace_all(
                &session,
                &[
                    record("b", date!(2024 - 01 - 02), 5.0, "u1"),
                    record("c", date!(2024 - 01 - 03), 7.5, "u2"),
                ],
            )
            .expect("second load");

        assert_eq!(warehouse.row_count(&session).expect("count"), 2);
        assert!(warehouse.exists(&session).expect("exists"));
    }

    #[test]
    fn replace_all_rejects_duplicate_ids_without_touching_data() {
        let warehouse = warehouse();
        let session = SessionId::generate();
        warehouse
            .replace_all(&session, &[record("a", date!(2024 - 01 - 01), 10.0, "u1")])
            .expect("seed");

        let err = warehouse
            .replace_all(
                &session,
                &[
                    record("x", date!(2024 - 01 - 01), 1.0, "u1"),
                    record("x", date!(2024 - 01 - 02), 2.0, "u2"),
                ],
            )
            .expect_err("duplicate");

        assert!(matches!(err, WarehouseError::DuplicateKey { ref transaction_id } if transaction_id == "x"));
        assert_eq!(warehouse.row_count(&session).expect("count"), 1);
    }

    #[test]
    fn append_batch_rejects_ids_already_stored() {
        let warehouse = warehouse();
        let session = SessionId::generate();
        warehouse
            .append_batch(&session, &[record("a", date!(2024 - 01 - 01), 10.0, "u1")])
            .expect("first batch");

        let err = warehouse
            .append_batch(&session, &[record("a", date!(2024 - 01 - 05), 3.0, "u2")])
            .expect_err("collision");
        assert!(matches!(err, WarehouseError::DuplicateKey { .. }));
        assert_eq!(warehouse.row_count(&session).expect("count"), 1);
    }

    #[test]
    fn overlapping_appends_of_one_batch_store_it_once() {
        let warehouse = warehouse();
        let session = SessionId::generate();
        let batch: Vec<TransactionRecord> = (0..3_000)
            .map(|index| record(&format!("tx-{index}"), date!(2024 - 01 - 01), 1.0, "u1"))
            .collect();

        let results: Vec<Result<usize, WarehouseError>> = std::thread::scope(|scope| {
            let writers: Vec<_> = (0..2)
                .map(|_| scope.spawn(|| warehouse.append_batch(&session, &batch)))
                .collect();
            writers
                .into_iter()
                .map(|writer| writer.join().expect("writer thread"))
                .collect()
        });

        let committed = results.iter().filter(|result| result.is_ok()).count();
        assert_eq!(committed, 1, "{results:?}");
        assert!(results
            .iter()
            .any(|result| matches!(result, Err(WarehouseError::DuplicateKey { .. }))));
        assert_eq!(warehouse.row_count(&session).expect("count"), 3_000);
    }

    #[test]
    fn sessions_are_isolated() {
        let warehouse = warehouse();
        let first = SessionId::generate();
        let second = SessionId::generate();

        warehouse
            .replace_all(&first, &[record("a", date!(2024 - 01 - 01), 10.0, "u1")])
            .expect("first");
        warehouse
            .replace_all(&second, &[record("a", date!(2024 - 01 - 01), 10.0, "u1")])
            .expect("same id in another session is fine");
        warehouse.clear(&first).expect("clear");

        assert_eq!(warehouse.row_count(&first).expect("count"), 0);
        assert_eq!(warehouse.row_count(&second).expect("count"), 1);
        assert!(warehouse.exists(&first).expect("still registered"));
    }

    #[test]
    fn rejects_invalid_records() {
        let today = date!(2024 - 06 - 01);
        assert!(record("a", date!(2024 - 06 - 02), 1.0, "u").validate(today).is_err());
        assert!(record("a", today, f64::NAN, "u").validate(today).is_err());
        assert!(record("a", today, -1.0, "u").validate(today).is_err());
        assert!(record(" ", today, 1.0, "u").validate(today).is_err());
        assert!(record("a", today, 1.0, "").validate(today).is_err());
        assert!(record("a", today, 0.0, "u").validate(today).is_ok());
    }

    #[test]
    fn refresh_aggregates_summarizes_session() {
        let warehouse = warehouse();
        let session = SessionId::generate();
        warehouse
            .replace_all(
                &session,
                &[
                    record("a", date!(2024 - 01 - 01), 10.25, "u1"),
                    record("b", date!(2024 - 02 - 01), 5.0, "u1"),
                    record("c", date!(2024 - 03 - 01), 4.75, "u2"),
                ],
            )
            .expect("load");

        assert!(warehouse.aggregates(&session).expect("read").is_none());
        let aggregates = warehouse.refresh_aggregates(&session).expect("refresh");
        assert_eq!(aggregates.row_count, 3);
        assert_eq!(aggregates.user_count, 2);
        assert!((aggregates.total_revenue - 20.0).abs() < 1e-9);
        assert_eq!(aggregates.first_transaction_date, Some(date!(2024 - 01 - 01)));
        assert_eq!(aggregates.last_transaction_date, Some(date!(2024 - 03 - 01)));

        // Refreshing again upserts instead of failing on the key.
        warehouse.refresh_aggregates(&session).expect("second refresh");
    }

    #[test]
    fn drop_session_unregisters() {
        let warehouse = warehouse();
        let session = SessionId::generate();
        warehouse.initialize_session(&session).expect("init");
        assert!(warehouse.exists(&session).expect("exists"));

        warehouse.drop_session(&session).expect("drop");
        assert!(!warehouse.exists(&session).expect("exists"));
    }
}
