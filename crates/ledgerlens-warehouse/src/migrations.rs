use ::duckdb::Connection;

struct Migration {
    version: &'static str,
    sql: &'static str,
}

// No key on `transactions`: DuckDB rejects deleting and re-inserting a key inside one
// transaction, and a full replacement does both. The store checks uniqueness inside
// each write transaction while holding the session's write lock.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: "0001_ledger_tables",
        sql: r#"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS transactions (
    session_id TEXT NOT NULL,
    transaction_id TEXT NOT NULL,
    transaction_date DATE NOT NULL,
    revenue DECIMAL(18, 2) NOT NULL,
    user_id TEXT NOT NULL,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
    Migration {
        version: "0002_indexes",
        sql: r#"
CREATE INDEX IF NOT EXISTS idx_transactions_session_date ON transactions(session_id, transaction_date);
CREATE INDEX IF NOT EXISTS idx_transactions_session_user ON transactions(session_id, user_id);
"#,
    },
    Migration {
        version: "0003_session_aggregates",
        sql: r#"
CREATE TABLE IF NOT EXISTS session_aggregates (
    session_id TEXT PRIMARY KEY,
    row_count BIGINT NOT NULL,
    user_count BIGINT NOT NULL,
    total_revenue DOUBLE NOT NULL,
    first_transaction_date DATE,
    last_transaction_date DATE,
    refreshed_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    },
];

pub fn apply_migrations(connection: &Connection) -> Result<(), ::duckdb::Error> {
    connection.execute_batch(
        r#"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version TEXT PRIMARY KEY,
    applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#,
    )?;

    for migration in MIGRATIONS {
        let applied_count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM schema_migrations WHERE version = ?",
            [migration.version],
            |row| row.get(0),
        )?;

        if applied_count == 0 {
            tracing::debug!(version = migration.version, "applying migration");
            connection.execute_batch(migration.sql)?;
            connection.execute(
                "INSERT INTO schema_migrations (version) VALUES (?)",
                [migration.version],
            )?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_are_idempotent() {
        let connection = Connection::open_in_memory().expect("connection");
        apply_migrations(&connection).expect("first run");
        apply_migrations(&connection).expect("second run");

        let applied: i64 = connection
            .query_row("SELECT COUNT(*) FROM schema_migrations", [], |row| row.get(0))
            .expect("count");
        assert_eq!(applied, MIGRATIONS.len() as i64);
    }
}
