//! Derived Aggregate Builder.
//!
//! Daily activity has one row per `(user_id, activity_date)` where the user
//! transacted, classified against the user's previous active day, plus one churn
//! marker row on the day after a user's activity stops. Churn markers never fall
//! after the last transaction date of the dataset.
//!
//! The relation is pure derived state: it is rebuilt from the session's ledger
//! each time it is needed and dropped right after use.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use ::duckdb::Connection;
use serde::Serialize;
use time::Date;

use crate::store::DatasetStore;
use crate::{SessionId, Warehouse, WarehouseError};

/// Name of the stage that scopes the shared ledger to one session.
pub const LEDGER_STAGE: &str = "ledger";

/// Name of the daily activity relation.
pub const DAILY_ACTIVITY: &str = "daily_activity";

/// Session-scoped ledger. The single `?` binds the session id.
pub(crate) const LEDGER_BODY: &str = "SELECT transaction_date, transaction_id, \
CAST(revenue AS DOUBLE) AS revenue, user_id \
FROM transactions WHERE session_id = ?";

/// Body of the daily activity stage. Reads from [`LEDGER_STAGE`].
pub(crate) const DAILY_ACTIVITY_BODY: &str = r#"WITH per_day AS (
    SELECT user_id, transaction_date AS activity_date,
           CAST(SUM(revenue) AS DOUBLE) AS revenue,
           CAST(COUNT(*) AS BIGINT) AS transactions
    FROM ledger
    GROUP BY user_id, transaction_date
),
bounds AS (
    SELECT MAX(activity_date) AS last_date FROM per_day
),
sequenced AS (
    SELECT user_id, activity_date, revenue, transactions,
           MIN(activity_date) OVER (PARTITION BY user_id) AS first_day,
           LAG(activity_date) OVER user_days AS previous_date,
           LAG(revenue) OVER user_days AS previous_revenue,
           LEAD(activity_date) OVER user_days AS next_date
    FROM per_day
    WINDOW user_days AS (PARTITION BY user_id ORDER BY activity_date)
)
SELECT user_id, activity_date, revenue, transactions, first_day,
       TRUE AS is_active,
       CASE
           WHEN previous_date IS NULL THEN 'new'
           WHEN CAST(previous_date + 1 AS DATE) = activity_date THEN 'retained'
           ELSE 'resurrected'
       END AS status,
       CASE WHEN previous_date IS NULL THEN revenue ELSE CAST(0 AS DOUBLE) END AS new_revenue,
       CASE WHEN CAST(previous_date + 1 AS DATE) = activity_date
            THEN LEAST(revenue, previous_revenue) ELSE CAST(0 AS DOUBLE) END AS retained_revenue,
       CASE WHEN CAST(previous_date + 1 AS DATE) = activity_date
            THEN GREATEST(revenue - previous_revenue, 0) ELSE CAST(0 AS DOUBLE) END AS expansion_revenue,
       CASE WHEN CAST(previous_date + 1 AS DATE) = activity_date
            THEN GREATEST(previous_revenue - revenue, 0) ELSE CAST(0 AS DOUBLE) END AS contraction_revenue,
       CASE WHEN previous_date IS NOT NULL AND CAST(previous_date + 1 AS DATE) <> activity_date
            THEN revenue ELSE CAST(0 AS DOUBLE) END AS resurrected_revenue,
       CAST(0 AS DOUBLE) AS churned_revenue
FROM sequenced
UNION ALL
SELECT user_id, CAST(activity_date + 1 AS DATE) AS activity_date,
       CAST(0 AS DOUBLE) AS revenue, CAST(0 AS BIGINT) AS transactions, first_day,
       FALSE AS is_active, 'churned' AS status,
       CAST(0 AS DOUBLE) AS new_revenue, CAST(0 AS DOUBLE) AS retained_revenue,
       CAST(0 AS DOUBLE) AS expansion_revenue, CAST(0 AS DOUBLE) AS contraction_revenue,
       CAST(0 AS DOUBLE) AS resurrected_revenue, revenue AS churned_revenue
FROM sequenced, bounds
WHERE (next_date IS NULL OR next_date <> CAST(activity_date + 1 AS DATE))
  AND CAST(activity_date + 1 AS DATE) <= bounds.last_date"#;

/// Classification of a user's day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    New,
    Retained,
    Resurrected,
    Churned,
}

impl ActivityStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Retained => "retained",
            Self::Resurrected => "resurrected",
            Self::Churned => "churned",
        }
    }
}

impl Display for ActivityStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActivityStatus {
    type Err = WarehouseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "new" => Ok(Self::New),
            "retained" => Ok(Self::Retained),
            "resurrected" => Ok(Self::Resurrected),
            "churned" => Ok(Self::Churned),
            other => Err(WarehouseError::Catalog(format!(
                "unexpected activity status '{other}'"
            ))),
        }
    }
}

/// One row of daily activity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyActivityRow {
    pub user_id: String,
    pub activity_date: Date,
    pub revenue: f64,
    pub transactions: u64,
    pub first_day: Date,
    pub is_active: bool,
    pub status: ActivityStatus,
    pub new_revenue: f64,
    pub retained_revenue: f64,
    pub expansion_revenue: f64,
    pub contraction_revenue: f64,
    pub resurrected_revenue: f64,
    pub churned_revenue: f64,
}

/// A connection-local temporary relation dropped when the guard goes out of scope.
pub(crate) struct ScratchRelation<'c> {
    connection: &'c Connection,
    name: String,
}

impl<'c> ScratchRelation<'c> {
    /// Materialize `SELECT * FROM (body)` as a temporary table named `name`.
    ///
    /// The guard is armed before the table is created so a failed or partial
    /// creation is cleaned up as well.
    pub(crate) fn materialize(
        connection: &'c Connection,
        name: &str,
        metric: &str,
        session: &SessionId,
        body: &str,
    ) -> Result<Self, WarehouseError> {
        let guard = Self {
            connection,
            name: name.to_owned(),
        };
        let sql = format!(
            "CREATE OR REPLACE TEMP TABLE {name} AS \
             WITH {LEDGER_STAGE} AS ({LEDGER_BODY}) \
             SELECT * FROM ({body}) AS stage"
        );
        connection
            .execute(&sql, [session.as_str()])
            .map_err(|source| WarehouseError::QueryExecution {
                metric: metric.to_owned(),
                source,
            })?;
        tracing::trace!(relation = name, session = %session, "materialized scratch relation");
        Ok(guard)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ScratchRelation<'_> {
    fn drop(&mut self) {
        let sql = format!("DROP TABLE IF EXISTS {}", self.name);
        if let Err(error) = self.connection.execute_batch(&sql) {
            tracing::warn!(relation = %self.name, %error, "failed to drop scratch relation");
        }
    }
}

/// Build daily activity for `session` and read it ordered by user and date.
///
/// A session that was never materialized has no activity.
pub fn build_daily_activity(
    warehouse: &Warehouse,
    session: &SessionId,
) -> Result<Vec<DailyActivityRow>, WarehouseError> {
    if !warehouse.exists(session)? {
        return Ok(Vec::new());
    }

    let connection = warehouse.connection()?;
    let scratch = ScratchRelation::materialize(
        &connection,
        DAILY_ACTIVITY,
        DAILY_ACTIVITY,
        session,
        DAILY_ACTIVITY_BODY,
    )?;

    let sql = format!(
        "SELECT user_id, CAST(activity_date AS VARCHAR), revenue, transactions, \
         CAST(first_day AS VARCHAR), is_active, status, new_revenue, retained_revenue, \
         expansion_revenue, contraction_revenue, resurrected_revenue, churned_revenue \
         FROM {} ORDER BY user_id, activity_date, is_active DESC",
        scratch.name()
    );
    let mut statement = connection.prepare(&sql)?;
    let mut rows = statement.query([])?;
    let mut output = Vec::new();
    while let Some(row) = rows.next()? {
        let activity_date: String = row.get(1)?;
        let first_day: String = row.get(4)?;
        let transactions: i64 = row.get(3)?;
        let status: String = row.get(6)?;
        output.push(DailyActivityRow {
            user_id: row.get(0)?,
            activity_date: parse_date(&activity_date)?,
            revenue: row.get(2)?,
            transactions: u64::try_from(transactions).unwrap_or_default(),
            first_day: parse_date(&first_day)?,
            is_active: row.get(5)?,
            status: status.parse()?,
            new_revenue: row.get(7)?,
            retained_revenue: row.get(8)?,
            expansion_revenue: row.get(9)?,
            contraction_revenue: row.get(10)?,
            resurrected_revenue: row.get(11)?,
            churned_revenue: row.get(12)?,
        });
    }

    Ok(output)
}

fn parse_date(value: &str) -> Result<Date, WarehouseError> {
    Date::parse(value, time::macros::format_description!("[year]-[month]-[day]")).map_err(|error| {
        WarehouseError::Catalog(format!("unexpected date '{value}' in daily activity: {error}"))
    })
}
