//! SQL bodies of the standard metric templates.
//!
//! Each body is a complete `SELECT` over exactly one upstream relation, named
//! after the template it depends on. Bodies are rendered once per granularity
//! when the catalog is built.

use crate::activity::DAILY_ACTIVITY;
use crate::Granularity;

const ZERO: &str = "CAST(0 AS DOUBLE)";

/// Per-user, per-period activity classified against the previous unit.
///
/// Output columns: `period, user_id, is_active, status, revenue, new_revenue,
/// retained_revenue, expansion_revenue, contraction_revenue, resurrected_revenue,
/// churned_revenue`.
fn classified_periods(granularity: Granularity) -> String {
    if granularity == Granularity::Day {
        return format!(
            "SELECT activity_date AS period, user_id, is_active, status, revenue, new_revenue, \
             retained_revenue, expansion_revenue, contraction_revenue, resurrected_revenue, \
             churned_revenue FROM {DAILY_ACTIVITY}"
        );
    }

    let period = granularity.period_start("activity_date");
    let follows_previous = format!(
        "{} = period",
        granularity.next_period("previous_period")
    );
    let churn_period = granularity.next_period("period");

    format!(
        r#"WITH periods AS (
    SELECT user_id, {period} AS period, CAST(SUM(revenue) AS DOUBLE) AS revenue
    FROM {DAILY_ACTIVITY}
    WHERE is_active
    GROUP BY 1, 2
),
bounds AS (
    SELECT MAX(period) AS last_period FROM periods
),
sequenced AS (
    SELECT user_id, period, revenue,
           LAG(period) OVER user_periods AS previous_period,
           LAG(revenue) OVER user_periods AS previous_revenue,
           LEAD(period) OVER user_periods AS following_period
    FROM periods
    WINDOW user_periods AS (PARTITION BY user_id ORDER BY period)
)
SELECT period, user_id, TRUE AS is_active,
       CASE
           WHEN previous_period IS NULL THEN 'new'
           WHEN {follows_previous} THEN 'retained'
           ELSE 'resurrected'
       END AS status,
       revenue,
       CASE WHEN previous_period IS NULL THEN revenue ELSE {ZERO} END AS new_revenue,
       CASE WHEN {follows_previous} THEN LEAST(revenue, previous_revenue) ELSE {ZERO} END AS retained_revenue,
       CASE WHEN {follows_previous} THEN GREATEST(revenue - previous_revenue, 0) ELSE {ZERO} END AS expansion_revenue,
       CASE WHEN {follows_previous} THEN GREATEST(previous_revenue - revenue, 0) ELSE {ZERO} END AS contraction_revenue,
       CASE WHEN previous_period IS NOT NULL AND NOT ({follows_previous}) THEN revenue ELSE {ZERO} END AS resurrected_revenue,
       {ZERO} AS churned_revenue
FROM sequenced
UNION ALL
SELECT {churn_period} AS period, user_id, FALSE AS is_active, 'churned' AS status,
       {ZERO} AS revenue, {ZERO} AS new_revenue, {ZERO} AS retained_revenue,
       {ZERO} AS expansion_revenue, {ZERO} AS contraction_revenue,
       {ZERO} AS resurrected_revenue, revenue AS churned_revenue
FROM sequenced, bounds
WHERE (following_period IS NULL OR following_period <> {churn_period})
  AND {churn_period} <= bounds.last_period"#
    )
}

pub(crate) fn activity_trend(granularity: Granularity) -> String {
    let classified = classified_periods(granularity);
    format!(
        r#"WITH classified AS (
{classified}
)
SELECT period,
       CAST(COUNT(*) FILTER (WHERE is_active) AS BIGINT) AS active_users,
       CAST(COUNT(*) FILTER (WHERE status = 'new') AS BIGINT) AS new_users,
       CAST(COUNT(*) FILTER (WHERE status = 'retained') AS BIGINT) AS retained_users,
       CAST(COUNT(*) FILTER (WHERE status = 'resurrected') AS BIGINT) AS resurrected_users,
       CAST(COUNT(*) FILTER (WHERE status = 'churned') AS BIGINT) AS churned_users
FROM classified
GROUP BY period"#
    )
}

pub(crate) fn revenue_trend(granularity: Granularity) -> String {
    let classified = classified_periods(granularity);
    format!(
        r#"WITH classified AS (
{classified}
)
SELECT period,
       CAST(SUM(revenue) AS DOUBLE) AS revenue,
       CAST(SUM(new_revenue) AS DOUBLE) AS new_revenue,
       CAST(SUM(retained_revenue) AS DOUBLE) AS retained_revenue,
       CAST(SUM(expansion_revenue) AS DOUBLE) AS expansion_revenue,
       CAST(SUM(resurrected_revenue) AS DOUBLE) AS resurrected_revenue,
       CAST(SUM(contraction_revenue) AS DOUBLE) AS contraction_revenue,
       CAST(SUM(churned_revenue) AS DOUBLE) AS churned_revenue
FROM classified
GROUP BY period"#
    )
}

/// Everyone active in the previous unit is either retained or churned now.
pub(crate) fn user_retention() -> String {
    String::from(
        r#"SELECT period, active_users,
       retained_users + churned_users AS previous_active_users,
       retained_users, churned_users,
       CASE
           WHEN retained_users + churned_users = 0 THEN NULL
           ELSE CAST(retained_users AS DOUBLE) * 100 / (retained_users + churned_users)
       END AS retention_rate
FROM activity_trend"#,
    )
}

pub(crate) fn revenue_retention() -> String {
    String::from(
        r#"WITH base AS (
    SELECT period, revenue, retained_revenue, expansion_revenue,
           retained_revenue + contraction_revenue + churned_revenue AS previous_revenue
    FROM revenue_trend
)
SELECT period, revenue, previous_revenue, retained_revenue, expansion_revenue,
       CASE WHEN previous_revenue = 0 THEN NULL
            ELSE retained_revenue * 100 / previous_revenue END AS revenue_retention_rate,
       CASE WHEN previous_revenue = 0 THEN NULL
            ELSE (retained_revenue + expansion_revenue) * 100 / previous_revenue END AS net_revenue_retention_rate
FROM base"#,
    )
}

pub(crate) fn quick_ratio() -> String {
    String::from(
        r#"SELECT period, new_users, resurrected_users, churned_users,
       CASE WHEN churned_users = 0 THEN NULL
            ELSE CAST(new_users + resurrected_users AS DOUBLE) / churned_users END AS quick_ratio
FROM activity_trend"#,
    )
}

pub(crate) fn revenue_quick_ratio() -> String {
    String::from(
        r#"SELECT period, new_revenue, resurrected_revenue, expansion_revenue,
       contraction_revenue, churned_revenue,
       CASE WHEN churned_revenue + contraction_revenue = 0 THEN NULL
            ELSE (new_revenue + resurrected_revenue + expansion_revenue)
                 / (churned_revenue + contraction_revenue) END AS quick_ratio
FROM revenue_trend"#,
    )
}

/// Dense cohort matrix: one row per cohort and offset up to the last data period.
pub(crate) fn cohort_retention(granularity: Granularity) -> String {
    let period = granularity.period_start("activity_date");
    let span = granularity.periods_between("cohort_start", "last_period");
    let offset = granularity.periods_between("firsts.cohort_start", "periods.period");

    format!(
        r#"WITH periods AS (
    SELECT user_id, {period} AS period, CAST(SUM(revenue) AS DOUBLE) AS revenue
    FROM {DAILY_ACTIVITY}
    WHERE is_active
    GROUP BY 1, 2
),
firsts AS (
    SELECT user_id, MIN(period) AS cohort_start FROM periods GROUP BY user_id
),
cohorts AS (
    SELECT cohort_start, CAST(COUNT(*) AS BIGINT) AS cohort_num_users
    FROM firsts GROUP BY cohort_start
),
bounds AS (
    SELECT MAX(period) AS last_period FROM periods
),
grid AS (
    SELECT cohort_start, cohort_num_users,
           UNNEST(generate_series(0, {span})) AS periods_since_first
    FROM cohorts, bounds
),
observed AS (
    SELECT firsts.cohort_start,
           CAST({offset} AS BIGINT) AS periods_since_first,
           CAST(COUNT(DISTINCT periods.user_id) AS BIGINT) AS users,
           CAST(SUM(periods.revenue) AS DOUBLE) AS revenue
    FROM periods JOIN firsts ON periods.user_id = firsts.user_id
    GROUP BY 1, 2
)
SELECT grid.cohort_start, grid.periods_since_first, grid.cohort_num_users,
       COALESCE(observed.users, 0) AS users,
       CAST(COALESCE(observed.users, 0) AS DOUBLE) / grid.cohort_num_users AS retention_rate,
       COALESCE(observed.revenue, {ZERO}) AS revenue
FROM grid
LEFT JOIN observed
  ON observed.cohort_start = grid.cohort_start
 AND observed.periods_since_first = grid.periods_since_first"#
    )
}

/// Cumulative revenue per original cohort member.
pub(crate) fn cohort_ltv() -> String {
    String::from(
        r#"WITH running AS (
    SELECT cohort_start, periods_since_first, cohort_num_users, revenue,
           SUM(revenue) OVER (
               PARTITION BY cohort_start
               ORDER BY periods_since_first
               ROWS BETWEEN UNBOUNDED PRECEDING AND CURRENT ROW
           ) AS cumulative_revenue
    FROM cohort_retention
)
SELECT cohort_start, periods_since_first, cohort_num_users, revenue,
       CAST(cumulative_revenue AS DOUBLE) AS cumulative_revenue,
       CAST(cumulative_revenue AS DOUBLE) / cohort_num_users AS ltv
FROM running"#,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn daily_classification_reads_daily_activity_directly() {
        let sql = classified_periods(Granularity::Day);
        assert!(sql.contains("FROM daily_activity"));
        assert!(!sql.contains("LAG("));
    }

    #[test]
    fn monthly_classification_compares_adjacent_months() {
        let sql = activity_trend(Granularity::Month);
        assert!(sql.contains("date_trunc('month', activity_date)"));
        assert!(sql.contains("INTERVAL 1 MONTH"));
    }

    #[test]
    fn weekly_cohorts_count_whole_weeks() {
        let sql = cohort_retention(Granularity::Week);
        assert!(sql.contains("date_diff('day', cohort_start, last_period) / 7"));
    }
}
