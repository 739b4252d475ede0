//! Query Composer.
//!
//! Turns a catalog entry into one executable statement: the template's
//! dependency chain becomes an ordered list of stages (CTEs), optionally with the
//! ledger-reading stage materialized first as a scratch relation, followed by an
//! outer `SELECT` that applies the caller's date window to the requested
//! template's date column. The session id and both dates are bound parameters.

use std::sync::Arc;
use std::time::Instant;

use ::duckdb::ToSql;
use serde::Serialize;
use time::Date;

use crate::activity::{ScratchRelation, LEDGER_BODY, LEDGER_STAGE};
use crate::catalog::{Dependency, MetricCatalog};
use crate::query::execute_with_guardrails;
use crate::store::DatasetStore;
use crate::{DateRange, Granularity, QueryResult, SessionId, Warehouse, WarehouseError};

/// How the ledger-reading stage of a chain is executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Materialization {
    /// Materialize it as a connection-local temporary table, dropped after the call.
    #[default]
    ScratchTable,
    /// Inline every stage as a common table expression.
    Inline,
}

/// A named relation inside a composed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub name: String,
    pub body: String,
}

/// A fully resolved metric statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedQuery {
    metric: String,
    granularity: Granularity,
    scratch: Option<Stage>,
    stages: Vec<Stage>,
    relation: String,
    date_column: String,
    order_by: Vec<String>,
}

impl ComposedQuery {
    pub fn metric(&self) -> &str {
        &self.metric
    }

    pub fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Stage materialized before the main statement, if any.
    pub fn scratch(&self) -> Option<&Stage> {
        self.scratch.as_ref()
    }

    /// CTE stages in dependency order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Whether the main statement reads the ledger and so binds the session id.
    pub fn binds_session(&self) -> bool {
        self.stages.iter().any(|stage| stage.name == LEDGER_STAGE)
    }

    /// The main statement. Parameters: the session id when
    /// [`binds_session`](Self::binds_session), then the start and end dates.
    pub fn select_sql(&self) -> String {
        let mut sql = String::new();
        if !self.stages.is_empty() {
            let ctes = self
                .stages
                .iter()
                .map(|stage| format!("{} AS (\n{}\n)", stage.name, stage.body))
                .collect::<Vec<_>>()
                .join(",\n");
            sql.push_str("WITH ");
            sql.push_str(&ctes);
            sql.push('\n');
        }
        sql.push_str(&format!(
            "SELECT * FROM {relation}\nWHERE {column} BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)\nORDER BY {order}",
            relation = self.relation,
            column = self.date_column,
            order = self.order_by.join(", "),
        ));
        sql
    }

    /// Human-readable rendering of every statement the composer would run.
    pub fn render(&self) -> String {
        let mut rendered = String::new();
        if let Some(scratch) = &self.scratch {
            rendered.push_str(&format!(
                "-- scratch relation, dropped after the query\nCREATE TEMP TABLE {name} AS\nWITH {LEDGER_STAGE} AS (\n{LEDGER_BODY}\n)\nSELECT * FROM (\n{body}\n) AS stage;\n\n",
                name = scratch.name,
                body = scratch.body,
            ));
        }
        rendered.push_str(&self.select_sql());
        rendered.push(';');
        rendered
    }
}

/// Resolves, executes, and cleans up metric queries.
#[derive(Clone)]
pub struct Composer {
    warehouse: Warehouse,
    catalog: Arc<MetricCatalog>,
    materialization: Materialization,
}

impl Composer {
    pub fn new(warehouse: Warehouse, catalog: Arc<MetricCatalog>) -> Self {
        Self {
            warehouse,
            catalog,
            materialization: Materialization::default(),
        }
    }

    /// Composer over the standard catalog.
    pub fn standard(warehouse: Warehouse) -> Self {
        Self::new(warehouse, Arc::new(MetricCatalog::standard()))
    }

    #[must_use]
    pub fn with_materialization(mut self, materialization: Materialization) -> Self {
        self.materialization = materialization;
        self
    }

    pub fn catalog(&self) -> &MetricCatalog {
        &self.catalog
    }

    pub fn warehouse(&self) -> &Warehouse {
        &self.warehouse
    }

    pub fn materialization(&self) -> Materialization {
        self.materialization
    }

    /// Resolve `metric` at `granularity` into a statement tree.
    pub fn compose(
        &self,
        metric: &str,
        granularity: Granularity,
    ) -> Result<ComposedQuery, WarehouseError> {
        let chain = self.catalog.resolve(metric, granularity)?;
        let Some(target) = chain.last() else {
            return Err(WarehouseError::UnknownMetric {
                name: metric.to_owned(),
                granularity,
            });
        };

        let mut scratch = None;
        let mut stages = Vec::with_capacity(chain.len() + 1);
        for template in &chain {
            let stage = Stage {
                name: template.name().to_owned(),
                body: template.body().to_owned(),
            };
            match (template.dependency(), self.materialization) {
                (Dependency::Ledger, Materialization::ScratchTable) => scratch = Some(stage),
                (Dependency::Ledger, Materialization::Inline) => {
                    stages.push(Stage {
                        name: LEDGER_STAGE.to_owned(),
                        body: LEDGER_BODY.to_owned(),
                    });
                    stages.push(stage);
                }
                (Dependency::Template { .. }, _) => stages.push(stage),
            }
        }

        Ok(ComposedQuery {
            metric: metric.to_owned(),
            granularity,
            scratch,
            stages,
            relation: target.name().to_owned(),
            date_column: target.date_column().to_owned(),
            order_by: target.order_by().to_vec(),
        })
    }

    /// Render the statements for `metric` without executing them.
    pub fn explain(&self, metric: &str, granularity: Granularity) -> Result<String, WarehouseError> {
        Ok(self.compose(metric, granularity)?.render())
    }

    /// Run one metric for one session over the inclusive window `[start, end]`.
    ///
    /// A session without a materialized dataset yields an empty result.
    ///
    /// # Errors
    /// - [`WarehouseError::InvalidRange`] when `start > end`
    /// - [`WarehouseError::UnknownMetric`] when the catalog has no such template
    /// - [`WarehouseError::QueryExecution`] when the store rejects a statement
    pub fn run_metric(
        &self,
        session: &SessionId,
        metric: &str,
        granularity: Granularity,
        start: Date,
        end: Date,
    ) -> Result<QueryResult, WarehouseError> {
        let range = DateRange::new(start, end)?;
        self.run_metric_in(session, metric, granularity, range)
    }

    /// [`run_metric`](Self::run_metric) with an already validated window.
    pub fn run_metric_in(
        &self,
        session: &SessionId,
        metric: &str,
        granularity: Granularity,
        range: DateRange,
    ) -> Result<QueryResult, WarehouseError> {
        let composed = self.compose(metric, granularity)?;
        if !self.warehouse.exists(session)? {
            tracing::debug!(session = %session, metric, "session has no dataset");
            return Ok(QueryResult::empty());
        }

        let started = Instant::now();
        let connection = self.warehouse.connection()?;
        let _scratch = match composed.scratch() {
            Some(stage) => Some(ScratchRelation::materialize(
                &connection,
                &stage.name,
                metric,
                session,
                &stage.body,
            )?),
            None => None,
        };

        let session_param = session.as_str();
        let start = range.start.to_string();
        let end = range.end.to_string();
        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(3);
        if composed.binds_session() {
            params.push(&session_param);
        }
        params.push(&start);
        params.push(&end);

        let result = execute_with_guardrails(
            &connection,
            metric,
            &composed.select_sql(),
            &params,
            self.warehouse.guardrails(),
        );

        match &result {
            Ok(rows) => tracing::debug!(
                session = %session,
                metric,
                granularity = %granularity,
                rows = rows.row_count,
                truncated = rows.truncated,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "metric query completed"
            ),
            Err(error) => tracing::warn!(
                session = %session,
                metric,
                granularity = %granularity,
                %error,
                "metric query failed"
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MetricCatalogBuilder, MetricQueryTemplate, TransactionRecord, WarehouseConfig};
    use time::macros::date;

    fn record(id: &str, day: Date, revenue: f64, user: &str) -> TransactionRecord {
        TransactionRecord {
            transaction_date: day,
            transaction_id: id.to_string(),
            revenue,
            user_id: user.to_string(),
        }
    }

    fn seeded() -> (Composer, SessionId) {
        let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("open");
        let session = SessionId::generate();
        warehouse
            .replace_all(
                &session,
                &[
                    record("t1", date!(2024 - 01 - 10), 10.0, "u1"),
                    record("t2", date!(2024 - 02 - 10), 12.0, "u1"),
                    record("t3", date!(2024 - 02 - 11), 5.0, "u2"),
                    record("t4", date!(2024 - 04 - 02), 8.0, "u1"),
                ],
            )
            .expect("load");
        (Composer::standard(warehouse), session)
    }

    #[test]
    fn scratch_composition_keeps_ledger_out_of_main_statement() {
        let (composer, _) = seeded();
        let composed = composer
            .compose("user_retention", Granularity::Month)
            .expect("compose");

        assert_eq!(composed.scratch().map(|stage| stage.name.as_str()), Some("daily_activity"));
        let names: Vec<_> = composed.stages().iter().map(|stage| stage.name.as_str()).collect();
        assert_eq!(names, vec!["activity_trend", "user_retention"]);
        assert!(!composed.binds_session());
        assert!(composed.select_sql().contains("WHERE period BETWEEN CAST(? AS DATE) AND CAST(? AS DATE)"));
    }

    #[test]
    fn inline_composition_orders_stages_from_the_ledger() {
        let (composer, _) = seeded();
        let composer = composer.with_materialization(Materialization::Inline);
        let composed = composer
            .compose("cohort_ltv", Granularity::Week)
            .expect("compose");

        assert!(composed.scratch().is_none());
        let names: Vec<_> = composed.stages().iter().map(|stage| stage.name.as_str()).collect();
        assert_eq!(names, vec!["ledger", "daily_activity", "cohort_retention", "cohort_ltv"]);
        assert!(composed.binds_session());
    }

    #[test]
    fn both_materializations_agree() {
        let (composer, session) = seeded();
        let inline = composer.clone().with_materialization(Materialization::Inline);

        for name in ["activity_trend", "revenue_trend", "cohort_retention"] {
            let scratch = composer
                .run_metric(&session, name, Granularity::Month, date!(2024 - 01 - 01), date!(2024 - 12 - 31))
                .expect("scratch run");
            let inlined = inline
                .run_metric(&session, name, Granularity::Month, date!(2024 - 01 - 01), date!(2024 - 12 - 31))
                .expect("inline run");
            assert_eq!(scratch.rows, inlined.rows, "{name}");
        }
    }

    #[test]
    fn skipped_month_is_churned_then_resurrected() {
        let (composer, session) = seeded();
        let result = composer
            .run_metric(&session, "activity_trend", Granularity::Month, date!(2024 - 01 - 01), date!(2024 - 12 - 31))
            .expect("run");
        let records = result.to_records();

        let periods: Vec<_> = records.iter().map(|row| row["period"].as_str().unwrap_or_default().to_owned()).collect();
        assert_eq!(periods, vec!["2024-01-01", "2024-02-01", "2024-03-01", "2024-04-01"]);

        // January: u1 new. February: u1 retained, u2 new. March: both churned.
        // April: u1 resurrected.
        assert_eq!(records[1]["retained_users"], serde_json::json!(1));
        assert_eq!(records[1]["new_users"], serde_json::json!(1));
        assert_eq!(records[2]["churned_users"], serde_json::json!(2));
        assert_eq!(records[2]["active_users"], serde_json::json!(0));
        assert_eq!(records[3]["resurrected_users"], serde_json::json!(1));
        assert_eq!(records[3]["new_users"], serde_json::json!(0));
    }

    #[test]
    fn date_window_filters_final_relation_only() {
        let (composer, session) = seeded();
        let result = composer
            .run_metric(&session, "user_retention", Granularity::Month, date!(2024 - 03 - 01), date!(2024 - 03 - 31))
            .expect("run");

        assert_eq!(result.row_count, 1);
        let record = &result.to_records()[0];
        // Previous-month actives come from February even though it is outside the window.
        assert_eq!(record["previous_active_users"], serde_json::json!(2));
        assert_eq!(record["retention_rate"], serde_json::json!(0.0));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let (composer, session) = seeded();
        let err = composer
            .run_metric(&session, "activity_trend", Granularity::Day, date!(2024 - 02 - 01), date!(2024 - 01 - 01))
            .expect_err("inverted");
        assert!(matches!(err, WarehouseError::InvalidRange { .. }));
    }

    #[test]
    fn failing_template_does_not_leak_scratch_relation() {
        let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("open");
        let catalog = MetricCatalogBuilder::standard()
            .template(MetricQueryTemplate::new(
                "broken_metric",
                Granularity::Day,
                Dependency::template("daily_activity", Granularity::Day),
                "period",
                "SELECT no_such_column AS period FROM daily_activity",
            ))
            .build()
            .expect("catalog");
        let session = SessionId::generate();
        warehouse
            .replace_all(&session, &[record("t1", date!(2024 - 01 - 10), 10.0, "u1")])
            .expect("load");
        let composer = Composer::new(warehouse.clone(), Arc::new(catalog));

        let err = composer
            .run_metric(&session, "broken_metric", Granularity::Day, date!(2024 - 01 - 01), date!(2024 - 01 - 31))
            .expect_err("broken");
        assert!(matches!(err, WarehouseError::QueryExecution { .. }));
        assert!(warehouse.scratch_relations().expect("scratch").is_empty());
    }

    #[test]
    fn explain_renders_scratch_and_select() {
        let (composer, _) = seeded();
        let sql = composer.explain("quick_ratio", Granularity::Week).expect("explain");
        assert!(sql.contains("CREATE TEMP TABLE daily_activity"));
        assert!(sql.contains("activity_trend AS ("));
        assert!(sql.trim_end().ends_with("ORDER BY period;"));
    }
}
