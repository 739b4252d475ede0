//! The analysis workbook: every growth metric for one granularity.

use ledgerlens_warehouse::{
    Composer, DateRange, Granularity, MetricFamily, QueryResult, SessionId, WarehouseError,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::JoinSet;

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::CoreError;

/// One metric's rows within a workbook.
#[derive(Debug, Clone, Serialize)]
pub struct WorkbookSheet {
    pub family: MetricFamily,
    pub result: QueryResult,
}

/// Results of [`MetricFamily::WORKBOOK`] for one session, granularity, and window.
#[derive(Debug, Clone, Serialize)]
pub struct Workbook {
    pub session: SessionId,
    pub granularity: Granularity,
    pub range: DateRange,
    pub sheets: Vec<WorkbookSheet>,
}

impl Workbook {
    /// Run every workbook metric concurrently.
    ///
    /// Transient store errors are retried per metric; the first permanent error
    /// aborts the remaining queries.
    pub async fn compute(
        composer: &Composer,
        session: &SessionId,
        granularity: Granularity,
        range: DateRange,
        retry: &RetryConfig,
    ) -> Result<Self, CoreError> {
        let mut join_set = JoinSet::new();
        for (position, family) in MetricFamily::WORKBOOK.into_iter().enumerate() {
            let composer = composer.clone();
            let session = session.clone();
            let retry = retry.clone();
            join_set.spawn(async move {
                let result = retry_with_backoff(&retry, family.as_str(), |_| {
                    let composer = composer.clone();
                    let session = session.clone();
                    async move {
                        tokio::task::spawn_blocking(move || {
                            composer.run_metric_in(&session, family.as_str(), granularity, range)
                        })
                        .await
                        .map_err(|error| WarehouseError::Transient(error.to_string()))?
                    }
                })
                .await;
                (position, family, result)
            });
        }

        let mut slots: Vec<Option<WorkbookSheet>> = vec![None; MetricFamily::WORKBOOK.len()];
        while let Some(joined) = join_set.join_next().await {
            let (position, family, result) = joined.map_err(|error| CoreError::Task(error.to_string()))?;
            match result {
                Ok((rows, _)) => slots[position] = Some(WorkbookSheet { family, result: rows }),
                Err(exhausted) => {
                    join_set.abort_all();
                    return Err(exhausted.error.into());
                }
            }
        }

        let sheets = slots.into_iter().flatten().collect();
        tracing::info!(session = %session, granularity = %granularity, "workbook computed");
        Ok(Self {
            session: session.clone(),
            granularity,
            range,
            sheets,
        })
    }

    pub fn get(&self, family: MetricFamily) -> Option<&QueryResult> {
        self.sheets
            .iter()
            .find(|sheet| sheet.family == family)
            .map(|sheet| &sheet.result)
    }

    /// Render as one JSON object keyed by metric name.
    pub fn to_json(&self) -> Value {
        let metrics: serde_json::Map<String, Value> = self
            .sheets
            .iter()
            .map(|sheet| {
                (
                    sheet.family.as_str().to_owned(),
                    Value::Array(sheet.result.to_records().into_iter().map(Value::Object).collect()),
                )
            })
            .collect();

        json!({
            "session": self.session,
            "granularity": self.granularity,
            "start": self.range.start.to_string(),
            "end": self.range.end.to_string(),
            "metrics": metrics,
        })
    }
}
