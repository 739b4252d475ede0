//! Ingestion Pipeline.
//!
//! One upload moves through `Validating → Clearing → Writing → AggregatesStale →
//! Done`, or ends in `Failed` from validation or writing. Re-upload is always a
//! full replacement: the session is cleared before the first batch is written,
//! and the aggregate refresh only starts after every batch has committed.

use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledgerlens_warehouse::{DatasetStore, SessionId, TransactionRecord, WarehouseError};
use serde::Serialize;
use time::{Date, OffsetDateTime};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::IngestConfig;
use crate::ledger::{Ledger, RawRow};
use crate::retry::{retry_with_backoff, Exhausted, RetryConfig};
use crate::IngestError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestionState {
    #[default]
    Validating,
    Clearing,
    Writing,
    AggregatesStale,
    Done,
    Failed,
}

/// Observable progress of one upload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionProgress {
    pub state: IngestionState,
    pub rows_committed: u64,
    pub rows_total: u64,
}

/// Create a progress channel for [`IngestionPipeline`] runs.
pub fn progress_channel() -> (
    watch::Sender<IngestionProgress>,
    watch::Receiver<IngestionProgress>,
) {
    watch::channel(IngestionProgress::default())
}

/// Summary of a completed upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestionReport {
    pub session: SessionId,
    pub rows_total: u64,
    pub rows_written: u64,
    pub batches: usize,
    /// Batch attempts across all batches, including retries.
    pub attempts: u32,
    /// False when the aggregate refresh failed and summaries may be stale.
    pub aggregates_fresh: bool,
    pub elapsed_ms: u64,
}

/// Writes validated ledgers into a [`DatasetStore`].
#[derive(Clone)]
pub struct IngestionPipeline {
    store: Arc<dyn DatasetStore>,
    config: IngestConfig,
}

struct BatchOutcome {
    index: usize,
    rows: u64,
    result: Result<u32, Exhausted<WarehouseError>>,
}

impl IngestionPipeline {
    pub fn new(store: Arc<dyn DatasetStore>, config: IngestConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Validate and load a CSV file, replacing the session's dataset.
    pub async fn ingest_csv(
        &self,
        session: &SessionId,
        path: &Path,
        progress: &watch::Sender<IngestionProgress>,
    ) -> Result<IngestionReport, IngestError> {
        publish(progress, IngestionState::Validating, 0, 0);
        let path: PathBuf = path.to_path_buf();
        let max_bytes = self.config.max_upload_bytes;
        let today = today();
        let parsed = tokio::task::spawn_blocking(move || Ledger::read_csv(&path, max_bytes, today))
            .await
            .map_err(|error| IngestError::Task(error.to_string()))?;

        match parsed {
            Ok(ledger) => self.load(session, ledger, progress).await,
            Err(error) => {
                publish(progress, IngestionState::Failed, 0, 0);
                Err(error.into())
            }
        }
    }

    /// Validate and load pre-parsed rows, replacing the session's dataset.
    pub async fn ingest_rows(
        &self,
        session: &SessionId,
        rows: Vec<RawRow>,
        progress: &watch::Sender<IngestionProgress>,
    ) -> Result<IngestionReport, IngestError> {
        publish(progress, IngestionState::Validating, 0, rows.len() as u64);
        match Ledger::from_rows(rows, today()) {
            Ok(ledger) => self.load(session, ledger, progress).await,
            Err(error) => {
                publish(progress, IngestionState::Failed, 0, 0);
                Err(error.into())
            }
        }
    }

    /// Load an already validated ledger, replacing the session's dataset.
    pub async fn load(
        &self,
        session: &SessionId,
        ledger: Ledger,
        progress: &watch::Sender<IngestionProgress>,
    ) -> Result<IngestionReport, IngestError> {
        let started = Instant::now();
        let rows_total = ledger.len() as u64;
        let records: Arc<[TransactionRecord]> = ledger.into_records().into();

        publish(progress, IngestionState::Clearing, 0, rows_total);
        if let Err(error) = self.clear(session).await {
            publish(progress, IngestionState::Failed, 0, rows_total);
            return Err(error);
        }

        publish(progress, IngestionState::Writing, 0, rows_total);
        let batches = batch_ranges(records.len(), self.config.batch_size);
        let total_batches = batches.len();
        tracing::info!(
            session = %session,
            rows = rows_total,
            batches = total_batches,
            workers = self.config.workers,
            "writing ledger"
        );

        let mut outcomes = self.write_batches(session, &records, &batches, progress).await?;
        outcomes.sort_by_key(|outcome| outcome.index);

        let rows_written: u64 = outcomes
            .iter()
            .filter(|outcome| outcome.result.is_ok())
            .map(|outcome| outcome.rows)
            .sum();
        let attempts: u32 = outcomes
            .iter()
            .map(|outcome| match &outcome.result {
                Ok(attempts) => *attempts,
                Err(exhausted) => exhausted.attempts,
            })
            .sum();

        if let Some(position) = outcomes.iter().position(|outcome| outcome.result.is_err()) {
            let rows_committed: u64 = outcomes[..position].iter().map(|outcome| outcome.rows).sum();
            let failed = outcomes.swap_remove(position);
            let Err(exhausted) = failed.result else {
                return Err(IngestError::Task(String::from("failed batch lost its error")));
            };
            publish(progress, IngestionState::Failed, rows_written, rows_total);
            tracing::error!(
                session = %session,
                batch_index = failed.index,
                total_batches,
                attempts = exhausted.attempts,
                rows_committed,
                rows_written,
                error = %exhausted.error,
                "ingestion failed"
            );
            return Err(IngestError::BatchFailed {
                batch_index: failed.index,
                total_batches,
                rows_committed,
                rows_written,
                attempts: exhausted.attempts,
                source: exhausted.error,
            });
        }

        publish(progress, IngestionState::AggregatesStale, rows_written, rows_total);
        let aggregates_fresh = self.refresh_aggregates(session).await;
        publish(progress, IngestionState::Done, rows_written, rows_total);

        let report = IngestionReport {
            session: session.clone(),
            rows_total,
            rows_written,
            batches: total_batches,
            attempts,
            aggregates_fresh,
            elapsed_ms: started.elapsed().as_millis().min(u128::from(u64::MAX)) as u64,
        };
        tracing::info!(
            session = %session,
            rows = report.rows_written,
            batches = report.batches,
            attempts = report.attempts,
            aggregates_fresh,
            elapsed_ms = report.elapsed_ms,
            "ingestion completed"
        );
        Ok(report)
    }

    async fn clear(&self, session: &SessionId) -> Result<(), IngestError> {
        let store = Arc::clone(&self.store);
        let timeout = self.config.attempt_timeout;
        retry_with_backoff(&self.config.retry, "clear", |_| {
            let store = Arc::clone(&store);
            let session = session.clone();
            run_blocking(timeout, move || store.initialize_session(&session))
        })
        .await
        .map(|_| ())
        .map_err(|exhausted| IngestError::Prepare {
            session: session.clone(),
            source: exhausted.error,
        })
    }

    /// Dispatch batches to a bounded worker pool.
    ///
    /// Once any batch exhausts its attempts no further batches are dispatched;
    /// batches already in flight run to completion.
    async fn write_batches(
        &self,
        session: &SessionId,
        records: &Arc<[TransactionRecord]>,
        batches: &[Range<usize>],
        progress: &watch::Sender<IngestionProgress>,
    ) -> Result<Vec<BatchOutcome>, IngestError> {
        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut join_set = JoinSet::new();
        let mut outcomes = Vec::with_capacity(batches.len());

        for (index, range) in batches.iter().cloned().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .map_err(|error| IngestError::Task(error.to_string()))?;
            if halted.load(Ordering::SeqCst) {
                tracing::debug!(session = %session, batch_index = index, "not dispatching after failure");
                break;
            }

            let store = Arc::clone(&self.store);
            let records = Arc::clone(records);
            let session = session.clone();
            let retry = self.config.retry.clone();
            let timeout = self.config.attempt_timeout;
            let halted = Arc::clone(&halted);
            join_set.spawn(async move {
                let _permit = permit;
                let rows = range.len() as u64;
                let result = write_batch(store, &session, records, range, index, &retry, timeout).await;
                if result.is_err() {
                    halted.store(true, Ordering::SeqCst);
                }
                BatchOutcome {
                    index,
                    rows,
                    result,
                }
            });

            // Reap whatever finished so progress keeps moving while dispatching.
            while let Some(joined) = join_set.try_join_next() {
                let outcome = joined.map_err(|error| IngestError::Task(error.to_string()))?;
                record_progress(progress, &outcome);
                outcomes.push(outcome);
            }
        }

        while let Some(joined) = join_set.join_next().await {
            let outcome = joined.map_err(|error| IngestError::Task(error.to_string()))?;
            record_progress(progress, &outcome);
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Recompute session aggregates once. Failure leaves them stale.
    async fn refresh_aggregates(&self, session: &SessionId) -> bool {
        let store = Arc::clone(&self.store);
        let timeout = self.config.attempt_timeout;
        let retry = self.config.aggregate_retry();
        let refreshed = retry_with_backoff(&retry, "refresh_aggregates", |_| {
            let store = Arc::clone(&store);
            let session = session.clone();
            run_blocking(timeout, move || store.refresh_aggregates(&session))
        })
        .await;

        match refreshed {
            Ok((aggregates, _)) => {
                tracing::debug!(
                    session = %session,
                    rows = aggregates.row_count,
                    users = aggregates.user_count,
                    "aggregates refreshed"
                );
                true
            }
            Err(exhausted) => {
                tracing::warn!(
                    session = %session,
                    attempts = exhausted.attempts,
                    error = %exhausted.error,
                    "aggregate refresh failed; summaries are stale"
                );
                false
            }
        }
    }
}

async fn write_batch(
    store: Arc<dyn DatasetStore>,
    session: &SessionId,
    records: Arc<[TransactionRecord]>,
    range: Range<usize>,
    index: usize,
    retry: &RetryConfig,
    timeout: Duration,
) -> Result<u32, Exhausted<WarehouseError>> {
    retry_with_backoff(retry, "append_batch", |attempt| {
        let store = Arc::clone(&store);
        let records = Arc::clone(&records);
        let session = session.clone();
        let range = range.clone();
        tracing::trace!(session = %session, batch_index = index, attempt, "writing batch");
        run_blocking(timeout, move || store.append_batch(&session, &records[range]))
    })
    .await
    .map(|(_, attempts)| attempts)
}

/// Run a blocking store call under a caller-imposed timeout.
///
/// A blocking call cannot be cancelled, so an attempt that overruns is awaited
/// until it settles before the caller may retry. A late success counts as
/// committed; a late failure is returned as is.
async fn run_blocking<T, F>(timeout: Duration, operation: F) -> Result<T, WarehouseError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, WarehouseError> + Send + 'static,
{
    let mut handle = tokio::task::spawn_blocking(operation);
    let joined = match tokio::time::timeout(timeout, &mut handle).await {
        Ok(joined) => joined,
        Err(_) => {
            tracing::warn!(
                timeout_ms = timeout.as_millis() as u64,
                "store call exceeded its timeout; waiting for it to settle"
            );
            handle.await
        }
    };
    joined.map_err(|join_error| {
        WarehouseError::Transient(format!("store worker stopped: {join_error}"))
    })?
}

fn record_progress(progress: &watch::Sender<IngestionProgress>, outcome: &BatchOutcome) {
    if outcome.result.is_ok() {
        progress.send_modify(|current| current.rows_committed += outcome.rows);
    }
}

fn publish(
    progress: &watch::Sender<IngestionProgress>,
    state: IngestionState,
    rows_committed: u64,
    rows_total: u64,
) {
    progress.send_replace(IngestionProgress {
        state,
        rows_committed,
        rows_total,
    });
}

/// Split `len` rows into consecutive ranges of at most `batch_size`.
fn batch_ranges(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

fn today() -> Date {
    OffsetDateTime::now_utc().date()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_ranges_cover_all_rows() {
        assert_eq!(batch_ranges(2_500, 1_000), vec![0..1_000, 1_000..2_000, 2_000..2_500]);
        assert!(batch_ranges(0, 1_000).is_empty());
        assert_eq!(batch_ranges(3, 0), vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn progress_defaults_to_validating() {
        let (_sender, receiver) = progress_channel();
        assert_eq!(receiver.borrow().state, IngestionState::Validating);
    }
}
