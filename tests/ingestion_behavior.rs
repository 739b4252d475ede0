//! Behavior-driven tests for ledger ingestion
//!
//! These tests verify WHAT a user observes when uploading ledgers: full
//! replacement on re-upload, partial-failure reporting, progress, and the
//! session events that accompany each outcome.

use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledgerlens_core::{
    progress_channel, ChannelEventSink, CoreError, DatasetStore, IngestConfig, IngestError,
    IngestionPipeline, IngestionState, RawRow, RetryConfig, SessionAggregates, SessionEvent,
    SessionId, SessionManager, TransactionRecord, ValidationError, Warehouse, WarehouseConfig,
    WarehouseError,
};
use tempfile::tempdir;

fn rows(count: usize) -> Vec<RawRow> {
    (0..count)
        .map(|index| {
            RawRow::new(
                format!("2024-{:02}-{:02}", index % 12 + 1, index % 28 + 1),
                format!("tx-{index}"),
                format!("{}.50", index % 40),
                format!("user-{}", index % 37),
            )
        })
        .collect()
}

fn fast_config(workers: usize) -> IngestConfig {
    IngestConfig {
        batch_size: 1_000,
        workers,
        retry: RetryConfig::fixed(Duration::from_millis(1), 2),
        aggregate_refresh_retries: 1,
        ..IngestConfig::default()
    }
}

/// Delegates to a real warehouse but fails chosen operations with transient errors.
struct FlakyStore {
    inner: Warehouse,
    failing_batch_first_id: Option<String>,
    slow_batch_first_id: Option<String>,
    fail_refresh: bool,
    append_calls: AtomicU32,
}

impl FlakyStore {
    fn new(inner: Warehouse) -> Self {
        Self {
            inner,
            failing_batch_first_id: None,
            slow_batch_first_id: None,
            fail_refresh: false,
            append_calls: AtomicU32::new(0),
        }
    }
}

impl DatasetStore for FlakyStore {
    fn initialize_session(&self, session: &SessionId) -> Result<(), WarehouseError> {
        self.inner.initialize_session(session)
    }

    fn replace_all(
        &self,
        session: &SessionId,
        records: &[TransactionRecord],
    ) -> Result<usize, WarehouseError> {
        self.inner.replace_all(session, records)
    }

    fn append_batch(
        &self,
        session: &SessionId,
        records: &[TransactionRecord],
    ) -> Result<usize, WarehouseError> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);
        let first = records.first().map(|record| record.transaction_id.as_str());
        if first.is_some() && first == self.failing_batch_first_id.as_deref() {
            return Err(WarehouseError::Transient(String::from("simulated lock conflict")));
        }
        if first.is_some() && first == self.slow_batch_first_id.as_deref() {
            std::thread::sleep(Duration::from_millis(200));
        }
        self.inner.append_batch(session, records)
    }

    fn clear(&self, session: &SessionId) -> Result<(), WarehouseError> {
        self.inner.clear(session)
    }

    fn exists(&self, session: &SessionId) -> Result<bool, WarehouseError> {
        self.inner.exists(session)
    }

    fn row_count(&self, session: &SessionId) -> Result<u64, WarehouseError> {
        self.inner.row_count(session)
    }

    fn refresh_aggregates(&self, session: &SessionId) -> Result<SessionAggregates, WarehouseError> {
        if self.fail_refresh {
            return Err(WarehouseError::Transient(String::from("simulated refresh timeout")));
        }
        self.inner.refresh_aggregates(session)
    }

    fn aggregates(&self, session: &SessionId) -> Result<Option<SessionAggregates>, WarehouseError> {
        self.inner.aggregates(session)
    }

    fn drop_session(&self, session: &SessionId) -> Result<(), WarehouseError> {
        self.inner.drop_session(session)
    }
}

// =============================================================================
// Ingestion: Full Replacement
// =============================================================================

#[tokio::test]
async fn when_user_reuploads_a_smaller_ledger_only_the_new_rows_remain() {
    // Given: A session on an on-disk warehouse holding a 100-row upload
    let temp = tempdir().expect("tempdir");
    let warehouse =
        Warehouse::open(WarehouseConfig::at_path(temp.path().join("warehouse.duckdb")))
            .expect("warehouse open");
    let manager = SessionManager::new(warehouse, IngestConfig::default());
    let session = manager.create_session().await.expect("create session");
    manager
        .ingest_rows(&session, rows(100), None)
        .await
        .expect("first upload");

    // When: The user uploads a 50-row ledger
    let report = manager
        .ingest_rows(&session, rows(50), None)
        .await
        .expect("second upload");

    // Then: Exactly the 50 new rows are stored and the summary reflects them
    assert_eq!(report.rows_written, 50);
    let status = manager.status(&session).await.expect("status");
    assert_eq!(status.row_count, 50);
    assert_eq!(status.aggregates.map(|aggregates| aggregates.row_count), Some(50));
}

#[tokio::test]
async fn when_upload_is_invalid_the_previous_dataset_is_untouched() {
    // Given: A session with three rows
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let manager = SessionManager::new(warehouse, IngestConfig::default());
    let session = manager.create_session().await.expect("create session");
    manager
        .ingest_rows(&session, rows(3), None)
        .await
        .expect("first upload");

    // When: The next upload repeats a transaction id
    let err = manager
        .ingest_rows(
            &session,
            vec![
                RawRow::new("2024-01-01", "dup", "1", "a"),
                RawRow::new("2024-01-02", "dup", "2", "b"),
            ],
            None,
        )
        .await
        .expect_err("duplicate ids are rejected");

    // Then: Validation names the row and nothing was cleared
    assert!(matches!(
        err,
        CoreError::Ingest(IngestError::Validation(ValidationError::DuplicateKey { row: 2, .. }))
    ));
    let status = manager.status(&session).await.expect("status");
    assert_eq!(status.row_count, 3);
}

#[tokio::test]
async fn user_can_upload_a_csv_file_with_extra_columns() {
    // Given: A CSV export with an unrelated column and mixed header case
    let temp = tempdir().expect("tempdir");
    let path = temp.path().join("ledger.csv");
    fs::write(
        &path,
        "Date,ID,Revenue,User_Id,Plan\n\
         2024-01-03,tx-1,10.00,u1,pro\n\
         2024-01-04T09:00:00Z,tx-2,5.25,u2,free\n\
         2024-02-01,tx-3,7.75,u1,pro\n",
    )
    .expect("write csv");
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let manager = SessionManager::new(warehouse, IngestConfig::default());
    let session = manager.create_session().await.expect("create session");

    // When: The user uploads it
    let report = manager
        .ingest_csv(&session, &path, None)
        .await
        .expect("csv upload");

    // Then: All rows land and the summary is fresh
    assert_eq!(report.rows_total, 3);
    assert_eq!(report.rows_written, 3);
    assert!(report.aggregates_fresh);
    let aggregates = manager
        .status(&session)
        .await
        .expect("status")
        .aggregates
        .expect("aggregates");
    assert_eq!(aggregates.user_count, 2);
    assert!((aggregates.total_revenue - 23.0).abs() < 1e-9);
}

// =============================================================================
// Ingestion: Partial Failure
// =============================================================================

#[tokio::test]
async fn when_third_batch_keeps_failing_the_committed_prefix_is_reported() {
    // Given: A 10-batch ledger and a store that always fails the third batch
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let mut store = FlakyStore::new(warehouse.clone());
    store.failing_batch_first_id = Some(String::from("tx-2000"));
    let store = Arc::new(store);
    let pipeline = IngestionPipeline::new(store.clone(), fast_config(1));
    let session = SessionId::generate();
    let (progress, receiver) = progress_channel();

    // When: The ledger is ingested with one worker
    let err = pipeline
        .ingest_rows(&session, rows(10_000), &progress)
        .await
        .expect_err("batch 2 exhausts its attempts");

    // Then: The failure names batch index 2 of 10 with 2000 committed rows
    match &err {
        IngestError::BatchFailed {
            batch_index,
            total_batches,
            rows_committed,
            rows_written,
            attempts,
            source,
        } => {
            assert_eq!(*batch_index, 2);
            assert_eq!(*total_batches, 10);
            assert_eq!(*rows_committed, 2_000);
            assert_eq!(*rows_written, 2_000);
            assert_eq!(*attempts, 3);
            assert!(source.is_transient());
        }
        other => panic!("expected BatchFailed, got {other:?}"),
    }
    assert_eq!(err.rows_committed(), 2_000);

    // And: No batch after the failure was dispatched and committed rows stay
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 2 + 3);
    assert_eq!(warehouse.row_count(&session).expect("row count"), 2_000);
    assert_eq!(receiver.borrow().state, IngestionState::Failed);
}

#[tokio::test]
async fn with_parallel_workers_the_reported_prefix_is_still_contiguous() {
    // Given: Four workers and a store that always fails the third batch
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let mut store = FlakyStore::new(warehouse.clone());
    store.failing_batch_first_id = Some(String::from("tx-2000"));
    let pipeline = IngestionPipeline::new(Arc::new(store), fast_config(4));
    let session = SessionId::generate();
    let (progress, _receiver) = progress_channel();

    // When: The ledger is ingested
    let err = pipeline
        .ingest_rows(&session, rows(10_000), &progress)
        .await
        .expect_err("batch 2 exhausts its attempts");

    // Then: rows_committed counts only batches before the failure
    let IngestError::BatchFailed {
        batch_index,
        rows_committed,
        rows_written,
        ..
    } = err
    else {
        panic!("expected BatchFailed");
    };
    assert_eq!(batch_index, 2);
    assert_eq!(rows_committed, 2_000);
    assert!(rows_written >= rows_committed);
    assert_eq!(rows_written % 1_000, 0);
    assert_eq!(warehouse.row_count(&session).expect("row count"), rows_written);
}

#[tokio::test]
async fn when_aggregate_refresh_fails_the_upload_still_succeeds() {
    // Given: A store whose summary refresh always times out
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let mut store = FlakyStore::new(warehouse.clone());
    store.fail_refresh = true;
    let pipeline = IngestionPipeline::new(Arc::new(store), fast_config(2));
    let session = SessionId::generate();
    let (progress, receiver) = progress_channel();

    // When: A valid ledger is ingested
    let report = pipeline
        .ingest_rows(&session, rows(2_500), &progress)
        .await
        .expect("rows are committed");

    // Then: Every row is stored but the summary is reported stale
    assert_eq!(report.rows_written, 2_500);
    assert_eq!(report.batches, 3);
    assert!(!report.aggregates_fresh);
    assert_eq!(warehouse.row_count(&session).expect("row count"), 2_500);
    let progress = *receiver.borrow();
    assert_eq!(progress.state, IngestionState::Done);
    assert_eq!(progress.rows_committed, 2_500);
    assert_eq!(progress.rows_total, 2_500);
}

#[tokio::test]
async fn slow_batch_is_awaited_instead_of_written_twice() {
    // Given: A store that takes far longer than the attempt timeout on the second batch
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let mut store = FlakyStore::new(warehouse.clone());
    store.slow_batch_first_id = Some(String::from("tx-1000"));
    let store = Arc::new(store);
    let config = IngestConfig {
        attempt_timeout: Duration::from_millis(20),
        ..fast_config(2)
    };
    let pipeline = IngestionPipeline::new(store.clone(), config);
    let session = SessionId::generate();
    let (progress, _receiver) = progress_channel();

    // When: The ledger is ingested
    let report = pipeline
        .ingest_rows(&session, rows(3_000), &progress)
        .await
        .expect("slow batch still commits");

    // Then: No second attempt overlapped the slow one and every id is stored once
    assert_eq!(store.append_calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.attempts, 3);
    assert_eq!(report.rows_written, 3_000);
    assert_eq!(warehouse.row_count(&session).expect("row count"), 3_000);
}

// =============================================================================
// Ingestion: Session Events
// =============================================================================

#[tokio::test]
async fn session_lifecycle_is_announced_to_event_sinks() {
    // Given: A manager with a channel sink
    let warehouse = Warehouse::open(WarehouseConfig::in_memory()).expect("warehouse open");
    let (sink, mut events) = ChannelEventSink::new();
    let manager =
        SessionManager::new(warehouse, IngestConfig::default()).with_event_sink(Arc::new(sink));

    // When: The user creates a session, uploads, fails an upload, and clears it
    let session = manager.create_session().await.expect("create session");
    manager
        .ingest_rows(&session, rows(10), None)
        .await
        .expect("upload");
    manager
        .ingest_rows(&session, vec![RawRow::new("not-a-date", "x", "1", "u")], None)
        .await
        .expect_err("invalid date");
    manager.clear_session(&session).await.expect("clear");

    // Then: Each step emitted exactly one event, in order
    let received: Vec<SessionEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
    let names: Vec<&str> = received.iter().map(SessionEvent::name).collect();
    assert_eq!(
        names,
        vec!["session_created", "ingestion_completed", "ingestion_failed", "data_cleared"]
    );
    assert!(matches!(received[1], SessionEvent::IngestionCompleted { rows: 10, .. }));
    assert!(received.iter().all(|event| event.session() == &session));

    // And: Clearing kept the session but removed its rows
    let status = manager.status(&session).await.expect("status");
    assert!(status.exists);
    assert_eq!(status.row_count, 0);
}
