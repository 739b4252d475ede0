//! Session lifecycle: create, load, query, clear, and end.
//!
//! Operations on one session are serialized; different sessions proceed
//! concurrently.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use ledgerlens_warehouse::{
    Composer, DatasetStore, DateRange, Granularity, QueryResult, SessionAggregates, SessionId,
    Warehouse, WarehouseError,
};
use serde::Serialize;
use tokio::sync::watch;
use time::Date;

use crate::config::IngestConfig;
use crate::events::{EventSink, SessionEvent, TracingEventSink};
use crate::ingest::{progress_channel, IngestionPipeline, IngestionProgress, IngestionReport};
use crate::ledger::RawRow;
use crate::retry::retry_with_backoff;
use crate::workbook::Workbook;
use crate::{CoreError, IngestError};

/// Current state of one session's dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub session: SessionId,
    pub exists: bool,
    pub row_count: u64,
    pub aggregates: Option<SessionAggregates>,
}

type SessionLock = Arc<tokio::sync::Mutex<()>>;

/// Entry point tying the store, pipeline, and composer to session events.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn DatasetStore>,
    composer: Composer,
    pipeline: IngestionPipeline,
    config: IngestConfig,
    sink: Arc<dyn EventSink>,
    locks: Arc<Mutex<HashMap<SessionId, SessionLock>>>,
}

impl SessionManager {
    pub fn new(warehouse: Warehouse, config: IngestConfig) -> Self {
        let store: Arc<dyn DatasetStore> = Arc::new(warehouse.clone());
        Self {
            pipeline: IngestionPipeline::new(Arc::clone(&store), config.clone()),
            composer: Composer::standard(warehouse),
            store,
            config,
            sink: Arc::new(TracingEventSink),
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    #[must_use]
    pub fn with_composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Register a new, empty session.
    pub async fn create_session(&self) -> Result<SessionId, CoreError> {
        let session = SessionId::generate();
        let _guard = self.lock(&session).await;
        self.blocking({
            let session = session.clone();
            move |store: &dyn DatasetStore| store.initialize_session(&session)
        })
        .await?;
        self.sink.emit(&SessionEvent::SessionCreated {
            session: session.clone(),
        });
        Ok(session)
    }

    /// Load a CSV upload, replacing the session's dataset.
    pub async fn ingest_csv(
        &self,
        session: &SessionId,
        path: &Path,
        progress: Option<&watch::Sender<IngestionProgress>>,
    ) -> Result<IngestionReport, CoreError> {
        let _guard = self.lock(session).await;
        let (fallback, _receiver) = progress_channel();
        let progress = progress.unwrap_or(&fallback);
        let outcome = self.pipeline.ingest_csv(session, path, progress).await;
        self.finish_ingestion(session, outcome)
    }

    /// Load pre-parsed rows, replacing the session's dataset.
    pub async fn ingest_rows(
        &self,
        session: &SessionId,
        rows: Vec<RawRow>,
        progress: Option<&watch::Sender<IngestionProgress>>,
    ) -> Result<IngestionReport, CoreError> {
        let _guard = self.lock(session).await;
        let (fallback, _receiver) = progress_channel();
        let progress = progress.unwrap_or(&fallback);
        let outcome = self.pipeline.ingest_rows(session, rows, progress).await;
        self.finish_ingestion(session, outcome)
    }

    /// Remove the session's rows but keep the session registered.
    pub async fn clear_session(&self, session: &SessionId) -> Result<(), CoreError> {
        let _guard = self.lock(session).await;
        self.blocking({
            let session = session.clone();
            move |store: &dyn DatasetStore| store.clear(&session)
        })
        .await?;
        self.sink.emit(&SessionEvent::DataCleared {
            session: session.clone(),
        });
        Ok(())
    }

    /// Remove the session and everything stored for it.
    pub async fn end_session(&self, session: &SessionId) -> Result<(), CoreError> {
        let guard = self.lock(session).await;
        self.blocking({
            let session = session.clone();
            move |store: &dyn DatasetStore| store.drop_session(&session)
        })
        .await?;
        self.sink.emit(&SessionEvent::DataCleared {
            session: session.clone(),
        });
        self.forget_lock(session, guard);
        Ok(())
    }

    /// Run one metric for the session over `[start, end]`.
    pub async fn run_metric(
        &self,
        session: &SessionId,
        metric: &str,
        granularity: Granularity,
        start: Date,
        end: Date,
    ) -> Result<QueryResult, CoreError> {
        let range = DateRange::new(start, end)?;
        let _guard = self.lock(session).await;
        let (result, _) = retry_with_backoff(&self.config.retry, metric, |_| {
            let composer = self.composer.clone();
            let session = session.clone();
            let metric = metric.to_owned();
            async move {
                tokio::task::spawn_blocking(move || {
                    composer.run_metric_in(&session, &metric, granularity, range)
                })
                .await
                .map_err(|error| CoreError::Task(error.to_string()))?
                .map_err(CoreError::from)
            }
        })
        .await
        .map_err(|exhausted| exhausted.error)?;
        Ok(result)
    }

    /// Compute every workbook metric for the session.
    pub async fn workbook(
        &self,
        session: &SessionId,
        granularity: Granularity,
        start: Date,
        end: Date,
    ) -> Result<Workbook, CoreError> {
        let range = DateRange::new(start, end)?;
        let _guard = self.lock(session).await;
        Workbook::compute(&self.composer, session, granularity, range, &self.config.retry).await
    }

    pub async fn status(&self, session: &SessionId) -> Result<SessionStatus, CoreError> {
        let _guard = self.lock(session).await;
        let session = session.clone();
        self.blocking(move |store: &dyn DatasetStore| {
            let exists = store.exists(&session)?;
            let row_count = if exists { store.row_count(&session)? } else { 0 };
            let aggregates = if exists { store.aggregates(&session)? } else { None };
            Ok(SessionStatus {
                session,
                exists,
                row_count,
                aggregates,
            })
        })
        .await
    }

    fn finish_ingestion(
        &self,
        session: &SessionId,
        outcome: Result<IngestionReport, IngestError>,
    ) -> Result<IngestionReport, CoreError> {
        match outcome {
            Ok(report) => {
                self.sink.emit(&SessionEvent::IngestionCompleted {
                    session: session.clone(),
                    rows: report.rows_written,
                });
                Ok(report)
            }
            Err(error) => {
                self.sink.emit(&SessionEvent::IngestionFailed {
                    session: session.clone(),
                    reason: error.to_string(),
                    rows_committed: error.rows_committed(),
                });
                Err(error.into())
            }
        }
    }

    async fn blocking<T, F>(&self, operation: F) -> Result<T, CoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn DatasetStore) -> Result<T, WarehouseError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || operation(store.as_ref()))
            .await
            .map_err(|error| CoreError::Task(error.to_string()))?
            .map_err(CoreError::from)
    }

    /// Drop the session's lock entry unless another caller already holds a
    /// reference to it and is waiting to run.
    fn forget_lock(&self, session: &SessionId, guard: tokio::sync::OwnedMutexGuard<()>) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The map and `guard` account for two references.
        if locks.get(session).is_some_and(|lock| Arc::strong_count(lock) == 2) {
            locks.remove(session);
        }
        drop(guard);
    }

    async fn lock(&self, session: &SessionId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(locks.entry(session.clone()).or_default())
        };
        lock.lock_owned().await
    }
}
