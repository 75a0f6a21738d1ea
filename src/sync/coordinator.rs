//! Runs one subscription per replicated table and tracks session status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::status::{
    DegradeReason, SessionSnapshot, SessionStatus, StatusBoard, TableStatus, TableTransition,
};
use crate::cancel::CancelSignal;
use crate::db::{CursorRepository, EmbeddedDb};
use crate::error::{SyncError, SyncResult};
use crate::query::QueryObservers;
use crate::replica::{ApplyOutcome, ReplicaWriter, TableCatalog, TableSpec};
use crate::settings::SyncSettings;
use crate::shape::{
    ChangeBatch, ReplicationMode, ShapeCursor, ShapeEvent, ShapeSubscription, ShapeTransport,
};

/// How a session is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// The user signed out; cursors are discarded.
    Logout,
    /// Another workspace is taking over; cursors are kept so this session
    /// can resume incrementally later.
    WorkspaceSwitch,
}

/// Keeps a session's replica tables in sync with their shapes.
///
/// Tables load in dependency order: a table's subscription starts only once
/// every table it depends on has committed its first snapshot. Clones share
/// the same session.
pub struct SyncCoordinator<T: ShapeTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: ShapeTransport> Clone for SyncCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T> {
    session_key: String,
    catalog: TableCatalog,
    transport: Arc<T>,
    writer: ReplicaWriter,
    cursors: CursorRepository,
    settings: SyncSettings,
    board: Arc<StatusBoard>,
    run: Mutex<Option<RunHandle>>,
}

struct RunHandle {
    cancel: CancelSignal,
    tasks: Vec<JoinHandle<()>>,
}

impl<T: ShapeTransport> SyncCoordinator<T> {
    pub fn new(
        session_key: impl Into<String>,
        catalog: TableCatalog,
        transport: Arc<T>,
        db: EmbeddedDb,
        observers: Arc<QueryObservers>,
        settings: SyncSettings,
    ) -> Self {
        for table in catalog.tables() {
            observers.register_table(&table.name);
        }
        let board = Arc::new(StatusBoard::new(catalog.names()));
        Self {
            inner: Arc::new(Inner {
                session_key: session_key.into(),
                catalog,
                transport,
                writer: ReplicaWriter::new(db.clone(), observers)
                    .with_tombstone_retention(settings.tombstone_retention),
                cursors: CursorRepository::new(db),
                settings,
                board,
                run: Mutex::new(None),
            }),
        }
    }

    pub fn session_key(&self) -> &str {
        &self.inner.session_key
    }

    pub fn catalog(&self) -> &TableCatalog {
        &self.inner.catalog
    }

    /// Starts syncing, resuming each table from its cursor when the table
    /// still holds this session's rows. Does nothing if already running.
    pub async fn start(&self) -> SyncResult<()> {
        let mut run = self.inner.run.lock().await;
        if run.is_some() {
            debug!(session = %self.inner.session_key, "sync already running");
            return Ok(());
        }
        *run = Some(self.launch(true).await?);
        Ok(())
    }

    /// Discards all cursors and reloads every table from a fresh snapshot.
    pub async fn reinitialize(&self) -> SyncResult<()> {
        let mut run = self.inner.run.lock().await;
        if let Some(handle) = run.take() {
            halt(handle).await;
        }
        self.inner
            .cursors
            .clear_session(&self.inner.session_key)
            .await?;
        info!(session = %self.inner.session_key, "reinitializing sync session");
        *run = Some(self.launch(false).await?);
        Ok(())
    }

    /// Stops every subscription. Logout also discards the session's cursors.
    pub async fn stop(&self, mode: StopMode) -> SyncResult<()> {
        let mut run = self.inner.run.lock().await;
        if let Some(handle) = run.take() {
            halt(handle).await;
        }

        if mode == StopMode::Logout {
            let cleared = self
                .inner
                .cursors
                .clear_session(&self.inner.session_key)
                .await?;
            info!(session = %self.inner.session_key, cleared, "cleared session cursors");
        }
        if let Some(status) = self.inner.board.set_all(TableStatus::Stopped) {
            persist_status(&self.inner.cursors, &self.inner.session_key, status).await;
        }
        info!(session = %self.inner.session_key, ?mode, "stopped sync session");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.inner.run.lock().await.is_some()
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.board.status()
    }

    pub fn table_status(&self, table: &str) -> Option<TableStatus> {
        self.inner.board.get(table)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.board.snapshot()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.board.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TableTransition> {
        self.inner.board.subscribe_transitions()
    }

    /// Waits until the session reaches `wanted`.
    pub async fn wait_for_status(&self, wanted: SessionStatus, timeout: Duration) -> SyncResult<()> {
        let mut status = self.subscribe_status();
        let result = match tokio::time::timeout(timeout, status.wait_for(|s| *s == wanted)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(SyncError::NotRunning),
            Err(_) => Err(SyncError::Timeout(timeout)),
        };
        result
    }

    async fn launch(&self, resume: bool) -> SyncResult<RunHandle> {
        let inner = &self.inner;
        for table in inner.catalog.tables() {
            inner.writer.ensure_table(table).await?;
        }

        if let Some(status) = inner.board.set_all(TableStatus::Initializing) {
            persist_status(&inner.cursors, &inner.session_key, status).await;
        } else {
            persist_status(&inner.cursors, &inner.session_key, inner.board.status()).await;
        }

        let mut cursors = Vec::with_capacity(inner.catalog.len());
        for table in inner.catalog.tables() {
            let cursor = if resume {
                inner
                    .cursors
                    .resumable_cursor(&inner.session_key, &table.name)
                    .await?
            } else {
                None
            };
            cursors.push(cursor);
        }

        let cancel = CancelSignal::new();
        let mut loaded: HashMap<&str, watch::Receiver<bool>> = HashMap::new();
        let mut tasks = Vec::with_capacity(inner.catalog.len());

        for (table, cursor) in inner.catalog.tables().iter().zip(cursors) {
            // Catalog order puts dependencies first, so their gates exist.
            let dependencies: Vec<watch::Receiver<bool>> = table
                .depends_on
                .iter()
                .filter_map(|dep| loaded.get(dep.as_str()).cloned())
                .collect();
            let (gate, gate_rx) = watch::channel(false);
            loaded.insert(table.name.as_str(), gate_rx);

            let worker = TableWorker {
                session_key: inner.session_key.clone(),
                table: table.clone(),
                transport: Arc::clone(&inner.transport),
                writer: inner.writer.clone(),
                cursors: inner.cursors.clone(),
                settings: inner.settings.clone(),
                board: Arc::clone(&inner.board),
                cancel: cancel.clone(),
            };
            tasks.push(tokio::spawn(worker.run(cursor, dependencies, gate)));
        }

        info!(
            session = %inner.session_key,
            tables = inner.catalog.len(),
            resume,
            "started sync session"
        );
        Ok(RunHandle { cancel, tasks })
    }
}

async fn halt(handle: RunHandle) {
    handle.cancel.cancel();
    for task in handle.tasks {
        if let Err(e) = task.await {
            error!("table sync task failed: {}", e);
        }
    }
}

async fn persist_status(cursors: &CursorRepository, session_key: &str, status: SessionStatus) {
    if let Err(e) = cursors.save_session_status(session_key, status.as_str()).await {
        warn!("Failed to persist status for session {}: {}", session_key, e);
    }
}

enum Commit {
    Done(ApplyOutcome),
    Failed,
    Cancelled,
}

/// Drives one table: waits for dependencies, then feeds shape batches to the
/// writer.
struct TableWorker<T: ShapeTransport> {
    session_key: String,
    table: TableSpec,
    transport: Arc<T>,
    writer: ReplicaWriter,
    cursors: CursorRepository,
    settings: SyncSettings,
    board: Arc<StatusBoard>,
    cancel: CancelSignal,
}

impl<T: ShapeTransport> TableWorker<T> {
    async fn run(
        self,
        cursor: Option<ShapeCursor>,
        dependencies: Vec<watch::Receiver<bool>>,
        loaded: watch::Sender<bool>,
    ) {
        for mut dependency in dependencies {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                ready = dependency.wait_for(|loaded| *loaded) => {
                    if ready.is_err() {
                        return;
                    }
                }
            }
        }

        let mut subscription = ShapeSubscription::start(
            Arc::clone(&self.transport),
            self.table.clone(),
            cursor,
            self.settings.clone(),
            self.cancel.clone(),
        );

        // Snapshot refetches after exhausted apply attempts; drives the
        // delay before the next one.
        let mut resyncs: u32 = 0;

        loop {
            let event = match subscription.next_event().await {
                Ok(event) => event,
                Err(SyncError::Cancelled) => break,
                Err(e) => {
                    warn!(table = %self.table.name, error = %e, "subscription error");
                    continue;
                }
            };

            match event {
                ShapeEvent::Batch(batch) => match self.commit(&batch).await {
                    Commit::Done(outcome) => {
                        debug!(
                            table = %self.table.name,
                            applied = outcome.applied,
                            skipped = outcome.skipped,
                            "committed batch"
                        );
                        resyncs = 0;
                        self.set_status(TableStatus::Live).await;
                        loaded.send_replace(true);
                    }
                    Commit::Failed => {
                        resyncs = resyncs.saturating_add(1);
                        let delay = self.settings.backoff.delay_for_attempt(resyncs);
                        warn!(
                            table = %self.table.name,
                            resyncs,
                            ?delay,
                            "giving up on batch after {} attempts, resyncing from snapshot",
                            self.settings.apply_attempts
                        );
                        self.discard_cursor().await;
                        self.set_status(TableStatus::Degraded(DegradeReason::Resync))
                            .await;
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                        subscription.restart_from_snapshot();
                    }
                    Commit::Cancelled => break,
                },
                ShapeEvent::MustRefetch => {
                    self.discard_cursor().await;
                    self.set_status(TableStatus::Degraded(DegradeReason::Resync))
                        .await;
                }
                ShapeEvent::Retrying { attempt, .. } => {
                    let current = self.board.get(&self.table.name);
                    let resyncing =
                        current == Some(TableStatus::Degraded(DegradeReason::Resync));
                    if attempt >= self.settings.degrade_after_failures && !resyncing {
                        self.set_status(TableStatus::Degraded(DegradeReason::ConnectionLost))
                            .await;
                    }
                }
            }
        }

        debug!(table = %self.table.name, "table sync task finished");
    }

    /// Applies a batch, retrying with backoff up to the configured attempts.
    async fn commit(&self, batch: &ChangeBatch) -> Commit {
        let attempts = self.settings.apply_attempts.max(1);
        for attempt in 1..=attempts {
            let result = match batch.mode {
                ReplicationMode::FullCopy => {
                    self.writer
                        .load_snapshot(&self.session_key, &self.table, batch)
                        .await
                }
                ReplicationMode::Incremental => {
                    self.writer
                        .apply_batch(&self.session_key, &self.table, batch)
                        .await
                }
            };

            match result {
                Ok(outcome) => return Commit::Done(outcome),
                Err(e) => {
                    warn!(
                        table = %self.table.name,
                        attempt,
                        error = %e,
                        "failed to apply batch"
                    );
                    if attempt < attempts {
                        let delay = self.settings.backoff.delay_for_attempt(attempt);
                        tokio::select! {
                            _ = self.cancel.cancelled() => return Commit::Cancelled,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
        Commit::Failed
    }

    async fn discard_cursor(&self) {
        if let Err(e) = self
            .cursors
            .clear_cursor(&self.session_key, &self.table.name)
            .await
        {
            warn!(table = %self.table.name, error = %e, "failed to clear cursor");
        }
    }

    async fn set_status(&self, status: TableStatus) {
        if self.cancel.is_cancelled() {
            return;
        }
        if let Some(previous) = self.board.get(&self.table.name) {
            if previous != status {
                info!(table = %self.table.name, from = %previous, to = %status, "table status changed");
            }
        }
        if let Some(session) = self.board.set(&self.table.name, status) {
            info!(session = %self.session_key, status = %session, "session status changed");
            persist_status(&self.cursors, &self.session_key, self.board.status()).await;
        }
    }
}
