//! Embedded database liveness checks on visibility changes.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::coordinator::SyncCoordinator;
use crate::cancel::CancelSignal;
use crate::db::EmbeddedDb;
use crate::error::SyncResult;
use crate::shape::ShapeTransport;

/// App visibility changes reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityEvent {
    Hidden,
    /// The app became visible again after being backgrounded or suspended.
    Regained,
}

/// Result of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthOutcome {
    Healthy,
    /// The handle was dead; it was reopened and the session reinitialized.
    Recovered,
}

/// Probes the database when the app is shown again and recovers a dead
/// handle by reconnecting and reinitializing sync.
pub struct HealthMonitor<T: ShapeTransport> {
    db: EmbeddedDb,
    coordinator: SyncCoordinator<T>,
    probe_timeout: Duration,
}

impl<T: ShapeTransport> HealthMonitor<T> {
    pub fn new(db: EmbeddedDb, coordinator: SyncCoordinator<T>, probe_timeout: Duration) -> Self {
        Self {
            db,
            coordinator,
            probe_timeout,
        }
    }

    /// Probes the database once, recovering if the probe fails.
    pub async fn check(&self) -> SyncResult<HealthOutcome> {
        match self.db.probe(self.probe_timeout).await {
            Ok(()) => {
                debug!("embedded database is healthy");
                Ok(HealthOutcome::Healthy)
            }
            Err(e) => {
                warn!("Embedded database probe failed, reconnecting: {}", e);
                self.db.reconnect().await?;
                self.coordinator.reinitialize().await?;
                info!("Recovered embedded database and reinitialized sync");
                Ok(HealthOutcome::Recovered)
            }
        }
    }

    /// Checks health every time visibility is regained, until `cancel` fires
    /// or the event source closes.
    pub async fn run(self, mut events: mpsc::Receiver<VisibilityEvent>, cancel: CancelSignal) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(VisibilityEvent::Regained) => {
                    if let Err(e) = self.check().await {
                        error!("Health check could not recover the database: {}", e);
                    }
                }
                Some(VisibilityEvent::Hidden) => debug!("app hidden"),
                None => break,
            }
        }
    }
}
