//! Runs a sync session in the foreground.

use std::sync::Arc;

use clap::Args;
use tokio::sync::mpsc;

use mason_sync::{
    CancelSignal, EmbeddedDb, HealthMonitor, HttpShapeTransport, LiveQueries, QueryObservers,
    SessionStatus, StopMode, SyncCoordinator, VisibilityEvent,
};

use mason_sync::config::Config;

/// Sync the configured workspace until interrupted
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Print the rows of this query whenever they change
    #[arg(long, value_name = "SQL")]
    watch: Option<String>,

    /// Exit once every table is live
    #[arg(long)]
    until_live: bool,
}

impl RunCommand {
    pub async fn run(&self, db: EmbeddedDb, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        let catalog = config.catalog()?;
        let settings = config.sync.settings();
        let transport = Arc::new(
            HttpShapeTransport::new(config.electric_url.value.clone())
                .with_api_key(config.sync.api_key.clone()),
        );
        let observers = QueryObservers::new();
        let session_key = config.session_key();

        let coordinator = SyncCoordinator::new(
            session_key.clone(),
            catalog,
            transport,
            db.clone(),
            Arc::clone(&observers),
            settings.clone(),
        );

        println!(
            "Syncing workspace {} from {}",
            session_key, config.electric_url.value
        );
        coordinator.start().await?;

        let cancel = CancelSignal::new();
        let (visibility_tx, visibility_rx) = mpsc::channel(8);
        let monitor = HealthMonitor::new(db.clone(), coordinator.clone(), settings.probe_timeout);
        let monitor_task = tokio::spawn(monitor.run(visibility_rx, cancel.clone()));
        let signal_task = tokio::spawn(forward_resume_signals(visibility_tx, cancel.clone()));

        let watch_task = match &self.watch {
            Some(sql) => {
                let queries = LiveQueries::new(db.clone(), observers);
                let mut live = queries.live_query(sql.clone(), Vec::new()).await?;
                print_rows(live.rows());
                let cancel = cancel.clone();
                Some(tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            changed = live.changed() => match changed {
                                Ok(Some(rows)) => print_rows(rows),
                                Ok(None) => break,
                                Err(e) => {
                                    eprintln!("Query failed: {}", e);
                                    break;
                                }
                            }
                        }
                    }
                }))
            }
            None => None,
        };

        let mut status = coordinator.subscribe_status();
        let already_live = *status.borrow_and_update() == SessionStatus::Live;
        while !(self.until_live && already_live) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    println!("Stopping...");
                    break;
                }
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = coordinator.snapshot();
                    println!("Status: {} ({})", snapshot.status, snapshot.indicator());
                    if self.until_live && snapshot.status == SessionStatus::Live {
                        break;
                    }
                }
            }
        }

        cancel.cancel();
        coordinator.stop(StopMode::WorkspaceSwitch).await?;
        let _ = monitor_task.await;
        let _ = signal_task.await;
        if let Some(task) = watch_task {
            let _ = task.await;
        }
        Ok(())
    }
}

fn print_rows(rows: &[mason_sync::JsonRow]) {
    println!("--- {} row{}", rows.len(), if rows.len() == 1 { "" } else { "s" });
    for row in rows {
        println!("{}", serde_json::Value::Object(row.clone()));
    }
}

/// Treats the process being resumed after suspension as the app becoming
/// visible again.
#[cfg(unix)]
async fn forward_resume_signals(events: mpsc::Sender<VisibilityEvent>, cancel: CancelSignal) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut resumed = match signal(SignalKind::from_raw(libc::SIGCONT)) {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Failed to listen for SIGCONT: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = resumed.recv() => {
                if received.is_none() {
                    break;
                }
                tracing::info!("Process resumed, checking database health");
                if events.send(VisibilityEvent::Regained).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(not(unix))]
async fn forward_resume_signals(_events: mpsc::Sender<VisibilityEvent>, cancel: CancelSignal) {
    cancel.cancelled().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigcont_reports_visibility_regained() {
        let cancel = CancelSignal::new();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(forward_resume_signals(tx, cancel.clone()));

        // The listener registers asynchronously, so keep raising until it sees one.
        let received = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                unsafe {
                    libc::raise(libc::SIGCONT);
                }
                tokio::select! {
                    event = rx.recv() => break event,
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(received, Some(VisibilityEvent::Regained));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
