//! Table and session sync status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};

/// Why a table is not live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DegradeReason {
    /// The table is being copied again from a fresh snapshot.
    Resync,
    /// Shape requests keep failing.
    ConnectionLost,
}

/// Sync state of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableStatus {
    /// Waiting for dependencies or for the first complete snapshot.
    Initializing,
    /// Caught up and following changes.
    Live,
    Degraded(DegradeReason),
    Stopped,
}

impl TableStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, TableStatus::Live)
    }
}

impl fmt::Display for TableStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableStatus::Initializing => write!(f, "initializing"),
            TableStatus::Live => write!(f, "live"),
            TableStatus::Degraded(DegradeReason::Resync) => write!(f, "degraded (resync)"),
            TableStatus::Degraded(DegradeReason::ConnectionLost) => {
                write!(f, "degraded (connection lost)")
            }
            TableStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Aggregate state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Initializing,
    Live,
    Degraded,
    Stopped,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Live => "live",
            SessionStatus::Degraded => "degraded",
            SessionStatus::Stopped => "stopped",
        }
    }

    /// Derives the session status from its tables.
    ///
    /// Stopped wins over degraded, degraded over initializing. A session is
    /// live only when every table is. A session without tables has nothing
    /// to wait for and counts as initializing until tables are added.
    pub fn derive<'a>(tables: impl IntoIterator<Item = &'a TableStatus>) -> Self {
        let mut any = false;
        let mut degraded = false;
        let mut initializing = false;
        for status in tables {
            any = true;
            match status {
                TableStatus::Stopped => return SessionStatus::Stopped,
                TableStatus::Degraded(_) => degraded = true,
                TableStatus::Initializing => initializing = true,
                TableStatus::Live => {}
            }
        }

        if !any || (initializing && !degraded) {
            SessionStatus::Initializing
        } else if degraded {
            SessionStatus::Degraded
        } else {
            SessionStatus::Live
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(SessionStatus::Initializing),
            "live" => Ok(SessionStatus::Live),
            "degraded" => Ok(SessionStatus::Degraded),
            "stopped" => Ok(SessionStatus::Stopped),
            _ => Err(format!("unknown session status '{}'", s)),
        }
    }
}

/// What a UI shows for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncIndicator {
    /// First load in progress.
    Loading,
    /// Recovering; data may be briefly stale.
    Syncing,
    Synced,
    Offline,
}

impl fmt::Display for SyncIndicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncIndicator::Loading => "loading",
            SyncIndicator::Syncing => "syncing",
            SyncIndicator::Synced => "synced",
            SyncIndicator::Offline => "offline",
        };
        f.write_str(label)
    }
}

/// A table moving from one status to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTransition {
    pub table: String,
    pub from: TableStatus,
    pub to: TableStatus,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub tables: BTreeMap<String, TableStatus>,
}

impl SessionSnapshot {
    pub fn indicator(&self) -> SyncIndicator {
        match self.status {
            SessionStatus::Initializing => SyncIndicator::Loading,
            SessionStatus::Live => SyncIndicator::Synced,
            SessionStatus::Stopped => SyncIndicator::Offline,
            SessionStatus::Degraded => {
                let offline = self
                    .tables
                    .values()
                    .any(|s| *s == TableStatus::Degraded(DegradeReason::ConnectionLost));
                if offline {
                    SyncIndicator::Offline
                } else {
                    SyncIndicator::Syncing
                }
            }
        }
    }
}

/// Shared status board for one session's tables.
pub(crate) struct StatusBoard {
    tables: RwLock<BTreeMap<String, TableStatus>>,
    status: watch::Sender<SessionStatus>,
    transitions: broadcast::Sender<TableTransition>,
}

impl StatusBoard {
    pub fn new<'a>(names: impl IntoIterator<Item = &'a str>) -> Self {
        let tables: BTreeMap<String, TableStatus> = names
            .into_iter()
            .map(|name| (name.to_string(), TableStatus::Initializing))
            .collect();
        let (status, _) = watch::channel(SessionStatus::derive(tables.values()));
        let (transitions, _) = broadcast::channel(256);
        Self {
            tables: RwLock::new(tables),
            status,
            transitions,
        }
    }

    /// Moves a table to `to`. Returns the new session status if it changed.
    pub fn set(&self, table: &str, to: TableStatus) -> Option<SessionStatus> {
        let (from, session) = {
            let mut tables = self.tables.write();
            let entry = tables.get_mut(table)?;
            let from = *entry;
            if from == to {
                return None;
            }
            *entry = to;
            (from, SessionStatus::derive(tables.values()))
        };

        let _ = self.transitions.send(TableTransition {
            table: table.to_string(),
            from,
            to,
        });
        self.publish(session)
    }

    /// Moves every table to `to`.
    pub fn set_all(&self, to: TableStatus) -> Option<SessionStatus> {
        let names: Vec<String> = self.tables.read().keys().cloned().collect();
        let mut changed = None;
        for name in names {
            if let Some(status) = self.set(&name, to) {
                changed = Some(status);
            }
        }
        changed
    }

    fn publish(&self, session: SessionStatus) -> Option<SessionStatus> {
        let changed = self.status.send_if_modified(|current| {
            if *current == session {
                false
            } else {
                *current = session;
                true
            }
        });
        changed.then_some(session)
    }

    pub fn get(&self, table: &str) -> Option<TableStatus> {
        self.tables.read().get(table).copied()
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status(),
            tables: self.tables.read().clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TableTransition> {
        self.transitions.subscribe()
    }
}
