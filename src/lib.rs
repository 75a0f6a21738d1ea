//! Local-first sync layer for Mason.
//!
//! Server tables are followed as Electric shapes, written into a local
//! SQLite replica, and exposed through plain and live queries. A
//! [`SyncCoordinator`] runs one subscription per table and reports a single
//! session status for the UI.

pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod query;
pub mod replica;
pub mod settings;
pub mod shape;
pub mod sync;

pub use cancel::CancelSignal;
pub use db::{CursorRecord, CursorRepository, EmbeddedDb};
pub use error::{SyncError, SyncResult};
pub use query::{JsonRow, LiveQueries, LiveQuery, QueryObservers};
pub use replica::{ApplyOutcome, ReplicaWriter, TableCatalog, TableSpec};
pub use settings::{Backoff, SyncSettings};
pub use shape::{HttpShapeTransport, ShapeCursor, ShapeSubscription, ShapeTransport};
pub use sync::{
    HealthMonitor, HealthOutcome, SessionSnapshot, SessionStatus, StopMode, SyncCoordinator,
    SyncIndicator, TableStatus, VisibilityEvent,
};
