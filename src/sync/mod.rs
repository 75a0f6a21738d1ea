//! Sync session coordination and connection health.
//!
//! The [`SyncCoordinator`] owns one shape subscription per replicated table
//! and derives the session status from the tables' states. The
//! [`HealthMonitor`] reopens a dead database handle when the app becomes
//! visible again.

mod coordinator;
mod health;
mod status;

pub use coordinator::{StopMode, SyncCoordinator};
pub use health::{HealthMonitor, HealthOutcome, VisibilityEvent};
pub use status::{
    DegradeReason, SessionSnapshot, SessionStatus, SyncIndicator, TableStatus, TableTransition,
};
