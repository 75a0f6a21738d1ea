//! Local replica tables and the writer that keeps them in step with shapes.
//!
//! Every replicated table is stored as `pk TEXT PRIMARY KEY, row TEXT` with
//! the row as a JSON object, so apps read columns with `json_extract`.

mod table;
mod writer;

pub use table::{TableCatalog, TableSpec};
pub use writer::{ApplyOutcome, ReplicaWriter, DEFAULT_TOMBSTONE_RETENTION};
