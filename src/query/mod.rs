//! Local query surface over the replica.

mod live;
mod observers;
mod value;

pub use live::{referenced_tables, LiveQueries, LiveQuery};
pub use observers::{ObserverGuard, QueryObservers};
pub use value::JsonRow;
