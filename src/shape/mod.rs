//! Shape subscription client.
//!
//! A shape is the server-side log of one table's rows. The client follows it
//! over HTTP and hands complete batches to the replica writer.

#[cfg(test)]
pub(crate) mod mock;
mod protocol;
mod subscription;
mod transport;

pub use protocol::{
    decode_body, ChangeBatch, ChangeKind, ChangeOperation, ReplicationMode, ShapeCursor,
    ShapeMessage, WireHeaders, WireMessage, HANDLE_HEADER, INITIAL_OFFSET, OFFSET_HEADER,
};
pub use subscription::{ShapeEvent, ShapeSubscription};
pub use transport::{HttpShapeTransport, ShapeRequest, ShapeResponse, ShapeTransport};
