//! Shape log wire format and the change types handed to the replica writer.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{SyncError, SyncResult};
use crate::replica::TableSpec;

/// Offset that requests a shape from the beginning.
pub const INITIAL_OFFSET: &str = "-1";

/// Response header carrying the shape handle.
pub const HANDLE_HEADER: &str = "electric-handle";

/// Response header carrying the offset to resume from.
pub const OFFSET_HEADER: &str = "electric-offset";

/// Position in a table's shape log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShapeCursor {
    pub handle: String,
    pub offset: String,
}

impl ShapeCursor {
    pub fn new(handle: impl Into<String>, offset: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
            offset: offset.into(),
        }
    }
}

impl fmt::Display for ShapeCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.handle, self.offset)
    }
}

/// Whether a subscription is copying the whole table or following changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    FullCopy,
    Incremental,
}

impl ReplicationMode {
    /// A subscription with a cursor resumes; one without copies everything.
    pub fn for_cursor(cursor: Option<&ShapeCursor>) -> Self {
        if cursor.is_some() {
            ReplicationMode::Incremental
        } else {
            ReplicationMode::FullCopy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationMode::FullCopy => "full-copy",
            ReplicationMode::Incremental => "incremental",
        }
    }
}

impl fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row-level change.
///
/// `key` is the local primary key text. `value` is the full row for inserts,
/// the changed columns for updates and optional for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeOperation {
    pub table: String,
    pub kind: ChangeKind,
    pub key: String,
    pub value: Option<Map<String, Value>>,
}

impl ChangeOperation {
    pub fn insert(table: impl Into<String>, key: impl Into<String>, row: Map<String, Value>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Insert,
            key: key.into(),
            value: Some(row),
        }
    }

    pub fn update(
        table: impl Into<String>,
        key: impl Into<String>,
        changes: Map<String, Value>,
    ) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Update,
            key: key.into(),
            value: Some(changes),
        }
    }

    pub fn delete(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            kind: ChangeKind::Delete,
            key: key.into(),
            value: None,
        }
    }
}

/// Changes committed together, ending at `cursor`.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeBatch {
    pub table: String,
    /// `FullCopy` batches carry a complete snapshot of the table.
    pub mode: ReplicationMode,
    pub operations: Vec<ChangeOperation>,
    pub cursor: ShapeCursor,
}

impl ChangeBatch {
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Headers attached to each shape log message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireHeaders {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<String>,
}

/// A message in a shape response body, as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Map<String, Value>>,
    #[serde(default)]
    pub headers: WireHeaders,
}

impl WireMessage {
    fn change(operation: ChangeKind, key: &str, value: Option<Value>) -> Self {
        Self {
            key: Some(key.to_string()),
            value: value.and_then(|v| v.as_object().cloned()),
            headers: WireHeaders {
                operation: Some(operation.as_str().to_string()),
                control: None,
            },
        }
    }

    fn control(control: &str) -> Self {
        Self {
            key: None,
            value: None,
            headers: WireHeaders {
                operation: None,
                control: Some(control.to_string()),
            },
        }
    }

    pub fn insert(key: &str, value: Value) -> Self {
        Self::change(ChangeKind::Insert, key, Some(value))
    }

    pub fn update(key: &str, value: Value) -> Self {
        Self::change(ChangeKind::Update, key, Some(value))
    }

    pub fn delete(key: &str, value: Option<Value>) -> Self {
        Self::change(ChangeKind::Delete, key, value)
    }

    pub fn up_to_date() -> Self {
        Self::control("up-to-date")
    }

    pub fn must_refetch() -> Self {
        Self::control("must-refetch")
    }

    /// Interprets the message for `table`.
    ///
    /// Change keys come from the row's primary key columns when present.
    /// Otherwise the `"schema"."table"/"pk"` wire key is parsed into the same
    /// local form.
    pub fn classify(&self, table: &TableSpec) -> SyncResult<ShapeMessage> {
        if let Some(control) = &self.headers.control {
            return Ok(match control.as_str() {
                "up-to-date" => ShapeMessage::UpToDate,
                "must-refetch" => ShapeMessage::MustRefetch,
                _ => ShapeMessage::Ignored,
            });
        }

        let Some(operation) = &self.headers.operation else {
            return Ok(ShapeMessage::Ignored);
        };
        let kind = match operation.as_str() {
            "insert" => ChangeKind::Insert,
            "update" => ChangeKind::Update,
            "delete" => ChangeKind::Delete,
            other => {
                return Err(SyncError::Decode(format!(
                    "unknown operation '{}' in table '{}'",
                    other, table.name
                )))
            }
        };

        let key = match (self.value.as_ref().map(|row| table.key_for(row)), &self.key) {
            (Some(Ok(key)), _) => key,
            (_, Some(wire_key)) => table.key_from_wire(wire_key)?,
            (Some(Err(err)), None) => return Err(err),
            (None, None) => {
                return Err(SyncError::Decode(format!(
                    "{} message in table '{}' has neither key nor value",
                    kind, table.name
                )))
            }
        };

        if kind != ChangeKind::Delete && self.value.is_none() {
            return Err(SyncError::MissingPayload {
                table: table.name.clone(),
                key,
                kind: kind.as_str(),
            });
        }

        Ok(ShapeMessage::Change(ChangeOperation {
            table: table.name.clone(),
            kind,
            key,
            value: self.value.clone(),
        }))
    }
}

/// A classified shape log message.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeMessage {
    Change(ChangeOperation),
    /// Everything up to the response's offset has been delivered.
    UpToDate,
    /// The shape was rotated upstream; start again from a snapshot.
    MustRefetch,
    /// Control messages this client does not act on.
    Ignored,
}

/// Decodes a shape response body. An empty body carries no messages.
pub fn decode_body(body: &[u8]) -> SyncResult<Vec<WireMessage>> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(body).map_err(|e| SyncError::Decode(e.to_string()))
}
