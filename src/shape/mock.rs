//! Scripted shape transport for tests.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;

use super::protocol::WireMessage;
use super::transport::{ShapeRequest, ShapeResponse, ShapeTransport};
use crate::error::{SyncError, SyncResult};

/// Serves queued responses per table. A request with nothing queued waits
/// until a response is pushed, like a long-poll with no changes.
#[derive(Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<String, VecDeque<SyncResult<ShapeResponse>>>>,
    requests: Mutex<Vec<ShapeRequest>>,
    pushed: Notify,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, table: &str, response: ShapeResponse) {
        self.push_result(table, Ok(response));
    }

    pub fn push_error(&self, table: &str, error: SyncError) {
        self.push_result(table, Err(error));
    }

    /// Queues a page of inserts followed by an up-to-date marker.
    pub fn push_rows(&self, table: &str, handle: &str, offset: &str, rows: Vec<Value>) {
        let mut messages: Vec<WireMessage> = rows
            .into_iter()
            .map(|row| {
                let key = row["id"].as_str().unwrap_or_default().to_string();
                WireMessage::insert(&key, row)
            })
            .collect();
        messages.push(WireMessage::up_to_date());
        self.push(table, ShapeResponse::messages(handle, offset, messages));
    }

    fn push_result(&self, table: &str, result: SyncResult<ShapeResponse>) {
        self.scripts
            .lock()
            .entry(table.to_string())
            .or_default()
            .push_back(result);
        self.pushed.notify_waiters();
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<ShapeRequest> {
        self.requests.lock().clone()
    }

    pub fn requests_for(&self, table: &str) -> Vec<ShapeRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.table == table)
            .cloned()
            .collect()
    }

    fn pop(&self, table: &str) -> Option<SyncResult<ShapeResponse>> {
        self.scripts.lock().get_mut(table)?.pop_front()
    }
}

impl ShapeTransport for ScriptedTransport {
    async fn fetch(&self, request: &ShapeRequest) -> SyncResult<ShapeResponse> {
        self.requests.lock().push(request.clone());
        loop {
            let pushed = self.pushed.notified();
            if let Some(result) = self.pop(&request.table) {
                return result;
            }
            pushed.await;
        }
    }
}
