//! Per-table shape subscription.

use std::sync::Arc;
use std::time::Duration;

use futures::Stream;
use tracing::{debug, error, info, warn};

use super::protocol::{
    ChangeBatch, ChangeOperation, ReplicationMode, ShapeCursor, ShapeMessage, WireMessage,
    INITIAL_OFFSET,
};
use super::transport::{ShapeRequest, ShapeResponse, ShapeTransport};
use crate::cancel::CancelSignal;
use crate::error::{SyncError, SyncResult};
use crate::replica::TableSpec;
use crate::settings::SyncSettings;

/// What a subscription produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeEvent {
    /// Changes up to an up-to-date point, ready to commit.
    Batch(ChangeBatch),
    /// The shape was invalidated upstream. Uncommitted changes were dropped
    /// and the next batch is a full snapshot.
    MustRefetch,
    /// A request failed; the next one is sent after `delay`.
    Retrying {
        attempt: u32,
        delay: Duration,
        error: String,
    },
}

/// Follows one table's shape log, yielding batches at up-to-date points.
///
/// Without a cursor the subscription copies the full table first; with one
/// it resumes from that point. Failed requests are retried indefinitely with
/// capped backoff.
pub struct ShapeSubscription<T: ShapeTransport> {
    transport: Arc<T>,
    table: TableSpec,
    settings: SyncSettings,
    cancel: CancelSignal,
    cursor: Option<ShapeCursor>,
    mode: ReplicationMode,
    live: bool,
    pending: Vec<ChangeOperation>,
    failures: u32,
    retry_delay: Option<Duration>,
}

impl<T: ShapeTransport> ShapeSubscription<T> {
    /// Starts a subscription for `table`, resuming from `cursor` if given.
    pub fn start(
        transport: Arc<T>,
        table: TableSpec,
        cursor: Option<ShapeCursor>,
        settings: SyncSettings,
        cancel: CancelSignal,
    ) -> Self {
        let mode = ReplicationMode::for_cursor(cursor.as_ref());
        info!(table = %table.name, %mode, "starting shape subscription");
        Self {
            transport,
            table,
            settings,
            cancel,
            cursor,
            mode,
            live: false,
            pending: Vec::new(),
            failures: 0,
            retry_delay: None,
        }
    }

    pub fn table(&self) -> &TableSpec {
        &self.table
    }

    /// Whether the subscription is copying the table or following changes.
    pub fn mode(&self) -> ReplicationMode {
        self.mode
    }

    /// The position of the last response received.
    pub fn cursor(&self) -> Option<&ShapeCursor> {
        self.cursor.as_ref()
    }

    /// Drops the cursor and anything accumulated; the next batch is a full
    /// snapshot of the table.
    pub fn restart_from_snapshot(&mut self) {
        self.cursor = None;
        self.mode = ReplicationMode::FullCopy;
        self.live = false;
        self.pending.clear();
        self.failures = 0;
        self.retry_delay = None;
    }

    /// Waits for the next event. Returns `Err(SyncError::Cancelled)` once the
    /// cancel signal fires.
    pub async fn next_event(&mut self) -> SyncResult<ShapeEvent> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            if let Some(delay) = self.retry_delay.take() {
                tokio::select! {
                    _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let request = self.next_request();
            let timeout = self.settings.request_timeout;
            let transport = Arc::clone(&self.transport);
            let fetched = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                result = tokio::time::timeout(timeout, transport.fetch(&request)) => {
                    result.unwrap_or(Err(SyncError::Timeout(timeout)))
                }
            };

            let outcome = match fetched {
                Ok(ShapeResponse::MustRefetch) => Ok(Some(self.refetch())),
                Ok(ShapeResponse::Messages {
                    handle,
                    offset,
                    messages,
                }) => self.absorb(handle, offset, messages),
                Err(e) => Err(e),
            };

            match outcome {
                Ok(Some(event)) => return Ok(event),
                Ok(None) => continue,
                Err(e) => return Ok(self.schedule_retry(e)),
            }
        }
    }

    /// Turns the subscription into a stream that ends on cancellation.
    pub fn into_stream(self) -> impl Stream<Item = ShapeEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            match subscription.next_event().await {
                Ok(event) => Some((event, subscription)),
                Err(_) => None,
            }
        })
    }

    fn next_request(&self) -> ShapeRequest {
        match &self.cursor {
            Some(cursor) => ShapeRequest {
                table: self.table.name.clone(),
                offset: cursor.offset.clone(),
                handle: Some(cursor.handle.clone()),
                live: self.live,
            },
            None => ShapeRequest {
                table: self.table.name.clone(),
                offset: INITIAL_OFFSET.to_string(),
                handle: None,
                live: false,
            },
        }
    }

    fn refetch(&mut self) -> ShapeEvent {
        warn!(table = %self.table.name, "shape must be refetched; restarting from snapshot");
        self.restart_from_snapshot();
        ShapeEvent::MustRefetch
    }

    /// Folds one response into the pending batch. Nothing is kept if the
    /// response fails to decode, so the same request can be retried.
    fn absorb(
        &mut self,
        handle: Option<String>,
        offset: Option<String>,
        messages: Vec<WireMessage>,
    ) -> SyncResult<Option<ShapeEvent>> {
        let mut changes = Vec::with_capacity(messages.len());
        let mut up_to_date = false;
        for message in &messages {
            match message.classify(&self.table)? {
                ShapeMessage::Change(op) => changes.push(op),
                ShapeMessage::UpToDate => up_to_date = true,
                ShapeMessage::MustRefetch => return Ok(Some(self.refetch())),
                ShapeMessage::Ignored => {}
            }
        }

        let previous = self.cursor.as_ref();
        let handle = handle
            .or_else(|| previous.map(|c| c.handle.clone()))
            .ok_or_else(|| SyncError::Decode("response has no shape handle".to_string()))?;
        let offset = offset
            .or_else(|| previous.map(|c| c.offset.clone()))
            .ok_or_else(|| SyncError::Decode("response has no shape offset".to_string()))?;

        self.failures = 0;
        self.pending.extend(changes);
        let cursor = ShapeCursor::new(handle, offset);
        self.cursor = Some(cursor.clone());

        if !up_to_date {
            debug!(table = %self.table.name, pending = self.pending.len(), "shape page received");
            return Ok(None);
        }

        let batch = ChangeBatch {
            table: self.table.name.clone(),
            mode: self.mode,
            operations: std::mem::take(&mut self.pending),
            cursor,
        };
        self.live = true;
        self.mode = ReplicationMode::Incremental;
        debug!(
            table = %self.table.name,
            operations = batch.operations.len(),
            cursor = %batch.cursor,
            "shape batch ready"
        );
        Ok(Some(ShapeEvent::Batch(batch)))
    }

    fn schedule_retry(&mut self, err: SyncError) -> ShapeEvent {
        self.failures = self.failures.saturating_add(1);
        let delay = self.settings.backoff.delay_for_attempt(self.failures);
        if err.is_retryable() {
            warn!(table = %self.table.name, attempt = self.failures, ?delay, error = %err, "shape request failed");
        } else {
            error!(table = %self.table.name, attempt = self.failures, ?delay, error = %err, "shape request failed");
        }
        self.retry_delay = Some(delay);
        ShapeEvent::Retrying {
            attempt: self.failures,
            delay,
            error: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Backoff;
    use crate::shape::mock::ScriptedTransport;
    use crate::shape::ChangeKind;
    use futures::StreamExt;
    use serde_json::json;

    fn settings() -> SyncSettings {
        SyncSettings::default()
            .with_backoff(Backoff::fixed(
                Duration::from_millis(1),
                Duration::from_millis(5),
            ))
            .with_request_timeout(Duration::from_millis(200))
    }

    fn subscribe(
        transport: &Arc<ScriptedTransport>,
        cursor: Option<ShapeCursor>,
    ) -> ShapeSubscription<ScriptedTransport> {
        ShapeSubscription::start(
            Arc::clone(transport),
            TableSpec::new("projects"),
            cursor,
            settings(),
            CancelSignal::new(),
        )
    }

    async fn next(sub: &mut ShapeSubscription<ScriptedTransport>) -> ShapeEvent {
        tokio::time::timeout(Duration::from_secs(2), sub.next_event())
            .await
            .expect("event within timeout")
            .unwrap()
    }

    #[tokio::test]
    async fn test_initial_snapshot_accumulates_until_up_to_date() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            "projects",
            ShapeResponse::messages(
                "h1",
                "0_0",
                vec![WireMessage::insert("p1", json!({"id": "p1"}))],
            ),
        );
        transport.push_rows("projects", "h1", "0_1", vec![json!({"id": "p2"})]);

        let mut sub = subscribe(&transport, None);
        assert_eq!(sub.mode(), ReplicationMode::FullCopy);

        match next(&mut sub).await {
            ShapeEvent::Batch(batch) => {
                assert_eq!(batch.mode, ReplicationMode::FullCopy);
                assert_eq!(batch.operations.len(), 2);
                assert_eq!(batch.cursor, ShapeCursor::new("h1", "0_1"));
            }
            other => panic!("expected batch, got {:?}", other),
        }
        assert_eq!(sub.mode(), ReplicationMode::Incremental);

        let requests = transport.requests_for("projects");
        assert_eq!(requests[0], ShapeRequest::initial("projects"));
        assert_eq!(requests[1].offset, "0_0");
        assert_eq!(requests[1].handle.as_deref(), Some("h1"));
        assert!(!requests[1].live);
    }

    #[tokio::test]
    async fn test_live_after_first_up_to_date() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_rows("projects", "h1", "0_0", vec![json!({"id": "p1"})]);
        transport.push(
            "projects",
            ShapeResponse::messages(
                "h1",
                "1_0",
                vec![
                    WireMessage::update("p1", json!({"id": "p1", "name": "x"})),
                    WireMessage::up_to_date(),
                ],
            ),
        );

        let mut sub = subscribe(&transport, None);
        next(&mut sub).await;
        match next(&mut sub).await {
            ShapeEvent::Batch(batch) => {
                assert_eq!(batch.mode, ReplicationMode::Incremental);
                assert_eq!(batch.operations[0].kind, ChangeKind::Update);
            }
            other => panic!("expected batch, got {:?}", other),
        }
        let requests = transport.requests_for("projects");
        assert!(requests[1].live);
    }

    #[tokio::test]
    async fn test_resume_from_cursor() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_rows("projects", "h1", "7_0", vec![]);

        let mut sub = subscribe(&transport, Some(ShapeCursor::new("h1", "5_0")));
        assert_eq!(sub.mode(), ReplicationMode::Incremental);
        match next(&mut sub).await {
            ShapeEvent::Batch(batch) => {
                assert_eq!(batch.mode, ReplicationMode::Incremental);
                assert!(batch.is_empty());
            }
            other => panic!("expected batch, got {:?}", other),
        }
        let request = &transport.requests_for("projects")[0];
        assert_eq!(request.offset, "5_0");
        assert_eq!(request.handle.as_deref(), Some("h1"));
    }

    #[tokio::test]
    async fn test_must_refetch_discards_pending_and_restarts() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            "projects",
            ShapeResponse::messages(
                "h1",
                "3_0",
                vec![WireMessage::insert("p9", json!({"id": "p9"}))],
            ),
        );
        transport.push("projects", ShapeResponse::MustRefetch);
        transport.push_rows("projects", "h2", "0_0", vec![json!({"id": "p1"})]);

        let mut sub = subscribe(&transport, Some(ShapeCursor::new("h1", "2_0")));
        assert_eq!(next(&mut sub).await, ShapeEvent::MustRefetch);
        assert!(sub.cursor().is_none());

        match next(&mut sub).await {
            ShapeEvent::Batch(batch) => {
                assert_eq!(batch.mode, ReplicationMode::FullCopy);
                assert_eq!(batch.operations.len(), 1);
                assert_eq!(batch.operations[0].key, "p1");
            }
            other => panic!("expected batch, got {:?}", other),
        }
        let requests = transport.requests_for("projects");
        assert_eq!(requests[2], ShapeRequest::initial("projects"));
    }

    #[tokio::test]
    async fn test_must_refetch_control_message() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push(
            "projects",
            ShapeResponse::messages("h1", "3_0", vec![WireMessage::must_refetch()]),
        );
        let mut sub = subscribe(&transport, Some(ShapeCursor::new("h1", "2_0")));
        assert_eq!(next(&mut sub).await, ShapeEvent::MustRefetch);
        assert_eq!(sub.mode(), ReplicationMode::FullCopy);
    }

    #[tokio::test]
    async fn test_failures_retry_with_same_cursor() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_error("projects", SyncError::Transport("reset".into()));
        transport.push_error(
            "projects",
            SyncError::UpstreamStatus {
                status: 503,
                message: "down".into(),
            },
        );
        transport.push_rows("projects", "h1", "4_0", vec![]);

        let mut sub = subscribe(&transport, Some(ShapeCursor::new("h1", "3_0")));
        match next(&mut sub).await {
            ShapeEvent::Retrying { attempt, delay, .. } => {
                assert_eq!(attempt, 1);
                assert_eq!(delay, Duration::from_millis(1));
            }
            other => panic!("expected retry, got {:?}", other),
        }
        match next(&mut sub).await {
            ShapeEvent::Retrying { attempt, .. } => assert_eq!(attempt, 2),
            other => panic!("expected retry, got {:?}", other),
        }
        assert!(matches!(next(&mut sub).await, ShapeEvent::Batch(_)));

        for request in transport.requests_for("projects") {
            assert_eq!(request.offset, "3_0");
        }
    }

    #[tokio::test]
    async fn test_request_timeout_is_retried() {
        let transport = Arc::new(ScriptedTransport::new());
        let mut sub = subscribe(&transport, None);

        match next(&mut sub).await {
            ShapeEvent::Retrying { error, .. } => assert!(error.contains("timed out")),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_page_is_not_half_applied() {
        let transport = Arc::new(ScriptedTransport::new());
        let bad = WireMessage {
            key: Some(r#""public"."projects"/"p2""#.into()),
            value: None,
            headers: crate::shape::WireHeaders {
                operation: Some("insert".into()),
                control: None,
            },
        };
        transport.push(
            "projects",
            ShapeResponse::messages(
                "h1",
                "1_0",
                vec![WireMessage::insert("p1", json!({"id": "p1"})), bad],
            ),
        );
        transport.push_rows("projects", "h1", "1_0", vec![json!({"id": "p1"})]);

        let mut sub = subscribe(&transport, None);
        assert!(matches!(next(&mut sub).await, ShapeEvent::Retrying { .. }));
        match next(&mut sub).await {
            ShapeEvent::Batch(batch) => assert_eq!(batch.operations.len(), 1),
            other => panic!("expected batch, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_request() {
        let transport = Arc::new(ScriptedTransport::new());
        let cancel = CancelSignal::new();
        let mut sub = ShapeSubscription::start(
            Arc::clone(&transport),
            TableSpec::new("projects"),
            None,
            SyncSettings::default(),
            cancel.clone(),
        );

        let waiter = tokio::spawn(async move { sub.next_event().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test]
    async fn test_into_stream_ends_on_cancel() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.push_rows("projects", "h1", "0_0", vec![json!({"id": "p1"})]);
        let cancel = CancelSignal::new();
        let sub = ShapeSubscription::start(
            Arc::clone(&transport),
            TableSpec::new("projects"),
            None,
            SyncSettings::default(),
            cancel.clone(),
        );

        let mut stream = Box::pin(sub.into_stream());
        assert!(matches!(stream.next().await, Some(ShapeEvent::Batch(_))));
        cancel.cancel();
        assert!(stream.next().await.is_none());
    }
}
