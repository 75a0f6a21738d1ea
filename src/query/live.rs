use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

use super::observers::{ObserverGuard, QueryObservers};
use super::value::{bind_params, row_to_json, JsonRow};
use crate::db::EmbeddedDb;
use crate::error::SyncResult;

/// Read access to the replica for application code.
///
/// Queries run on `query_only` connections, so statements that write fail
/// with [`SyncError::Database`](crate::error::SyncError::Database).
#[derive(Clone)]
pub struct LiveQueries {
    db: EmbeddedDb,
    observers: Arc<QueryObservers>,
}

impl LiveQueries {
    pub fn new(db: EmbeddedDb, observers: Arc<QueryObservers>) -> Self {
        Self { db, observers }
    }

    /// Runs a query once against committed replica state.
    pub async fn query(&self, sql: &str, params: &[Value]) -> SyncResult<Vec<JsonRow>> {
        run_query(&self.db, sql, params).await
    }

    /// Runs a query and keeps it registered for re-evaluation.
    ///
    /// The query is re-run after every commit to a table it references. When
    /// no replicated table name appears in the SQL it is re-run after every
    /// commit.
    pub async fn live_query(
        &self,
        sql: impl Into<String>,
        params: Vec<Value>,
    ) -> SyncResult<LiveQuery> {
        let sql = sql.into();
        let tables = referenced_tables(&sql, &self.observers.known_tables());

        // Register before the first read so no commit slips in between.
        let (guard, updates) = self.observers.subscribe(tables.clone());
        let rows = run_query(&self.db, &sql, &params).await?;
        debug!(?tables, rows = rows.len(), "registered live query");

        Ok(LiveQuery {
            db: self.db.clone(),
            sql,
            params,
            tables,
            rows,
            updates,
            _guard: guard,
        })
    }
}

/// A query whose results follow replica commits.
///
/// Dropping it, or calling [`LiveQuery::cancel`], unregisters it.
pub struct LiveQuery {
    db: EmbeddedDb,
    sql: String,
    params: Vec<Value>,
    tables: Option<HashSet<String>>,
    rows: Vec<JsonRow>,
    updates: mpsc::UnboundedReceiver<String>,
    _guard: ObserverGuard,
}

impl LiveQuery {
    /// The latest results.
    pub fn rows(&self) -> &[JsonRow] {
        &self.rows
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Tables this query is re-evaluated for; `None` means all of them.
    pub fn watched_tables(&self) -> Option<&HashSet<String>> {
        self.tables.as_ref()
    }

    /// Waits for a commit to a watched table, then re-runs the query.
    ///
    /// Commits that piled up while waiting cause one re-run. Returns
    /// `Ok(None)` once the replica stops publishing changes.
    pub async fn changed(&mut self) -> SyncResult<Option<&[JsonRow]>> {
        if self.updates.recv().await.is_none() {
            return Ok(None);
        }
        while self.updates.try_recv().is_ok() {}

        self.rows = run_query(&self.db, &self.sql, &self.params).await?;
        Ok(Some(&self.rows))
    }

    /// Stops following changes.
    pub fn cancel(self) {}
}

async fn run_query(db: &EmbeddedDb, sql: &str, params: &[Value]) -> SyncResult<Vec<JsonRow>> {
    let pool = db.read_pool();
    let rows = bind_params(sqlx::query(sql), params)
        .fetch_all(&pool)
        .await?;
    rows.iter().map(row_to_json).collect()
}

/// Finds which of the known tables a SQL statement mentions.
///
/// This is a word scan rather than a parse, so it can over-match (a column
/// named like a table) but never misses a quoted or bare table name.
/// Returns `None` when nothing matched.
pub fn referenced_tables(sql: &str, known: &HashSet<String>) -> Option<HashSet<String>> {
    let found: HashSet<String> = sql
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|word| !word.is_empty())
        .filter_map(|word| {
            known
                .iter()
                .find(|table| table.eq_ignore_ascii_case(word))
                .cloned()
        })
        .collect();

    if found.is_empty() {
        None
    } else {
        Some(found)
    }
}
