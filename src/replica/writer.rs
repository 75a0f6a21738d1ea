use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use tracing::{debug, info};

use super::TableSpec;
use crate::db::{mark_table_owner, save_cursor, EmbeddedDb};
use crate::error::{SyncError, SyncResult};
use crate::query::QueryObservers;
use crate::shape::{ChangeBatch, ChangeKind, ChangeOperation};

/// Rows per statement on the bulk snapshot path.
const BULK_CHUNK_ROWS: usize = 400;

/// How long a delete keeps blocking late updates of its row by default.
pub const DEFAULT_TOMBSTONE_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Counts from one committed batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Operations that changed a row.
    pub applied: usize,
    /// Updates suppressed because their row was deleted.
    pub skipped: usize,
}

impl ApplyOutcome {
    fn record(&mut self, effect: Effect) {
        match effect {
            Effect::Applied => self.applied += 1,
            Effect::Skipped => self.skipped += 1,
            Effect::Unchanged => {}
        }
    }
}

/// What a single operation did to the replica.
enum Effect {
    Applied,
    Skipped,
    Unchanged,
}

/// Applies shape batches to replica tables.
///
/// Each batch and its cursor are committed in one transaction. Live queries
/// are notified only after the commit succeeds.
#[derive(Clone)]
pub struct ReplicaWriter {
    db: EmbeddedDb,
    observers: Arc<QueryObservers>,
    tombstone_retention: Duration,
}

impl ReplicaWriter {
    pub fn new(db: EmbeddedDb, observers: Arc<QueryObservers>) -> Self {
        Self {
            db,
            observers,
            tombstone_retention: DEFAULT_TOMBSTONE_RETENTION,
        }
    }

    /// Sets how long tombstones are kept. Older ones are pruned as batches
    /// for their table commit.
    pub fn with_tombstone_retention(mut self, retention: Duration) -> Self {
        self.tombstone_retention = retention;
        self
    }

    pub fn db(&self) -> &EmbeddedDb {
        &self.db
    }

    /// Creates the replica table if it does not exist.
    pub async fn ensure_table(&self, table: &TableSpec) -> SyncResult<()> {
        table.validate()?;
        let mut conn = self.db.pool().acquire().await?;
        create_table(&mut conn, table).await?;
        self.observers.register_table(&table.name);
        Ok(())
    }

    /// Applies an incremental batch and advances the session's cursor.
    ///
    /// If any operation fails nothing is written, including the cursor. The
    /// table must exist; a missing table is an apply failure that only a
    /// snapshot load repairs.
    pub async fn apply_batch(
        &self,
        session_key: &str,
        table: &TableSpec,
        batch: &ChangeBatch,
    ) -> SyncResult<ApplyOutcome> {
        check_batch_table(table, batch)?;

        let mut tx = self.db.pool().begin().await?;
        let pruned = prune_tombstones(&mut tx, table, self.tombstone_retention).await?;
        let mut outcome = ApplyOutcome::default();
        for op in &batch.operations {
            outcome.record(apply_operation(&mut tx, table, op).await?);
        }

        save_cursor(&mut tx, session_key, &table.name, &batch.cursor).await?;
        mark_table_owner(&mut tx, session_key, &table.name).await?;
        tx.commit().await?;

        debug!(
            table = %table.name,
            applied = outcome.applied,
            skipped = outcome.skipped,
            pruned,
            cursor = %batch.cursor,
            "applied batch"
        );
        self.observers.notify(&table.name);
        Ok(outcome)
    }

    /// Replaces the table's contents with a full snapshot.
    ///
    /// Leading inserts are written in multi-row statements; anything after
    /// the first non-insert goes through the per-operation path. The result
    /// is the same as applying every operation individually to an empty
    /// table.
    pub async fn load_snapshot(
        &self,
        session_key: &str,
        table: &TableSpec,
        batch: &ChangeBatch,
    ) -> SyncResult<ApplyOutcome> {
        check_batch_table(table, batch)?;

        let split = batch
            .operations
            .iter()
            .position(|op| op.kind != ChangeKind::Insert)
            .unwrap_or(batch.operations.len());
        let (inserts, rest) = batch.operations.split_at(split);

        let mut rows = Vec::with_capacity(inserts.len());
        for op in inserts {
            rows.push((op.key.as_str(), encode_row(table, op)?));
        }

        let quoted = table.quoted_name();
        let mut tx = self.db.pool().begin().await?;
        create_table(&mut tx, table).await?;

        sqlx::query(&format!("DELETE FROM {}", quoted))
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM _mason_tombstones WHERE table_name = ?")
            .bind(&table.name)
            .execute(&mut *tx)
            .await?;

        for chunk in rows.chunks(BULK_CHUNK_ROWS) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new(format!("INSERT OR REPLACE INTO {} (pk, row) ", quoted));
            builder.push_values(chunk, |mut b, (key, row)| {
                b.push_bind(*key).push_bind(row.as_str());
            });
            builder.build().execute(&mut *tx).await?;
        }

        let mut outcome = ApplyOutcome {
            applied: rows.len(),
            skipped: 0,
        };
        for op in rest {
            outcome.record(apply_operation(&mut tx, table, op).await?);
        }

        save_cursor(&mut tx, session_key, &table.name, &batch.cursor).await?;
        mark_table_owner(&mut tx, session_key, &table.name).await?;
        tx.commit().await?;

        info!(table = %table.name, rows = outcome.applied, "loaded table snapshot");
        self.observers.notify(&table.name);
        Ok(outcome)
    }

    pub async fn row_count(&self, table: &TableSpec) -> SyncResult<i64> {
        let (count,): (i64,) =
            sqlx::query_as(&format!("SELECT COUNT(*) FROM {}", table.quoted_name()))
                .fetch_one(&self.db.pool())
                .await?;
        Ok(count)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

async fn prune_tombstones(
    conn: &mut SqliteConnection,
    table: &TableSpec,
    retention: Duration,
) -> SyncResult<u64> {
    let Some(cutoff) = chrono::Duration::from_std(retention)
        .ok()
        .and_then(|retention| Utc::now().checked_sub_signed(retention))
    else {
        return Ok(0);
    };
    let result = sqlx::query("DELETE FROM _mason_tombstones WHERE table_name = ? AND deleted_at < ?")
        .bind(&table.name)
        .bind(timestamp(cutoff))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

fn check_batch_table(table: &TableSpec, batch: &ChangeBatch) -> SyncResult<()> {
    if batch.table != table.name {
        return Err(SyncError::InvalidTable {
            name: batch.table.clone(),
            reason: format!("batch delivered to table '{}'", table.name),
        });
    }
    Ok(())
}

async fn create_table(conn: &mut SqliteConnection, table: &TableSpec) -> SyncResult<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (pk TEXT PRIMARY KEY NOT NULL, row TEXT NOT NULL)",
        table.quoted_name()
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn payload<'a>(table: &TableSpec, op: &'a ChangeOperation) -> SyncResult<&'a Map<String, Value>> {
    op.value.as_ref().ok_or_else(|| SyncError::MissingPayload {
        table: table.name.clone(),
        key: op.key.clone(),
        kind: op.kind.as_str(),
    })
}

fn encode_row(table: &TableSpec, op: &ChangeOperation) -> SyncResult<String> {
    let row = payload(table, op)?;
    serde_json::to_string(row).map_err(|e| SyncError::Decode(e.to_string()))
}

async fn apply_operation(
    conn: &mut SqliteConnection,
    table: &TableSpec,
    op: &ChangeOperation,
) -> SyncResult<Effect> {
    let quoted = table.quoted_name();
    match op.kind {
        ChangeKind::Insert => {
            let row = encode_row(table, op)?;
            upsert_row(conn, &quoted, &op.key, &row).await?;
            sqlx::query("DELETE FROM _mason_tombstones WHERE table_name = ? AND pk = ?")
                .bind(&table.name)
                .bind(&op.key)
                .execute(&mut *conn)
                .await?;
            Ok(Effect::Applied)
        }
        ChangeKind::Update => {
            let changes = payload(table, op)?;
            let current: Option<(String,)> =
                sqlx::query_as(&format!("SELECT row FROM {} WHERE pk = ?", quoted))
                    .bind(&op.key)
                    .fetch_optional(&mut *conn)
                    .await?;

            if let Some((current,)) = current {
                // Updates carry whole column values; nested objects are
                // replaced, never merged.
                let mut row: Map<String, Value> = serde_json::from_str(&current)
                    .map_err(|e| SyncError::Decode(e.to_string()))?;
                for (column, value) in changes {
                    row.insert(column.clone(), value.clone());
                }
                let row = serde_json::to_string(&row)
                    .map_err(|e| SyncError::Decode(e.to_string()))?;
                sqlx::query(&format!("UPDATE {} SET row = ? WHERE pk = ?", quoted))
                    .bind(&row)
                    .bind(&op.key)
                    .execute(&mut *conn)
                    .await?;
                return Ok(Effect::Applied);
            }

            let tombstone: Option<(String,)> = sqlx::query_as(
                "SELECT pk FROM _mason_tombstones WHERE table_name = ? AND pk = ?",
            )
            .bind(&table.name)
            .bind(&op.key)
            .fetch_optional(&mut *conn)
            .await?;
            if tombstone.is_some() {
                debug!(table = %table.name, key = %op.key, "skipping update for deleted row");
                return Ok(Effect::Skipped);
            }

            // An update for a row this replica never saw carries the best
            // state we have.
            let row = encode_row(table, op)?;
            upsert_row(conn, &quoted, &op.key, &row).await?;
            Ok(Effect::Applied)
        }
        ChangeKind::Delete => {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE pk = ?", quoted))
                .bind(&op.key)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                r#"
                INSERT INTO _mason_tombstones (table_name, pk, deleted_at)
                VALUES (?, ?, ?)
                ON CONFLICT(table_name, pk) DO UPDATE SET deleted_at = excluded.deleted_at
                "#,
            )
            .bind(&table.name)
            .bind(&op.key)
            .bind(timestamp(Utc::now()))
            .execute(&mut *conn)
            .await?;
            if result.rows_affected() > 0 {
                Ok(Effect::Applied)
            } else {
                Ok(Effect::Unchanged)
            }
        }
    }
}

async fn upsert_row(
    conn: &mut SqliteConnection,
    quoted: &str,
    key: &str,
    row: &str,
) -> SyncResult<()> {
    sqlx::query(&format!(
        "INSERT INTO {} (pk, row) VALUES (?, ?) ON CONFLICT(pk) DO UPDATE SET row = excluded.row",
        quoted
    ))
    .bind(key)
    .bind(row)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::CursorRepository;
    use crate::shape::{ReplicationMode, ShapeCursor, ShapeMessage, WireMessage};
    use serde_json::json;
    use tempfile::{tempdir, TempDir};

    const SESSION: &str = "ws-1";

    struct Fixture {
        _dir: TempDir,
        db: EmbeddedDb,
        observers: Arc<QueryObservers>,
        writer: ReplicaWriter,
        table: TableSpec,
    }

    async fn setup() -> Fixture {
        let dir = tempdir().unwrap();
        let db = EmbeddedDb::open(dir.path().join("replica.db")).await.unwrap();
        let observers = QueryObservers::new();
        let writer = ReplicaWriter::new(db.clone(), Arc::clone(&observers));
        let table = TableSpec::new("projects");
        writer.ensure_table(&table).await.unwrap();
        Fixture {
            _dir: dir,
            db,
            observers,
            writer,
            table,
        }
    }

    fn obj(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    fn batch(mode: ReplicationMode, offset: &str, operations: Vec<ChangeOperation>) -> ChangeBatch {
        ChangeBatch {
            table: "projects".into(),
            mode,
            operations,
            cursor: ShapeCursor::new("h1", offset),
        }
    }

    fn insert(id: &str, name: &str) -> ChangeOperation {
        ChangeOperation::insert("projects", id, obj(json!({"id": id, "name": name})))
    }

    fn update(id: &str, changes: Value) -> ChangeOperation {
        ChangeOperation::update("projects", id, obj(changes))
    }

    async fn rows(db: &EmbeddedDb) -> Vec<(String, Value)> {
        let rows: Vec<(String, String)> =
            sqlx::query_as(r#"SELECT pk, row FROM "projects" ORDER BY pk"#)
                .fetch_all(&db.pool())
                .await
                .unwrap();
        rows.into_iter()
            .map(|(pk, row)| (pk, serde_json::from_str(&row).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_apply_insert_update_delete() {
        let f = setup().await;
        let outcome = f
            .writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "1_0",
                    vec![
                        insert("p1", "Site"),
                        insert("p2", "Office"),
                        update("p1", json!({"name": "Site A", "color": "red"})),
                        ChangeOperation::delete("projects", "p2"),
                    ],
                ),
            )
            .await
            .unwrap();
        assert_eq!(outcome.applied, 4);

        let rows = rows(&f.db).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].1,
            json!({"id": "p1", "name": "Site A", "color": "red"})
        );

        let cursor = CursorRepository::new(f.db.clone())
            .load_cursor(SESSION, "projects")
            .await
            .unwrap();
        assert_eq!(cursor, Some(ShapeCursor::new("h1", "1_0")));
    }

    #[tokio::test]
    async fn test_replaying_a_batch_is_idempotent() {
        let f = setup().await;
        let replayed = batch(
            ReplicationMode::Incremental,
            "2_0",
            vec![
                insert("p1", "Site"),
                update("p1", json!({"name": "Renamed"})),
                insert("p2", "Office"),
                ChangeOperation::delete("projects", "p2"),
            ],
        );

        f.writer.apply_batch(SESSION, &f.table, &replayed).await.unwrap();
        let first = rows(&f.db).await;
        f.writer.apply_batch(SESSION, &f.table, &replayed).await.unwrap();
        assert_eq!(rows(&f.db).await, first);
    }

    #[tokio::test]
    async fn test_update_after_delete_does_not_resurrect() {
        let f = setup().await;
        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "1_0",
                    vec![insert("p1", "Site"), ChangeOperation::delete("projects", "p1")],
                ),
            )
            .await
            .unwrap();

        let outcome = f
            .writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "2_0",
                    vec![update("p1", json!({"name": "Ghost"}))],
                ),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 0, skipped: 1 });
        assert!(rows(&f.db).await.is_empty());

        // A fresh insert clears the tombstone.
        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "3_0",
                    vec![insert("p1", "Back"), update("p1", json!({"name": "Back 2"}))],
                ),
            )
            .await
            .unwrap();
        assert_eq!(rows(&f.db).await[0].1["name"], json!("Back 2"));
    }

    #[tokio::test]
    async fn test_update_for_unknown_row_inserts_it() {
        let f = setup().await;
        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "1_0",
                    vec![update("p7", json!({"id": "p7", "name": "Late", "gone": null}))],
                ),
            )
            .await
            .unwrap();
        let rows = rows(&f.db).await;
        assert_eq!(
            rows,
            vec![(
                "p7".to_string(),
                json!({"id": "p7", "name": "Late", "gone": null})
            )]
        );
    }

    #[tokio::test]
    async fn test_delete_of_missing_row_is_noop() {
        let f = setup().await;
        let outcome = f
            .writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "1_0",
                    vec![ChangeOperation::delete("projects", "nope")],
                ),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome { applied: 0, skipped: 0 });
        assert!(rows(&f.db).await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_batch_leaves_rows_and_cursor_untouched() {
        let f = setup().await;
        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(ReplicationMode::Incremental, "1_0", vec![insert("p1", "Site")]),
            )
            .await
            .unwrap();

        let broken = ChangeOperation {
            table: "projects".into(),
            kind: ChangeKind::Insert,
            key: "p3".into(),
            value: None,
        };
        let err = f
            .writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "2_0",
                    vec![insert("p2", "Office"), broken],
                ),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingPayload { .. }));

        let rows = rows(&f.db).await;
        assert_eq!(rows.len(), 1);
        let cursor = CursorRepository::new(f.db.clone())
            .load_cursor(SESSION, "projects")
            .await
            .unwrap();
        assert_eq!(cursor, Some(ShapeCursor::new("h1", "1_0")));
    }

    #[tokio::test]
    async fn test_snapshot_matches_individual_inserts() {
        let f = setup().await;
        let operations: Vec<ChangeOperation> = (0..950)
            .map(|i| insert(&format!("p{:04}", i), &format!("Project {}", i)))
            .collect();

        let outcome = f
            .writer
            .load_snapshot(
                SESSION,
                &f.table,
                &batch(ReplicationMode::FullCopy, "0_0", operations.clone()),
            )
            .await
            .unwrap();
        assert_eq!(outcome.applied, 950);
        let bulk = rows(&f.db).await;

        let other = TableSpec::new("projects");
        let dir = tempdir().unwrap();
        let db = EmbeddedDb::open(dir.path().join("replica.db")).await.unwrap();
        let writer = ReplicaWriter::new(db.clone(), QueryObservers::new());
        writer.ensure_table(&other).await.unwrap();
        writer
            .apply_batch(
                SESSION,
                &other,
                &batch(ReplicationMode::Incremental, "0_0", operations),
            )
            .await
            .unwrap();

        assert_eq!(bulk, rows(&db).await);
        assert_eq!(f.writer.row_count(&f.table).await.unwrap(), 950);
    }

    #[tokio::test]
    async fn test_snapshot_replaces_existing_rows_and_tombstones() {
        let f = setup().await;
        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "1_0",
                    vec![
                        insert("old", "Old"),
                        insert("p1", "Gone"),
                        ChangeOperation::delete("projects", "p1"),
                    ],
                ),
            )
            .await
            .unwrap();

        f.writer
            .load_snapshot(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::FullCopy,
                    "0_0",
                    vec![
                        insert("p2", "New"),
                        insert("p3", "Newer"),
                        update("p3", json!({"name": "Newest"})),
                        update("p1", json!({"id": "p1", "name": "Revived"})),
                    ],
                ),
            )
            .await
            .unwrap();

        let rows = rows(&f.db).await;
        let keys: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["p1", "p2", "p3"]);
        assert_eq!(rows[2].1["name"], json!("Newest"));
    }

    #[tokio::test]
    async fn test_commit_notifies_observers() {
        let f = setup().await;
        let (_guard, mut rx) = f
            .observers
            .subscribe(Some(["projects".to_string()].into_iter().collect()));

        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(ReplicationMode::Incremental, "1_0", vec![insert("p1", "Site")]),
            )
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), "projects");
    }

    #[tokio::test]
    async fn test_failed_batch_does_not_notify() {
        let f = setup().await;
        let (_guard, mut rx) = f.observers.subscribe(None);
        let broken = ChangeOperation {
            table: "projects".into(),
            kind: ChangeKind::Update,
            key: "p1".into(),
            value: None,
        };
        assert!(f
            .writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(ReplicationMode::Incremental, "1_0", vec![broken]),
            )
            .await
            .is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_for_other_table_is_rejected() {
        let f = setup().await;
        let mut wrong = batch(ReplicationMode::Incremental, "1_0", vec![]);
        wrong.table = "tasks".into();
        let err = f
            .writer
            .apply_batch(SESSION, &f.table, &wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidTable { .. }));
    }

    #[tokio::test]
    async fn test_dropped_table_fails_until_snapshot() {
        let f = setup().await;
        sqlx::query(r#"DROP TABLE "projects""#)
            .execute(&f.db.pool())
            .await
            .unwrap();

        let err = f
            .writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(ReplicationMode::Incremental, "1_0", vec![insert("p1", "Site")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Database(_)));

        f.writer
            .load_snapshot(
                SESSION,
                &f.table,
                &batch(ReplicationMode::FullCopy, "0_0", vec![insert("p1", "Site")]),
            )
            .await
            .unwrap();
        assert_eq!(f.writer.row_count(&f.table).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_nested_columns() {
        let f = setup().await;
        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "1_0",
                    vec![ChangeOperation::insert(
                        "projects",
                        "p1",
                        obj(json!({"id": "p1", "name": "Site", "meta": {"a": 1}})),
                    )],
                ),
            )
            .await
            .unwrap();

        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(
                    ReplicationMode::Incremental,
                    "2_0",
                    vec![update("p1", json!({"id": "p1", "meta": {"b": 2}, "name": null}))],
                ),
            )
            .await
            .unwrap();

        let rows = rows(&f.db).await;
        assert_eq!(rows[0].1, json!({"id": "p1", "name": null, "meta": {"b": 2}}));
    }

    #[tokio::test]
    async fn test_delete_by_wire_key_removes_row() {
        let f = setup().await;
        let wire_key = r#""public"."projects"/"p1""#;
        let operations: Vec<ChangeOperation> = [
            WireMessage::insert(wire_key, json!({"id": "p1", "name": "Site"})),
            WireMessage::delete(wire_key, None),
        ]
        .iter()
        .map(|m| match m.classify(&f.table).unwrap() {
            ShapeMessage::Change(op) => op,
            other => panic!("expected change, got {:?}", other),
        })
        .collect();

        f.writer
            .apply_batch(
                SESSION,
                &f.table,
                &batch(ReplicationMode::Incremental, "1_0", operations),
            )
            .await
            .unwrap();
        assert_eq!(f.writer.row_count(&f.table).await.unwrap(), 0);
    }

    async fn tombstone_count(db: &EmbeddedDb) -> i64 {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM _mason_tombstones")
            .fetch_one(&db.pool())
            .await
            .unwrap();
        count
    }

    #[tokio::test]
    async fn test_expired_tombstones_are_pruned() {
        let f = setup().await;
        let delete_p1 = batch(
            ReplicationMode::Incremental,
            "1_0",
            vec![insert("p1", "Site"), ChangeOperation::delete("projects", "p1")],
        );
        let insert_p2 = batch(ReplicationMode::Incremental, "2_0", vec![insert("p2", "Office")]);

        // Default retention keeps the tombstone across batches.
        f.writer.apply_batch(SESSION, &f.table, &delete_p1).await.unwrap();
        f.writer.apply_batch(SESSION, &f.table, &insert_p2).await.unwrap();
        assert_eq!(tombstone_count(&f.db).await, 1);

        let short = f.writer.clone().with_tombstone_retention(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        short.apply_batch(SESSION, &f.table, &insert_p2).await.unwrap();
        assert_eq!(tombstone_count(&f.db).await, 0);
    }
}
