use chrono::Utc;
use sqlx::SqliteConnection;

use super::EmbeddedDb;
use crate::error::SyncResult;
use crate::shape::ShapeCursor;

/// Bookkeeping for shape cursors, table ownership and session status.
#[derive(Clone)]
pub struct CursorRepository {
    db: EmbeddedDb,
}

/// A persisted cursor with its table and last write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorRecord {
    pub table_name: String,
    pub cursor: ShapeCursor,
    pub updated_at: String,
}

#[derive(sqlx::FromRow)]
struct CursorRow {
    table_name: String,
    handle: String,
    offset: String,
    updated_at: String,
}

impl From<CursorRow> for CursorRecord {
    fn from(row: CursorRow) -> Self {
        CursorRecord {
            table_name: row.table_name,
            cursor: ShapeCursor::new(row.handle, row.offset),
            updated_at: row.updated_at,
        }
    }
}

impl CursorRepository {
    pub fn new(db: EmbeddedDb) -> Self {
        Self { db }
    }

    /// Loads the cursor a session last committed for a table.
    pub async fn load_cursor(
        &self,
        session_key: &str,
        table_name: &str,
    ) -> SyncResult<Option<ShapeCursor>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"SELECT handle, "offset" FROM _mason_cursors WHERE session_key = ? AND table_name = ?"#,
        )
        .bind(session_key)
        .bind(table_name)
        .fetch_optional(&self.db.pool())
        .await?;

        Ok(row.map(|(handle, offset)| ShapeCursor::new(handle, offset)))
    }

    /// Lists every cursor persisted for a session.
    pub async fn list_cursors(&self, session_key: &str) -> SyncResult<Vec<CursorRecord>> {
        let rows: Vec<CursorRow> = sqlx::query_as(
            r#"
            SELECT table_name, handle, "offset", updated_at
            FROM _mason_cursors
            WHERE session_key = ?
            ORDER BY table_name
            "#,
        )
        .bind(session_key)
        .fetch_all(&self.db.pool())
        .await?;

        Ok(rows.into_iter().map(CursorRecord::from).collect())
    }

    /// The session whose rows are currently materialized in a table.
    pub async fn table_owner(&self, table_name: &str) -> SyncResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT session_key FROM _mason_tables WHERE table_name = ?")
                .bind(table_name)
                .fetch_optional(&self.db.pool())
                .await?;

        Ok(row.map(|(session_key,)| session_key))
    }

    /// Returns the cursor to resume from, if the table still holds this
    /// session's rows.
    pub async fn resumable_cursor(
        &self,
        session_key: &str,
        table_name: &str,
    ) -> SyncResult<Option<ShapeCursor>> {
        match self.table_owner(table_name).await? {
            Some(owner) if owner == session_key => self.load_cursor(session_key, table_name).await,
            _ => Ok(None),
        }
    }

    pub async fn save_session_status(&self, session_key: &str, status: &str) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO _mason_sessions (session_key, status, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(session_key) DO UPDATE SET status = excluded.status, updated_at = excluded.updated_at
            "#,
        )
        .bind(session_key)
        .bind(status)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.db.pool())
        .await?;

        Ok(())
    }

    pub async fn load_session_status(&self, session_key: &str) -> SyncResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT status FROM _mason_sessions WHERE session_key = ?")
                .bind(session_key)
                .fetch_optional(&self.db.pool())
                .await?;

        Ok(row.map(|(status,)| status))
    }

    /// Forgets one table's cursor so the next subscription starts from a snapshot.
    pub async fn clear_cursor(&self, session_key: &str, table_name: &str) -> SyncResult<()> {
        sqlx::query("DELETE FROM _mason_cursors WHERE session_key = ? AND table_name = ?")
            .bind(session_key)
            .bind(table_name)
            .execute(&self.db.pool())
            .await?;

        Ok(())
    }

    /// Forgets every cursor and table claim held by a session.
    pub async fn clear_session(&self, session_key: &str) -> SyncResult<u64> {
        let mut tx = self.db.pool().begin().await?;

        let result = sqlx::query("DELETE FROM _mason_cursors WHERE session_key = ?")
            .bind(session_key)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM _mason_tables WHERE session_key = ?")
            .bind(session_key)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(result.rows_affected())
    }
}

/// Writes a cursor inside the caller's transaction.
pub(crate) async fn save_cursor(
    conn: &mut SqliteConnection,
    session_key: &str,
    table_name: &str,
    cursor: &ShapeCursor,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO _mason_cursors (session_key, table_name, handle, "offset", updated_at)
        VALUES (?, ?, ?, ?, ?)
        ON CONFLICT(session_key, table_name) DO UPDATE SET
            handle = excluded.handle,
            "offset" = excluded."offset",
            updated_at = excluded.updated_at
        "#,
    )
    .bind(session_key)
    .bind(table_name)
    .bind(&cursor.handle)
    .bind(&cursor.offset)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Records which session's rows a table holds, inside the caller's transaction.
pub(crate) async fn mark_table_owner(
    conn: &mut SqliteConnection,
    session_key: &str,
    table_name: &str,
) -> SyncResult<()> {
    sqlx::query(
        r#"
        INSERT INTO _mason_tables (table_name, session_key, loaded_at)
        VALUES (?, ?, ?)
        ON CONFLICT(table_name) DO UPDATE SET session_key = excluded.session_key, loaded_at = excluded.loaded_at
        "#,
    )
    .bind(table_name)
    .bind(session_key)
    .bind(Utc::now().to_rfc3339())
    .execute(&mut *conn)
    .await?;

    Ok(())
}
