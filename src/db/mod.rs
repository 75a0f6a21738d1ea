mod cursor_repo;

pub use cursor_repo::{CursorRecord, CursorRepository};
pub(crate) use cursor_repo::{mark_table_owner, save_cursor};

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};

/// Shared handle to the embedded replica database.
///
/// Clones share one pool. After [`EmbeddedDb::reconnect`] every clone sees
/// the fresh pool, so callers should fetch [`EmbeddedDb::pool`] per operation
/// instead of holding on to it.
#[derive(Clone)]
pub struct EmbeddedDb {
    inner: Arc<DbInner>,
}

struct DbInner {
    path: PathBuf,
    pools: RwLock<Pools>,
}

struct Pools {
    write: SqlitePool,
    read: SqlitePool,
}

impl EmbeddedDb {
    /// Opens (creating if needed) the database at `path` and runs migrations.
    pub async fn open(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let pools = connect(&path).await?;
        info!(path = %path.display(), "opened embedded database");
        Ok(Self {
            inner: Arc::new(DbInner {
                path,
                pools: RwLock::new(pools),
            }),
        })
    }

    /// The current read-write connection pool.
    pub fn pool(&self) -> SqlitePool {
        self.inner.pools.read().write.clone()
    }

    /// The current pool of `query_only` connections. Any statement that
    /// writes fails on these.
    pub fn read_pool(&self) -> SqlitePool {
        self.inner.pools.read().read.clone()
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Runs a trivial query to confirm the handle still works.
    pub async fn probe(&self, timeout: Duration) -> SyncResult<()> {
        let pool = self.pool();
        match tokio::time::timeout(timeout, sqlx::query("SELECT 1").execute(&pool)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(SyncError::ConnectionDead(e.to_string())),
            Err(_) => Err(SyncError::ConnectionDead(format!(
                "probe did not answer within {:?}",
                timeout
            ))),
        }
    }

    /// Replaces both pools with freshly opened ones and closes the old ones.
    pub async fn reconnect(&self) -> SyncResult<()> {
        let fresh = connect(&self.inner.path).await?;
        let old = std::mem::replace(&mut *self.inner.pools.write(), fresh);
        old.write.close().await;
        old.read.close().await;
        info!(path = %self.inner.path.display(), "reconnected embedded database");
        Ok(())
    }

    /// Closes both pools. Later operations fail until [`EmbeddedDb::reconnect`].
    pub async fn close(&self) {
        self.pool().close().await;
        self.read_pool().close().await;
        debug!(path = %self.inner.path.display(), "closed embedded database");
    }
}

async fn connect(path: &Path) -> SyncResult<Pools> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let db_url = format!("sqlite:{}?mode=rwc", path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let write = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options.clone())
        .await?;

    sqlx::migrate!("./migrations").run(&write).await?;

    let read = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options.pragma("query_only", Cow::Borrowed("ON")))
        .await?;

    Ok(Pools { write, read })
}
