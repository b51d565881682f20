//! Sync status machine and the persisted record of past syncs.

use std::path::Path;

use chrono::{DateTime, Utc};
use hical_core::AppResult;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

/// Cloud sync status. Only one sync runs at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStatus {
    #[default]
    Idle,
    Syncing,
    Completed,
    Failed,
}

impl SyncStatus {
    /// True if a new sync can be started.
    pub fn can_start(self) -> bool {
        !matches!(self, SyncStatus::Syncing)
    }

    /// State after a sync finished.
    pub fn on_finished(self, success: bool) -> Self {
        if success {
            SyncStatus::Completed
        } else {
            SyncStatus::Failed
        }
    }
}

const LAST_SYNC_TIME: &str = "last_sync_time";
const CURSOR: &str = "cursor";
const LAST_OUTCOME: &str = "last_outcome";
const LAST_ERROR: &str = "last_error";

/// Key/value table surviving restarts.
pub struct SyncStateStore {
    conn: Mutex<Connection>,
}

impl SyncStateStore {
    /// Open the state database at the given path.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the file cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// # Errors
    /// Returns `AppError::Database` if the schema cannot be created.
    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT value FROM sync_state WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn get_time(&self, key: &str) -> AppResult<Option<DateTime<Utc>>> {
        Ok(self
            .get(key)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// When the last successful sync finished.
    pub fn last_sync_time(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.get_time(LAST_SYNC_TIME)
    }

    /// Backend cursor for incremental downloads.
    pub fn cursor(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.get_time(CURSOR)
    }

    /// `None` before the first sync.
    pub fn last_succeeded(&self) -> AppResult<Option<bool>> {
        Ok(self.get(LAST_OUTCOME)?.map(|s| s == "success"))
    }

    pub fn last_error(&self) -> AppResult<Option<String>> {
        self.get(LAST_ERROR)
    }

    pub fn record_success(
        &self,
        finished_at: DateTime<Utc>,
        cursor: Option<DateTime<Utc>>,
    ) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert(&tx, LAST_SYNC_TIME, &finished_at.to_rfc3339())?;
        if let Some(cursor) = cursor {
            upsert(&tx, CURSOR, &cursor.to_rfc3339())?;
        }
        upsert(&tx, LAST_OUTCOME, "success")?;
        tx.execute("DELETE FROM sync_state WHERE key = ?1", params![LAST_ERROR])?;
        tx.commit()?;
        Ok(())
    }

    /// Record a failure. The last successful sync time is kept.
    pub fn record_failure(&self, message: &str) -> AppResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        upsert(&tx, LAST_OUTCOME, "failure")?;
        upsert(&tx, LAST_ERROR, message)?;
        tx.commit()?;
        Ok(())
    }
}

fn upsert(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?1, ?2)",
        params![key, value],
    )
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[test]
    fn syncing_blocks_start() {
        assert!(SyncStatus::Idle.can_start());
        assert!(SyncStatus::Completed.can_start());
        assert!(SyncStatus::Failed.can_start());
        assert!(!SyncStatus::Syncing.can_start());
    }

    #[test]
    fn finish_transitions() {
        assert_eq!(SyncStatus::Syncing.on_finished(true), SyncStatus::Completed);
        assert_eq!(SyncStatus::Syncing.on_finished(false), SyncStatus::Failed);
    }

    #[test]
    fn test_empty_state() {
        let state = SyncStateStore::in_memory().unwrap();
        assert!(state.last_sync_time().unwrap().is_none());
        assert!(state.last_succeeded().unwrap().is_none());
    }

    #[test]
    fn test_failure_keeps_last_success_time() {
        let state = SyncStateStore::in_memory().unwrap();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        state.record_success(at, Some(at)).unwrap();
        state.record_failure("connection reset").unwrap();

        assert_eq!(state.last_sync_time().unwrap(), Some(at));
        assert_eq!(state.last_succeeded().unwrap(), Some(false));
        assert_eq!(state.last_error().unwrap().as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_state_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cloud_sync.db");
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        {
            let state = SyncStateStore::open(&path).unwrap();
            state.record_success(at, None).unwrap();
        }
        let state = SyncStateStore::open(&path).unwrap();
        assert_eq!(state.last_sync_time().unwrap(), Some(at));
        assert_eq!(state.last_succeeded().unwrap(), Some(true));
        assert!(state.cursor().unwrap().is_none());
    }
}
