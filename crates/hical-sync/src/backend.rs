//! Cloud backend port and the records exchanged through it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hical_core::AppResult;
use hical_events::Event;
use serde::{Deserialize, Serialize};

/// One record as the backend stores it. Deleted records stay behind as
/// tombstones so a stale copy elsewhere cannot resurrect them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub id: String,
    /// Last modification, used for last-modified-wins.
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<Event>,
}

impl RemoteChange {
    pub fn upsert(event: Event) -> Self {
        Self {
            id: event.id.clone(),
            updated_at: event.updated_at,
            deleted: false,
            event: Some(event),
        }
    }

    pub fn tombstone(id: impl Into<String>, deleted_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            updated_at: deleted_at,
            deleted: true,
            event: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadAck {
    pub accepted: usize,
    pub server_time: DateTime<Utc>,
}

/// Changes received by the backend after a cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    pub changes: Vec<RemoteChange>,
    /// Cursor for the next incremental download.
    pub server_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub events: Vec<Event>,
    pub backup_timestamp: DateTime<Utc>,
    #[serde(default = "default_backup_version")]
    pub version: String,
}

fn default_backup_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackupReceipt {
    pub events_count: usize,
    pub snapshot: BackupSnapshot,
}

/// Remote storage for member data.
///
/// Both `upload` and `download` must be idempotent; the engine may repeat them
/// after a failed pass.
#[async_trait]
pub trait CloudBackend: Send + Sync {
    async fn upload(&self, changes: &[RemoteChange]) -> AppResult<UploadAck>;

    /// Changes received after `since`, oldest first. `None` returns everything.
    async fn download(&self, since: Option<DateTime<Utc>>) -> AppResult<PullResponse>;

    async fn create_backup(&self) -> AppResult<BackupReceipt>;

    /// Replace the remote data set with `snapshot`.
    async fn restore(&self, snapshot: &BackupSnapshot) -> AppResult<()>;
}
