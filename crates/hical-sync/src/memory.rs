//! In-process cloud backend for tests and offline runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hical_core::{AppResult, TransportError};
use hical_events::Event;
use parking_lot::Mutex;

use crate::backend::{
    BackupReceipt, BackupSnapshot, CloudBackend, PullResponse, RemoteChange, UploadAck,
};

struct Stored {
    change: RemoteChange,
    received_at: DateTime<Utc>,
}

#[derive(Default)]
struct Remote {
    records: BTreeMap<String, Stored>,
    backups: Vec<BackupSnapshot>,
}

/// Keeps the newest version of each record, tombstones included.
#[derive(Default)]
pub struct MemoryCloudBackend {
    remote: Mutex<Remote>,
    unavailable: AtomicBool,
}

impl MemoryCloudBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Write a record as another device would.
    pub fn put(&self, change: RemoteChange) {
        store_newest(&mut self.remote.lock(), change, Utc::now());
    }

    pub fn get(&self, id: &str) -> Option<RemoteChange> {
        self.remote.lock().records.get(id).map(|s| s.change.clone())
    }

    /// Non-deleted events currently held.
    pub fn live_events(&self) -> Vec<Event> {
        live_events(&self.remote.lock())
    }

    pub fn backups(&self) -> Vec<BackupSnapshot> {
        self.remote.lock().backups.clone()
    }

    fn check_available(&self) -> Result<(), TransportError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "cloud backend unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn store_newest(remote: &mut Remote, change: RemoteChange, received_at: DateTime<Utc>) -> bool {
    if let Some(existing) = remote.records.get(&change.id) {
        if existing.change.updated_at > change.updated_at {
            return false;
        }
    }
    remote.records.insert(
        change.id.clone(),
        Stored {
            change,
            received_at,
        },
    );
    true
}

fn live_events(remote: &Remote) -> Vec<Event> {
    remote
        .records
        .values()
        .filter(|s| !s.change.deleted)
        .filter_map(|s| s.change.event.clone())
        .collect()
}

#[async_trait]
impl CloudBackend for MemoryCloudBackend {
    async fn upload(&self, changes: &[RemoteChange]) -> AppResult<UploadAck> {
        self.check_available()?;
        let now = Utc::now();
        let mut remote = self.remote.lock();
        for change in changes {
            if !store_newest(&mut remote, change.clone(), now) {
                tracing::debug!(id = %change.id, "Ignoring stale upload");
            }
        }
        Ok(UploadAck {
            accepted: changes.len(),
            server_time: now,
        })
    }

    async fn download(&self, since: Option<DateTime<Utc>>) -> AppResult<PullResponse> {
        self.check_available()?;
        let now = Utc::now();
        let remote = self.remote.lock();
        let mut stored: Vec<&Stored> = remote
            .records
            .values()
            .filter(|s| since.map_or(true, |since| s.received_at > since))
            .collect();
        stored.sort_by_key(|s| s.received_at);
        Ok(PullResponse {
            changes: stored.into_iter().map(|s| s.change.clone()).collect(),
            server_time: Some(now),
        })
    }

    async fn create_backup(&self) -> AppResult<BackupReceipt> {
        self.check_available()?;
        let mut remote = self.remote.lock();
        let snapshot = BackupSnapshot {
            events: live_events(&remote),
            backup_timestamp: Utc::now(),
            version: "1.0".to_string(),
        };
        remote.backups.push(snapshot.clone());
        Ok(BackupReceipt {
            events_count: snapshot.events.len(),
            snapshot,
        })
    }

    async fn restore(&self, snapshot: &BackupSnapshot) -> AppResult<()> {
        self.check_available()?;
        let now = Utc::now();
        let mut remote = self.remote.lock();
        remote.records.clear();
        for event in &snapshot.events {
            store_newest(&mut remote, RemoteChange::upsert(event.clone()), now);
        }
        Ok(())
    }
}
