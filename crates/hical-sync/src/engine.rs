//! Cloud sync engine.
//!
//! A pass snapshots the store's dirty set, downloads remote changes, resolves
//! each conflict by last modification, uploads the local winners, and only
//! after the upload succeeds applies the remote winners locally. A failure or
//! cancellation at any point leaves the local store as it was.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use hical_core::{AppError, AppResult, CloudConfig, Entitlements};
use hical_events::{ChangeKind, EventStore, PendingChange};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::backend::{BackupSnapshot, CloudBackend, RemoteChange};
use crate::state::{SyncStateStore, SyncStatus};

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub success: bool,
    pub uploaded: usize,
    pub downloaded: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStats {
    pub local_event_count: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    /// No dirty events and the last sync succeeded.
    pub is_up_to_date: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    /// Dirty records only, remote changes since the stored cursor.
    Incremental,
    /// Every local record against the whole remote set.
    Full,
}

struct PassCounts {
    uploaded: usize,
    downloaded: usize,
    cursor: Option<DateTime<Utc>>,
}

/// Marks the engine busy until dropped.
struct InFlight<'a> {
    status: &'a Mutex<SyncStatus>,
    finished: bool,
}

impl InFlight<'_> {
    fn finish(mut self, success: bool) {
        let mut status = self.status.lock();
        *status = status.on_finished(success);
        self.finished = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.finished {
            *self.status.lock() = SyncStatus::Failed;
        }
    }
}

pub struct CloudSyncEngine {
    store: Arc<EventStore>,
    backend: Arc<dyn CloudBackend>,
    entitlements: Arc<dyn Entitlements>,
    state: SyncStateStore,
    status: Mutex<SyncStatus>,
    auto_sync_after: Duration,
}

impl CloudSyncEngine {
    pub fn new(
        store: Arc<EventStore>,
        backend: Arc<dyn CloudBackend>,
        entitlements: Arc<dyn Entitlements>,
        state: SyncStateStore,
        config: &CloudConfig,
    ) -> Self {
        Self {
            store,
            backend,
            entitlements,
            state,
            status: Mutex::new(SyncStatus::Idle),
            auto_sync_after: Duration::minutes(i64::from(config.auto_sync_after_minutes)),
        }
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.lock()
    }

    /// Sync dirty records. See [`incremental_sync_with`](Self::incremental_sync_with).
    ///
    /// # Errors
    /// Same as `incremental_sync_with`.
    pub async fn incremental_sync(&self) -> AppResult<SyncReport> {
        self.incremental_sync_with(&CancellationToken::new()).await
    }

    /// Sync dirty records, observing `cancel` between and during network calls.
    ///
    /// Transport, storage and cancellation failures are reported in the
    /// returned `SyncReport` with `success == false`.
    ///
    /// # Errors
    /// `FeatureLocked` without premium; `Busy` while another sync is running.
    pub async fn incremental_sync_with(&self, cancel: &CancellationToken) -> AppResult<SyncReport> {
        self.run(Pass::Incremental, cancel).await
    }

    /// Reconcile every local record with the complete remote set.
    ///
    /// # Errors
    /// `FeatureLocked` without premium; `Busy` while another sync is running.
    pub async fn perform_full_sync(&self) -> AppResult<SyncReport> {
        self.perform_full_sync_with(&CancellationToken::new()).await
    }

    /// # Errors
    /// Same as [`perform_full_sync`](Self::perform_full_sync).
    pub async fn perform_full_sync_with(
        &self,
        cancel: &CancellationToken,
    ) -> AppResult<SyncReport> {
        self.run(Pass::Full, cancel).await
    }

    async fn run(&self, pass: Pass, cancel: &CancellationToken) -> AppResult<SyncReport> {
        self.ensure_premium()?;
        let in_flight = self.begin()?;
        tracing::info!(?pass, "Cloud sync started");

        let report = match self.reconcile(pass, cancel).await {
            Ok(counts) => {
                if let Err(e) = self.state.record_success(Utc::now(), counts.cursor) {
                    tracing::warn!("Failed to record sync state: {}", e);
                }
                tracing::info!(
                    uploaded = counts.uploaded,
                    downloaded = counts.downloaded,
                    "Cloud sync completed"
                );
                SyncReport {
                    success: true,
                    uploaded: counts.uploaded,
                    downloaded: counts.downloaded,
                    error: None,
                }
            }
            Err(e) => {
                tracing::warn!("Cloud sync failed: {}", e);
                if let Err(state_err) = self.state.record_failure(&e.to_string()) {
                    tracing::warn!("Failed to record sync state: {}", state_err);
                }
                SyncReport {
                    success: false,
                    error: Some(e.to_string()),
                    ..SyncReport::default()
                }
            }
        };

        in_flight.finish(report.success);
        Ok(report)
    }

    async fn reconcile(&self, pass: Pass, cancel: &CancellationToken) -> AppResult<PassCounts> {
        let snapshot = self.store.pending_changes()?;
        let mut candidates = snapshot.changes;
        if pass == Pass::Full {
            let dirty: HashSet<String> = candidates.iter().map(|c| c.event_id.clone()).collect();
            candidates.extend(
                self.store
                    .all()
                    .into_iter()
                    .filter(|e| !e.is_onboarding && !dirty.contains(&e.id))
                    .map(|e| PendingChange {
                        event_id: e.id.clone(),
                        kind: ChangeKind::Upsert,
                        // Not in the change log; acknowledging it is a no-op.
                        revision: 0,
                        changed_at: e.updated_at,
                        event: Some(e),
                    }),
            );
        }

        let since = match pass {
            Pass::Incremental => self.state.cursor()?,
            Pass::Full => None,
        };
        let pull = cancellable(cancel, self.backend.download(since)).await?;

        let mut remote: HashMap<String, RemoteChange> = HashMap::new();
        for change in pull.changes {
            match remote.get(&change.id) {
                Some(existing) if existing.updated_at >= change.updated_at => {}
                _ => {
                    remote.insert(change.id.clone(), change);
                }
            }
        }

        let mut outgoing = Vec::new();
        let mut uploaded = Vec::new();
        for change in candidates {
            if let Some(theirs) = remote.get(&change.event_id) {
                if theirs.updated_at > change.changed_at {
                    tracing::debug!(id = %change.event_id, "Remote version is newer");
                    continue;
                }
                remote.remove(&change.event_id);
            }
            let record = match (change.kind, &change.event) {
                (ChangeKind::Upsert, Some(event)) if !event.is_onboarding => {
                    RemoteChange::upsert(event.clone())
                }
                (ChangeKind::Upsert, _) => continue,
                (ChangeKind::Delete, _) => {
                    RemoteChange::tombstone(&change.event_id, change.changed_at)
                }
            };
            outgoing.push(record);
            uploaded.push(change);
        }

        let mut upserts = Vec::new();
        let mut deletions = Vec::new();
        for theirs in remote.into_values() {
            let local = self.store.get(&theirs.id);
            if theirs.deleted {
                if local.map_or(true, |l| !l.is_onboarding && l.updated_at <= theirs.updated_at) {
                    deletions.push(theirs.id);
                }
            } else if let Some(event) = theirs.event {
                if !event.is_onboarding && local.map_or(true, |l| l.updated_at < event.updated_at) {
                    upserts.push(event);
                }
            }
        }

        check_cancelled(cancel)?;
        if !outgoing.is_empty() {
            let ack = cancellable(cancel, self.backend.upload(&outgoing)).await?;
            tracing::debug!(accepted = ack.accepted, "Upload acknowledged");
        }
        check_cancelled(cancel)?;

        let applied = self.store.apply_remote(upserts, deletions, snapshot.revision)?;
        self.store.acknowledge(&uploaded)?;

        Ok(PassCounts {
            uploaded: outgoing.len(),
            downloaded: applied.saved + applied.removed,
            cursor: pull.server_time,
        })
    }

    /// Ask the backend for a backup of the member's data.
    ///
    /// Returns false without premium or when the backend call fails.
    pub async fn create_backup(&self) -> bool {
        if let Err(e) = self.ensure_premium() {
            tracing::info!("Backup skipped: {}", e);
            return false;
        }
        match self.backend.create_backup().await {
            Ok(receipt) => {
                tracing::info!(events = receipt.events_count, "Cloud backup created");
                true
            }
            Err(e) => {
                tracing::warn!("Cloud backup failed: {}", e);
                false
            }
        }
    }

    /// Restore `snapshot` remotely, then replace local state with the restored set.
    ///
    /// Returns the number of events now stored locally.
    ///
    /// # Errors
    /// `FeatureLocked`, `Busy`, or the transport/storage error that stopped the restore.
    pub async fn restore_from_backup(&self, snapshot: &BackupSnapshot) -> AppResult<usize> {
        self.ensure_premium()?;
        let in_flight = self.begin()?;

        let result = async {
            self.backend.restore(snapshot).await?;
            let pull = self.backend.download(None).await?;
            let events: Vec<_> = pull
                .changes
                .into_iter()
                .filter(|c| !c.deleted)
                .filter_map(|c| c.event)
                .collect();
            let count = events.len();
            self.store.replace_all(events)?;
            Ok::<_, AppError>((count, pull.server_time))
        }
        .await;

        match result {
            Ok((count, cursor)) => {
                if let Err(e) = self.state.record_success(Utc::now(), cursor) {
                    tracing::warn!("Failed to record sync state: {}", e);
                }
                tracing::info!(count, "Restored events from backup");
                in_flight.finish(true);
                Ok(count)
            }
            Err(e) => {
                tracing::warn!("Restore failed: {}", e);
                if let Err(state_err) = self.state.record_failure(&e.to_string()) {
                    tracing::warn!("Failed to record sync state: {}", state_err);
                }
                in_flight.finish(false);
                Err(e)
            }
        }
    }

    /// # Errors
    /// Returns `AppError::Database` if the change log or state table cannot be read.
    pub fn stats(&self) -> AppResult<SyncStats> {
        let dirty = self.store.dirty_count()?;
        let last_succeeded = self.state.last_succeeded()?.unwrap_or(false);
        Ok(SyncStats {
            local_event_count: self.store.count(),
            last_sync_time: self.state.last_sync_time()?,
            is_up_to_date: dirty == 0 && last_succeeded,
        })
    }

    /// Premium, idle, and the last successful sync is older than the configured interval.
    pub fn should_auto_sync(&self) -> bool {
        self.should_auto_sync_at(Utc::now())
    }

    fn should_auto_sync_at(&self, now: DateTime<Utc>) -> bool {
        if !self.entitlements.is_premium() || !self.status().can_start() {
            return false;
        }
        match self.state.last_sync_time() {
            Ok(Some(last)) => now - last > self.auto_sync_after,
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("Cannot read last sync time: {}", e);
                false
            }
        }
    }

    fn ensure_premium(&self) -> AppResult<()> {
        if self.entitlements.is_premium() {
            Ok(())
        } else {
            Err(AppError::feature_locked("cloud sync"))
        }
    }

    fn begin(&self) -> AppResult<InFlight<'_>> {
        let mut status = self.status.lock();
        if !status.can_start() {
            return Err(AppError::busy("cloud sync"));
        }
        *status = SyncStatus::Syncing;
        Ok(InFlight {
            status: &self.status,
            finished: false,
        })
    }
}

fn check_cancelled(cancel: &CancellationToken) -> AppResult<()> {
    if cancel.is_cancelled() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = AppResult<T>>,
) -> AppResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::backend::{BackupReceipt, PullResponse, UploadAck};
    use crate::memory::MemoryCloudBackend;
    use async_trait::async_trait;
    use hical_core::PremiumFlag;
    use hical_events::Event;
    use tokio::sync::Notify;

    struct Harness {
        engine: Arc<CloudSyncEngine>,
        store: Arc<EventStore>,
        premium: Arc<PremiumFlag>,
    }

    fn harness(backend: Arc<dyn CloudBackend>) -> Harness {
        let store = Arc::new(EventStore::in_memory().unwrap());
        let premium = Arc::new(PremiumFlag::new(true));
        let engine = Arc::new(CloudSyncEngine::new(
            store.clone(),
            backend,
            premium.clone(),
            SyncStateStore::in_memory().unwrap(),
            &CloudConfig::default(),
        ));
        Harness {
            engine,
            store,
            premium,
        }
    }

    /// Holds every download until released.
    #[derive(Default)]
    struct GatedBackend {
        inner: MemoryCloudBackend,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl CloudBackend for GatedBackend {
        async fn upload(&self, changes: &[RemoteChange]) -> AppResult<UploadAck> {
            self.inner.upload(changes).await
        }

        async fn download(&self, since: Option<DateTime<Utc>>) -> AppResult<PullResponse> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.download(since).await
        }

        async fn create_backup(&self) -> AppResult<BackupReceipt> {
            self.inner.create_backup().await
        }

        async fn restore(&self, snapshot: &BackupSnapshot) -> AppResult<()> {
            self.inner.restore(snapshot).await
        }
    }

    #[tokio::test]
    async fn test_uploads_dirty_events_and_becomes_up_to_date() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Dinner")).unwrap();

        assert!(!h.engine.stats().unwrap().is_up_to_date);
        let report = h.engine.incremental_sync().await.unwrap();

        assert!(report.success);
        assert_eq!(report.uploaded, 1);
        assert_eq!(backend.get(&event.id).unwrap().event.unwrap().title, "Dinner");
        let stats = h.engine.stats().unwrap();
        assert!(stats.is_up_to_date);
        assert_eq!(stats.local_event_count, 1);
        assert!(stats.last_sync_time.is_some());
        assert_eq!(h.engine.status(), SyncStatus::Completed);

        h.store.add(Event::new("Breakfast")).unwrap();
        assert!(!h.engine.stats().unwrap().is_up_to_date);
    }

    #[tokio::test]
    async fn test_remote_newer_version_wins() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Local title")).unwrap();

        let mut theirs = event.clone();
        theirs.title = "Remote title".to_string();
        theirs.updated_at = event.updated_at + Duration::minutes(5);
        backend.put(RemoteChange::upsert(theirs));

        let report = h.engine.incremental_sync().await.unwrap();
        assert_eq!(report.uploaded, 0);
        assert_eq!(report.downloaded, 1);
        assert_eq!(h.store.get(&event.id).unwrap().title, "Remote title");
        assert_eq!(h.store.dirty_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_local_newer_version_wins() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Local title")).unwrap();

        let mut theirs = event.clone();
        theirs.title = "Stale remote".to_string();
        theirs.updated_at = event.updated_at - Duration::minutes(5);
        backend.put(RemoteChange::upsert(theirs));

        let report = h.engine.incremental_sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(report.downloaded, 0);
        assert_eq!(h.store.get(&event.id).unwrap().title, "Local title");
        assert_eq!(backend.get(&event.id).unwrap().event.unwrap().title, "Local title");
    }

    #[tokio::test]
    async fn test_local_delete_leaves_tombstone_and_is_not_resurrected() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Trip")).unwrap();
        h.engine.incremental_sync().await.unwrap();

        h.store.delete(&event.id).unwrap();
        let report = h.engine.incremental_sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert!(backend.get(&event.id).unwrap().deleted);

        let report = h.engine.perform_full_sync().await.unwrap();
        assert!(report.success);
        assert!(h.store.get(&event.id).is_none());
        assert!(h.engine.stats().unwrap().is_up_to_date);
    }

    #[tokio::test]
    async fn test_remote_tombstone_deletes_local_copy() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Moved away")).unwrap();
        h.engine.incremental_sync().await.unwrap();

        backend.put(RemoteChange::tombstone(&event.id, Utc::now() + Duration::seconds(1)));
        let report = h.engine.incremental_sync().await.unwrap();
        assert_eq!(report.downloaded, 1);
        assert!(h.store.get(&event.id).is_none());
    }

    #[tokio::test]
    async fn test_transport_failure_leaves_local_state_untouched() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Offline")).unwrap();
        backend.set_unavailable(true);

        let report = h.engine.incremental_sync().await.unwrap();
        assert!(!report.success);
        assert!(report.error.is_some());
        assert_eq!(h.store.dirty_count().unwrap(), 1);
        assert_eq!(h.store.get(&event.id).unwrap().title, "Offline");
        assert_eq!(h.engine.status(), SyncStatus::Failed);
        assert!(!h.engine.stats().unwrap().is_up_to_date);

        // A later caller-initiated retry succeeds.
        backend.set_unavailable(false);
        assert!(h.engine.incremental_sync().await.unwrap().success);
    }

    #[tokio::test]
    async fn test_second_sync_while_in_flight_is_rejected() {
        let backend = Arc::new(GatedBackend::default());
        let h = harness(backend.clone());
        h.store.add(Event::new("Queued")).unwrap();

        let first = tokio::spawn({
            let engine = h.engine.clone();
            async move { engine.incremental_sync().await }
        });
        backend.entered.notified().await;
        assert_eq!(h.engine.status(), SyncStatus::Syncing);

        let second = h.engine.incremental_sync().await;
        assert!(matches!(second, Err(AppError::Busy(_))));
        assert_eq!(h.engine.status(), SyncStatus::Syncing);

        backend.release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert!(report.success);
        assert_eq!(report.uploaded, 1);
    }

    #[tokio::test]
    async fn test_cancelled_sync_applies_nothing() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let event = h.store.add(Event::new("Later")).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = h.engine.incremental_sync_with(&cancel).await.unwrap();

        assert!(!report.success);
        assert!(backend.get(&event.id).is_none());
        assert_eq!(h.store.dirty_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_requires_premium() {
        let h = harness(Arc::new(MemoryCloudBackend::new()));
        h.premium.set(false);
        assert!(matches!(
            h.engine.incremental_sync().await,
            Err(AppError::FeatureLocked(_))
        ));
        assert!(!h.engine.create_backup().await);
        assert!(!h.engine.should_auto_sync());
    }

    #[tokio::test]
    async fn test_onboarding_events_are_never_uploaded() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let mut sample = Event::new("Welcome to HiCal");
        sample.is_onboarding = true;
        h.store.add(sample).unwrap();
        h.store.add(Event::new("Real event")).unwrap();

        let report = h.engine.perform_full_sync().await.unwrap();
        assert_eq!(report.uploaded, 1);
        assert_eq!(backend.live_events().len(), 1);
        assert!(h.engine.stats().unwrap().is_up_to_date);
    }

    #[tokio::test]
    async fn test_auto_sync_interval() {
        let h = harness(Arc::new(MemoryCloudBackend::new()));
        assert!(h.engine.should_auto_sync());

        h.engine.incremental_sync().await.unwrap();
        assert!(!h.engine.should_auto_sync());
        assert!(h.engine.should_auto_sync_at(Utc::now() + Duration::minutes(61)));
    }

    #[tokio::test]
    async fn test_backup_and_restore() {
        let backend = Arc::new(MemoryCloudBackend::new());
        let h = harness(backend.clone());
        let keep = h.store.add(Event::new("Anniversary")).unwrap();
        h.store.add(Event::new("Checkup")).unwrap();
        h.engine.incremental_sync().await.unwrap();
        assert!(h.engine.create_backup().await);

        h.store.delete(&keep.id).unwrap();
        h.store.add(Event::new("After backup")).unwrap();
        h.engine.incremental_sync().await.unwrap();

        let snapshot = backend.backups().remove(0);
        let restored = h.engine.restore_from_backup(&snapshot).await.unwrap();

        assert_eq!(restored, 2);
        assert_eq!(h.store.count(), 2);
        assert!(h.store.get(&keep.id).is_some());
        assert_eq!(h.store.dirty_count().unwrap(), 0);
    }
}
