//! Explicit wiring of the HiCal services and their background tasks.
//!
//! `AppServices` owns every long-lived service. Nothing is global: callers
//! build one instance at startup, share it behind an `Arc`, and shut it down
//! when the app exits.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use hical_calendar::{LinkStore, MemoryNativeCalendar, NativeCalendar, SystemCalendarBridge};
use hical_core::{AppResult, CloudConfig, Config, Entitlements, PremiumFlag};
use hical_events::{
    EditSession, Event, EventObserver, EventStore, RecurrenceEngine, RecurrenceRequest,
};
use hical_notify::{
    Authorization, MemoryNotificationCenter, NotificationCenter, NotificationScheduler,
};
use hical_sync::{
    CloudBackend, CloudSyncEngine, HttpCloudBackend, MemoryCloudBackend, SyncReport,
    SyncStateStore,
};

/// How often the cloud auto-sync condition is checked.
const CLOUD_CHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Re-read interval for the bridge timer while the frequency is manual.
const MANUAL_RECHECK_INTERVAL: Duration = Duration::from_secs(60);

/// Platform services the core talks to.
pub struct PlatformPorts {
    pub notifications: Arc<dyn NotificationCenter>,
    pub calendar: Arc<dyn NativeCalendar>,
    pub cloud: Arc<dyn CloudBackend>,
    pub entitlements: Arc<dyn Entitlements>,
}

impl PlatformPorts {
    /// In-process ports with every permission granted.
    pub fn in_memory(premium: bool) -> Self {
        Self {
            notifications: Arc::new(MemoryNotificationCenter::new(Authorization::Authorized)),
            calendar: Arc::new(MemoryNativeCalendar::default()),
            cloud: Arc::new(MemoryCloudBackend::new()),
            entitlements: Arc::new(PremiumFlag::new(premium)),
        }
    }

    /// In-process ports, except the cloud backend which follows `config.cloud`.
    pub fn for_config(config: &Config, premium: bool) -> Self {
        let (cloud, _) = cloud_backend_for(&config.cloud);
        Self {
            cloud,
            ..Self::in_memory(premium)
        }
    }
}

/// Where member cloud sync goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudMode {
    /// HTTP service at `cloud.base_url`.
    Remote,
    /// In-process backend; nothing leaves the device.
    Local,
}

/// The HTTP backend when both `cloud.api_key` and `cloud.user_id` are set,
/// otherwise the in-process one.
pub fn cloud_backend_for(config: &CloudConfig) -> (Arc<dyn CloudBackend>, CloudMode) {
    if config.api_key.is_none() || config.user_id.is_none() {
        info!("Cloud credentials not configured, using local cloud backend");
        return (Arc::new(MemoryCloudBackend::new()), CloudMode::Local);
    }
    match HttpCloudBackend::new(config) {
        Ok(backend) => {
            info!(base_url = %config.base_url, "Using remote cloud backend");
            (Arc::new(backend), CloudMode::Remote)
        }
        Err(e) => {
            warn!("Remote cloud backend unavailable, using local backend: {}", e);
            (Arc::new(MemoryCloudBackend::new()), CloudMode::Local)
        }
    }
}

/// Exports saved events to the platform calendar as soon as they are stored.
struct CalendarExportObserver {
    bridge: Weak<SystemCalendarBridge>,
}

impl EventObserver for CalendarExportObserver {
    fn events_saved(&self, events: &[Event]) {
        let Some(bridge) = self.bridge.upgrade() else {
            return;
        };
        let settings = bridge.settings();
        if !settings.enabled || !settings.direction.pushes() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime, calendar export left to the next pass");
            return;
        };
        let events = events.to_vec();
        runtime.spawn(async move {
            for event in events {
                match bridge.export_event(&event).await {
                    Ok(_) => {}
                    Err(e) if e.is_gate() => {
                        debug!(event_id = %event.id, "Calendar export skipped: {}", e)
                    }
                    Err(e) => warn!(event_id = %event.id, "Calendar export failed: {}", e),
                }
            }
        });
    }

    fn events_removed(&self, _ids: &[String]) {}
}

pub struct AppServices {
    config: Config,
    store: Arc<EventStore>,
    recurrence: RecurrenceEngine,
    scheduler: Arc<NotificationScheduler>,
    cloud: Arc<CloudSyncEngine>,
    bridge: Arc<SystemCalendarBridge>,

    /// Parent of every background task token.
    shutdown_token: CancellationToken,

    /// Cancellation token for the cloud sync in flight
    cloud_cancel_token: RwLock<CancellationToken>,

    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AppServices {
    /// Open the on-disk databases under `config.storage.data_dir` and wire the services.
    ///
    /// # Errors
    /// Returns an error if the data directory or a database cannot be opened.
    pub fn build(config: Config, platform: PlatformPorts) -> AppResult<Arc<Self>> {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let store = EventStore::open(config.storage.events_db())?;
        let sync_state = SyncStateStore::open(config.storage.sync_db())?;
        let links = LinkStore::open(config.storage.calendar_db())?;
        Self::assemble(config, platform, store, sync_state, links)
    }

    /// Same wiring with every database in memory.
    ///
    /// # Errors
    /// Returns an error if a schema cannot be created.
    pub fn build_in_memory(config: Config, platform: PlatformPorts) -> AppResult<Arc<Self>> {
        Self::assemble(
            config,
            platform,
            EventStore::in_memory()?,
            SyncStateStore::in_memory()?,
            LinkStore::in_memory()?,
        )
    }

    fn assemble(
        config: Config,
        platform: PlatformPorts,
        store: EventStore,
        sync_state: SyncStateStore,
        links: LinkStore,
    ) -> AppResult<Arc<Self>> {
        let store = Arc::new(store);

        let scheduler = Arc::new(NotificationScheduler::new(
            platform.notifications,
            config.notifications,
        ));
        store.add_observer(scheduler.clone());

        let cloud = Arc::new(CloudSyncEngine::new(
            store.clone(),
            platform.cloud,
            platform.entitlements.clone(),
            sync_state,
            &config.cloud,
        ));

        let bridge = Arc::new(SystemCalendarBridge::new(
            store.clone(),
            platform.calendar,
            platform.entitlements,
            links,
            config.calendar.clone(),
        )?);
        store.add_observer(Arc::new(CalendarExportObserver {
            bridge: Arc::downgrade(&bridge),
        }));

        let shutdown_token = CancellationToken::new();
        let cloud_cancel_token = RwLock::new(shutdown_token.child_token());

        info!(events = store.count(), "HiCal services assembled");
        Ok(Arc::new(Self {
            recurrence: RecurrenceEngine::new(config.recurrence),
            config,
            store,
            scheduler,
            cloud,
            bridge,
            shutdown_token,
            cloud_cancel_token,
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<NotificationScheduler> {
        &self.scheduler
    }

    pub fn cloud(&self) -> &Arc<CloudSyncEngine> {
        &self.cloud
    }

    pub fn bridge(&self) -> &Arc<SystemCalendarBridge> {
        &self.bridge
    }

    /// Expand and store a possibly repeating event in one batch.
    ///
    /// # Errors
    /// `InvalidInput` for a bad request, or a storage failure; nothing is stored then.
    pub fn create_events(&self, request: &RecurrenceRequest) -> AppResult<Vec<Event>> {
        let events = self.recurrence.expand(request)?;
        self.store.add_batch(events)
    }

    /// Creation flow: nothing is written until the session is saved.
    pub fn new_event_session(&self, draft: Event) -> EditSession {
        EditSession::for_new(self.store.clone(), self.recurrence, draft)
    }

    /// Edit flow with debounced autosave.
    pub fn edit_event_session(&self, event: Event) -> EditSession {
        EditSession::for_existing(self.store.clone(), event, self.config.editor.autosave_delay())
    }

    /// Create a fresh token for the next cloud sync, replacing the previous one.
    pub fn new_cloud_cancel_token(&self) -> CancellationToken {
        let token = self.shutdown_token.child_token();
        *self.cloud_cancel_token.write() = token.clone();
        token
    }

    /// Cancel the cloud sync in flight, if any.
    pub fn cancel_cloud_sync(&self) {
        self.cloud_cancel_token.read().cancel();
    }

    /// User-triggered incremental cloud sync.
    ///
    /// # Errors
    /// `FeatureLocked` without premium; `Busy` while another sync runs.
    pub async fn sync_now(&self) -> AppResult<SyncReport> {
        let token = self.new_cloud_cancel_token();
        self.cloud.incremental_sync_with(&token).await
    }

    /// Start the cloud auto-sync check and the calendar bridge timer.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            debug!("Background tasks already running");
            return;
        }

        let services = Arc::clone(self);
        let stop = self.shutdown_token.child_token();
        tasks.push(tokio::spawn(async move {
            services.run_cloud_auto_sync(stop).await;
        }));

        let bridge = self.bridge.clone();
        let stop = self.shutdown_token.child_token();
        tasks.push(tokio::spawn(run_calendar_timer(bridge, stop)));

        if let Some(changes) = self.bridge.subscribe_native_changes() {
            let bridge = self.bridge.clone();
            let stop = self.shutdown_token.child_token();
            tasks.push(tokio::spawn(run_calendar_change_listener(bridge, changes, stop)));
        }

        info!("Background sync tasks started");
    }

    async fn run_cloud_auto_sync(&self, stop: CancellationToken) {
        let mut ticker = tokio::time::interval(CLOUD_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let min_gap =
            Duration::from_secs(u64::from(self.config.cloud.auto_sync_after_minutes) * 60);
        let mut last_attempt: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            // Failed attempts wait a full interval too.
            if last_attempt.is_some_and(|at| at.elapsed() < min_gap) {
                continue;
            }
            if !self.cloud.should_auto_sync() {
                continue;
            }

            last_attempt = Some(Instant::now());
            let token = self.new_cloud_cancel_token();
            match self.cloud.incremental_sync_with(&token).await {
                Ok(report) if report.success => {
                    info!(
                        uploaded = report.uploaded,
                        downloaded = report.downloaded,
                        "Automatic cloud sync completed"
                    );
                }
                Ok(report) => warn!(error = ?report.error, "Automatic cloud sync failed"),
                Err(e) if e.is_gate() => debug!("Automatic cloud sync skipped: {}", e),
                Err(e) => warn!("Automatic cloud sync not started: {}", e),
            }
        }
        debug!("Cloud auto-sync task stopped");
    }

    /// App moved to the background: stop in-flight work, keep the timers.
    pub fn on_background(&self) {
        self.cancel_cloud_sync();
        self.bridge.cancel_in_flight();
        info!("Background transition, in-flight sync cancelled");
    }

    /// Cancel everything and wait for the background tasks to finish.
    pub async fn shutdown(&self) {
        info!("AppServices shutdown initiated");
        self.shutdown_token.cancel();
        self.bridge.cancel_in_flight();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("AppServices shutdown complete");
    }
}

async fn run_calendar_timer(bridge: Arc<SystemCalendarBridge>, stop: CancellationToken) {
    loop {
        let period = bridge
            .settings()
            .frequency
            .period()
            .unwrap_or(MANUAL_RECHECK_INTERVAL);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
        match bridge.perform_timer_sync().await {
            Ok(Some(report)) => debug!(
                imported = report.imported,
                exported = report.exported,
                "Timed calendar sync completed"
            ),
            Ok(None) => {}
            Err(e) if e.is_gate() => debug!("Timed calendar sync skipped: {}", e),
            Err(e) => warn!("Timed calendar sync failed: {}", e),
        }
    }
    debug!("Calendar timer task stopped");
}

async fn run_calendar_change_listener(
    bridge: Arc<SystemCalendarBridge>,
    mut changes: broadcast::Receiver<()>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            received = changes.recv() => match received {
                Ok(()) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            },
        }
        // One pass per burst.
        while changes.try_recv().is_ok() {}

        match bridge.on_native_store_changed().await {
            Ok(Some(report)) => debug!(
                imported = report.imported,
                pulled = report.pulled_updates,
                "Calendar change sync completed"
            ),
            Ok(None) => {}
            Err(e) if e.is_gate() => debug!("Calendar change sync skipped: {}", e),
            Err(e) => warn!("Calendar change sync failed: {}", e),
        }
        // Writes made by the pass itself.
        while changes.try_recv().is_ok() {}
    }
    debug!("Calendar change listener stopped");
}
