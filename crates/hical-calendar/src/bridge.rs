//! Two-way bridge between the event store and the platform calendar.
//!
//! Operations need premium and calendar permission. `request_access` needs only
//! premium and `disable_sync` is always allowed.
//! One bridge pass runs at a time. Each item is handled to completion (native
//! write plus link row) before cancellation is checked, so a cancelled pass
//! leaves the mapping consistent.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use hical_core::{AppError, AppResult, CalendarConfig, Entitlements};
use hical_events::{start_of_day, Event, EventStore, ReminderKind};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::links::LinkStore;
use crate::native::{CalendarAuthorization, NativeCalendar, NativeItem};
use crate::types::{
    BridgeSettings, BridgeSyncReport, CalendarLink, CleanupReport, LinkOrigin, SyncDirection,
    SyncFrequency,
};

/// Starts within this many seconds count as the same occurrence.
const DEDUP_TOLERANCE_SECS: i64 = 60;

/// Resets the single-flight flag on drop.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SystemCalendarBridge {
    store: Arc<EventStore>,
    native: Arc<dyn NativeCalendar>,
    entitlements: Arc<dyn Entitlements>,
    links: LinkStore,
    settings: Mutex<BridgeSettings>,
    config: CalendarConfig,
    running: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl SystemCalendarBridge {
    /// # Errors
    /// Returns `AppError::Database` if stored settings cannot be read.
    pub fn new(
        store: Arc<EventStore>,
        native: Arc<dyn NativeCalendar>,
        entitlements: Arc<dyn Entitlements>,
        links: LinkStore,
        config: CalendarConfig,
    ) -> AppResult<Self> {
        let settings = links.load_settings()?;
        Ok(Self {
            store,
            native,
            entitlements,
            links,
            settings: Mutex::new(settings),
            config,
            running: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn settings(&self) -> BridgeSettings {
        self.settings.lock().clone()
    }

    pub fn authorization(&self) -> CalendarAuthorization {
        self.native.authorization()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Change notifications from the platform calendar, if it reports them.
    pub fn subscribe_native_changes(&self) -> Option<broadcast::Receiver<()>> {
        self.native.subscribe_changes()
    }

    fn update_settings(
        &self,
        change: impl FnOnce(&mut BridgeSettings),
    ) -> AppResult<BridgeSettings> {
        let mut settings = self.settings.lock();
        let mut next = settings.clone();
        change(&mut next);
        self.links.save_settings(&next)?;
        *settings = next.clone();
        Ok(next)
    }

    fn ensure_premium(&self) -> AppResult<()> {
        if !self.entitlements.is_premium() {
            return Err(AppError::feature_locked("system calendar sync"));
        }
        Ok(())
    }

    fn ensure_allowed(&self) -> AppResult<()> {
        self.ensure_premium()?;
        if self.native.authorization() != CalendarAuthorization::Authorized {
            return Err(AppError::permission_denied("calendar access"));
        }
        Ok(())
    }

    fn begin(&self) -> AppResult<(PassGuard<'_>, CancellationToken)> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AppError::busy("calendar sync"));
        }
        Ok((PassGuard(&self.running), self.cancel.lock().clone()))
    }

    /// Prompt for calendar access. Returns whether access was granted.
    ///
    /// # Errors
    /// `FeatureLocked` without premium.
    pub async fn request_access(&self) -> AppResult<bool> {
        self.ensure_premium()?;
        let granted = self.native.request_access().await?;
        info!(granted, "Calendar access requested");
        Ok(granted)
    }

    /// Turn the bridge on and run a first pass.
    ///
    /// # Errors
    /// `FeatureLocked` or `PermissionDenied` when gated; nothing is persisted then.
    pub async fn enable_sync(&self) -> AppResult<BridgeSyncReport> {
        self.ensure_allowed()?;
        self.update_settings(|s| s.enabled = true)?;
        info!("System calendar sync enabled");
        self.perform_sync().await
    }

    /// Turn the bridge off and cancel any pass in flight. Always allowed.
    pub fn disable_sync(&self) -> AppResult<()> {
        self.update_settings(|s| s.enabled = false)?;
        self.cancel_in_flight();
        info!("System calendar sync disabled");
        Ok(())
    }

    /// Cancel the running pass, if any, without changing settings.
    pub fn cancel_in_flight(&self) {
        let previous = std::mem::replace(&mut *self.cancel.lock(), CancellationToken::new());
        previous.cancel();
    }

    pub fn set_direction(&self, direction: SyncDirection) -> AppResult<()> {
        self.update_settings(|s| s.direction = direction)?;
        Ok(())
    }

    pub fn set_frequency(&self, frequency: SyncFrequency) -> AppResult<()> {
        self.update_settings(|s| s.frequency = frequency)?;
        Ok(())
    }

    /// Calendars to import from. An empty selection imports from all.
    pub fn set_selected_calendars(&self, ids: BTreeSet<String>) -> AppResult<()> {
        self.update_settings(|s| s.selected_calendars = ids)?;
        Ok(())
    }

    /// Run one pass in the configured direction.
    ///
    /// # Errors
    /// `FeatureLocked`, `PermissionDenied`, `Busy` while another pass runs,
    /// `Cancelled` if cancelled midway, or the first native/storage failure.
    #[instrument(skip(self))]
    pub async fn perform_sync(&self) -> AppResult<BridgeSyncReport> {
        self.ensure_allowed()?;
        let (_guard, cancel) = self.begin()?;
        let direction = self.settings.lock().direction;

        let mut report = BridgeSyncReport::default();
        // Import first so look-alikes are linked before anything is exported.
        if direction.pulls() {
            self.import_new(&cancel, &mut report).await?;
        }
        if direction.pushes() {
            self.export_new(&cancel, &mut report).await?;
        }
        self.reconcile_linked(direction, &cancel, &mut report).await?;

        let finished = Utc::now();
        self.update_settings(|s| s.last_sync = Some(finished))?;
        info!(
            imported = report.imported,
            exported = report.exported,
            pulled = report.pulled_updates,
            pushed = report.pushed_updates,
            removed = report.removed,
            "Calendar sync completed"
        );
        Ok(report)
    }

    /// Timer entry point. Returns `Ok(None)` when the bridge is off, manual, or
    /// the last pass was too recent.
    ///
    /// # Errors
    /// Same as [`Self::perform_sync`].
    pub async fn perform_timer_sync(&self) -> AppResult<Option<BridgeSyncReport>> {
        self.perform_timer_sync_at(Utc::now()).await
    }

    pub(crate) async fn perform_timer_sync_at(
        &self,
        now: DateTime<Utc>,
    ) -> AppResult<Option<BridgeSyncReport>> {
        let settings = self.settings();
        if !settings.enabled || settings.frequency.period().is_none() {
            return Ok(None);
        }
        let min_interval = std::time::Duration::from_secs(self.config.min_sync_interval_secs);
        if let Some(last) = settings.last_sync {
            if (now - last).to_std().is_ok_and(|elapsed| elapsed < min_interval) {
                debug!("Skipping calendar sync, last pass was recent");
                return Ok(None);
            }
        }
        self.perform_sync().await.map(Some)
    }

    async fn import_new(
        &self,
        cancel: &CancellationToken,
        report: &mut BridgeSyncReport,
    ) -> AppResult<()> {
        let window = import_window(Utc::now(), &self.config);
        let calendars: Vec<String> =
            self.settings.lock().selected_calendars.iter().cloned().collect();
        let items = self.native.items(&calendars, window).await?;

        for item in items {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let Some(native_id) = item.id.clone() else {
                continue;
            };
            if self.links.link_by_native(&native_id)?.is_some() {
                continue;
            }

            if let Some(existing) = self.find_look_alike(&item) {
                if self.links.links_for_event(&existing.id)?.is_empty() {
                    self.links.upsert(&CalendarLink {
                        native_id,
                        event_id: existing.id,
                        calendar_id: item.calendar_id.clone(),
                        origin: LinkOrigin::Imported,
                        event_version: existing.updated_at,
                        native_version: item.last_modified,
                        synced_at: Utc::now(),
                    })?;
                    report.linked += 1;
                } else {
                    debug!(native_id = %native_id, "Native item duplicates a linked event");
                }
                continue;
            }

            let mut event = Event::new(if item.title.trim().is_empty() {
                "Untitled".to_string()
            } else {
                item.title.clone()
            });
            apply_native(&mut event, &item);
            let saved = self.store.add(event)?;
            self.links.upsert(&CalendarLink {
                native_id,
                event_id: saved.id,
                calendar_id: item.calendar_id.clone(),
                origin: LinkOrigin::Imported,
                event_version: saved.updated_at,
                native_version: item.last_modified,
                synced_at: Utc::now(),
            })?;
            report.imported += 1;
        }
        Ok(())
    }

    /// Local event with the same title starting at the same moment (same day
    /// for all-day items).
    fn find_look_alike(&self, item: &NativeItem) -> Option<Event> {
        let day = item.start.date_naive();
        self.store
            .events_for(day)
            .into_iter()
            .filter(|e| e.title == item.title)
            .find(|e| match (item.all_day, e.start_at) {
                (true, None) => true,
                (false, Some(start)) => {
                    (start - item.start).num_seconds().abs() <= DEDUP_TOLERANCE_SECS
                }
                _ => false,
            })
    }

    async fn export_new(
        &self,
        cancel: &CancellationToken,
        report: &mut BridgeSyncReport,
    ) -> AppResult<()> {
        let target = self.target_calendar().await?;
        for event in self.store.all() {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if event.is_onboarding || !self.links.links_for_event(&event.id)?.is_empty() {
                continue;
            }
            match self.export_one(&event, &target).await {
                Ok(true) => report.exported += 1,
                Ok(false) => {}
                Err(e) => warn!(event_id = %event.id, "Failed to export event: {}", e),
            }
        }
        Ok(())
    }

    /// Create the native item for `event` and link it. Returns `false` if the
    /// platform did not assign an id.
    async fn export_one(&self, event: &Event, calendar_id: &str) -> AppResult<bool> {
        let saved = self
            .native
            .save_item(native_item_for(event, calendar_id, None))
            .await?;
        let Some(native_id) = saved.id else {
            return Ok(false);
        };
        self.links.upsert(&CalendarLink {
            native_id,
            event_id: event.id.clone(),
            calendar_id: calendar_id.to_string(),
            origin: LinkOrigin::Exported,
            event_version: event.updated_at,
            native_version: saved.last_modified,
            synced_at: Utc::now(),
        })?;
        Ok(true)
    }

    /// Push one saved event right away. Returns whether the platform calendar
    /// was written.
    ///
    /// Does nothing when the bridge is off, import-only, or a pass is running;
    /// the next pass picks the event up then.
    ///
    /// # Errors
    /// Gate errors, or native and storage failures.
    pub async fn export_event(&self, event: &Event) -> AppResult<bool> {
        let settings = self.settings();
        if !settings.enabled || !settings.direction.pushes() || event.is_onboarding {
            return Ok(false);
        }
        self.ensure_allowed()?;
        let (_guard, _cancel) = match self.begin() {
            Ok(pass) => pass,
            Err(AppError::Busy(_)) => {
                debug!(event_id = %event.id, "Calendar pass running, export deferred");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let links = self.links.links_for_event(&event.id)?;
        if links.is_empty() {
            let target = self.target_calendar().await?;
            return self.export_one(event, &target).await;
        }

        let mut written = false;
        for link in links {
            if link.origin != LinkOrigin::Exported || link.event_version == event.updated_at {
                continue;
            }
            let Some(item) = self.native.item(&link.native_id).await? else {
                continue;
            };
            // A newer native edit is settled by the next pass.
            let native_newer =
                item.last_modified != link.native_version && item.last_modified > event.updated_at;
            if native_newer && settings.direction.pulls() {
                continue;
            }
            let saved = self
                .native
                .save_item(native_item_for(event, &item.calendar_id, item.id.clone()))
                .await?;
            self.links.upsert(&CalendarLink {
                event_version: event.updated_at,
                native_version: saved.last_modified,
                synced_at: Utc::now(),
                ..link
            })?;
            written = true;
        }
        Ok(written)
    }

    /// The platform reported a change in its calendar database. Runs a pass
    /// when the bridge is on with realtime frequency; returns `Ok(None)`
    /// otherwise or when a pass is already running.
    ///
    /// # Errors
    /// Same as [`Self::perform_sync`], except `Busy`.
    pub async fn on_native_store_changed(&self) -> AppResult<Option<BridgeSyncReport>> {
        let settings = self.settings();
        if !settings.enabled || settings.frequency != SyncFrequency::Realtime {
            return Ok(None);
        }
        match self.perform_sync().await {
            Ok(report) => Ok(Some(report)),
            Err(AppError::Busy(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The dedicated calendar when it exists, otherwise the platform default.
    async fn target_calendar(&self) -> AppResult<String> {
        let calendars = self.native.calendars().await?;
        let dedicated = self.settings.lock().dedicated_calendar_id.clone();
        if let Some(id) = dedicated {
            if calendars.iter().any(|c| c.id == id) {
                return Ok(id);
            }
        }
        if let Some(c) = calendars
            .iter()
            .find(|c| c.title == self.config.dedicated_calendar_title)
        {
            return Ok(c.id.clone());
        }
        self.native
            .default_calendar_id()
            .await?
            .ok_or_else(|| AppError::not_found("default calendar"))
    }

    /// Propagate edits and deletions across existing links. A side counts as
    /// changed when its version differs from the one recorded on the link; when
    /// both changed, the later version wins.
    async fn reconcile_linked(
        &self,
        direction: SyncDirection,
        cancel: &CancellationToken,
        report: &mut BridgeSyncReport,
    ) -> AppResult<()> {
        for link in self.links.links()? {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            let local = self.store.get(&link.event_id);
            let native = self.native.item(&link.native_id).await?;

            match (local, native) {
                (Some(event), Some(item)) => {
                    let local_changed = event.updated_at != link.event_version;
                    let native_changed = item.last_modified != link.native_version;
                    let push = direction.pushes()
                        && local_changed
                        && (!native_changed
                            || !direction.pulls()
                            || event.updated_at >= item.last_modified);
                    let pull = !push && direction.pulls() && native_changed;

                    let (event_version, native_version) = if push {
                        let next = native_item_for(&event, &item.calendar_id, item.id.clone());
                        let saved = self.native.save_item(next).await?;
                        report.pushed_updates += 1;
                        (event.updated_at, saved.last_modified)
                    } else if pull {
                        let mut next = event.clone();
                        apply_native(&mut next, &item);
                        let updated = self.store.update(next)?;
                        report.pulled_updates += 1;
                        (updated.updated_at, item.last_modified)
                    } else {
                        continue;
                    };
                    self.links.upsert(&CalendarLink {
                        event_version,
                        native_version,
                        synced_at: Utc::now(),
                        ..link
                    })?;
                }
                (None, Some(_)) => {
                    // Imported items stay linked so they are not imported again.
                    if link.origin == LinkOrigin::Exported && direction.pushes() {
                        self.native.remove_item(&link.native_id).await?;
                        self.links.remove(&link.native_id)?;
                        report.removed += 1;
                    }
                }
                (Some(event), None) => {
                    match link.origin {
                        LinkOrigin::Imported if direction.pulls() => {
                            self.store.delete(&event.id)?;
                            report.removed += 1;
                        }
                        _ => {}
                    }
                    self.links.remove(&link.native_id)?;
                }
                (None, None) => {
                    self.links.remove(&link.native_id)?;
                }
            }
        }
        Ok(())
    }

    /// Collapse multiple native items mapped to one event, and remove unlinked
    /// look-alikes from the dedicated calendar.
    ///
    /// # Errors
    /// Gate errors, `Busy`, or storage failures.
    #[instrument(skip(self))]
    pub async fn cleanup_duplicates(&self) -> AppResult<CleanupReport> {
        self.ensure_allowed()?;
        let (_guard, _cancel) = self.begin()?;
        let mut report = CleanupReport::default();

        let mut by_event: HashMap<String, Vec<CalendarLink>> = HashMap::new();
        for link in self.links.links()? {
            by_event.entry(link.event_id.clone()).or_default().push(link);
        }

        for (event_id, links) in by_event {
            let mut alive: Vec<(CalendarLink, NativeItem)> = Vec::new();
            for link in links {
                match self.native.item(&link.native_id).await? {
                    Some(item) => alive.push((link, item)),
                    None => {
                        self.links.remove(&link.native_id)?;
                        report.removed_links += 1;
                    }
                }
            }
            if alive.len() < 2 {
                continue;
            }
            alive.sort_by(|a, b| b.1.last_modified.cmp(&a.1.last_modified));
            for (link, _) in alive.into_iter().skip(1) {
                if let Err(e) = self.native.remove_item(&link.native_id).await {
                    warn!(event_id = %event_id, "Failed to remove duplicate item: {}", e);
                    continue;
                }
                self.links.remove(&link.native_id)?;
                report.removed_items += 1;
                report.removed_links += 1;
            }
        }

        if let Some(dedicated) = self.find_dedicated_calendar().await? {
            let items = self
                .native
                .items(&[dedicated], DateTime::<Utc>::MIN_UTC..DateTime::<Utc>::MAX_UTC)
                .await?;
            let linked: HashSet<String> =
                self.links.links()?.into_iter().map(|l| l.native_id).collect();
            let linked_keys: HashSet<(String, NaiveDate)> = items
                .iter()
                .filter(|i| i.id.as_ref().is_some_and(|id| linked.contains(id)))
                .map(duplicate_key)
                .collect();
            for item in &items {
                let Some(id) = &item.id else {
                    continue;
                };
                if linked.contains(id) || !linked_keys.contains(&duplicate_key(item)) {
                    continue;
                }
                match self.native.remove_item(id).await {
                    Ok(()) => report.removed_items += 1,
                    Err(e) => warn!(native_id = %id, "Failed to remove look-alike item: {}", e),
                }
            }
        }

        info!(
            removed_items = report.removed_items,
            removed_links = report.removed_links,
            "Calendar cleanup completed"
        );
        Ok(report)
    }

    async fn find_dedicated_calendar(&self) -> AppResult<Option<String>> {
        let calendars = self.native.calendars().await?;
        let saved = self.settings.lock().dedicated_calendar_id.clone();
        Ok(calendars
            .iter()
            .find(|c| Some(&c.id) == saved.as_ref())
            .or_else(|| {
                calendars
                    .iter()
                    .find(|c| c.title == self.config.dedicated_calendar_title)
            })
            .map(|c| c.id.clone()))
    }

    /// Create the app-owned calendar and select only it. Returns `false` if a
    /// calendar with that title already exists.
    ///
    /// # Errors
    /// Gate errors or native failures.
    pub async fn create_dedicated_calendar(&self) -> AppResult<bool> {
        self.ensure_allowed()?;
        let title = &self.config.dedicated_calendar_title;
        if self.native.calendars().await?.iter().any(|c| &c.title == title) {
            warn!(title = %title, "Dedicated calendar already exists");
            return Ok(false);
        }
        let calendar = self.native.create_calendar(title).await?;
        self.select_only(&calendar.id)?;
        info!(calendar_id = %calendar.id, "Created dedicated calendar");
        Ok(true)
    }

    /// Move every mapped native item into the dedicated calendar, creating it
    /// if needed, and select only that calendar. Events are not touched.
    ///
    /// # Errors
    /// Gate errors, `Busy`, `Cancelled`, or native failures.
    #[instrument(skip(self))]
    pub async fn switch_all_to_dedicated_calendar(&self) -> AppResult<usize> {
        self.ensure_allowed()?;
        let (_guard, cancel) = self.begin()?;

        let dedicated = match self.find_dedicated_calendar().await? {
            Some(id) => id,
            None => {
                self.native
                    .create_calendar(&self.config.dedicated_calendar_title)
                    .await?
                    .id
            }
        };

        let mut moved = 0;
        for link in self.links.links()? {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }
            if link.calendar_id == dedicated {
                continue;
            }
            let Some(mut item) = self.native.item(&link.native_id).await? else {
                self.links.remove(&link.native_id)?;
                continue;
            };
            item.calendar_id = dedicated.clone();
            let saved = self.native.save_item(item).await?;
            self.links.upsert(&CalendarLink {
                calendar_id: dedicated.clone(),
                native_version: saved.last_modified,
                synced_at: Utc::now(),
                ..link
            })?;
            moved += 1;
        }

        self.select_only(&dedicated)?;
        info!(moved, calendar_id = %dedicated, "Switched to dedicated calendar");
        Ok(moved)
    }

    fn select_only(&self, calendar_id: &str) -> AppResult<()> {
        self.update_settings(|s| {
            s.dedicated_calendar_id = Some(calendar_id.to_string());
            s.selected_calendars = BTreeSet::from([calendar_id.to_string()]);
        })?;
        Ok(())
    }
}

/// Items starting in this range are imported. Bounds saturate at the
/// representable range.
fn import_window(now: DateTime<Utc>, config: &CalendarConfig) -> Range<DateTime<Utc>> {
    let start = now
        .checked_sub_signed(Duration::days(i64::from(config.import_past_days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let end = now
        .checked_add_signed(Duration::days(i64::from(config.import_future_days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    start..end
}

fn duplicate_key(item: &NativeItem) -> (String, NaiveDate) {
    (item.title.to_lowercase(), item.start.date_naive())
}

/// Native representation of `event`. Timed events default to one hour; events
/// without a time become a one-day all-day item.
fn native_item_for(event: &Event, calendar_id: &str, id: Option<String>) -> NativeItem {
    let (start, end, all_day) = match event.start_at {
        Some(start) => (start, event.end_at.unwrap_or(start + Duration::hours(1)), false),
        None => {
            let start = start_of_day(event.day());
            (start, start + Duration::days(1), true)
        }
    };
    NativeItem {
        id,
        calendar_id: calendar_id.to_string(),
        title: event.title.clone(),
        start,
        end,
        all_day,
        notes: event.details.clone(),
        alarm_offsets: event
            .push_reminders
            .iter()
            .filter(|r| r.is_schedulable())
            .map(|r| r.offset_secs())
            .collect(),
        last_modified: event.updated_at,
    }
}

/// Copy native fields onto `event`. Unknown alarms fall back to a day-before reminder.
fn apply_native(event: &mut Event, item: &NativeItem) {
    if !item.title.trim().is_empty() {
        event.title = item.title.clone();
    }
    event.details = item.notes.clone();
    if item.all_day {
        event.set_all_day(item.start.date_naive());
    } else {
        event.set_time(item.start, Some(item.end));
    }
    let reminders: BTreeSet<ReminderKind> = item
        .alarm_offsets
        .iter()
        .filter_map(|secs| ReminderKind::from_offset_secs(*secs))
        .collect();
    event.push_reminders = if reminders.is_empty() {
        BTreeSet::from([ReminderKind::DayBefore])
    } else {
        reminders
    };
}
