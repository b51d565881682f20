//! Port to the platform calendar database, plus an in-process fake.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hical_core::{AppError, AppResult};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Calendar permission as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalendarAuthorization {
    Authorized,
    Denied,
    NotDetermined,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeCalendarInfo {
    pub id: String,
    pub title: String,
    pub allows_modifications: bool,
}

/// An item in the platform calendar.
#[derive(Debug, Clone, PartialEq)]
pub struct NativeItem {
    /// Assigned by the platform on first save.
    pub id: Option<String>,
    pub calendar_id: String,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub notes: Option<String>,
    /// Alarm offsets in seconds relative to `start`.
    pub alarm_offsets: Vec<i64>,
    pub last_modified: DateTime<Utc>,
}

#[async_trait]
pub trait NativeCalendar: Send + Sync {
    fn authorization(&self) -> CalendarAuthorization;

    /// Prompt for access. Returns whether access is now granted.
    async fn request_access(&self) -> AppResult<bool>;

    async fn calendars(&self) -> AppResult<Vec<NativeCalendarInfo>>;

    async fn default_calendar_id(&self) -> AppResult<Option<String>>;

    async fn create_calendar(&self, title: &str) -> AppResult<NativeCalendarInfo>;

    /// Items starting inside `range`. An empty `calendar_ids` means every calendar.
    async fn items(
        &self,
        calendar_ids: &[String],
        range: Range<DateTime<Utc>>,
    ) -> AppResult<Vec<NativeItem>>;

    async fn item(&self, id: &str) -> AppResult<Option<NativeItem>>;

    /// Insert when `item.id` is `None`, otherwise replace. Returns the stored item.
    async fn save_item(&self, item: NativeItem) -> AppResult<NativeItem>;

    async fn remove_item(&self, id: &str) -> AppResult<()>;

    /// Notifications that the calendar database changed outside HiCal.
    /// `None` when the platform cannot report changes.
    fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

struct Inner {
    authorization: CalendarAuthorization,
    grant_on_request: bool,
    calendars: Vec<NativeCalendarInfo>,
    default_calendar: Option<String>,
    items: BTreeMap<String, NativeItem>,
    next_id: u64,
}

impl Inner {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// In-memory calendar database with one default calendar.
pub struct MemoryNativeCalendar {
    inner: Mutex<Inner>,
    changes: broadcast::Sender<()>,
}

pub const DEFAULT_CALENDAR_ID: &str = "calendar-default";

impl MemoryNativeCalendar {
    pub fn new(authorization: CalendarAuthorization) -> Self {
        Self {
            inner: Mutex::new(Inner {
                authorization,
                grant_on_request: true,
                calendars: vec![NativeCalendarInfo {
                    id: DEFAULT_CALENDAR_ID.to_string(),
                    title: "Calendar".to_string(),
                    allows_modifications: true,
                }],
                default_calendar: Some(DEFAULT_CALENDAR_ID.to_string()),
                items: BTreeMap::new(),
                next_id: 0,
            }),
            changes: broadcast::channel(16).0,
        }
    }

    fn notify_changed(&self) {
        // No receivers is fine.
        let _ = self.changes.send(());
    }

    pub fn set_authorization(&self, authorization: CalendarAuthorization) {
        self.inner.lock().authorization = authorization;
    }

    /// Whether a later `request_access` prompt is accepted.
    pub fn set_grant_on_request(&self, grant: bool) {
        self.inner.lock().grant_on_request = grant;
    }

    pub fn add_calendar(&self, title: &str) -> String {
        let mut inner = self.inner.lock();
        let id = inner.next_id("calendar");
        inner.calendars.push(NativeCalendarInfo {
            id: id.clone(),
            title: title.to_string(),
            allows_modifications: true,
        });
        id
    }

    /// Add an item as the user would, keeping its `last_modified`.
    pub fn insert(&self, mut item: NativeItem) -> String {
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id("item");
            item.id = Some(id.clone());
            inner.items.insert(id.clone(), item);
            id
        };
        self.notify_changed();
        id
    }

    /// Modify an item as the user would.
    pub fn edit(&self, id: &str, change: impl FnOnce(&mut NativeItem)) -> bool {
        let edited = match self.inner.lock().items.get_mut(id) {
            Some(item) => {
                change(item);
                item.last_modified = Utc::now();
                true
            }
            None => false,
        };
        if edited {
            self.notify_changed();
        }
        edited
    }

    pub fn all_items(&self) -> Vec<NativeItem> {
        self.inner.lock().items.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<NativeItem> {
        self.inner.lock().items.get(id).cloned()
    }
}

impl Default for MemoryNativeCalendar {
    fn default() -> Self {
        Self::new(CalendarAuthorization::Authorized)
    }
}

#[async_trait]
impl NativeCalendar for MemoryNativeCalendar {
    fn authorization(&self) -> CalendarAuthorization {
        self.inner.lock().authorization
    }

    async fn request_access(&self) -> AppResult<bool> {
        let mut inner = self.inner.lock();
        if inner.authorization == CalendarAuthorization::NotDetermined {
            inner.authorization = if inner.grant_on_request {
                CalendarAuthorization::Authorized
            } else {
                CalendarAuthorization::Denied
            };
        }
        Ok(inner.authorization == CalendarAuthorization::Authorized)
    }

    async fn calendars(&self) -> AppResult<Vec<NativeCalendarInfo>> {
        Ok(self.inner.lock().calendars.clone())
    }

    async fn default_calendar_id(&self) -> AppResult<Option<String>> {
        Ok(self.inner.lock().default_calendar.clone())
    }

    async fn create_calendar(&self, title: &str) -> AppResult<NativeCalendarInfo> {
        let mut inner = self.inner.lock();
        let calendar = NativeCalendarInfo {
            id: inner.next_id("calendar"),
            title: title.to_string(),
            allows_modifications: true,
        };
        inner.calendars.push(calendar.clone());
        Ok(calendar)
    }

    async fn items(
        &self,
        calendar_ids: &[String],
        range: Range<DateTime<Utc>>,
    ) -> AppResult<Vec<NativeItem>> {
        let inner = self.inner.lock();
        Ok(inner
            .items
            .values()
            .filter(|i| calendar_ids.is_empty() || calendar_ids.contains(&i.calendar_id))
            .filter(|i| range.contains(&i.start))
            .cloned()
            .collect())
    }

    async fn item(&self, id: &str) -> AppResult<Option<NativeItem>> {
        Ok(self.inner.lock().items.get(id).cloned())
    }

    async fn save_item(&self, mut item: NativeItem) -> AppResult<NativeItem> {
        let mut inner = self.inner.lock();
        if !inner.calendars.iter().any(|c| c.id == item.calendar_id) {
            return Err(AppError::not_found(format!("calendar {}", item.calendar_id)));
        }
        let id = match item.id.clone() {
            Some(id) if inner.items.contains_key(&id) => id,
            Some(id) => return Err(AppError::not_found(format!("calendar item {}", id))),
            None => inner.next_id("item"),
        };
        item.id = Some(id.clone());
        item.last_modified = Utc::now();
        inner.items.insert(id, item.clone());
        drop(inner);
        self.notify_changed();
        Ok(item)
    }

    async fn remove_item(&self, id: &str) -> AppResult<()> {
        if self.inner.lock().items.remove(id).is_none() {
            return Err(AppError::not_found(format!("calendar item {}", id)));
        }
        self.notify_changed();
        Ok(())
    }

    fn subscribe_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes.subscribe())
    }
}
