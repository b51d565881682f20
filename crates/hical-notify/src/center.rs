//! Port to the platform notification service.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hical_core::{AppError, AppResult};
use hical_events::ReminderKind;
use parking_lot::Mutex;

/// Notification permission as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Authorized,
    Denied,
    NotDetermined,
}

/// A single local notification request.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    /// `"{event_id}_{reminder_raw_value}"`
    pub id: String,
    pub event_id: String,
    pub kind: ReminderKind,
    pub title: String,
    pub body: String,
    pub fire_at: DateTime<Utc>,
}

/// Platform notification center. Adding a request with an existing id replaces it.
pub trait NotificationCenter: Send + Sync {
    fn authorization(&self) -> Authorization;

    /// Register a request.
    ///
    /// # Errors
    /// Implementations return an error when the platform refuses the request.
    fn add(&self, request: NotificationRequest) -> AppResult<()>;

    /// Remove pending requests; unknown ids are ignored.
    fn remove(&self, ids: &[String]);

    fn pending_ids(&self) -> Vec<String>;
}

/// In-process notification center used by tests and headless runs.
pub struct MemoryNotificationCenter {
    authorization: Mutex<Authorization>,
    pending: Mutex<BTreeMap<String, NotificationRequest>>,
    reject_adds: Mutex<bool>,
}

impl MemoryNotificationCenter {
    pub fn new(authorization: Authorization) -> Self {
        Self {
            authorization: Mutex::new(authorization),
            pending: Mutex::new(BTreeMap::new()),
            reject_adds: Mutex::new(false),
        }
    }

    pub fn set_authorization(&self, authorization: Authorization) {
        *self.authorization.lock() = authorization;
    }

    /// Make every subsequent `add` fail, as a platform outage would.
    pub fn set_reject_adds(&self, reject: bool) {
        *self.reject_adds.lock() = reject;
    }

    pub fn get(&self, id: &str) -> Option<NotificationRequest> {
        self.pending.lock().get(id).cloned()
    }
}

impl Default for MemoryNotificationCenter {
    fn default() -> Self {
        Self::new(Authorization::Authorized)
    }
}

impl NotificationCenter for MemoryNotificationCenter {
    fn authorization(&self) -> Authorization {
        *self.authorization.lock()
    }

    fn add(&self, request: NotificationRequest) -> AppResult<()> {
        if *self.reject_adds.lock() {
            return Err(AppError::platform(format!(
                "notification {} refused",
                request.id
            )));
        }
        self.pending.lock().insert(request.id.clone(), request);
        Ok(())
    }

    fn remove(&self, ids: &[String]) {
        let mut pending = self.pending.lock();
        for id in ids {
            pending.remove(id);
        }
    }

    fn pending_ids(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }
}
