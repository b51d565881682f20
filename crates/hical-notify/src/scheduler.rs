//! Derives local reminder notifications from an event's reminder set.

use std::sync::Arc;

use chrono::{DateTime, Duration, NaiveTime, Utc};
use hical_core::{AppError, AppResult, NotificationConfig};
use hical_events::{Event, EventObserver, ReminderKind};

use crate::center::{Authorization, NotificationCenter, NotificationRequest};

/// Stable request id for an `(event, kind)` pair.
pub fn notification_id(event_id: &str, kind: ReminderKind) -> String {
    format!("{}_{}", event_id, kind.raw_value())
}

/// Result of one `schedule` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub scheduled: Vec<String>,
    /// Kinds that were ineligible, already past, or refused by the platform.
    pub skipped: usize,
}

pub struct NotificationScheduler {
    center: Arc<dyn NotificationCenter>,
    config: NotificationConfig,
}

impl NotificationScheduler {
    pub fn new(center: Arc<dyn NotificationCenter>, config: NotificationConfig) -> Self {
        Self { center, config }
    }

    /// When `kind` should fire for `event`, ignoring the current time.
    ///
    /// Timed events fire at `start_at + offset`. Untimed events only honor the
    /// day-before and week-before kinds, anchored on the configured hour of the
    /// day after `created_at`.
    pub fn trigger_for(&self, event: &Event, kind: ReminderKind) -> Option<DateTime<Utc>> {
        if !kind.is_schedulable() {
            return None;
        }
        match event.start_at {
            Some(start_at) => Some(start_at + kind.offset()),
            None if kind.applies_without_start() => {
                let hour = NaiveTime::from_hms_opt(self.config.all_day_reminder_hour, 0, 0)?;
                let anchor = (event.created_at.date_naive() + Duration::days(1))
                    .and_time(hour)
                    .and_utc();
                Some(anchor + kind.offset())
            }
            None => None,
        }
    }

    /// Register notifications for every reminder on `event`.
    ///
    /// # Errors
    /// `PermissionDenied` when notifications are not authorized. Platform
    /// failures for individual requests are logged and skipped.
    pub fn schedule(&self, event: &Event) -> AppResult<ScheduleOutcome> {
        self.schedule_at(event, Utc::now())
    }

    pub(crate) fn schedule_at(
        &self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> AppResult<ScheduleOutcome> {
        if self.center.authorization() != Authorization::Authorized {
            return Err(AppError::permission_denied("notifications"));
        }

        let mut outcome = ScheduleOutcome::default();
        for kind in &event.push_reminders {
            let Some(fire_at) = self.trigger_for(event, *kind) else {
                outcome.skipped += 1;
                continue;
            };
            if fire_at <= now {
                outcome.skipped += 1;
                continue;
            }

            let request = NotificationRequest {
                id: notification_id(&event.id, *kind),
                event_id: event.id.clone(),
                kind: *kind,
                title: event.title.clone(),
                body: reminder_body(event, *kind),
                fire_at,
            };
            let id = request.id.clone();
            match self.center.add(request) {
                Ok(()) => outcome.scheduled.push(id),
                Err(e) => {
                    tracing::warn!(%id, "Failed to register notification: {}", e);
                    outcome.skipped += 1;
                }
            }
        }

        tracing::debug!(
            event_id = %event.id,
            scheduled = outcome.scheduled.len(),
            skipped = outcome.skipped,
            "Scheduled reminders"
        );
        Ok(outcome)
    }

    /// Remove the requests of every reminder kind for `event_id`, scheduled or not.
    pub fn cancel(&self, event_id: &str) {
        let ids: Vec<String> = ReminderKind::ALL
            .into_iter()
            .map(|kind| notification_id(event_id, kind))
            .collect();
        self.center.remove(&ids);
    }

    /// Cancel then schedule, so removed reminder kinds do not linger.
    ///
    /// # Errors
    /// Same as [`schedule`](Self::schedule).
    pub fn reschedule(&self, event: &Event) -> AppResult<ScheduleOutcome> {
        self.cancel(&event.id);
        self.schedule(event)
    }
}

fn reminder_body(event: &Event, kind: ReminderKind) -> String {
    match (kind, event.details.as_deref()) {
        (ReminderKind::AtTime, Some(details)) => format!("Starting now: {}", details),
        (ReminderKind::AtTime, None) => "Starting now".to_string(),
        (kind, Some(details)) => format!("{}: {}", kind.display_name(), details),
        (kind, None) => kind.display_name().to_string(),
    }
}

impl EventObserver for NotificationScheduler {
    fn events_saved(&self, events: &[Event]) {
        for event in events {
            match self.reschedule(event) {
                Ok(_) => {}
                Err(e) if e.is_gate() => {
                    tracing::debug!(event_id = %event.id, "Reminders not scheduled: {}", e)
                }
                Err(e) => tracing::warn!(event_id = %event.id, "Reminder scheduling failed: {}", e),
            }
        }
    }

    fn events_removed(&self, ids: &[String]) {
        for id in ids {
            self.cancel(id);
        }
    }
}
