//! Event model and the lookup tables for reminder and recurrence kinds.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Months, NaiveDate, NaiveTime, Utc};
use hical_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};

/// When a reminder fires relative to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ReminderKind {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "at_time")]
    AtTime,
    #[serde(rename = "15_minutes")]
    Minutes15,
    #[serde(rename = "30_minutes")]
    Minutes30,
    #[serde(rename = "1_hour")]
    Hours1,
    #[serde(rename = "2_hours")]
    Hours2,
    #[serde(rename = "1_day")]
    DayBefore,
    #[serde(rename = "1_week")]
    WeekBefore,
}

struct ReminderRule {
    kind: ReminderKind,
    raw: &'static str,
    offset_secs: i64,
    display: &'static str,
    /// Honored for events without a start time.
    without_start: bool,
}

const REMINDER_RULES: [ReminderRule; 8] = [
    ReminderRule {
        kind: ReminderKind::None,
        raw: "none",
        offset_secs: 0,
        display: "No reminder",
        without_start: false,
    },
    ReminderRule {
        kind: ReminderKind::AtTime,
        raw: "at_time",
        offset_secs: 0,
        display: "At time of event",
        without_start: false,
    },
    ReminderRule {
        kind: ReminderKind::Minutes15,
        raw: "15_minutes",
        offset_secs: -15 * 60,
        display: "15 minutes before",
        without_start: false,
    },
    ReminderRule {
        kind: ReminderKind::Minutes30,
        raw: "30_minutes",
        offset_secs: -30 * 60,
        display: "30 minutes before",
        without_start: false,
    },
    ReminderRule {
        kind: ReminderKind::Hours1,
        raw: "1_hour",
        offset_secs: -60 * 60,
        display: "1 hour before",
        without_start: false,
    },
    ReminderRule {
        kind: ReminderKind::Hours2,
        raw: "2_hours",
        offset_secs: -2 * 60 * 60,
        display: "2 hours before",
        without_start: false,
    },
    ReminderRule {
        kind: ReminderKind::DayBefore,
        raw: "1_day",
        offset_secs: -24 * 60 * 60,
        display: "1 day before",
        without_start: true,
    },
    ReminderRule {
        kind: ReminderKind::WeekBefore,
        raw: "1_week",
        offset_secs: -7 * 24 * 60 * 60,
        display: "1 week before",
        without_start: true,
    },
];

impl ReminderKind {
    pub const ALL: [ReminderKind; 8] = [
        ReminderKind::None,
        ReminderKind::AtTime,
        ReminderKind::Minutes15,
        ReminderKind::Minutes30,
        ReminderKind::Hours1,
        ReminderKind::Hours2,
        ReminderKind::DayBefore,
        ReminderKind::WeekBefore,
    ];

    fn rule(self) -> &'static ReminderRule {
        // REMINDER_RULES is declared in variant order.
        &REMINDER_RULES[self as usize]
    }

    pub fn raw_value(self) -> &'static str {
        self.rule().raw
    }

    pub fn display_name(self) -> &'static str {
        self.rule().display
    }

    /// Signed offset from the event start, in seconds.
    pub fn offset_secs(self) -> i64 {
        self.rule().offset_secs
    }

    pub fn offset(self) -> Duration {
        Duration::seconds(self.offset_secs())
    }

    /// Whether this kind can fire for an event that has no time of day.
    pub fn applies_without_start(self) -> bool {
        self.rule().without_start
    }

    /// `None` never produces a notification.
    pub fn is_schedulable(self) -> bool {
        self != ReminderKind::None
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        REMINDER_RULES.iter().find(|r| r.raw == raw).map(|r| r.kind)
    }

    /// Map a native alarm offset back to a reminder kind.
    pub fn from_offset_secs(offset: i64) -> Option<Self> {
        REMINDER_RULES
            .iter()
            .filter(|r| r.kind.is_schedulable())
            .find(|r| r.offset_secs == offset)
            .map(|r| r.kind)
    }
}

/// Repetition period of a recurring event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecurrenceType {
    #[default]
    None,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl RecurrenceType {
    pub fn raw_value(self) -> &'static str {
        match self {
            RecurrenceType::None => "none",
            RecurrenceType::Daily => "daily",
            RecurrenceType::Weekly => "weekly",
            RecurrenceType::Monthly => "monthly",
            RecurrenceType::Yearly => "yearly",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "none" => Some(RecurrenceType::None),
            "daily" => Some(RecurrenceType::Daily),
            "weekly" => Some(RecurrenceType::Weekly),
            "monthly" => Some(RecurrenceType::Monthly),
            "yearly" => Some(RecurrenceType::Yearly),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            RecurrenceType::None => "Does not repeat",
            RecurrenceType::Daily => "Every day",
            RecurrenceType::Weekly => "Every week",
            RecurrenceType::Monthly => "Every month",
            RecurrenceType::Yearly => "Every year",
        }
    }

    /// Date of the `n`th period after `base`.
    ///
    /// Month and year steps are measured from `base` so a month-end date does
    /// not drift after a short month.
    pub fn advance(self, base: NaiveDate, n: u32) -> Option<NaiveDate> {
        match self {
            RecurrenceType::None => (n == 0).then_some(base),
            RecurrenceType::Daily => base.checked_add_signed(Duration::days(i64::from(n))),
            RecurrenceType::Weekly => base.checked_add_signed(Duration::weeks(i64::from(n))),
            RecurrenceType::Monthly => base.checked_add_months(Months::new(n)),
            RecurrenceType::Yearly => base.checked_add_months(Months::new(n.checked_mul(12)?)),
        }
    }
}

/// A calendar event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    /// Absent means all-day / no specific time.
    pub start_at: Option<DateTime<Utc>>,
    /// Only meaningful when `start_at` is present.
    pub end_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
    pub push_reminders: BTreeSet<ReminderKind>,
    pub created_at: DateTime<Utc>,
    /// Last local or remote modification; stamped by the store.
    pub updated_at: DateTime<Utc>,
    /// The day an untimed event belongs to.
    pub intended_date: Option<NaiveDate>,
    #[serde(default)]
    pub recurrence_type: RecurrenceType,
    pub recurrence_count: Option<u32>,
    pub recurrence_end_date: Option<NaiveDate>,
    pub recurrence_group_id: Option<String>,
    /// Sample content shown on first launch; never synced to the cloud.
    #[serde(default)]
    pub is_onboarding: bool,
}

impl Event {
    /// New single event with the default day-before reminder.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_event_id(),
            title: title.into(),
            start_at: None,
            end_at: None,
            details: None,
            push_reminders: BTreeSet::from([ReminderKind::DayBefore]),
            created_at: now,
            updated_at: now,
            intended_date: None,
            recurrence_type: RecurrenceType::None,
            recurrence_count: None,
            recurrence_end_date: None,
            recurrence_group_id: None,
            is_onboarding: false,
        }
    }

    /// Set a time of day. `end_at` defaults to one hour after `start_at`.
    pub fn with_time(mut self, start_at: DateTime<Utc>, end_at: Option<DateTime<Utc>>) -> Self {
        self.set_time(start_at, end_at);
        self
    }

    pub fn set_time(&mut self, start_at: DateTime<Utc>, end_at: Option<DateTime<Utc>>) {
        self.start_at = Some(start_at);
        self.end_at = Some(end_at.unwrap_or_else(|| default_end(start_at)));
        self.intended_date = None;
    }

    /// Drop the time of day and attach the event to `date` instead.
    pub fn set_all_day(&mut self, date: NaiveDate) {
        self.start_at = None;
        self.end_at = None;
        self.intended_date = Some(date);
    }

    pub fn with_intended_date(mut self, date: NaiveDate) -> Self {
        self.set_all_day(date);
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_reminders(mut self, reminders: impl IntoIterator<Item = ReminderKind>) -> Self {
        self.push_reminders = reminders.into_iter().collect();
        self
    }

    /// Record repetition bounds. An end date always overrides a count.
    pub fn set_recurrence(
        &mut self,
        recurrence_type: RecurrenceType,
        count: Option<u32>,
        end_date: Option<NaiveDate>,
    ) {
        self.recurrence_type = recurrence_type;
        self.recurrence_end_date = end_date;
        self.recurrence_count = if end_date.is_some() { None } else { count };
    }

    /// The instant this event is "about". See [`date_for_sorting`].
    pub fn sort_date(&self) -> DateTime<Utc> {
        date_for_sorting(self)
    }

    /// Calendar day this event belongs to.
    pub fn day(&self) -> NaiveDate {
        date_for_sorting(self).date_naive()
    }

    /// Reject events that must never reach storage.
    ///
    /// # Errors
    /// Returns `AppError::InvalidInput` for a blank title.
    pub fn validate(&self) -> AppResult<()> {
        validate_title(&self.title)
    }
}

/// Date-for-sorting: `start_at`, else `intended_date` at midnight, else `created_at`.
///
/// Every component that sorts, groups or filters events by date goes through this.
pub fn date_for_sorting(event: &Event) -> DateTime<Utc> {
    event
        .start_at
        .or_else(|| event.intended_date.map(start_of_day))
        .unwrap_or(event.created_at)
}

pub fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

pub fn default_end(start_at: DateTime<Utc>) -> DateTime<Utc> {
    start_at + Duration::hours(1)
}

pub fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Titles must be non-empty after trimming.
///
/// # Errors
/// Returns `AppError::InvalidInput` if the title is blank.
pub fn validate_title(title: &str) -> AppResult<()> {
    if title.trim().is_empty() {
        return Err(AppError::invalid_input("title cannot be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_reminder_table_matches_raw_values() {
        for kind in ReminderKind::ALL {
            assert_eq!(ReminderKind::from_raw(kind.raw_value()), Some(kind));
        }
        assert_eq!(ReminderKind::Minutes15.offset_secs(), -900);
        assert_eq!(ReminderKind::DayBefore.offset_secs(), -86_400);
        assert_eq!(ReminderKind::WeekBefore.offset_secs(), -604_800);
    }

    #[test]
    fn test_reminder_serde_uses_raw_value() {
        let json = serde_json::to_string(&ReminderKind::Hours2).unwrap();
        assert_eq!(json, "\"2_hours\"");
    }

    #[test]
    fn test_from_offset_ignores_none_kind() {
        assert_eq!(ReminderKind::from_offset_secs(0), Some(ReminderKind::AtTime));
        assert_eq!(ReminderKind::from_offset_secs(-3600), Some(ReminderKind::Hours1));
        assert_eq!(ReminderKind::from_offset_secs(-42), None);
    }

    #[test]
    fn test_only_day_and_week_apply_without_start() {
        let eligible: Vec<_> = ReminderKind::ALL
            .into_iter()
            .filter(|k| k.applies_without_start())
            .collect();
        assert_eq!(eligible, vec![ReminderKind::DayBefore, ReminderKind::WeekBefore]);
    }

    #[test]
    fn test_monthly_advance_does_not_drift() {
        let base = date(2024, 1, 31);
        assert_eq!(RecurrenceType::Monthly.advance(base, 1), Some(date(2024, 2, 29)));
        assert_eq!(RecurrenceType::Monthly.advance(base, 2), Some(date(2024, 3, 31)));
        assert_eq!(RecurrenceType::Yearly.advance(date(2024, 2, 29), 1), Some(date(2025, 2, 28)));
    }

    #[test]
    fn test_sort_date_precedence() {
        let created = Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap();
        let mut event = Event::new("Dentist");
        event.created_at = created;
        assert_eq!(event.sort_date(), created);

        event.intended_date = Some(date(2024, 5, 10));
        assert_eq!(event.sort_date(), start_of_day(date(2024, 5, 10)));

        let start = Utc.with_ymd_and_hms(2024, 5, 12, 14, 30, 0).unwrap();
        event.start_at = Some(start);
        assert_eq!(event.sort_date(), start);
        assert_eq!(event.day(), date(2024, 5, 12));
    }

    #[test]
    fn test_with_time_defaults_end_to_one_hour() {
        let start = Utc.with_ymd_and_hms(2024, 5, 12, 14, 0, 0).unwrap();
        let event = Event::new("Call").with_time(start, None);
        assert_eq!(event.end_at, Some(start + Duration::hours(1)));

        let end = start + Duration::minutes(15);
        let event = Event::new("Call").with_time(start, Some(end));
        assert_eq!(event.end_at, Some(end));
    }

    #[test]
    fn test_end_date_overrides_count() {
        let mut event = Event::new("Standup");
        event.set_recurrence(RecurrenceType::Daily, Some(10), Some(date(2024, 6, 1)));
        assert_eq!(event.recurrence_count, None);
        assert_eq!(event.recurrence_end_date, Some(date(2024, 6, 1)));
    }

    #[test]
    fn test_blank_title_is_invalid() {
        let event = Event::new("   ");
        assert!(matches!(event.validate(), Err(AppError::InvalidInput(_))));
    }
}
