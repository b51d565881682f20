//! Expansion of a recurrence rule into concrete event instances.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveTime, Timelike, Utc};
use hical_core::{AppError, AppResult, RecurrenceConfig};

use crate::types::{default_end, new_event_id, validate_title, Event, RecurrenceType, ReminderKind};

/// Everything needed to materialize one recurring (or single) event.
#[derive(Debug, Clone)]
pub struct RecurrenceRequest {
    pub title: String,
    /// Date of the first instance.
    pub base_date: NaiveDate,
    /// Supplies the time of day for every instance.
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub details: Option<String>,
    pub reminders: BTreeSet<ReminderKind>,
    pub recurrence_type: RecurrenceType,
    pub count: Option<u32>,
    pub end_date: Option<NaiveDate>,
}

impl RecurrenceRequest {
    /// Build a request from an edited draft.
    pub fn from_template(event: &Event) -> Self {
        Self {
            title: event.title.clone(),
            base_date: event.day(),
            start_at: event.start_at,
            end_at: event.end_at,
            details: event.details.clone(),
            reminders: event.push_reminders.clone(),
            recurrence_type: event.recurrence_type,
            count: event.recurrence_count,
            end_date: event.recurrence_end_date,
        }
    }
}

/// Stateless expander configured with the materialization horizon.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecurrenceEngine {
    config: RecurrenceConfig,
}

impl RecurrenceEngine {
    pub fn new(config: RecurrenceConfig) -> Self {
        Self { config }
    }

    /// Expand `request` into an ordered list of events.
    ///
    /// A non-repeating request yields one event without a group id. Otherwise
    /// every instance shares one fresh group id. An end date bounds the
    /// sequence inclusively and wins over a count; with neither bound the
    /// configured horizon applies and expansion stops there.
    ///
    /// # Errors
    /// Returns `AppError::InvalidInput` for a blank title, an explicit count of
    /// zero, or an end date before the base date.
    pub fn expand(&self, request: &RecurrenceRequest) -> AppResult<Vec<Event>> {
        validate_title(&request.title)?;
        if request.count == Some(0) {
            return Err(AppError::invalid_input("recurrence count must be positive"));
        }
        if let Some(end_date) = request.end_date {
            if end_date < request.base_date {
                return Err(AppError::invalid_input(
                    "recurrence end date is before the first occurrence",
                ));
            }
        }

        if request.recurrence_type == RecurrenceType::None {
            let mut event = self.instance(request, request.base_date, None);
            if let Some(start_at) = request.start_at {
                event.start_at = Some(start_at);
                event.end_at = Some(request.end_at.unwrap_or_else(|| default_end(start_at)));
            }
            return Ok(vec![event]);
        }

        let group_id = new_event_id();
        let ceiling = self.config.max_instances;
        let limit = match (request.end_date, request.count) {
            (Some(_), _) => ceiling,
            (None, Some(count)) => count.min(ceiling),
            (None, None) => self.config.indefinite_instances.min(ceiling),
        };

        let mut events = Vec::new();
        for n in 0..limit {
            let Some(date) = request.recurrence_type.advance(request.base_date, n) else {
                break;
            };
            if request.end_date.is_some_and(|end| date > end) {
                break;
            }
            events.push(self.instance(request, date, Some(&group_id)));
        }

        if request.end_date.is_some() && events.len() as u32 == ceiling {
            tracing::warn!(
                ceiling,
                title = %request.title,
                "Recurrence expansion truncated at instance ceiling"
            );
        }
        tracing::debug!(
            count = events.len(),
            kind = request.recurrence_type.raw_value(),
            "Expanded recurrence"
        );
        Ok(events)
    }

    fn instance(
        &self,
        request: &RecurrenceRequest,
        date: NaiveDate,
        group_id: Option<&str>,
    ) -> Event {
        let mut event = Event::new(request.title.trim());
        event.details = request.details.clone();
        event.push_reminders = request.reminders.clone();

        match request.start_at {
            Some(template_start) => {
                let time =
                    NaiveTime::from_hms_opt(template_start.hour(), template_start.minute(), 0)
                        .unwrap_or(NaiveTime::MIN);
                let start = date.and_time(time).and_utc();
                let duration = request
                    .end_at
                    .map(|end| end - template_start)
                    .unwrap_or_else(|| default_end(template_start) - template_start);
                event.start_at = Some(start);
                event.end_at = Some(start + duration);
            }
            None => event.intended_date = Some(date),
        }

        if let Some(group_id) = group_id {
            event.recurrence_group_id = Some(group_id.to_string());
            event.set_recurrence(request.recurrence_type, request.count, request.end_date);
        }
        event
    }
}
