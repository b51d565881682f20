//! Local reminder notifications for HiCal events.
//!
//! The scheduler is registered as an [`hical_events::EventObserver`] so every
//! store write reschedules (and every delete cancels) the affected reminders.

pub mod center;
pub mod scheduler;

pub use center::{Authorization, MemoryNotificationCenter, NotificationCenter, NotificationRequest};
pub use scheduler::{notification_id, NotificationScheduler, ScheduleOutcome};
