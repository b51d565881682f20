//! Event model, recurrence expansion, and the local event store.
//!
//! The store is the only component that writes events locally. Everything that
//! needs to know "which day is this event on" goes through
//! [`types::date_for_sorting`].

pub mod editor;
pub mod recurrence;
pub mod store;
pub mod types;

pub use editor::EditSession;
pub use recurrence::{RecurrenceEngine, RecurrenceRequest};
pub use store::{ChangeKind, ChangeSet, EventObserver, EventStore, PendingChange, RemoteApplied};
pub use types::{date_for_sorting, start_of_day, Event, RecurrenceType, ReminderKind};
