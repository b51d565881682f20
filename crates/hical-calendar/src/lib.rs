//! Bridge between HiCal events and the platform calendar database.
//!
//! [`SystemCalendarBridge`] imports, exports and reconciles events through the
//! [`NativeCalendar`] port, remembering which native item mirrors which event in
//! a [`LinkStore`].

pub mod bridge;
pub mod links;
pub mod native;
pub mod types;

pub use bridge::SystemCalendarBridge;
pub use links::LinkStore;
pub use native::{
    CalendarAuthorization, MemoryNativeCalendar, NativeCalendar, NativeCalendarInfo, NativeItem,
    DEFAULT_CALENDAR_ID,
};
pub use types::{
    BridgeSettings, BridgeSyncReport, CalendarLink, CleanupReport, LinkOrigin, SyncDirection,
    SyncFrequency,
};
