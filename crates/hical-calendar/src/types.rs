//! Bridge settings and link records.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way changes flow between HiCal and the platform calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    LocalToSystem,
    SystemToLocal,
    #[default]
    Bidirectional,
}

impl SyncDirection {
    pub fn raw_value(self) -> &'static str {
        match self {
            SyncDirection::LocalToSystem => "local_to_system",
            SyncDirection::SystemToLocal => "system_to_local",
            SyncDirection::Bidirectional => "bidirectional",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "local_to_system" => Some(SyncDirection::LocalToSystem),
            "system_to_local" => Some(SyncDirection::SystemToLocal),
            "bidirectional" => Some(SyncDirection::Bidirectional),
            _ => None,
        }
    }

    pub fn pushes(self) -> bool {
        !matches!(self, SyncDirection::SystemToLocal)
    }

    pub fn pulls(self) -> bool {
        !matches!(self, SyncDirection::LocalToSystem)
    }
}

/// How often the periodic timer syncs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncFrequency {
    Manual,
    Hourly,
    Daily,
    #[default]
    Realtime,
}

impl SyncFrequency {
    pub fn raw_value(self) -> &'static str {
        match self {
            SyncFrequency::Manual => "manual",
            SyncFrequency::Hourly => "hourly",
            SyncFrequency::Daily => "daily",
            SyncFrequency::Realtime => "realtime",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(SyncFrequency::Manual),
            "hourly" => Some(SyncFrequency::Hourly),
            "daily" => Some(SyncFrequency::Daily),
            "realtime" => Some(SyncFrequency::Realtime),
            _ => None,
        }
    }

    /// Timer period; `None` for manual.
    pub fn period(self) -> Option<Duration> {
        match self {
            SyncFrequency::Manual => None,
            SyncFrequency::Hourly => Some(Duration::from_secs(3600)),
            SyncFrequency::Daily => Some(Duration::from_secs(86_400)),
            // Fallback timer; realtime also reacts to saves and native store changes.
            SyncFrequency::Realtime => Some(Duration::from_secs(300)),
        }
    }
}

/// Persisted bridge configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BridgeSettings {
    pub enabled: bool,
    pub direction: SyncDirection,
    pub frequency: SyncFrequency,
    /// Calendars imported from. Empty means all.
    pub selected_calendars: BTreeSet<String>,
    pub dedicated_calendar_id: Option<String>,
    pub last_sync: Option<DateTime<Utc>>,
}

/// Which side an event was first created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOrigin {
    /// Created in HiCal and pushed out.
    Exported,
    /// Created in the platform calendar and pulled in. Never exported back.
    Imported,
}

impl LinkOrigin {
    pub fn raw_value(self) -> &'static str {
        match self {
            LinkOrigin::Exported => "exported",
            LinkOrigin::Imported => "imported",
        }
    }

    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw {
            "exported" => Some(LinkOrigin::Exported),
            "imported" => Some(LinkOrigin::Imported),
            _ => None,
        }
    }
}

/// Maps one platform item to the event it mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarLink {
    pub native_id: String,
    pub event_id: String,
    pub calendar_id: String,
    pub origin: LinkOrigin,
    /// `updated_at` of the event when both sides last agreed.
    pub event_version: DateTime<Utc>,
    /// `last_modified` of the native item when both sides last agreed.
    pub native_version: DateTime<Utc>,
    pub synced_at: DateTime<Utc>,
}

/// Counts from one bridge sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeSyncReport {
    pub imported: usize,
    pub exported: usize,
    /// Native items linked to an existing look-alike event instead of imported.
    pub linked: usize,
    pub pulled_updates: usize,
    pub pushed_updates: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed_items: usize,
    pub removed_links: usize,
}
