//! Persistent mapping between events and platform calendar items.
//!
//! One row per native item. An event may transiently own several rows; that is
//! what duplicate cleanup repairs. Bridge settings live in the same database.

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use hical_core::AppResult;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::types::{BridgeSettings, CalendarLink, LinkOrigin, SyncDirection, SyncFrequency};

pub struct LinkStore {
    conn: Mutex<Connection>,
}

impl LinkStore {
    /// # Errors
    /// Returns `AppError::Database` if the file cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// # Errors
    /// Returns `AppError::Database` if the schema cannot be created.
    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS calendar_links (
                native_id TEXT PRIMARY KEY,
                event_id TEXT NOT NULL,
                calendar_id TEXT NOT NULL,
                origin TEXT NOT NULL,
                event_updated_at TEXT NOT NULL,
                native_modified_at TEXT NOT NULL,
                synced_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_calendar_links_event ON calendar_links(event_id);

            CREATE TABLE IF NOT EXISTS bridge_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn links(&self) -> AppResult<Vec<CalendarLink>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT native_id, event_id, calendar_id, origin,
                    event_updated_at, native_modified_at, synced_at
             FROM calendar_links ORDER BY event_id, native_id",
        )?;
        let links = stmt
            .query_map([], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    pub fn links_for_event(&self, event_id: &str) -> AppResult<Vec<CalendarLink>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT native_id, event_id, calendar_id, origin,
                    event_updated_at, native_modified_at, synced_at
             FROM calendar_links WHERE event_id = ?1 ORDER BY native_id",
        )?;
        let links = stmt
            .query_map(params![event_id], link_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(links)
    }

    pub fn link_by_native(&self, native_id: &str) -> AppResult<Option<CalendarLink>> {
        let conn = self.conn.lock();
        let link = conn
            .query_row(
                "SELECT native_id, event_id, calendar_id, origin,
                        event_updated_at, native_modified_at, synced_at
                 FROM calendar_links WHERE native_id = ?1",
                params![native_id],
                link_from_row,
            )
            .optional()?;
        Ok(link)
    }

    pub fn upsert(&self, link: &CalendarLink) -> AppResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO calendar_links
             (native_id, event_id, calendar_id, origin,
              event_updated_at, native_modified_at, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                link.native_id,
                link.event_id,
                link.calendar_id,
                link.origin.raw_value(),
                link.event_version.to_rfc3339(),
                link.native_version.to_rfc3339(),
                link.synced_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub fn remove(&self, native_id: &str) -> AppResult<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "DELETE FROM calendar_links WHERE native_id = ?1",
            params![native_id],
        )?;
        Ok(n > 0)
    }

    /// Missing or unparseable keys fall back to defaults.
    pub fn load_settings(&self) -> AppResult<BridgeSettings> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT key, value FROM bridge_settings")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut settings = BridgeSettings::default();
        for (key, value) in rows {
            match key.as_str() {
                "enabled" => settings.enabled = value == "true",
                "direction" => {
                    if let Some(direction) = SyncDirection::from_raw(&value) {
                        settings.direction = direction;
                    }
                }
                "frequency" => {
                    if let Some(frequency) = SyncFrequency::from_raw(&value) {
                        settings.frequency = frequency;
                    }
                }
                "selected_calendars" => match serde_json::from_str::<BTreeSet<String>>(&value) {
                    Ok(selected) => settings.selected_calendars = selected,
                    Err(e) => tracing::warn!("Ignoring stored calendar selection: {}", e),
                },
                "dedicated_calendar_id" => settings.dedicated_calendar_id = Some(value),
                "last_sync" => {
                    settings.last_sync = DateTime::parse_from_rfc3339(&value)
                        .ok()
                        .map(|dt| dt.with_timezone(&Utc));
                }
                other => tracing::debug!(key = other, "Unknown bridge setting"),
            }
        }
        Ok(settings)
    }

    pub fn save_settings(&self, settings: &BridgeSettings) -> AppResult<()> {
        let selected = serde_json::to_string(&settings.selected_calendars)
            .map_err(|e| hical_core::AppError::Other(e.into()))?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM bridge_settings", [])?;
        let put = |key: &str, value: &str| {
            tx.execute(
                "INSERT INTO bridge_settings (key, value) VALUES (?1, ?2)",
                params![key, value],
            )
        };
        put("enabled", if settings.enabled { "true" } else { "false" })?;
        put("direction", settings.direction.raw_value())?;
        put("frequency", settings.frequency.raw_value())?;
        put("selected_calendars", &selected)?;
        if let Some(id) = &settings.dedicated_calendar_id {
            put("dedicated_calendar_id", id)?;
        }
        if let Some(at) = settings.last_sync {
            put("last_sync", &at.to_rfc3339())?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn link_from_row(row: &Row<'_>) -> rusqlite::Result<CalendarLink> {
    let origin: String = row.get(3)?;
    Ok(CalendarLink {
        native_id: row.get(0)?,
        event_id: row.get(1)?,
        calendar_id: row.get(2)?,
        origin: LinkOrigin::from_raw(&origin).unwrap_or(LinkOrigin::Exported),
        event_version: timestamp_column(row, 4)?,
        native_version: timestamp_column(row, 5)?,
        synced_at: timestamp_column(row, 6)?,
    })
}

fn timestamp_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn link(native_id: &str, event_id: &str) -> CalendarLink {
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();
        CalendarLink {
            native_id: native_id.to_string(),
            event_id: event_id.to_string(),
            calendar_id: "calendar-default".to_string(),
            origin: LinkOrigin::Exported,
            event_version: at,
            native_version: at + chrono::Duration::milliseconds(250),
            synced_at: at,
        }
    }

    #[test]
    fn test_links_by_event_and_native_id() {
        let store = LinkStore::in_memory().unwrap();
        store.upsert(&link("item-1", "event-a")).unwrap();
        store.upsert(&link("item-2", "event-a")).unwrap();
        store.upsert(&link("item-3", "event-b")).unwrap();

        assert_eq!(store.links_for_event("event-a").unwrap().len(), 2);
        assert_eq!(
            store.link_by_native("item-3").unwrap().unwrap().event_id,
            "event-b"
        );
        assert!(store.link_by_native("item-9").unwrap().is_none());

        assert!(store.remove("item-1").unwrap());
        assert_eq!(store.links().unwrap().len(), 2);
        assert!(store.remove("item-3").unwrap());
        assert!(!store.remove("item-3").unwrap());
    }

    #[test]
    fn test_upsert_replaces_row() {
        let store = LinkStore::in_memory().unwrap();
        store.upsert(&link("item-1", "event-a")).unwrap();
        let mut moved = link("item-1", "event-a");
        moved.calendar_id = "calendar-7".to_string();
        moved.origin = LinkOrigin::Imported;
        moved.native_version += chrono::Duration::seconds(5);
        store.upsert(&moved).unwrap();

        let links = store.links().unwrap();
        assert_eq!(links, vec![moved]);
    }

    #[test]
    fn test_default_settings() {
        let store = LinkStore::in_memory().unwrap();
        let settings = store.load_settings().unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.direction, SyncDirection::Bidirectional);
        assert_eq!(settings.frequency, SyncFrequency::Realtime);
        assert!(settings.selected_calendars.is_empty());
    }

    #[test]
    fn test_settings_persist_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calendar_links.db");
        let saved = BridgeSettings {
            enabled: true,
            direction: SyncDirection::SystemToLocal,
            frequency: SyncFrequency::Daily,
            selected_calendars: BTreeSet::from(["calendar-2".to_string()]),
            dedicated_calendar_id: Some("calendar-2".to_string()),
            last_sync: Some(Utc.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap()),
        };
        {
            let store = LinkStore::open(&path).unwrap();
            store.save_settings(&saved).unwrap();
            store.upsert(&link("item-1", "event-a")).unwrap();
        }
        let store = LinkStore::open(&path).unwrap();
        assert_eq!(store.load_settings().unwrap(), saved);
        assert_eq!(store.links().unwrap().len(), 1);
    }
}
