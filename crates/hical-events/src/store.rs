//! SQLite-backed event store.
//!
//! `EventStore` is the single local source of truth. Committed state is mirrored
//! in an in-memory snapshot so readers never wait on a write in progress; every
//! write holds the connection mutex for its whole duration, commits one SQLite
//! transaction, and only then publishes the new snapshot.
//!
//! Local mutations are recorded in `pending_changes` so the cloud sync pass can
//! find dirty records; changes applied from the cloud are not.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use hical_core::{AppError, AppResult};
use parking_lot::{Mutex, RwLock};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Transaction};

use crate::types::{Event, RecurrenceType, ReminderKind};

/// Receives every committed change. The notification scheduler plugs in here.
pub trait EventObserver: Send + Sync {
    fn events_saved(&self, events: &[Event]);
    fn events_removed(&self, ids: &[String]);
}

/// What happened to a dirty record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Upsert,
    /// Becomes a tombstone on the remote side.
    Delete,
}

impl ChangeKind {
    fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Upsert => "upsert",
            ChangeKind::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "delete" {
            ChangeKind::Delete
        } else {
            ChangeKind::Upsert
        }
    }
}

/// A locally modified record not yet reflected by a successful cloud sync.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub event_id: String,
    pub kind: ChangeKind,
    pub revision: i64,
    pub changed_at: DateTime<Utc>,
    /// Current local state for upserts.
    pub event: Option<Event>,
}

/// Dirty records plus the store revision they were read at.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changes: Vec<PendingChange>,
    pub revision: i64,
}

/// Outcome of merging remote state into the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteApplied {
    pub saved: usize,
    pub removed: usize,
    /// Records skipped because they were edited locally after the sync snapshot.
    pub skipped: usize,
}

struct Writer {
    conn: Connection,
    revision: i64,
}

pub struct EventStore {
    writer: Mutex<Writer>,
    snapshot: RwLock<BTreeMap<String, Event>>,
    observers: RwLock<Vec<Arc<dyn EventObserver>>>,
}

const EVENT_COLUMNS: &str = "id, title, start_at, end_at, details, push_reminders, created_at,
     updated_at, intended_date, recurrence_type, recurrence_count, recurrence_end_date,
     recurrence_group_id, is_onboarding";

impl EventStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the file cannot be opened or migrated.
    pub fn open<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create an in-memory store.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the schema cannot be created.
    pub fn in_memory() -> AppResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> AppResult<Self> {
        init_schema(&conn)?;
        let events = load_events(&conn)?;
        let revision: i64 = conn.query_row(
            "SELECT COALESCE(MAX(revision), 0) FROM pending_changes",
            [],
            |row| row.get(0),
        )?;
        tracing::debug!(count = events.len(), "Loaded event store");

        Ok(Self {
            writer: Mutex::new(Writer { conn, revision }),
            snapshot: RwLock::new(events.into_iter().map(|e| (e.id.clone(), e)).collect()),
            observers: RwLock::new(Vec::new()),
        })
    }

    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) {
        self.observers.write().push(observer);
    }

    // ---- Reads ----

    pub fn get(&self, id: &str) -> Option<Event> {
        self.snapshot.read().get(id).cloned()
    }

    /// All events ordered by date-for-sorting.
    pub fn all(&self) -> Vec<Event> {
        sorted(self.snapshot.read().values().cloned().collect())
    }

    pub fn count(&self) -> usize {
        self.snapshot.read().len()
    }

    /// Events whose date-for-sorting falls inside `range` (half-open).
    pub fn query_range(&self, range: Range<DateTime<Utc>>) -> Vec<Event> {
        let events = self
            .snapshot
            .read()
            .values()
            .filter(|e| range.contains(&e.sort_date()))
            .cloned()
            .collect();
        sorted(events)
    }

    /// Case-insensitive match on title or details. A blank query matches nothing.
    pub fn search(&self, text: &str) -> Vec<Event> {
        let needle = text.trim().to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }
        let events = self
            .snapshot
            .read()
            .values()
            .filter(|e| {
                e.title.to_lowercase().contains(&needle)
                    || e
                        .details
                        .as_deref()
                        .is_some_and(|d| d.to_lowercase().contains(&needle))
            })
            .cloned()
            .collect();
        sorted(events)
    }

    /// Events belonging to `date` by date-for-sorting.
    pub fn events_for(&self, date: NaiveDate) -> Vec<Event> {
        let events = self
            .snapshot
            .read()
            .values()
            .filter(|e| e.day() == date)
            .cloned()
            .collect();
        sorted(events)
    }

    pub fn events_in_group(&self, group_id: &str) -> Vec<Event> {
        let events = self
            .snapshot
            .read()
            .values()
            .filter(|e| e.recurrence_group_id.as_deref() == Some(group_id))
            .cloned()
            .collect();
        sorted(events)
    }

    // ---- Writes ----

    /// Insert a new event.
    ///
    /// # Errors
    /// `InvalidInput` for a blank title or an id already in use.
    pub fn add(&self, event: Event) -> AppResult<Event> {
        self.add_batch(vec![event])?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::invalid_input("nothing to add"))
    }

    /// Insert several events atomically: either all become visible or none do.
    ///
    /// # Errors
    /// `InvalidInput` if any event is invalid or reuses an existing id.
    pub fn add_batch(&self, events: Vec<Event>) -> AppResult<Vec<Event>> {
        for event in &events {
            event.validate()?;
        }
        let now = Utc::now();
        let events: Vec<Event> = events
            .into_iter()
            .map(|mut e| {
                e.updated_at = now;
                e
            })
            .collect();

        {
            let mut writer = self.writer.lock();
            {
                let snapshot = self.snapshot.read();
                let mut seen = std::collections::HashSet::new();
                for event in &events {
                    if snapshot.contains_key(&event.id) || !seen.insert(event.id.as_str()) {
                        return Err(AppError::invalid_input(format!(
                            "event id already exists: {}",
                            event.id
                        )));
                    }
                }
            }

            let first_revision = writer.revision + 1;
            let tx = writer.conn.transaction()?;
            for (offset, event) in events.iter().enumerate() {
                upsert_row(&tx, event)?;
                if !event.is_onboarding {
                    let revision = first_revision + offset as i64;
                    mark_dirty(&tx, &event.id, ChangeKind::Upsert, revision, now)?;
                }
            }
            tx.commit()?;
            writer.revision += events.len() as i64;

            let mut snapshot = self.snapshot.write();
            for event in &events {
                snapshot.insert(event.id.clone(), event.clone());
            }
        }

        tracing::debug!(count = events.len(), "Added events");
        self.notify_saved(&events);
        Ok(events)
    }

    /// Replace an existing event by id. Only this instance changes, even for
    /// members of a recurrence group.
    ///
    /// # Errors
    /// `NotFound` if no event has this id; `InvalidInput` for a blank title.
    pub fn update(&self, mut event: Event) -> AppResult<Event> {
        event.validate()?;
        let now = Utc::now();
        {
            let mut writer = self.writer.lock();
            let existing = self
                .snapshot
                .read()
                .get(&event.id)
                .cloned()
                .ok_or_else(|| AppError::not_found(event.id.clone()))?;
            event.created_at = existing.created_at;
            event.updated_at = now;

            let revision = writer.revision + 1;
            let tx = writer.conn.transaction()?;
            upsert_row(&tx, &event)?;
            if !event.is_onboarding {
                mark_dirty(&tx, &event.id, ChangeKind::Upsert, revision, now)?;
            }
            tx.commit()?;
            writer.revision = revision;

            self.snapshot.write().insert(event.id.clone(), event.clone());
        }

        tracing::debug!(id = %event.id, "Updated event");
        self.notify_saved(std::slice::from_ref(&event));
        Ok(event)
    }

    /// Delete a single event.
    ///
    /// # Errors
    /// `NotFound` if no event has this id.
    pub fn delete(&self, id: &str) -> AppResult<Event> {
        let mut removed = self.remove_where(|e| e.id == id)?;
        match removed.pop() {
            Some(event) => Ok(event),
            None => Err(AppError::not_found(id)),
        }
    }

    /// Delete every event of a recurrence group, past instances included.
    ///
    /// # Errors
    /// `NotFound` if the group has no members.
    pub fn delete_group(&self, group_id: &str) -> AppResult<Vec<Event>> {
        let removed = self.remove_where(|e| e.recurrence_group_id.as_deref() == Some(group_id))?;
        if removed.is_empty() {
            return Err(AppError::not_found(group_id));
        }
        tracing::info!(group_id, count = removed.len(), "Deleted recurrence group");
        Ok(removed)
    }

    fn remove_where(&self, predicate: impl Fn(&Event) -> bool) -> AppResult<Vec<Event>> {
        let now = Utc::now();
        let removed: Vec<Event> = {
            let mut writer = self.writer.lock();
            let removed: Vec<Event> = self
                .snapshot
                .read()
                .values()
                .filter(|e| predicate(e))
                .cloned()
                .collect();
            if removed.is_empty() {
                return Ok(removed);
            }

            let first_revision = writer.revision + 1;
            let tx = writer.conn.transaction()?;
            for (offset, event) in removed.iter().enumerate() {
                tx.execute("DELETE FROM events WHERE id = ?1", params![event.id])?;
                if event.is_onboarding {
                    tx.execute(
                        "DELETE FROM pending_changes WHERE event_id = ?1",
                        params![event.id],
                    )?;
                } else {
                    let revision = first_revision + offset as i64;
                    mark_dirty(&tx, &event.id, ChangeKind::Delete, revision, now)?;
                }
            }
            tx.commit()?;
            writer.revision += removed.len() as i64;

            let mut snapshot = self.snapshot.write();
            for event in &removed {
                snapshot.remove(&event.id);
            }
            removed
        };

        let ids: Vec<String> = removed.iter().map(|e| e.id.clone()).collect();
        tracing::debug!(count = ids.len(), "Deleted events");
        self.notify_removed(&ids);
        Ok(removed)
    }

    // ---- Dirty tracking ----

    /// Dirty records in revision order.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the change log cannot be read.
    pub fn pending_changes(&self) -> AppResult<ChangeSet> {
        let writer = self.writer.lock();
        let mut stmt = writer.conn.prepare(
            "SELECT event_id, kind, revision, changed_at FROM pending_changes ORDER BY revision",
        )?;
        let rows = stmt.query_map([], |row| {
            let kind: String = row.get(1)?;
            Ok((
                row.get::<_, String>(0)?,
                ChangeKind::parse(&kind),
                row.get::<_, i64>(2)?,
                parse_ts(&row.get::<_, String>(3)?, 3)?,
            ))
        })?;

        let snapshot = self.snapshot.read();
        let mut changes = Vec::new();
        for row in rows {
            let (event_id, kind, revision, changed_at) = row?;
            let event = match kind {
                ChangeKind::Upsert => snapshot.get(&event_id).cloned(),
                ChangeKind::Delete => None,
            };
            changes.push(PendingChange {
                event_id,
                kind,
                revision,
                changed_at,
                event,
            });
        }
        Ok(ChangeSet {
            changes,
            revision: writer.revision,
        })
    }

    /// Clear dirty marks that a sync has reflected. A record modified again
    /// since it was read keeps its newer mark.
    ///
    /// # Errors
    /// Returns `AppError::Database` on write failure.
    pub fn acknowledge(&self, changes: &[PendingChange]) -> AppResult<()> {
        let mut writer = self.writer.lock();
        let tx = writer.conn.transaction()?;
        for change in changes {
            tx.execute(
                "DELETE FROM pending_changes WHERE event_id = ?1 AND revision = ?2",
                params![change.event_id, change.revision],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Number of dirty records.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the change log cannot be read.
    pub fn dirty_count(&self) -> AppResult<usize> {
        let writer = self.writer.lock();
        let count: i64 =
            writer
                .conn
                .query_row("SELECT COUNT(*) FROM pending_changes", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Merge remote state in one transaction without marking anything dirty.
    ///
    /// Records changed locally after `since_revision` are left alone; older
    /// local dirty marks for applied records are dropped because the remote
    /// version won.
    ///
    /// # Errors
    /// Returns `AppError::Database` on write failure; nothing is applied then.
    pub fn apply_remote(
        &self,
        upserts: Vec<Event>,
        deletions: Vec<String>,
        since_revision: i64,
    ) -> AppResult<RemoteApplied> {
        let mut outcome = RemoteApplied::default();
        let mut saved = Vec::new();
        let mut removed = Vec::new();
        {
            let mut writer = self.writer.lock();
            let newer: HashMap<String, i64> = {
                let mut stmt = writer
                    .conn
                    .prepare("SELECT event_id, revision FROM pending_changes WHERE revision > ?1")?;
                let rows = stmt.query_map(params![since_revision], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                rows.collect::<Result<_, _>>()?
            };

            let tx = writer.conn.transaction()?;
            for event in upserts {
                if newer.contains_key(&event.id) {
                    outcome.skipped += 1;
                    continue;
                }
                upsert_row(&tx, &event)?;
                tx.execute(
                    "DELETE FROM pending_changes WHERE event_id = ?1",
                    params![event.id],
                )?;
                saved.push(event);
            }
            for id in deletions {
                if newer.contains_key(&id) {
                    outcome.skipped += 1;
                    continue;
                }
                let deleted = tx.execute("DELETE FROM events WHERE id = ?1", params![id])?;
                tx.execute("DELETE FROM pending_changes WHERE event_id = ?1", params![id])?;
                if deleted > 0 {
                    removed.push(id);
                }
            }
            tx.commit()?;

            let mut snapshot = self.snapshot.write();
            for event in &saved {
                snapshot.insert(event.id.clone(), event.clone());
            }
            for id in &removed {
                snapshot.remove(id);
            }
        }

        outcome.saved = saved.len();
        outcome.removed = removed.len();
        if !saved.is_empty() {
            self.notify_saved(&saved);
        }
        if !removed.is_empty() {
            self.notify_removed(&removed);
        }
        tracing::debug!(?outcome, "Applied remote changes");
        Ok(outcome)
    }

    /// Replace the entire local state with `events`, clearing all dirty marks.
    /// Used after restoring a cloud backup.
    ///
    /// # Errors
    /// Returns `AppError::Database` on write failure; nothing changes then.
    pub fn replace_all(&self, events: Vec<Event>) -> AppResult<()> {
        for event in &events {
            event.validate()?;
        }
        let previous: Vec<String> = {
            let mut writer = self.writer.lock();
            let tx = writer.conn.transaction()?;
            tx.execute("DELETE FROM events", [])?;
            tx.execute("DELETE FROM pending_changes", [])?;
            for event in &events {
                upsert_row(&tx, event)?;
            }
            tx.commit()?;

            let mut snapshot = self.snapshot.write();
            let previous = snapshot.keys().cloned().collect();
            *snapshot = events.iter().map(|e| (e.id.clone(), e.clone())).collect();
            previous
        };

        tracing::info!(count = events.len(), "Replaced local events");
        self.notify_removed(&previous);
        self.notify_saved(&events);
        Ok(())
    }

    fn notify_saved(&self, events: &[Event]) {
        for observer in self.observers.read().iter() {
            observer.events_saved(events);
        }
    }

    fn notify_removed(&self, ids: &[String]) {
        for observer in self.observers.read().iter() {
            observer.events_removed(ids);
        }
    }
}

fn sorted(mut events: Vec<Event>) -> Vec<Event> {
    events.sort_by(|a, b| a.sort_date().cmp(&b.sort_date()).then_with(|| a.id.cmp(&b.id)));
    events
}

fn init_schema(conn: &Connection) -> AppResult<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            start_at TEXT,
            end_at TEXT,
            details TEXT,
            push_reminders TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            intended_date TEXT,
            recurrence_type TEXT NOT NULL DEFAULT 'none',
            recurrence_count INTEGER,
            recurrence_end_date TEXT,
            recurrence_group_id TEXT,
            is_onboarding INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_events_group ON events(recurrence_group_id);

        CREATE TABLE IF NOT EXISTS pending_changes (
            event_id TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            revision INTEGER NOT NULL,
            changed_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn load_events(conn: &Connection) -> AppResult<Vec<Event>> {
    let mut stmt = conn.prepare(&format!("SELECT {} FROM events", EVENT_COLUMNS))?;
    let rows = stmt.query_map([], row_to_event)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn upsert_row(tx: &Transaction<'_>, event: &Event) -> AppResult<()> {
    let reminders: Vec<&str> = event.push_reminders.iter().map(|k| k.raw_value()).collect();
    let reminders = serde_json::to_string(&reminders)
        .map_err(|e| AppError::invalid_input(format!("unserializable reminders: {}", e)))?;

    tx.execute(
        &format!(
            "INSERT OR REPLACE INTO events ({})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            EVENT_COLUMNS
        ),
        params![
            event.id,
            event.title,
            event.start_at.map(|t| t.to_rfc3339()),
            event.end_at.map(|t| t.to_rfc3339()),
            event.details,
            reminders,
            event.created_at.to_rfc3339(),
            event.updated_at.to_rfc3339(),
            event.intended_date.map(|d| d.to_string()),
            event.recurrence_type.raw_value(),
            event.recurrence_count,
            event.recurrence_end_date.map(|d| d.to_string()),
            event.recurrence_group_id,
            event.is_onboarding as i32,
        ],
    )?;
    Ok(())
}

fn mark_dirty(
    tx: &Transaction<'_>,
    event_id: &str,
    kind: ChangeKind,
    revision: i64,
    changed_at: DateTime<Utc>,
) -> AppResult<()> {
    tx.execute(
        "INSERT OR REPLACE INTO pending_changes (event_id, kind, revision, changed_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![event_id, kind.as_str(), revision, changed_at.to_rfc3339()],
    )?;
    Ok(())
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(s: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_opt_ts(s: Option<String>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s, idx)).transpose()
}

fn parse_opt_date(s: Option<String>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    s.map(|s| s.parse::<NaiveDate>().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let reminders_json: String = row.get(5)?;
    let raw: Vec<String> =
        serde_json::from_str(&reminders_json).map_err(|e| conversion_error(5, e))?;
    let push_reminders = raw.iter().filter_map(|r| ReminderKind::from_raw(r)).collect();

    let recurrence_raw: String = row.get(9)?;
    let is_onboarding: i32 = row.get(13)?;

    Ok(Event {
        id: row.get(0)?,
        title: row.get(1)?,
        start_at: parse_opt_ts(row.get(2)?, 2)?,
        end_at: parse_opt_ts(row.get(3)?, 3)?,
        details: row.get(4)?,
        push_reminders,
        created_at: parse_ts(&row.get::<_, String>(6)?, 6)?,
        updated_at: parse_ts(&row.get::<_, String>(7)?, 7)?,
        intended_date: parse_opt_date(row.get(8)?, 8)?,
        recurrence_type: RecurrenceType::from_raw(&recurrence_raw).unwrap_or_default(),
        recurrence_count: row.get(10)?,
        recurrence_end_date: parse_opt_date(row.get(11)?, 11)?,
        recurrence_group_id: row.get(12)?,
        is_onboarding: is_onboarding != 0,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::recurrence::{RecurrenceEngine, RecurrenceRequest};
    use chrono::{Duration, TimeZone};
    use rusqlite::OptionalExtension;
    use std::collections::BTreeSet;

    /// Look up one stored row directly, bypassing the snapshot.
    fn stored_row(store: &EventStore, id: &str) -> Option<Event> {
        let writer = store.writer.lock();
        writer
            .conn
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id],
                row_to_event,
            )
            .optional()
            .unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        saved: Mutex<Vec<String>>,
        removed: Mutex<Vec<String>>,
    }

    impl EventObserver for Recorder {
        fn events_saved(&self, events: &[Event]) {
            self.saved.lock().extend(events.iter().map(|e| e.id.clone()));
        }

        fn events_removed(&self, ids: &[String]) {
            self.removed.lock().extend(ids.iter().cloned());
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn timed(title: &str, y: i32, m: u32, d: u32, h: u32) -> Event {
        Event::new(title).with_time(Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap(), None)
    }

    fn weekly_group(count: u32) -> Vec<Event> {
        RecurrenceEngine::default()
            .expand(&RecurrenceRequest {
                title: "Piano".to_string(),
                base_date: date(2020, 1, 6),
                start_at: None,
                end_at: None,
                details: None,
                reminders: BTreeSet::new(),
                recurrence_type: RecurrenceType::Weekly,
                count: Some(count),
                end_date: None,
            })
            .unwrap()
    }

    #[test]
    fn test_add_and_get() {
        let store = EventStore::in_memory().unwrap();
        let event = store.add(timed("Lunch", 2024, 4, 2, 12)).unwrap();
        let loaded = store.get(&event.id).unwrap();
        assert_eq!(loaded.title, "Lunch");
        assert_eq!(store.count(), 1);
        assert_eq!(stored_row(&store, &event.id).unwrap(), loaded);
    }

    #[test]
    fn test_add_rejects_blank_title() {
        let store = EventStore::in_memory().unwrap();
        let err = store.add(Event::new("  ")).unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert_eq!(store.count(), 0);
        assert_eq!(store.dirty_count().unwrap(), 0);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let store = EventStore::in_memory().unwrap();
        let mut events = weekly_group(3);
        events.push(Event::new(""));
        assert!(store.add_batch(events).is_err());
        assert_eq!(store.count(), 0);

        let existing = store.add(Event::new("Existing")).unwrap();
        let mut clash = Event::new("Clash");
        clash.id = existing.id.clone();
        let batch = vec![Event::new("Fresh"), clash];
        assert!(store.add_batch(batch).is_err());
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_update_unknown_id_is_not_found() {
        let store = EventStore::in_memory().unwrap();
        let err = store.update(Event::new("Ghost")).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn test_update_keeps_created_at() {
        let store = EventStore::in_memory().unwrap();
        let original = store.add(Event::new("Draft")).unwrap();
        let mut edited = original.clone();
        edited.title = "Final".to_string();
        edited.created_at = original.created_at + Duration::days(3);

        let saved = store.update(edited).unwrap();
        assert_eq!(saved.created_at, original.created_at);
        assert_eq!(store.get(&original.id).unwrap().title, "Final");
    }

    #[test]
    fn test_update_is_single_instance() {
        let store = EventStore::in_memory().unwrap();
        let group = store.add_batch(weekly_group(3)).unwrap();
        let mut first = group[0].clone();
        first.title = "Piano recital".to_string();
        store.update(first).unwrap();

        let titles: Vec<_> = store
            .events_in_group(group[0].recurrence_group_id.as_deref().unwrap())
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["Piano recital", "Piano", "Piano"]);
    }

    #[test]
    fn test_delete_group_removes_past_and_future_only_in_group() {
        let store = EventStore::in_memory().unwrap();
        let group = store.add_batch(weekly_group(4)).unwrap();
        let other = store.add_batch(weekly_group(2)).unwrap();
        let single = store.add(Event::new("Single")).unwrap();

        let group_id = group[0].recurrence_group_id.clone().unwrap();
        // 2020 instances are all in the past.
        let removed = store.delete_group(&group_id).unwrap();
        assert_eq!(removed.len(), 4);
        assert!(store.events_in_group(&group_id).is_empty());
        assert_eq!(store.count(), other.len() + 1);
        assert!(store.get(&single.id).is_some());

        assert!(matches!(store.delete_group(&group_id), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_delete_unknown_is_not_found() {
        let store = EventStore::in_memory().unwrap();
        assert!(matches!(store.delete("missing"), Err(AppError::NotFound(_))));
    }

    #[test]
    fn test_search_is_case_insensitive_on_title_and_details() {
        let store = EventStore::in_memory().unwrap();
        store.add(Event::new("Team SYNC")).unwrap();
        store.add(Event::new("Dinner").with_details("sync calendars after")).unwrap();
        store.add(Event::new("Gym")).unwrap();

        assert_eq!(store.search("sync").len(), 2);
        assert_eq!(store.search("GYM").len(), 1);
        assert!(store.search("   ").is_empty());
    }

    #[test]
    fn test_events_for_uses_sort_date() {
        let store = EventStore::in_memory().unwrap();
        store.add(timed("Timed", 2024, 4, 2, 9)).unwrap();
        store.add(Event::new("Untimed").with_intended_date(date(2024, 4, 2))).unwrap();
        store.add(timed("Other day", 2024, 4, 3, 9)).unwrap();

        let titles: Vec<_> = store
            .events_for(date(2024, 4, 2))
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["Untimed", "Timed"]);
    }

    #[test]
    fn test_query_range_is_half_open() {
        let store = EventStore::in_memory().unwrap();
        store.add(timed("A", 2024, 4, 1, 9)).unwrap();
        store.add(timed("B", 2024, 4, 2, 9)).unwrap();
        store.add(timed("C", 2024, 4, 3, 9)).unwrap();

        let from = Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 4, 3, 9, 0, 0).unwrap();
        let titles: Vec<_> = store.query_range(from..to).into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn test_mutations_notify_observers_and_mark_dirty() {
        let store = EventStore::in_memory().unwrap();
        let recorder = Arc::new(Recorder::default());
        store.add_observer(recorder.clone());

        let event = store.add(Event::new("Walk")).unwrap();
        assert_eq!(recorder.saved.lock().as_slice(), [event.id.clone()]);
        assert_eq!(store.dirty_count().unwrap(), 1);

        store.delete(&event.id).unwrap();
        assert_eq!(recorder.removed.lock().as_slice(), [event.id.clone()]);

        let changes = store.pending_changes().unwrap();
        assert_eq!(changes.changes.len(), 1);
        assert_eq!(changes.changes[0].kind, ChangeKind::Delete);
        assert!(changes.changes[0].event.is_none());
    }

    #[test]
    fn test_onboarding_events_are_never_dirty() {
        let store = EventStore::in_memory().unwrap();
        let mut sample = Event::new("Welcome to HiCal");
        sample.is_onboarding = true;
        let sample = store.add(sample).unwrap();
        assert_eq!(store.dirty_count().unwrap(), 0);
        store.delete(&sample.id).unwrap();
        assert_eq!(store.dirty_count().unwrap(), 0);
    }

    #[test]
    fn test_acknowledge_keeps_newer_edits_dirty() {
        let store = EventStore::in_memory().unwrap();
        let event = store.add(Event::new("Read")).unwrap();
        let snapshot = store.pending_changes().unwrap();

        let mut edited = event.clone();
        edited.title = "Read chapter 3".to_string();
        store.update(edited).unwrap();

        store.acknowledge(&snapshot.changes).unwrap();
        assert_eq!(store.dirty_count().unwrap(), 1);

        let latest = store.pending_changes().unwrap();
        store.acknowledge(&latest.changes).unwrap();
        assert_eq!(store.dirty_count().unwrap(), 0);
    }

    #[test]
    fn test_apply_remote_skips_records_edited_after_snapshot() {
        let store = EventStore::in_memory().unwrap();
        let local = store.add(Event::new("Local")).unwrap();
        let snapshot = store.pending_changes().unwrap();

        let mut edited = local.clone();
        edited.title = "Edited during sync".to_string();
        store.update(edited).unwrap();

        let mut remote_copy = local.clone();
        remote_copy.title = "Remote".to_string();
        let incoming = Event::new("Incoming");

        let outcome = store
            .apply_remote(vec![remote_copy, incoming.clone()], vec![], snapshot.revision)
            .unwrap();
        assert_eq!(outcome.saved, 1);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(store.get(&local.id).unwrap().title, "Edited during sync");
        assert_eq!(store.get(&incoming.id).unwrap().title, "Incoming");
        // Remote records are not dirty.
        assert_eq!(store.dirty_count().unwrap(), 1);
    }

    #[test]
    fn test_apply_remote_deletion() {
        let store = EventStore::in_memory().unwrap();
        let event = store.add(Event::new("Doomed")).unwrap();
        let snapshot = store.pending_changes().unwrap();
        let outcome = store
            .apply_remote(vec![], vec![event.id.clone()], snapshot.revision)
            .unwrap();
        assert_eq!(outcome.removed, 1);
        assert!(store.get(&event.id).is_none());
        assert_eq!(store.dirty_count().unwrap(), 0);
    }

    #[test]
    fn test_replace_all() {
        let store = EventStore::in_memory().unwrap();
        store.add(Event::new("Old")).unwrap();
        store.replace_all(vec![Event::new("Restored")]).unwrap();
        assert_eq!(store.count(), 1);
        assert_eq!(store.all()[0].title, "Restored");
        assert_eq!(store.dirty_count().unwrap(), 0);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.db");

        let id = {
            let store = EventStore::open(&path).unwrap();
            let event = Event::new("Anniversary")
                .with_intended_date(date(2024, 9, 1))
                .with_reminders([ReminderKind::WeekBefore, ReminderKind::DayBefore]);
            store.add(event).unwrap().id
        };

        let store = EventStore::open(&path).unwrap();
        let loaded = store.get(&id).expect("event should survive reopen");
        assert_eq!(loaded.intended_date, Some(date(2024, 9, 1)));
        assert_eq!(loaded.push_reminders.len(), 2);
        assert_eq!(store.dirty_count().unwrap(), 1);

        // Revisions keep increasing after reopen.
        let before = store.pending_changes().unwrap().revision;
        store.add(Event::new("Next")).unwrap();
        assert!(store.pending_changes().unwrap().revision > before);
    }

    #[test]
    fn test_concurrent_reads_during_writes() {
        let store = Arc::new(EventStore::in_memory().unwrap());
        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..50 {
                    store.add(Event::new(format!("Event {}", i))).unwrap();
                }
            })
        };
        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                for _ in 0..200 {
                    let now = store.count();
                    assert!(now >= last);
                    last = now;
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(store.count(), 50);
    }
}
