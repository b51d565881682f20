//! Interactive editing session with debounced autosave.
//!
//! Editing an existing event arms a short timer on every change; a later change
//! cancels the pending timer and arms a new one, so a burst of edits turns into
//! one store write. A new event is never autosaved: it is created by the first
//! explicit `save()`, and a one-shot guard keeps later saves from creating it
//! again.

use std::sync::Arc;
use std::time::Duration;

use hical_core::{AppError, AppResult};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::recurrence::{RecurrenceEngine, RecurrenceRequest};
use crate::store::EventStore;
use crate::types::Event;

enum Mode {
    New { engine: RecurrenceEngine },
    Existing,
}

pub struct EditSession {
    store: Arc<EventStore>,
    mode: Mode,
    draft: Arc<Mutex<Event>>,
    delay: Duration,
    pending: Mutex<Option<CancellationToken>>,
    /// Ids created by the first successful save of a new event.
    created: tokio::sync::Mutex<Option<Vec<String>>>,
}

impl EditSession {
    /// Start a creation session. Nothing is written until `save()`.
    pub fn for_new(store: Arc<EventStore>, engine: RecurrenceEngine, draft: Event) -> Self {
        Self {
            store,
            mode: Mode::New { engine },
            draft: Arc::new(Mutex::new(draft)),
            delay: Duration::ZERO,
            pending: Mutex::new(None),
            created: tokio::sync::Mutex::new(None),
        }
    }

    /// Start editing a stored event; changes autosave after `delay`.
    pub fn for_existing(store: Arc<EventStore>, event: Event, delay: Duration) -> Self {
        Self {
            store,
            mode: Mode::Existing,
            draft: Arc::new(Mutex::new(event)),
            delay,
            pending: Mutex::new(None),
            created: tokio::sync::Mutex::new(None),
        }
    }

    /// Current draft state.
    pub fn draft(&self) -> Event {
        self.draft.lock().clone()
    }

    pub fn is_new(&self) -> bool {
        matches!(self.mode, Mode::New { .. })
    }

    /// Apply a field change to the draft.
    ///
    /// Must be called from within a tokio runtime when editing an existing event.
    pub fn edit(&self, change: impl FnOnce(&mut Event)) {
        change(&mut self.draft.lock());
        if let Mode::Existing = self.mode {
            self.arm_autosave();
        }
    }

    fn arm_autosave(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.pending.lock().replace(token.clone()) {
            previous.cancel();
        }

        let store = self.store.clone();
        let draft = self.draft.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let event = draft.lock().clone();
                    let id = event.id.clone();
                    match tokio::task::spawn_blocking(move || store.update(event)).await {
                        Ok(Ok(_)) => tracing::debug!(%id, "Autosaved event"),
                        Ok(Err(e)) => tracing::warn!(%id, "Autosave failed: {}", e),
                        Err(e) => tracing::error!(%id, "Autosave task panicked: {}", e),
                    }
                }
            }
        });
    }

    /// Cancel a pending autosave without writing.
    pub fn discard(&self) {
        if let Some(token) = self.pending.lock().take() {
            token.cancel();
        }
    }

    /// Persist the draft now.
    ///
    /// For a new event this expands its recurrence and adds every instance in
    /// one batch. Repeated calls return the ids from the first successful save
    /// without writing again.
    ///
    /// # Errors
    /// `InvalidInput` for a blank title or zero count, `NotFound` if an edited
    /// event was deleted meanwhile, or a storage error.
    pub async fn save(&self) -> AppResult<Vec<String>> {
        match &self.mode {
            Mode::Existing => {
                self.discard();
                let event = self.draft();
                let store = self.store.clone();
                let saved = run_blocking(move || store.update(event)).await?;
                Ok(vec![saved.id])
            }
            Mode::New { engine } => {
                let mut created = self.created.lock().await;
                if let Some(ids) = created.as_ref() {
                    tracing::debug!("Creation session already saved; ignoring repeat save");
                    return Ok(ids.clone());
                }

                let events = engine.expand(&RecurrenceRequest::from_template(&self.draft()))?;
                let store = self.store.clone();
                let saved = run_blocking(move || store.add_batch(events)).await?;
                let ids: Vec<String> = saved.into_iter().map(|e| e.id).collect();
                tracing::info!(count = ids.len(), "Created event from editor");
                *created = Some(ids.clone());
                Ok(ids)
            }
        }
    }
}

async fn run_blocking<T, F>(f: F) -> AppResult<T>
where
    F: FnOnce() -> AppResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::Other(e.into()))?
}
