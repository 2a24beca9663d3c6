use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use effect_ledger_core::{now_utc, ArtifactEvent, ArtifactId, EventId, GovernanceError, NewEvent};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::backend::{JsonlLedgerBackend, LedgerBackend, MemoryLedgerBackend, SqliteLedgerBackend};
use crate::index::{IndexStats, LedgerIndex};
use crate::query::QueryFilter;

struct LedgerState {
    events: Vec<ArtifactEvent>,
    index: Option<LedgerIndex>,
    last_timestamp: Option<OffsetDateTime>,
}

/// Append-only event ledger.
///
/// Appends are serialized by a writer lock that also holds the backend's
/// own write lock, so ledgers in other processes sharing the medium queue
/// behind it. Events those writers appended are pulled into the arena
/// before each append. New events become visible to readers only after the
/// backend reports them durable. The secondary index is built on first use
/// and caught up after each append.
pub struct EventLedger {
    writer: Mutex<Box<dyn LedgerBackend>>,
    state: RwLock<LedgerState>,
    in_flight: Mutex<HashSet<ArtifactId>>,
    location: String,
}

/// An artifact marked as executing through one [`EventLedger`]; released on
/// drop.
pub struct ExecutionClaim<'a> {
    ledger: &'a EventLedger,
    artifact_id: ArtifactId,
}

impl Drop for ExecutionClaim<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.ledger.in_flight.lock() {
            running.remove(&self.artifact_id);
        }
    }
}

impl EventLedger {
    /// Loads the full history from `backend`.
    ///
    /// # Errors
    /// Fails when the backend cannot be read, or with
    /// [`GovernanceError::Projection`] when stored history repeats an event
    /// id or goes back in time.
    pub fn open(mut backend: Box<dyn LedgerBackend>) -> Result<Self> {
        let location = backend.describe();
        let events = backend
            .load()
            .with_context(|| format!("failed to load ledger from {location}"))?;
        verify_history(&events)?;
        let last_timestamp = events.last().map(|event| event.timestamp);
        info!(ledger = %location, events = events.len(), "ledger opened");

        Ok(Self {
            writer: Mutex::new(backend),
            state: RwLock::new(LedgerState {
                events,
                index: None,
                last_timestamp,
            }),
            in_flight: Mutex::new(HashSet::new()),
            location,
        })
    }

    pub fn open_sqlite(path: &Path) -> Result<Self> {
        Self::open(Box::new(SqliteLedgerBackend::open(path)?))
    }

    pub fn open_jsonl(path: &Path) -> Result<Self> {
        Self::open(Box::new(JsonlLedgerBackend::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(Box::new(MemoryLedgerBackend::new()))
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn append(&self, event: NewEvent) -> Result<ArtifactEvent> {
        let mut appended = self.append_many(vec![event])?;
        appended
            .pop()
            .ok_or_else(|| anyhow!("ledger append returned no event"))
    }

    /// Appends a batch atomically: every input is validated first, then all
    /// events are stamped with one timestamp no earlier than the previous
    /// event's and written in a single backend call.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] when any input is invalid, or
    /// the backend error when the write fails. Nothing is appended in
    /// either case.
    pub fn append_many(&self, inputs: Vec<NewEvent>) -> Result<Vec<ArtifactEvent>> {
        self.append_checked(inputs, |_| Ok(()))
    }

    /// Like [`EventLedger::append_many`], but runs `check` while holding the
    /// write lock, after events from other writers have been pulled in.
    /// Queries made by `check` see the latest durable history and nothing
    /// can be appended between the check and the write.
    ///
    /// # Errors
    /// Returns whatever `check` returns, in which case nothing is appended,
    /// plus the errors of [`EventLedger::append_many`].
    pub fn append_checked(
        &self,
        inputs: Vec<NewEvent>,
        check: impl FnOnce(&[NewEvent]) -> Result<()>,
    ) -> Result<Vec<ArtifactEvent>> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        for input in &inputs {
            input.validate()?;
        }

        let mut writer = self.lock_writer()?;
        let mut write = writer
            .begin_write()
            .with_context(|| format!("failed to lock {}", self.location))?;
        self.publish(&write.take_tail())?;

        check(&inputs)?;

        let last_timestamp = self.read_state()?.last_timestamp;
        let now = now_utc();
        let timestamp = last_timestamp.map_or(now, |last| last.max(now));

        let events: Vec<ArtifactEvent> = inputs
            .into_iter()
            .map(|input| input.stamp(EventId::new(), timestamp))
            .collect();

        write
            .commit(&events)
            .with_context(|| format!("failed to append {} events to {}", events.len(), self.location))?;
        self.publish(&events)?;
        drop(writer);

        for event in &events {
            debug!(
                event_id = %event.event_id,
                event_type = event.event_type.as_str(),
                artifact_id = %event.artifact_id,
                "event appended"
            );
        }
        Ok(events)
    }

    /// Pulls in events that other writers appended to the backend since this
    /// ledger last read or wrote it. Returns how many arrived.
    pub fn refresh(&self) -> Result<usize> {
        let mut writer = self.lock_writer()?;
        let tail = writer
            .begin_write()
            .with_context(|| format!("failed to lock {}", self.location))?
            .take_tail();
        drop(writer);
        self.publish(&tail)?;
        if !tail.is_empty() {
            debug!(ledger = %self.location, events = tail.len(), "ledger refreshed");
        }
        Ok(tail.len())
    }

    /// Marks `artifact_id` as executing through this ledger. Returns `None`
    /// when it already is.
    pub fn claim(&self, artifact_id: ArtifactId) -> Result<Option<ExecutionClaim<'_>>> {
        let mut running = self
            .in_flight
            .lock()
            .map_err(|_| anyhow!("in-flight registry poisoned"))?;
        if !running.insert(artifact_id) {
            return Ok(None);
        }
        Ok(Some(ExecutionClaim {
            ledger: self,
            artifact_id,
        }))
    }

    /// Events matching `filter`.
    ///
    /// # Errors
    /// Returns [`GovernanceError::Validation`] for an unknown cursor.
    pub fn query(&self, filter: &QueryFilter) -> Result<Vec<ArtifactEvent>> {
        let selected = self.with_index(|events, index| filter.select(events, index))??;
        Ok(selected)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read_state()?.events.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Copy of the full history in ledger order.
    pub fn events(&self) -> Result<Vec<ArtifactEvent>> {
        Ok(self.read_state()?.events.clone())
    }

    /// Index statistics, or `None` while the index has not been built.
    pub fn index_stats(&self) -> Result<Option<IndexStats>> {
        Ok(self.read_state()?.index.as_ref().map(LedgerIndex::stats))
    }

    /// Discards the index and rebuilds it from the arena.
    pub fn rebuild_index(&self) -> Result<IndexStats> {
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("ledger state lock poisoned"))?;
        let index = LedgerIndex::build(&state.events);
        let stats = index.stats();
        state.index = Some(index);
        info!(events = stats.indexed_events, "ledger index rebuilt");
        Ok(stats)
    }

    fn lock_writer(&self) -> Result<std::sync::MutexGuard<'_, Box<dyn LedgerBackend>>> {
        self.writer
            .lock()
            .map_err(|_| anyhow!("ledger writer lock poisoned"))
    }

    fn publish(&self, events: &[ArtifactEvent]) -> Result<()> {
        let Some(newest) = events.last() else {
            return Ok(());
        };
        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("ledger state lock poisoned"))?;
        let LedgerState {
            events: arena,
            index,
            last_timestamp,
        } = &mut *state;
        arena.extend(events.iter().cloned());
        let newest = newest.timestamp;
        *last_timestamp = Some(last_timestamp.map_or(newest, |last| last.max(newest)));
        if let Some(index) = index.as_mut() {
            index.catch_up(arena);
        }
        Ok(())
    }

    fn read_state(&self) -> Result<std::sync::RwLockReadGuard<'_, LedgerState>> {
        self.state
            .read()
            .map_err(|_| anyhow!("ledger state lock poisoned"))
    }

    fn with_index<R>(&self, f: impl FnOnce(&[ArtifactEvent], &LedgerIndex) -> R) -> Result<R> {
        {
            let state = self.read_state()?;
            if let Some(index) = state.index.as_ref() {
                return Ok(f(&state.events, index));
            }
        }

        let mut state = self
            .state
            .write()
            .map_err(|_| anyhow!("ledger state lock poisoned"))?;
        let LedgerState { events, index, .. } = &mut *state;
        let index = index.get_or_insert_with(|| {
            debug!(events = events.len(), "building ledger index");
            LedgerIndex::build(events)
        });
        index.catch_up(events);
        Ok(f(events, index))
    }
}

impl std::fmt::Debug for EventLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLedger")
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

fn verify_history(events: &[ArtifactEvent]) -> Result<(), GovernanceError> {
    let mut seen = HashSet::with_capacity(events.len());
    let mut previous: Option<&ArtifactEvent> = None;
    for event in events {
        if !seen.insert(event.event_id) {
            return Err(GovernanceError::Projection(format!(
                "duplicate event_id {} in stored history",
                event.event_id
            )));
        }
        if let Some(previous) = previous {
            if event.timestamp < previous.timestamp {
                return Err(GovernanceError::Projection(format!(
                    "event {} is timestamped before its predecessor {}",
                    event.event_id, previous.event_id
                )));
            }
        }
        previous = Some(event);
    }
    Ok(())
}
