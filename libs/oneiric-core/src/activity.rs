//! Durable per-slot operator flags: `{paused, draining, note}`.
//!
//! Backed by a single JSON file. Writes are atomic (temp + rename); reads
//! tolerate a missing or corrupt file and fall back to empty. Every actual
//! transition emits an `activity-event` and bumps the matching counter, so
//! watchers and metrics observe changes; no-op calls (pause while paused)
//! stay silent, which makes pause/resume idempotent.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::Slot;
use crate::events::{counters, Event, ObservabilitySink};

/// Operator flags for one `(domain, key)` slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFlags {
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub draining: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("failed to persist activity store at {path}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// File-backed store of [`ActivityFlags`] keyed by `domain/key`.
pub struct ActivityStore {
    path: PathBuf,
    state: parking_lot::Mutex<BTreeMap<String, ActivityFlags>>,
    sink: Arc<dyn ObservabilitySink>,
}

impl ActivityStore {
    /// Opens the store, loading existing flags when the file is readable.
    ///
    /// A missing or corrupt file yields an empty store; corruption is
    /// logged, never propagated.
    pub fn open(path: impl Into<PathBuf>, sink: Arc<dyn ObservabilitySink>) -> Self {
        let path = path.into();
        let state = Self::load_tolerant(&path);
        Self {
            path,
            state: parking_lot::Mutex::new(state),
            sink,
        }
    }

    fn load_tolerant(path: &Path) -> BTreeMap<String, ActivityFlags> {
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %err,
                        "Activity store is corrupt; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "Activity store unreadable; starting empty"
                );
                BTreeMap::new()
            }
        }
    }

    /// Current flags for a slot; absent slots read as default (all clear).
    #[must_use]
    pub fn flags(&self, slot: &Slot) -> ActivityFlags {
        self.state
            .lock()
            .get(&slot.to_string())
            .cloned()
            .unwrap_or_default()
    }

    /// Snapshot of every slot with non-default flags.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, ActivityFlags> {
        self.state.lock().clone()
    }

    /// Sets `paused` for the slot. Idempotent: pausing a paused slot does
    /// not re-emit.
    ///
    /// # Errors
    /// Returns `ActivityError::Persist` when the file cannot be written.
    pub fn pause(&self, slot: &Slot, note: Option<String>) -> Result<ActivityFlags, ActivityError> {
        self.transition(slot, counters::PAUSE, |flags| {
            if flags.paused {
                return false;
            }
            flags.paused = true;
            flags.note = note.clone();
            true
        })
    }

    /// Sets `draining` for the slot. Idempotent like [`Self::pause`].
    ///
    /// # Errors
    /// Returns `ActivityError::Persist` when the file cannot be written.
    pub fn drain(&self, slot: &Slot, note: Option<String>) -> Result<ActivityFlags, ActivityError> {
        self.transition(slot, counters::DRAIN, |flags| {
            if flags.draining {
                return false;
            }
            flags.draining = true;
            flags.note = note.clone();
            true
        })
    }

    /// Clears both flags. A resume with nothing set is a no-op.
    ///
    /// # Errors
    /// Returns `ActivityError::Persist` when the file cannot be written.
    pub fn resume(&self, slot: &Slot) -> Result<ActivityFlags, ActivityError> {
        self.transition(slot, counters::RESUME, |flags| {
            if !flags.paused && !flags.draining {
                return false;
            }
            flags.paused = false;
            flags.draining = false;
            flags.note = None;
            true
        })
    }

    fn transition(
        &self,
        slot: &Slot,
        counter: &'static str,
        apply: impl Fn(&mut ActivityFlags) -> bool,
    ) -> Result<ActivityFlags, ActivityError> {
        let (flags, changed) = {
            let mut state = self.state.lock();
            let entry = state.entry(slot.to_string()).or_default();
            let changed = apply(entry);
            let flags = entry.clone();
            if changed {
                if flags == ActivityFlags::default() {
                    state.remove(&slot.to_string());
                }
                self.persist_locked(&state)?;
            }
            (flags, changed)
        };

        if changed {
            self.sink.incr(counter);
            self.sink.emit(&Event::ActivityEvent {
                domain: slot.domain,
                key: slot.key.clone(),
                flags: flags.clone(),
            });
        }
        Ok(flags)
    }

    fn persist_locked(&self, state: &BTreeMap<String, ActivityFlags>) -> Result<(), ActivityError> {
        let write = || -> io::Result<()> {
            if let Some(parent) = self.path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = self.path.with_extension("json.tmp");
            let bytes = serde_json::to_vec_pretty(state)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &self.path)
        };
        write().map_err(|source| ActivityError::Persist {
            path: self.path.clone(),
            source,
        })
    }
}
