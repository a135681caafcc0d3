//! Per-slot status snapshots.
//!
//! The lifecycle manager writes one JSON document per `(domain, key)`
//! after every transition, atomically (write temp + rename), so operators
//! can inspect process state from disk without a live process.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityFlags;
use crate::domain::{Domain, Slot};
use crate::lifecycle::binding::BindingState;

/// The on-disk status document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub domain: Domain,
    pub key: String,
    pub state: BindingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_ok: Option<bool>,
    #[serde(default)]
    pub activity: ActivityFlags,
}

/// Directory of status snapshot files, one per slot.
pub struct StatusStore {
    dir: PathBuf,
}

impl StatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, slot: &Slot) -> PathBuf {
        // Keys are charset-restricted (no separators), so embedding them
        // in the filename is safe.
        self.dir.join(format!("{}__{}.json", slot.domain, slot.key))
    }

    /// Atomically writes one snapshot.
    ///
    /// # Errors
    /// Propagates filesystem errors; callers log and continue -- a failed
    /// snapshot write never fails a lifecycle operation.
    pub fn write(&self, snapshot: &StatusSnapshot) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.file_for(&Slot::new(snapshot.domain, snapshot.key.clone()));
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)
    }

    /// Reads one snapshot; missing or corrupt files read as `None`.
    #[must_use]
    pub fn load(&self, slot: &Slot) -> Option<StatusSnapshot> {
        Self::read_file(&self.file_for(slot))
    }

    /// Reads every snapshot in the directory, skipping unreadable files.
    #[must_use]
    pub fn load_all(&self) -> Vec<StatusSnapshot> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut out: Vec<StatusSnapshot> = entries
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|e| Self::read_file(&e.path()))
            .collect();
        out.sort_by(|a, b| (a.domain, &a.key).cmp(&(b.domain, &b.key)));
        out
    }

    fn read_file(path: &Path) -> Option<StatusSnapshot> {
        let bytes = std::fs::read(path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "Skipping corrupt status snapshot");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(domain: Domain, key: &str, provider: &str) -> StatusSnapshot {
        StatusSnapshot {
            domain,
            key: key.to_owned(),
            state: BindingState::Ready,
            current_provider: Some(provider.to_owned()),
            previous_provider: None,
            last_activated_at: Some(Utc::now()),
            last_error: None,
            last_health_at: None,
            last_health_ok: None,
            activity: ActivityFlags::default(),
        }
    }

    #[test]
    fn write_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StatusStore::new(tmp.path());
        store.write(&snapshot(Domain::Adapter, "cache", "redis")).unwrap();

        let loaded = store.load(&Slot::new(Domain::Adapter, "cache")).unwrap();
        assert_eq!(loaded.current_provider.as_deref(), Some("redis"));
        assert_eq!(loaded.state, BindingState::Ready);
    }

    #[test]
    fn load_all_sorts_and_skips_corrupt() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StatusStore::new(tmp.path());
        store.write(&snapshot(Domain::Service, "payment", "stripe")).unwrap();
        store.write(&snapshot(Domain::Adapter, "cache", "redis")).unwrap();
        std::fs::write(tmp.path().join("junk.json"), b"{").unwrap();

        let all = store.load_all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].domain, Domain::Adapter);
        assert_eq!(all[1].domain, Domain::Service);
    }

    #[test]
    fn rewrite_replaces_previous_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = StatusStore::new(tmp.path());
        store.write(&snapshot(Domain::Adapter, "cache", "redis")).unwrap();
        store.write(&snapshot(Domain::Adapter, "cache", "memcached")).unwrap();

        let all = store.load_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].current_provider.as_deref(), Some("memcached"));
    }
}
