//! Per-slot runtime state owned by the lifecycle manager.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::activity::ActivityFlags;
use crate::candidate::Candidate;
use crate::domain::Slot;
use crate::instance::ProviderInstance;
use crate::status::StatusSnapshot;

/// Lifecycle state of one `(domain, key)` binding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindingState {
    #[default]
    Absent,
    Activating,
    Ready,
    Swapping,
    Failed,
    Drained,
}

/// A chosen candidate together with its live instance.
#[derive(Clone)]
pub struct LiveInstance {
    pub candidate: Arc<Candidate>,
    pub instance: Arc<dyn ProviderInstance>,
}

impl LiveInstance {
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.candidate.provider
    }
}

/// Mutable binding state, always accessed under the per-slot lock.
#[derive(Default)]
pub struct ActiveBinding {
    pub state: BindingState,
    pub current: Option<LiveInstance>,
    /// Kept until the post-swap cleanup window closes; used for rollback.
    pub previous: Option<LiveInstance>,
    pub last_activated_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub last_health_ok: Option<bool>,
    /// Mirrored from the activity store on every touch.
    pub activity: ActivityFlags,
}

impl ActiveBinding {
    #[must_use]
    pub fn snapshot(&self, slot: &Slot) -> StatusSnapshot {
        StatusSnapshot {
            domain: slot.domain,
            key: slot.key.clone(),
            state: self.state,
            current_provider: self.current.as_ref().map(|l| l.provider().to_owned()),
            previous_provider: self.previous.as_ref().map(|l| l.provider().to_owned()),
            last_activated_at: self.last_activated_at,
            last_error: self.last_error.clone(),
            last_health_at: self.last_health_at,
            last_health_ok: self.last_health_ok,
            activity: self.activity.clone(),
        }
    }
}
