//! Domains and slot identifiers.
//!
//! A *slot* is the `(domain, key)` pair applications resolve against. The
//! domain set is closed in this core; keys and provider labels share one
//! validated charset.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum length of a `key` or `provider` label.
pub const LABEL_MAX_LEN: usize = 128;

/// The closed set of component domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Adapter,
    Service,
    Task,
    Event,
    Workflow,
}

impl Domain {
    /// All domains, in declaration order.
    pub const ALL: [Domain; 5] = [
        Domain::Adapter,
        Domain::Service,
        Domain::Task,
        Domain::Event,
        Domain::Workflow,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Adapter => "adapter",
            Domain::Service => "service",
            Domain::Task => "task",
            Domain::Event => "event",
            Domain::Workflow => "workflow",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown domain name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown domain '{0}' (expected adapter|service|task|event|workflow)")]
pub struct UnknownDomain(pub String);

impl FromStr for Domain {
    type Err = UnknownDomain;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "adapter" => Ok(Domain::Adapter),
            "service" => Ok(Domain::Service),
            "task" => Ok(Domain::Task),
            "event" => Ok(Domain::Event),
            "workflow" => Ok(Domain::Workflow),
            other => Err(UnknownDomain(other.to_owned())),
        }
    }
}

/// Returns `true` when `label` matches `^[a-zA-Z0-9_.-]{1,128}$`.
///
/// Used for both slot keys and provider labels.
#[must_use]
pub fn is_valid_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= LABEL_MAX_LEN
        && label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'.' || b == b'-')
}

/// A `(domain, key)` pair identifying one resolvable slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Slot {
    pub domain: Domain,
    pub key: String,
}

impl Slot {
    pub fn new(domain: Domain, key: impl Into<String>) -> Self {
        Self {
            domain,
            key: key.into(),
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, self.key)
    }
}
