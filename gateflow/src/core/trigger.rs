//! Trigger context describing why a run started.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The kind of event that started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Commits pushed to a ref.
    Push,
    /// A pull request was opened or updated.
    PullRequest,
    /// Someone started the run by hand.
    Manual,
    /// A schedule fired.
    Scheduled,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Push => write!(f, "push"),
            Self::PullRequest => write!(f, "pull_request"),
            Self::Manual => write!(f, "manual"),
            Self::Scheduled => write!(f, "scheduled"),
        }
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Self::Push),
            "pull_request" => Ok(Self::PullRequest),
            "manual" | "workflow_dispatch" => Ok(Self::Manual),
            "scheduled" | "schedule" => Ok(Self::Scheduled),
            other => Err(format!("unknown event kind '{other}'")),
        }
    }
}

/// Immutable record of the event that started a run.
///
/// Created once per run and shared read-only with every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    /// What happened.
    pub event: EventKind,
    /// Full ref name, e.g. `refs/heads/main` or `refs/tags/v1.2.0`.
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Whether the event originates from a fork.
    #[serde(default)]
    pub from_fork: bool,
    /// Who caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Arbitrary values such as the commit SHA or a computed version.
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    /// When the trigger was received.
    pub received_at: DateTime<Utc>,
}

impl TriggerContext {
    /// Creates a new trigger context.
    #[must_use]
    pub fn new(event: EventKind, git_ref: impl Into<String>) -> Self {
        Self {
            event,
            git_ref: git_ref.into(),
            from_fork: false,
            actor: None,
            values: BTreeMap::new(),
            received_at: Utc::now(),
        }
    }

    /// Marks the event as coming from a fork.
    #[must_use]
    pub fn from_fork(mut self, from_fork: bool) -> Self {
        self.from_fork = from_fork;
        self
    }

    /// Sets the actor.
    #[must_use]
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Adds a context value.
    #[must_use]
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Looks up a context value.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Returns the short branch or tag name.
    #[must_use]
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .or_else(|| self.git_ref.strip_prefix("refs/tags/"))
            .unwrap_or(&self.git_ref)
    }

    /// Returns the key used to deduplicate overlapping runs.
    #[must_use]
    pub fn concurrency_group(&self) -> &str {
        &self.git_ref
    }
}
