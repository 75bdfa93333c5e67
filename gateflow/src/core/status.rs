//! Stage state, run status and kind enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
///
/// The engine never interprets stage bodies; the kind is carried for
/// display, event payloads and artifact naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Compiles sources.
    Build,
    /// Runs test suites.
    Test,
    /// Produces distributable packages or images.
    Package,
    /// Publishes packages to a registry.
    Publish,
    /// Deploys to an environment.
    Deploy,
    /// Anything else.
    #[default]
    Work,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Build => write!(f, "build"),
            Self::Test => write!(f, "test"),
            Self::Package => write!(f, "package"),
            Self::Publish => write!(f, "publish"),
            Self::Deploy => write!(f, "deploy"),
            Self::Work => write!(f, "work"),
        }
    }
}

/// The execution state of a stage instance.
///
/// ```text
/// Pending -> Blocked <-> Ready -> Running -> Succeeded | Failed
///                                          | Skipped | Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    /// Not yet examined by the scheduler.
    #[default]
    Pending,
    /// At least one dependency is not terminal.
    Blocked,
    /// Dependencies succeeded and the condition holds.
    Ready,
    /// The stage body has been dispatched.
    Running,
    /// The executor reported success.
    Succeeded,
    /// The executor reported failure.
    Failed,
    /// Never ran: a dependency did not succeed, the condition was false,
    /// a gate rejected it, or the release was not needed.
    Skipped,
    /// Stopped by fail-fast or by a superseding run.
    Cancelled,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Blocked => write!(f, "blocked"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl StageState {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Cancelled
        )
    }

    /// Returns true for the only state that satisfies a dependency.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Returns true if the transition `self -> next` is allowed.
    #[must_use]
    pub fn can_transition_to(&self, next: Self) -> bool {
        use StageState::{Blocked, Cancelled, Failed, Pending, Ready, Running, Skipped, Succeeded};

        match (self, next) {
            (Pending, Blocked | Ready)
            | (Blocked, Ready)
            | (Ready, Blocked | Running)
            | (Running, Succeeded | Failed) => true,
            (Pending | Blocked | Ready, Skipped) => true,
            (Pending | Blocked | Ready | Running, Cancelled) => true,
            _ => false,
        }
    }
}

/// The overall outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Still executing.
    #[default]
    Running,
    /// No stage failed and no contract was violated.
    Succeeded,
    /// A stage failed or a fatal error stopped the run.
    Failed,
    /// A newer trigger on the same concurrency group superseded the run.
    Cancelled,
}

impl RunStatus {
    /// Returns true once the run has finished.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_state_is_terminal() {
        assert!(StageState::Succeeded.is_terminal());
        assert!(StageState::Skipped.is_terminal());
        assert!(StageState::Failed.is_terminal());
        assert!(StageState::Cancelled.is_terminal());
        assert!(!StageState::Pending.is_terminal());
        assert!(!StageState::Ready.is_terminal());
        assert!(!StageState::Running.is_terminal());
    }

    #[test]
    fn test_only_succeeded_is_success() {
        assert!(StageState::Succeeded.is_success());
        assert!(!StageState::Skipped.is_success());
    }

    #[test]
    fn test_transitions() {
        assert!(StageState::Pending.can_transition_to(StageState::Blocked));
        assert!(StageState::Blocked.can_transition_to(StageState::Ready));
        assert!(StageState::Ready.can_transition_to(StageState::Blocked));
        assert!(StageState::Ready.can_transition_to(StageState::Running));
        assert!(StageState::Running.can_transition_to(StageState::Failed));
        assert!(StageState::Running.can_transition_to(StageState::Cancelled));

        assert!(!StageState::Running.can_transition_to(StageState::Skipped));
        assert!(!StageState::Blocked.can_transition_to(StageState::Running));
        assert!(!StageState::Succeeded.can_transition_to(StageState::Failed));
        assert!(!StageState::Cancelled.can_transition_to(StageState::Cancelled));
    }

    #[test]
    fn test_stage_state_serialize() {
        let json = serde_json::to_string(&StageState::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);

        let back: StageState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, StageState::Succeeded);
    }

    #[test]
    fn test_display() {
        assert_eq!(StageKind::Deploy.to_string(), "deploy");
        assert_eq!(StageState::Blocked.to_string(), "blocked");
        assert_eq!(RunStatus::Cancelled.to_string(), "cancelled");
        assert!(!RunStatus::Running.is_terminal());
    }
}
