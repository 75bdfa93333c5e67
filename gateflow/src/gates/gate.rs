//! Environment gate state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Approval status of a gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    /// Waiting for a decision.
    #[default]
    Pending,
    /// Dependent stages may proceed.
    Approved,
    /// Dependent stages are skipped.
    Rejected,
}

impl GateStatus {
    /// Returns true once a decision has been recorded.
    #[must_use]
    pub fn is_decided(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A decision submitted by an approver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Let the guarded stages run.
    Approve,
    /// Route around the guarded stages.
    Reject,
}

impl Decision {
    /// Returns the status this decision leads to.
    #[must_use]
    pub fn status(self) -> GateStatus {
        match self {
            Self::Approve => GateStatus::Approved,
            Self::Reject => GateStatus::Rejected,
        }
    }
}

/// A named approval checkpoint held by one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentGate {
    /// Gate id, e.g. `production-eu-west`.
    pub id: String,
    /// The run awaiting the gate.
    pub run_id: Uuid,
    /// Current status.
    pub status: GateStatus,
    /// Who decided: an actor name or `policy:<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    /// When the gate was requested.
    pub requested_at: DateTime<Utc>,
    /// When the decision was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
}

impl EnvironmentGate {
    /// Creates a pending gate.
    #[must_use]
    pub fn new(id: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            id: id.into(),
            run_id,
            status: GateStatus::Pending,
            decided_by: None,
            requested_at: Utc::now(),
            decided_at: None,
        }
    }

    /// Returns true while no decision has been recorded.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == GateStatus::Pending
    }

    /// Records a decision.
    ///
    /// Only the first decision counts; later calls return the original
    /// status unchanged. Returns the status and whether it changed.
    pub fn decide(&mut self, decision: Decision, actor: impl Into<String>) -> (GateStatus, bool) {
        if self.status.is_decided() {
            return (self.status, false);
        }
        self.status = decision.status();
        self.decided_by = Some(actor.into());
        self.decided_at = Some(Utc::now());
        (self.status, true)
    }
}
