//! Run lifecycle events.
//!
//! The scheduler reports every state change as a [`RunEvent`] through an
//! [`EventSink`]. Sinks decide whether to log, collect or forward them.

mod sink;

pub use sink::{ChannelEventSink, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::RunStatus;
use crate::gates::GateStatus;
use crate::pipeline::InstanceId;
use crate::release::ReleaseDecision;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A state change in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run was planned and started.
    RunStarted {
        /// The run id.
        run_id: Uuid,
        /// The pipeline name.
        pipeline: String,
        /// The trigger ref.
        git_ref: String,
        /// Number of stage instances.
        instances: usize,
    },
    /// A run was resumed from a stored record.
    RunResumed {
        /// The run id.
        run_id: Uuid,
        /// Instances already terminal.
        completed: usize,
    },
    /// A stage body was dispatched.
    StageStarted {
        /// The run id.
        run_id: Uuid,
        /// The instance.
        instance: InstanceId,
    },
    /// A stage body reported success.
    StageSucceeded {
        /// The run id.
        run_id: Uuid,
        /// The instance.
        instance: InstanceId,
        /// Wall time of the body.
        duration_ms: u64,
    },
    /// A stage body reported failure or broke its output contract.
    StageFailed {
        /// The run id.
        run_id: Uuid,
        /// The instance.
        instance: InstanceId,
        /// Why.
        message: String,
    },
    /// A stage will never run.
    StageSkipped {
        /// The run id.
        run_id: Uuid,
        /// The instance.
        instance: InstanceId,
        /// Why.
        reason: String,
    },
    /// A stage was cancelled.
    StageCancelled {
        /// The run id.
        run_id: Uuid,
        /// The instance.
        instance: InstanceId,
        /// Why.
        reason: String,
    },
    /// A stage is waiting on a gate, or the gate was decided.
    GateChanged {
        /// The run id.
        run_id: Uuid,
        /// The gate id.
        gate: String,
        /// The gate status as seen by the run.
        status: GateStatus,
    },
    /// The release decision was computed.
    ReleaseDecided {
        /// The run id.
        run_id: Uuid,
        /// The decision.
        decision: ReleaseDecision,
    },
    /// The run reached a terminal status.
    RunCompleted {
        /// The run id.
        run_id: Uuid,
        /// Final status.
        status: RunStatus,
        /// Wall time of the run.
        duration_ms: u64,
    },
}

impl RunEvent {
    /// Returns the dotted event type, e.g. `stage.started`.
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::RunResumed { .. } => "run.resumed",
            Self::StageStarted { .. } => "stage.started",
            Self::StageSucceeded { .. } => "stage.succeeded",
            Self::StageFailed { .. } => "stage.failed",
            Self::StageSkipped { .. } => "stage.skipped",
            Self::StageCancelled { .. } => "stage.cancelled",
            Self::GateChanged { status, .. } if status.is_decided() => "gate.decided",
            Self::GateChanged { .. } => "gate.requested",
            Self::ReleaseDecided { .. } => "release.decided",
            Self::RunCompleted { .. } => "run.completed",
        }
    }

    /// Returns the run the event belongs to.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::StageStarted { run_id, .. }
            | Self::StageSucceeded { run_id, .. }
            | Self::StageFailed { run_id, .. }
            | Self::StageSkipped { run_id, .. }
            | Self::StageCancelled { run_id, .. }
            | Self::GateChanged { run_id, .. }
            | Self::ReleaseDecided { run_id, .. }
            | Self::RunCompleted { run_id, .. } => *run_id,
        }
    }

    /// Returns the event as JSON.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_payload() {
        let event = RunEvent::GateChanged {
            run_id: Uuid::nil(),
            gate: "production-eu".to_string(),
            status: GateStatus::Pending,
        };

        assert_eq!(event.event_type(), "gate.requested");
        assert_eq!(event.run_id(), Uuid::nil());
        let payload = event.payload();
        assert_eq!(payload["event"], "gate_changed");
        assert_eq!(payload["gate"], "production-eu");
        assert_eq!(payload["status"], "pending");

        let decided = RunEvent::GateChanged {
            run_id: Uuid::nil(),
            gate: "production-eu".to_string(),
            status: GateStatus::Rejected,
        };
        assert_eq!(decided.event_type(), "gate.decided");
    }
}
