//! Persistable run records.

use crate::core::{RunStatus, StageState, TriggerContext};
use crate::gates::EnvironmentGate;
use crate::pipeline::InstanceId;
use crate::release::ReleaseDecision;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The recorded state of one stage instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// The instance id.
    pub id: InstanceId,
    /// Current state.
    pub state: StageState,
    /// Outputs, present only once the instance succeeded.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, String>,
    /// Why the instance failed, was skipped or was cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// When the body was dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// When the instance reached a terminal state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl InstanceRecord {
    /// Creates a pending record.
    #[must_use]
    pub fn new(id: InstanceId) -> Self {
        Self {
            id,
            state: StageState::Pending,
            outputs: BTreeMap::new(),
            reason: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Everything needed to report on a run or resume it after a restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    /// The run id.
    pub run_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// Digest of the stage graph the record was produced by.
    pub fingerprint: String,
    /// The trigger that started the run.
    pub trigger: TriggerContext,
    /// Overall status.
    pub status: RunStatus,
    /// Per-instance state, in expansion order.
    pub instances: Vec<InstanceRecord>,
    /// Run-scoped outputs such as `release_tag`.
    #[serde(default)]
    pub run_values: BTreeMap<String, String>,
    /// The memoized release decision, once computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release: Option<ReleaseDecision>,
    /// Gates requested by the run.
    #[serde(default)]
    pub gates: Vec<EnvironmentGate>,
    /// The error that stopped the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal: Option<String>,
    /// When the run started.
    pub created_at: DateTime<Utc>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    /// Creates a record with every instance pending.
    #[must_use]
    pub fn new(
        run_id: Uuid,
        pipeline: impl Into<String>,
        fingerprint: impl Into<String>,
        trigger: TriggerContext,
        instances: impl IntoIterator<Item = InstanceId>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            pipeline: pipeline.into(),
            fingerprint: fingerprint.into(),
            trigger,
            status: RunStatus::Running,
            instances: instances.into_iter().map(InstanceRecord::new).collect(),
            run_values: BTreeMap::new(),
            release: None,
            gates: Vec::new(),
            fatal: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Looks up an instance.
    #[must_use]
    pub fn instance(&self, id: &InstanceId) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| &i.id == id)
    }

    /// Returns true once every instance is terminal.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.instances.iter().all(|i| i.state.is_terminal())
    }

    /// Counts instances per state.
    #[must_use]
    pub fn state_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for instance in &self.instances {
            *counts.entry(instance.state.to_string()).or_insert(0) += 1;
        }
        counts
    }
}
