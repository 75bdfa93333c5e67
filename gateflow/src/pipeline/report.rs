//! The result of one run.

use crate::core::{RunStatus, StageState};
use crate::errors::GateflowError;
use crate::gates::EnvironmentGate;
use crate::release::{ReleaseDecision, RELEASE_TAG_KEY};
use crate::store::InstanceRecord;
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

/// Final state of a run as seen by the caller.
#[derive(Debug)]
pub struct RunReport {
    /// The run id.
    pub run_id: Uuid,
    /// The pipeline name.
    pub pipeline: String,
    /// Overall status.
    pub status: RunStatus,
    /// Per-instance outcome in expansion order.
    pub stages: Vec<InstanceRecord>,
    /// Run-scoped outputs.
    pub run_values: BTreeMap<String, String>,
    /// The release decision, if a release stage asked for one.
    pub release: Option<ReleaseDecision>,
    /// Gates requested by the run.
    pub gates: Vec<EnvironmentGate>,
    /// The error that stopped the run early.
    pub fatal: Option<GateflowError>,
    /// Wall time of the run.
    pub duration: Duration,
}

impl RunReport {
    /// Returns true if the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Looks up an instance by its display id, e.g. `build (linux, x64)`.
    #[must_use]
    pub fn stage(&self, id: &str) -> Option<&InstanceRecord> {
        self.stages.iter().find(|s| s.id.to_string() == id)
    }

    /// Returns the state of an instance by its display id.
    #[must_use]
    pub fn state_of(&self, id: &str) -> Option<StageState> {
        self.stage(id).map(|s| s.state)
    }

    /// Returns one output of an instance by its display id.
    #[must_use]
    pub fn output(&self, id: &str, key: &str) -> Option<&str> {
        self.stage(id)
            .and_then(|s| s.outputs.get(key))
            .map(String::as_str)
    }

    /// Counts instances in `state`.
    #[must_use]
    pub fn count(&self, state: StageState) -> usize {
        self.stages.iter().filter(|s| s.state == state).count()
    }

    /// Returns the release tag published for the run.
    #[must_use]
    pub fn release_tag(&self) -> Option<&str> {
        self.run_values.get(RELEASE_TAG_KEY).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::InstanceId;

    #[test]
    fn test_lookups() {
        let mut build = InstanceRecord::new(InstanceId::with_values("build", vec!["linux".into()]));
        build.state = StageState::Succeeded;
        build.outputs.insert("artifact".into(), "build-linux.tar".into());
        let deploy = InstanceRecord::new(InstanceId::new("deploy"));

        let mut run_values = BTreeMap::new();
        run_values.insert(RELEASE_TAG_KEY.to_string(), "v1.3.0".to_string());

        let report = RunReport {
            run_id: Uuid::nil(),
            pipeline: "ci".into(),
            status: RunStatus::Succeeded,
            stages: vec![build, deploy],
            run_values,
            release: None,
            gates: Vec::new(),
            fatal: None,
            duration: Duration::ZERO,
        };

        assert!(report.is_success());
        assert_eq!(report.state_of("build (linux)"), Some(StageState::Succeeded));
        assert_eq!(report.output("build (linux)", "artifact"), Some("build-linux.tar"));
        assert_eq!(report.state_of("build"), None);
        assert_eq!(report.count(StageState::Pending), 1);
        assert_eq!(report.release_tag(), Some("v1.3.0"));
    }
}
