//! Test assertions for run reports.

use crate::core::{RunStatus, StageState};
use crate::pipeline::RunReport;

/// Asserts that the run succeeded.
pub fn assert_run_succeeded(report: &RunReport) {
    assert_eq!(
        report.status,
        RunStatus::Succeeded,
        "Expected run to succeed, stages: {:?}, fatal: {:?}",
        report
            .stages
            .iter()
            .map(|s| (s.id.to_string(), s.state, s.reason.clone()))
            .collect::<Vec<_>>(),
        report.fatal
    );
}

/// Asserts that the run ended with the expected status.
pub fn assert_run_status(report: &RunReport, expected: RunStatus) {
    assert_eq!(
        report.status, expected,
        "Expected run status {:?}, got {:?}",
        expected, report.status
    );
}

/// Asserts the state of an instance, given its display id.
pub fn assert_stage_state(report: &RunReport, id: &str, expected: StageState) {
    let known: Vec<String> = report.stages.iter().map(|s| s.id.to_string()).collect();
    let stage = report
        .stage(id)
        .unwrap_or_else(|| panic!("No stage '{id}' in report. Stages: {known:?}"));
    assert_eq!(
        stage.state, expected,
        "Expected '{}' to be {:?}, got {:?} ({:?})",
        id, expected, stage.state, stage.reason
    );
}

/// Asserts that an instance was skipped for a reason containing `fragment`.
pub fn assert_skipped_because(report: &RunReport, id: &str, fragment: &str) {
    assert_stage_state(report, id, StageState::Skipped);
    let reason = report.stage(id).and_then(|s| s.reason.clone()).unwrap_or_default();
    assert!(
        reason.contains(fragment),
        "Expected skip reason of '{id}' to contain '{fragment}', got '{reason}'"
    );
}

/// Asserts that an instance wrote an output with the expected value.
pub fn assert_output(report: &RunReport, id: &str, key: &str, expected: &str) {
    let actual = report.output(id, key);
    assert_eq!(
        actual,
        Some(expected),
        "Expected output '{key}' of '{id}' to be {expected:?}, got {actual:?}"
    );
}
