//! Testing utilities for gateflow pipelines.
//!
//! This module provides:
//! - A scripted stage executor
//! - Trigger and pipeline fixtures
//! - Assertions over run reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_output, assert_run_status, assert_run_succeeded, assert_skipped_because,
    assert_stage_state,
};
pub use fixtures::{pull_request, push, push_main, release_pipeline, tag_push};
pub use mocks::{Outcome, ScriptedExecutor};
