//! Trigger and pipeline fixtures.

use crate::core::{EventKind, StageKind, TriggerContext};
use crate::pipeline::{MatrixSpec, PipelineDefinition, StageTemplate};

/// A push to `refs/heads/<branch>`.
#[must_use]
pub fn push(branch: &str) -> TriggerContext {
    TriggerContext::new(EventKind::Push, format!("refs/heads/{branch}"))
}

/// A push to `refs/heads/main`.
#[must_use]
pub fn push_main() -> TriggerContext {
    push("main")
}

/// A push of `refs/tags/<tag>`.
#[must_use]
pub fn tag_push(tag: &str) -> TriggerContext {
    TriggerContext::new(EventKind::Push, format!("refs/tags/{tag}"))
}

/// A pull request from `branch` opened by `actor`.
#[must_use]
pub fn pull_request(branch: &str, actor: &str, from_fork: bool) -> TriggerContext {
    TriggerContext::new(EventKind::PullRequest, format!("refs/heads/{branch}"))
        .with_actor(actor)
        .from_fork(from_fork)
}

/// A build/test/deploy/publish pipeline.
///
/// - `build` runs on a 2x2 `os` x `arch` matrix and writes `artifact`
/// - `test` depends on every build and writes `report`
/// - `deploy` runs per region behind a `production-{region}` gate, only on
///   `main`
/// - `publish` is a release stage that depends on every deploy
#[must_use]
pub fn release_pipeline() -> PipelineDefinition {
    let mut definition = PipelineDefinition::new("release");
    definition.stages = vec![
        StageTemplate::new("build")
            .with_kind(StageKind::Build)
            .with_outputs(["artifact"])
            .with_matrix(
                MatrixSpec::new()
                    .dimension("os", ["linux", "macos"])
                    .dimension("arch", ["x64", "arm64"]),
            ),
        StageTemplate::new("test")
            .with_kind(StageKind::Test)
            .depends_on(["build"])
            .with_input("build", "artifact")
            .with_outputs(["report"]),
        StageTemplate::new("deploy")
            .with_kind(StageKind::Deploy)
            .depends_on(["test"])
            .with_condition("eq(branch, 'main')")
            .with_matrix(MatrixSpec::new().dimension("region", ["eu", "us"]))
            .with_gate("production-{region}"),
        StageTemplate::new("publish")
            .with_kind(StageKind::Publish)
            .depends_on(["deploy"])
            .release(),
    ];
    definition
}
