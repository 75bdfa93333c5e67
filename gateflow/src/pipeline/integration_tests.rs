//! End-to-end scheduler scenarios.

#[cfg(test)]
mod tests {
    use crate::cancellation::CancellationToken;
    use crate::config::SchedulerConfig;
    use crate::core::{RunStatus, StageState, TriggerContext};
    use crate::errors::{GateflowError, ReleaseError};
    use crate::events::CollectingEventSink;
    use crate::executor::{FnExecutor, StageContext, StageReport};
    use crate::gates::{AlwaysApprove, Decision, GateStatus};
    use crate::pipeline::{
        plan, InstanceId, MatrixSpec, PipelineBuilder, PipelineDefinition, RunCoordinator, Scheduler,
        StageGraph, StageTemplate,
    };
    use crate::release::{MockVersionSource, ReleaseDecision, StaticVersionSource, VersionSource};
    use crate::store::{FileRunStore, InMemoryRunStore, RunRecord, RunStore};
    use crate::testing::{
        assert_output, assert_run_status, assert_run_succeeded, assert_skipped_because,
        assert_stage_state, push, push_main, release_pipeline, ScriptedExecutor,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    fn linear() -> StageGraph {
        PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build").with_outputs(["artifact"]))
            .stage(
                StageTemplate::new("test")
                    .depends_on(["build"])
                    .with_input("build", "artifact")
                    .with_outputs(["report"]),
            )
            .stage(StageTemplate::new("package").depends_on(["test"]))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_linear_pipeline_passes_outputs_downstream() {
        let executor = Arc::new(ScriptedExecutor::new().succeed("build", [("artifact", "build.tar")]));
        let scheduler = Scheduler::new(executor.clone());

        let report = scheduler.run(linear(), push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(executor.dispatched_names(), vec!["build", "test", "package"]);
        assert_eq!(executor.inputs_of("test").unwrap().get("artifact"), Some("build.tar"));
        assert_output(&report, "build", "artifact", "build.tar");
        assert_output(&report, "test", "report", "test/report");
        assert!(report.stages.iter().all(|s| s.finished_at.is_some()));
    }

    #[tokio::test]
    async fn test_failed_dependency_skips_dependents_only() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build"))
            .stage(StageTemplate::new("test").depends_on(["build"]))
            .stage(StageTemplate::new("package").depends_on(["test"]))
            .stage(StageTemplate::new("lint"))
            .build()
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new().fail("build", "compile error"));

        let report = Scheduler::new(executor.clone()).run(graph, push_main()).await;

        assert_run_status(&report, RunStatus::Failed);
        assert_stage_state(&report, "build", StageState::Failed);
        assert_skipped_because(&report, "test", "dependency 'build' failed");
        assert_skipped_because(&report, "package", "dependency 'test' skipped");
        assert_stage_state(&report, "lint", StageState::Succeeded);
        assert!(!executor.was_dispatched("test"));
        assert_eq!(report.stage("build").unwrap().reason.as_deref(), Some("compile error"));
    }

    #[tokio::test]
    async fn test_matrix_fans_out_and_in() {
        let graph = PipelineBuilder::new("ci")
            .stage(
                StageTemplate::new("build")
                    .with_outputs(["artifact"])
                    .with_matrix(
                        MatrixSpec::new()
                            .dimension("os", ["linux", "macos"])
                            .dimension("arch", ["x64", "arm64", "riscv"]),
                    ),
            )
            .stage(StageTemplate::new("test").depends_on(["build"]).with_input("build", "artifact"))
            .build()
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new().succeed("build", [("artifact", "build-{os}-{arch}.tar")]));

        let report = Scheduler::new(executor.clone()).run(graph, push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(report.count(StageState::Succeeded), 7);
        assert_output(&report, "build (macos, riscv)", "artifact", "build-macos-riscv.tar");

        let inputs = executor.inputs_of("test").unwrap();
        assert_eq!(inputs.all("artifact").len(), 6);
        assert_eq!(inputs.get("artifact"), None);
        assert_eq!(
            inputs.get_from("build", "artifact"),
            Some("build-linux-x64.tar")
        );
    }

    #[tokio::test]
    async fn test_condition_false_skips_and_propagates() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build"))
            .stage(
                StageTemplate::new("deploy")
                    .depends_on(["build"])
                    .with_condition("eq(branch, 'main')"),
            )
            .stage(StageTemplate::new("notify").depends_on(["deploy"]))
            .build()
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new());

        let report = Scheduler::new(executor.clone()).run(graph, push("feature")).await;

        assert_run_succeeded(&report);
        assert_skipped_because(&report, "deploy", "condition not met");
        assert_skipped_because(&report, "notify", "dependency 'deploy' skipped");
        assert_eq!(executor.dispatched_names(), vec!["build"]);
    }

    #[tokio::test]
    async fn test_condition_reads_upstream_output() {
        let definition = |changed: &str| {
            let graph = PipelineBuilder::new("ci")
                .stage(StageTemplate::new("detect").with_outputs(["changed"]))
                .stage(
                    StageTemplate::new("docs")
                        .depends_on(["detect"])
                        .with_condition("eq(outputs.detect.changed, 'true')"),
                )
                .build()
                .unwrap();
            (graph, ScriptedExecutor::new().succeed("detect", [("changed", changed.to_string())]))
        };

        let (graph, executor) = definition("true");
        let report = Scheduler::new(Arc::new(executor)).run(graph, push_main()).await;
        assert_stage_state(&report, "docs", StageState::Succeeded);

        let (graph, executor) = definition("false");
        let report = Scheduler::new(Arc::new(executor)).run(graph, push_main()).await;
        assert_skipped_because(&report, "docs", "condition not met");
    }

    #[tokio::test]
    async fn test_stage_reads_output_through_the_store() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build").with_outputs(["artifact"]))
            .stage(StageTemplate::new("scan").depends_on(["build"]))
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(None));
        let executor = {
            let seen = seen.clone();
            FnExecutor::new(move |ctx: StageContext| {
                let seen = seen.clone();
                async move {
                    if ctx.instance.name() == "build" {
                        return StageReport::success().with_output("artifact", "image@sha256:abc");
                    }
                    let value = ctx.outputs.get_for(&ctx.graph, "artifact", ctx.id()).await;
                    *seen.lock() = Some(value.ok());
                    StageReport::success()
                }
            })
        };

        let report = Scheduler::new(Arc::new(executor)).run(graph, push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(*seen.lock(), Some(Some("image@sha256:abc".to_string())));
    }

    fn gated() -> StageGraph {
        PipelineBuilder::new("deploy")
            .stage(StageTemplate::new("build"))
            .stage(
                StageTemplate::new("deploy")
                    .depends_on(["build"])
                    .with_gate("production"),
            )
            .stage(StageTemplate::new("smoke").depends_on(["deploy"]))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_gate_approval_unblocks_stage() {
        let executor = Arc::new(ScriptedExecutor::new());
        let sink = Arc::new(CollectingEventSink::new());
        let scheduler = Arc::new(Scheduler::new(executor.clone()).with_event_sink(sink.clone()));

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(gated(), push_main()).await })
        };

        wait_for(|| !scheduler.gates().pending().is_empty()).await;
        assert!(!executor.was_dispatched("deploy"));
        scheduler
            .gates()
            .decide("production", Decision::Approve, "alice")
            .unwrap();

        let report = handle.await.unwrap();
        assert_run_succeeded(&report);
        assert_stage_state(&report, "smoke", StageState::Succeeded);
        assert_eq!(report.gates.len(), 1);
        assert_eq!(report.gates[0].status, GateStatus::Approved);
        assert_eq!(report.gates[0].decided_by.as_deref(), Some("alice"));

        let gate_events = sink.event_types().into_iter().filter(|t| t.starts_with("gate.")).collect::<Vec<_>>();
        assert_eq!(gate_events, vec!["gate.requested", "gate.decided"]);
    }

    #[tokio::test]
    async fn test_gate_rejection_skips_dependents() {
        let executor = Arc::new(ScriptedExecutor::new());
        let scheduler = Arc::new(Scheduler::new(executor.clone()));

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(gated(), push_main()).await })
        };

        wait_for(|| !scheduler.gates().pending().is_empty()).await;
        scheduler
            .gates()
            .decide("production", Decision::Reject, "bob")
            .unwrap();

        let report = handle.await.unwrap();
        assert_run_succeeded(&report);
        assert_skipped_because(&report, "deploy", "gate 'production' rejected");
        assert_skipped_because(&report, "smoke", "dependency 'deploy' skipped");
        assert_eq!(executor.dispatched_names(), vec!["build"]);
    }

    #[tokio::test]
    async fn test_gate_policy_approves_without_waiting() {
        let executor = Arc::new(ScriptedExecutor::new());
        let scheduler = Scheduler::new(executor.clone());
        scheduler.gates().attach_policy("production", Arc::new(AlwaysApprove));

        let report = scheduler.run(gated(), push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(report.gates[0].decided_by.as_deref(), Some("policy:always"));
        assert_eq!(executor.dispatch_count(), 3);
    }

    #[tokio::test]
    async fn test_gates_per_region() {
        let executor = Arc::new(ScriptedExecutor::new());
        let scheduler = Arc::new(
            Scheduler::new(executor.clone())
                .with_version_source(Arc::new(StaticVersionSource::new("v1.3.0", Some("v1.2.0")))),
        );
        let graph = plan(&release_pipeline()).unwrap();

        let handle = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.run(graph, push_main()).await })
        };

        wait_for(|| scheduler.gates().pending().len() == 2).await;
        let gates = scheduler.gates();
        gates.decide("production-eu", Decision::Approve, "alice").unwrap();
        gates.decide("production-us", Decision::Reject, "alice").unwrap();

        let report = handle.await.unwrap();
        assert_run_succeeded(&report);
        assert_eq!(executor.inputs_of("test").unwrap().all("artifact").len(), 4);
        assert_stage_state(&report, "deploy (eu)", StageState::Succeeded);
        assert_skipped_because(&report, "deploy (us)", "gate 'production-us' rejected");
        assert_skipped_because(&report, "publish", "dependency 'deploy (us)' skipped");
        assert_eq!(report.release, None);
    }

    fn releasing() -> StageGraph {
        PipelineBuilder::new("release")
            .stage(StageTemplate::new("build"))
            .stage(StageTemplate::new("publish").depends_on(["build"]).release())
            .stage(
                StageTemplate::new("announce")
                    .depends_on(["publish"])
                    .with_condition("startsWith(run.release_tag, 'v1.')"),
            )
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_release_skipped_when_already_published() {
        let executor = Arc::new(ScriptedExecutor::new());
        let scheduler = Scheduler::new(executor.clone())
            .with_version_source(Arc::new(StaticVersionSource::new("v1.2.0", Some("v1.2.0"))));

        let report = scheduler.run(releasing(), push_main()).await;

        assert_run_succeeded(&report);
        assert_skipped_because(&report, "publish", "version v1.2.0 is already published");
        assert_skipped_because(&report, "announce", "dependency 'publish' skipped");
        assert_eq!(
            report.release,
            Some(ReleaseDecision::Skip {
                version: "v1.2.0".to_string()
            })
        );
        assert_eq!(report.release_tag(), None);
    }

    #[tokio::test]
    async fn test_release_publishes_tag() {
        let tags = Arc::new(Mutex::new(Vec::new()));
        let executor = {
            let tags = tags.clone();
            FnExecutor::new(move |ctx: StageContext| {
                let tags = tags.clone();
                async move {
                    tags.lock().push((ctx.id().to_string(), ctx.release_tag()));
                    StageReport::success()
                }
            })
        };
        let scheduler = Scheduler::new(Arc::new(executor))
            .with_version_source(Arc::new(StaticVersionSource::new("v1.3.0", Some("v1.2.0"))));

        let report = scheduler.run(releasing(), push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(report.release_tag(), Some("v1.3.0"));
        assert_stage_state(&report, "announce", StageState::Succeeded);
        assert_eq!(
            *tags.lock(),
            vec![
                ("build".to_string(), None),
                ("publish".to_string(), Some("v1.3.0".to_string())),
                ("announce".to_string(), Some("v1.3.0".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn test_release_decision_is_computed_once() {
        let mut source = MockVersionSource::new();
        source
            .expect_candidate_version()
            .times(1)
            .returning(|| Ok("v2.0.0".to_string()));
        source
            .expect_latest_published()
            .times(1)
            .returning(|| Ok(None));

        let graph = PipelineBuilder::new("release")
            .stage(StageTemplate::new("crates").release())
            .stage(StageTemplate::new("images").release())
            .stage(StageTemplate::new("docs").depends_on(["crates", "images"]).release())
            .build()
            .unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let scheduler = Scheduler::new(Arc::new(ScriptedExecutor::new()))
            .with_version_source(Arc::new(source))
            .with_event_sink(sink.clone());

        let report = scheduler.run(graph, push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(report.count(StageState::Succeeded), 3);
        assert_eq!(sink.events_of_type("release.").len(), 1);
    }

    #[tokio::test]
    async fn test_release_stage_fails_when_versions_unavailable() {
        let mut source = MockVersionSource::new();
        source.expect_candidate_version().returning(|| Ok(String::new()));

        let scheduler = Scheduler::new(Arc::new(ScriptedExecutor::new())).with_version_source(Arc::new(source));
        let report = scheduler.run(releasing(), push_main()).await;

        assert_run_status(&report, RunStatus::Failed);
        assert_stage_state(&report, "publish", StageState::Failed);
        assert_skipped_because(&report, "announce", "dependency 'publish' failed");
    }

    /// A registry that never answers.
    struct UnresponsiveRegistry;

    #[async_trait]
    impl VersionSource for UnresponsiveRegistry {
        async fn candidate_version(&self) -> Result<String, ReleaseError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok("v9.9.9".to_string())
        }

        async fn latest_published(&self) -> Result<Option<String>, ReleaseError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_slow_release_lookup_does_not_stall_the_run() {
        let graph = PipelineBuilder::new("release")
            .stage(StageTemplate::new("publish").release())
            .stage(StageTemplate::new("lint"))
            .build()
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new());
        let scheduler = Arc::new(
            Scheduler::new(executor.clone()).with_version_source(Arc::new(UnresponsiveRegistry)),
        );
        let cancel = Arc::new(CancellationToken::new());

        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .execute(Uuid::new_v4(), Arc::new(graph), Arc::new(push_main()), cancel)
                    .await
            })
        };
        wait_for(|| executor.was_dispatched("lint")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel("superseded by a newer push");

        let report = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("run waited on the version source")
            .unwrap();
        assert_run_status(&report, RunStatus::Cancelled);
        assert_stage_state(&report, "lint", StageState::Succeeded);
        assert_stage_state(&report, "publish", StageState::Cancelled);
        assert!(!executor.was_dispatched("publish"));
    }

    #[tokio::test]
    async fn test_missing_declared_output_is_fatal() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build").with_outputs(["artifact", "checksum"]))
            .stage(StageTemplate::new("test").depends_on(["build"]))
            .build()
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new().succeed("build", [("artifact", "build.tar")]));

        let report = Scheduler::new(executor.clone()).run(graph, push_main()).await;

        assert_run_status(&report, RunStatus::Failed);
        assert!(matches!(
            &report.fatal,
            Some(GateflowError::ContractViolation(v)) if v.missing == vec!["checksum".to_string()]
        ));
        assert_stage_state(&report, "build", StageState::Failed);
        assert_stage_state(&report, "test", StageState::Cancelled);
        assert!(!executor.was_dispatched("test"));
        assert_eq!(report.output("build", "artifact"), None);
    }

    #[tokio::test]
    async fn test_duplicate_output_is_fatal() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build").with_outputs(["artifact"]))
            .build()
            .unwrap();
        let executor = ScriptedExecutor::new().succeed("build", [("artifact", "a.tar"), ("artifact", "b.tar")]);

        let report = Scheduler::new(Arc::new(executor)).run(graph, push_main()).await;

        assert_run_status(&report, RunStatus::Failed);
        assert!(matches!(report.fatal, Some(GateflowError::DuplicateOutput(_))));
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_running_instances() {
        let mut definition = PipelineDefinition::new("ci");
        definition.fail_fast = true;
        definition.stages = vec![
            StageTemplate::new("integration"),
            StageTemplate::new("unit"),
            StageTemplate::new("report").depends_on(["integration", "unit"]),
        ];
        let executor = Arc::new(
            ScriptedExecutor::new()
                .wait_for_cancel("integration")
                .fail("unit", "assertion failed")
                .delay("unit", Duration::from_millis(20)),
        );

        let report = Scheduler::new(executor.clone())
            .run(plan(&definition).unwrap(), push_main())
            .await;

        assert_run_status(&report, RunStatus::Failed);
        assert_stage_state(&report, "unit", StageState::Failed);
        assert_stage_state(&report, "integration", StageState::Cancelled);
        assert_stage_state(&report, "report", StageState::Cancelled);
        assert_eq!(executor.cancelled().len(), 1);
        assert_eq!(
            report.stage("integration").unwrap().reason.as_deref(),
            Some("fail-fast: 'unit' failed")
        );
    }

    #[tokio::test]
    async fn test_matrix_fail_fast_cancels_siblings_only() {
        let graph = PipelineBuilder::new("ci")
            .stage(
                StageTemplate::new("build").with_matrix(
                    MatrixSpec::new()
                        .dimension("os", ["linux", "macos", "windows"])
                        .fail_fast(true),
                ),
            )
            .stage(StageTemplate::new("lint").with_outputs(["warnings"]))
            .build()
            .unwrap();
        let executor = Arc::new(
            ScriptedExecutor::new()
                .wait_for_cancel("build")
                .fail("build (linux)", "linker error")
                .delay("build (linux)", Duration::from_millis(20)),
        );

        let report = Scheduler::new(executor.clone()).run(graph, push_main()).await;

        assert_run_status(&report, RunStatus::Failed);
        assert_stage_state(&report, "build (linux)", StageState::Failed);
        assert_stage_state(&report, "build (macos)", StageState::Cancelled);
        assert_stage_state(&report, "build (windows)", StageState::Cancelled);
        assert_stage_state(&report, "lint", StageState::Succeeded);
    }

    #[tokio::test]
    async fn test_matrix_fail_fast_drops_stubborn_sibling_after_grace() {
        let graph = PipelineBuilder::new("ci")
            .stage(
                StageTemplate::new("build").with_matrix(
                    MatrixSpec::new()
                        .dimension("os", ["linux", "macos"])
                        .fail_fast(true),
                ),
            )
            .build()
            .unwrap();
        let executor = FnExecutor::new(|ctx: StageContext| async move {
            if ctx.id().to_string() == "build (linux)" {
                tokio::time::sleep(Duration::from_millis(20)).await;
                return StageReport::failure("linker error");
            }
            // Never looks at its token.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StageReport::success()
        });
        let scheduler = Scheduler::new(Arc::new(executor))
            .with_config(SchedulerConfig::new().with_cancel_grace(Duration::ZERO));

        let report = tokio::time::timeout(Duration::from_secs(2), scheduler.run(graph, push_main()))
            .await
            .expect("run waited on the cancelled sibling");

        assert_run_status(&report, RunStatus::Failed);
        assert_stage_state(&report, "build (linux)", StageState::Failed);
        assert_stage_state(&report, "build (macos)", StageState::Cancelled);
    }

    #[tokio::test]
    async fn test_condition_reads_one_matrix_coordinate() {
        let graph = PipelineBuilder::new("ci")
            .stage(
                StageTemplate::new("build")
                    .with_outputs(["artifact"])
                    .with_matrix(MatrixSpec::new().dimension("os", ["linux", "macos"])),
            )
            .stage(
                StageTemplate::new("notarize")
                    .depends_on(["build"])
                    .with_condition("outputs['build (macos)'].artifact == 'macos.tar'"),
            )
            .stage(
                StageTemplate::new("mirror")
                    .depends_on(["build"])
                    .with_condition("outputs['build (linux)'].artifact == 'macos.tar'"),
            )
            .build()
            .unwrap();
        let executor = Arc::new(ScriptedExecutor::new().succeed("build", [("artifact", "{os}.tar")]));

        let report = Scheduler::new(executor.clone()).run(graph, push_main()).await;

        assert_run_succeeded(&report);
        assert_stage_state(&report, "notarize", StageState::Succeeded);
        assert_skipped_because(&report, "mirror", "condition not met");
        assert_output(&report, "build (linux)", "artifact", "linux.tar");
    }

    #[tokio::test]
    async fn test_per_run_parallelism_is_bounded() {
        let mut builder = PipelineBuilder::new("ci");
        for name in ["a", "b", "c", "d", "e", "f"] {
            builder = builder.stage(StageTemplate::new(name));
        }
        let executor = Arc::new(ScriptedExecutor::new().with_default_delay(Duration::from_millis(15)));
        let scheduler = Scheduler::new(executor.clone())
            .with_config(SchedulerConfig::new().with_max_parallel_per_run(2));

        let report = scheduler.run(builder.build().unwrap(), push_main()).await;

        assert_run_succeeded(&report);
        assert_eq!(executor.dispatch_count(), 6);
        assert!(executor.peak_concurrency() <= 2);
    }

    #[tokio::test]
    async fn test_global_parallelism_spans_runs() {
        let graph = || {
            PipelineBuilder::new("ci")
                .stage(StageTemplate::new("a"))
                .stage(StageTemplate::new("b"))
                .build()
                .unwrap()
        };
        let executor = Arc::new(ScriptedExecutor::new().with_default_delay(Duration::from_millis(10)));
        let scheduler = Scheduler::new(executor.clone())
            .with_config(SchedulerConfig::new().with_max_parallel_global(1));

        let (first, second) = tokio::join!(
            scheduler.run(graph(), push("one")),
            scheduler.run(graph(), push("two"))
        );

        assert_run_succeeded(&first);
        assert_run_succeeded(&second);
        assert_eq!(executor.dispatch_count(), 4);
        assert_eq!(executor.peak_concurrency(), 1);
    }

    #[tokio::test]
    async fn test_newer_trigger_supersedes_older_run() {
        let mut definition = PipelineDefinition::new("ci");
        definition.stages = vec![
            StageTemplate::new("build"),
            StageTemplate::new("deploy").depends_on(["build"]),
            StageTemplate::new("notify").depends_on(["deploy"]),
        ];

        let log = Arc::new(Mutex::new(Vec::<(String, String)>::new()));
        let executor = {
            let log = log.clone();
            FnExecutor::new(move |ctx: StageContext| {
                let log = log.clone();
                async move {
                    let sha = ctx.trigger.value("sha").unwrap_or_default().to_string();
                    log.lock().push((sha.clone(), ctx.id().to_string()));
                    if sha == "old" && ctx.instance.name() == "deploy" {
                        ctx.cancel.cancelled().await;
                        return StageReport::failure("interrupted");
                    }
                    StageReport::success()
                }
            })
        };
        let coordinator = Arc::new(RunCoordinator::new(Arc::new(Scheduler::new(Arc::new(executor)))));

        let older = {
            let coordinator = coordinator.clone();
            let definition = definition.clone();
            tokio::spawn(async move {
                coordinator
                    .submit(&definition, push_main().with_value("sha", "old"))
                    .await
            })
        };
        wait_for(|| log.lock().iter().any(|(sha, id)| sha == "old" && id == "deploy")).await;

        let newer = coordinator
            .submit(&definition, push_main().with_value("sha", "new"))
            .await
            .unwrap();
        let older = older.await.unwrap().unwrap();

        assert_run_status(&older, RunStatus::Cancelled);
        assert_stage_state(&older, "build", StageState::Succeeded);
        assert_stage_state(&older, "deploy", StageState::Cancelled);
        assert_stage_state(&older, "notify", StageState::Cancelled);
        assert!(older.stage("deploy").unwrap().reason.as_deref().unwrap().starts_with("superseded by run"));
        assert_run_succeeded(&newer);

        let log = log.lock();
        assert!(!log.iter().any(|(sha, id)| sha == "old" && id == "notify"));
        assert_eq!(log.iter().filter(|(sha, _)| sha == "new").count(), 3);
        assert_eq!(coordinator.active_count(), 0);
    }

    #[tokio::test]
    async fn test_stubborn_body_is_aborted_after_grace() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("hang"))
            .build()
            .unwrap();
        let executor = FnExecutor::new(|_ctx: StageContext| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            StageReport::success()
        });
        let scheduler = Arc::new(
            Scheduler::new(Arc::new(executor))
                .with_config(SchedulerConfig::new().with_cancel_grace(Duration::ZERO)),
        );
        let cancel = Arc::new(CancellationToken::new());

        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .execute(Uuid::new_v4(), Arc::new(graph), Arc::new(push_main()), cancel)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel("operator request");

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("run did not stop")
            .unwrap();
        assert_run_status(&report, RunStatus::Cancelled);
        assert_stage_state(&report, "hang", StageState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_on_gate_releases_it() {
        let scheduler = Arc::new(Scheduler::new(Arc::new(ScriptedExecutor::new())));
        let cancel = Arc::new(CancellationToken::new());

        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .execute(Uuid::new_v4(), Arc::new(gated()), Arc::new(push_main()), cancel)
                    .await
            })
        };
        wait_for(|| !scheduler.gates().pending().is_empty()).await;
        cancel.cancel("superseded");

        let report = handle.await.unwrap();
        assert_run_status(&report, RunStatus::Cancelled);
        assert_stage_state(&report, "deploy", StageState::Cancelled);
        assert!(scheduler.gates().pending().is_empty());
    }

    #[tokio::test]
    async fn test_every_instance_reaches_a_terminal_state() {
        let scheduler = Scheduler::new(Arc::new(ScriptedExecutor::new().fail("build (macos, arm64)", "flaky")))
            .with_version_source(Arc::new(StaticVersionSource::new("v1.0.0", None)));

        let report = scheduler
            .run(plan(&release_pipeline()).unwrap(), push("feature"))
            .await;

        assert!(report.stages.iter().all(|s| s.state.is_terminal()));
        assert_run_status(&report, RunStatus::Failed);
        assert_skipped_because(&report, "test", "dependency 'build (macos, arm64)' failed");
        assert!(scheduler.gates().pending().is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_events_in_order() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build"))
            .stage(StageTemplate::new("test").depends_on(["build"]))
            .build()
            .unwrap();
        let sink = Arc::new(CollectingEventSink::new());
        let scheduler = Scheduler::new(Arc::new(ScriptedExecutor::new())).with_event_sink(sink.clone());

        scheduler.run(graph, push_main()).await;

        assert_eq!(
            sink.event_types(),
            vec![
                "run.started",
                "stage.started",
                "stage.succeeded",
                "stage.started",
                "stage.succeeded",
                "run.completed",
            ]
        );
    }

    #[tokio::test]
    async fn test_final_record_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileRunStore::open(dir.path()).await.unwrap());
        let executor = ScriptedExecutor::new().succeed("build", [("artifact", "build.tar")]);
        let scheduler = Scheduler::new(Arc::new(executor)).with_store(store.clone());

        let report = scheduler.run(linear(), push_main()).await;
        let record = store.load(report.run_id).await.unwrap().unwrap();

        assert_eq!(record.status, RunStatus::Succeeded);
        assert!(record.is_complete());
        assert_eq!(
            record.instances[0].outputs.get("artifact").map(String::as_str),
            Some("build.tar")
        );
        assert!(store.unfinished().await.unwrap().is_empty());
    }

    fn interrupted_record(graph: &StageGraph, trigger: TriggerContext) -> RunRecord {
        let mut record = RunRecord::new(
            Uuid::new_v4(),
            graph.name(),
            graph.fingerprint(),
            trigger,
            graph.instances().map(|i| i.id.clone()),
        );
        record.instances[0].state = StageState::Succeeded;
        record.instances[0]
            .outputs
            .insert("artifact".to_string(), "build.tar".to_string());
        record.instances[1].state = StageState::Running;
        record
    }

    #[tokio::test]
    async fn test_resume_keeps_finished_work() {
        let graph = Arc::new(linear());
        let record = interrupted_record(&graph, push_main());
        let executor = Arc::new(ScriptedExecutor::new());
        let scheduler = Scheduler::new(executor.clone());

        let report = scheduler
            .resume(graph, record, Arc::new(CancellationToken::new()))
            .await
            .unwrap();

        assert_run_succeeded(&report);
        assert_eq!(executor.dispatched_names(), vec!["test", "package"]);
        assert_eq!(executor.inputs_of("test").unwrap().get("artifact"), Some("build.tar"));
        assert_output(&report, "build", "artifact", "build.tar");
    }

    #[tokio::test]
    async fn test_coordinator_resumes_unfinished_runs() {
        let store = Arc::new(InMemoryRunStore::new());
        let graph = Arc::new(linear());
        let record = interrupted_record(&graph, push_main());
        let run_id = record.run_id;
        store.save(&record).await.unwrap();

        let orphan = RunRecord::new(Uuid::new_v4(), "retired", "x", push_main(), Vec::<InstanceId>::new());
        store.save(&orphan).await.unwrap();

        let scheduler = Scheduler::new(Arc::new(ScriptedExecutor::new())).with_store(store.clone());
        let coordinator = RunCoordinator::new(Arc::new(scheduler));
        let plans = HashMap::from([("ci".to_string(), graph)]);

        let reports = coordinator.resume_unfinished(&plans).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].run_id, run_id);
        assert_run_succeeded(&reports[0]);
        assert_eq!(store.load(run_id).await.unwrap().unwrap().status, RunStatus::Succeeded);
        assert_eq!(store.unfinished().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resume_restores_release_decision_and_gates() {
        let graph = Arc::new(
            PipelineBuilder::new("release")
                .stage(StageTemplate::new("build").with_outputs(["artifact"]))
                .stage(StageTemplate::new("publish").depends_on(["build"]).release())
                .stage(
                    StageTemplate::new("deploy")
                        .depends_on(["publish"])
                        .with_gate("production"),
                )
                .build()
                .unwrap(),
        );
        let mut record = interrupted_record(&graph, push_main());
        record.release = Some(ReleaseDecision::Release {
            tag: "v3.1.0".to_string(),
        });
        record
            .run_values
            .insert("release_tag".to_string(), "v3.1.0".to_string());
        let mut gate = crate::gates::EnvironmentGate::new("production", record.run_id);
        gate.decide(Decision::Approve, "alice");
        record.gates.push(gate);

        // A registry that now reports the tag as published must not change the outcome.
        let scheduler = Scheduler::new(Arc::new(ScriptedExecutor::new()))
            .with_version_source(Arc::new(StaticVersionSource::new("v3.1.0", Some("v3.1.0"))));
        let report = scheduler
            .resume(graph, record, Arc::new(CancellationToken::new()))
            .await
            .unwrap();

        assert_run_succeeded(&report);
        assert_stage_state(&report, "publish", StageState::Succeeded);
        assert_stage_state(&report, "deploy", StageState::Succeeded);
        assert_eq!(report.release_tag(), Some("v3.1.0"));
    }

    #[tokio::test]
    async fn test_undeclared_outputs_are_dropped() {
        let graph = PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build").with_outputs(["artifact"]))
            .build()
            .unwrap();
        let executor = ScriptedExecutor::new().succeed("build", [("artifact", "build.tar"), ("scratch", "/tmp/x")]);

        let report = Scheduler::new(Arc::new(executor)).run(graph, push_main()).await;

        assert_run_succeeded(&report);
        assert_output(&report, "build", "artifact", "build.tar");
        assert_eq!(report.output("build", "scratch"), None);
    }
}
