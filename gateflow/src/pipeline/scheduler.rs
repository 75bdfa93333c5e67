//! The run scheduler.
//!
//! One loop per run owns every state transition. It recomputes the frontier
//! after each change, dispatches ready instances onto tokio tasks within the
//! per-run and global limits, and folds completions back in. Stage bodies
//! only ever see their own [`StageContext`].

use super::{InstanceId, RunReport, StageGraph};
use crate::cancellation::CancellationToken;
use crate::config::SchedulerConfig;
use crate::context::{OutputStore, StageInputs};
use crate::core::{RunStatus, StageState, TriggerContext};
use crate::errors::{ContractViolation, GateflowError, ReleaseError, StoreError};
use crate::events::{EventSink, NoOpEventSink, RunEvent};
use crate::executor::{StageContext, StageExecutor, StageReport, StageStatus};
use crate::gates::{GateStatus, GateTable};
use crate::observability::{run_span, stage_span};
use crate::release::{ReleaseDecision, ReleaseDecisionEngine, VersionSource, RELEASE_TAG_KEY};
use crate::store::{InstanceRecord, RunRecord, RunStore};
use chrono::{DateTime, Utc};
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// A finished stage body.
struct Completed {
    index: usize,
    report: StageReport,
    elapsed: Duration,
}

/// Background work the scheduling loop folds back in.
enum Finished {
    Stage(Completed),
    Release(Result<ReleaseDecision, ReleaseError>),
}

/// What to do with a ready instance.
enum Admission {
    Dispatch,
    Wait,
    /// Start the release lookup and stay ready until it settles.
    Lookup(Arc<ReleaseDecisionEngine>),
    /// A release lookup is already under way.
    AwaitRelease,
    Skip(String),
    Fail(String),
}

/// Mutable state of one run, owned by the scheduling loop.
struct RunState {
    run_id: Uuid,
    graph: Arc<StageGraph>,
    fingerprint: String,
    trigger: Arc<TriggerContext>,
    outputs: Arc<OutputStore>,
    cancel: Arc<CancellationToken>,
    release: Option<Arc<ReleaseDecisionEngine>>,
    release_announced: bool,
    release_lookup: Option<AbortHandle>,
    release_failure: Option<String>,
    states: Vec<StageState>,
    reasons: Vec<Option<String>>,
    started_at: Vec<Option<DateTime<Utc>>>,
    finished_at: Vec<Option<DateTime<Utc>>>,
    tokens: Vec<Option<Arc<CancellationToken>>>,
    gates_seen: HashMap<String, GateStatus>,
    fatal: Option<GateflowError>,
    superseded: bool,
    draining: Option<tokio::time::Instant>,
    created_at: DateTime<Utc>,
    dirty: bool,
}

impl RunState {
    fn new(
        run_id: Uuid,
        graph: Arc<StageGraph>,
        trigger: Arc<TriggerContext>,
        cancel: Arc<CancellationToken>,
        release: Option<Arc<ReleaseDecisionEngine>>,
    ) -> Self {
        let count = graph.len();
        Self {
            run_id,
            fingerprint: graph.fingerprint(),
            graph,
            trigger,
            outputs: Arc::new(OutputStore::new()),
            cancel,
            release,
            release_announced: false,
            release_lookup: None,
            release_failure: None,
            states: vec![StageState::Pending; count],
            reasons: vec![None; count],
            started_at: vec![None; count],
            finished_at: vec![None; count],
            tokens: vec![None; count],
            gates_seen: HashMap::new(),
            fatal: None,
            superseded: false,
            draining: None,
            created_at: Utc::now(),
            dirty: true,
        }
    }

    fn all_terminal(&self) -> bool {
        self.states.iter().all(StageState::is_terminal)
    }

    fn id(&self, index: usize) -> InstanceId {
        self.graph.instance_at(index).id.clone()
    }
}

/// Drives runs of a stage graph to completion.
///
/// A scheduler can be shared by many concurrent runs; the global
/// parallelism limit applies across all of them.
pub struct Scheduler {
    config: SchedulerConfig,
    executor: Arc<dyn StageExecutor>,
    gates: Arc<GateTable>,
    versions: Option<Arc<dyn VersionSource>>,
    store: Option<Arc<dyn RunStore>>,
    events: Arc<dyn EventSink>,
    global: Arc<Semaphore>,
}

impl Scheduler {
    /// Creates a scheduler with default configuration.
    #[must_use]
    pub fn new(executor: Arc<dyn StageExecutor>) -> Self {
        let config = SchedulerConfig::default();
        Self {
            global: Arc::new(Semaphore::new(config.max_parallel_global)),
            config,
            executor,
            gates: Arc::new(GateTable::new()),
            versions: None,
            store: None,
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Sets the configuration.
    #[must_use]
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        let config = config.normalized();
        self.global = Arc::new(Semaphore::new(config.max_parallel_global));
        self.config = config;
        self
    }

    /// Shares a gate table with other schedulers or an approval frontend.
    #[must_use]
    pub fn with_gates(mut self, gates: Arc<GateTable>) -> Self {
        self.gates = gates;
        self
    }

    /// Sets the source consulted by release stages.
    #[must_use]
    pub fn with_version_source(mut self, source: Arc<dyn VersionSource>) -> Self {
        self.versions = Some(source);
        self
    }

    /// Persists run records after every state change.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns the gate table.
    #[must_use]
    pub fn gates(&self) -> &Arc<GateTable> {
        &self.gates
    }

    /// Returns the run store, if any.
    #[must_use]
    pub fn store(&self) -> Option<&Arc<dyn RunStore>> {
        self.store.as_ref()
    }

    /// Runs a graph under a fresh run id that nothing else can cancel.
    pub async fn run(&self, graph: StageGraph, trigger: TriggerContext) -> RunReport {
        self.execute(
            Uuid::new_v4(),
            Arc::new(graph),
            Arc::new(trigger),
            Arc::new(CancellationToken::new()),
        )
        .await
    }

    /// Runs a graph until every instance is terminal.
    ///
    /// Cancelling `cancel` supersedes the run: nothing new is dispatched,
    /// running bodies are asked to stop and get the configured grace period
    /// before they are aborted, and the run ends `Cancelled`.
    pub async fn execute(
        &self,
        run_id: Uuid,
        graph: Arc<StageGraph>,
        trigger: Arc<TriggerContext>,
        cancel: Arc<CancellationToken>,
    ) -> RunReport {
        let release = self
            .versions
            .clone()
            .map(|source| Arc::new(ReleaseDecisionEngine::new(source)));
        let st = RunState::new(run_id, graph, trigger, cancel, release);
        let span = run_span(run_id, st.graph.name(), &st.trigger.git_ref);

        span.in_scope(|| info!(instances = st.graph.len(), "Run started"));
        self.events.record(&RunEvent::RunStarted {
            run_id,
            pipeline: st.graph.name().to_string(),
            git_ref: st.trigger.git_ref.clone(),
            instances: st.graph.len(),
        });

        self.drive(st).instrument(span).await
    }

    /// Continues a run from a stored record.
    ///
    /// Terminal instances keep their state and outputs; everything else
    /// starts over from `Pending`. A memoized release decision and the
    /// run's gates are restored.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::PlanMismatch` if the record was produced by a
    /// different graph.
    pub async fn resume(
        &self,
        graph: Arc<StageGraph>,
        record: RunRecord,
        cancel: Arc<CancellationToken>,
    ) -> Result<RunReport, GateflowError> {
        let current = graph.fingerprint();
        if record.fingerprint != current {
            return Err(StoreError::PlanMismatch {
                run_id: record.run_id.to_string(),
                stored: record.fingerprint,
                current,
            }
            .into());
        }

        let release = self.versions.clone().map(|source| {
            Arc::new(match record.release.clone() {
                Some(decision) => ReleaseDecisionEngine::with_decision(source, decision),
                None => ReleaseDecisionEngine::new(source),
            })
        });
        let mut st = RunState::new(record.run_id, graph, Arc::new(record.trigger), cancel, release);
        st.created_at = record.created_at;
        st.release_announced = record.release.is_some();

        for (key, value) in record.run_values {
            if let Err(err) = st.outputs.put_run_scoped(key, value) {
                warn!(error = %err, "Ignoring duplicate run value in record");
            }
        }
        for gate in record.gates {
            st.gates_seen.insert(gate.id.clone(), gate.status);
            self.gates.restore(gate);
        }

        let mut completed = 0;
        for saved in record.instances {
            let Some(index) = st.graph.index_of(&saved.id) else {
                continue;
            };
            if !saved.state.is_terminal() {
                continue;
            }
            if saved.state.is_success() {
                st.outputs.restore(&saved.id, saved.outputs);
            } else {
                st.outputs.seal(&saved.id, false);
            }
            st.states[index] = saved.state;
            st.reasons[index] = saved.reason;
            st.started_at[index] = saved.started_at;
            st.finished_at[index] = saved.finished_at;
            completed += 1;
        }

        let span = run_span(st.run_id, st.graph.name(), &st.trigger.git_ref);
        span.in_scope(|| info!(completed, remaining = st.graph.len() - completed, "Run resumed"));
        self.events.record(&RunEvent::RunResumed {
            run_id: st.run_id,
            completed,
        });

        Ok(self.drive(st).instrument(span).await)
    }

    async fn drive(&self, mut st: RunState) -> RunReport {
        let started = Instant::now();
        let cancel = st.cancel.clone();
        let mut gate_events = self.gates.subscribe();
        let mut in_flight: FuturesUnordered<JoinHandle<Finished>> = FuturesUnordered::new();

        loop {
            if cancel.is_cancelled() && !st.superseded {
                st.superseded = true;
                let reason = cancel.reason().unwrap_or_else(|| "run cancelled".to_string());
                info!(reason = %reason, in_flight = in_flight.len(), "Run cancelled");
                self.halt(&mut st, &reason);
            }

            let waiting_on_gates = if st.draining.is_none() {
                self.advance(&mut st, &mut in_flight)
            } else {
                false
            };
            self.persist(&mut st).await;

            if in_flight.is_empty() {
                if st.all_terminal() {
                    break;
                }
                if !waiting_on_gates {
                    self.abandon_stalled(&mut st);
                    continue;
                }
            }

            let deadline = st
                .draining
                .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(86_400));
            let draining = st.draining.is_some();
            let superseded = st.superseded;

            tokio::select! {
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => match joined {
                    Ok(Finished::Stage(done)) => self.complete(&mut st, done),
                    Ok(Finished::Release(result)) => self.release_settled(&mut st, result),
                    Err(err) if err.is_cancelled() => debug!("Background task aborted"),
                    Err(err) => warn!(error = %err, "Stage task did not complete"),
                },
                _ = gate_events.recv(), if waiting_on_gates => {}
                () = cancel.cancelled(), if !superseded => {}
                () = tokio::time::sleep_until(deadline), if draining => {
                    warn!(remaining = in_flight.len(), "Cancellation grace period expired, aborting stage bodies");
                    for task in &in_flight {
                        task.abort();
                    }
                    break;
                }
            }
        }

        self.finish(st, started).await
    }

    /// Applies the frontier and admits ready instances until nothing changes.
    ///
    /// Returns true if some instance is waiting on a pending gate.
    fn advance(
        &self,
        st: &mut RunState,
        in_flight: &mut FuturesUnordered<JoinHandle<Finished>>,
    ) -> bool {
        let graph = st.graph.clone();

        loop {
            let frontier = graph.frontier(&st.states, &st.trigger, &st.outputs);
            let mut changed = false;
            let mut waiting = false;

            for (id, reason) in frontier.skipped {
                if let Some(index) = graph.index_of(&id) {
                    self.skip(st, index, reason);
                    changed = true;
                }
            }

            for id in &frontier.blocked {
                if let Some(index) = graph.index_of(id) {
                    if st.states[index] == StageState::Pending {
                        self.transition(st, index, StageState::Blocked, None);
                    }
                }
            }

            for id in &frontier.ready {
                let Some(index) = graph.index_of(id) else {
                    continue;
                };
                if st.states[index] != StageState::Ready {
                    self.transition(st, index, StageState::Ready, None);
                }
                let busy = in_flight.len().saturating_sub(usize::from(st.release_lookup.is_some()));
                if busy >= self.config.max_parallel_per_run {
                    continue;
                }

                match self.admit(st, index) {
                    Admission::Dispatch => in_flight.push(self.dispatch(st, index)),
                    Admission::Lookup(engine) => in_flight.push(self.lookup_release(st, engine)),
                    Admission::AwaitRelease => {}
                    Admission::Wait => {
                        self.transition(st, index, StageState::Blocked, None);
                        waiting = true;
                    }
                    Admission::Skip(reason) => {
                        self.skip(st, index, reason);
                        changed = true;
                    }
                    Admission::Fail(message) => {
                        self.transition(st, index, StageState::Running, None);
                        self.fail(st, index, message);
                        changed = true;
                    }
                }

                if st.draining.is_some() {
                    return false;
                }
            }

            if !changed {
                return waiting;
            }
        }
    }

    /// Checks the gate and the release decision of a ready instance.
    ///
    /// Never waits: a release decision that is not known yet is looked up
    /// on a background task while the instance stays ready.
    fn admit(&self, st: &mut RunState, index: usize) -> Admission {
        let graph = st.graph.clone();
        let instance = graph.instance_at(index);

        if let Some(gate) = &instance.gate {
            let status = if st.gates_seen.contains_key(gate) {
                match self.gates.status_for(gate, st.run_id) {
                    Some(GateStatus::Pending) => self.gates.request(gate, st.run_id, &st.trigger),
                    Some(status) => status,
                    None => return Admission::Skip(format!("gate '{gate}' was taken over by another run")),
                }
            } else {
                self.gates.request(gate, st.run_id, &st.trigger)
            };

            if st.gates_seen.insert(gate.clone(), status) != Some(status) {
                st.dirty = true;
                self.events.record(&RunEvent::GateChanged {
                    run_id: st.run_id,
                    gate: gate.clone(),
                    status,
                });
            }

            match status {
                GateStatus::Pending => return Admission::Wait,
                GateStatus::Rejected => return Admission::Skip(format!("gate '{gate}' rejected")),
                GateStatus::Approved => {}
            }
        }

        if instance.template.release {
            let Some(engine) = st.release.clone() else {
                return Admission::Fail("no version source configured for release stage".to_string());
            };
            if let Some(err) = &st.release_failure {
                return Admission::Fail(format!("release decision unavailable: {err}"));
            }
            let Some(decision) = engine.cached().cloned() else {
                return if st.release_lookup.is_some() {
                    Admission::AwaitRelease
                } else {
                    Admission::Lookup(engine)
                };
            };

            if !st.release_announced {
                st.release_announced = true;
                st.dirty = true;
                if let Some(tag) = decision.tag() {
                    if let Err(err) = st.outputs.put_run_scoped(RELEASE_TAG_KEY, tag) {
                        warn!(error = %err, "Release tag already set");
                    }
                }
                self.events.record(&RunEvent::ReleaseDecided {
                    run_id: st.run_id,
                    decision: decision.clone(),
                });
            }

            if let ReleaseDecision::Skip { version } = decision {
                return Admission::Skip(format!("version {version} is already published"));
            }
        }

        Admission::Dispatch
    }

    fn lookup_release(&self, st: &mut RunState, engine: Arc<ReleaseDecisionEngine>) -> JoinHandle<Finished> {
        debug!("Looking up release decision");
        let handle = tokio::spawn(
            async move {
                let result = AssertUnwindSafe(async { engine.decision().await.map(Clone::clone) })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(ReleaseError::SourceUnavailable("version source panicked".to_string())));
                Finished::Release(result)
            }
            .in_current_span(),
        );
        st.release_lookup = Some(handle.abort_handle());
        handle
    }

    /// Records the outcome of the release lookup. A decision is memoized by
    /// the engine; a failure fails every release stage of the run.
    fn release_settled(&self, st: &mut RunState, result: Result<ReleaseDecision, ReleaseError>) {
        st.release_lookup = None;
        if let Err(err) = result {
            warn!(error = %err, "Release decision unavailable");
            st.release_failure = Some(err.to_string());
        }
    }

    fn dispatch(&self, st: &mut RunState, index: usize) -> JoinHandle<Finished> {
        let graph = st.graph.clone();
        let instance = graph.instance_at(index).clone();
        let token = st.cancel.child();
        st.tokens[index] = Some(token.clone());

        self.transition(st, index, StageState::Running, None);
        self.events.record(&RunEvent::StageStarted {
            run_id: st.run_id,
            instance: instance.id.clone(),
        });
        debug!(instance = %instance.id, "Dispatching stage");

        let span = stage_span(st.run_id, &instance.id.to_string(), &instance.template.kind.to_string());
        let ctx = StageContext {
            run_id: st.run_id,
            inputs: resolve_inputs(&graph, &st.outputs, index),
            instance,
            trigger: st.trigger.clone(),
            outputs: st.outputs.clone(),
            graph,
            cancel: token,
        };
        let executor = self.executor.clone();
        let global = self.global.clone();
        let grace = self.config.cancel_grace();

        tokio::spawn(
            async move {
                let _permit = global.acquire_owned().await;
                let started = Instant::now();
                if ctx.is_cancelled() {
                    return Finished::Stage(Completed {
                        index,
                        report: StageReport::failure("cancelled before start"),
                        elapsed: Duration::ZERO,
                    });
                }
                let token = ctx.cancel.clone();
                let body = AssertUnwindSafe(async move { executor.run(ctx).await }).catch_unwind();
                // A body ignoring its token is dropped once the grace period
                // after cancellation runs out.
                let report = tokio::select! {
                    result = body => result.unwrap_or_else(|_| StageReport::failure("stage body panicked")),
                    () = async {
                        token.cancelled().await;
                        tokio::time::sleep(grace).await;
                    } => {
                        warn!("Cancellation grace period expired, dropping stage body");
                        StageReport::failure("aborted after cancellation grace period")
                    }
                };
                Finished::Stage(Completed {
                    index,
                    report,
                    elapsed: started.elapsed(),
                })
            }
            .instrument(span),
        )
    }

    fn complete(&self, st: &mut RunState, done: Completed) {
        let Completed {
            index,
            report,
            elapsed,
        } = done;
        st.tokens[index] = None;

        if st.states[index] != StageState::Running {
            debug!(
                instance = %st.id(index),
                state = %st.states[index],
                "Discarding result of a stage that is no longer running"
            );
            return;
        }

        match report.status {
            StageStatus::Success => self.succeed(st, index, report.outputs, elapsed),
            StageStatus::Failure { message } => self.fail(st, index, message),
        }
    }

    fn succeed(&self, st: &mut RunState, index: usize, outputs: Vec<(String, String)>, elapsed: Duration) {
        let graph = st.graph.clone();
        let instance = graph.instance_at(index);

        for (key, value) in outputs {
            if !instance.declared_outputs().contains(&key) {
                warn!(instance = %instance.id, key = %key, "Dropping undeclared output");
                continue;
            }
            if let Err(err) = st.outputs.put(&instance.id, key, value) {
                self.mark_failed(st, index, err.to_string());
                self.abort_run(st, err.into());
                return;
            }
        }

        let written = st.outputs.written_keys(&instance.id);
        let missing: Vec<String> = instance
            .declared_outputs()
            .iter()
            .filter(|key| !written.contains(key))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let violation = ContractViolation::new(instance.id.to_string(), missing);
            self.mark_failed(st, index, violation.to_string());
            self.abort_run(st, violation.into());
            return;
        }

        self.transition(st, index, StageState::Succeeded, None);
        let duration_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        info!(instance = %instance.id, duration_ms, "Stage succeeded");
        self.events.record(&RunEvent::StageSucceeded {
            run_id: st.run_id,
            instance: instance.id.clone(),
            duration_ms,
        });
    }

    fn mark_failed(&self, st: &mut RunState, index: usize, message: String) {
        let id = st.id(index);
        warn!(instance = %id, message = %message, "Stage failed");
        self.transition(st, index, StageState::Failed, Some(message.clone()));
        self.events.record(&RunEvent::StageFailed {
            run_id: st.run_id,
            instance: id,
            message,
        });
    }

    /// Records a failure and applies the fail-fast rules.
    fn fail(&self, st: &mut RunState, index: usize, message: String) {
        self.mark_failed(st, index, message);

        let graph = st.graph.clone();
        let instance = graph.instance_at(index);
        if graph.fail_fast() || self.config.fail_fast {
            self.halt(st, &format!("fail-fast: '{}' failed", instance.id));
        } else if instance.template.matrix.as_ref().is_some_and(|m| m.fail_fast) {
            let siblings = graph.siblings_at(index);
            self.cancel_instances(st, &siblings, &format!("matrix fail-fast: '{}' failed", instance.id));
        }
    }

    fn abort_run(&self, st: &mut RunState, err: GateflowError) {
        error!(error = %err, "Fatal error, stopping run");
        let reason = format!("run stopped: {err}");
        if st.fatal.is_none() {
            st.fatal = Some(err);
        }
        self.halt(st, &reason);
    }

    /// Cancels every non-terminal instance and starts the grace period.
    fn halt(&self, st: &mut RunState, reason: &str) {
        if let Some(lookup) = st.release_lookup.take() {
            debug!("Abandoning release lookup");
            lookup.abort();
        }
        let all: Vec<usize> = (0..st.states.len()).collect();
        self.cancel_instances(st, &all, reason);
        if st.draining.is_none() {
            st.draining = Some(tokio::time::Instant::now() + self.config.cancel_grace());
        }
    }

    fn cancel_instances(&self, st: &mut RunState, indices: &[usize], reason: &str) {
        for &index in indices {
            if st.states[index].is_terminal() {
                continue;
            }
            if let Some(token) = st.tokens[index].take() {
                token.cancel(reason);
            }
            if self.transition(st, index, StageState::Cancelled, Some(reason.to_string())) {
                self.events.record(&RunEvent::StageCancelled {
                    run_id: st.run_id,
                    instance: st.id(index),
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn skip(&self, st: &mut RunState, index: usize, reason: String) {
        let id = st.id(index);
        if self.transition(st, index, StageState::Skipped, Some(reason.clone())) {
            info!(instance = %id, reason = %reason, "Stage skipped");
            self.events.record(&RunEvent::StageSkipped {
                run_id: st.run_id,
                instance: id,
                reason,
            });
        }
    }

    /// Skips every non-terminal instance when nothing can ever run again.
    fn abandon_stalled(&self, st: &mut RunState) {
        let stalled: Vec<usize> = (0..st.states.len())
            .filter(|&i| !st.states[i].is_terminal())
            .collect();
        error!(count = stalled.len(), "No instance can make progress");
        for index in stalled {
            self.skip(st, index, "no runnable path".to_string());
        }
    }

    fn transition(&self, st: &mut RunState, index: usize, next: StageState, reason: Option<String>) -> bool {
        let current = st.states[index];
        let id = &st.graph.instance_at(index).id;

        if !current.can_transition_to(next) {
            warn!(instance = %id, from = %current, to = %next, "Ignoring invalid state transition");
            return false;
        }

        st.states[index] = next;
        st.dirty = true;
        if reason.is_some() {
            st.reasons[index] = reason;
        }
        match next {
            StageState::Running => st.started_at[index] = Some(Utc::now()),
            terminal if terminal.is_terminal() => {
                st.finished_at[index] = Some(Utc::now());
                st.outputs.seal(id, terminal.is_success());
            }
            _ => {}
        }

        debug!(instance = %id, from = %current, to = %next, "Stage transition");
        true
    }

    fn record(&self, st: &RunState, status: RunStatus) -> RunRecord {
        let mut outputs = st.outputs.snapshot();
        let instances = st
            .graph
            .instances()
            .enumerate()
            .map(|(i, instance)| InstanceRecord {
                id: instance.id.clone(),
                state: st.states[i],
                outputs: outputs.remove(&instance.id).unwrap_or_default(),
                reason: st.reasons[i].clone(),
                started_at: st.started_at[i],
                finished_at: st.finished_at[i],
            })
            .collect();

        RunRecord {
            run_id: st.run_id,
            pipeline: st.graph.name().to_string(),
            fingerprint: st.fingerprint.clone(),
            trigger: (*st.trigger).clone(),
            status,
            instances,
            run_values: st.outputs.run_values(),
            release: st.release.as_deref().and_then(ReleaseDecisionEngine::cached).cloned(),
            gates: self.gates.gates_for_run(st.run_id),
            fatal: st.fatal.as_ref().map(ToString::to_string),
            created_at: st.created_at,
            updated_at: Utc::now(),
        }
    }

    async fn save(&self, record: &RunRecord) {
        if let Some(store) = &self.store {
            if let Err(err) = store.save(record).await {
                warn!(run_id = %record.run_id, error = %err, "Failed to persist run record");
            }
        }
    }

    async fn persist(&self, st: &mut RunState) {
        if !st.dirty || self.store.is_none() {
            return;
        }
        st.dirty = false;
        let record = self.record(st, RunStatus::Running);
        self.save(&record).await;
    }

    async fn finish(&self, st: RunState, started: Instant) -> RunReport {
        let status = if st.superseded {
            RunStatus::Cancelled
        } else if st.fatal.is_some() || st.states.contains(&StageState::Failed) {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };

        let record = self.record(&st, status);
        self.save(&record).await;
        self.gates.release_run(st.run_id);

        let duration = started.elapsed();
        let duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        info!(
            status = %status,
            duration_ms,
            states = ?record.state_counts(),
            "Run completed"
        );
        self.events.record(&RunEvent::RunCompleted {
            run_id: st.run_id,
            status,
            duration_ms,
        });

        RunReport {
            run_id: record.run_id,
            pipeline: record.pipeline,
            status,
            stages: record.instances,
            run_values: record.run_values,
            release: record.release,
            gates: record.gates,
            fatal: st.fatal,
            duration,
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.config)
            .field("gates", &self.gates)
            .field("has_store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

/// Collects the declared inputs of an instance from its succeeded producers.
fn resolve_inputs(graph: &StageGraph, outputs: &OutputStore, index: usize) -> StageInputs {
    let mut inputs = StageInputs::new();
    for input in &graph.instance_at(index).template.inputs {
        for &dep in graph.dependencies_at(index) {
            let producer = graph.instance_at(dep);
            if producer.name() != input.stage {
                continue;
            }
            if let Some(value) = outputs.visible(&producer.id, &input.output) {
                inputs.insert(producer.id.clone(), input.output.as_str(), value);
            }
        }
    }
    inputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EventKind;
    use crate::executor::MockStageExecutor;
    use crate::pipeline::{PipelineBuilder, StageTemplate};
    use crate::store::InMemoryRunStore;
    use pretty_assertions::assert_eq;

    fn graph() -> StageGraph {
        PipelineBuilder::new("ci")
            .stage(StageTemplate::new("build").with_outputs(["artifact"]))
            .stage(StageTemplate::new("test").depends_on(["build"]).with_input("build", "artifact"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_inputs_reach_the_executor() {
        let mut executor = MockStageExecutor::new();
        executor.expect_run().times(2).returning(|ctx| {
            if ctx.instance.name() == "build" {
                StageReport::success().with_output("artifact", "build.tar")
            } else {
                assert_eq!(ctx.inputs.get("artifact"), Some("build.tar"));
                StageReport::success()
            }
        });

        let scheduler = Scheduler::new(Arc::new(executor));
        let report = scheduler
            .run(graph(), TriggerContext::new(EventKind::Push, "refs/heads/main"))
            .await;

        assert_eq!(report.status, RunStatus::Succeeded);
        assert_eq!(report.output("build", "artifact"), Some("build.tar"));
    }

    #[tokio::test]
    async fn test_panicking_body_fails_the_instance() {
        let mut executor = MockStageExecutor::new();
        executor.expect_run().times(1).returning(|_| panic!("boom"));

        let scheduler = Scheduler::new(Arc::new(executor));
        let report = scheduler
            .run(graph(), TriggerContext::new(EventKind::Push, "refs/heads/main"))
            .await;

        assert_eq!(report.status, RunStatus::Failed);
        assert_eq!(report.state_of("build"), Some(StageState::Failed));
        assert_eq!(report.state_of("test"), Some(StageState::Skipped));
        assert_eq!(report.stage("build").unwrap().reason.as_deref(), Some("stage body panicked"));
    }

    #[tokio::test]
    async fn test_resume_rejects_other_plan() {
        let store = Arc::new(InMemoryRunStore::new());
        let record = RunRecord::new(
            Uuid::new_v4(),
            "ci",
            "not-this-graph",
            TriggerContext::new(EventKind::Push, "refs/heads/main"),
            [InstanceId::new("build"), InstanceId::new("test")],
        );

        let scheduler = Scheduler::new(Arc::new(MockStageExecutor::new())).with_store(store);
        let err = scheduler
            .resume(Arc::new(graph()), record, Arc::new(CancellationToken::new()))
            .await
            .unwrap_err();

        assert!(matches!(err, GateflowError::Store(StoreError::PlanMismatch { .. })));
    }
}
