//! Concurrency groups.
//!
//! At most one run per concurrency group is active. Submitting a run for a
//! group that already has one cancels the older run, which then stops
//! dispatching and ends `Cancelled`.

use super::{plan, PipelineDefinition, RunReport, Scheduler, StageGraph};
use crate::cancellation::CancellationToken;
use crate::core::TriggerContext;
use crate::errors::GateflowError;
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: Uuid,
    cancel: Arc<CancellationToken>,
}

/// Admits runs into concurrency groups and hands them to a scheduler.
#[derive(Debug)]
pub struct RunCoordinator {
    scheduler: Arc<Scheduler>,
    active: DashMap<String, ActiveRun>,
}

impl RunCoordinator {
    /// Creates a coordinator around a scheduler.
    #[must_use]
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self {
            scheduler,
            active: DashMap::new(),
        }
    }

    /// Returns the scheduler.
    #[must_use]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Returns the active run of a group.
    #[must_use]
    pub fn active_run(&self, group: &str) -> Option<Uuid> {
        self.active.get(group).map(|run| run.run_id)
    }

    /// Returns the number of groups with an active run.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Registers `run_id` as the active run of `group`.
    ///
    /// The previous run of the group, if any, is cancelled. Returns the
    /// token of the new run.
    pub fn begin(&self, group: &str, run_id: Uuid) -> Arc<CancellationToken> {
        let cancel = Arc::new(CancellationToken::new());
        let previous = self.active.insert(
            group.to_string(),
            ActiveRun {
                run_id,
                cancel: cancel.clone(),
            },
        );

        if let Some(previous) = previous {
            warn!(group = %group, previous_run = %previous.run_id, run_id = %run_id, "Superseding run");
            previous.cancel.cancel(format!("superseded by run {run_id}"));
        }
        cancel
    }

    /// Releases `group` if `run_id` is still its active run.
    pub fn end(&self, group: &str, run_id: Uuid) {
        if self.active.remove_if(group, |_, run| run.run_id == run_id).is_some() {
            debug!(group = %group, run_id = %run_id, "Concurrency group released");
        }
    }

    /// Cancels the active run of a group.
    ///
    /// Returns false if the group has no active run.
    pub fn cancel_group(&self, group: &str, reason: &str) -> bool {
        match self.active.get(group) {
            Some(run) => {
                info!(group = %group, run_id = %run.run_id, reason = %reason, "Cancelling run");
                run.cancel.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Plans a definition and runs it in the trigger's concurrency group.
    ///
    /// # Errors
    ///
    /// Returns `GateflowError::Config` if the definition is invalid. Nothing
    /// is cancelled or dispatched in that case.
    pub async fn submit(
        &self,
        definition: &PipelineDefinition,
        trigger: TriggerContext,
    ) -> Result<RunReport, GateflowError> {
        let graph = plan(definition)?;
        Ok(self.submit_graph(Arc::new(graph), trigger).await)
    }

    /// Runs an already planned graph in the trigger's concurrency group.
    pub async fn submit_graph(&self, graph: Arc<StageGraph>, trigger: TriggerContext) -> RunReport {
        let run_id = Uuid::new_v4();
        let group = trigger.concurrency_group().to_string();
        let cancel = self.begin(&group, run_id);

        let report = self
            .scheduler
            .execute(run_id, graph, Arc::new(trigger), cancel)
            .await;
        self.end(&group, run_id);
        report
    }

    /// Resumes every unfinished run found in the scheduler's store.
    ///
    /// `plans` maps pipeline names to their current graphs; records of
    /// unknown pipelines are left in the store untouched. Runs are resumed
    /// oldest first, so within a group the newest record ends up active.
    ///
    /// # Errors
    ///
    /// Returns `GateflowError::Store` if the store cannot be read, or the
    /// first resume error.
    pub async fn resume_unfinished(
        &self,
        plans: &HashMap<String, Arc<StageGraph>>,
    ) -> Result<Vec<RunReport>, GateflowError> {
        let Some(store) = self.scheduler.store() else {
            return Ok(Vec::new());
        };

        let mut resumed = Vec::new();
        for record in store.unfinished().await? {
            let Some(graph) = plans.get(&record.pipeline) else {
                warn!(run_id = %record.run_id, pipeline = %record.pipeline, "No plan for unfinished run");
                continue;
            };
            let group = record.trigger.concurrency_group().to_string();
            let run_id = record.run_id;
            let cancel = self.begin(&group, run_id);
            resumed.push((group, run_id, self.scheduler.resume(graph.clone(), record, cancel)));
        }

        let mut reports = Vec::with_capacity(resumed.len());
        let mut first_error = None;
        let (keys, pending): (Vec<_>, Vec<_>) = resumed
            .into_iter()
            .map(|(group, run_id, fut)| ((group, run_id), fut))
            .unzip();

        for ((group, run_id), result) in keys.into_iter().zip(join_all(pending).await) {
            self.end(&group, run_id);
            match result {
                Ok(report) => reports.push(report),
                Err(err) => {
                    warn!(run_id = %run_id, error = %err, "Failed to resume run");
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(reports),
        }
    }
}
