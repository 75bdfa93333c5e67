//! Stage executor interface.
//!
//! The engine never interprets what a stage does. An executor receives the
//! instance, its resolved inputs and a cancellation token, and reports a
//! status plus the outputs it produced.

use crate::cancellation::CancellationToken;
use crate::context::{OutputStore, StageInputs};
use crate::core::TriggerContext;
use crate::pipeline::{InstanceId, StageGraph, StageInstance};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Everything a stage body can see while it runs.
#[derive(Debug, Clone)]
pub struct StageContext {
    /// The run this instance belongs to.
    pub run_id: Uuid,
    /// The instance being executed.
    pub instance: StageInstance,
    /// Declared inputs, resolved from succeeded producers.
    pub inputs: StageInputs,
    /// The trigger that started the run.
    pub trigger: Arc<TriggerContext>,
    /// The run's output store, for keyed reads through the graph.
    pub outputs: Arc<OutputStore>,
    /// The run's stage graph.
    pub graph: Arc<StageGraph>,
    /// Signalled when the instance should stop.
    pub cancel: Arc<CancellationToken>,
}

impl StageContext {
    /// Returns the instance id.
    #[must_use]
    pub fn id(&self) -> &InstanceId {
        &self.instance.id
    }

    /// Returns the value of a matrix dimension.
    #[must_use]
    pub fn matrix(&self, dimension: &str) -> Option<&str> {
        self.instance.coordinate.get(dimension)
    }

    /// Returns the release tag decided for this run, if any.
    #[must_use]
    pub fn release_tag(&self) -> Option<String> {
        self.outputs.run_value(crate::release::RELEASE_TAG_KEY)
    }

    /// Returns true once the instance has been asked to stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Outcome reported by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    /// The stage body completed successfully.
    Success,
    /// The stage body failed.
    Failure {
        /// Why it failed.
        message: String,
    },
}

/// Result of running one stage body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageReport {
    /// Success or failure.
    #[serde(flatten)]
    pub status: StageStatus,
    /// Outputs produced, in the order they were written.
    #[serde(default)]
    pub outputs: Vec<(String, String)>,
}

impl StageReport {
    /// Creates a successful report.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: StageStatus::Success,
            outputs: Vec::new(),
        }
    }

    /// Creates a failed report.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failure {
                message: message.into(),
            },
            outputs: Vec::new(),
        }
    }

    /// Adds an output.
    #[must_use]
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.push((key.into(), value.into()));
        self
    }

    /// Returns true if the stage succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.status, StageStatus::Success)
    }
}

/// Runs stage bodies on behalf of the scheduler.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StageExecutor: Send + Sync {
    /// Executes one stage instance.
    async fn run(&self, ctx: StageContext) -> StageReport;
}

/// An async function-based executor.
pub struct FnExecutor<F> {
    func: F,
}

impl<F, Fut> FnExecutor<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageReport> + Send,
{
    /// Creates a new function-based executor.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> std::fmt::Debug for FnExecutor<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnExecutor").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> StageExecutor for FnExecutor<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync,
    Fut: Future<Output = StageReport> + Send,
{
    async fn run(&self, ctx: StageContext) -> StageReport {
        (self.func)(ctx).await
    }
}
