//! Scripted stage executors for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::context::StageInputs;
use crate::executor::{StageContext, StageExecutor, StageReport};
use crate::pipeline::{InstanceId, StageInstance};

/// What a scripted stage does once dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Report success with the scripted outputs.
    Succeed,
    /// Report failure with a message.
    Fail(String),
    /// Block until the instance is cancelled, then report failure.
    WaitForCancel,
}

#[derive(Debug, Clone)]
struct Script {
    outcome: Outcome,
    outputs: Option<Vec<(String, String)>>,
    delay: Option<Duration>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            outcome: Outcome::Succeed,
            outputs: None,
            delay: None,
        }
    }
}

/// An executor whose behaviour is scripted per stage.
///
/// Scripts are looked up by display id (`build (linux, x64)`) first, then by
/// template name. Unscripted stages succeed and write every declared output
/// as `<artifact key>/<output>`. Scripted output values may contain `{dim}`
/// placeholders, replaced with the instance's matrix values.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    default_delay: Option<Duration>,
    dispatched: Mutex<Vec<InstanceId>>,
    inputs: Mutex<HashMap<InstanceId, StageInputs>>,
    cancelled: Mutex<Vec<InstanceId>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    /// Creates an executor where every stage succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn script_mut(&mut self, stage: &str) -> &mut Script {
        self.scripts.entry(stage.to_string()).or_default()
    }

    /// Makes a stage succeed with exactly these outputs.
    #[must_use]
    pub fn succeed(
        mut self,
        stage: &str,
        outputs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        let script = self.script_mut(stage);
        script.outcome = Outcome::Succeed;
        script.outputs = Some(outputs.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Makes a stage fail.
    #[must_use]
    pub fn fail(mut self, stage: &str, message: impl Into<String>) -> Self {
        self.script_mut(stage).outcome = Outcome::Fail(message.into());
        self
    }

    /// Makes a stage block until it is cancelled.
    #[must_use]
    pub fn wait_for_cancel(mut self, stage: &str) -> Self {
        self.script_mut(stage).outcome = Outcome::WaitForCancel;
        self
    }

    /// Delays a stage before it reports.
    #[must_use]
    pub fn delay(mut self, stage: &str, delay: Duration) -> Self {
        self.script_mut(stage).delay = Some(delay);
        self
    }

    /// Delays every stage without its own delay.
    #[must_use]
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = Some(delay);
        self
    }

    fn script_for(&self, instance: &StageInstance) -> Script {
        self.scripts
            .get(&instance.id.to_string())
            .or_else(|| self.scripts.get(instance.name()))
            .cloned()
            .unwrap_or_default()
    }

    /// Returns the dispatched instances in dispatch order.
    #[must_use]
    pub fn dispatched(&self) -> Vec<InstanceId> {
        self.dispatched.lock().clone()
    }

    /// Returns the display ids of dispatched instances in dispatch order.
    #[must_use]
    pub fn dispatched_names(&self) -> Vec<String> {
        self.dispatched.lock().iter().map(ToString::to_string).collect()
    }

    /// Returns the number of bodies dispatched.
    #[must_use]
    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().len()
    }

    /// Returns true if the instance with this display id was dispatched.
    #[must_use]
    pub fn was_dispatched(&self, id: &str) -> bool {
        self.dispatched.lock().iter().any(|d| d.to_string() == id)
    }

    /// Returns the inputs an instance received.
    #[must_use]
    pub fn inputs_of(&self, id: &str) -> Option<StageInputs> {
        self.inputs
            .lock()
            .iter()
            .find(|(d, _)| d.to_string() == id)
            .map(|(_, inputs)| inputs.clone())
    }

    /// Returns the instances whose bodies observed cancellation.
    #[must_use]
    pub fn cancelled(&self) -> Vec<InstanceId> {
        self.cancelled.lock().clone()
    }

    /// Returns the highest number of bodies that were running at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn perform(&self, ctx: &StageContext, script: Script) -> StageReport {
        if let Some(delay) = script.delay.or(self.default_delay) {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = ctx.cancel.cancelled() => {
                    self.cancelled.lock().push(ctx.id().clone());
                    return StageReport::failure("cancelled");
                }
            }
        }

        match script.outcome {
            Outcome::Succeed => {
                let outputs = script.outputs.unwrap_or_else(|| {
                    let key = ctx.id().artifact_key();
                    ctx.instance
                        .declared_outputs()
                        .iter()
                        .map(|o| (o.clone(), format!("{key}/{o}")))
                        .collect()
                });
                outputs.into_iter().fold(StageReport::success(), |report, (k, v)| {
                    report.with_output(k, ctx.instance.coordinate.substitute(&v))
                })
            }
            Outcome::Fail(message) => StageReport::failure(message),
            Outcome::WaitForCancel => {
                ctx.cancel.cancelled().await;
                self.cancelled.lock().push(ctx.id().clone());
                StageReport::failure("cancelled")
            }
        }
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn run(&self, ctx: StageContext) -> StageReport {
        let script = self.script_for(&ctx.instance);
        self.dispatched.lock().push(ctx.id().clone());
        self.inputs.lock().insert(ctx.id().clone(), ctx.inputs.clone());

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let report = self.perform(&ctx, script).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        report
    }
}
