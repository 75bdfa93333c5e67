//! Error types for the gateflow engine.
//!
//! Configuration problems are detected while a pipeline is planned and are
//! fatal before any stage starts. Contract and output errors are fatal to the
//! run at the point they are detected. Stage failures are not errors at all:
//! they are a terminal stage state recorded by the scheduler.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The main error type for gateflow operations.
#[derive(Debug, Error)]
pub enum GateflowError {
    /// The pipeline definition is invalid.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A stage reported success without producing a declared output.
    #[error("{0}")]
    ContractViolation(#[from] ContractViolation),

    /// An output key was written twice by the same instance.
    #[error("{0}")]
    DuplicateOutput(#[from] DuplicateOutputError),

    /// A consumer read an output its producer never wrote.
    #[error("{0}")]
    MissingOutput(#[from] MissingOutputError),

    /// An approval gate operation failed.
    #[error("{0}")]
    Gate(#[from] GateError),

    /// The release decision could not be computed.
    #[error("{0}")]
    Release(#[from] ReleaseError),

    /// The run store failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// The run was cancelled.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Metadata about a configuration error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "CONFIG-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        let code = code.into();
        let fix_hint = ContractSuggestions::get(&code).map(str::to_string);
        Self {
            code,
            summary: summary.into(),
            fix_hint,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Errors detected while building the stage graph.
///
/// Every variant is fatal to the run before any stage is dispatched.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Dependencies form a cycle.
    #[error("{0}")]
    Cycle(#[from] CycleDetectedError),

    /// A dependency name does not resolve to any stage.
    #[error("{0}")]
    UnknownDependency(#[from] UnknownDependencyError),

    /// Two reachable instances declare the same unqualified output.
    #[error("{0}")]
    AmbiguousOutput(#[from] AmbiguousOutputError),

    /// Two instances share the same identity.
    #[error("Duplicate stage instance '{instance}'")]
    DuplicateStage {
        /// The duplicated instance id.
        instance: String,
    },

    /// A condition expression could not be parsed or references an
    /// output of a stage that is not a declared dependency.
    #[error("Invalid condition on stage '{stage}': {reason}")]
    InvalidCondition {
        /// The stage carrying the condition.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A stage input refers to a stage that is not a dependency, or to an
    /// output that stage never declares.
    #[error("Stage '{stage}' declares input '{producer}.{output}' which {reason}")]
    UndeclaredInput {
        /// The consuming stage.
        stage: String,
        /// The producing stage named by the input.
        producer: String,
        /// The output name.
        output: String,
        /// Why the input is rejected.
        reason: String,
    },

    /// A matrix specification is malformed.
    #[error("Invalid matrix on stage '{stage}': {reason}")]
    InvalidMatrix {
        /// The stage carrying the matrix.
        stage: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The pipeline has no stages.
    #[error("Pipeline has no stages")]
    Empty,
}

impl ConfigError {
    /// Returns diagnostic info for this error.
    #[must_use]
    pub fn error_info(&self) -> ContractErrorInfo {
        match self {
            Self::Cycle(err) => err.error_info.clone(),
            Self::UnknownDependency(err) => err.error_info.clone(),
            Self::AmbiguousOutput(err) => err.error_info.clone(),
            Self::DuplicateStage { instance } => {
                ContractErrorInfo::new("CONFIG-DUPLICATE-STAGE", self.to_string())
                    .with_context_entry("instance", instance)
            }
            Self::InvalidCondition { stage, .. } => {
                ContractErrorInfo::new("CONFIG-CONDITION", self.to_string())
                    .with_context_entry("stage", stage)
            }
            Self::UndeclaredInput { stage, producer, .. } => {
                ContractErrorInfo::new("CONFIG-UNDECLARED-INPUT", self.to_string())
                    .with_context_entry("stage", stage)
                    .with_context_entry("producer", producer)
            }
            Self::InvalidMatrix { stage, .. } => {
                ContractErrorInfo::new("CONFIG-MATRIX", self.to_string())
                    .with_context_entry("stage", stage)
            }
            Self::Empty => ContractErrorInfo::new("CONFIG-EMPTY", self.to_string()),
        }
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "CONFIG-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", cycle_path.join(" -> ")),
        );

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

/// Error raised when a declared dependency does not name any stage.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
pub struct UnknownDependencyError {
    /// The stage declaring the dependency.
    pub stage: String,
    /// The unresolved dependency name.
    pub dependency: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl UnknownDependencyError {
    /// Creates a new unknown dependency error.
    #[must_use]
    pub fn new(stage: impl Into<String>, dependency: impl Into<String>) -> Self {
        let stage = stage.into();
        let dependency = dependency.into();
        let info = ContractErrorInfo::new(
            "CONFIG-UNKNOWN-DEP",
            format!("Dependency '{dependency}' not found"),
        )
        .with_context_entry("stage", &stage);

        Self {
            stage,
            dependency,
            error_info: info,
        }
    }
}

/// Error raised when two instances reachable from one consumer declare the
/// same output name and nothing but the stage name tells them apart.
#[derive(Debug, Clone, Error)]
#[error("Output '{output}' is declared by both '{first}' and '{second}', reachable from '{consumer}'")]
pub struct AmbiguousOutputError {
    /// The output name.
    pub output: String,
    /// First producing instance.
    pub first: String,
    /// Second producing instance.
    pub second: String,
    /// The instance that can reach both.
    pub consumer: String,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl AmbiguousOutputError {
    /// Creates a new ambiguous output error.
    #[must_use]
    pub fn new(
        output: impl Into<String>,
        first: impl Into<String>,
        second: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Self {
        let output = output.into();
        let info = ContractErrorInfo::new(
            "CONFIG-AMBIGUOUS-OUTPUT",
            format!("Output '{output}' has more than one reachable producer"),
        )
        .with_context_entry("output", &output);

        Self {
            output,
            first: first.into(),
            second: second.into(),
            consumer: consumer.into(),
            error_info: info,
        }
    }

    /// Replaces the suggested fix.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.error_info = self.error_info.with_fix_hint(hint);
        self
    }
}

/// A stage reported success without writing every declared output.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Stage '{instance}' succeeded without producing declared outputs: {}", missing.join(", "))]
pub struct ContractViolation {
    /// The offending instance.
    pub instance: String,
    /// Declared outputs that were never written.
    pub missing: Vec<String>,
}

impl ContractViolation {
    /// Creates a new contract violation.
    #[must_use]
    pub fn new(instance: impl Into<String>, missing: Vec<String>) -> Self {
        Self {
            instance: instance.into(),
            missing,
        }
    }
}

/// Raised when an instance writes the same output key twice.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Output '{key}' was already written by '{instance}'")]
pub struct DuplicateOutputError {
    /// The writing instance.
    pub instance: String,
    /// The duplicated key.
    pub key: String,
}

impl DuplicateOutputError {
    /// Creates a new duplicate output error.
    #[must_use]
    pub fn new(instance: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            key: key.into(),
        }
    }
}

/// Raised when a producer reaches a terminal state without the requested key.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Output '{key}' of '{producer}' is unavailable: {reason}")]
pub struct MissingOutputError {
    /// The producing instance.
    pub producer: String,
    /// The requested key.
    pub key: String,
    /// Why the value is unavailable.
    pub reason: String,
}

impl MissingOutputError {
    /// Creates a new missing output error.
    #[must_use]
    pub fn new(
        producer: impl Into<String>,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            producer: producer.into(),
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors related to approval gates.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GateError {
    /// No gate with this id has been requested.
    #[error("Gate not found: {gate}")]
    NotFound {
        /// The gate id.
        gate: String,
    },
}

impl GateError {
    /// Creates a gate not found error.
    #[must_use]
    pub fn not_found(gate: impl Into<String>) -> Self {
        Self::NotFound { gate: gate.into() }
    }
}

/// Errors raised while computing a release decision.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReleaseError {
    /// The version source could not provide a version.
    #[error("Version source unavailable: {0}")]
    SourceUnavailable(String),

    /// The candidate version is empty.
    #[error("Candidate version is empty")]
    EmptyCandidate,
}

/// Errors raised by run stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The record could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored record was produced by a different plan.
    #[error("Run record for '{run_id}' does not match the current plan (stored {stored}, current {current})")]
    PlanMismatch {
        /// The run id.
        run_id: String,
        /// Fingerprint found in the record.
        stored: String,
        /// Fingerprint of the current plan.
        current: String,
    },
}

/// Provides default suggestions for configuration error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "CONFIG-CYCLE" => Some(
                "Remove one of the dependencies in the cycle. \
                 Stages must form a directed acyclic graph.",
            ),
            "CONFIG-UNKNOWN-DEP" => Some(
                "Ensure every depends_on entry names a stage defined in the pipeline. \
                 Check for typos in stage names.",
            ),
            "CONFIG-AMBIGUOUS-OUTPUT" => Some(
                "Rename one of the outputs, or read it through an input qualified \
                 with the producing stage.",
            ),
            "CONFIG-UNDECLARED-INPUT" => Some(
                "Add the producing stage to depends_on and list the key in its outputs.",
            ),
            "CONFIG-EMPTY" => Some("Add at least one stage to the pipeline before planning."),
            _ => None,
        }
    }
}
