//! # Gateflow
//!
//! A pipeline orchestration engine for CI/CD-style workloads.
//!
//! Gateflow turns a declarative pipeline definition into a graph of stage
//! instances and drives runs of that graph to completion:
//!
//! - **Matrix expansion**: one template fans out into an instance per
//!   combination of its dimensions
//! - **Conditions**: stages run only when an expression over the trigger,
//!   matrix values and upstream outputs holds
//! - **Outputs**: values written by a stage flow to its dependents
//! - **Approval gates**: environments wait for a human or policy decision
//! - **Release decisions**: release stages run only for unpublished versions
//! - **Concurrency control**: parallelism limits and supersession of older
//!   runs on the same branch
//! - **Durability**: run records can be persisted and resumed
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gateflow::prelude::*;
//!
//! let graph = PipelineBuilder::new("ci")
//!     .stage(StageTemplate::new("build").with_outputs(["artifact"]))
//!     .stage(
//!         StageTemplate::new("test")
//!             .depends_on(["build"])
//!             .with_input("build", "artifact"),
//!     )
//!     .build()?;
//!
//! let scheduler = Scheduler::new(Arc::new(MyExecutor));
//! let report = scheduler.run(graph, trigger).await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod condition;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod executor;
pub mod gates;
pub mod observability;
pub mod pipeline;
pub mod release;
pub mod store;
pub mod testing;

pub use errors::GateflowError;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::condition::Condition;
    pub use crate::config::SchedulerConfig;
    pub use crate::context::{OutputStore, StageInputs};
    pub use crate::core::{EventKind, RunStatus, StageKind, StageState, TriggerContext};
    pub use crate::errors::{
        ConfigError, ContractErrorInfo, ContractViolation, GateflowError, MissingOutputError,
    };
    pub use crate::events::{ChannelEventSink, EventSink, LoggingEventSink, NoOpEventSink, RunEvent};
    pub use crate::executor::{FnExecutor, StageContext, StageExecutor, StageReport};
    pub use crate::gates::{ApprovalPolicy, Decision, GateStatus, GateTable};
    pub use crate::observability::{init_tracing, LogFormat};
    pub use crate::pipeline::{
        plan, InstanceId, MatrixSpec, PipelineBuilder, PipelineDefinition, RunCoordinator,
        RunReport, Scheduler, StageGraph, StageTemplate,
    };
    pub use crate::release::{ReleaseDecision, StaticVersionSource, VersionSource};
    pub use crate::store::{FileRunStore, InMemoryRunStore, RunRecord, RunStore};
}
