//! Pipeline planning and execution.
//!
//! This module provides:
//! - Stage templates and pipeline definitions
//! - Matrix expansion into stage instances
//! - The validated stage graph
//! - The run scheduler and concurrency coordinator

mod builder;
mod coordinator;
mod graph;
mod matrix;
mod report;
mod scheduler;
mod spec;

#[cfg(test)]
mod integration_tests;

pub use builder::{plan, PipelineBuilder};
pub use coordinator::RunCoordinator;
pub use graph::{Frontier, InstanceScope, StageGraph};
pub use matrix::{InstanceId, MatrixCoordinate, MatrixExpander, StageInstance};
pub use report::RunReport;
pub use scheduler::Scheduler;
pub use spec::{InputRef, MatrixDimension, MatrixSpec, PipelineDefinition, StageTemplate};
