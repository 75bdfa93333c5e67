//! Core domain model types for gateflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - The trigger context that starts a run
//! - Stage and run state enums with their transition rules

mod status;
mod trigger;

pub use status::{RunStatus, StageKind, StageState};
pub use trigger::{EventKind, TriggerContext};
