//! Data shared between stage instances of a run.
//!
//! This module provides:
//! - A write-once output store with seal-based visibility
//! - Resolved per-stage input views

mod inputs;
mod outputs;

pub use inputs::{InputValue, StageInputs};
pub use outputs::OutputStore;
