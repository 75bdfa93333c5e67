//! Approval gates.
//!
//! A gate is a blocking checkpoint, typically one per deployment
//! environment and region. Stages guarded by a gate wait until it is
//! approved; a rejection skips them and everything downstream.

mod gate;
mod policy;
mod table;

pub use gate::{Decision, EnvironmentGate, GateStatus};
pub use policy::{AlwaysApprove, ApprovalPolicy, FnPolicy, PolicyContext, UpstreamApprovedPolicy};
pub use table::{GateDecided, GateTable};
