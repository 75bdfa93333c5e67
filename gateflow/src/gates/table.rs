//! The gate table shared by all runs.

use super::gate::{Decision, EnvironmentGate, GateStatus};
use super::policy::{ApprovalPolicy, PolicyContext};
use crate::core::TriggerContext;
use crate::errors::GateError;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

/// Broadcast whenever a gate is decided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateDecided {
    /// The gate id.
    pub gate_id: String,
    /// The run holding the gate.
    pub run_id: Uuid,
    /// The new status.
    pub status: GateStatus,
    /// Who decided.
    pub decided_by: String,
}

/// Holds every gate and the policies attached to them.
///
/// Decisions are linearized per gate through the map's entry locks. A gate
/// belongs to the run that last requested it: a newer run requesting the
/// same gate replaces the older run's gate with a fresh pending one.
pub struct GateTable {
    gates: DashMap<String, EnvironmentGate>,
    policies: DashMap<String, Arc<dyn ApprovalPolicy>>,
    default_policy: RwLock<Option<Arc<dyn ApprovalPolicy>>>,
    events: broadcast::Sender<GateDecided>,
}

impl Default for GateTable {
    fn default() -> Self {
        Self::new()
    }
}

impl GateTable {
    /// Creates an empty gate table.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            gates: DashMap::new(),
            policies: DashMap::new(),
            default_policy: RwLock::new(None),
            events,
        }
    }

    /// Attaches a policy to a gate.
    ///
    /// A pattern ending in `*` matches every gate id with that prefix, e.g.
    /// `production-*`. Exact ids win over patterns; longer patterns win over
    /// shorter ones.
    pub fn attach_policy(&self, pattern: impl Into<String>, policy: Arc<dyn ApprovalPolicy>) {
        self.policies.insert(pattern.into(), policy);
    }

    /// Sets the policy used for gates without their own.
    pub fn set_default_policy(&self, policy: Arc<dyn ApprovalPolicy>) {
        *self.default_policy.write() = Some(policy);
    }

    fn policy_for(&self, gate_id: &str) -> Option<Arc<dyn ApprovalPolicy>> {
        if let Some(policy) = self.policies.get(gate_id) {
            return Some(policy.clone());
        }

        self.policies
            .iter()
            .filter_map(|entry| {
                entry
                    .key()
                    .strip_suffix('*')
                    .filter(|prefix| gate_id.starts_with(prefix))
                    .map(|prefix| (prefix.len(), entry.value().clone()))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, policy)| policy)
            .or_else(|| self.default_policy.read().clone())
    }

    /// Creates or reuses the pending gate for `run_id`.
    ///
    /// An attached policy is evaluated immediately; if it approves, the gate
    /// is approved before this returns. The policy runs without any entry
    /// lock held, so it may read the table.
    pub fn request(&self, gate_id: &str, run_id: Uuid, trigger: &TriggerContext) -> GateStatus {
        let (status, created) = {
            let mut created = false;
            let mut gate = self.gates.entry(gate_id.to_string()).or_insert_with(|| {
                created = true;
                EnvironmentGate::new(gate_id, run_id)
            });

            if gate.run_id != run_id {
                debug!(gate = %gate_id, previous_run = %gate.run_id, run_id = %run_id, "Gate taken over by newer run");
                *gate = EnvironmentGate::new(gate_id, run_id);
                created = true;
            }
            (gate.status, created)
        };

        if status != GateStatus::Pending {
            return status;
        }

        let approved = self.policy_for(gate_id).and_then(|policy| {
            let approved_gates = self.approved_for_run(run_id);
            let ctx = PolicyContext {
                gate_id,
                run_id,
                trigger,
                approved_gates: &approved_gates,
            };
            policy.evaluate(&ctx).then(|| format!("policy:{}", policy.name()))
        });

        let Some(actor) = approved else {
            if created {
                info!(gate = %gate_id, run_id = %run_id, "Gate awaiting approval");
            }
            return status;
        };

        // The gate may have been decided or taken over while the policy ran.
        let outcome = self
            .gates
            .get_mut(gate_id)
            .filter(|gate| gate.run_id == run_id)
            .map(|mut gate| gate.decide(Decision::Approve, actor.clone()));

        match outcome {
            Some((status, true)) => {
                info!(gate = %gate_id, run_id = %run_id, decided_by = %actor, "Gate auto-approved");
                self.publish(gate_id, run_id, status, actor);
                status
            }
            Some((status, false)) => status,
            None => {
                debug!(gate = %gate_id, run_id = %run_id, "Gate changed hands before policy approval");
                GateStatus::Pending
            }
        }
    }

    /// Records a decision.
    ///
    /// Only the first decision counts; later calls return the original one.
    ///
    /// # Errors
    ///
    /// Returns `GateError::NotFound` if the gate has never been requested.
    pub fn decide(
        &self,
        gate_id: &str,
        decision: Decision,
        actor: impl Into<String>,
    ) -> Result<GateStatus, GateError> {
        let actor = actor.into();
        let (status, changed, run_id) = {
            let mut gate = self
                .gates
                .get_mut(gate_id)
                .ok_or_else(|| GateError::not_found(gate_id))?;
            let (status, changed) = gate.decide(decision, actor.clone());
            (status, changed, gate.run_id)
        };

        if changed {
            info!(gate = %gate_id, run_id = %run_id, status = %status, actor = %actor, "Gate decided");
            self.publish(gate_id, run_id, status, actor);
        } else {
            debug!(gate = %gate_id, status = %status, "Gate already decided");
        }
        Ok(status)
    }

    fn publish(&self, gate_id: &str, run_id: Uuid, status: GateStatus, decided_by: String) {
        // No receivers is fine.
        let _ = self.events.send(GateDecided {
            gate_id: gate_id.to_string(),
            run_id,
            status,
            decided_by,
        });
    }

    /// Returns the status of a gate.
    #[must_use]
    pub fn status(&self, gate_id: &str) -> Option<GateStatus> {
        self.gates.get(gate_id).map(|g| g.status)
    }

    /// Returns the status of a gate as seen by `run_id`.
    ///
    /// `None` if the gate is unknown or currently held by another run.
    #[must_use]
    pub fn status_for(&self, gate_id: &str, run_id: Uuid) -> Option<GateStatus> {
        self.gates
            .get(gate_id)
            .filter(|g| g.run_id == run_id)
            .map(|g| g.status)
    }

    /// Returns a copy of a gate.
    #[must_use]
    pub fn gate(&self, gate_id: &str) -> Option<EnvironmentGate> {
        self.gates.get(gate_id).map(|g| g.clone())
    }

    /// Returns every pending gate, oldest request first.
    #[must_use]
    pub fn pending(&self) -> Vec<EnvironmentGate> {
        let mut pending: Vec<_> = self
            .gates
            .iter()
            .filter(|g| g.is_pending())
            .map(|g| g.clone())
            .collect();
        pending.sort_by(|a, b| a.requested_at.cmp(&b.requested_at).then_with(|| a.id.cmp(&b.id)));
        pending
    }

    /// Returns the ids of gates approved for `run_id`.
    #[must_use]
    pub fn approved_for_run(&self, run_id: Uuid) -> Vec<String> {
        let mut approved: Vec<String> = self
            .gates
            .iter()
            .filter(|g| g.run_id == run_id && g.status == GateStatus::Approved)
            .map(|g| g.id.clone())
            .collect();
        approved.sort();
        approved
    }

    /// Returns every gate held by `run_id`.
    #[must_use]
    pub fn gates_for_run(&self, run_id: Uuid) -> Vec<EnvironmentGate> {
        let mut gates: Vec<_> = self
            .gates
            .iter()
            .filter(|g| g.run_id == run_id)
            .map(|g| g.clone())
            .collect();
        gates.sort_by(|a, b| a.id.cmp(&b.id));
        gates
    }

    /// Reinstates a gate from a stored run record.
    ///
    /// A gate currently held by another run is left alone.
    pub fn restore(&self, gate: EnvironmentGate) {
        self.gates.entry(gate.id.clone()).or_insert(gate);
    }

    /// Drops the pending gates of a finished or superseded run.
    pub fn release_run(&self, run_id: Uuid) {
        self.gates
            .retain(|_, gate| !(gate.run_id == run_id && gate.is_pending()));
    }

    /// Subscribes to gate decisions.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GateDecided> {
        self.events.subscribe()
    }
}

impl std::fmt::Debug for GateTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateTable")
            .field("gates", &self.gates.len())
            .field("policies", &self.policies.len())
            .finish()
    }
}
