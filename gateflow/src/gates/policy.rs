//! Automatic approval policies.

use crate::core::{EventKind, TriggerContext};
use std::collections::HashSet;
use std::fmt::Debug;
use uuid::Uuid;

/// Inputs available to a policy when a gate is requested.
#[derive(Debug, Clone, Copy)]
pub struct PolicyContext<'a> {
    /// The gate being requested.
    pub gate_id: &'a str,
    /// The requesting run.
    pub run_id: Uuid,
    /// The trigger of the requesting run.
    pub trigger: &'a TriggerContext,
    /// Other gates already approved for the same run.
    pub approved_gates: &'a [String],
}

/// A pure decision on whether a gate approves itself on request.
pub trait ApprovalPolicy: Send + Sync + Debug {
    /// Returns the policy name, recorded as `policy:<name>` on approval.
    fn name(&self) -> &str;

    /// Returns true to approve the gate without waiting.
    fn evaluate(&self, ctx: &PolicyContext<'_>) -> bool;
}

/// Approves every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysApprove;

impl ApprovalPolicy for AlwaysApprove {
    fn name(&self) -> &str {
        "always"
    }

    fn evaluate(&self, _ctx: &PolicyContext<'_>) -> bool {
        true
    }
}

/// A function-based policy.
pub struct FnPolicy<F>
where
    F: Fn(&PolicyContext<'_>) -> bool + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnPolicy<F>
where
    F: Fn(&PolicyContext<'_>) -> bool + Send + Sync,
{
    /// Creates a new function-based policy.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnPolicy<F>
where
    F: Fn(&PolicyContext<'_>) -> bool + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnPolicy").field("name", &self.name).finish()
    }
}

impl<F> ApprovalPolicy for FnPolicy<F>
where
    F: Fn(&PolicyContext<'_>) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> bool {
        (self.func)(ctx)
    }
}

/// Approves once upstream gates of the same run are approved and the run
/// was not triggered by an untrusted pull request.
///
/// Pull requests qualify only when they come from a trusted actor and not
/// from a fork.
#[derive(Debug, Clone, Default)]
pub struct UpstreamApprovedPolicy {
    upstream: Vec<String>,
    trusted_actors: HashSet<String>,
}

impl UpstreamApprovedPolicy {
    /// Creates a policy requiring the given upstream gates.
    #[must_use]
    pub fn new(upstream: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            upstream: upstream.into_iter().map(Into::into).collect(),
            trusted_actors: HashSet::new(),
        }
    }

    /// Adds actors whose pull requests may be auto-approved.
    #[must_use]
    pub fn with_trusted_actors(mut self, actors: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.trusted_actors.extend(actors.into_iter().map(Into::into));
        self
    }
}

impl ApprovalPolicy for UpstreamApprovedPolicy {
    fn name(&self) -> &str {
        "upstream-approved"
    }

    fn evaluate(&self, ctx: &PolicyContext<'_>) -> bool {
        let upstream_ok = !self.upstream.is_empty()
            && self
                .upstream
                .iter()
                .all(|gate| ctx.approved_gates.contains(gate));

        let actor_ok = match ctx.trigger.event {
            EventKind::PullRequest => {
                !ctx.trigger.from_fork
                    && ctx
                        .trigger
                        .actor
                        .as_ref()
                        .is_some_and(|actor| self.trusted_actors.contains(actor))
            }
            _ => true,
        };

        upstream_ok && actor_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(trigger: &'a TriggerContext, approved: &'a [String]) -> PolicyContext<'a> {
        PolicyContext {
            gate_id: "production",
            run_id: Uuid::nil(),
            trigger,
            approved_gates: approved,
        }
    }

    #[test]
    fn test_always_approve() {
        let trigger = TriggerContext::new(EventKind::Push, "refs/heads/main");
        assert!(AlwaysApprove.evaluate(&ctx(&trigger, &[])));
    }

    #[test]
    fn test_fn_policy() {
        let policy = FnPolicy::new("main-only", |ctx: &PolicyContext<'_>| ctx.trigger.branch() == "main");
        let main = TriggerContext::new(EventKind::Push, "refs/heads/main");
        let dev = TriggerContext::new(EventKind::Push, "refs/heads/dev");

        assert_eq!(policy.name(), "main-only");
        assert!(policy.evaluate(&ctx(&main, &[])));
        assert!(!policy.evaluate(&ctx(&dev, &[])));
    }

    #[test]
    fn test_upstream_policy_requires_upstream_approval() {
        let policy = UpstreamApprovedPolicy::new(["staging"]);
        let push = TriggerContext::new(EventKind::Push, "refs/heads/main");

        assert!(!policy.evaluate(&ctx(&push, &[])));
        assert!(policy.evaluate(&ctx(&push, &["staging".to_string()])));
    }

    #[test]
    fn test_upstream_policy_rejects_untrusted_pull_requests() {
        let policy = UpstreamApprovedPolicy::new(["staging"]).with_trusted_actors(["maintainer"]);
        let approved = ["staging".to_string()];

        let untrusted = TriggerContext::new(EventKind::PullRequest, "refs/pull/1/merge").with_actor("stranger");
        assert!(!policy.evaluate(&ctx(&untrusted, &approved)));

        let fork = TriggerContext::new(EventKind::PullRequest, "refs/pull/2/merge")
            .with_actor("maintainer")
            .from_fork(true);
        assert!(!policy.evaluate(&ctx(&fork, &approved)));

        let trusted = TriggerContext::new(EventKind::PullRequest, "refs/pull/3/merge").with_actor("maintainer");
        assert!(policy.evaluate(&ctx(&trusted, &approved)));
    }
}
