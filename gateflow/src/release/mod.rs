//! Release decision engine.
//!
//! Decides once per run whether release stages are eligible, by comparing a
//! candidate version against the latest published one. Versions are opaque
//! tokens: only equality matters.

use crate::errors::ReleaseError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::info;

/// Run-scoped output key carrying the version to publish.
pub const RELEASE_TAG_KEY: &str = "release_tag";

/// Whether release stages run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ReleaseDecision {
    /// The candidate is new; publish it under `tag`.
    Release {
        /// The version to publish.
        tag: String,
    },
    /// The candidate is already published.
    Skip {
        /// The version that is already out.
        version: String,
    },
}

impl ReleaseDecision {
    /// Returns true for [`ReleaseDecision::Release`].
    #[must_use]
    pub fn is_release(&self) -> bool {
        matches!(self, Self::Release { .. })
    }

    /// Returns the tag to publish, if any.
    #[must_use]
    pub fn tag(&self) -> Option<&str> {
        match self {
            Self::Release { tag } => Some(tag),
            Self::Skip { .. } => None,
        }
    }
}

/// Compares a candidate against the latest published version.
///
/// Returns `Skip` when they are equal and `Release` otherwise, including
/// when nothing has been published yet.
#[must_use]
pub fn decide(candidate: &str, latest_published: Option<&str>) -> ReleaseDecision {
    if latest_published == Some(candidate) {
        ReleaseDecision::Skip {
            version: candidate.to_string(),
        }
    } else {
        ReleaseDecision::Release {
            tag: candidate.to_string(),
        }
    }
}

/// Supplies the versions the decision is based on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VersionSource: Send + Sync {
    /// Returns the version the current sources would publish.
    async fn candidate_version(&self) -> Result<String, ReleaseError>;

    /// Returns the latest version in the release registry, if any.
    async fn latest_published(&self) -> Result<Option<String>, ReleaseError>;
}

/// A version source returning fixed values.
#[derive(Debug, Clone, Default)]
pub struct StaticVersionSource {
    candidate: String,
    latest: Option<String>,
}

impl StaticVersionSource {
    /// Creates a new static version source.
    #[must_use]
    pub fn new(candidate: impl Into<String>, latest: Option<&str>) -> Self {
        Self {
            candidate: candidate.into(),
            latest: latest.map(str::to_string),
        }
    }
}

#[async_trait]
impl VersionSource for StaticVersionSource {
    async fn candidate_version(&self) -> Result<String, ReleaseError> {
        Ok(self.candidate.clone())
    }

    async fn latest_published(&self) -> Result<Option<String>, ReleaseError> {
        Ok(self.latest.clone())
    }
}

/// Computes the release decision of one run at most once.
///
/// The first caller reads both versions and every later caller observes
/// the same decision, even if the registry changes mid-run.
pub struct ReleaseDecisionEngine {
    source: Arc<dyn VersionSource>,
    decision: OnceCell<ReleaseDecision>,
}

impl ReleaseDecisionEngine {
    /// Creates an engine for one run.
    #[must_use]
    pub fn new(source: Arc<dyn VersionSource>) -> Self {
        Self {
            source,
            decision: OnceCell::new(),
        }
    }

    /// Creates an engine with a decision restored from an earlier attempt.
    #[must_use]
    pub fn with_decision(source: Arc<dyn VersionSource>, decision: ReleaseDecision) -> Self {
        Self {
            source,
            decision: OnceCell::new_with(Some(decision)),
        }
    }

    /// Returns the memoized decision, computing it on first use.
    ///
    /// # Errors
    ///
    /// Returns a `ReleaseError` if the version source fails or the candidate
    /// is empty. A failed attempt is not memoized.
    pub async fn decision(&self) -> Result<&ReleaseDecision, ReleaseError> {
        self.decision
            .get_or_try_init(|| async {
                let candidate = self.source.candidate_version().await?;
                if candidate.trim().is_empty() {
                    return Err(ReleaseError::EmptyCandidate);
                }
                let latest = self.source.latest_published().await?;
                let decision = decide(&candidate, latest.as_deref());
                info!(
                    candidate = %candidate,
                    latest = latest.as_deref().unwrap_or("<none>"),
                    release = decision.is_release(),
                    "Release decision computed"
                );
                Ok(decision)
            })
            .await
    }

    /// Returns the decision if it has already been computed.
    #[must_use]
    pub fn cached(&self) -> Option<&ReleaseDecision> {
        self.decision.get()
    }
}

impl std::fmt::Debug for ReleaseDecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReleaseDecisionEngine")
            .field("decision", &self.decision.get())
            .finish()
    }
}
