//! Logging setup and span helpers.

use serde::{Deserialize, Serialize};
use tracing::Span;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Output format of the tracing subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Installs a global tracing subscriber.
///
/// The filter comes from `RUST_LOG` and defaults to `info`. Returns false
/// if a subscriber was already installed, which is not an error.
pub fn init_tracing(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let result = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    result.is_ok()
}

/// Creates the span wrapping one run.
#[must_use]
pub fn run_span(run_id: Uuid, pipeline: &str, git_ref: &str) -> Span {
    tracing::info_span!("run", run_id = %run_id, pipeline = %pipeline, git_ref = %git_ref)
}

/// Creates the span wrapping one stage body.
#[must_use]
pub fn stage_span(run_id: Uuid, instance: &str, kind: &str) -> Span {
    tracing::info_span!("stage", run_id = %run_id, instance = %instance, kind = %kind)
}
