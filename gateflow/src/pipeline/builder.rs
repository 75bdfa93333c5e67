//! Pipeline builder with validation.

use super::{MatrixExpander, PipelineDefinition, StageGraph, StageTemplate};
use crate::errors::ConfigError;
use tracing::info;

/// Builder for creating validated stage graphs.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    /// The pipeline name.
    name: String,
    /// Run-level fail-fast flag.
    fail_fast: bool,
    /// Stage templates in declaration order.
    stages: Vec<StageTemplate>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_fast: false,
            stages: Vec::new(),
        }
    }

    /// Creates a builder pre-populated from a definition.
    #[must_use]
    pub fn from_definition(definition: PipelineDefinition) -> Self {
        Self {
            name: definition.name,
            fail_fast: definition.fail_fast,
            stages: definition.stages,
        }
    }

    /// Adds a stage template.
    #[must_use]
    pub fn stage(mut self, template: StageTemplate) -> Self {
        self.stages.push(template);
        self
    }

    /// Sets the run-level fail-fast flag.
    #[must_use]
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Composes this builder with another.
    ///
    /// Templates present in both must be identical.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::DuplicateStage` for conflicting definitions.
    pub fn compose(mut self, other: Self) -> Result<Self, ConfigError> {
        self.name = format!("{}+{}", self.name, other.name);
        self.fail_fast |= other.fail_fast;

        for template in other.stages {
            match self.stages.iter().find(|s| s.name == template.name) {
                Some(existing) if *existing != template => {
                    return Err(ConfigError::DuplicateStage {
                        instance: template.name,
                    });
                }
                Some(_) => {}
                None => self.stages.push(template),
            }
        }

        Ok(self)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of templates.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Returns the equivalent declarative definition.
    #[must_use]
    pub fn definition(&self) -> PipelineDefinition {
        PipelineDefinition {
            name: self.name.clone(),
            fail_fast: self.fail_fast,
            stages: self.stages.clone(),
        }
    }

    /// Expands every template and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if expansion or graph validation fails.
    pub fn build(self) -> Result<StageGraph, ConfigError> {
        let instances = MatrixExpander::expand_all(&self.stages)?;
        let graph = StageGraph::build(self.name, instances)?.with_fail_fast(self.fail_fast);
        info!(
            pipeline = %graph.name(),
            templates = self.stages.len(),
            instances = graph.len(),
            "Pipeline planned"
        );
        Ok(graph)
    }
}

/// Expands and validates a definition into a stage graph.
///
/// # Errors
///
/// Returns a `ConfigError` if expansion or graph validation fails.
pub fn plan(definition: &PipelineDefinition) -> Result<StageGraph, ConfigError> {
    PipelineBuilder::from_definition(definition.clone()).build()
}
