//! Pipeline and stage template specifications.

use crate::core::StageKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One named dimension of a matrix with its ordered values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixDimension {
    /// Dimension name, e.g. `os`.
    pub name: String,
    /// Values in declaration order.
    pub values: Vec<String>,
}

/// Matrix specification multiplying a template into parallel instances.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixSpec {
    /// Dimensions in declaration order.
    #[serde(default)]
    pub dimensions: Vec<MatrixDimension>,
    /// Partial coordinates to remove from the cross-product.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<BTreeMap<String, String>>,
    /// Cancel sibling instances when one of them fails.
    #[serde(default)]
    pub fail_fast: bool,
}

impl MatrixSpec {
    /// Creates an empty matrix.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a dimension.
    #[must_use]
    pub fn dimension(
        mut self,
        name: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.dimensions.push(MatrixDimension {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Excludes every combination matching the given partial coordinate.
    #[must_use]
    pub fn exclude(
        mut self,
        coordinate: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.exclude.push(
            coordinate
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Enables sibling cancellation on failure.
    #[must_use]
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Returns the size of the full cross-product before exclusions.
    #[must_use]
    pub fn combinations(&self) -> usize {
        self.dimensions.iter().map(|d| d.values.len()).product()
    }
}

/// A named output of another stage consumed by this one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputRef {
    /// The producing stage (template name).
    pub stage: String,
    /// The output key.
    pub output: String,
}

impl InputRef {
    /// Creates a new input reference.
    #[must_use]
    pub fn new(stage: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            output: output.into(),
        }
    }
}

/// A named unit of work before matrix expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTemplate {
    /// The unique name of the stage.
    pub name: String,
    /// The kind of work.
    #[serde(default)]
    pub kind: StageKind,
    /// Condition expression; absent means always run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Names of stages this stage depends on.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Outputs of other stages handed to this stage's body.
    #[serde(default)]
    pub inputs: Vec<InputRef>,
    /// Output keys this stage must write on success.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Optional matrix.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixSpec>,
    /// Approval gate guarding this stage. `{dim}` placeholders are replaced
    /// with the instance's matrix values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    /// Whether the release decision must allow this stage to run.
    #[serde(default)]
    pub release: bool,
}

impl StageTemplate {
    /// Creates a new stage template.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Work,
            condition: None,
            depends_on: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            matrix: None,
            gate: None,
            release: false,
        }
    }

    /// Sets the stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sets the condition expression.
    #[must_use]
    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn depends_on(mut self, deps: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Adds an input read from another stage's output.
    #[must_use]
    pub fn with_input(mut self, stage: impl Into<String>, output: impl Into<String>) -> Self {
        self.inputs.push(InputRef::new(stage, output));
        self
    }

    /// Sets the declared outputs.
    #[must_use]
    pub fn with_outputs(mut self, outputs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the matrix.
    #[must_use]
    pub fn with_matrix(mut self, matrix: MatrixSpec) -> Self {
        self.matrix = Some(matrix);
        self
    }

    /// Guards the stage behind an approval gate.
    #[must_use]
    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gate = Some(gate.into());
        self
    }

    /// Marks the stage as a release stage.
    #[must_use]
    pub fn release(mut self) -> Self {
        self.release = true;
        self
    }

    /// Returns true if the stage fans out over a non-empty matrix.
    #[must_use]
    pub fn has_matrix(&self) -> bool {
        self.matrix.as_ref().is_some_and(|m| !m.dimensions.is_empty())
    }
}

/// Declarative description of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// The pipeline name.
    pub name: String,
    /// Cancel every non-terminal stage as soon as one fails.
    #[serde(default)]
    pub fail_fast: bool,
    /// Stage templates.
    #[serde(default)]
    pub stages: Vec<StageTemplate>,
}

impl PipelineDefinition {
    /// Creates an empty definition.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fail_fast: false,
            stages: Vec::new(),
        }
    }

    /// Parses a definition from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stage_template_builder() {
        let template = StageTemplate::new("deploy")
            .with_kind(StageKind::Deploy)
            .depends_on(["publish"])
            .with_input("publish", "image")
            .with_gate("production-{region}")
            .with_matrix(MatrixSpec::new().dimension("region", ["eu", "us"]));

        assert_eq!(template.depends_on, vec!["publish".to_string()]);
        assert_eq!(template.inputs[0], InputRef::new("publish", "image"));
        assert!(template.has_matrix());
        assert!(!template.release);
    }

    #[test]
    fn test_matrix_combinations() {
        let matrix = MatrixSpec::new()
            .dimension("os", ["linux", "macos"])
            .dimension("arch", ["x64", "arm64", "riscv"]);
        assert_eq!(matrix.combinations(), 6);
        assert!(!matrix.fail_fast);
    }

    #[test]
    fn test_definition_from_json() {
        let json = r#"{
            "name": "release",
            "stages": [
                {"name": "version", "outputs": ["tag"]},
                {
                    "name": "build",
                    "kind": "build",
                    "depends_on": ["version"],
                    "inputs": [{"stage": "version", "output": "tag"}],
                    "matrix": {"dimensions": [{"name": "os", "values": ["linux", "macos"]}]}
                }
            ]
        }"#;

        let def = PipelineDefinition::from_json_str(json).unwrap();
        assert_eq!(def.name, "release");
        assert!(!def.fail_fast);
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.stages[1].kind, StageKind::Build);
        assert_eq!(def.stages[1].matrix.as_ref().unwrap().combinations(), 2);
    }
}
