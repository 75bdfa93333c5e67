//! Matrix expansion of stage templates into concrete instances.

use super::spec::{MatrixSpec, StageTemplate};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// The matrix values of one instance, in dimension declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatrixCoordinate(Vec<(String, String)>);

impl MatrixCoordinate {
    /// Creates a coordinate from `(dimension, value)` pairs.
    #[must_use]
    pub fn new(pairs: Vec<(String, String)>) -> Self {
        Self(pairs)
    }

    /// Returns the value of a dimension.
    #[must_use]
    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, value)| value.as_str())
    }

    /// Returns the values in dimension order.
    #[must_use]
    pub fn values(&self) -> Vec<String> {
        self.0.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Returns the `(dimension, value)` pairs.
    #[must_use]
    pub fn pairs(&self) -> &[(String, String)] {
        &self.0
    }

    /// Returns true for the coordinate of a template without a matrix.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Replaces `{dim}` placeholders in `template` with this coordinate's values.
    #[must_use]
    pub fn substitute(&self, template: &str) -> String {
        self.0.iter().fold(template.to_string(), |acc, (name, value)| {
            acc.replace(&format!("{{{name}}}"), value)
        })
    }
}

/// Identity of a stage instance: template name plus matrix values.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    /// The template name.
    pub template: String,
    /// Matrix values in dimension order; empty without a matrix.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl InstanceId {
    /// Creates an id for a template without a matrix.
    #[must_use]
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            values: Vec::new(),
        }
    }

    /// Creates an id for one matrix combination.
    #[must_use]
    pub fn with_values(template: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            template: template.into(),
            values,
        }
    }

    /// Returns a filesystem- and URL-safe name, e.g. `build-linux-x64`.
    ///
    /// Stable across runs for identical inputs, so it can be used to name
    /// artifacts handed to publish sinks. Sanitising is lossy; graphs whose
    /// instances would share a key are rejected when they are built.
    #[must_use]
    pub fn artifact_key(&self) -> String {
        std::iter::once(self.template.as_str())
            .chain(self.values.iter().map(String::as_str))
            .map(|part| {
                part.chars()
                    .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' { c } else { '-' })
                    .collect::<String>()
            })
            .collect::<Vec<_>>()
            .join("-")
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.values.is_empty() {
            write!(f, "{}", self.template)
        } else {
            write!(f, "{} ({})", self.template, self.values.join(", "))
        }
    }
}

/// A stage template bound to one concrete matrix combination.
#[derive(Debug, Clone)]
pub struct StageInstance {
    /// The instance identity.
    pub id: InstanceId,
    /// The template this instance was expanded from.
    pub template: Arc<StageTemplate>,
    /// The matrix values of this instance.
    pub coordinate: MatrixCoordinate,
    /// The approval gate with placeholders resolved.
    pub gate: Option<String>,
}

impl StageInstance {
    /// Returns the template name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.template.name
    }

    /// Returns the declared outputs.
    #[must_use]
    pub fn declared_outputs(&self) -> &[String] {
        &self.template.outputs
    }
}

/// Expands stage templates over their matrix dimensions.
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expands a template into its instances.
    ///
    /// Without a matrix this yields exactly one instance. With dimensions of
    /// sizes s1..sn it yields the s1 x ... x sn cross-product (minus
    /// exclusions) ordered lexicographically over dimensions in declaration
    /// order and values in declared order.
    pub fn expand(template: &StageTemplate) -> Result<Vec<StageInstance>, ConfigError> {
        let template = Arc::new(template.clone());

        let Some(matrix) = template.matrix.as_ref().filter(|m| !m.dimensions.is_empty()) else {
            let coordinate = MatrixCoordinate::default();
            return Ok(vec![StageInstance {
                id: InstanceId::new(&template.name),
                gate: template.gate.clone(),
                template: template.clone(),
                coordinate,
            }]);
        };

        Self::validate(&template.name, matrix)?;

        let instances = Self::cross_product(matrix)
            .into_iter()
            .filter(|coordinate| !Self::is_excluded(matrix, coordinate))
            .map(|coordinate| StageInstance {
                id: InstanceId::with_values(&template.name, coordinate.values()),
                gate: template.gate.as_deref().map(|g| coordinate.substitute(g)),
                template: template.clone(),
                coordinate,
            })
            .collect::<Vec<_>>();

        check_artifact_keys(&instances)?;
        Ok(instances)
    }

    /// Expands every template in order.
    pub fn expand_all<'a>(
        templates: impl IntoIterator<Item = &'a StageTemplate>,
    ) -> Result<Vec<StageInstance>, ConfigError> {
        let mut instances = Vec::new();
        for template in templates {
            instances.extend(Self::expand(template)?);
        }
        check_artifact_keys(&instances)?;
        Ok(instances)
    }

    fn validate(stage: &str, matrix: &MatrixSpec) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidMatrix {
            stage: stage.to_string(),
            reason,
        };

        for (i, dim) in matrix.dimensions.iter().enumerate() {
            if dim.values.is_empty() {
                return Err(invalid(format!("dimension '{}' has no values", dim.name)));
            }
            if matrix.dimensions[..i].iter().any(|d| d.name == dim.name) {
                return Err(invalid(format!("dimension '{}' is declared twice", dim.name)));
            }
            if let Some(value) = dim
                .values
                .iter()
                .enumerate()
                .find(|(j, v)| dim.values[..*j].contains(v))
                .map(|(_, v)| v)
            {
                return Err(invalid(format!(
                    "dimension '{}' repeats value '{value}'",
                    dim.name
                )));
            }
        }

        for rule in &matrix.exclude {
            if let Some(key) = rule
                .keys()
                .find(|k| !matrix.dimensions.iter().any(|d| &d.name == *k))
            {
                return Err(invalid(format!("exclude names unknown dimension '{key}'")));
            }
        }

        Ok(())
    }

    fn cross_product(matrix: &MatrixSpec) -> Vec<MatrixCoordinate> {
        let mut combos: Vec<Vec<(String, String)>> = vec![Vec::new()];
        for dim in &matrix.dimensions {
            combos = combos
                .into_iter()
                .flat_map(|prefix| {
                    dim.values.iter().map(move |value| {
                        let mut next = prefix.clone();
                        next.push((dim.name.clone(), value.clone()));
                        next
                    })
                })
                .collect();
        }
        combos.into_iter().map(MatrixCoordinate::new).collect()
    }

    fn is_excluded(matrix: &MatrixSpec, coordinate: &MatrixCoordinate) -> bool {
        matrix.exclude.iter().any(|rule| {
            rule.iter()
                .all(|(dim, value)| coordinate.get(dim) == Some(value.as_str()))
        })
    }
}

/// Rejects instances whose sanitised artifact keys coincide.
pub(crate) fn check_artifact_keys(instances: &[StageInstance]) -> Result<(), ConfigError> {
    let mut seen: HashMap<String, &InstanceId> = HashMap::with_capacity(instances.len());
    for instance in instances {
        if let Some(other) = seen.insert(instance.id.artifact_key(), &instance.id) {
            if other == &instance.id {
                continue;
            }
            return Err(ConfigError::InvalidMatrix {
                stage: instance.name().to_string(),
                reason: format!(
                    "'{other}' and '{}' share artifact key '{}'",
                    instance.id,
                    instance.id.artifact_key()
                ),
            });
        }
    }
    Ok(())
}
