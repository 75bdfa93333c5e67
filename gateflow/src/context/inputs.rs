//! Resolved inputs handed to a stage body.

use crate::pipeline::InstanceId;
use serde::{Deserialize, Serialize};

/// One resolved input value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputValue {
    /// The instance that produced the value.
    pub producer: InstanceId,
    /// The output key.
    pub key: String,
    /// The value.
    pub value: String,
}

/// Provides an immutable view of the outputs a stage declared as inputs.
///
/// Values are resolved by the scheduler before dispatch, so a stage only
/// ever sees outputs of producers that already succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageInputs {
    entries: Vec<InputValue>,
}

impl StageInputs {
    /// Creates empty inputs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a resolved value.
    pub fn insert(&mut self, producer: InstanceId, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push(InputValue {
            producer,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Gets a value by key when exactly one producer supplied it.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        let mut matches = self.entries.iter().filter(|e| e.key == key);
        let first = matches.next()?;
        if matches.next().is_some() {
            return None;
        }
        Some(first.value.as_str())
    }

    /// Gets a value written by a specific template.
    ///
    /// When several matrix instances of `stage` wrote `key`, the first in
    /// expansion order wins; use [`Self::all`] to see every value.
    #[must_use]
    pub fn get_from(&self, stage: &str, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.key == key && e.producer.template == stage)
            .map(|e| e.value.as_str())
    }

    /// Returns every value of `key`, one per producing instance.
    #[must_use]
    pub fn all(&self, key: &str) -> Vec<&InputValue> {
        self.entries.iter().filter(|e| e.key == key).collect()
    }

    /// Returns all entries.
    #[must_use]
    pub fn entries(&self) -> &[InputValue] {
        &self.entries
    }

    /// Returns true if nothing was resolved.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of resolved values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
