//! Write-once output store shared by all instances of a run.

use crate::errors::{DuplicateOutputError, MissingOutputError};
use crate::pipeline::{InstanceId, StageGraph};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Values written by one producer, visible only once it is sealed.
#[derive(Debug, Default)]
struct ProducerEntry {
    values: BTreeMap<String, String>,
    sealed: Option<bool>,
}

#[derive(Debug, Default)]
struct StoreState {
    producers: HashMap<InstanceId, ProducerEntry>,
    run_scoped: BTreeMap<String, String>,
}

/// A thread-safe store for stage outputs.
///
/// Each `(producer, key)` pair is written at most once. Values stay
/// invisible to readers until the scheduler seals the producer with a
/// successful terminal state, which gives consumers a happens-before edge
/// on the producer's success.
#[derive(Debug)]
pub struct OutputStore {
    state: RwLock<StoreState>,
    sealed_tx: watch::Sender<u64>,
}

impl Default for OutputStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        let (sealed_tx, _) = watch::channel(0);
        Self {
            state: RwLock::new(StoreState::default()),
            sealed_tx,
        }
    }

    /// Stages an output value for `instance`.
    ///
    /// Writes arriving after the producer was sealed (e.g. a cancelled body
    /// that returned late) are dropped.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateOutputError` if the key was already written by
    /// that instance.
    pub fn put(
        &self,
        instance: &InstanceId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DuplicateOutputError> {
        let key = key.into();
        let mut state = self.state.write();
        let entry = state.producers.entry(instance.clone()).or_default();

        if entry.sealed.is_some() {
            warn!(instance = %instance, key = %key, "Dropping output written after the producer finished");
            return Ok(());
        }
        if entry.values.contains_key(&key) {
            return Err(DuplicateOutputError::new(instance.to_string(), key));
        }

        debug!(instance = %instance, key = %key, "Output staged");
        entry.values.insert(key, value.into());
        Ok(())
    }

    /// Returns the keys staged or written by `instance`.
    #[must_use]
    pub fn written_keys(&self, instance: &InstanceId) -> Vec<String> {
        self.state
            .read()
            .producers
            .get(instance)
            .map(|e| e.values.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Records the producer's terminal state.
    ///
    /// On success its values become visible; otherwise they are discarded.
    /// Sealing twice is a no-op.
    pub fn seal(&self, instance: &InstanceId, success: bool) {
        {
            let mut state = self.state.write();
            let entry = state.producers.entry(instance.clone()).or_default();
            if entry.sealed.is_some() {
                return;
            }
            entry.sealed = Some(success);
            if !success {
                entry.values.clear();
            }
        }
        self.sealed_tx.send_modify(|version| *version += 1);
    }

    /// Restores a producer that succeeded in an earlier process.
    pub fn restore(&self, instance: &InstanceId, values: BTreeMap<String, String>) {
        {
            let mut state = self.state.write();
            state.producers.insert(
                instance.clone(),
                ProducerEntry {
                    values,
                    sealed: Some(true),
                },
            );
        }
        self.sealed_tx.send_modify(|version| *version += 1);
    }

    /// Returns true once the producer has been sealed.
    #[must_use]
    pub fn is_sealed(&self, instance: &InstanceId) -> bool {
        self.state
            .read()
            .producers
            .get(instance)
            .is_some_and(|e| e.sealed.is_some())
    }

    /// Returns a value if its producer has already succeeded.
    #[must_use]
    pub fn visible(&self, producer: &InstanceId, key: &str) -> Option<String> {
        let state = self.state.read();
        let entry = state.producers.get(producer)?;
        match entry.sealed {
            Some(true) => entry.values.get(key).cloned(),
            _ => None,
        }
    }

    /// Reads an output, waiting until the producer reaches a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `MissingOutputError` if the producer terminated without
    /// writing the key, including when it failed or was skipped.
    pub async fn get(&self, producer: &InstanceId, key: &str) -> Result<String, MissingOutputError> {
        let mut rx = self.sealed_tx.subscribe();
        loop {
            {
                let state = self.state.read();
                if let Some(entry) = state.producers.get(producer) {
                    match entry.sealed {
                        Some(true) => {
                            return entry.values.get(key).cloned().ok_or_else(|| {
                                MissingOutputError::new(
                                    producer.to_string(),
                                    key,
                                    "the producer succeeded without writing it",
                                )
                            })
                        }
                        Some(false) => {
                            return Err(MissingOutputError::new(
                                producer.to_string(),
                                key,
                                "the producer did not succeed",
                            ))
                        }
                        None => {}
                    }
                }
            }

            if rx.changed().await.is_err() {
                return Err(MissingOutputError::new(
                    producer.to_string(),
                    key,
                    "the output store was dropped",
                ));
            }
        }
    }

    /// Reads `key` on behalf of `consumer`, resolving the producer among its
    /// ancestors in `graph`.
    ///
    /// # Errors
    ///
    /// Returns `MissingOutputError` if no single ancestor declares the key
    /// or if the producer terminated without writing it.
    pub async fn get_for(
        &self,
        graph: &StageGraph,
        key: &str,
        consumer: &InstanceId,
    ) -> Result<String, MissingOutputError> {
        let producer = graph.resolve_producer(consumer, key).ok_or_else(|| {
            MissingOutputError::new(
                consumer.to_string(),
                key,
                "no single ancestor of the consumer declares it",
            )
        })?;
        self.get(producer, key).await
    }

    /// Writes a run-scoped value such as `release_tag`. Visible immediately.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateOutputError` if the key was already written.
    pub fn put_run_scoped(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), DuplicateOutputError> {
        let key = key.into();
        let mut state = self.state.write();
        if state.run_scoped.contains_key(&key) {
            return Err(DuplicateOutputError::new("run", key));
        }
        state.run_scoped.insert(key, value.into());
        Ok(())
    }

    /// Returns a run-scoped value.
    #[must_use]
    pub fn run_value(&self, key: &str) -> Option<String> {
        self.state.read().run_scoped.get(key).cloned()
    }

    /// Returns all run-scoped values.
    #[must_use]
    pub fn run_values(&self) -> BTreeMap<String, String> {
        self.state.read().run_scoped.clone()
    }

    /// Returns the visible values of every successful producer.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<InstanceId, BTreeMap<String, String>> {
        self.state
            .read()
            .producers
            .iter()
            .filter(|(_, e)| e.sealed == Some(true))
            .map(|(id, e)| (id.clone(), e.values.clone()))
            .collect()
    }
}
