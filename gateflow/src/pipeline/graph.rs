//! Typed DAG of stage instances.
//!
//! Dependencies are declared between templates; every instance of a
//! dependent template depends on every instance of each template it names,
//! so a fan-in waits for the whole matrix to resolve.

use super::matrix::{check_artifact_keys, MatrixCoordinate, StageInstance};
use super::InstanceId;
use crate::condition::{Condition, Scope};
use crate::context::OutputStore;
use crate::core::{StageState, TriggerContext};
use crate::errors::{AmbiguousOutputError, ConfigError, CycleDetectedError, UnknownDependencyError};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

#[derive(Debug)]
struct Node {
    instance: StageInstance,
    condition: Option<Condition>,
    dependencies: Vec<usize>,
    dependents: Vec<usize>,
    ancestors: BTreeSet<usize>,
}

/// The outcome of examining every non-terminal instance once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frontier {
    /// Dependencies succeeded and the condition holds.
    pub ready: Vec<InstanceId>,
    /// Must be skipped, with the reason. Includes transitive dependents of
    /// instances skipped in the same pass.
    pub skipped: Vec<(InstanceId, String)>,
    /// Still waiting on at least one non-terminal dependency.
    pub blocked: Vec<InstanceId>,
}

/// A validated directed acyclic graph of stage instances.
///
/// Instance indices follow expansion order and are stable for the life of
/// the graph; state tables passed to [`StageGraph::frontier`] are indexed
/// the same way.
#[derive(Debug)]
pub struct StageGraph {
    name: String,
    fail_fast: bool,
    nodes: Vec<Node>,
    index: HashMap<InstanceId, usize>,
    order: Vec<usize>,
}

impl StageGraph {
    /// Builds and validates a graph from expanded instances.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` for cycles, unknown dependencies, ambiguous
    /// outputs, duplicate instances, malformed conditions or inputs that
    /// do not name a declared output of a dependency.
    pub fn build(name: impl Into<String>, instances: Vec<StageInstance>) -> Result<Self, ConfigError> {
        if instances.is_empty() {
            return Err(ConfigError::Empty);
        }

        let mut index = HashMap::with_capacity(instances.len());
        let mut by_template: HashMap<String, Vec<usize>> = HashMap::new();
        let mut template_order: Vec<String> = Vec::new();

        for (i, instance) in instances.iter().enumerate() {
            if index.insert(instance.id.clone(), i).is_some() {
                return Err(ConfigError::DuplicateStage {
                    instance: instance.id.to_string(),
                });
            }
            match by_template.entry(instance.name().to_string()) {
                Entry::Occupied(mut entry) => {
                    // Two distinct templates sharing a name.
                    if instances[entry.get()[0]].template != instance.template {
                        return Err(ConfigError::DuplicateStage {
                            instance: instance.name().to_string(),
                        });
                    }
                    entry.get_mut().push(i);
                }
                Entry::Vacant(entry) => {
                    template_order.push(instance.name().to_string());
                    entry.insert(vec![i]);
                }
            }
        }

        check_artifact_keys(&instances)?;

        let mut conditions: HashMap<String, Condition> = HashMap::new();
        for name in &template_order {
            let template = &instances[by_template[name][0]].template;
            Self::validate_template(template, &by_template, &instances)?;
            if let Some(condition) = Self::parse_condition(template, &by_template, &instances)? {
                conditions.insert(name.clone(), condition);
            }
        }

        let template_deps: HashMap<String, Vec<String>> = template_order
            .iter()
            .map(|name| {
                let template = &instances[by_template[name][0]].template;
                (name.clone(), template.depends_on.clone())
            })
            .collect();
        detect_cycles(&template_order, &template_deps)?;

        let n = instances.len();
        let mut dependencies: Vec<Vec<usize>> = Vec::with_capacity(n);
        for instance in &instances {
            let deps: BTreeSet<usize> = instance
                .template
                .depends_on
                .iter()
                .flat_map(|dep| by_template[dep].iter().copied())
                .collect();
            dependencies.push(deps.into_iter().collect());
        }

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        for (i, deps) in dependencies.iter().enumerate() {
            for &d in deps {
                dependents[d].push(i);
            }
        }

        // Kahn's algorithm with declaration order as tie-break.
        let mut indegree: Vec<usize> = dependencies.iter().map(Vec::len).collect();
        let mut queue: BTreeSet<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(i) = queue.pop_first() {
            order.push(i);
            for &d in &dependents[i] {
                indegree[d] -= 1;
                if indegree[d] == 0 {
                    queue.insert(d);
                }
            }
        }

        let mut ancestors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        for &i in &order {
            let mut acc = BTreeSet::new();
            for &d in &dependencies[i] {
                acc.insert(d);
                acc.extend(ancestors[d].iter().copied());
            }
            ancestors[i] = acc;
        }

        check_ambiguity(&instances, &order, &ancestors)?;

        let nodes = instances
            .into_iter()
            .zip(dependencies)
            .zip(dependents)
            .zip(ancestors)
            .map(|(((instance, dependencies), dependents), ancestors)| Node {
                condition: conditions.get(instance.name()).cloned(),
                instance,
                dependencies,
                dependents,
                ancestors,
            })
            .collect::<Vec<_>>();

        let name = name.into();
        let graph = Self {
            name,
            fail_fast: false,
            nodes,
            index,
            order,
        };
        graph.check_condition_references()?;

        debug!(pipeline = %graph.name, instances = graph.nodes.len(), "Stage graph built");
        Ok(graph)
    }

    /// Rejects condition references that resolve to more than one producer,
    /// such as a plain template name read across a matrix fan-in.
    fn check_condition_references(&self) -> Result<(), AmbiguousOutputError> {
        for (i, node) in self.nodes.iter().enumerate() {
            let Some(condition) = &node.condition else {
                continue;
            };
            for (stage, key) in condition.output_references() {
                if let [first, second, ..] = self.referenced_producers(i, &stage, &key).as_slice() {
                    let first = &self.nodes[*first].instance.id;
                    let hint = format!("Name one instance explicitly, e.g. outputs['{first}'].{key}");
                    return Err(AmbiguousOutputError::new(
                        key,
                        first.to_string(),
                        self.nodes[*second].instance.id.to_string(),
                        node.instance.id.to_string(),
                    )
                    .with_fix_hint(hint));
                }
            }
        }
        Ok(())
    }

    fn validate_template(
        template: &super::StageTemplate,
        by_template: &HashMap<String, Vec<usize>>,
        instances: &[StageInstance],
    ) -> Result<(), ConfigError> {
        for dep in &template.depends_on {
            if dep == &template.name {
                return Err(CycleDetectedError::new(vec![dep.clone(), dep.clone()]).into());
            }
            if !by_template.contains_key(dep) {
                return Err(UnknownDependencyError::new(&template.name, dep).into());
            }
        }

        for input in &template.inputs {
            let undeclared = |reason: &str| ConfigError::UndeclaredInput {
                stage: template.name.clone(),
                producer: input.stage.clone(),
                output: input.output.clone(),
                reason: reason.to_string(),
            };

            let Some(producers) = by_template.get(&input.stage) else {
                return Err(UnknownDependencyError::new(&template.name, &input.stage).into());
            };
            if !template.depends_on.contains(&input.stage) {
                return Err(undeclared("is not produced by a declared dependency"));
            }
            if !instances[producers[0]].template.outputs.contains(&input.output) {
                return Err(undeclared("the producer does not declare as an output"));
            }
        }

        Ok(())
    }

    fn parse_condition(
        template: &super::StageTemplate,
        by_template: &HashMap<String, Vec<usize>>,
        instances: &[StageInstance],
    ) -> Result<Option<Condition>, ConfigError> {
        let Some(source) = &template.condition else {
            return Ok(None);
        };
        let invalid = |reason: String| ConfigError::InvalidCondition {
            stage: template.name.clone(),
            reason,
        };

        let condition = Condition::parse(source.clone()).map_err(|err| invalid(err.to_string()))?;

        for (stage, key) in condition.output_references() {
            // A reference names either a dependency template or one instance of it.
            let producer = if template.depends_on.contains(&stage) {
                by_template.get(&stage).map(|ids| ids[0])
            } else {
                template
                    .depends_on
                    .iter()
                    .filter_map(|dep| by_template.get(dep))
                    .flatten()
                    .copied()
                    .find(|&i| instances[i].id.to_string() == stage)
            };
            let Some(producer) = producer else {
                return Err(invalid(format!(
                    "reads outputs.{stage}.{key} but '{stage}' is not a dependency or an instance of one"
                )));
            };
            if !instances[producer].template.outputs.contains(&key) {
                return Err(invalid(format!("'{stage}' does not declare output '{key}'")));
            }
        }

        Ok(Some(condition))
    }

    /// Sets the run-level fail-fast flag.
    #[must_use]
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether one failure cancels every non-terminal instance.
    #[must_use]
    pub fn fail_fast(&self) -> bool {
        self.fail_fast
    }

    /// Returns the number of instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no instances.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the instances in expansion order.
    pub fn instances(&self) -> impl Iterator<Item = &StageInstance> {
        self.nodes.iter().map(|n| &n.instance)
    }

    /// Returns the index of an instance.
    #[must_use]
    pub fn index_of(&self, id: &InstanceId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Looks up an instance by id.
    #[must_use]
    pub fn instance(&self, id: &InstanceId) -> Option<&StageInstance> {
        self.index_of(id).map(|i| &self.nodes[i].instance)
    }

    /// Returns the instance at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn instance_at(&self, index: usize) -> &StageInstance {
        &self.nodes[index].instance
    }

    /// Returns instance ids in topological order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&InstanceId> {
        self.order.iter().map(|&i| &self.nodes[i].instance.id).collect()
    }

    /// Returns the indices of the direct dependencies of `index`.
    #[must_use]
    pub fn dependencies_at(&self, index: usize) -> &[usize] {
        &self.nodes[index].dependencies
    }

    /// Returns the indices of the direct dependents of `index`.
    #[must_use]
    pub fn dependents_at(&self, index: usize) -> &[usize] {
        &self.nodes[index].dependents
    }

    /// Returns the ids of the direct dependencies of an instance.
    #[must_use]
    pub fn dependencies(&self, id: &InstanceId) -> Vec<&InstanceId> {
        self.index_of(id)
            .map(|i| {
                self.nodes[i]
                    .dependencies
                    .iter()
                    .map(|&d| &self.nodes[d].instance.id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns true if `ancestor` is reachable through dependencies of `id`.
    #[must_use]
    pub fn depends_transitively(&self, id: &InstanceId, ancestor: &InstanceId) -> bool {
        match (self.index_of(id), self.index_of(ancestor)) {
            (Some(i), Some(a)) => self.nodes[i].ancestors.contains(&a),
            _ => false,
        }
    }

    /// Returns the indices of other instances expanded from the same template.
    #[must_use]
    pub fn siblings_at(&self, index: usize) -> Vec<usize> {
        let name = self.nodes[index].instance.name();
        self.nodes
            .iter()
            .enumerate()
            .filter(|(i, n)| *i != index && n.instance.name() == name)
            .map(|(i, _)| i)
            .collect()
    }

    /// Computes which instances can start, must be skipped or stay blocked.
    ///
    /// `states` is indexed like [`StageGraph::instances`]. Instances are
    /// examined in topological order against a local copy of the states, so
    /// a skip propagates to all transitive dependents within one call.
    /// Conditions are evaluated only once every dependency has succeeded;
    /// an evaluation error counts as `false`.
    #[must_use]
    pub fn frontier(
        &self,
        states: &[StageState],
        trigger: &TriggerContext,
        outputs: &OutputStore,
    ) -> Frontier {
        let mut local: Vec<StageState> = (0..self.nodes.len())
            .map(|i| states.get(i).copied().unwrap_or_default())
            .collect();
        let mut frontier = Frontier::default();

        for &i in &self.order {
            let node = &self.nodes[i];
            let id = node.instance.id.clone();

            match local[i] {
                StageState::Ready => {
                    frontier.ready.push(id);
                    continue;
                }
                StageState::Pending | StageState::Blocked => {}
                _ => continue,
            }

            if let Some(&dep) = node.dependencies.iter().find(|&&d| {
                matches!(
                    local[d],
                    StageState::Failed | StageState::Skipped | StageState::Cancelled
                )
            }) {
                let reason = format!("dependency '{}' {}", self.nodes[dep].instance.id, local[dep]);
                local[i] = StageState::Skipped;
                frontier.skipped.push((id, reason));
                continue;
            }

            if node.dependencies.iter().all(|&d| local[d].is_success()) {
                let scope = InstanceScope {
                    graph: self,
                    node: i,
                    trigger,
                    outputs,
                };
                let holds = node.condition.as_ref().map_or(true, |c| c.evaluate(&scope));
                if holds {
                    local[i] = StageState::Ready;
                    frontier.ready.push(id);
                } else {
                    local[i] = StageState::Skipped;
                    frontier.skipped.push((id, "condition not met".to_string()));
                }
            } else {
                frontier.blocked.push(id);
            }
        }

        frontier
    }

    /// Returns the instances whose dependencies all succeeded and whose
    /// condition holds.
    #[must_use]
    pub fn ready(
        &self,
        states: &[StageState],
        trigger: &TriggerContext,
        outputs: &OutputStore,
    ) -> Vec<&StageInstance> {
        self.frontier(states, trigger, outputs)
            .ready
            .iter()
            .filter_map(|id| self.instance(id))
            .collect()
    }

    /// Returns a condition scope for one instance.
    #[must_use]
    pub fn scope<'a>(
        &'a self,
        id: &InstanceId,
        trigger: &'a TriggerContext,
        outputs: &'a OutputStore,
    ) -> Option<InstanceScope<'a>> {
        self.index_of(id).map(|node| InstanceScope {
            graph: self,
            node,
            trigger,
            outputs,
        })
    }

    /// Resolves the single ancestor of `consumer` that produces `key`.
    ///
    /// Producers whose matrix coordinates contradict the consumer's are
    /// ignored. Returns `None` when no producer or more than one remains.
    #[must_use]
    pub fn resolve_producer(&self, consumer: &InstanceId, key: &str) -> Option<&InstanceId> {
        let node = self.index_of(consumer)?;
        let candidates = self.candidates(node, key, |_| true);
        match candidates.as_slice() {
            [only] => Some(&self.nodes[*only].instance.id),
            _ => None,
        }
    }

    /// Ancestors of `node` declaring `key` that pass `filter` and whose
    /// shared matrix dimensions agree with the consumer's.
    fn candidates(&self, node: usize, key: &str, filter: impl Fn(&StageInstance) -> bool) -> Vec<usize> {
        let consumer = &self.nodes[node].instance.coordinate;
        self.nodes[node]
            .ancestors
            .iter()
            .copied()
            .filter(|&a| {
                let producer = &self.nodes[a].instance;
                filter(producer)
                    && producer.declared_outputs().iter().any(|o| o == key)
                    && coordinates_agree(consumer, &producer.coordinate)
            })
            .collect()
    }

    /// Producers `outputs.<stage>.<key>` can read from the instance at `node`.
    ///
    /// An exact instance id wins; a template name is narrowed by the
    /// consumer's matrix coordinate and may leave several candidates.
    fn referenced_producers(&self, node: usize, stage: &str, key: &str) -> Vec<usize> {
        let exact: Vec<usize> = self.nodes[node]
            .ancestors
            .iter()
            .copied()
            .filter(|&a| {
                let producer = &self.nodes[a].instance;
                producer.id.to_string() == stage && producer.declared_outputs().iter().any(|o| o == key)
            })
            .collect();
        if !exact.is_empty() {
            return exact;
        }
        self.candidates(node, key, |producer| producer.name() == stage)
    }

    /// Returns a stable digest of the graph's instances and edges.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for &i in &self.order {
            let node = &self.nodes[i];
            hasher.update(b"\n");
            hasher.update(node.instance.id.to_string().as_bytes());
            for &d in &node.dependencies {
                hasher.update(b"<");
                hasher.update(self.nodes[d].instance.id.to_string().as_bytes());
            }
        }
        hex::encode(hasher.finalize())
    }
}

/// Condition scope for one instance of a graph.
#[derive(Debug, Clone, Copy)]
pub struct InstanceScope<'a> {
    graph: &'a StageGraph,
    node: usize,
    trigger: &'a TriggerContext,
    outputs: &'a OutputStore,
}

impl Scope for InstanceScope<'_> {
    fn trigger(&self) -> &TriggerContext {
        self.trigger
    }

    fn matrix_value(&self, dimension: &str) -> Option<String> {
        self.graph.nodes[self.node]
            .instance
            .coordinate
            .get(dimension)
            .map(str::to_string)
    }

    fn run_value(&self, key: &str) -> Option<String> {
        self.outputs.run_value(key)
    }

    fn output(&self, stage: &str, key: &str) -> Option<String> {
        match self.graph.referenced_producers(self.node, stage, key).as_slice() {
            [only] => self.outputs.visible(&self.graph.nodes[*only].instance.id, key),
            _ => None,
        }
    }
}

/// True when every dimension present in both coordinates has equal values.
fn coordinates_agree(a: &MatrixCoordinate, b: &MatrixCoordinate) -> bool {
    a.pairs()
        .iter()
        .all(|(dim, value)| b.get(dim).map_or(true, |other| other == value))
}

fn check_ambiguity(
    instances: &[StageInstance],
    order: &[usize],
    ancestors: &[BTreeSet<usize>],
) -> Result<(), AmbiguousOutputError> {
    for &i in order {
        let mut seen: HashMap<(&str, &MatrixCoordinate), usize> = HashMap::new();
        for &a in &ancestors[i] {
            let producer = &instances[a];
            for output in producer.declared_outputs() {
                match seen.entry((output.as_str(), &producer.coordinate)) {
                    Entry::Occupied(entry) => {
                        return Err(AmbiguousOutputError::new(
                            output,
                            instances[*entry.get()].id.to_string(),
                            producer.id.to_string(),
                            instances[i].id.to_string(),
                        ));
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(a);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Detects cycles in the template dependency graph.
fn detect_cycles(
    templates: &[String],
    deps: &HashMap<String, Vec<String>>,
) -> Result<(), CycleDetectedError> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    let mut path = Vec::new();

    for name in templates {
        if !visited.contains(name.as_str()) {
            if let Some(cycle) = dfs_cycle(name, deps, &mut visited, &mut rec_stack, &mut path) {
                return Err(CycleDetectedError::new(cycle));
            }
        }
    }

    Ok(())
}

fn dfs_cycle(
    node: &str,
    deps: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    rec_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    rec_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(edges) = deps.get(node) {
        for dep in edges {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_cycle(dep, deps, visited, rec_stack, path) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                let cycle_start = path.iter().position(|n| n == dep).unwrap_or(0);
                let mut cycle: Vec<String> = path[cycle_start..].to_vec();
                cycle.push(dep.clone());
                return Some(cycle);
            }
        }
    }

    path.pop();
    rec_stack.remove(node);
    None
}
