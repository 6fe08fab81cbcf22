use crate::{
    domain::branching::{DynamicBranches, StaticBranch},
    domain::flow_instance::{FlowId, FlowInstanceId},
    domain::pause::PauseSpec,
    domain::step::{StepContext, StepFlags},
    types::{DataBag, DataRequirement},
    step_fn, CoreError, StepExecutor, StepResult,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// How the idempotency key of a step is derived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyScope {
    /// `<flow>:<step>:<value of the data bag key>`, shared across instances
    BusinessKey(String),
    /// `<instance>:<step>`, protects re-entry of one instance
    InstanceStep,
}

/// Data bag projection used when triggering another flow
#[derive(Clone)]
pub enum Projection {
    /// The whole bag
    All,
    /// Only the listed keys
    Keys(Vec<String>),
    /// Arbitrary mapping
    Map(Arc<dyn Fn(&DataBag) -> DataBag + Send + Sync>),
}

impl Projection {
    /// Apply to a bag
    pub fn apply(&self, data: &DataBag) -> DataBag {
        match self {
            Projection::All => data.clone(),
            Projection::Keys(keys) => data.project(keys),
            Projection::Map(map) => map(data),
        }
    }
}

impl fmt::Debug for Projection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Projection::All => write!(f, "All"),
            Projection::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            Projection::Map(_) => write!(f, "Map(..)"),
        }
    }
}

/// Starts another flow once the owning step succeeds
#[derive(Debug, Clone)]
pub struct TriggerSpec {
    /// Name of the flow to start
    pub target_flow: String,
    /// Initial data bag of the new instance
    pub projection: Projection,
}

impl TriggerSpec {
    /// Trigger `target_flow` with the listed keys
    pub fn with_keys(target_flow: impl Into<String>, keys: &[&str]) -> Self {
        Self {
            target_flow: target_flow.into(),
            projection: Projection::Keys(keys.iter().map(|k| k.to_string()).collect()),
        }
    }
}

/// A node of a flow definition
///
/// Built as a plain configuration struct:
///
/// ```ignore
/// StepDefinition {
///     after: vec!["authorize".into()],
///     flags: StepFlags::critical(),
///     ..StepDefinition::new("capture", CapturePayment::new(client))
/// }
/// ```
#[derive(Clone)]
pub struct StepDefinition {
    /// Unique within the flow
    pub name: String,
    /// Steps that must resolve first
    pub after: Vec<String>,
    /// Data bag keys the body reads
    pub requires: Vec<DataRequirement>,
    /// Data bag keys the body writes
    pub produces: Vec<String>,
    /// Data bag key receiving the success payload
    pub output_key: Option<String>,
    /// Control flags
    pub flags: StepFlags,
    /// At-most-once execution
    pub idempotency: Option<IdempotencyScope>,
    /// Guarded sub-sequences, first match wins
    pub static_branches: Vec<StaticBranch>,
    /// Runtime fan-out
    pub dynamic_branches: Option<DynamicBranches>,
    /// Pause declaration
    pub pause: Option<PauseSpec>,
    /// Flows started once the step succeeds
    pub triggers: Vec<TriggerSpec>,
    /// The step body
    pub body: Arc<dyn StepExecutor>,
}

impl StepDefinition {
    /// A step with default settings running `body`
    pub fn new(name: impl Into<String>, body: impl StepExecutor + 'static) -> Self {
        Self::with_executor(name, Arc::new(body))
    }

    /// A step whose body is a closure
    pub fn from_fn<F, Fut>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<StepResult, CoreError>> + Send + 'static,
    {
        Self::with_executor(name, step_fn(body))
    }

    /// A step running a shared executor
    pub fn with_executor(name: impl Into<String>, body: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            after: Vec::new(),
            requires: Vec::new(),
            produces: Vec::new(),
            output_key: None,
            flags: StepFlags::default(),
            idempotency: None,
            static_branches: Vec::new(),
            dynamic_branches: None,
            pause: None,
            triggers: Vec::new(),
            body,
        }
    }

    /// Idempotency key for one execution, if the step is idempotent
    pub fn idempotency_key(
        &self,
        flow_id: &FlowId,
        instance_id: &FlowInstanceId,
        record_name: &str,
        data: &DataBag,
    ) -> Result<Option<String>, CoreError> {
        match &self.idempotency {
            None => Ok(None),
            Some(IdempotencyScope::InstanceStep) => {
                Ok(Some(format!("{}:{}", instance_id.0, record_name)))
            }
            Some(IdempotencyScope::BusinessKey(key)) => {
                let value = data
                    .lookup(key)
                    .ok_or_else(|| CoreError::DataBagMissingKey(key.clone()))?;
                let value = match value {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Ok(Some(format!("{}:{}:{}", flow_id.0, record_name, value)))
            }
        }
    }

    /// Keys made available to later steps
    fn provided_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.produces.iter().map(String::as_str).collect();
        keys.extend(self.output_key.as_deref());
        if let Some(dynamic) = &self.dynamic_branches {
            keys.push(dynamic.results_key.as_str());
        }
        for branch in &self.static_branches {
            for step in &branch.steps {
                keys.extend(step.provided_keys());
            }
        }
        if let Some(pause) = &self.pause {
            for condition in &pause.resume {
                keys.extend(condition.written_keys());
            }
        }
        keys
    }

    fn has_control_blocks(&self) -> bool {
        !self.static_branches.is_empty()
            || self.dynamic_branches.is_some()
            || self.pause.is_some()
            || !self.triggers.is_empty()
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("after", &self.after)
            .field("flags", &self.flags)
            .field("idempotency", &self.idempotency)
            .field("static_branches", &self.static_branches)
            .field("dynamic_branches", &self.dynamic_branches)
            .field("pause", &self.pause)
            .field("triggers", &self.triggers)
            .finish_non_exhaustive()
    }
}

/// Immutable, validated flow graph
#[derive(Debug, Clone)]
pub struct FlowDefinition {
    id: FlowId,
    inputs: Vec<DataRequirement>,
    steps: Vec<StepDefinition>,
    order: Vec<usize>,
    positions: Vec<usize>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
}

impl FlowDefinition {
    /// Validate the graph and compute its topological order
    pub fn build(
        id: impl Into<String>,
        inputs: Vec<DataRequirement>,
        steps: Vec<StepDefinition>,
    ) -> Result<Self, CoreError> {
        let id = FlowId(id.into());
        if id.0.trim().is_empty() {
            return Err(CoreError::ConfigurationError(
                "Flow name must not be empty".to_string(),
            ));
        }
        if steps.is_empty() {
            return Err(CoreError::ConfigurationError(format!(
                "Flow '{}' has no steps",
                id.0
            )));
        }

        let mut index = HashMap::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            if step.name.trim().is_empty() {
                return Err(CoreError::ConfigurationError(format!(
                    "Flow '{}' has a step with an empty name",
                    id.0
                )));
            }
            if index.insert(step.name.clone(), i).is_some() {
                return Err(CoreError::ConfigurationError(format!(
                    "Duplicate step name: {}",
                    step.name
                )));
            }
        }

        let mut dependents = vec![Vec::new(); steps.len()];
        for (i, step) in steps.iter().enumerate() {
            if step.flags.critical && step.flags.allow_failure {
                return Err(CoreError::ConfigurationError(format!(
                    "Step '{}' cannot be both critical and allow_failure",
                    step.name
                )));
            }
            for dep in &step.after {
                if dep == &step.name {
                    return Err(CoreError::ConfigurationError(format!(
                        "Step '{}' depends on itself",
                        step.name
                    )));
                }
                let dep_index = index.get(dep).ok_or_else(|| {
                    CoreError::ConfigurationError(format!(
                        "Step '{}' depends on unknown step '{}'",
                        step.name, dep
                    ))
                })?;
                if !dependents[*dep_index].contains(&i) {
                    dependents[*dep_index].push(i);
                }
            }
        }

        let order = topological_order(&steps, &index, &dependents).map_err(|remaining| {
            CoreError::ConfigurationError(format!(
                "Flow '{}' contains a dependency cycle involving: {}",
                id.0,
                remaining.join(", ")
            ))
        })?;
        let mut positions = vec![0; steps.len()];
        for (position, step_index) in order.iter().enumerate() {
            positions[*step_index] = position;
        }

        let definition = Self {
            id,
            inputs,
            steps,
            order,
            positions,
            index,
            dependents,
        };
        definition.validate_steps()?;
        Ok(definition)
    }

    fn validate_steps(&self) -> Result<(), CoreError> {
        let mut available: Vec<HashSet<String>> = vec![HashSet::new(); self.steps.len()];
        let inputs: HashSet<String> = self.inputs.iter().map(|r| r.key.clone()).collect();

        for &i in &self.order {
            let step = &self.steps[i];
            let mut keys = inputs.clone();
            for dep in &step.after {
                let dep_index = self.index[dep];
                keys.extend(available[dep_index].iter().cloned());
                keys.extend(
                    self.steps[dep_index]
                        .provided_keys()
                        .into_iter()
                        .map(str::to_string),
                );
            }

            check_requirements(&step.name, &step.requires, &keys)?;

            let mut branch_names = HashSet::new();
            for branch in &step.static_branches {
                if !branch_names.insert(branch.name.as_str()) {
                    return Err(CoreError::ConfigurationError(format!(
                        "Step '{}' declares branch '{}' twice",
                        step.name, branch.name
                    )));
                }
                if let Some(target) = &branch.jump_to {
                    self.validate_jump(&step.name, target)?;
                }

                let mut branch_keys = keys.clone();
                branch_keys.extend(step.produces.iter().cloned());
                branch_keys.extend(step.output_key.iter().cloned());
                let mut step_names = HashSet::new();
                for branch_step in &branch.steps {
                    if !step_names.insert(branch_step.name.as_str()) {
                        return Err(CoreError::ConfigurationError(format!(
                            "Branch '{}' of step '{}' declares step '{}' twice",
                            branch.name, step.name, branch_step.name
                        )));
                    }
                    if branch_step.has_control_blocks() {
                        return Err(CoreError::ConfigurationError(format!(
                            "Branch step '{}' may not declare branches, pauses or triggers",
                            branch_step.name
                        )));
                    }
                    check_requirements(&branch_step.name, &branch_step.requires, &branch_keys)?;
                    branch_keys.extend(branch_step.provided_keys().into_iter().map(str::to_string));
                }
            }

            if let Some(dynamic) = &step.dynamic_branches {
                if dynamic.results_key.trim().is_empty() {
                    return Err(CoreError::ConfigurationError(format!(
                        "Step '{}' fans out without a results key",
                        step.name
                    )));
                }
            }

            for trigger in &step.triggers {
                if trigger.target_flow.trim().is_empty() {
                    return Err(CoreError::ConfigurationError(format!(
                        "Step '{}' triggers a flow without a name",
                        step.name
                    )));
                }
            }

            available[i] = keys;
        }
        Ok(())
    }

    /// Flow name
    pub fn id(&self) -> &FlowId {
        &self.id
    }

    /// Declared initial inputs
    pub fn inputs(&self) -> &[DataRequirement] {
        &self.inputs
    }

    /// Steps in declaration order
    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.index.get(name).map(|i| &self.steps[*i])
    }

    /// Steps in topological order
    pub fn ordered_steps(&self) -> impl Iterator<Item = &StepDefinition> {
        self.order.iter().map(move |i| &self.steps[*i])
    }

    /// Position of a step in the topological order
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).map(|i| self.positions[*i])
    }

    /// Steps with no dependents
    pub fn sinks(&self) -> impl Iterator<Item = &StepDefinition> {
        self.steps
            .iter()
            .enumerate()
            .filter(move |(i, _)| self.dependents[*i].is_empty())
            .map(|(_, step)| step)
    }

    /// Steps strictly between `from` and `to` in topological order
    pub fn steps_between(&self, from: &str, to: &str) -> Vec<&StepDefinition> {
        match (self.position(from), self.position(to)) {
            (Some(start), Some(end)) if start < end => self.order[start + 1..end]
                .iter()
                .map(|i| &self.steps[*i])
                .collect(),
            _ => Vec::new(),
        }
    }

    /// A jump from `from` must land on a known step after it
    pub fn validate_jump(&self, from: &str, to: &str) -> Result<(), CoreError> {
        let target = self.position(to).ok_or_else(|| {
            CoreError::ConfigurationError(format!(
                "Step '{}' jumps to unknown step '{}'",
                from, to
            ))
        })?;
        let source = self.position(from).unwrap_or(0);
        if target <= source {
            return Err(CoreError::ConfigurationError(format!(
                "Step '{}' may only jump forward, '{}' comes before it",
                from, to
            )));
        }
        Ok(())
    }

    /// Check an initial data bag against the declared inputs
    pub fn validate_inputs(&self, data: &DataBag) -> Result<(), CoreError> {
        for requirement in &self.inputs {
            requirement.check(data).map_err(|e| {
                CoreError::ValidationError(format!(
                    "Flow '{}' input rejected: {}",
                    self.id.0, e
                ))
            })?;
        }
        Ok(())
    }
}

fn check_requirements(
    step: &str,
    requires: &[DataRequirement],
    available: &HashSet<String>,
) -> Result<(), CoreError> {
    for requirement in requires {
        let key = requirement.key.as_str();
        let produced = available.contains(key)
            || key
                .match_indices('.')
                .any(|(idx, _)| available.contains(&key[..idx]));
        if !produced {
            return Err(CoreError::ConfigurationError(format!(
                "Step '{}' requires data key '{}' which no upstream step produces",
                step, key
            )));
        }
    }
    Ok(())
}

/// Kahn's algorithm; ties broken by declaration order. On a cycle, returns
/// the names of the steps that could not be ordered.
fn topological_order(
    steps: &[StepDefinition],
    index: &HashMap<String, usize>,
    dependents: &[Vec<usize>],
) -> Result<Vec<usize>, Vec<String>> {
    let mut in_degree: Vec<usize> = steps
        .iter()
        .map(|step| {
            step.after
                .iter()
                .filter(|dep| index.contains_key(*dep))
                .collect::<HashSet<_>>()
                .len()
        })
        .collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| i)
        .collect();

    let mut order = Vec::with_capacity(steps.len());
    while let Some(next) = ready.pop_first() {
        order.push(next);
        for &dependent in &dependents[next] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() == steps.len() {
        Ok(order)
    } else {
        Err(steps
            .iter()
            .enumerate()
            .filter(|(i, _)| in_degree[*i] > 0)
            .map(|(_, step)| step.name.clone())
            .collect())
    }
}
