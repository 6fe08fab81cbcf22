use crate::{
    domain::flow_definition::FlowDefinition, domain::flow_instance::FlowId, CoreError,
};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of validated flow definitions, keyed by flow name
#[derive(Default)]
pub struct FlowRegistry {
    definitions: DashMap<String, Arc<FlowDefinition>>,
}

impl FlowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; names are unique
    pub fn register(&self, definition: FlowDefinition) -> Result<Arc<FlowDefinition>, CoreError> {
        let name = definition.id().0.clone();
        let definition = Arc::new(definition);

        match self.definitions.entry(name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(CoreError::ConfigurationError(
                format!("Flow '{}' is already registered", name),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(definition.clone());
                tracing::info!(
                    flow_id = %name,
                    steps = definition.steps().len(),
                    "Flow registered"
                );
                Ok(definition)
            }
        }
    }

    /// Look up a definition
    pub fn get(&self, name: &str) -> Result<Arc<FlowDefinition>, CoreError> {
        self.definitions
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| CoreError::FlowDefinitionNotFound(name.to_string()))
    }

    /// Whether a definition is registered
    pub fn contains(&self, name: &str) -> bool {
        self.definitions.contains_key(name)
    }

    /// Names of all registered flows, sorted
    pub fn list(&self) -> Vec<FlowId> {
        let mut names: Vec<FlowId> = self
            .definitions
            .iter()
            .map(|entry| FlowId(entry.key().clone()))
            .collect();
        names.sort();
        names
    }
}
