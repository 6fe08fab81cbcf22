use crate::{
    application::flow_registry::FlowRegistry,
    domain::events::TriggerRejected,
    domain::flow_definition::{FlowDefinition, TriggerSpec},
    domain::flow_instance::{FlowId, FlowInstance, FlowInstanceId, Lineage},
    CoreError,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// A child instance ready to be persisted and driven
#[derive(Debug)]
pub struct ChildLaunch {
    /// Definition of the child flow
    pub definition: Arc<FlowDefinition>,
    /// The child instance, already started
    pub instance: FlowInstance,
}

/// Turns step triggers into child flow instances
///
/// Every child gets a fresh instance id, so instances form a DAG through
/// their lineage. A flow may trigger itself; the configured depth bounds
/// such chains, and a trigger that would exceed it is rejected.
#[derive(Debug, Clone)]
pub struct TriggerDispatcher {
    max_depth: u32,
}

impl TriggerDispatcher {
    /// Create a dispatcher allowing `max_depth` trigger hops from a root instance
    pub fn new(max_depth: u32) -> Self {
        Self { max_depth }
    }

    /// Prepare the child started by `trigger` from `step` of `parent`
    ///
    /// On success the child is recorded on the parent. Rejections are logged
    /// and recorded as a domain event on the parent; they never fail it.
    pub fn prepare(
        &self,
        registry: &FlowRegistry,
        parent: &mut FlowInstance,
        step: &str,
        trigger: &TriggerSpec,
    ) -> Option<ChildLaunch> {
        match self.build_child(registry, parent, step, trigger) {
            Ok(launch) => {
                info!(
                    flow_instance_id = %parent.id,
                    child_instance_id = %launch.instance.id,
                    target_flow = %trigger.target_flow,
                    step = %step,
                    "Child flow dispatched"
                );
                parent.add_child(launch.instance.id.clone(), &trigger.target_flow, step);
                Some(launch)
            }
            Err(error) => {
                warn!(
                    flow_instance_id = %parent.id,
                    target_flow = %trigger.target_flow,
                    step = %step,
                    error = %error,
                    "Trigger rejected"
                );
                parent.record_event(Box::new(TriggerRejected {
                    flow_instance_id: parent.id.clone(),
                    target_flow: trigger.target_flow.clone(),
                    step: step.to_string(),
                    reason: error.to_string(),
                    timestamp: Utc::now(),
                }));
                None
            }
        }
    }

    fn build_child(
        &self,
        registry: &FlowRegistry,
        parent: &FlowInstance,
        step: &str,
        trigger: &TriggerSpec,
    ) -> Result<ChildLaunch, CoreError> {
        let lineage = Lineage::child_of(parent, step);
        if lineage.depth > self.max_depth {
            return Err(CoreError::TriggerError(format!(
                "trigger depth {} exceeds the maximum of {}",
                lineage.depth, self.max_depth
            )));
        }

        let definition = registry.get(&trigger.target_flow)?;
        let data = trigger.projection.apply(&parent.data);
        definition.validate_inputs(&data)?;

        let mut instance = FlowInstance::with_lineage(
            FlowInstanceId::generate(),
            FlowId(trigger.target_flow.clone()),
            data,
            lineage,
        );
        instance.start()?;

        Ok(ChildLaunch {
            definition,
            instance,
        })
    }
}
