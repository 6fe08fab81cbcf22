use crate::{
    domain::condition::Condition,
    domain::flow_definition::StepDefinition,
    domain::step::StepStatus,
    types::DataBag,
    CoreError, StepExecutor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Guarded sub-sequence run after the owning step's body succeeds
#[derive(Debug, Clone)]
pub struct StaticBranch {
    /// Branch name, part of the record names of its steps
    pub name: String,
    /// Guard evaluated against the data bag
    pub guard: Condition,
    /// Steps run in order when the branch is selected
    pub steps: Vec<StepDefinition>,
    /// Step of the owning flow to continue at after the branch
    pub jump_to: Option<String>,
}

impl StaticBranch {
    /// A branch running `steps` when `guard` holds
    pub fn new(name: impl Into<String>, guard: Condition, steps: Vec<StepDefinition>) -> Self {
        Self {
            name: name.into(),
            guard,
            steps,
            jump_to: None,
        }
    }
}

/// The first branch whose guard holds
pub fn select_branch<'a>(branches: &'a [StaticBranch], data: &DataBag) -> Option<&'a StaticBranch> {
    branches.iter().find(|branch| branch.guard.evaluate(data))
}

/// Selects the items to fan out over
pub type BranchSelector = Arc<dyn Fn(&DataBag) -> Result<Vec<BranchItem>, CoreError> + Send + Sync>;

/// Builds the executor for one item
pub type BranchFactory = Arc<dyn Fn(&BranchItem) -> Arc<dyn StepExecutor> + Send + Sync>;

/// Runtime fan-out of a step
#[derive(Clone)]
pub struct DynamicBranches {
    /// Evaluated once when the owning step's body completes
    pub selector: BranchSelector,
    /// Materializes a branch per item
    pub factory: BranchFactory,
    /// Grouping and ordering of the branches
    pub distribution: Distribution,
    /// Data bag key receiving the branch reports
    pub results_key: String,
}

impl fmt::Debug for DynamicBranches {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicBranches")
            .field("distribution", &self.distribution)
            .field("results_key", &self.results_key)
            .finish_non_exhaustive()
    }
}

/// One unit of dynamic fan-out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchItem {
    /// Unique within one fan-out
    pub id: String,
    /// Item payload, exposed to the branch as `item`
    pub data: Value,
    /// Explicit resource group
    pub resource_group: Option<String>,
    /// Lower runs first within a group
    pub priority: i64,
}

impl BranchItem {
    /// Untagged item with priority 0
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
            resource_group: None,
            priority: 0,
        }
    }
}

/// How branches are grouped
///
/// Groups run concurrently; the branches of one group run one after another
/// in ascending priority, ties kept in selector order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum Distribution {
    /// Untagged items are assigned to `groups` in rotation
    RoundRobin {
        /// Resource groups, e.g. exchange accounts
        groups: Vec<String>,
    },
    /// Items keep their tag; untagged items share the `default` group
    ByResourceGroup,
    /// One group, every branch in order
    Sequential,
    /// Every branch is its own group
    Concurrent,
}

/// Group name given to untagged items outside round robin
pub const DEFAULT_GROUP: &str = "default";

/// A branch with its assigned group
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBranch {
    /// The item
    pub item: BranchItem,
    /// Assigned group
    pub group: String,
    /// Position in the selector output
    pub ordinal: usize,
}

/// Branches sharing a resource group, in execution order
#[derive(Debug, Clone, PartialEq)]
pub struct BranchGroup {
    /// Group name
    pub name: String,
    /// Branches in execution order
    pub branches: Vec<PlannedBranch>,
}

/// Assign items to groups and order each group
///
/// Groups are returned in order of first appearance.
pub fn plan_branches(items: Vec<BranchItem>, distribution: &Distribution) -> Vec<BranchGroup> {
    let mut planned: Vec<BranchGroup> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut rotation = 0usize;

    for (ordinal, item) in items.into_iter().enumerate() {
        let group = match (distribution, &item.resource_group) {
            (Distribution::Sequential, _) => DEFAULT_GROUP.to_string(),
            (Distribution::Concurrent, _) => item.id.clone(),
            (_, Some(tag)) => tag.clone(),
            (Distribution::RoundRobin { groups }, None) if !groups.is_empty() => {
                let group = groups[rotation % groups.len()].clone();
                rotation += 1;
                group
            }
            _ => DEFAULT_GROUP.to_string(),
        };

        let slot = match index.get(&group) {
            Some(slot) => *slot,
            None => {
                planned.push(BranchGroup {
                    name: group.clone(),
                    branches: Vec::new(),
                });
                index.insert(group.clone(), planned.len() - 1);
                planned.len() - 1
            }
        };
        planned[slot].branches.push(PlannedBranch {
            item,
            group,
            ordinal,
        });
    }

    for group in &mut planned {
        group
            .branches
            .sort_by_key(|branch| (branch.item.priority, branch.ordinal));
    }
    planned
}

/// Summary of one branch, written to the owner's results key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchReport {
    /// Item id
    pub id: String,
    /// Resource group it ran in
    pub group: String,
    /// Item priority
    pub priority: i64,
    /// Terminal status
    pub status: StepStatus,
    /// Result message
    pub message: String,
    /// Success payload
    pub payload: Option<Value>,
}
