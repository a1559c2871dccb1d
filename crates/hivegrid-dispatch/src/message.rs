//! Wire types for incremental agent assignments.

use serde::{Deserialize, Serialize};

use hivegrid_state::{Config, Secret, Task};

/// One item an agent may hold: a task or one of its dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum Assignment {
    Task(Task),
    Secret(Secret),
    Config(Config),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentAction {
    Update,
    Remove,
}

/// The incremental unit of what an agent should add to or drop from its
/// local set. Remove changes carry a minimal payload: only the ID need
/// be populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentChange {
    pub assignment: Assignment,
    pub action: AssignmentAction,
}

/// A batch of assignment changes flushed to one agent.
///
/// Ordering of changes within a message is not guaranteed; receivers
/// process additions before their dependents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssignmentsMessage {
    pub changes: Vec<AssignmentChange>,
}
