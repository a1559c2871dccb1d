//! hivegrid-orchestrator — task model and static-service orchestrator.
//!
//! The task model (`task`, `constraint`) is pure: building tasks from
//! services, synthesized config references, placement matching, and the
//! dirtiness rules that decide when a task must be replaced.
//!
//! The static orchestrator is an event-driven reconciler: it consumes
//! the store's watch queue and maintains exactly one task per static
//! service on its pinned node, delegating restart pacing and rolling
//! updates to the supervisor contracts in `supervisor`.

pub mod constraint;
pub mod static_orchestrator;
pub mod supervisor;
pub mod task;

pub use static_orchestrator::{
    is_related_service, OrchestratorError, OrchestratorHandle, OrchestratorResult,
    StaticOrchestrator,
};
pub use supervisor::{RestartSupervisor, Slot, UpdateSupervisor};
pub use task::{
    certificate_issuance_config_refs, compare_tasks_by_timestamp, ensure_peer_group_config_ref,
    invalid_node, is_task_dirty, is_task_dirty_placement_constraints_only, new_task,
    peer_group_config_ref, restart_condition,
};
