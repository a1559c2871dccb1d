//! Contracts for the restart and update supervisors.
//!
//! The supervisors own restart back-off history and rolling-update
//! pacing; orchestrators drive them through these traits.

use hivegrid_state::{Cluster, Service, StoreResult, Task, WriteTx};

/// Tasks occupying one slot of a service.
pub type Slot = Vec<Task>;

/// Restarts failed tasks, subject to the service's restart policy.
pub trait RestartSupervisor: Send + Sync {
    /// Restart the given task under the supplied transaction.
    fn restart(
        &self,
        tx: &mut WriteTx,
        cluster: Option<&Cluster>,
        service: &Service,
        task: Task,
    ) -> StoreResult<()>;

    /// The subset of the slot's tasks that are runnable, plus tasks the
    /// restart policy suppressed but that may still be updated when the
    /// service spec changes.
    fn updatable_tasks_in_slot(&self, tasks: &[Task], service: &Service) -> Slot;

    /// Forget restart history for a removed service.
    fn clear_service_history(&self, service_id: &str);

    /// Cancel all pending delayed restarts.
    fn cancel_all(&self);
}

/// Rolls slots forward to a service's current spec.
pub trait UpdateSupervisor: Send + Sync {
    /// Schedule the given slots to be updated to the service's spec.
    fn update(&self, cluster: Option<&Cluster>, service: &Service, slots: Vec<Slot>);

    /// Cancel all in-flight updates.
    fn cancel_all(&self);
}
