//! Static-service orchestrator.
//!
//! Static services run exactly one task, scheduled permanently to a
//! node and never moved. This orchestrator maintains that single task
//! per service: it creates missing tasks, queues restarts when a task's
//! status regresses, hands changed tasks to the update supervisor, and
//! cleans up after service and node removal.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info};

use hivegrid_state::{
    By, Cluster, Event, IndexKind, MemoryStore, Service, StoreError, StoreResult, Task, TaskState,
    WatchError, DEFAULT_CLUSTER_NAME,
};

use crate::supervisor::{RestartSupervisor, Slot, UpdateSupervisor};
use crate::task::{ensure_peer_group_config_ref, new_task};

/// Message written to a static service when its pinned node is deleted.
const STATIC_NODE_REMOVED: &str = "Static Node Removed";

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("watch stream error: {0}")]
    Watch(#[from] WatchError),
}

/// Stops a running orchestrator.
///
/// `stop` is idempotent; callers wait for the run future to finish to
/// know the loop has drained.
#[derive(Clone)]
pub struct OrchestratorHandle {
    stop: watch::Sender<bool>,
}

impl OrchestratorHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Reconciliation loop for static services.
///
/// Owns its in-memory indexes exclusively; all shared state lives in
/// the store.
pub struct StaticOrchestrator<R, U> {
    store: MemoryStore,
    /// All tracked static services, indexed by service ID.
    services: HashMap<String, Service>,
    /// Tracked service IDs grouped by their pinned node ID.
    services_by_node_id: HashMap<String, HashSet<String>>,
    /// Tasks queued for restart at the end of the loop iteration.
    restart_tasks: HashSet<String>,
    restarts: Arc<R>,
    updater: Arc<U>,
    /// Local copy of the singleton cluster; refreshed by events.
    cluster: Option<Cluster>,
    shutdown: watch::Receiver<bool>,
}

impl<R: RestartSupervisor, U: UpdateSupervisor> StaticOrchestrator<R, U> {
    pub fn new(store: MemoryStore, restarts: Arc<R>, updater: Arc<U>) -> (Self, OrchestratorHandle) {
        let (stop_tx, stop_rx) = watch::channel(false);
        (
            Self {
                store,
                services: HashMap::new(),
                services_by_node_id: HashMap::new(),
                restart_tasks: HashSet::new(),
                restarts,
                updater,
                cluster: None,
                shutdown: stop_rx,
            },
            OrchestratorHandle { stop: stop_tx },
        )
    }

    /// Run the event loop until stopped.
    ///
    /// A missing cluster at startup is tolerated; the next cluster
    /// event populates it. Store errors inside the loop are logged and
    /// the loop continues.
    pub async fn run(mut self) -> OrchestratorResult<()> {
        // Subscribe before the initial load so no event is missed.
        let mut watcher = self.store.watch_queue().watch();
        let mut shutdown = self.shutdown.clone();

        self.bootstrap()?;
        info!(services = self.services.len(), "static orchestrator started");

        loop {
            tokio::select! {
                event = watcher.next() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(err) => {
                            error!(error = %err, "watch stream terminated");
                            self.updater.cancel_all();
                            self.restarts.cancel_all();
                            return Err(err.into());
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!("static orchestrator stopping");
                    break;
                }
            }
            self.tick_tasks();
        }

        self.updater.cancel_all();
        self.restarts.cancel_all();
        Ok(())
    }

    /// Initial load: cluster, tracked services, task normalization, and
    /// a full reconciliation pass.
    fn bootstrap(&mut self) -> OrchestratorResult<()> {
        self.cluster = self
            .store
            .view(|tx| tx.lookup::<Cluster>(IndexKind::Name, DEFAULT_CLUSTER_NAME))??;

        let existing: Vec<Service> = self.store.view(|tx| tx.find(&By::All))??;
        let mut reconcile_ids = Vec::new();
        for service in existing {
            if is_related_service(&service) {
                reconcile_ids.push(service.id.clone());
                self.track_service(service);
            }
        }

        self.init_tasks()?;
        self.tick_tasks();
        self.reconcile_services(&reconcile_ids);
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::UpdateCluster(cluster) => {
                self.cluster = Some(cluster);
            }
            Event::CreateService(service) | Event::UpdateService(service) => {
                if !is_related_service(&service) {
                    return;
                }
                let service_id = service.id.clone();
                self.track_service(service);
                self.reconcile_services(&[service_id]);
            }
            Event::DeleteService(service) => {
                if !is_related_service(&service) {
                    return;
                }
                self.set_service_tasks_remove(&service);
                self.services.remove(&service.id);
                if let Some(info) = &service.static_info {
                    if let Some(tracked) = self.services_by_node_id.get_mut(&info.node_id) {
                        tracked.remove(&service.id);
                    }
                }
                self.restarts.clear_service_history(&service.id);
            }
            Event::DeleteNode(node) => {
                self.remove_tasks_from_node(&node.id);
                self.mark_node_services_down(&node.id);
            }
            Event::UpdateTask(task) => {
                self.handle_task_change(&task);
            }
            _ => {}
        }
    }

    /// Queue a restart for a tracked task whose status regressed past
    /// `Running` while its desired state is still runnable.
    fn handle_task_change(&mut self, task: &Task) {
        self.fix_task(task);
    }

    fn fix_task(&mut self, task: &Task) {
        if !self.services.contains_key(&task.service_id) {
            return;
        }
        // A desired state past running means the task has already been
        // processed.
        if task.desired_state > TaskState::Running {
            return;
        }
        if task.status.state > TaskState::Running {
            self.restart_tasks.insert(task.id.clone());
        }
    }

    /// Normalize pre-existing tasks before the first reconciliation.
    fn init_tasks(&mut self) -> StoreResult<()> {
        let tasks: Vec<Task> = self.store.view(|tx| tx.find(&By::All))??;
        for task in &tasks {
            self.fix_task(task);
        }
        Ok(())
    }

    /// Run the queued restarts, each under a fresh sub-transaction, and
    /// clear the queue. Runs at the end of every loop iteration.
    fn tick_tasks(&mut self) {
        if self.restart_tasks.is_empty() {
            return;
        }
        let restart_tasks = std::mem::take(&mut self.restart_tasks);
        let result = self.store.batch(|batch| {
            for task_id in &restart_tasks {
                let result = batch.update(|tx| {
                    // The task must still exist and not yet be complete.
                    let Some(task) = tx.get::<Task>(task_id)? else {
                        return Ok(());
                    };
                    if task.desired_state > TaskState::Running {
                        return Ok(());
                    }
                    let Some(service) = tx.get::<Service>(&task.service_id)? else {
                        return Ok(());
                    };
                    self.restarts
                        .restart(tx, self.cluster.as_ref(), &service, task)
                });
                if let Err(err) = result {
                    error!(%task_id, error = %err, "restart transaction failed");
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(error = %err, "restart batch failed");
        }
    }

    /// Bring each named service to its desired shape: create the task
    /// if none exists, otherwise queue updatable tasks for the update
    /// supervisor.
    fn reconcile_services(&mut self, service_ids: &[String]) {
        let mut update_tasks_by_service: HashMap<String, Slot> = HashMap::new();
        let mut needs_tasks: Vec<Service> = Vec::new();

        let view_result = self.store.view(|tx| {
            for service_id in service_ids {
                let Some(service) = self.services.get(service_id) else {
                    continue;
                };

                // These tasks are all on the same pinned node.
                let tasks: Vec<Task> = match tx.find(&By::ServiceId(service_id.clone())) {
                    Ok(tasks) => tasks,
                    Err(err) => {
                        error!(%service_id, error = %err, "reconciliation failed finding tasks");
                        continue;
                    }
                };

                if tasks.is_empty() {
                    needs_tasks.push(service.clone());
                    continue;
                }

                let updatable = self.restarts.updatable_tasks_in_slot(&tasks, service);
                if !updatable.is_empty() {
                    update_tasks_by_service.insert(service_id.clone(), updatable);
                }
            }
        });
        if let Err(err) = view_result {
            error!(error = %err, "reconciliation view failed");
            return;
        }

        let batch_result = self.store.batch(|batch| {
            for service in &needs_tasks {
                let Some(node_id) = service.static_info.as_ref().map(|info| info.node_id.clone())
                else {
                    continue;
                };
                self.add_task(batch, service, &node_id);
            }
            Ok(())
        });
        if let Err(err) = batch_result {
            error!(error = %err, "reconciliation transaction failed");
        }

        for (service_id, slot) in update_tasks_by_service {
            if let Some(service) = self.services.get(&service_id) {
                self.updater.update(self.cluster.as_ref(), service, vec![slot]);
            }
        }
    }

    fn add_task(&self, batch: &mut hivegrid_state::Batch<'_>, service: &Service, node_id: &str) {
        let mut task = new_task(self.cluster.as_ref(), service, 0, node_id);
        // The orchestrator is the authoritative source of the
        // materialized peer-group reference.
        ensure_peer_group_config_ref(&mut task);

        let result = batch.update(|tx| {
            if tx.get::<Service>(&service.id)?.is_none() {
                return Ok(());
            }
            tx.create(&task)
        });
        if let Err(err) = result {
            error!(service_id = %service.id, error = %err, "failed to create task");
        }
    }

    /// Mark every task of a deleted service for removal.
    fn set_service_tasks_remove(&self, service: &Service) {
        let tasks: Vec<Task> = match self.find_tasks(By::ServiceId(service.id.clone())) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(service_id = %service.id, error = %err, "failed to find tasks for removed service");
                return;
            }
        };
        let result = self.store.batch(|batch| {
            for task in &tasks {
                let result = batch.update(|tx| {
                    let Some(mut task) = tx.get::<Task>(&task.id)? else {
                        return Ok(());
                    };
                    task.desired_state = TaskState::Remove;
                    tx.update(&task)
                });
                if let Err(err) = result {
                    error!(task_id = %task.id, error = %err, "failed to mark task for removal");
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(service_id = %service.id, error = %err, "failed to mark service tasks for removal");
        }
    }

    /// Delete every tracked task still bound to the removed node.
    fn remove_tasks_from_node(&self, node_id: &str) {
        let tasks: Vec<Task> = match self.find_tasks(By::NodeId(node_id.to_string())) {
            Ok(tasks) => tasks,
            Err(err) => {
                error!(%node_id, error = %err, "failed to find tasks on removed node");
                return;
            }
        };
        let result = self.store.batch(|batch| {
            for task in &tasks {
                // Only tasks of tracked static services are ours to remove.
                if !self.services.contains_key(&task.service_id) {
                    continue;
                }
                if let Err(err) = batch.update(|tx| tx.delete::<Task>(&task.id)) {
                    error!(task_id = %task.id, error = %err, "failed to delete task");
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(%node_id, error = %err, "failed to delete tasks on removed node");
        }
    }

    /// Mark static services pinned to a deleted node as permanently
    /// down.
    fn mark_node_services_down(&self, node_id: &str) {
        let Some(service_ids) = self.services_by_node_id.get(node_id) else {
            return;
        };
        let service_ids: Vec<String> = service_ids.iter().cloned().collect();
        let result = self.store.update(|tx| {
            for service_id in &service_ids {
                let Some(mut service) = tx.get::<Service>(service_id)? else {
                    continue;
                };
                service
                    .static_info
                    .get_or_insert_with(Default::default)
                    .message = STATIC_NODE_REMOVED.to_string();
                if let Err(err) = tx.update(&service) {
                    error!(
                        %service_id,
                        %node_id,
                        error = %err,
                        "unable to update static service message after node deletion"
                    );
                }
            }
            Ok(())
        });
        if let Err(err) = result {
            error!(%node_id, error = %err, "unable to update static service messages after node deletion");
        }
    }

    fn track_service(&mut self, service: Service) {
        if let Some(info) = &service.static_info {
            if !info.node_id.is_empty() {
                self.services_by_node_id
                    .entry(info.node_id.clone())
                    .or_default()
                    .insert(service.id.clone());
            }
        }
        debug!(service_id = %service.id, "tracking static service");
        self.services.insert(service.id.clone(), service);
    }

    fn find_tasks(&self, by: By) -> StoreResult<Vec<Task>> {
        self.store.view(|tx| tx.find(&by))?
    }
}

/// True if the service should be governed by this orchestrator: static
/// services which have been assigned a node ID by the scheduler.
pub fn is_related_service(service: &Service) -> bool {
    service.is_static()
        && service
            .static_info
            .as_ref()
            .is_some_and(|info| !info.node_id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use hivegrid_state::{
        Annotations, ClusterSpec, Node, NodeState, NodeStatus, ServiceMode, ServiceSpec,
        StaticInfo, StaticService, StoreResult, TaskStatus, Version, WriteTx,
    };

    #[derive(Default)]
    struct RecordingRestarts {
        restarted: Mutex<Vec<String>>,
        cleared: Mutex<Vec<String>>,
        cancelled: AtomicBool,
    }

    impl RestartSupervisor for RecordingRestarts {
        fn restart(
            &self,
            _tx: &mut WriteTx,
            _cluster: Option<&Cluster>,
            _service: &Service,
            task: Task,
        ) -> StoreResult<()> {
            self.restarted.lock().unwrap().push(task.id);
            Ok(())
        }

        fn updatable_tasks_in_slot(&self, tasks: &[Task], _service: &Service) -> Slot {
            tasks
                .iter()
                .filter(|task| task.desired_state <= TaskState::Running)
                .cloned()
                .collect()
        }

        fn clear_service_history(&self, service_id: &str) {
            self.cleared.lock().unwrap().push(service_id.to_string());
        }

        fn cancel_all(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingUpdater {
        updated: Mutex<Vec<(String, usize)>>,
        cancelled: AtomicBool,
    }

    impl UpdateSupervisor for RecordingUpdater {
        fn update(&self, _cluster: Option<&Cluster>, service: &Service, slots: Vec<Slot>) {
            self.updated
                .lock()
                .unwrap()
                .push((service.id.clone(), slots.len()));
        }

        fn cancel_all(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        store: MemoryStore,
        restarts: Arc<RecordingRestarts>,
        updater: Arc<RecordingUpdater>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: MemoryStore::open_in_memory().unwrap(),
                restarts: Arc::new(RecordingRestarts::default()),
                updater: Arc::new(RecordingUpdater::default()),
            }
        }

        fn orchestrator(
            &self,
        ) -> (
            StaticOrchestrator<RecordingRestarts, RecordingUpdater>,
            OrchestratorHandle,
        ) {
            StaticOrchestrator::new(
                self.store.clone(),
                self.restarts.clone(),
                self.updater.clone(),
            )
        }
    }

    fn up_node(id: &str) -> Node {
        Node {
            id: id.to_string(),
            status: NodeStatus {
                state: NodeState::Ready,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn static_service(id: &str, name: &str, peer_group: &str, node_id: &str) -> Service {
        Service {
            id: id.to_string(),
            spec: ServiceSpec {
                annotations: Annotations {
                    name: name.to_string(),
                    ..Default::default()
                },
                mode: ServiceMode::Static(StaticService {
                    peer_group: peer_group.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            spec_version: Some(Version { index: 1 }),
            static_info: Some(StaticInfo {
                node_id: node_id.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn service_tasks(store: &MemoryStore, service_id: &str) -> Vec<Task> {
        store
            .view(|tx| tx.find(&By::ServiceId(service_id.to_string())))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn related_service_needs_static_mode_and_node() {
        let mut service = static_service("s1", "a", "g1", "n1");
        assert!(is_related_service(&service));

        service.static_info.as_mut().unwrap().node_id.clear();
        assert!(!is_related_service(&service));

        let mut replicated = static_service("s2", "b", "g1", "n1");
        replicated.spec.mode = ServiceMode::Replicated { replicas: 1 };
        assert!(!is_related_service(&replicated));
    }

    #[test]
    fn bootstrap_creates_task_for_static_service() {
        let fixture = Fixture::new();
        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&static_service("s1", "alpha", "g1", "n1"))
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        let tasks = service_tasks(&fixture.store, "s1");
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task.service_id, "s1");
        assert_eq!(task.node_id, "n1");
        assert_eq!(task.slot, 0);
        assert_eq!(task.desired_state, TaskState::Running);
        assert_eq!(task.materialized_configs.len(), 1);
        assert_eq!(
            task.materialized_configs[0].config_id,
            format!("{}-peer-group", task.id)
        );
    }

    #[test]
    fn bootstrap_ignores_unpinned_and_replicated_services() {
        let fixture = Fixture::new();
        let mut unpinned = static_service("s1", "a", "g1", "");
        unpinned.static_info.as_mut().unwrap().node_id.clear();
        let mut replicated = static_service("s2", "b", "g1", "n1");
        replicated.spec.mode = ServiceMode::Replicated { replicas: 1 };
        fixture
            .store
            .update(|tx| {
                tx.create(&unpinned)?;
                tx.create(&replicated)
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        assert!(service_tasks(&fixture.store, "s1").is_empty());
        assert!(service_tasks(&fixture.store, "s2").is_empty());
    }

    #[test]
    fn bootstrap_tolerates_missing_cluster() {
        let fixture = Fixture::new();
        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();
        assert!(orchestrator.cluster.is_none());

        // The next cluster event populates it.
        let cluster = Cluster {
            id: "c1".to_string(),
            spec: ClusterSpec {
                annotations: Annotations {
                    name: DEFAULT_CLUSTER_NAME.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        };
        orchestrator.handle_event(Event::UpdateCluster(cluster));
        assert!(orchestrator.cluster.is_some());
    }

    #[test]
    fn create_service_event_creates_task() {
        let fixture = Fixture::new();
        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        let service = static_service("s1", "alpha", "g1", "n1");
        fixture.store.update(|tx| tx.create(&service)).unwrap();
        orchestrator.handle_event(Event::CreateService(service));

        assert_eq!(service_tasks(&fixture.store, "s1").len(), 1);
    }

    #[test]
    fn update_service_event_routes_existing_task_to_updater() {
        let fixture = Fixture::new();
        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&static_service("s1", "alpha", "g1", "n1"))
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();
        assert_eq!(service_tasks(&fixture.store, "s1").len(), 1);

        let mut updated = static_service("s1", "alpha", "g1", "n1");
        updated.spec_version = Some(Version { index: 2 });
        fixture.store.update(|tx| tx.update(&updated)).unwrap();
        orchestrator.handle_event(Event::UpdateService(updated));

        let updates = fixture.updater.updated.lock().unwrap();
        assert_eq!(updates.as_slice(), &[("s1".to_string(), 1)]);
        // No second task was created.
        assert_eq!(service_tasks(&fixture.store, "s1").len(), 1);
    }

    #[test]
    fn delete_service_event_marks_tasks_for_removal() {
        let fixture = Fixture::new();
        let service = static_service("s1", "alpha", "g1", "n1");
        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&service)
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        fixture.store.update(|tx| tx.delete::<Service>("s1")).unwrap();
        orchestrator.handle_event(Event::DeleteService(service));

        let tasks = service_tasks(&fixture.store, "s1");
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].desired_state, TaskState::Remove);
        assert!(orchestrator.services.is_empty());
        assert_eq!(
            fixture.restarts.cleared.lock().unwrap().as_slice(),
            &["s1".to_string()]
        );
    }

    #[test]
    fn delete_node_event_removes_tasks_and_marks_services() {
        let fixture = Fixture::new();
        let node = up_node("n1");
        fixture
            .store
            .update(|tx| {
                tx.create(&node)?;
                tx.create(&static_service("s1", "alpha", "g1", "n1"))
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();
        assert_eq!(service_tasks(&fixture.store, "s1").len(), 1);

        fixture.store.update(|tx| tx.delete::<Node>("n1")).unwrap();
        orchestrator.handle_event(Event::DeleteNode(node));

        assert!(service_tasks(&fixture.store, "s1").is_empty());
        let service: Service = fixture
            .store
            .view(|tx| tx.get("s1"))
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(service.static_info.unwrap().message, "Static Node Removed");
    }

    #[test]
    fn status_regression_queues_and_runs_restart_once() {
        let fixture = Fixture::new();
        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&static_service("s1", "alpha", "g1", "n1"))
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        let mut task = service_tasks(&fixture.store, "s1").remove(0);
        task.status = TaskStatus {
            state: TaskState::Failed,
            ..Default::default()
        };
        fixture.store.update(|tx| tx.update(&task)).unwrap();

        orchestrator.handle_event(Event::UpdateTask(task.clone()));
        assert!(orchestrator.restart_tasks.contains(&task.id));

        orchestrator.tick_tasks();
        assert_eq!(
            fixture.restarts.restarted.lock().unwrap().as_slice(),
            &[task.id.clone()]
        );
        assert!(orchestrator.restart_tasks.is_empty());

        // A second tick does nothing.
        orchestrator.tick_tasks();
        assert_eq!(fixture.restarts.restarted.lock().unwrap().len(), 1);
    }

    #[test]
    fn processed_tasks_are_not_restarted() {
        let fixture = Fixture::new();
        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&static_service("s1", "alpha", "g1", "n1"))
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        let mut task = service_tasks(&fixture.store, "s1").remove(0);
        task.desired_state = TaskState::Shutdown;
        task.status = TaskStatus {
            state: TaskState::Failed,
            ..Default::default()
        };
        fixture.store.update(|tx| tx.update(&task)).unwrap();

        orchestrator.handle_event(Event::UpdateTask(task));
        assert!(orchestrator.restart_tasks.is_empty());
    }

    #[test]
    fn init_tasks_queues_failed_preexisting_tasks() {
        let fixture = Fixture::new();
        let service = static_service("s1", "alpha", "g1", "n1");
        let mut failed = new_task(None, &service, 0, "n1");
        failed.status.state = TaskState::Failed;
        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&service)?;
                tx.create(&failed)
            })
            .unwrap();

        let (mut orchestrator, _handle) = fixture.orchestrator();
        orchestrator.bootstrap().unwrap();

        // The bootstrap tick already drained the queue.
        assert_eq!(fixture.restarts.restarted.lock().unwrap().len(), 1);
        assert!(orchestrator.restart_tasks.is_empty());
    }

    #[tokio::test]
    async fn run_loop_reconciles_and_stops_cleanly() {
        let fixture = Fixture::new();
        let (orchestrator, handle) = fixture.orchestrator();
        let join = tokio::spawn(orchestrator.run());

        fixture
            .store
            .update(|tx| {
                tx.create(&up_node("n1"))?;
                tx.create(&static_service("s1", "alpha", "g1", "n1"))
            })
            .unwrap();

        // Wait for the loop to materialize the task.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if !service_tasks(&fixture.store, "s1").is_empty() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task was not created in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.stop();
        handle.stop(); // Stop is idempotent.
        join.await.unwrap().unwrap();
        assert!(fixture.restarts.cancelled.load(Ordering::SeqCst));
        assert!(fixture.updater.cancelled.load(Ordering::SeqCst));
    }
}
