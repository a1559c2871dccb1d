//! Task construction and dirtiness rules.
//!
//! Pure helpers shared by every orchestrator: building a task from its
//! owning service, deriving synthesized config references, and deciding
//! whether an existing task still matches its service's spec.

use std::cmp::Ordering;
use std::path::Path;

use hivegrid_state::identity;
use hivegrid_state::{
    Cluster, ConfigReference, Driver, Endpoint, FileTarget, Node, NodeAvailability, NodeState,
    RestartCondition, Service, Task, TaskSpec, TaskState, TaskStatus, Timestamp,
};

use crate::constraint;

/// Create a new task for one slot of a service.
///
/// The task copies the service's task spec, annotations, and spec
/// version; starts in `New` with `DesiredState::Running`; and derives
/// its log driver from the service or the cluster default. Static
/// services additionally get a peer-group config reference, and any
/// certificate issuances get their config references.
pub fn new_task(cluster: Option<&Cluster>, service: &Service, slot: u64, node_id: &str) -> Task {
    let log_driver: Option<Driver> = if service.spec.task.log_driver.is_some() {
        // Use the log driver specific to the task, if we have it.
        service.spec.task.log_driver.clone()
    } else {
        cluster.and_then(|c| c.spec.task_defaults.log_driver.clone())
    };

    let mut task = Task {
        id: identity::new_id(),
        service_annotations: service.spec.annotations.clone(),
        spec: service.spec.task.clone(),
        spec_version: service.spec_version,
        service_id: service.id.clone(),
        slot,
        status: TaskStatus {
            state: TaskState::New,
            timestamp: Some(Timestamp::now()),
            message: "created".to_string(),
            ..Default::default()
        },
        endpoint: Some(Endpoint {
            spec: service.spec.endpoint.clone().unwrap_or_default(),
            ..Default::default()
        }),
        desired_state: TaskState::Running,
        log_driver,
        ..Default::default()
    };

    if !node_id.is_empty() {
        task.node_id = node_id.to_string();
    }

    if service.static_info.is_some() {
        task.materialized_configs.push(peer_group_config_ref(&task));
    }

    let issuance_refs = certificate_issuance_config_refs(&task);
    task.materialized_configs.extend(issuance_refs);

    task
}

/// The config reference for a static service's materialized peer-group
/// file.
pub fn peer_group_config_ref(task: &Task) -> ConfigReference {
    ConfigReference {
        config_id: format!("{}-peer-group", task.id),
        config_name: "peer-group".to_string(),
        file: FileTarget {
            name: "/run/peers".to_string(),
            mode: 0o444,
            uid: "0".to_string(),
            gid: "0".to_string(),
        },
    }
}

/// Ensure the peer-group config reference is present exactly once.
pub fn ensure_peer_group_config_ref(task: &mut Task) {
    let reference = peer_group_config_ref(task);
    if !task
        .materialized_configs
        .iter()
        .any(|existing| existing.config_id == reference.config_id)
    {
        task.materialized_configs.push(reference);
    }
}

/// Config references for every certificate issuance the task requests:
/// three files (ca.pem, key.pem, cert.pem) per issuance, rooted at the
/// issuance directory.
pub fn certificate_issuance_config_refs(task: &Task) -> Vec<ConfigReference> {
    let Some(container) = task.spec.container() else {
        return Vec::new();
    };

    let mut refs = Vec::with_capacity(3 * container.certificate_issuances.len());
    for issuance in &container.certificate_issuances {
        let ca_id = &issuance.certificate_authority_id;
        for (suffix, file_name) in [("ca", "ca.pem"), ("key", "key.pem"), ("cert", "cert.pem")] {
            let config_id = format!("{}-{}-issue-{}", task.id, ca_id, suffix);
            refs.push(ConfigReference {
                config_id: config_id.clone(),
                config_name: config_id,
                file: file_in_dir(&issuance.directory, file_name),
            });
        }
    }
    refs
}

fn file_in_dir(dir: &FileTarget, file_name: &str) -> FileTarget {
    let mut target = dir.clone();
    target.name = Path::new(&dir.name)
        .join(file_name)
        .to_string_lossy()
        .into_owned();
    target
}

/// The restart condition that applies to this task.
pub fn restart_condition(task: &Task) -> RestartCondition {
    task.spec
        .restart
        .as_ref()
        .map(|policy| policy.condition)
        .unwrap_or_default()
}

/// Whether a task no longer matches its service's spec and must be
/// replaced.
///
/// Returns false if the spec version didn't change, if only the
/// placement constraints changed and the assigned node satisfies the
/// new constraints, or if the service task spec and endpoint spec
/// didn't change at all. For tasks with a container runtime whose
/// current state is between `Ready` and `Running` inclusive, a
/// difference in `PullOptions` alone does not make the task dirty: the
/// image is already pulled (or wasn't needed).
pub fn is_task_dirty(service: &Service, task: &Task, node: Option<&Node>) -> bool {
    // A matching spec version means the task is current. A mismatch
    // does not by itself mean dirty, since only part of the spec is
    // compared below.
    if let (Some(service_version), Some(task_version)) = (&service.spec_version, &task.spec_version)
    {
        if service_version == task_version {
            return false;
        }
    }

    let mut service_task_spec = service.spec.task.clone();

    if is_task_dirty_placement_constraints_only(&service_task_spec, task)
        && node_satisfies_service_constraints(service, node)
    {
        return false;
    }

    let current_state = task.status.state;
    let ignore_pull_options = task.desired_state <= TaskState::Running
        && current_state >= TaskState::Ready
        && current_state <= TaskState::Running;
    if ignore_pull_options {
        if let (Some(service_container), Some(task_container)) =
            (service_task_spec.container_mut(), task.spec.container())
        {
            service_container.pull_options = task_container.pull_options.clone();
        }
    }

    if service_task_spec != task.spec {
        return true;
    }
    match &task.endpoint {
        Some(endpoint) => service.spec.endpoint.clone().unwrap_or_default() != endpoint.spec,
        None => false,
    }
}

/// Whether the placement field alone differs between the service's task
/// spec and the task's spec.
pub fn is_task_dirty_placement_constraints_only(service_task_spec: &TaskSpec, task: &Task) -> bool {
    if service_task_spec.placement == task.spec.placement {
        return false;
    }
    let mut probe = service_task_spec.clone();
    probe.placement = task.spec.placement.clone();
    probe == task.spec
}

fn node_satisfies_service_constraints(service: &Service, node: Option<&Node>) -> bool {
    let Some(node) = node else {
        return false;
    };
    let constraints =
        constraint::parse(&service.spec.task.placement.constraints).unwrap_or_default();
    constraint::node_matches(&constraints, node)
}

/// True if the node is absent, down, or drained.
pub fn invalid_node(node: Option<&Node>) -> bool {
    match node {
        None => true,
        Some(node) => {
            node.status.state == NodeState::Down
                || node.spec.availability == NodeAvailability::Drain
        }
    }
}

/// Order tasks by their applied timestamp when set, otherwise their
/// status timestamp; a missing timestamp compares less.
pub fn compare_tasks_by_timestamp(a: &Task, b: &Task) -> Ordering {
    let a_time = a.status.applied_at.or(a.status.timestamp);
    let b_time = b.status.applied_at.or(b.status.timestamp);
    match (a_time, b_time) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a_time), Some(b_time)) => a_time.cmp(&b_time),
    }
}
