//! The per-node assignment set.
//!
//! Tracks which tasks a node holds, ref-counts the dependencies those
//! tasks pin (secrets, configs, materialized payloads), and accumulates
//! the pending delta to flush as one `AssignmentsMessage`. Dependency
//! failures are isolated: a missing or invalid dependency is logged and
//! omitted, and the agent simply won't start the task until a later
//! event re-drives the assignment.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, warn};

use hivegrid_state::{
    By, CertificateIssuance, Config, ConfigSpec, ReadTx, ResourceType, Secret, Service, StoreError,
    Task, TaskState, TaskStatus,
};

use crate::drivers::{validate_secret_payload, DriverError, DriverProvider};
use crate::issuance;
use crate::message::{Assignment, AssignmentAction, AssignmentChange, AssignmentsMessage};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DependencyKey {
    kind: ResourceType,
    id: String,
}

impl DependencyKey {
    fn secret(id: &str) -> Self {
        Self {
            kind: ResourceType::Secret,
            id: id.to_string(),
        }
    }

    fn config(id: &str) -> Self {
        Self {
            kind: ResourceType::Config,
            id: id.to_string(),
        }
    }

    fn task(id: &str) -> Self {
        Self {
            kind: ResourceType::Task,
            id: id.to_string(),
        }
    }
}

#[derive(Debug, Error)]
enum FetchError {
    #[error("secret not found")]
    NotFound,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Structural task equality that ignores the (agent-reported) status.
fn tasks_equal_stable(a: &Task, b: &Task) -> bool {
    let mut a = a.clone();
    let mut b = b.clone();
    a.status = TaskStatus::default();
    b.status = TaskStatus::default();
    a == b
}

/// The materialized peer-group file body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerGroupConfig {
    self_name: String,
    self_addr: String,
    peers: BTreeMap<String, String>,
}

/// Per-node assignment state, owned by one dispatcher session.
pub struct AssignmentSet {
    provider: Arc<DriverProvider>,
    /// Tasks currently considered assigned to this node.
    tasks_map: HashMap<String, Task>,
    /// Reverse index: which tasks pin a given dependency.
    tasks_using_dependency: HashMap<DependencyKey, HashSet<String>>,
    /// The pending delta, flushed by `message()`.
    changes: HashMap<DependencyKey, AssignmentChange>,
}

impl AssignmentSet {
    pub fn new(provider: Arc<DriverProvider>) -> Self {
        Self {
            provider,
            tasks_map: HashMap::new(),
            tasks_using_dependency: HashMap::new(),
            changes: HashMap::new(),
        }
    }

    /// Admit or refresh a task. Returns whether the pending delta
    /// changed.
    ///
    /// Only tasks at `Assigned` or beyond are admitted. A stable update
    /// of a known task past `Assigned` is absorbed without a task
    /// change; if it crosses past `Running` the task's dependencies are
    /// released. Tasks first seen above `Running` get no dependencies:
    /// those states are worker-reported only.
    pub fn add_or_update_task(&mut self, tx: &ReadTx, task: Task) -> bool {
        if task.status.state < TaskState::Assigned {
            return false;
        }

        if let Some(old_task) = self.tasks_map.get(&task.id) {
            // States at or below ASSIGNED are set by the control plane,
            // not the agent, so those still need to reach the agent even
            // when nothing else changed.
            if tasks_equal_stable(old_task, &task) && task.status.state > TaskState::Assigned {
                let released = if task.status.state > TaskState::Running {
                    self.release_task_dependencies(&task)
                } else {
                    false
                };
                self.tasks_map.insert(task.id.clone(), task);
                return released;
            }
        } else if task.status.state <= TaskState::Running {
            self.add_task_dependencies(tx, &task);
        }

        self.changes.insert(
            DependencyKey::task(&task.id),
            AssignmentChange {
                assignment: Assignment::Task(task.clone()),
                action: AssignmentAction::Update,
            },
        );
        self.tasks_map.insert(task.id.clone(), task);
        true
    }

    /// Drop a task and release its dependencies. The task's remove
    /// change carries a minimal id-only payload.
    pub fn remove_task(&mut self, task: &Task) -> bool {
        if !self.tasks_map.contains_key(&task.id) {
            return false;
        }

        self.changes.insert(
            DependencyKey::task(&task.id),
            AssignmentChange {
                assignment: Assignment::Task(Task {
                    id: task.id.clone(),
                    ..Default::default()
                }),
                action: AssignmentAction::Remove,
            },
        );
        self.tasks_map.remove(&task.id);

        // A task went away; this is always a modification regardless of
        // whether any dependency was released.
        self.release_task_dependencies(task);
        true
    }

    /// Collect the pending delta as one message and reset it.
    pub fn message(&mut self) -> AssignmentsMessage {
        let changes = std::mem::take(&mut self.changes).into_values().collect();
        AssignmentsMessage { changes }
    }

    // ── Dependency addition ────────────────────────────────────────

    fn dependency_unused(&self, key: &DependencyKey) -> bool {
        self.tasks_using_dependency
            .get(key)
            .map_or(true, |tasks| tasks.is_empty())
    }

    fn add_task_dependencies(&mut self, tx: &ReadTx, task: &Task) {
        for reference in &task.spec.resource_references {
            let key = DependencyKey {
                kind: reference.resource_type,
                id: reference.resource_id.clone(),
            };
            match reference.resource_type {
                ResourceType::Secret => {
                    if self.dependency_unused(&key) {
                        self.assign_secret(tx, &key, task);
                    }
                }
                ResourceType::Config => {
                    if self.dependency_unused(&key) {
                        self.assign_config(tx, &key);
                    }
                }
                ResourceType::Task => {
                    debug!(
                        resource_id = %reference.resource_id,
                        "invalid resource type for a task dependency, skipping"
                    );
                    continue;
                }
            }
            self.tasks_using_dependency
                .entry(key)
                .or_default()
                .insert(task.id.clone());
        }

        let container = task.spec.container();

        for secret_ref in container.map(|c| c.secrets.as_slice()).unwrap_or_default() {
            let key = DependencyKey::secret(&secret_ref.secret_id);
            if self.dependency_unused(&key) {
                self.assign_secret(tx, &key, task);
            }
            self.tasks_using_dependency
                .entry(key)
                .or_default()
                .insert(task.id.clone());
        }

        for config_ref in container.map(|c| c.configs.as_slice()).unwrap_or_default() {
            let key = DependencyKey::config(&config_ref.config_id);
            if self.dependency_unused(&key) {
                self.assign_config(tx, &key);
            }
            self.tasks_using_dependency
                .entry(key)
                .or_default()
                .insert(task.id.clone());
        }

        if let Some(container) = container {
            if !container.certificate_issuances.is_empty() {
                let hosts = self.task_cert_hosts(tx, task);
                for cert_issuance in &container.certificate_issuances {
                    self.add_cert_issuance_dependencies(tx, task, cert_issuance, &hosts);
                }
            }
        }

        self.maybe_add_static_service_dependencies(tx, task);
    }

    fn assign_secret(&mut self, tx: &ReadTx, key: &DependencyKey, task: &Task) {
        self.tasks_using_dependency.entry(key.clone()).or_default();
        let secret = match self.secret(tx, task, &key.id) {
            Ok(secret) => secret,
            Err(err) => {
                debug!(secret_id = %key.id, error = %err, "failed to fetch secret");
                return;
            }
        };
        self.changes.insert(
            key.clone(),
            AssignmentChange {
                assignment: Assignment::Secret(secret),
                action: AssignmentAction::Update,
            },
        );
    }

    fn assign_config(&mut self, tx: &ReadTx, key: &DependencyKey) {
        self.tasks_using_dependency.entry(key.clone()).or_default();
        let config: Config = match tx.get(&key.id) {
            Ok(Some(config)) => config,
            Ok(None) => {
                debug!(config_id = %key.id, "config not found");
                return;
            }
            Err(err) => {
                debug!(config_id = %key.id, error = %err, "failed to fetch config");
                return;
            }
        };
        self.changes.insert(
            key.clone(),
            AssignmentChange {
                assignment: Assignment::Config(config),
                action: AssignmentAction::Update,
            },
        );
    }

    /// Fetch a secret's payload from the store, or from its driver for
    /// externally-managed secrets.
    fn secret(&self, tx: &ReadTx, task: &Task, secret_id: &str) -> Result<Secret, FetchError> {
        let mut secret: Secret = tx.get(secret_id)?.ok_or(FetchError::NotFound)?;
        let Some(driver_ref) = secret.spec.driver.clone() else {
            return Ok(secret);
        };
        let driver = self.provider.new_secret_driver(&driver_ref)?;
        let value = driver.get(&secret.spec, task)?;
        validate_secret_payload(&value)?;
        secret.spec.data = value;
        Ok(secret)
    }

    // ── Peer-group synthesis ───────────────────────────────────────

    /// Strip the CIDR suffix from an address, e.g. `10.0.0.4/24` →
    /// `10.0.0.4`. Unparsable addresses are returned unchanged.
    fn de_cidr(&self, address: &str) -> String {
        if let Some((ip, _)) = address.split_once('/') {
            if ip.parse::<std::net::IpAddr>().is_ok() {
                return ip.to_string();
            }
        }
        warn!(%address, "unable to parse CIDR address");
        address.to_string()
    }

    /// Emit the materialized peer-group config for tasks of static
    /// services: the service's own name and address plus every peer in
    /// the same group.
    fn maybe_add_static_service_dependencies(&mut self, tx: &ReadTx, task: &Task) {
        if task.service_id.is_empty() {
            return;
        }

        let service: Service = match tx.get(&task.service_id) {
            Ok(Some(service)) => service,
            Ok(None) => return,
            Err(err) => {
                error!(service_id = %task.service_id, error = %err, "failed to fetch service");
                return;
            }
        };
        let Some(static_mode) = service.static_mode() else {
            return;
        };

        let peer_group = static_mode.peer_group.clone();
        let peer_services: Vec<Service> = match tx.find(&By::PeerGroup(peer_group.clone())) {
            Ok(services) => services,
            Err(err) => {
                error!(%peer_group, error = %err, "unable to find services by peer group");
                return;
            }
        };

        let Some(self_address) = service
            .static_info
            .as_ref()
            .and_then(|info| info.network_attachment.as_ref())
            .and_then(|attachment| attachment.addresses.first())
        else {
            warn!(
                service_id = %service.id,
                "static service has no allocated address, skipping peer-group config"
            );
            return;
        };

        // Maps peer service name to its static IP.
        let mut peers = BTreeMap::new();
        for peer_service in &peer_services {
            if peer_service.id == service.id {
                continue;
            }
            let Some(peer_address) = peer_service
                .static_info
                .as_ref()
                .and_then(|info| info.network_attachment.as_ref())
                .and_then(|attachment| attachment.addresses.first())
            else {
                debug!(peer_id = %peer_service.id, "peer has no allocated address, skipping");
                continue;
            };
            peers.insert(
                peer_service.spec.annotations.name.clone(),
                self.de_cidr(peer_address),
            );
        }

        let config_body = PeerGroupConfig {
            self_name: service.spec.annotations.name.clone(),
            self_addr: self.de_cidr(self_address),
            peers,
        };
        let data = match serde_json::to_vec_pretty(&config_body) {
            Ok(data) => data,
            Err(err) => {
                error!(service_id = %service.id, error = %err, "failed to encode peer-group config");
                return;
            }
        };

        // The peer group may change, so each task gets a unique config id.
        let config_id = format!("{}-peer-group", task.id);
        let key = DependencyKey::config(&config_id);
        if self.dependency_unused(&key) {
            self.tasks_using_dependency.entry(key.clone()).or_default();
            self.changes.insert(
                key.clone(),
                AssignmentChange {
                    assignment: Assignment::Config(Config {
                        id: config_id,
                        spec: ConfigSpec {
                            data,
                            ..Default::default()
                        },
                    }),
                    action: AssignmentAction::Update,
                },
            );
        }
        self.tasks_using_dependency
            .entry(key)
            .or_default()
            .insert(task.id.clone());
    }

    // ── Certificate issuance ───────────────────────────────────────

    /// Every name the task's certificate must be valid for: attachment
    /// aliases (bare and network-qualified), attachment addresses,
    /// virtual IP names (bare and qualified) and addresses, and the
    /// service name (bare and qualified by each attached network).
    fn task_cert_hosts(&self, tx: &ReadTx, task: &Task) -> Vec<String> {
        if task.networks.is_empty() {
            // No names to give.
            return Vec::new();
        }

        let mut hosts = BTreeSet::new();

        let network_names: HashMap<&str, &str> = task
            .networks
            .iter()
            .map(|attachment| {
                (
                    attachment.network_id.as_str(),
                    attachment.network_name.as_str(),
                )
            })
            .collect();

        for attachment in &task.networks {
            let network_name = &attachment.network_name;
            for alias in &attachment.aliases {
                hosts.insert(alias.clone());
                hosts.insert(format!("{alias}.{network_name}"));
            }
            for address in &attachment.addresses {
                match parse_cidr_ip(address) {
                    Some(ip) => {
                        hosts.insert(ip);
                    }
                    None => {
                        error!(task_id = %task.id, %address, "unable to parse CIDR");
                    }
                }
            }
        }

        if let Some(endpoint) = &task.endpoint {
            for virtual_ip in &endpoint.virtual_ips {
                let network_name = network_names
                    .get(virtual_ip.network_id.as_str())
                    .copied()
                    .unwrap_or_default();
                hosts.insert(virtual_ip.name.clone());
                hosts.insert(format!("{}.{network_name}", virtual_ip.name));
                match parse_cidr_ip(&virtual_ip.addr) {
                    Some(ip) => {
                        hosts.insert(ip);
                    }
                    None => {
                        error!(task_id = %task.id, address = %virtual_ip.addr, "unable to parse CIDR");
                    }
                }
            }
        }

        if !task.service_id.is_empty() {
            match tx.get::<Service>(&task.service_id) {
                Ok(Some(service)) => {
                    let service_name = &service.spec.annotations.name;
                    hosts.insert(service_name.clone());
                    for network_name in network_names.values() {
                        hosts.insert(format!("{service_name}.{network_name}"));
                    }
                }
                Ok(None) => {
                    error!(task_id = %task.id, service_id = %task.service_id, "service not found");
                }
                Err(err) => {
                    error!(task_id = %task.id, service_id = %task.service_id, error = %err, "failed to fetch service");
                }
            }
        }

        hosts.into_iter().collect()
    }

    fn add_cert_issuance_dependencies(
        &mut self,
        tx: &ReadTx,
        task: &Task,
        cert_issuance: &CertificateIssuance,
        hosts: &[String],
    ) {
        let ca_id = &cert_issuance.certificate_authority_id;
        let cert_authority: hivegrid_state::CertificateAuthority = match tx.get(ca_id) {
            Ok(Some(ca)) => ca,
            Ok(None) => {
                error!(%ca_id, task_id = %task.id, "certificate authority not found");
                return;
            }
            Err(err) => {
                error!(%ca_id, task_id = %task.id, error = %err, "failed to fetch certificate authority");
                return;
            }
        };

        let issued = match issuance::issue_certificate(&cert_authority, &task.id, hosts) {
            Ok(issued) => issued,
            Err(err) => {
                error!(%ca_id, task_id = %task.id, error = %err, "unable to issue certificate");
                return;
            }
        };

        for (suffix, data) in [
            ("ca", issued.ca_pem),
            ("key", issued.key_pem),
            ("cert", issued.cert_pem),
        ] {
            let config_id = format!("{}-{}-issue-{}", task.id, ca_id, suffix);
            let key = DependencyKey::config(&config_id);
            if self.dependency_unused(&key) {
                self.tasks_using_dependency.entry(key.clone()).or_default();
                self.changes.insert(
                    key.clone(),
                    AssignmentChange {
                        assignment: Assignment::Config(Config {
                            id: config_id,
                            spec: ConfigSpec {
                                data,
                                ..Default::default()
                            },
                        }),
                        action: AssignmentAction::Update,
                    },
                );
            }
            self.tasks_using_dependency
                .entry(key)
                .or_default()
                .insert(task.id.clone());
        }
    }

    // ── Dependency release ─────────────────────────────────────────

    /// Drop one task's hold on a dependency. When the last hold goes, a
    /// remove change with a minimal id-only payload is emitted. Returns
    /// true iff a remove was emitted.
    fn release_dependency(
        &mut self,
        key: DependencyKey,
        assignment: Assignment,
        task_id: &str,
    ) -> bool {
        let Some(using) = self.tasks_using_dependency.get_mut(&key) else {
            return false;
        };
        using.remove(task_id);
        if !using.is_empty() {
            return false;
        }
        // No tasks are using the dependency anymore.
        self.tasks_using_dependency.remove(&key);
        self.changes.insert(
            key,
            AssignmentChange {
                assignment,
                action: AssignmentAction::Remove,
            },
        );
        true
    }

    fn release_task_dependencies(&mut self, task: &Task) -> bool {
        let mut modified = false;

        for reference in &task.spec.resource_references {
            let assignment = match reference.resource_type {
                ResourceType::Secret => Assignment::Secret(Secret {
                    id: reference.resource_id.clone(),
                    ..Default::default()
                }),
                ResourceType::Config => Assignment::Config(Config {
                    id: reference.resource_id.clone(),
                    ..Default::default()
                }),
                ResourceType::Task => {
                    debug!(
                        resource_id = %reference.resource_id,
                        "invalid resource type for a task dependency, skipping"
                    );
                    continue;
                }
            };
            let key = DependencyKey {
                kind: reference.resource_type,
                id: reference.resource_id.clone(),
            };
            if self.release_dependency(key, assignment, &task.id) {
                modified = true;
            }
        }

        let container = task.spec.container();

        for secret_ref in container.map(|c| c.secrets.as_slice()).unwrap_or_default() {
            let key = DependencyKey::secret(&secret_ref.secret_id);
            let assignment = Assignment::Secret(Secret {
                id: secret_ref.secret_id.clone(),
                ..Default::default()
            });
            if self.release_dependency(key, assignment, &task.id) {
                modified = true;
            }
        }

        for config_ref in container.map(|c| c.configs.as_slice()).unwrap_or_default() {
            let key = DependencyKey::config(&config_ref.config_id);
            let assignment = Assignment::Config(Config {
                id: config_ref.config_id.clone(),
                ..Default::default()
            });
            if self.release_dependency(key, assignment, &task.id) {
                modified = true;
            }
        }

        for config_ref in &task.materialized_configs {
            let key = DependencyKey::config(&config_ref.config_id);
            let assignment = Assignment::Config(Config {
                id: config_ref.config_id.clone(),
                ..Default::default()
            });
            if self.release_dependency(key, assignment, &task.id) {
                modified = true;
            }
        }

        modified
    }
}

fn parse_cidr_ip(address: &str) -> Option<String> {
    let (ip, _) = address.split_once('/')?;
    ip.parse::<std::net::IpAddr>().ok().map(|ip| ip.to_string())
}
