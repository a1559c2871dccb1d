//! Domain types for the hivegrid control plane.
//!
//! These types represent the cluster's desired and observed state:
//! services, tasks, nodes, the singleton cluster object, secrets,
//! configs, certificate authorities, and peer groups. All types are
//! JSON-serializable for storage in redb value columns.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the singleton cluster object.
pub const DEFAULT_CLUSTER_NAME: &str = "default";

// ── Common ────────────────────────────────────────────────────────

/// A point in time with nanosecond precision.
///
/// Ordering is lexicographic on (seconds, nanos).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: elapsed.as_secs() as i64,
            nanos: elapsed.subsec_nanos() as i32,
        }
    }
}

/// Monotonically increasing version of an object's spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct Version {
    pub index: u64,
}

/// Human-readable identity attached to every spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Annotations {
    pub name: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

/// A named plugin driver reference (log drivers, secret drivers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Driver {
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

// ── Files and references ──────────────────────────────────────────

/// Filesystem target for a secret or config payload inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileTarget {
    /// Path (or directory entry name) the payload is mounted at.
    pub name: String,
    /// File mode bits.
    pub mode: u32,
    pub uid: String,
    pub gid: String,
}

/// Reference from a task to a config payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigReference {
    pub config_id: String,
    pub config_name: String,
    pub file: FileTarget,
}

/// Reference from a task to a secret payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecretReference {
    pub secret_id: String,
    pub secret_name: String,
    pub file: FileTarget,
}

/// A request for a certificate to be issued to a task by a named CA.
///
/// The issued bundle (ca.pem, key.pem, cert.pem) is materialized under
/// `directory` by the assignment engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CertificateIssuance {
    pub certificate_authority_id: String,
    pub directory: FileTarget,
}

/// Kind of resource a generic task dependency points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Task,
    Secret,
    Config,
}

/// Generic typed dependency edge from a task to another object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceReference {
    pub resource_id: String,
    pub resource_type: ResourceType,
}

// ── Networking ────────────────────────────────────────────────────

/// A task's (or static service's) attachment to a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkAttachment {
    pub network_id: String,
    pub network_name: String,
    /// Addresses in CIDR notation, e.g. `10.0.0.4/24`.
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Desired network attachment declared in a task spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkAttachmentConfig {
    pub target: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// A virtual IP allocated to an endpoint on a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VirtualIp {
    pub network_id: String,
    pub name: String,
    /// Address in CIDR notation.
    pub addr: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PortConfig {
    pub name: String,
    pub protocol: String,
    pub target_port: u32,
    pub published_port: u32,
}

/// Declared endpoint properties of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EndpointSpec {
    #[serde(default)]
    pub ports: Vec<PortConfig>,
}

/// Observed endpoint state (spec plus allocated virtual IPs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Endpoint {
    pub spec: EndpointSpec,
    #[serde(default)]
    pub virtual_ips: Vec<VirtualIp>,
}

// ── Task spec ─────────────────────────────────────────────────────

/// A bind or volume mount inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Options controlling image pulls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PullOptions {
    pub registry_auth: String,
}

/// Container runtime parameters of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub secrets: Vec<SecretReference>,
    #[serde(default)]
    pub configs: Vec<ConfigReference>,
    #[serde(default)]
    pub certificate_issuances: Vec<CertificateIssuance>,
    #[serde(default)]
    pub pull_options: Option<PullOptions>,
}

/// Runtime variant of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "runtime", rename_all = "snake_case")]
pub enum RuntimeSpec {
    Container(ContainerSpec),
}

impl RuntimeSpec {
    /// Stable name of the runtime variant, used by the `runtime` index.
    pub fn kind(&self) -> &'static str {
        match self {
            RuntimeSpec::Container(_) => "container",
        }
    }
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        RuntimeSpec::Container(ContainerSpec::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    pub nano_cpus: i64,
    pub memory_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub limits: Option<Resources>,
    #[serde(default)]
    pub reservations: Option<Resources>,
}

/// Placement constraints for scheduling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Placement {
    /// Expressions such as `node.labels.region==east`.
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// When a task's restart policy applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RestartCondition {
    None,
    OnFailure,
    #[default]
    Any,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RestartPolicy {
    pub condition: RestartCondition,
    /// Delay between restarts, in seconds.
    #[serde(default)]
    pub delay_seconds: u64,
    /// Maximum restart attempts (0 means unlimited).
    #[serde(default)]
    pub max_attempts: u64,
}

/// Everything needed to run one instance of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskSpec {
    pub runtime: RuntimeSpec,
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    #[serde(default)]
    pub placement: Placement,
    #[serde(default)]
    pub networks: Vec<NetworkAttachmentConfig>,
    #[serde(default)]
    pub restart: Option<RestartPolicy>,
    #[serde(default)]
    pub log_driver: Option<Driver>,
    #[serde(default)]
    pub resource_references: Vec<ResourceReference>,
}

impl TaskSpec {
    /// The container spec, if this task runs the container runtime.
    pub fn container(&self) -> Option<&ContainerSpec> {
        match &self.runtime {
            RuntimeSpec::Container(c) => Some(c),
        }
    }

    pub fn container_mut(&mut self) -> Option<&mut ContainerSpec> {
        match &mut self.runtime {
            RuntimeSpec::Container(c) => Some(c),
        }
    }
}

// ── Task ──────────────────────────────────────────────────────────

/// Lifecycle state of a task.
///
/// States are ordered; both observed state and desired state only ever
/// move forward along this chain.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    New,
    Pending,
    Assigned,
    Accepted,
    Preparing,
    Ready,
    Starting,
    Running,
    Completed,
    Shutdown,
    Failed,
    Rejected,
    Remove,
    Orphaned,
}

impl TaskState {
    /// Stable name of the state, used by the `desired_state` index.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::New => "new",
            TaskState::Pending => "pending",
            TaskState::Assigned => "assigned",
            TaskState::Accepted => "accepted",
            TaskState::Preparing => "preparing",
            TaskState::Ready => "ready",
            TaskState::Starting => "starting",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Shutdown => "shutdown",
            TaskState::Failed => "failed",
            TaskState::Rejected => "rejected",
            TaskState::Remove => "remove",
            TaskState::Orphaned => "orphaned",
        }
    }
}

/// Observed status of a task, reported by the agent running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskStatus {
    pub state: TaskState,
    #[serde(default)]
    pub timestamp: Option<Timestamp>,
    /// When the agent applied this status (preferred for ordering).
    #[serde(default)]
    pub applied_at: Option<Timestamp>,
    #[serde(default)]
    pub message: String,
}

/// A concrete scheduled instance of a service's task spec, bound to a
/// node.
///
/// The spec is immutable after creation; orchestrators replace tasks
/// rather than mutating their specs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Task {
    pub id: String,
    /// Owning service, empty for standalone tasks.
    #[serde(default)]
    pub service_id: String,
    #[serde(default)]
    pub slot: u64,
    #[serde(default)]
    pub node_id: String,
    pub spec: TaskSpec,
    #[serde(default)]
    pub service_annotations: Annotations,
    #[serde(default)]
    pub spec_version: Option<Version>,
    pub desired_state: TaskState,
    pub status: TaskStatus,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub log_driver: Option<Driver>,
    /// Config references synthesized per task (peer-group file,
    /// certificate bundles). Payloads are produced on demand by the
    /// assignment engine and never stored.
    #[serde(default)]
    pub materialized_configs: Vec<ConfigReference>,
    #[serde(default)]
    pub is_standalone: bool,
}

// ── Service ───────────────────────────────────────────────────────

/// Static-mode parameters: one task, pinned to one node, forever.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StaticService {
    /// Peer group this service belongs to.
    #[serde(default)]
    pub peer_group: String,
    /// Network shared by the peer group.
    #[serde(default)]
    pub peer_network: String,
    #[serde(default)]
    pub placement: Option<Placement>,
}

/// Scheduling mode of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServiceMode {
    Replicated { replicas: u64 },
    Global,
    Static(StaticService),
}

impl Default for ServiceMode {
    fn default() -> Self {
        ServiceMode::Replicated { replicas: 1 }
    }
}

/// Scheduler-populated placement result for a static service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StaticInfo {
    /// Node the single task is pinned to; empty until scheduled.
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub network_attachment: Option<NetworkAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ServiceSpec {
    pub annotations: Annotations,
    pub task: TaskSpec,
    pub mode: ServiceMode,
    #[serde(default)]
    pub endpoint: Option<EndpointSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Service {
    pub id: String,
    pub spec: ServiceSpec,
    #[serde(default)]
    pub spec_version: Option<Version>,
    #[serde(default)]
    pub static_info: Option<StaticInfo>,
}

impl Service {
    /// The static-mode parameters, if this is a static service.
    pub fn static_mode(&self) -> Option<&StaticService> {
        match &self.spec.mode {
            ServiceMode::Static(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_static(&self) -> bool {
        self.static_mode().is_some()
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Liveness of a node as seen by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Unknown,
    Down,
    Ready,
    Disconnected,
}

/// Operator-controlled scheduling availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeAvailability {
    #[default]
    Active,
    Pause,
    Drain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    #[default]
    Worker,
    Manager,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::Worker => "worker",
            NodeRole::Manager => "manager",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeSpec {
    pub annotations: Annotations,
    pub availability: NodeAvailability,
    #[serde(default)]
    pub role: NodeRole,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeStatus {
    pub state: NodeState,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NodeDescription {
    pub hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Node {
    pub id: String,
    pub spec: NodeSpec,
    pub status: NodeStatus,
    #[serde(default)]
    pub description: Option<NodeDescription>,
}

// ── Cluster ───────────────────────────────────────────────────────

/// Defaults applied to tasks that do not specify their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TaskDefaults {
    #[serde(default)]
    pub log_driver: Option<Driver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterSpec {
    pub annotations: Annotations,
    #[serde(default)]
    pub task_defaults: TaskDefaults,
}

/// The singleton cluster object, fetched by its well-known name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Cluster {
    pub id: String,
    pub spec: ClusterSpec,
}

// ── Secrets and configs ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SecretSpec {
    pub annotations: Annotations,
    #[serde(default)]
    pub data: Vec<u8>,
    /// When set, the payload is fetched from an external secret driver
    /// instead of the stored data.
    #[serde(default)]
    pub driver: Option<Driver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Secret {
    pub id: String,
    pub spec: SecretSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConfigSpec {
    pub annotations: Annotations,
    #[serde(default)]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    pub id: String,
    pub spec: ConfigSpec,
}

// ── Certificate authority ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CertificateAuthoritySpec {
    pub annotations: Annotations,
}

/// A CA whose key lives in the store and signs per-task certificates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct CertificateAuthority {
    pub id: String,
    pub spec: CertificateAuthoritySpec,
    /// PEM-encoded certificate.
    #[serde(default)]
    pub cert: Vec<u8>,
    /// PEM-encoded private key. Never returned on reads.
    #[serde(default)]
    pub key: Vec<u8>,
}

impl CertificateAuthority {
    /// Copy safe to hand to readers: the private key is stripped.
    pub fn clone_without_key(&self) -> Self {
        Self {
            id: self.id.clone(),
            spec: self.spec.clone(),
            cert: self.cert.clone(),
            key: Vec::new(),
        }
    }
}

// ── Peer group ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerGroupSpec {
    pub annotations: Annotations,
    /// Network shared by the group's members.
    #[serde(default)]
    pub network_id: String,
}

/// A named collection of static services that discover each other
/// through a materialized peer config.
///
/// Peer groups share a name-space with services: no service and peer
/// group may carry the same name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerGroup {
    pub id: String,
    pub spec: PeerGroupSpec,
    #[serde(default)]
    pub endpoint: Option<Endpoint>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_states_are_ordered() {
        assert!(TaskState::New < TaskState::Pending);
        assert!(TaskState::Assigned < TaskState::Running);
        assert!(TaskState::Running < TaskState::Completed);
        assert!(TaskState::Failed < TaskState::Orphaned);
    }

    #[test]
    fn timestamp_ordering_is_seconds_then_nanos() {
        let earlier = Timestamp { seconds: 5, nanos: 999 };
        let later = Timestamp { seconds: 6, nanos: 0 };
        assert!(earlier < later);

        let a = Timestamp { seconds: 5, nanos: 1 };
        let b = Timestamp { seconds: 5, nanos: 2 };
        assert!(a < b);
    }

    #[test]
    fn static_mode_accessor() {
        let mut service = Service::default();
        assert!(!service.is_static());

        service.spec.mode = ServiceMode::Static(StaticService {
            peer_group: "g1".to_string(),
            ..Default::default()
        });
        assert_eq!(service.static_mode().unwrap().peer_group, "g1");
    }

    #[test]
    fn ca_clone_without_key_strips_key() {
        let ca = CertificateAuthority {
            id: "ca-1".to_string(),
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
            ..Default::default()
        };
        let redacted = ca.clone_without_key();
        assert_eq!(redacted.cert, b"cert");
        assert!(redacted.key.is_empty());
    }

    #[test]
    fn service_mode_round_trips_through_json() {
        let spec = ServiceSpec {
            mode: ServiceMode::Static(StaticService {
                peer_group: "db".to_string(),
                peer_network: "net-1".to_string(),
                placement: None,
            }),
            ..Default::default()
        };
        let bytes = serde_json::to_vec(&spec).unwrap();
        let back: ServiceSpec = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back, spec);
    }
}
