//! The `StoreObject` trait wires each entity type to its tables,
//! secondary indexes, permitted selectors, and event constructors.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::event::{Event, EventKind};
use crate::tables::*;
use crate::types::*;

/// Secondary index names within an entity's index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    Name,
    Custom,
    ServiceId,
    NodeId,
    Runtime,
    DesiredState,
    PeerGroup,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Name => "name",
            IndexKind::Custom => "custom",
            IndexKind::ServiceId => "service_id",
            IndexKind::NodeId => "node_id",
            IndexKind::Runtime => "runtime",
            IndexKind::DesiredState => "desired_state",
            IndexKind::PeerGroup => "peer_group",
        }
    }
}

/// Selector for `find` queries.
///
/// Tables restrict which selectors they answer; unsupported combinations
/// yield `StoreError::InvalidFindBy`.
#[derive(Debug, Clone)]
pub enum By {
    All,
    Id(String),
    IdPrefix(String),
    Name(String),
    NamePrefix(String),
    /// Exact `key=value` label match.
    Custom(String),
    /// Prefix match over `key=value` labels.
    CustomPrefix(String),
    ServiceId(String),
    NodeId(String),
    Runtime(String),
    DesiredState(TaskState),
    PeerGroup(String),
    /// Union of the nested selectors, de-duplicated by object id.
    Or(Vec<By>),
}

/// An entity type storable in the object store.
pub trait StoreObject: Clone + PartialEq + Serialize + DeserializeOwned + Send + 'static {
    /// The data/index table pair backing this entity.
    const TABLE: EntityTable;

    /// Tables whose `name` index shares this entity's name-space.
    const SHARED_NAME_TABLES: &'static [EntityTable] = &[];

    fn id(&self) -> &str;

    /// The unique name, if this entity type is named.
    fn name(&self) -> Option<&str>;

    /// Annotation labels indexed under `custom` as `key=value` rows.
    fn labels(&self) -> Option<&std::collections::HashMap<String, String>>;

    /// Entity-specific index entries beyond `name` and `custom`.
    fn extra_index_entries(&self) -> Vec<(IndexKind, String)> {
        Vec::new()
    }

    /// Whether this table answers the given (leaf) selector.
    fn allows(by: &By) -> bool;

    fn event(kind: EventKind, object: Self) -> Event;

    /// All secondary index entries for the current object value.
    fn index_entries(&self) -> Vec<(IndexKind, String)> {
        let mut entries = Vec::new();
        if let Some(name) = self.name() {
            if !name.is_empty() {
                entries.push((IndexKind::Name, name.to_lowercase()));
            }
        }
        if let Some(labels) = self.labels() {
            for (key, value) in labels {
                entries.push((IndexKind::Custom, format!("{key}={value}")));
            }
        }
        entries.extend(self.extra_index_entries());
        entries
    }
}

impl StoreObject for Service {
    const TABLE: EntityTable = SERVICE_TABLE;
    const SHARED_NAME_TABLES: &'static [EntityTable] = &[PEER_GROUP_TABLE];

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn extra_index_entries(&self) -> Vec<(IndexKind, String)> {
        let mut entries = vec![(IndexKind::Runtime, self.spec.task.runtime.kind().to_string())];
        if let Some(static_mode) = self.static_mode() {
            if !static_mode.peer_group.is_empty() {
                entries.push((IndexKind::PeerGroup, static_mode.peer_group.clone()));
            }
        }
        entries
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Runtime(_)
                | By::PeerGroup(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateService(object),
            EventKind::Update => Event::UpdateService(object),
            EventKind::Delete => Event::DeleteService(object),
        }
    }
}

impl StoreObject for Task {
    const TABLE: EntityTable = TASK_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    // Tasks are not named; their identity is the id plus the
    // (service, slot) coordinates.
    fn name(&self) -> Option<&str> {
        None
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        None
    }

    fn extra_index_entries(&self) -> Vec<(IndexKind, String)> {
        let mut entries = vec![
            (IndexKind::Runtime, self.spec.runtime.kind().to_string()),
            (
                IndexKind::DesiredState,
                self.desired_state.as_str().to_string(),
            ),
        ];
        if !self.service_id.is_empty() {
            entries.push((IndexKind::ServiceId, self.service_id.clone()));
        }
        if !self.node_id.is_empty() {
            entries.push((IndexKind::NodeId, self.node_id.clone()));
        }
        entries
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::ServiceId(_)
                | By::NodeId(_)
                | By::Runtime(_)
                | By::DesiredState(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateTask(object),
            EventKind::Update => Event::UpdateTask(object),
            EventKind::Delete => Event::DeleteTask(object),
        }
    }
}

impl StoreObject for Node {
    const TABLE: EntityTable = NODE_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateNode(object),
            EventKind::Update => Event::UpdateNode(object),
            EventKind::Delete => Event::DeleteNode(object),
        }
    }
}

impl StoreObject for Cluster {
    const TABLE: EntityTable = CLUSTER_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateCluster(object),
            EventKind::Update => Event::UpdateCluster(object),
            EventKind::Delete => Event::DeleteCluster(object),
        }
    }
}

impl StoreObject for Secret {
    const TABLE: EntityTable = SECRET_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateSecret(object),
            EventKind::Update => Event::UpdateSecret(object),
            EventKind::Delete => Event::DeleteSecret(object),
        }
    }
}

impl StoreObject for Config {
    const TABLE: EntityTable = CONFIG_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateConfig(object),
            EventKind::Update => Event::UpdateConfig(object),
            EventKind::Delete => Event::DeleteConfig(object),
        }
    }
}

impl StoreObject for CertificateAuthority {
    const TABLE: EntityTable = CERTIFICATE_AUTHORITY_TABLE;

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreateCertificateAuthority(object),
            EventKind::Update => Event::UpdateCertificateAuthority(object),
            EventKind::Delete => Event::DeleteCertificateAuthority(object),
        }
    }
}

impl StoreObject for PeerGroup {
    const TABLE: EntityTable = PEER_GROUP_TABLE;
    const SHARED_NAME_TABLES: &'static [EntityTable] = &[SERVICE_TABLE];

    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> Option<&str> {
        Some(&self.spec.annotations.name)
    }

    fn labels(&self) -> Option<&std::collections::HashMap<String, String>> {
        Some(&self.spec.annotations.labels)
    }

    fn allows(by: &By) -> bool {
        matches!(
            by,
            By::All
                | By::Id(_)
                | By::IdPrefix(_)
                | By::Name(_)
                | By::NamePrefix(_)
                | By::Custom(_)
                | By::CustomPrefix(_)
                | By::Or(_)
        )
    }

    fn event(kind: EventKind, object: Self) -> Event {
        match kind {
            EventKind::Create => Event::CreatePeerGroup(object),
            EventKind::Update => Event::UpdatePeerGroup(object),
            EventKind::Delete => Event::DeletePeerGroup(object),
        }
    }
}
