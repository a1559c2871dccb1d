//! Change events and replayable store actions.
//!
//! Every committed write transaction publishes one event per change, in
//! transaction order, to the store's watch queue. `StoreAction` is the
//! log-replay form of the same mutations, applied by the replication
//! backing through `WriteTx::apply_store_action`.

use serde::{Deserialize, Serialize};

use crate::types::*;

/// What happened to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    Update,
    Delete,
}

/// A committed change to a single object.
///
/// Delete events carry the last committed value of the object.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    CreateService(Service),
    UpdateService(Service),
    DeleteService(Service),
    CreateTask(Task),
    UpdateTask(Task),
    DeleteTask(Task),
    CreateNode(Node),
    UpdateNode(Node),
    DeleteNode(Node),
    CreateCluster(Cluster),
    UpdateCluster(Cluster),
    DeleteCluster(Cluster),
    CreateSecret(Secret),
    UpdateSecret(Secret),
    DeleteSecret(Secret),
    CreateConfig(Config),
    UpdateConfig(Config),
    DeleteConfig(Config),
    CreateCertificateAuthority(CertificateAuthority),
    UpdateCertificateAuthority(CertificateAuthority),
    DeleteCertificateAuthority(CertificateAuthority),
    CreatePeerGroup(PeerGroup),
    UpdatePeerGroup(PeerGroup),
    DeletePeerGroup(PeerGroup),
}

/// Kind of a replayed store action.
///
/// Unrecognized kinds deserialize to `Unknown` and are rejected with
/// `StoreError::UnknownStoreAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreActionKind {
    Create,
    Update,
    Remove,
    #[serde(other)]
    Unknown,
}

/// Object payload of a replayed store action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum StoreTarget {
    Service(Service),
    Task(Task),
    Node(Node),
    Cluster(Cluster),
    Secret(Secret),
    Config(Config),
    CertificateAuthority(CertificateAuthority),
    PeerGroup(PeerGroup),
}

/// One log-ordered mutation from the replication backing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreAction {
    pub kind: StoreActionKind,
    #[serde(flatten)]
    pub target: StoreTarget,
}
