//! MemoryStore — multi-indexed transactional object store.
//!
//! Backed by redb (in-memory by default, file-backed for durability).
//! All objects are JSON-serialized into `&[u8]` value columns; secondary
//! indexes live in per-entity index tables as composite-key rows matched
//! with prefix scans.
//!
//! Writes go through `update`/`batch` and publish one event per change,
//! in transaction order, after commit. Reads through `view` see a
//! consistent point-in-time snapshot and never block writers.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use redb::{Database, ReadTransaction, ReadableTable, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::event::{Event, EventKind, StoreAction, StoreActionKind, StoreTarget};
use crate::object::{By, IndexKind, StoreObject};
use crate::tables::{EntityTable, ALL_TABLES};
use crate::types::*;
use crate::watch::WatchQueue;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Separator between segments of composite index keys.
const INDEX_SEP: char = '\u{1f}';

/// Maximum sub-transactions applied within one batch chunk. Batches
/// larger than this commit in multiple chunks; partial application
/// between chunks is visible to readers.
pub const MAX_CHANGES_PER_BATCH: usize = 10_000;

fn index_key(kind: IndexKind, key: &str, id: &str) -> String {
    format!("{}{INDEX_SEP}{key}{INDEX_SEP}{id}", kind.as_str())
}

/// Prefix matching every row of `kind` whose key equals `key` exactly.
fn index_exact_prefix(kind: IndexKind, key: &str) -> String {
    format!("{}{INDEX_SEP}{key}{INDEX_SEP}", kind.as_str())
}

/// Prefix matching every row of `kind` whose key starts with `partial`.
fn index_partial_prefix(kind: IndexKind, partial: &str) -> String {
    format!("{}{INDEX_SEP}{partial}", kind.as_str())
}

fn decode<E: StoreObject>(bytes: &[u8]) -> StoreResult<E> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn get_in<E: StoreObject>(
    data: &impl ReadableTable<&'static str, &'static [u8]>,
    id: &str,
) -> StoreResult<Option<E>> {
    match data.get(id).map_err(map_err!(Storage))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn ids_with_prefix(
    index: &impl ReadableTable<&'static str, &'static str>,
    prefix: &str,
) -> StoreResult<Vec<String>> {
    let mut ids = Vec::new();
    for entry in index.range(prefix..).map_err(map_err!(Storage))? {
        let (key, value) = entry.map_err(map_err!(Storage))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        ids.push(value.value().to_string());
    }
    Ok(ids)
}

fn fetch_by_ids<E: StoreObject>(
    data: &impl ReadableTable<&'static str, &'static [u8]>,
    ids: Vec<String>,
) -> StoreResult<Vec<E>> {
    // An object can appear under several matching index rows.
    let mut seen = HashSet::new();
    let mut objects = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(object) = get_in(data, &id)? {
            objects.push(object);
        }
    }
    Ok(objects)
}

fn check_by<E: StoreObject>(by: &By) -> StoreResult<()> {
    match by {
        By::Or(nested) => {
            for item in nested {
                check_by::<E>(item)?;
            }
            Ok(())
        }
        leaf => {
            if E::allows(leaf) {
                Ok(())
            } else {
                Err(StoreError::InvalidFindBy)
            }
        }
    }
}

fn find_in<E: StoreObject>(
    data: &impl ReadableTable<&'static str, &'static [u8]>,
    index: &impl ReadableTable<&'static str, &'static str>,
    by: &By,
) -> StoreResult<Vec<E>> {
    match by {
        By::All => {
            let mut objects = Vec::new();
            for entry in data.iter().map_err(map_err!(Storage))? {
                let (_, value) = entry.map_err(map_err!(Storage))?;
                objects.push(decode(value.value())?);
            }
            Ok(objects)
        }
        By::Id(id) => Ok(get_in(data, id)?.into_iter().collect()),
        By::IdPrefix(prefix) => {
            let mut objects = Vec::new();
            for entry in data.range(prefix.as_str()..).map_err(map_err!(Storage))? {
                let (key, value) = entry.map_err(map_err!(Storage))?;
                if !key.value().starts_with(prefix.as_str()) {
                    break;
                }
                objects.push(decode(value.value())?);
            }
            Ok(objects)
        }
        By::Name(name) => {
            let prefix = index_exact_prefix(IndexKind::Name, &name.to_lowercase());
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::NamePrefix(partial) => {
            let prefix = index_partial_prefix(IndexKind::Name, &partial.to_lowercase());
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::Custom(pair) => {
            let prefix = index_exact_prefix(IndexKind::Custom, pair);
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::CustomPrefix(partial) => {
            let prefix = index_partial_prefix(IndexKind::Custom, partial);
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::ServiceId(id) => {
            let prefix = index_exact_prefix(IndexKind::ServiceId, id);
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::NodeId(id) => {
            let prefix = index_exact_prefix(IndexKind::NodeId, id);
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::Runtime(runtime) => {
            let prefix = index_exact_prefix(IndexKind::Runtime, runtime);
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::DesiredState(state) => {
            let prefix = index_exact_prefix(IndexKind::DesiredState, state.as_str());
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::PeerGroup(group) => {
            let prefix = index_exact_prefix(IndexKind::PeerGroup, group);
            fetch_by_ids(data, ids_with_prefix(index, &prefix)?)
        }
        By::Or(nested) => {
            let mut seen = HashSet::new();
            let mut objects = Vec::new();
            for item in nested {
                for object in find_in::<E>(data, index, item)? {
                    if seen.insert(object.id().to_string()) {
                        objects.push(object);
                    }
                }
            }
            Ok(objects)
        }
    }
}

fn lookup_in<E: StoreObject>(
    data: &impl ReadableTable<&'static str, &'static [u8]>,
    index: &impl ReadableTable<&'static str, &'static str>,
    kind: IndexKind,
    key: &str,
) -> StoreResult<Option<E>> {
    let key = match kind {
        IndexKind::Name => key.to_lowercase(),
        _ => key.to_string(),
    };
    let ids = ids_with_prefix(index, &index_exact_prefix(kind, &key))?;
    match ids.into_iter().next() {
        Some(id) => get_in(data, &id),
        None => Ok(None),
    }
}

// ── Read transaction ──────────────────────────────────────────────

/// A consistent point-in-time read snapshot.
pub struct ReadTx {
    txn: ReadTransaction,
}

impl ReadTx {
    pub fn get<E: StoreObject>(&self, id: &str) -> StoreResult<Option<E>> {
        let data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
        get_in(&data, id)
    }

    pub fn find<E: StoreObject>(&self, by: &By) -> StoreResult<Vec<E>> {
        check_by::<E>(by)?;
        let data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
        let index = self.txn.open_table(E::TABLE.index).map_err(map_err!(Storage))?;
        find_in(&data, &index, by)
    }

    /// First object whose `kind` index row matches `key` exactly.
    pub fn lookup<E: StoreObject>(&self, kind: IndexKind, key: &str) -> StoreResult<Option<E>> {
        let data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
        let index = self.txn.open_table(E::TABLE.index).map_err(map_err!(Storage))?;
        lookup_in(&data, &index, kind, key)
    }
}

// ── Write transaction ─────────────────────────────────────────────

/// A writable transaction. Changes become visible, and their events are
/// published, only when the enclosing `update`/`batch` commits.
pub struct WriteTx {
    txn: WriteTransaction,
    events: Vec<Event>,
}

impl WriteTx {
    fn new(txn: WriteTransaction) -> Self {
        Self {
            txn,
            events: Vec::new(),
        }
    }

    pub fn get<E: StoreObject>(&self, id: &str) -> StoreResult<Option<E>> {
        let data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
        get_in(&data, id)
    }

    pub fn find<E: StoreObject>(&self, by: &By) -> StoreResult<Vec<E>> {
        check_by::<E>(by)?;
        let data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
        let index = self.txn.open_table(E::TABLE.index).map_err(map_err!(Storage))?;
        find_in(&data, &index, by)
    }

    pub fn lookup<E: StoreObject>(&self, kind: IndexKind, key: &str) -> StoreResult<Option<E>> {
        let data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
        let index = self.txn.open_table(E::TABLE.index).map_err(map_err!(Storage))?;
        lookup_in(&data, &index, kind, key)
    }

    /// Insert a new object.
    ///
    /// Fails with `Exist` on id collision and `NameConflict` if the name
    /// is taken within the entity's name-space (including name-spaces
    /// shared with other entity types).
    pub fn create<E: StoreObject>(&mut self, object: &E) -> StoreResult<()> {
        self.check_name_conflict(object, false)?;
        let value = serde_json::to_vec(object).map_err(map_err!(Serialize))?;
        {
            let mut data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
            if data.get(object.id()).map_err(map_err!(Storage))?.is_some() {
                return Err(StoreError::Exist);
            }
            data.insert(object.id(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        self.insert_index_entries(object)?;
        self.events.push(E::event(EventKind::Create, object.clone()));
        Ok(())
    }

    /// Replace an existing object and re-index it.
    pub fn update<E: StoreObject>(&mut self, object: &E) -> StoreResult<()> {
        let old: E = self.get(object.id())?.ok_or(StoreError::NotExist)?;
        self.check_name_conflict(object, true)?;
        self.remove_index_entries(&old)?;
        let value = serde_json::to_vec(object).map_err(map_err!(Serialize))?;
        {
            let mut data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
            data.insert(object.id(), value.as_slice())
                .map_err(map_err!(Storage))?;
        }
        self.insert_index_entries(object)?;
        self.events.push(E::event(EventKind::Update, object.clone()));
        Ok(())
    }

    /// Remove an object and its index entries.
    pub fn delete<E: StoreObject>(&mut self, id: &str) -> StoreResult<()> {
        let old: E = self.get(id)?.ok_or(StoreError::NotExist)?;
        self.remove_index_entries(&old)?;
        {
            let mut data = self.txn.open_table(E::TABLE.data).map_err(map_err!(Storage))?;
            data.remove(id).map_err(map_err!(Storage))?;
        }
        self.events.push(E::event(EventKind::Delete, old));
        Ok(())
    }

    /// Replay one log-ordered mutation from the replication backing.
    ///
    /// Replay is idempotent: create of an existing id degrades to an
    /// update, update of a missing id degrades to a create, and remove
    /// of a missing id is a no-op.
    pub fn apply_store_action(&mut self, action: StoreAction) -> StoreResult<()> {
        match action.target {
            StoreTarget::Service(object) => self.replay(action.kind, object),
            StoreTarget::Task(object) => self.replay(action.kind, object),
            StoreTarget::Node(object) => self.replay(action.kind, object),
            StoreTarget::Cluster(object) => self.replay(action.kind, object),
            StoreTarget::Secret(object) => self.replay(action.kind, object),
            StoreTarget::Config(object) => self.replay(action.kind, object),
            StoreTarget::CertificateAuthority(object) => self.replay(action.kind, object),
            StoreTarget::PeerGroup(object) => self.replay(action.kind, object),
        }
    }

    fn replay<E: StoreObject>(&mut self, kind: StoreActionKind, object: E) -> StoreResult<()> {
        match kind {
            StoreActionKind::Create => match self.create(&object) {
                Err(StoreError::Exist) => self.update(&object),
                other => other,
            },
            StoreActionKind::Update => match self.update(&object) {
                Err(StoreError::NotExist) => self.create(&object),
                other => other,
            },
            StoreActionKind::Remove => match self.delete::<E>(object.id()) {
                Err(StoreError::NotExist) => Ok(()),
                other => other,
            },
            StoreActionKind::Unknown => Err(StoreError::UnknownStoreAction),
        }
    }

    fn check_name_conflict<E: StoreObject>(&self, object: &E, allow_self: bool) -> StoreResult<()> {
        let Some(name) = object.name() else {
            return Ok(());
        };
        if name.is_empty() {
            return Ok(());
        }
        let lower = name.to_lowercase();
        if let Some(holder) = self.name_holder(&E::TABLE, &lower)? {
            if !allow_self || holder != object.id() {
                return Err(StoreError::NameConflict);
            }
            // We already hold the name; shared tables cannot also hold it.
            return Ok(());
        }
        for shared in E::SHARED_NAME_TABLES {
            if self.name_holder(shared, &lower)?.is_some() {
                return Err(StoreError::NameConflict);
            }
        }
        Ok(())
    }

    fn name_holder(&self, table: &EntityTable, lower: &str) -> StoreResult<Option<String>> {
        let index = self.txn.open_table(table.index).map_err(map_err!(Storage))?;
        let ids = ids_with_prefix(&index, &index_exact_prefix(IndexKind::Name, lower))?;
        Ok(ids.into_iter().next())
    }

    fn insert_index_entries<E: StoreObject>(&mut self, object: &E) -> StoreResult<()> {
        let mut index = self.txn.open_table(E::TABLE.index).map_err(map_err!(Storage))?;
        for (kind, key) in object.index_entries() {
            index
                .insert(index_key(kind, &key, object.id()).as_str(), object.id())
                .map_err(map_err!(Storage))?;
        }
        Ok(())
    }

    fn remove_index_entries<E: StoreObject>(&mut self, object: &E) -> StoreResult<()> {
        let mut index = self.txn.open_table(E::TABLE.index).map_err(map_err!(Storage))?;
        for (kind, key) in object.index_entries() {
            index
                .remove(index_key(kind, &key, object.id()).as_str())
                .map_err(map_err!(Storage))?;
        }
        Ok(())
    }
}

// ── Snapshot ──────────────────────────────────────────────────────

/// A full copy of every table, for persistence and state transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoreSnapshot {
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub services: Vec<Service>,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub secrets: Vec<Secret>,
    #[serde(default)]
    pub configs: Vec<Config>,
    #[serde(default)]
    pub certificate_authorities: Vec<CertificateAuthority>,
    #[serde(default)]
    pub peer_groups: Vec<PeerGroup>,
}

// ── Store ─────────────────────────────────────────────────────────

/// The shared object store.
///
/// `Clone` + `Send` + `Sync` (backed by `Arc<Database>`); every
/// component holds its own handle.
#[derive(Clone)]
pub struct MemoryStore {
    db: Arc<Database>,
    queue: WatchQueue,
    // Held from begin-write through event publication so that events
    // reach subscribers in commit order.
    commit_lock: Arc<Mutex<()>>,
}

impl MemoryStore {
    /// Open (or create) a file-backed store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Storage))?;
        debug!(?path, "object store opened");
        Self::finish(db)
    }

    /// Create an ephemeral in-memory store.
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Storage))?;
        debug!("in-memory object store opened");
        Self::finish(db)
    }

    fn finish(db: Database) -> StoreResult<Self> {
        Self::ensure_tables(&db)?;
        Ok(Self {
            db: Arc::new(db),
            queue: WatchQueue::new(),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(db: &Database) -> StoreResult<()> {
        let txn = db.begin_write().map_err(map_err!(Storage))?;
        for table in ALL_TABLES {
            // Opening a table in a write transaction creates it if absent.
            txn.open_table(table.data).map_err(map_err!(Storage))?;
            txn.open_table(table.index).map_err(map_err!(Storage))?;
        }
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    /// The queue that committed events are published to.
    pub fn watch_queue(&self) -> &WatchQueue {
        &self.queue
    }

    /// Run `f` against a consistent read snapshot.
    pub fn view<R>(&self, f: impl FnOnce(&ReadTx) -> R) -> StoreResult<R> {
        let txn = self.db.begin_read().map_err(map_err!(Storage))?;
        Ok(f(&ReadTx { txn }))
    }

    /// Run `f` in a write transaction.
    ///
    /// On `Ok` the changes commit atomically and their events are
    /// published in transaction order. On `Err` everything is discarded
    /// and no events are emitted.
    pub fn update<R>(&self, f: impl FnOnce(&mut WriteTx) -> StoreResult<R>) -> StoreResult<R> {
        let _guard = self.lock_commits();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        let mut tx = WriteTx::new(txn);
        match f(&mut tx) {
            Ok(value) => {
                let WriteTx { txn, events } = tx;
                txn.commit().map_err(map_err!(Storage))?;
                self.queue.publish(events);
                Ok(value)
            }
            Err(err) => {
                let WriteTx { txn, .. } = tx;
                if let Err(abort_err) = txn.abort() {
                    debug!(error = %abort_err, "failed to abort transaction");
                }
                Err(err)
            }
        }
    }

    /// Group many small updates, committing in capped chunks.
    ///
    /// Chunks that already committed stay applied even if a later chunk
    /// or the outer closure fails.
    pub fn batch<R>(&self, f: impl FnOnce(&mut Batch) -> StoreResult<R>) -> StoreResult<R> {
        self.batch_with_cap(MAX_CHANGES_PER_BATCH, f)
    }

    pub(crate) fn batch_with_cap<R>(
        &self,
        cap: usize,
        f: impl FnOnce(&mut Batch) -> StoreResult<R>,
    ) -> StoreResult<R> {
        let _guard = self.lock_commits();
        let mut batch = Batch {
            store: self,
            tx: None,
            cap: cap.max(1),
            applied: 0,
        };
        match f(&mut batch) {
            Ok(value) => {
                batch.commit_chunk()?;
                Ok(value)
            }
            Err(err) => {
                batch.abort_chunk();
                Err(err)
            }
        }
    }

    /// Produce a snapshot of every table.
    pub fn save(&self) -> StoreResult<StoreSnapshot> {
        self.view(|tx| {
            Ok(StoreSnapshot {
                clusters: tx.find(&By::All)?,
                nodes: tx.find(&By::All)?,
                services: tx.find(&By::All)?,
                tasks: tx.find(&By::All)?,
                secrets: tx.find(&By::All)?,
                configs: tx.find(&By::All)?,
                certificate_authorities: tx.find(&By::All)?,
                peer_groups: tx.find(&By::All)?,
            })
        })?
    }

    /// Atomically replace all table contents from a snapshot and
    /// rebuild every index. Emits no events.
    pub fn restore(&self, snapshot: &StoreSnapshot) -> StoreResult<()> {
        let _guard = self.lock_commits();
        let txn = self.db.begin_write().map_err(map_err!(Storage))?;
        for table in ALL_TABLES {
            txn.delete_table(table.data).map_err(map_err!(Storage))?;
            txn.delete_table(table.index).map_err(map_err!(Storage))?;
            txn.open_table(table.data).map_err(map_err!(Storage))?;
            txn.open_table(table.index).map_err(map_err!(Storage))?;
        }
        let mut tx = WriteTx::new(txn);
        for object in &snapshot.clusters {
            tx.create(object)?;
        }
        for object in &snapshot.nodes {
            tx.create(object)?;
        }
        for object in &snapshot.services {
            tx.create(object)?;
        }
        for object in &snapshot.tasks {
            tx.create(object)?;
        }
        for object in &snapshot.secrets {
            tx.create(object)?;
        }
        for object in &snapshot.configs {
            tx.create(object)?;
        }
        for object in &snapshot.certificate_authorities {
            tx.create(object)?;
        }
        for object in &snapshot.peer_groups {
            tx.create(object)?;
        }
        let WriteTx { txn, .. } = tx;
        txn.commit().map_err(map_err!(Storage))?;
        Ok(())
    }

    fn lock_commits(&self) -> MutexGuard<'_, ()> {
        self.commit_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle passed to `batch` closures; each `update` call runs a small
/// sub-transaction against the currently open chunk.
pub struct Batch<'a> {
    store: &'a MemoryStore,
    tx: Option<WriteTx>,
    cap: usize,
    applied: usize,
}

impl Batch<'_> {
    /// Apply one sub-transaction. When the chunk cap is reached the
    /// chunk commits and its events are published immediately.
    pub fn update<R>(&mut self, f: impl FnOnce(&mut WriteTx) -> StoreResult<R>) -> StoreResult<R> {
        if self.tx.is_none() {
            let txn = self.store.db.begin_write().map_err(map_err!(Storage))?;
            self.tx = Some(WriteTx::new(txn));
        }
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| StoreError::Storage("batch transaction unavailable".to_string()))?;
        let value = f(tx)?;
        self.applied += 1;
        if self.applied >= self.cap {
            self.commit_chunk()?;
            self.applied = 0;
        }
        Ok(value)
    }

    fn commit_chunk(&mut self) -> StoreResult<()> {
        if let Some(tx) = self.tx.take() {
            let WriteTx { txn, events } = tx;
            txn.commit().map_err(map_err!(Storage))?;
            self.store.queue.publish(events);
        }
        Ok(())
    }

    fn abort_chunk(&mut self) {
        if let Some(tx) = self.tx.take() {
            let WriteTx { txn, .. } = tx;
            if let Err(err) = txn.abort() {
                debug!(error = %err, "failed to abort batch chunk");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;

    fn test_store() -> MemoryStore {
        MemoryStore::open_in_memory().unwrap()
    }

    fn service(id: &str, name: &str) -> Service {
        Service {
            id: id.to_string(),
            spec: ServiceSpec {
                annotations: Annotations {
                    name: name.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn static_service(id: &str, name: &str, peer_group: &str, node_id: &str) -> Service {
        let mut svc = service(id, name);
        svc.spec.mode = ServiceMode::Static(StaticService {
            peer_group: peer_group.to_string(),
            ..Default::default()
        });
        svc.static_info = Some(StaticInfo {
            node_id: node_id.to_string(),
            ..Default::default()
        });
        svc
    }

    fn peer_group(id: &str, name: &str) -> PeerGroup {
        PeerGroup {
            id: id.to_string(),
            spec: PeerGroupSpec {
                annotations: Annotations {
                    name: name.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn task(id: &str, service_id: &str, node_id: &str) -> Task {
        Task {
            id: id.to_string(),
            service_id: service_id.to_string(),
            node_id: node_id.to_string(),
            desired_state: TaskState::Running,
            ..Default::default()
        }
    }

    // ── CRUD ───────────────────────────────────────────────────────

    #[test]
    fn create_and_get_service() {
        let store = test_store();
        store
            .update(|tx| tx.create(&service("s1", "web")))
            .unwrap();

        let found: Option<Service> = store.view(|tx| tx.get("s1")).unwrap().unwrap();
        assert_eq!(found.unwrap().spec.annotations.name, "web");
    }

    #[test]
    fn create_duplicate_id_fails() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "a"))).unwrap();

        let err = store
            .update(|tx| tx.create(&service("s1", "b")))
            .unwrap_err();
        assert!(matches!(err, StoreError::Exist));
    }

    #[test]
    fn update_missing_fails() {
        let store = test_store();
        let err = store
            .update(|tx| tx.update(&service("nope", "a")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotExist));
    }

    #[test]
    fn delete_missing_fails() {
        let store = test_store();
        let err = store
            .update(|tx| tx.delete::<Service>("nope"))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotExist));
    }

    #[test]
    fn delete_removes_object_and_indexes() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "web"))).unwrap();
        store.update(|tx| tx.delete::<Service>("s1")).unwrap();

        let by_name: Vec<Service> = store
            .view(|tx| tx.find(&By::Name("web".to_string())))
            .unwrap()
            .unwrap();
        assert!(by_name.is_empty());

        // The freed name is available again.
        store.update(|tx| tx.create(&service("s2", "web"))).unwrap();
    }

    // ── Name uniqueness ────────────────────────────────────────────

    #[test]
    fn duplicate_service_name_fails_case_insensitively() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "Alpha"))).unwrap();

        let err = store
            .update(|tx| tx.create(&service("s2", "ALPHA")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NameConflict));
    }

    #[test]
    fn service_and_peer_group_share_a_name_space() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "alpha"))).unwrap();

        let err = store
            .update(|tx| tx.create(&peer_group("pg1", "ALPHA")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NameConflict));

        // And the other direction.
        store.update(|tx| tx.create(&peer_group("pg2", "beta"))).unwrap();
        let err = store
            .update(|tx| tx.create(&service("s2", "Beta")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NameConflict));
    }

    #[test]
    fn update_keeping_own_name_is_allowed() {
        let store = test_store();
        let mut svc = service("s1", "web");
        store.update(|tx| tx.create(&svc)).unwrap();

        svc.spec.annotations.labels.insert("tier".into(), "front".into());
        store.update(|tx| tx.update(&svc)).unwrap();
    }

    #[test]
    fn rename_onto_taken_name_fails() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "web"))).unwrap();
        store.update(|tx| tx.create(&peer_group("pg1", "db"))).unwrap();

        let mut renamed = service("s1", "db");
        let err = store.update(|tx| tx.update(&renamed)).unwrap_err();
        assert!(matches!(err, StoreError::NameConflict));

        renamed.spec.annotations.name = "api".to_string();
        store.update(|tx| tx.update(&renamed)).unwrap();

        // The old name is released by the rename.
        store.update(|tx| tx.create(&service("s2", "web"))).unwrap();
    }

    // ── Find ───────────────────────────────────────────────────────

    #[test]
    fn find_by_name_preserves_original_case() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "WebApp"))).unwrap();

        let found: Vec<Service> = store
            .view(|tx| tx.find(&By::Name("webapp".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].spec.annotations.name, "WebApp");
    }

    #[test]
    fn find_by_name_prefix() {
        let store = test_store();
        store.update(|tx| {
            tx.create(&service("s1", "api-front"))?;
            tx.create(&service("s2", "api-back"))?;
            tx.create(&service("s3", "worker"))
        })
        .unwrap();

        let found: Vec<Service> = store
            .view(|tx| tx.find(&By::NamePrefix("api-".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn find_by_id_prefix() {
        let store = test_store();
        store.update(|tx| {
            tx.create(&service("svc-aa", "a"))?;
            tx.create(&service("svc-ab", "b"))?;
            tx.create(&service("other", "c"))
        })
        .unwrap();

        let found: Vec<Service> = store
            .view(|tx| tx.find(&By::IdPrefix("svc-".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn find_tasks_by_service_and_node() {
        let store = test_store();
        store.update(|tx| {
            tx.create(&task("t1", "s1", "n1"))?;
            tx.create(&task("t2", "s1", "n2"))?;
            tx.create(&task("t3", "s2", "n1"))
        })
        .unwrap();

        let by_service: Vec<Task> = store
            .view(|tx| tx.find(&By::ServiceId("s1".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(by_service.len(), 2);

        let by_node: Vec<Task> = store
            .view(|tx| tx.find(&By::NodeId("n1".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(by_node.len(), 2);
    }

    #[test]
    fn find_tasks_by_desired_state_follows_updates() {
        let store = test_store();
        let mut t = task("t1", "s1", "n1");
        store.update(|tx| tx.create(&t)).unwrap();

        let running: Vec<Task> = store
            .view(|tx| tx.find(&By::DesiredState(TaskState::Running)))
            .unwrap()
            .unwrap();
        assert_eq!(running.len(), 1);

        t.desired_state = TaskState::Remove;
        store.update(|tx| tx.update(&t)).unwrap();

        let running: Vec<Task> = store
            .view(|tx| tx.find(&By::DesiredState(TaskState::Running)))
            .unwrap()
            .unwrap();
        assert!(running.is_empty());

        let removing: Vec<Task> = store
            .view(|tx| tx.find(&By::DesiredState(TaskState::Remove)))
            .unwrap()
            .unwrap();
        assert_eq!(removing.len(), 1);
    }

    #[test]
    fn find_services_by_peer_group() {
        let store = test_store();
        store.update(|tx| {
            tx.create(&static_service("s1", "a", "g1", "n1"))?;
            tx.create(&static_service("s2", "b", "g1", "n2"))?;
            tx.create(&static_service("s3", "c", "g2", "n3"))?;
            tx.create(&service("s4", "d"))
        })
        .unwrap();

        let members: Vec<Service> = store
            .view(|tx| tx.find(&By::PeerGroup("g1".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(members.len(), 2);
    }

    #[test]
    fn find_by_custom_label() {
        let store = test_store();
        let mut svc = service("s1", "web");
        svc.spec.annotations.labels.insert("env".into(), "prod".into());
        store.update(|tx| tx.create(&svc)).unwrap();

        let found: Vec<Service> = store
            .view(|tx| tx.find(&By::Custom("env=prod".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 1);

        let found: Vec<Service> = store
            .view(|tx| tx.find(&By::CustomPrefix("env=".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 1);

        let found: Vec<Service> = store
            .view(|tx| tx.find(&By::Custom("env=dev".to_string())))
            .unwrap()
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn find_or_deduplicates() {
        let store = test_store();
        store.update(|tx| {
            tx.create(&task("t1", "s1", "n1"))?;
            tx.create(&task("t2", "s2", "n1"))
        })
        .unwrap();

        let found: Vec<Task> = store
            .view(|tx| {
                tx.find(&By::Or(vec![
                    By::ServiceId("s1".to_string()),
                    By::NodeId("n1".to_string()),
                ]))
            })
            .unwrap()
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn unsupported_selector_is_rejected() {
        let store = test_store();
        let err = store
            .view(|tx| tx.find::<Task>(&By::Name("x".to_string())))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFindBy));

        // Or() is rejected if any arm is unsupported.
        let err = store
            .view(|tx| {
                tx.find::<Service>(&By::Or(vec![
                    By::All,
                    By::NodeId("n1".to_string()),
                ]))
            })
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidFindBy));
    }

    #[test]
    fn lookup_by_name_is_case_insensitive() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "Alpha"))).unwrap();

        let found: Option<Service> = store
            .view(|tx| tx.lookup(IndexKind::Name, "alpha"))
            .unwrap()
            .unwrap();
        assert_eq!(found.unwrap().id, "s1");
    }

    // ── Events ─────────────────────────────────────────────────────

    #[test]
    fn committed_changes_publish_events_in_transaction_order() {
        let store = test_store();
        let mut watcher = store.watch_queue().watch();

        store
            .update(|tx| {
                tx.create(&service("s1", "a"))?;
                tx.create(&task("t1", "s1", "n1"))?;
                tx.delete::<Task>("t1")
            })
            .unwrap();

        assert!(matches!(watcher.try_next(), Some(Event::CreateService(s)) if s.id == "s1"));
        assert!(matches!(watcher.try_next(), Some(Event::CreateTask(t)) if t.id == "t1"));
        assert!(matches!(watcher.try_next(), Some(Event::DeleteTask(t)) if t.id == "t1"));
        assert!(watcher.try_next().is_none());
    }

    #[test]
    fn failed_transaction_publishes_nothing_and_rolls_back() {
        let store = test_store();
        let mut watcher = store.watch_queue().watch();

        let err = store
            .update(|tx| {
                tx.create(&service("s1", "a"))?;
                Err::<(), _>(StoreError::NotExist)
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotExist));
        assert!(watcher.try_next().is_none());

        let found: Option<Service> = store.view(|tx| tx.get("s1")).unwrap().unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn events_follow_commit_order_across_transactions() {
        let store = test_store();
        let mut watcher = store.watch_queue().watch();

        for i in 0..10 {
            store
                .update(|tx| tx.create(&service(&format!("s{i}"), &format!("name{i}"))))
                .unwrap();
        }

        for i in 0..10 {
            match watcher.try_next().unwrap() {
                Event::CreateService(s) => assert_eq!(s.id, format!("s{i}")),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    // ── Batch ──────────────────────────────────────────────────────

    #[test]
    fn batch_groups_updates_into_one_chunk() {
        let store = test_store();
        let mut watcher = store.watch_queue().watch();

        store
            .batch(|batch| {
                batch.update(|tx| tx.create(&service("s1", "a")))?;
                batch.update(|tx| tx.create(&service("s2", "b")))?;
                Ok(())
            })
            .unwrap();

        assert!(matches!(watcher.try_next(), Some(Event::CreateService(_))));
        assert!(matches!(watcher.try_next(), Some(Event::CreateService(_))));
    }

    #[test]
    fn batch_chunks_commit_partially_on_later_failure() {
        let store = test_store();

        let err = store
            .batch_with_cap(2, |batch| {
                batch.update(|tx| tx.create(&service("s1", "a")))?;
                batch.update(|tx| tx.create(&service("s2", "b")))?;
                // First chunk committed above; this one is lost.
                batch.update(|tx| tx.create(&service("s3", "c")))?;
                Err::<(), _>(StoreError::NotExist)
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::NotExist));

        let all: Vec<Service> = store.view(|tx| tx.find(&By::All)).unwrap().unwrap();
        let mut ids: Vec<_> = all.into_iter().map(|s| s.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["s1", "s2"]);
    }

    #[test]
    fn batch_sub_update_error_does_not_abort_earlier_work() {
        let store = test_store();

        store
            .batch(|batch| {
                batch.update(|tx| tx.create(&service("s1", "a")))?;
                // Caller tolerates individual failures and continues.
                let err = batch.update(|tx| tx.create(&service("s1", "dup")));
                assert!(matches!(err, Err(StoreError::Exist)));
                batch.update(|tx| tx.create(&service("s2", "b")))?;
                Ok(())
            })
            .unwrap();

        let all: Vec<Service> = store.view(|tx| tx.find(&By::All)).unwrap().unwrap();
        assert_eq!(all.len(), 2);
    }

    // ── Snapshot ───────────────────────────────────────────────────

    #[test]
    fn snapshot_round_trip_restores_objects_and_indexes() {
        let store = test_store();
        store
            .update(|tx| {
                tx.create(&service("s1", "alpha"))?;
                tx.create(&task("t1", "s1", "n1"))?;
                tx.create(&peer_group("pg1", "beta"))
            })
            .unwrap();

        let snapshot = store.save().unwrap();

        let other = test_store();
        other.update(|tx| tx.create(&service("junk", "junk"))).unwrap();
        other.restore(&snapshot).unwrap();

        let services: Vec<Service> = other.view(|tx| tx.find(&By::All)).unwrap().unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "s1");

        let junk: Option<Service> = other.view(|tx| tx.get("junk")).unwrap().unwrap();
        assert!(junk.is_none());

        // Indexes were rebuilt: names still conflict.
        let err = other
            .update(|tx| tx.create(&peer_group("pg2", "ALPHA")))
            .unwrap_err();
        assert!(matches!(err, StoreError::NameConflict));

        let tasks: Vec<Task> = other
            .view(|tx| tx.find(&By::ServiceId("s1".to_string())))
            .unwrap()
            .unwrap();
        assert_eq!(tasks.len(), 1);
    }

    // ── Store-action replay ────────────────────────────────────────

    #[test]
    fn apply_store_action_crud() {
        let store = test_store();
        store
            .update(|tx| {
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Create,
                    target: StoreTarget::Service(service("s1", "a")),
                })?;
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Update,
                    target: StoreTarget::Service(service("s1", "a2")),
                })?;
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Remove,
                    target: StoreTarget::Service(service("s1", "a2")),
                })
            })
            .unwrap();

        let found: Option<Service> = store.view(|tx| tx.get("s1")).unwrap().unwrap();
        assert!(found.is_none());
    }

    #[test]
    fn apply_store_action_is_idempotent() {
        let store = test_store();
        store
            .update(|tx| {
                // Create twice: second degrades to an update.
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Create,
                    target: StoreTarget::Node(Node {
                        id: "n1".to_string(),
                        ..Default::default()
                    }),
                })?;
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Create,
                    target: StoreTarget::Node(Node {
                        id: "n1".to_string(),
                        ..Default::default()
                    }),
                })?;
                // Update of a missing object degrades to a create.
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Update,
                    target: StoreTarget::Node(Node {
                        id: "n2".to_string(),
                        ..Default::default()
                    }),
                })?;
                // Remove of a missing object is a no-op.
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Remove,
                    target: StoreTarget::Node(Node {
                        id: "n3".to_string(),
                        ..Default::default()
                    }),
                })
            })
            .unwrap();

        let nodes: Vec<Node> = store.view(|tx| tx.find(&By::All)).unwrap().unwrap();
        assert_eq!(nodes.len(), 2);
    }

    #[test]
    fn apply_store_action_rejects_unknown_kind() {
        let store = test_store();
        let err = store
            .update(|tx| {
                tx.apply_store_action(StoreAction {
                    kind: StoreActionKind::Unknown,
                    target: StoreTarget::Node(Node::default()),
                })
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownStoreAction));
    }

    // ── Persistence ────────────────────────────────────────────────

    #[test]
    fn file_backed_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("store.redb");

        {
            let store = MemoryStore::open(&db_path).unwrap();
            store.update(|tx| tx.create(&service("s1", "web"))).unwrap();
        }

        let store = MemoryStore::open(&db_path).unwrap();
        let found: Option<Service> = store.view(|tx| tx.get("s1")).unwrap().unwrap();
        assert_eq!(found.unwrap().spec.annotations.name, "web");
    }

    // ── Visibility ─────────────────────────────────────────────────

    #[test]
    fn committed_write_is_visible_to_later_views() {
        let store = test_store();
        store.update(|tx| tx.create(&service("s1", "a"))).unwrap();

        let visible = store
            .view(|tx| tx.get::<Service>("s1").unwrap().is_some())
            .unwrap();
        assert!(visible);
    }

    #[test]
    fn write_tx_reads_its_own_uncommitted_changes() {
        let store = test_store();
        store
            .update(|tx| {
                tx.create(&service("s1", "a"))?;
                let found: Option<Service> = tx.get("s1")?;
                assert!(found.is_some());
                Ok(())
            })
            .unwrap();
    }
}
