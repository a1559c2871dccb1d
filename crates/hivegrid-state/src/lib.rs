//! hivegrid-state — multi-indexed transactional object store.
//!
//! Backed by [redb](https://docs.rs/redb), in-memory by default with an
//! optional file-backed mode. Holds the cluster's entire object model
//! (services, tasks, nodes, the singleton cluster, secrets, configs,
//! certificate authorities, peer groups) behind snapshot-isolated reads
//! and atomic write transactions.
//!
//! # Architecture
//!
//! Objects are JSON-serialized into redb `&[u8]` value columns; each
//! entity type carries a data table and an index table of composite-key
//! rows answered with prefix scans. Committed transactions publish
//! their changes, in order, to a [`watch::WatchQueue`] with bounded
//! per-subscriber buffers.
//!
//! The `MemoryStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and is the only shared mutable resource in the
//! control plane.

pub mod error;
pub mod event;
pub mod identity;
pub mod object;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use error::{StoreError, StoreResult};
pub use event::{Event, EventKind, StoreAction, StoreActionKind, StoreTarget};
pub use object::{By, IndexKind, StoreObject};
pub use store::{Batch, MemoryStore, ReadTx, StoreSnapshot, WriteTx, MAX_CHANGES_PER_BATCH};
pub use types::*;
pub use watch::{WatchError, WatchQueue, Watcher, WATCH_QUEUE_CAPACITY};
