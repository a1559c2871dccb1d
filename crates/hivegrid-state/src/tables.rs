//! redb table definitions for the hivegrid object store.
//!
//! Each entity type gets a data table (`id → JSON`) and an index table
//! holding composite rows `"<index>\x1f<key>\x1f<id>" → id`. Index rows
//! are matched with prefix scans.

use redb::TableDefinition;

/// A data/index table pair backing one entity type.
#[derive(Clone, Copy)]
pub struct EntityTable {
    pub name: &'static str,
    pub data: TableDefinition<'static, &'static str, &'static [u8]>,
    pub index: TableDefinition<'static, &'static str, &'static str>,
}

pub const SERVICE_TABLE: EntityTable = EntityTable {
    name: "service",
    data: TableDefinition::new("services"),
    index: TableDefinition::new("services_idx"),
};

pub const TASK_TABLE: EntityTable = EntityTable {
    name: "task",
    data: TableDefinition::new("tasks"),
    index: TableDefinition::new("tasks_idx"),
};

pub const NODE_TABLE: EntityTable = EntityTable {
    name: "node",
    data: TableDefinition::new("nodes"),
    index: TableDefinition::new("nodes_idx"),
};

pub const CLUSTER_TABLE: EntityTable = EntityTable {
    name: "cluster",
    data: TableDefinition::new("clusters"),
    index: TableDefinition::new("clusters_idx"),
};

pub const SECRET_TABLE: EntityTable = EntityTable {
    name: "secret",
    data: TableDefinition::new("secrets"),
    index: TableDefinition::new("secrets_idx"),
};

pub const CONFIG_TABLE: EntityTable = EntityTable {
    name: "config",
    data: TableDefinition::new("configs"),
    index: TableDefinition::new("configs_idx"),
};

pub const CERTIFICATE_AUTHORITY_TABLE: EntityTable = EntityTable {
    name: "certificate_authority",
    data: TableDefinition::new("certificate_authorities"),
    index: TableDefinition::new("certificate_authorities_idx"),
};

pub const PEER_GROUP_TABLE: EntityTable = EntityTable {
    name: "peer_group",
    data: TableDefinition::new("peer_groups"),
    index: TableDefinition::new("peer_groups_idx"),
};

/// Every entity table, for bulk creation and snapshot plumbing.
pub const ALL_TABLES: &[EntityTable] = &[
    SERVICE_TABLE,
    TASK_TABLE,
    NODE_TABLE,
    CLUSTER_TABLE,
    SECRET_TABLE,
    CONFIG_TABLE,
    CERTIFICATE_AUTHORITY_TABLE,
    PEER_GROUP_TABLE,
];
