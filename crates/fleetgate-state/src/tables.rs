//! redb table definitions for the fleetgate state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Cluster records keyed by `{cluster_id}`.
pub const CLUSTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("clusters");

/// Machine statuses keyed by `{machine_id}`.
pub const MACHINES: TableDefinition<&str, &[u8]> = TableDefinition::new("machine_statuses");

/// Exposed services keyed by `{service_id}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("exposed_services");

/// Public keys keyed by `{public_key_id}`.
pub const PUBLIC_KEYS: TableDefinition<&str, &[u8]> = TableDefinition::new("public_keys");

/// Identities keyed by `{identity}`.
pub const IDENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("identities");

/// Per-cluster access control lists keyed by `{cluster_id}`.
pub const ACLS: TableDefinition<&str, &[u8]> = TableDefinition::new("cluster_acls");
