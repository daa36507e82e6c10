//! StateStore — redb-backed state persistence for fleetgate.
//!
//! Provides typed CRUD operations over clusters, machine statuses, exposed
//! services, public keys, identities and cluster ACLs. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::event::{Change, ResourceEvent};
use crate::tables::*;
use crate::types::*;

/// Capacity of the change feed; slow subscribers observe `Lagged`.
const EVENT_CAPACITY: usize = 1024;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type Table = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<ResourceEvent>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [CLUSTERS, MACHINES, SERVICES, PUBLIC_KEYS, IDENTITIES, ACLS] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Subscribe to cluster, machine status and exposed service changes.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    fn publish(&self, event: ResourceEvent) {
        // No subscribers is not an error: the proxy may not be running yet.
        let _ = self.events.send(event);
    }

    // ── Generic table access ───────────────────────────────────────

    fn put<T: Serialize>(&self, table: Table, key: &str, value: &T) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn list<T: DeserializeOwned>(&self, table: Table) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    /// Remove a key, returning the value it held.
    fn take<T: DeserializeOwned>(&self, table: Table, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed = {
            let mut table = txn.open_table(table).map_err(map_err!(Table))?;
            let guard = table.remove(key).map_err(map_err!(Write))?;
            match guard {
                Some(v) => Some(serde_json::from_slice(v.value()).map_err(map_err!(Deserialize))?),
                None => None,
            }
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Clusters ───────────────────────────────────────────────────

    /// Insert or update a cluster record.
    pub fn put_cluster(&self, cluster: &ClusterRecord) -> StateResult<()> {
        self.put(CLUSTERS, &cluster.id, cluster)?;
        debug!(cluster_id = %cluster.id, "cluster stored");
        self.publish(ResourceEvent::Cluster(Change::Upserted(cluster.clone())));
        Ok(())
    }

    /// Get a cluster by ID.
    pub fn get_cluster(&self, id: &str) -> StateResult<Option<ClusterRecord>> {
        self.get(CLUSTERS, id)
    }

    /// List all clusters.
    pub fn list_clusters(&self) -> StateResult<Vec<ClusterRecord>> {
        self.list(CLUSTERS)
    }

    /// Delete a cluster. Returns true if it existed.
    pub fn delete_cluster(&self, id: &str) -> StateResult<bool> {
        let removed: Option<ClusterRecord> = self.take(CLUSTERS, id)?;
        debug!(cluster_id = %id, existed = removed.is_some(), "cluster deleted");
        Ok(match removed {
            Some(cluster) => {
                self.publish(ResourceEvent::Cluster(Change::Destroyed(cluster)));
                true
            }
            None => false,
        })
    }

    // ── Machine statuses ───────────────────────────────────────────

    /// Insert or update a machine status.
    pub fn put_machine(&self, machine: &MachineStatus) -> StateResult<()> {
        self.put(MACHINES, &machine.id, machine)?;
        debug!(machine_id = %machine.id, cluster_id = %machine.cluster_id, "machine status stored");
        self.publish(ResourceEvent::MachineStatus(Change::Upserted(machine.clone())));
        Ok(())
    }

    /// List all machine statuses.
    pub fn list_machines(&self) -> StateResult<Vec<MachineStatus>> {
        self.list(MACHINES)
    }

    /// Delete a machine status. Returns true if it existed.
    pub fn delete_machine(&self, id: &str) -> StateResult<bool> {
        let removed: Option<MachineStatus> = self.take(MACHINES, id)?;
        Ok(match removed {
            Some(machine) => {
                self.publish(ResourceEvent::MachineStatus(Change::Destroyed(machine)));
                true
            }
            None => false,
        })
    }

    // ── Exposed services ───────────────────────────────────────────

    /// Insert or update an exposed service.
    pub fn put_service(&self, svc: &ExposedService) -> StateResult<()> {
        self.put(SERVICES, &svc.id, svc)?;
        debug!(service_id = %svc.id, alias = %svc.alias, "exposed service stored");
        self.publish(ResourceEvent::ExposedService(Change::Upserted(svc.clone())));
        Ok(())
    }

    /// List all exposed services.
    pub fn list_services(&self) -> StateResult<Vec<ExposedService>> {
        self.list(SERVICES)
    }

    /// Delete an exposed service. Returns true if it existed.
    pub fn delete_service(&self, id: &str) -> StateResult<bool> {
        let removed: Option<ExposedService> = self.take(SERVICES, id)?;
        Ok(match removed {
            Some(svc) => {
                self.publish(ResourceEvent::ExposedService(Change::Destroyed(svc)));
                true
            }
            None => false,
        })
    }

    /// Replay the current contents as `Upserted` events.
    ///
    /// Used to seed a consumer that subscribed after resources were written.
    pub fn snapshot_events(&self) -> StateResult<Vec<ResourceEvent>> {
        let mut events = Vec::new();
        for c in self.list_clusters()? {
            events.push(ResourceEvent::Cluster(Change::Upserted(c)));
        }
        for m in self.list_machines()? {
            events.push(ResourceEvent::MachineStatus(Change::Upserted(m)));
        }
        for s in self.list_services()? {
            events.push(ResourceEvent::ExposedService(Change::Upserted(s)));
        }
        Ok(events)
    }

    // ── Keys and access ────────────────────────────────────────────

    /// Insert or update a public key.
    pub fn put_public_key(&self, key: &PublicKeyRecord) -> StateResult<()> {
        self.put(PUBLIC_KEYS, &key.id, key)
    }

    /// Get a public key by ID.
    pub fn get_public_key(&self, id: &str) -> StateResult<Option<PublicKeyRecord>> {
        self.get(PUBLIC_KEYS, id)
    }

    /// Delete a public key. Returns true if it existed.
    pub fn delete_public_key(&self, id: &str) -> StateResult<bool> {
        Ok(self.take::<PublicKeyRecord>(PUBLIC_KEYS, id)?.is_some())
    }

    /// Insert or update an identity.
    pub fn put_identity(&self, identity: &IdentityRecord) -> StateResult<()> {
        self.put(IDENTITIES, &identity.id, identity)
    }

    /// Get an identity by ID.
    pub fn get_identity(&self, id: &str) -> StateResult<Option<IdentityRecord>> {
        self.get(IDENTITIES, id)
    }

    /// Replace the access control list of a cluster.
    pub fn put_acl(&self, acl: &ClusterAcl) -> StateResult<()> {
        self.put(ACLS, &acl.cluster_id, acl)
    }

    /// Get the access control list of a cluster.
    pub fn get_acl(&self, cluster_id: &str) -> StateResult<Option<ClusterAcl>> {
        self.get(ACLS, cluster_id)
    }
}
