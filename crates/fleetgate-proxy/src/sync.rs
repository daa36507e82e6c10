//! Watcher glue: turns store change events into reconcile calls.
//!
//! `ProxySync` keeps the last known facts per cluster (the cluster record,
//! its machine statuses and its exposed services) and recomputes the
//! cluster's desired `alias → port` and host list from scratch after every
//! event. Duplicate events therefore converge to the same state, and a
//! desired state equal to the last applied one is not reconciled again.
//!
//! A single task owns the `ProxySync`; it is the single writer for every
//! cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use fleetgate_state::{
    Alias, Change, ClusterId, ClusterRecord, ExposedService, MachineId, MachineStatus,
    ResourceEvent, ServiceId, StateStore,
};

use crate::error::ProxyError;
use crate::workload::WorkloadProxy;

/// What one cluster should look like in the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    pub aliases: BTreeMap<Alias, u16>,
    pub hosts: Vec<String>,
}

impl DesiredState {
    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[derive(Debug, Default)]
struct ClusterFacts {
    record: Option<ClusterRecord>,
    machines: HashMap<MachineId, MachineStatus>,
    services: HashMap<ServiceId, ExposedService>,
}

impl ClusterFacts {
    fn is_empty(&self) -> bool {
        self.record.is_none() && self.machines.is_empty() && self.services.is_empty()
    }

    fn desired(&self) -> DesiredState {
        let enabled = self
            .record
            .as_ref()
            .is_some_and(|r| r.workload_proxy_enabled);
        if !enabled || self.services.is_empty() {
            return DesiredState::default();
        }

        // Aliases are matched against lowercased hostnames. Two services
        // claiming the same alias: the lowest service id wins.
        let mut services: Vec<&ExposedService> = self.services.values().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        let mut aliases = BTreeMap::new();
        for svc in services {
            aliases
                .entry(svc.alias.to_ascii_lowercase())
                .or_insert(svc.port);
        }

        let hosts: BTreeSet<String> = self
            .machines
            .values()
            .filter(|m| m.ready && !m.management_address.is_empty())
            .map(|m| m.management_address.clone())
            .collect();

        DesiredState {
            aliases,
            hosts: hosts.into_iter().collect(),
        }
    }
}

/// Feeds store changes into a [`WorkloadProxy`].
pub struct ProxySync {
    proxy: Arc<WorkloadProxy>,
    clusters: HashMap<ClusterId, ClusterFacts>,
    machine_owner: HashMap<MachineId, ClusterId>,
    service_owner: HashMap<ServiceId, ClusterId>,
    applied: HashMap<ClusterId, DesiredState>,
    failed: BTreeSet<ClusterId>,
}

impl ProxySync {
    pub fn new(proxy: Arc<WorkloadProxy>) -> Self {
        Self {
            proxy,
            clusters: HashMap::new(),
            machine_owner: HashMap::new(),
            service_owner: HashMap::new(),
            applied: HashMap::new(),
            failed: BTreeSet::new(),
        }
    }

    /// Record an event and return the clusters whose desired state may
    /// have changed.
    pub fn apply(&mut self, event: &ResourceEvent) -> Vec<ClusterId> {
        match event {
            ResourceEvent::Cluster(change) => {
                let id = change.resource().id.clone();
                let facts = self.clusters.entry(id.clone()).or_default();
                facts.record = match change {
                    Change::Upserted(r) => Some(r.clone()),
                    Change::Destroyed(_) => None,
                };
                vec![id]
            }
            ResourceEvent::MachineStatus(change) => {
                let machine = change.resource();
                let mut affected = self.forget_machine(&machine.id);
                if let Change::Upserted(m) = change {
                    self.machine_owner
                        .insert(m.id.clone(), m.cluster_id.clone());
                    self.clusters
                        .entry(m.cluster_id.clone())
                        .or_default()
                        .machines
                        .insert(m.id.clone(), m.clone());
                }
                push_unique(&mut affected, &machine.cluster_id);
                affected
            }
            ResourceEvent::ExposedService(change) => {
                let svc = change.resource();
                let mut affected = self.forget_service(&svc.id);
                if let Change::Upserted(s) = change {
                    self.service_owner
                        .insert(s.id.clone(), s.cluster_id.clone());
                    self.clusters
                        .entry(s.cluster_id.clone())
                        .or_default()
                        .services
                        .insert(s.id.clone(), s.clone());
                }
                push_unique(&mut affected, &svc.cluster_id);
                affected
            }
        }
    }

    fn forget_machine(&mut self, id: &str) -> Vec<ClusterId> {
        let Some(owner) = self.machine_owner.remove(id) else {
            return Vec::new();
        };
        if let Some(facts) = self.clusters.get_mut(&owner) {
            facts.machines.remove(id);
        }
        vec![owner]
    }

    fn forget_service(&mut self, id: &str) -> Vec<ClusterId> {
        let Some(owner) = self.service_owner.remove(id) else {
            return Vec::new();
        };
        if let Some(facts) = self.clusters.get_mut(&owner) {
            facts.services.remove(id);
        }
        vec![owner]
    }

    /// Desired state of a cluster from the facts seen so far.
    pub fn desired(&self, cluster_id: &str) -> DesiredState {
        self.clusters
            .get(cluster_id)
            .map(ClusterFacts::desired)
            .unwrap_or_default()
    }

    /// Clusters whose last reconcile failed.
    pub fn failed(&self) -> impl Iterator<Item = &ClusterId> {
        self.failed.iter()
    }

    /// Reconcile one cluster if its desired state differs from what was
    /// last applied.
    pub async fn sync_cluster(&mut self, cluster_id: &str) -> Result<(), ProxyError> {
        let desired = self.desired(cluster_id);
        let applied = self.applied.get(cluster_id);
        let unchanged = match applied {
            Some(prev) => prev == &desired,
            None => desired.is_empty(),
        };
        if unchanged && !self.failed.contains(cluster_id) {
            debug!(%cluster_id, "desired state unchanged");
            self.prune(cluster_id);
            return Ok(());
        }

        match self
            .proxy
            .reconcile(cluster_id, &desired.aliases, &desired.hosts)
            .await
        {
            Ok(()) => {
                info!(
                    %cluster_id,
                    aliases = desired.aliases.len(),
                    hosts = desired.hosts.len(),
                    "cluster reconciled"
                );
                self.failed.remove(cluster_id);
                if desired.is_empty() {
                    self.applied.remove(cluster_id);
                } else {
                    self.applied.insert(cluster_id.to_string(), desired);
                }
                self.prune(cluster_id);
                Ok(())
            }
            Err(e) => {
                self.failed.insert(cluster_id.to_string());
                Err(e)
            }
        }
    }

    fn prune(&mut self, cluster_id: &str) {
        if self.clusters.get(cluster_id).is_some_and(ClusterFacts::is_empty) {
            self.clusters.remove(cluster_id);
        }
    }

    /// Apply one event, then reconcile the affected clusters and retry any
    /// cluster whose previous reconcile failed.
    pub async fn handle(&mut self, event: &ResourceEvent) {
        let mut targets: BTreeSet<ClusterId> = self.apply(event).into_iter().collect();
        targets.extend(self.failed.iter().cloned());
        self.sync_all(targets).await;
    }

    /// Rebuild every fact from a full snapshot and reconcile all clusters,
    /// including ones that disappeared since the last sync.
    pub async fn resync(&mut self, snapshot: &[ResourceEvent]) {
        self.clusters.clear();
        self.machine_owner.clear();
        self.service_owner.clear();
        for event in snapshot {
            self.apply(event);
        }

        let mut targets: BTreeSet<ClusterId> = self.clusters.keys().cloned().collect();
        targets.extend(self.applied.keys().cloned());
        targets.extend(self.failed.iter().cloned());
        info!(clusters = targets.len(), "full resync");
        self.sync_all(targets).await;
    }

    async fn sync_all(&mut self, targets: BTreeSet<ClusterId>) {
        for cluster_id in targets {
            if let Err(e) = self.sync_cluster(&cluster_id).await {
                warn!(%cluster_id, error = %e, "reconcile failed, will retry");
            }
        }
    }

    /// Consume the store's change feed until shutdown.
    ///
    /// `events` must be subscribed before calling so nothing written
    /// between the initial snapshot and the first receive is lost.
    pub async fn run(
        mut self,
        store: StateStore,
        mut events: broadcast::Receiver<ResourceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.resync_from(&store).await;

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => self.handle(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "change feed lagged, resyncing");
                        self.resync_from(&store).await;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("proxy sync stopped");
    }

    async fn resync_from(&mut self, store: &StateStore) {
        match store.snapshot_events() {
            Ok(snapshot) => self.resync(&snapshot).await,
            Err(e) => warn!(error = %e, "failed to read store snapshot"),
        }
    }
}

fn push_unique(list: &mut Vec<ClusterId>, id: &ClusterId) {
    if !list.contains(id) {
        list.push(id.clone());
    }
}
