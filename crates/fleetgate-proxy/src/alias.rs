//! Maps public aliases to their cluster and backend port.
//!
//! An alias is unique across all clusters. Each cluster additionally
//! remembers one "in-use" port: the port of the alias whose load balancer
//! is currently probed on the cluster's behalf, so health history carries
//! over when aliases come and go.
//!
//! All state sits behind one mutex, so lookups never observe a half
//! applied [`AliasIndex::replace_cluster`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tracing::debug;

use fleetgate_state::{Alias, ClusterId};

use crate::error::AliasConflict;

/// Snapshot of a cluster's entry in the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterDescriptor {
    pub id: ClusterId,
    pub aliases: BTreeSet<Alias>,
    pub hosts: Vec<String>,
    pub in_use_port: Option<u16>,
}

/// One alias as returned by [`AliasIndex::all`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AliasEntry {
    pub alias: Alias,
    pub port: u16,
    pub cluster: ClusterDescriptor,
}

#[derive(Debug)]
struct Entry {
    port: u16,
    cluster_id: ClusterId,
}

#[derive(Debug, Default)]
struct Inner {
    aliases: HashMap<Alias, Entry>,
    clusters: HashMap<ClusterId, ClusterDescriptor>,
}

impl Inner {
    fn remove_cluster(&mut self, cluster_id: &str) -> Option<ClusterDescriptor> {
        let descriptor = self.clusters.remove(cluster_id)?;
        for alias in &descriptor.aliases {
            self.aliases.remove(alias);
        }
        Some(descriptor)
    }

    fn alias_ports<'a>(&self, descriptor: &'a ClusterDescriptor) -> BTreeMap<&'a str, u16> {
        descriptor
            .aliases
            .iter()
            .filter_map(|a| self.aliases.get(a).map(|e| (a.as_str(), e.port)))
            .collect()
    }
}

/// In-memory alias ↔ cluster index.
#[derive(Debug, Default)]
pub struct AliasIndex {
    inner: Mutex<Inner>,
}

impl AliasIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the aliases and hosts of a cluster wholesale.
    ///
    /// An empty `aliases` map removes the cluster. All aliases are checked
    /// for conflicts with other clusters before anything is written.
    pub fn replace_cluster(
        &self,
        cluster_id: &str,
        aliases: &BTreeMap<Alias, u16>,
        hosts: &[String],
    ) -> Result<(), AliasConflict> {
        let mut inner = self.lock();

        if aliases.is_empty() {
            if inner.remove_cluster(cluster_id).is_some() {
                debug!(%cluster_id, "cluster removed from alias index");
            }
            return Ok(());
        }

        for alias in aliases.keys() {
            if let Some(entry) = inner.aliases.get(alias)
                && entry.cluster_id != cluster_id
            {
                return Err(AliasConflict {
                    alias: alias.clone(),
                    owner: entry.cluster_id.clone(),
                });
            }
        }

        let unchanged = inner.clusters.get(cluster_id).is_some_and(|existing| {
            let current = inner.alias_ports(existing);
            current.len() == aliases.len()
                && aliases
                    .iter()
                    .all(|(a, p)| current.get(a.as_str()) == Some(p))
        });

        if unchanged {
            if let Some(descriptor) = inner.clusters.get_mut(cluster_id) {
                descriptor.hosts = hosts.to_vec();
            }
            return Ok(());
        }

        inner.remove_cluster(cluster_id);
        for (alias, port) in aliases {
            inner.aliases.insert(
                alias.clone(),
                Entry {
                    port: *port,
                    cluster_id: cluster_id.to_string(),
                },
            );
        }
        inner.clusters.insert(
            cluster_id.to_string(),
            ClusterDescriptor {
                id: cluster_id.to_string(),
                aliases: aliases.keys().cloned().collect(),
                hosts: hosts.to_vec(),
                in_use_port: None,
            },
        );
        debug!(%cluster_id, aliases = aliases.len(), hosts = hosts.len(), "cluster aliases replaced");
        Ok(())
    }

    /// Cluster and backend port of an alias.
    pub fn cluster_port(&self, alias: &str) -> Option<(ClusterId, u16)> {
        let inner = self.lock();
        inner
            .aliases
            .get(alias)
            .map(|e| (e.cluster_id.clone(), e.port))
    }

    /// Backend hosts of a cluster and the port currently in use.
    ///
    /// Keeps the previous in-use port while an alias still maps to it;
    /// otherwise adopts the port of the lexically first alias and records
    /// it as the new in-use port.
    pub fn active_hosts_port(&self, cluster_id: &str) -> Option<(Vec<String>, u16)> {
        let mut inner = self.lock();
        let descriptor = inner.clusters.get(cluster_id)?;
        let ports = inner.alias_ports(descriptor);

        if let Some(port) = descriptor.in_use_port
            && ports.values().any(|p| *p == port)
        {
            return Some((descriptor.hosts.clone(), port));
        }

        let port = *ports.values().next()?;
        let descriptor = inner.clusters.get_mut(cluster_id)?;
        descriptor.in_use_port = Some(port);
        Some((descriptor.hosts.clone(), port))
    }

    /// Remove a single alias, returning the owning cluster as it was.
    pub fn drop_alias(&self, alias: &str) -> Option<ClusterDescriptor> {
        let mut inner = self.lock();
        let entry = inner.aliases.remove(alias)?;
        let descriptor = inner.clusters.get_mut(&entry.cluster_id)?;
        let snapshot = descriptor.clone();

        descriptor.aliases.remove(alias);
        if descriptor.in_use_port == Some(entry.port) {
            descriptor.in_use_port = None;
        }
        if descriptor.aliases.is_empty() {
            inner.clusters.remove(&entry.cluster_id);
        }
        debug!(%alias, cluster_id = %entry.cluster_id, "alias dropped");
        Some(snapshot)
    }

    /// Snapshot of every alias, sorted by alias.
    pub fn all(&self) -> Vec<AliasEntry> {
        let inner = self.lock();
        let mut entries: Vec<AliasEntry> = inner
            .aliases
            .iter()
            .filter_map(|(alias, entry)| {
                let cluster = inner.clusters.get(&entry.cluster_id)?;
                Some(AliasEntry {
                    alias: alias.clone(),
                    port: entry.port,
                    cluster: cluster.clone(),
                })
            })
            .collect();
        entries.sort_by(|a, b| a.alias.cmp(&b.alias));
        entries
    }
}
