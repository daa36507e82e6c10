//! The workload proxy as seen by its callers.
//!
//! [`WorkloadProxy`] ties the [`AliasIndex`] to the [`Reconciler`]: the
//! watcher glue hands it `alias → port` plus the cluster's backend hosts,
//! and request handlers ask it for a [`ReverseProxy`] by alias.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use fleetgate_state::{Alias, ClusterId};

use crate::alias::{AliasEntry, AliasIndex, ClusterDescriptor};
use crate::balancer::{BackendStatus, BalancerConfig};
use crate::error::ProxyError;
use crate::memnet::MemoryNetwork;
use crate::reconciler::Reconciler;
use crate::reverse::ReverseProxy;

/// Diagnostics view of one cluster.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub cluster_id: ClusterId,
    pub hosts: Vec<String>,
    pub in_use_port: u16,
    pub backends: BTreeMap<Alias, Vec<BackendStatus>>,
}

pub struct WorkloadProxy {
    index: Arc<AliasIndex>,
    reconciler: Reconciler,
}

impl WorkloadProxy {
    pub fn new(config: BalancerConfig) -> Self {
        Self::with_network(MemoryNetwork::new(), config)
    }

    pub fn with_network(network: MemoryNetwork, config: BalancerConfig) -> Self {
        let index = Arc::new(AliasIndex::new());
        let reconciler = Reconciler::new(Arc::clone(&index), network, config);
        Self { index, reconciler }
    }

    /// Converge one cluster to `aliases` served by `hosts`.
    ///
    /// Each alias is balanced over `host:port` for every host. An alias
    /// conflict is reported before anything changes.
    pub async fn reconcile(
        &self,
        cluster_id: &str,
        aliases: &BTreeMap<Alias, u16>,
        hosts: &[String],
    ) -> Result<(), ProxyError> {
        if let Err(conflict) = self.index.replace_cluster(cluster_id, aliases, hosts) {
            warn!(%cluster_id, error = %conflict, "alias conflict, cluster not reconciled");
            return Err(conflict.into());
        }

        let desired: BTreeMap<Alias, Vec<String>> = aliases
            .iter()
            .map(|(alias, port)| {
                let addresses = hosts.iter().map(|h| join_host_port(h, *port)).collect();
                (alias.clone(), addresses)
            })
            .collect();
        self.reconciler.reconcile(cluster_id, &desired).await
    }

    /// Reverse proxy and owning cluster for an alias.
    pub fn get_proxy(&self, alias: &str) -> Option<(ReverseProxy, ClusterId)> {
        self.reconciler.get_proxy(alias)
    }

    /// Forget a single alias and stop its balancer.
    pub async fn drop_alias(&self, alias: &str) -> Result<Option<ClusterDescriptor>, ProxyError> {
        let Some(descriptor) = self.index.drop_alias(alias) else {
            debug!(%alias, "drop of unknown alias");
            return Ok(None);
        };
        self.reconciler.remove_lb(&descriptor.id, alias).await?;
        Ok(Some(descriptor))
    }

    /// Hosts, in-use port and backend health of a cluster.
    pub fn cluster_status(&self, cluster_id: &str) -> Option<ClusterStatus> {
        let (hosts, in_use_port) = self.index.active_hosts_port(cluster_id)?;
        Some(ClusterStatus {
            cluster_id: cluster_id.to_string(),
            hosts,
            in_use_port,
            backends: self.reconciler.cluster_backends(cluster_id),
        })
    }

    pub fn aliases(&self) -> Vec<AliasEntry> {
        self.index.all()
    }

    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        self.reconciler.shutdown().await
    }
}

/// `host:port`, bracketing bare IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
