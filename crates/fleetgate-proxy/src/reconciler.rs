//! One load balancer per exposed (cluster, alias).
//!
//! Each call to [`Reconciler::reconcile`] converges the running balancers
//! of one cluster to the desired alias → backend address lists:
//!
//! ```text
//! absent ──create+start──▶ active ──route reconciled──▶ active
//!    ▲                        │
//!    └──────shutdown──────────┘  (alias dropped or no backends left)
//! ```
//!
//! Calls for different clusters may run concurrently; calls for the same
//! cluster must be serialized by the caller. [`Reconciler::shutdown`] waits
//! for in-flight calls, and every later call fails with
//! [`ProxyError::Closed`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use fleetgate_state::{Alias, ClusterId};

use crate::alias::AliasIndex;
use crate::balancer::{BackendStatus, BalancerConfig, TcpLoadBalancer};
use crate::error::ProxyError;
use crate::memnet::MemoryNetwork;
use crate::reverse::ReverseProxy;

struct LoadBalancerState {
    balancer: Arc<TcpLoadBalancer>,
    addresses: Vec<String>,
}

type ClusterBalancers = HashMap<Alias, LoadBalancerState>;

/// Owns the per-alias load balancers of every cluster.
pub struct Reconciler {
    index: Arc<AliasIndex>,
    network: MemoryNetwork,
    config: BalancerConfig,
    clusters: Mutex<HashMap<ClusterId, ClusterBalancers>>,
    /// Read-held by reconcile and remove, write-held by shutdown.
    closed: RwLock<bool>,
}

impl Reconciler {
    pub fn new(index: Arc<AliasIndex>, network: MemoryNetwork, config: BalancerConfig) -> Self {
        Self {
            index,
            network,
            config,
            clusters: Mutex::new(HashMap::new()),
            closed: RwLock::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ClusterId, ClusterBalancers>> {
        self.clusters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Converge the balancers of `cluster_id` to `desired`.
    ///
    /// Aliases with an empty address list are treated as absent. Failures
    /// on one alias do not stop the others; all of them are returned.
    pub async fn reconcile(
        &self,
        cluster_id: &str,
        desired: &BTreeMap<Alias, Vec<String>>,
    ) -> Result<(), ProxyError> {
        let closed = self.closed.read().await;
        if *closed {
            return Err(ProxyError::Closed);
        }

        let desired: BTreeMap<&Alias, &Vec<String>> =
            desired.iter().filter(|(_, addrs)| !addrs.is_empty()).collect();

        let mut to_remove = Vec::new();
        let mut to_update = Vec::new();
        let mut to_create = Vec::new();
        {
            let mut clusters = self.lock();
            let current = clusters.entry(cluster_id.to_string()).or_default();

            let stale: Vec<Alias> = current
                .keys()
                .filter(|a| !desired.contains_key(a))
                .cloned()
                .collect();
            for alias in stale {
                if let Some(state) = current.remove(&alias) {
                    to_remove.push((alias, state));
                }
            }

            for (alias, addresses) in &desired {
                match current.get(*alias) {
                    Some(state) if &state.addresses != *addresses => {
                        to_update.push((
                            (*alias).clone(),
                            Arc::clone(&state.balancer),
                            addresses.to_vec(),
                        ));
                    }
                    Some(_) => {}
                    None => to_create.push(((*alias).clone(), addresses.to_vec())),
                }
            }

            if current.is_empty() && to_create.is_empty() {
                clusters.remove(cluster_id);
            }
        }

        let mut errors = Vec::new();

        for (alias, state) in to_remove {
            if let Err(source) = state.balancer.shutdown().await {
                errors.push(ProxyError::Balancer {
                    cluster_id: cluster_id.to_string(),
                    alias: alias.clone(),
                    source,
                });
            }
            info!(%cluster_id, %alias, "load balancer removed");
        }

        for (alias, balancer, addresses) in to_update {
            balancer.reconcile_route(&addresses).await;
            info!(%cluster_id, balancer = %balancer.address(), upstreams = ?addresses, "load balancer updated");
            self.record_addresses(cluster_id, &alias, &balancer, addresses);
        }

        let mut created = Vec::new();
        for (alias, addresses) in to_create {
            let balancer = Arc::new(TcpLoadBalancer::new(
                balancer_address(cluster_id, &alias),
                self.network.clone(),
                self.config.clone(),
            ));
            balancer.reconcile_route(&addresses).await;
            match balancer.start().await {
                Ok(()) => {
                    info!(%cluster_id, %alias, upstreams = ?addresses, "load balancer created");
                    created.push((
                        alias,
                        LoadBalancerState {
                            balancer,
                            addresses,
                        },
                    ));
                }
                Err(source) => {
                    // Stops the probe tasks spawned by reconcile_route.
                    let _ = balancer.shutdown().await;
                    errors.push(ProxyError::Balancer {
                        cluster_id: cluster_id.to_string(),
                        alias,
                        source,
                    });
                }
            }
        }

        if !created.is_empty() {
            let mut clusters = self.lock();
            let current = clusters.entry(cluster_id.to_string()).or_default();
            current.extend(created);
        }

        drop(closed);

        let result = ProxyError::collect(errors);
        if let Err(e) = &result {
            warn!(%cluster_id, error = %e, "reconcile finished with errors");
        }
        result
    }

    /// Remember the route a balancer now carries, unless it was replaced.
    fn record_addresses(
        &self,
        cluster_id: &str,
        alias: &str,
        balancer: &Arc<TcpLoadBalancer>,
        addresses: Vec<String>,
    ) {
        let mut clusters = self.lock();
        if let Some(state) = clusters
            .get_mut(cluster_id)
            .and_then(|current| current.get_mut(alias))
            && Arc::ptr_eq(&state.balancer, balancer)
        {
            state.addresses = addresses;
        }
    }

    /// Stop and forget the balancer of a single alias.
    ///
    /// Returns whether a balancer was running.
    pub async fn remove_lb(&self, cluster_id: &str, alias: &str) -> Result<bool, ProxyError> {
        let _open = self.closed.read().await;
        let state = {
            let mut clusters = self.lock();
            let Some(current) = clusters.get_mut(cluster_id) else {
                return Ok(false);
            };
            let state = current.remove(alias);
            if current.is_empty() {
                clusters.remove(cluster_id);
            }
            state
        };
        let Some(state) = state else {
            return Ok(false);
        };

        state
            .balancer
            .shutdown()
            .await
            .map_err(|source| ProxyError::Balancer {
                cluster_id: cluster_id.to_string(),
                alias: alias.to_string(),
                source,
            })?;
        info!(%cluster_id, %alias, "load balancer removed");
        Ok(true)
    }

    /// Reverse proxy for an alias, plus the cluster it belongs to.
    ///
    /// `None` when the alias is unknown or has no running balancer.
    pub fn get_proxy(&self, alias: &str) -> Option<(ReverseProxy, ClusterId)> {
        let Some((cluster_id, _port)) = self.index.cluster_port(alias) else {
            debug!(%alias, "alias not found");
            return None;
        };
        let clusters = self.lock();
        let state = clusters.get(&cluster_id)?.get(alias)?;
        let proxy = ReverseProxy::new(self.network.clone(), state.balancer.address());
        Some((proxy, cluster_id))
    }

    /// The running balancer of an alias.
    pub fn balancer(&self, cluster_id: &str, alias: &str) -> Option<Arc<TcpLoadBalancer>> {
        let clusters = self.lock();
        clusters
            .get(cluster_id)?
            .get(alias)
            .map(|s| Arc::clone(&s.balancer))
    }

    /// Backend health of every balancer of a cluster, by alias.
    pub fn cluster_backends(&self, cluster_id: &str) -> BTreeMap<Alias, Vec<BackendStatus>> {
        let clusters = self.lock();
        clusters
            .get(cluster_id)
            .map(|c| {
                c.iter()
                    .map(|(alias, s)| (alias.clone(), s.balancer.backend_status()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Stop every balancer and wait for their tasks to exit.
    ///
    /// Waits for in-flight reconciles first. Safe to call more than once.
    pub async fn shutdown(&self) -> Result<(), ProxyError> {
        let mut closed = self.closed.write().await;
        *closed = true;
        let drained: Vec<(ClusterId, ClusterBalancers)> = self.lock().drain().collect();

        let mut errors = Vec::new();
        for (cluster_id, balancers) in drained {
            for (alias, state) in balancers {
                if let Err(source) = state.balancer.shutdown().await {
                    errors.push(ProxyError::Balancer {
                        cluster_id: cluster_id.clone(),
                        alias,
                        source,
                    });
                }
            }
        }
        info!("all load balancers stopped");
        ProxyError::collect(errors)
    }
}

/// Deterministic in-memory address of the balancer for (cluster, alias).
pub fn balancer_address(cluster_id: &str, alias: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cluster_id.as_bytes());
    hasher.update([0]);
    hasher.update(alias.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}.lb.workload-proxy.internal:80", &digest[..32])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;
    use std::pin::{Pin, pin};
    use std::task::Poll;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn reconciler() -> (Reconciler, Arc<AliasIndex>, MemoryNetwork) {
        let index = Arc::new(AliasIndex::new());
        let network = MemoryNetwork::new();
        let config = BalancerConfig {
            dial_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_millis(50),
            ..BalancerConfig::default()
        };
        (
            Reconciler::new(Arc::clone(&index), network.clone(), config),
            index,
            network,
        )
    }

    fn desired(pairs: &[(&str, &[&str])]) -> BTreeMap<Alias, Vec<String>> {
        pairs
            .iter()
            .map(|(a, addrs)| (a.to_string(), addrs.iter().map(|s| s.to_string()).collect()))
            .collect()
    }

    /// A TCP backend that echoes what it receives. Health probes connect
    /// and close without sending, so only forwarded traffic comes back.
    async fn echo_backend() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.into_split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn poll_once<F: Future>(mut fut: Pin<&mut F>) -> Poll<F::Output> {
        poll_fn(|cx| Poll::Ready(fut.as_mut().poll(cx))).await
    }

    fn index_alias(index: &AliasIndex, cluster: &str, alias: &str) {
        let aliases = BTreeMap::from([(alias.to_string(), 80)]);
        index
            .replace_cluster(cluster, &aliases, &["127.0.0.1".to_string()])
            .unwrap();
    }

    #[test]
    fn balancer_address_is_deterministic_and_distinct() {
        assert_eq!(balancer_address("c1", "a1"), balancer_address("c1", "a1"));
        assert_ne!(balancer_address("c1", "a1"), balancer_address("c2", "a1"));
        assert_ne!(balancer_address("c1a", "1"), balancer_address("c1", "a1"));
        assert!(balancer_address("c1", "a1").ends_with(":80"));
    }

    #[tokio::test]
    async fn creates_and_removes_balancers() {
        let (rec, _index, network) = reconciler();
        rec.reconcile("c1", &desired(&[("a1", &["127.0.0.1:1"]), ("a2", &["127.0.0.1:2"])]))
            .await
            .unwrap();

        assert!(network.is_listening(&balancer_address("c1", "a1")));
        assert!(network.is_listening(&balancer_address("c1", "a2")));

        rec.reconcile("c1", &desired(&[("a2", &["127.0.0.1:2"])]))
            .await
            .unwrap();
        assert!(!network.is_listening(&balancer_address("c1", "a1")));
        assert!(rec.balancer("c1", "a1").is_none());

        rec.reconcile("c1", &BTreeMap::new()).await.unwrap();
        assert!(!network.is_listening(&balancer_address("c1", "a2")));
        rec.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn changed_addresses_update_in_place() {
        let (rec, _index, _network) = reconciler();
        rec.reconcile("c1", &desired(&[("a1", &["10.0.0.1:80"])]))
            .await
            .unwrap();
        let before = rec.balancer("c1", "a1").unwrap().id();

        rec.reconcile("c1", &desired(&[("a1", &["10.0.0.1:80", "10.0.0.2:80"])]))
            .await
            .unwrap();
        let balancer = rec.balancer("c1", "a1").unwrap();
        assert_eq!(balancer.id(), before);
        assert_eq!(balancer.upstreams(), vec!["10.0.0.1:80", "10.0.0.2:80"]);

        // Same desired state again leaves the balancer untouched.
        rec.reconcile("c1", &desired(&[("a1", &["10.0.0.1:80", "10.0.0.2:80"])]))
            .await
            .unwrap();
        assert_eq!(rec.balancer("c1", "a1").unwrap().id(), before);
        rec.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn empty_backend_list_destroys_balancer() {
        let (rec, _index, network) = reconciler();
        rec.reconcile("c1", &desired(&[("a1", &["10.0.0.1:80"])]))
            .await
            .unwrap();
        rec.reconcile("c1", &desired(&[("a1", &[])])).await.unwrap();

        assert!(rec.balancer("c1", "a1").is_none());
        assert!(!network.is_listening(&balancer_address("c1", "a1")));
    }

    #[tokio::test]
    async fn one_failing_alias_does_not_block_others() {
        let (rec, _index, network) = reconciler();
        // Occupy the address the balancer for a1 would take.
        let _squatter = network.listen(&balancer_address("c1", "a1")).unwrap();

        let err = rec
            .reconcile("c1", &desired(&[("a1", &["10.0.0.1:80"]), ("a2", &["10.0.0.2:80"])]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Balancer { ref alias, .. } if alias == "a1"));
        assert!(rec.balancer("c1", "a2").is_some());
        assert!(rec.balancer("c1", "a1").is_none());
        rec.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn get_proxy_requires_index_and_balancer() {
        let (rec, index, _network) = reconciler();
        assert!(rec.get_proxy("a1").is_none());

        index_alias(&index, "c1", "a1");
        // Indexed but no balancer yet.
        assert!(rec.get_proxy("a1").is_none());

        rec.reconcile("c1", &desired(&[("a1", &["127.0.0.1:80"])]))
            .await
            .unwrap();
        let (_proxy, cluster) = rec.get_proxy("a1").unwrap();
        assert_eq!(cluster, "c1");
        assert!(rec.get_proxy("unknown").is_none());
        rec.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn remove_lb_stops_single_alias() {
        let (rec, _index, _network) = reconciler();
        rec.reconcile("c1", &desired(&[("a1", &["10.0.0.1:80"]), ("a2", &["10.0.0.2:80"])]))
            .await
            .unwrap();

        assert!(rec.remove_lb("c1", "a1").await.unwrap());
        assert!(!rec.remove_lb("c1", "a1").await.unwrap());
        assert!(rec.balancer("c1", "a2").is_some());
        rec.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_everything_and_is_repeatable() {
        let addr = echo_backend().await;
        let (rec, _index, network) = reconciler();
        rec.reconcile("c1", &desired(&[("a1", &[addr.as_str()])]))
            .await
            .unwrap();
        rec.reconcile("c2", &desired(&[("b1", &[addr.as_str()])]))
            .await
            .unwrap();

        let mut client = network.dial(&balancer_address("c1", "a1")).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        rec.shutdown().await.unwrap();
        assert!(!network.is_listening(&balancer_address("c1", "a1")));
        assert!(!network.is_listening(&balancer_address("c2", "b1")));

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);

        rec.shutdown().await.unwrap();
        let err = rec
            .reconcile("c1", &desired(&[("a1", &[addr.as_str()])]))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn shutdown_waits_for_in_flight_reconcile() {
        let (rec, _index, network) = reconciler();
        let rec = Arc::new(rec);
        let aliases: Vec<Alias> = (0..200).map(|i| format!("a{i}")).collect();
        let wanted: BTreeMap<Alias, Vec<String>> = aliases
            .iter()
            .map(|a| (a.clone(), vec!["127.0.0.1:1".to_string()]))
            .collect();

        let task = tokio::spawn({
            let rec = Arc::clone(&rec);
            async move { rec.reconcile("c1", &wanted).await }
        });
        tokio::time::sleep(Duration::from_millis(2)).await;
        rec.shutdown().await.unwrap();

        for alias in &aliases {
            assert!(
                !network.is_listening(&balancer_address("c1", alias)),
                "{alias} still listening after shutdown"
            );
        }
        match task.await.unwrap() {
            Ok(()) | Err(ProxyError::Closed) => {}
            Err(e) => panic!("unexpected reconcile error: {e}"),
        }
        assert!(rec.balancer("c1", "a0").is_none());
    }

    #[tokio::test]
    async fn cancelled_update_is_retried() {
        let (rec, _index, _network) = reconciler();
        rec.reconcile("c1", &desired(&[("a1", &["127.0.0.1:1", "127.0.0.1:2"])]))
            .await
            .unwrap();
        let balancer = rec.balancer("c1", "a1").unwrap();

        // Hold the route busy: dropping a backend waits for its probe task.
        let first = vec!["127.0.0.1:1".to_string()];
        let mut busy = pin!(balancer.reconcile_route(&first));
        assert!(poll_once(busy.as_mut()).await.is_pending());

        // An update that is dropped while waiting for the route.
        let next = desired(&[("a1", &["127.0.0.1:3"])]);
        {
            let mut update = pin!(rec.reconcile("c1", &next));
            assert!(poll_once(update.as_mut()).await.is_pending());
        }
        busy.await;
        assert_eq!(balancer.upstreams(), vec!["127.0.0.1:1"]);

        rec.reconcile("c1", &next).await.unwrap();
        assert_eq!(balancer.upstreams(), vec!["127.0.0.1:3"]);
        rec.shutdown().await.unwrap();
    }
}
