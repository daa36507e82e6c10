//! Health-aware TCP load balancer bound to an in-memory address.
//!
//! Each balancer carries a single route: a list of backend `host:port`
//! addresses. Inbound connections are forwarded to the healthy backend in
//! the best latency tier, round-robin among equals. Every backend is
//! probed by its own background task.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, trace};

use fleetgate_health::{HealthProbe, ProbeConfig, ProbeTarget, Tier, TierTracker};

use crate::error::BalancerError;
use crate::memnet::{MemoryListener, MemoryNetwork};

static NEXT_BALANCER_ID: AtomicU64 = AtomicU64::new(1);

/// Copy buffer per direction of a forwarded connection.
const COPY_BUFFER: usize = 16 * 1024;

/// Tuning shared by every load balancer.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Upper bound on dialing one backend.
    pub dial_timeout: Duration,
    /// A forwarded connection with no traffic for this long is closed.
    pub idle_timeout: Duration,
    /// Pause between health probes of one backend.
    pub probe_interval: Duration,
    /// Consecutive failures before a backend leaves the healthy set.
    pub unhealthy_threshold: u32,
    pub probe: ProbeConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(3600),
            probe_interval: Duration::from_secs(20),
            unhealthy_threshold: 3,
            probe: ProbeConfig::default(),
        }
    }
}

/// Health view of one backend, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct BackendStatus {
    pub address: String,
    pub tier: Option<Tier>,
    pub healthy: bool,
}

struct Upstream {
    target: ProbeTarget,
    tracker: Mutex<TierTracker>,
}

impl Upstream {
    fn tracker(&self) -> std::sync::MutexGuard<'_, TierTracker> {
        self.tracker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sort key: healthy first, then known tiers ascending, unknown last.
    fn rank(&self) -> (bool, u16) {
        let tracker = self.tracker();
        let tier = tracker.tier().map_or(u16::MAX, |t| u16::from(t.0));
        (!tracker.is_healthy(), tier)
    }

    fn status(&self) -> BackendStatus {
        let tracker = self.tracker();
        BackendStatus {
            address: self.target.address().to_string(),
            tier: tracker.tier(),
            healthy: tracker.is_healthy(),
        }
    }
}

/// The upstream list plus round-robin cursor.
#[derive(Default)]
struct Route {
    upstreams: RwLock<Vec<Arc<Upstream>>>,
    cursor: AtomicUsize,
}

impl Route {
    /// Backends in the order a connection should try them.
    fn candidates(&self) -> Vec<Arc<Upstream>> {
        let upstreams = self
            .upstreams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if upstreams.is_empty() {
            return upstreams;
        }

        let mut ranked: Vec<((bool, u16), Arc<Upstream>)> =
            upstreams.into_iter().map(|u| (u.rank(), u)).collect();
        ranked.sort_by_key(|(rank, _)| *rank);

        let best = ranked[0].0;
        let tied = ranked.iter().take_while(|(rank, _)| *rank == best).count();
        let offset = self.cursor.fetch_add(1, Ordering::Relaxed) % tied;
        ranked[..tied].rotate_left(offset);

        ranked.into_iter().map(|(_, u)| u).collect()
    }

    fn addresses(&self) -> Vec<String> {
        self.upstreams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|u| u.target.address().to_string())
            .collect()
    }
}

struct ProbeTask {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

struct Running {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// A TCP load balancer listening on an in-memory address.
pub struct TcpLoadBalancer {
    id: u64,
    address: String,
    network: MemoryNetwork,
    config: BalancerConfig,
    route: Arc<Route>,
    probes: tokio::sync::Mutex<HashMap<ProbeTarget, ProbeTask>>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl TcpLoadBalancer {
    pub fn new(address: impl Into<String>, network: MemoryNetwork, config: BalancerConfig) -> Self {
        Self {
            id: NEXT_BALANCER_ID.fetch_add(1, Ordering::Relaxed),
            address: address.into(),
            network,
            config,
            route: Arc::new(Route::default()),
            probes: tokio::sync::Mutex::new(HashMap::new()),
            running: tokio::sync::Mutex::new(None),
        }
    }

    /// Process-unique identity of this balancer instance.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The in-memory address the balancer listens on.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Current backend addresses in route order.
    pub fn upstreams(&self) -> Vec<String> {
        self.route.addresses()
    }

    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.route
            .upstreams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|u| u.status())
            .collect()
    }

    /// Set the route's backends.
    ///
    /// Backends that are already present keep their tier history and
    /// probe task; removed backends stop being probed. Connections that
    /// are already forwarded are left alone.
    pub async fn reconcile_route(&self, addresses: &[String]) {
        let mut probes = self.probes.lock().await;

        let existing: HashMap<ProbeTarget, Arc<Upstream>> = self
            .route
            .upstreams
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|u| (u.target.clone(), Arc::clone(u)))
            .collect();

        let mut next = Vec::with_capacity(addresses.len());
        for address in addresses {
            let target = ProbeTarget::new(address.as_str());
            if next.iter().any(|u: &Arc<Upstream>| u.target == target) {
                continue;
            }
            let upstream = match existing.get(&target) {
                Some(u) => Arc::clone(u),
                None => Arc::new(Upstream {
                    target: target.clone(),
                    tracker: Mutex::new(TierTracker::new(self.config.unhealthy_threshold)),
                }),
            };
            if !probes.contains_key(&target) {
                probes.insert(target, self.spawn_probe(Arc::clone(&upstream)));
            }
            next.push(upstream);
        }

        let stale: Vec<ProbeTarget> = probes
            .keys()
            .filter(|t| !next.iter().any(|u| &u.target == *t))
            .cloned()
            .collect();
        *self
            .route
            .upstreams
            .write()
            .unwrap_or_else(PoisonError::into_inner) = next;

        for target in stale {
            if let Some(task) = probes.remove(&target) {
                stop_probe(task).await;
                trace!(balancer = %self.address, %target, "backend removed");
            }
        }
        debug!(balancer = %self.address, upstreams = addresses.len(), "route reconciled");
    }

    fn spawn_probe(&self, upstream: Arc<Upstream>) -> ProbeTask {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let probe = HealthProbe::new(self.config.probe.clone());
        let interval = self.config.probe_interval;
        let handle = tokio::spawn(run_probe_loop(upstream, probe, interval, shutdown_rx));
        ProbeTask {
            handle,
            shutdown_tx,
        }
    }

    /// Start accepting connections. Starting twice is a no-op.
    pub async fn start(&self) -> Result<(), BalancerError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(());
        }
        let listener = self.network.listen(&self.address)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_accept_loop(
            listener,
            Arc::clone(&self.route),
            self.config.clone(),
            shutdown_rx,
        ));
        *running = Some(Running {
            handle,
            shutdown_tx,
        });
        info!(balancer = %self.address, id = self.id, "load balancer started");
        Ok(())
    }

    /// Stop accepting, close forwarded connections, stop probing, and
    /// wait for every task to finish.
    pub async fn shutdown(&self) -> Result<(), BalancerError> {
        let mut result = Ok(());
        if let Some(running) = self.running.lock().await.take() {
            let _ = running.shutdown_tx.send(true);
            if let Err(e) = running.handle.await {
                result = Err(BalancerError::Task(e.to_string()));
            }
        }

        let tasks: Vec<ProbeTask> = self.probes.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            stop_probe(task).await;
        }
        debug!(balancer = %self.address, id = self.id, "load balancer stopped");
        result
    }
}

async fn stop_probe(task: ProbeTask) {
    let _ = task.shutdown_tx.send(true);
    // A probe task only ends by observing shutdown; a join error here
    // means it panicked, which has already been reported by the runtime.
    let _ = task.handle.await;
}

/// Probe one backend until told to stop. The first probe runs immediately.
async fn run_probe_loop(
    upstream: Arc<Upstream>,
    probe: HealthProbe,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let result = tokio::select! {
            r = probe.health_check(upstream.target.address()) => r,
            _ = shutdown.changed() => break,
        };
        if let Err(e) = &result {
            trace!(target = %upstream.target, error = %e, "health probe failed");
        }
        upstream.tracker().record(&result);

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
    }
}

async fn run_accept_loop(
    mut listener: MemoryListener,
    route: Arc<Route>,
    config: BalancerConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Some(stream) => {
                    connections.spawn(forward(stream, Arc::clone(&route), config.clone()));
                }
                None => break,
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    drop(listener);
    connections.shutdown().await;
}

/// Forward one inbound connection to the first backend that accepts it.
async fn forward(client: DuplexStream, route: Arc<Route>, config: BalancerConfig) {
    for upstream in route.candidates() {
        let address = upstream.target.address();
        let dialed = tokio::time::timeout(config.dial_timeout, TcpStream::connect(address)).await;
        match dialed {
            Ok(Ok(backend)) => {
                if let Err(e) = backend.set_nodelay(true) {
                    trace!(%address, error = %e, "set_nodelay failed");
                }
                match pipe(client, backend, config.idle_timeout).await {
                    Ok((sent, received)) => trace!(%address, sent, received, "connection closed"),
                    Err(e) => debug!(%address, error = %e, "connection ended with error"),
                }
                return;
            }
            Ok(Err(e)) => debug!(%address, error = %e, "backend dial failed"),
            Err(_) => debug!(%address, "backend dial timed out"),
        }
        upstream.tracker().record_failure();
    }
    debug!("no backend accepted the connection");
}

/// Copy bytes both ways until both sides close or the pair goes idle.
async fn pipe<A, B>(a: A, b: B, idle: Duration) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut a_buf = vec![0u8; COPY_BUFFER];
    let mut b_buf = vec![0u8; COPY_BUFFER];
    let (mut a_open, mut b_open) = (true, true);
    let (mut sent, mut received) = (0u64, 0u64);

    while a_open || b_open {
        tokio::select! {
            r = a_read.read(&mut a_buf), if a_open => match r? {
                0 => {
                    a_open = false;
                    b_write.shutdown().await?;
                }
                n => {
                    b_write.write_all(&a_buf[..n]).await?;
                    sent += n as u64;
                }
            },
            r = b_read.read(&mut b_buf), if b_open => match r? {
                0 => {
                    b_open = false;
                    a_write.shutdown().await?;
                }
                n => {
                    a_write.write_all(&b_buf[..n]).await?;
                    received += n as u64;
                }
            },
            _ = tokio::time::sleep(idle) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "connection idle"));
            }
        }
    }
    Ok((sent, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_config() -> BalancerConfig {
        BalancerConfig {
            dial_timeout: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(5),
            probe_interval: Duration::from_millis(20),
            unhealthy_threshold: 1,
            probe: ProbeConfig {
                timeout: Duration::from_millis(200),
                ..ProbeConfig::default()
            },
        }
    }

    /// A TCP backend that answers every connection with `tag`.
    async fn tagged_backend(tag: &'static str) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let _ = stream.write_all(tag.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        (addr, handle)
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

    async fn echo(conn: &mut DuplexStream, msg: &[u8]) -> Vec<u8> {
        conn.write_all(msg).await.unwrap();
        let mut buf = vec![0u8; msg.len()];
        conn.read_exact(&mut buf).await.unwrap();
        buf
    }

    async fn closed_address() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    }

    async fn read_tag(net: &MemoryNetwork, name: &str) -> String {
        let mut conn = net.dial(name).await.unwrap();
        let mut out = String::new();
        conn.read_to_string(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn forwards_to_backend() {
        let (addr, _backend) = tagged_backend("one").await;
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), fast_config());
        lb.reconcile_route(&[addr]).await;
        lb.start().await.unwrap();

        assert_eq!(read_tag(&net, "lb:80").await, "one");
        lb.shutdown().await.unwrap();
        assert!(!net.is_listening("lb:80"));
    }

    #[tokio::test]
    async fn skips_dead_backend() {
        let dead = closed_address().await;
        let (alive, _h) = tagged_backend("alive").await;
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), fast_config());
        lb.reconcile_route(&[dead.clone(), alive]).await;
        lb.start().await.unwrap();

        for _ in 0..3 {
            assert_eq!(read_tag(&net, "lb:80").await, "alive");
        }
        // Give the probe loop a moment to notice the dead backend.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = lb.backend_status();
        let dead_status = status.iter().find(|s| s.address == dead).unwrap();
        assert!(!dead_status.healthy);
        lb.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn reconcile_route_keeps_history_of_surviving_backends() {
        let (a, _ha) = tagged_backend("a").await;
        let (b, _hb) = tagged_backend("b").await;
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), fast_config());
        lb.reconcile_route(&[a.clone()]).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let tier_before = lb.backend_status()[0].tier;
        assert!(tier_before.is_some());

        lb.reconcile_route(&[b.clone(), a.clone()]).await;
        let status = lb.backend_status();
        assert_eq!(lb.upstreams(), vec![b, a.clone()]);
        let a_status = status.iter().find(|s| s.address == a).unwrap();
        assert!(a_status.tier.is_some());

        lb.reconcile_route(&[]).await;
        assert!(lb.upstreams().is_empty());
        lb.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn route_change_keeps_open_connections() {
        let addr = echo_backend().await;
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), fast_config());
        lb.reconcile_route(&[addr]).await;
        lb.start().await.unwrap();

        let mut client = net.dial("lb:80").await.unwrap();
        assert_eq!(echo(&mut client, b"one").await, b"one");

        lb.reconcile_route(&[closed_address().await]).await;

        assert_eq!(echo(&mut client, b"two").await, b"two");
        lb.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_closes_forwarded_connections() {
        let addr = echo_backend().await;
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), fast_config());
        lb.reconcile_route(&[addr]).await;
        lb.start().await.unwrap();

        let mut client = net.dial("lb:80").await.unwrap();
        assert_eq!(echo(&mut client, b"ping").await, b"ping");

        lb.shutdown().await.unwrap();

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf))
            .await
            .unwrap();
        assert_eq!(read.unwrap(), 0);
    }

    #[tokio::test]
    async fn idle_connections_are_closed() {
        let addr = echo_backend().await;
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), BalancerConfig {
            idle_timeout: Duration::from_millis(50),
            ..fast_config()
        });
        lb.reconcile_route(&[addr]).await;
        lb.start().await.unwrap();

        let mut client = net.dial("lb:80").await.unwrap();
        assert_eq!(echo(&mut client, b"hi").await, b"hi");

        let mut buf = Vec::new();
        let read = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut buf)).await;
        assert!(read.is_ok());
        lb.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn start_twice_is_noop() {
        let net = MemoryNetwork::new();
        let lb = TcpLoadBalancer::new("lb:80", net.clone(), fast_config());
        lb.start().await.unwrap();
        lb.start().await.unwrap();
        lb.shutdown().await.unwrap();
        lb.shutdown().await.unwrap();
    }

    fn upstream(addr: &str) -> Arc<Upstream> {
        Arc::new(Upstream {
            target: ProbeTarget::new(addr),
            tracker: Mutex::new(TierTracker::new(1)),
        })
    }

    #[test]
    fn candidates_round_robin_between_equals() {
        let route = Route::default();
        *route.upstreams.write().unwrap() = vec![upstream("a:1"), upstream("b:1")];

        let firsts: Vec<String> = (0..4)
            .map(|_| route.candidates()[0].target.address().to_string())
            .collect();
        assert_eq!(firsts, vec!["a:1", "b:1", "a:1", "b:1"]);
        // The other backend is still offered as a fallback.
        assert_eq!(route.candidates().len(), 2);
    }

    #[test]
    fn candidates_prefer_best_tier() {
        let route = Route::default();
        let make = |addr: &str, tier: Option<u8>, healthy: bool| {
            let mut tracker = TierTracker::new(1);
            if let Some(t) = tier {
                tracker.record_success(Tier(t));
            }
            if !healthy {
                tracker.record_failure();
            }
            Arc::new(Upstream {
                target: ProbeTarget::new(addr),
                tracker: Mutex::new(tracker),
            })
        };
        *route.upstreams.write().unwrap() = vec![
            make("slow:1", Some(4), true),
            make("down:1", Some(0), false),
            make("fast:1", Some(1), true),
            make("new:1", None, true),
        ];

        let order: Vec<String> = route
            .candidates()
            .iter()
            .map(|u| u.target.address().to_string())
            .collect();
        assert_eq!(order, vec!["fast:1", "slow:1", "new:1", "down:1"]);
    }
}
