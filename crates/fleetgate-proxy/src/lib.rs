//! fleetgate workload proxy — alias routing, per-service TCP load
//! balancing and the reverse proxy in front of it.
//!
//! # Components
//!
//! - **`alias`** — alias → (cluster, port) index with per-cluster hosts
//! - **`memnet`** — named in-memory listeners that stand in for sockets
//! - **`balancer`** — health-aware TCP load balancer on a `memnet` address
//! - **`reconciler`** — one balancer per exposed (cluster, alias)
//! - **`reverse`** — HTTP/1.1 reverse proxy into a balancer
//! - **`workload`** — `WorkloadProxy`, the entry point used by callers
//! - **`sync`** — store change feed → reconcile calls

pub mod alias;
pub mod balancer;
pub mod error;
pub mod memnet;
pub mod reconciler;
pub mod reverse;
pub mod sync;
pub mod workload;

pub use alias::{AliasEntry, AliasIndex, ClusterDescriptor};
pub use balancer::{BackendStatus, BalancerConfig, TcpLoadBalancer};
pub use error::{AliasConflict, BalancerError, ForwardError, ProxyError};
pub use memnet::{MemoryListener, MemoryNetwork};
pub use reconciler::Reconciler;
pub use reverse::ReverseProxy;
pub use sync::{DesiredState, ProxySync};
pub use workload::{ClusterStatus, WorkloadProxy, join_host_port};
