//! fleetgate-state — resource store for the fleetgate control plane.
//!
//! Backed by [redb](https://docs.rs/redb), holds the facts the workload
//! proxy consumes: tenant clusters, backend machine statuses, exposed
//! services, plus the public keys and access grants used to authorize
//! proxied requests.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Every write to a cluster, machine status or exposed service is also
//! published as a [`ResourceEvent`] on a broadcast channel, which is what
//! the proxy's watcher glue subscribes to.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod event;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use event::{Change, ResourceEvent};
pub use store::StateStore;
pub use types::*;
