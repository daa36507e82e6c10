//! fleetgate-health — active health probing for proxied backends.
//!
//! Provides a TCP connect probe that measures how quickly a backend
//! accepts connections and maps that latency into a discrete [`Tier`].
//! The load balancer keeps one [`TierTracker`] per backend and prefers
//! backends in lower (faster) tiers.
//!
//! # Architecture
//!
//! ```text
//! TcpLoadBalancer
//!   └── per-backend background task
//!       ├── HealthProbe::health_check() → Result<Tier, ProbeError>
//!       └── TierTracker::record()  (tier preference + healthy membership)
//! ```
//!
//! A failed probe never resets a backend's tier; it only counts towards
//! the consecutive-failure threshold that takes the backend out of the
//! healthy set.

pub mod checker;
pub mod tracker;

pub use checker::{HealthProbe, ProbeConfig, ProbeError, ProbeTarget, Tier, TierTable};
pub use tracker::TierTracker;
