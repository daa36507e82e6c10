//! fleetgated — the fleetgate daemon.
//!
//! Assembles the state store, the workload proxy with its store watcher,
//! the access validator and the HTTP router into one process.

pub mod config;
pub mod daemon;

pub use config::{Config, LogFormat};
pub use daemon::Daemon;
