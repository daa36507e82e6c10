//! Health check probe logic.
//!
//! Performs TCP connect probes against backend addresses and maps the
//! connect latency into a latency tier.

use std::fmt;
use std::io;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::trace;

/// Discrete latency bucket of a backend. Lower is better.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tier(pub u8);

impl Tier {
    /// The fastest tier.
    pub const BEST: Tier = Tier(0);

    /// One step towards `target`.
    pub fn step_towards(self, target: Tier) -> Tier {
        match self.cmp(&target) {
            std::cmp::Ordering::Greater => Tier(self.0 - 1),
            std::cmp::Ordering::Less => Tier(self.0 + 1),
            std::cmp::Ordering::Equal => self,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier-{}", self.0)
    }
}

/// Upper bounds of each latency tier.
///
/// An elapsed time below `boundaries[i]` (and not below any earlier
/// boundary) falls into tier `i`; anything slower lands in the last tier,
/// `boundaries.len()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    boundaries: Vec<Duration>,
}

impl TierTable {
    /// Build a table from ascending boundaries. Unsorted input is sorted.
    pub fn new(mut boundaries: Vec<Duration>) -> Self {
        boundaries.sort();
        boundaries.dedup();
        Self { boundaries }
    }

    /// Build a table from boundaries expressed in microseconds.
    pub fn from_micros(micros: &[u64]) -> Self {
        Self::new(micros.iter().copied().map(Duration::from_micros).collect())
    }

    /// Map an elapsed connect time to its tier.
    pub fn tier_for(&self, elapsed: Duration) -> Tier {
        let idx = self
            .boundaries
            .iter()
            .position(|b| elapsed < *b)
            .unwrap_or(self.boundaries.len());
        Tier(u8::try_from(idx).unwrap_or(u8::MAX))
    }

    /// The slowest tier this table can produce.
    pub fn worst(&self) -> Tier {
        Tier(u8::try_from(self.boundaries.len()).unwrap_or(u8::MAX))
    }
}

impl Default for TierTable {
    /// Six buckets: <0.1ms, <1ms, <10ms, <100ms, <1s, slower.
    fn default() -> Self {
        Self::from_micros(&[100, 1_000, 10_000, 100_000, 1_000_000])
    }
}

/// A probed backend, identified by its `host:port` string.
///
/// Two targets with the same address are the same backend, so a
/// "new" target for an address already being probed keeps its history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeTarget {
    address: String,
}

impl ProbeTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Why a probe did not produce a tier.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect to {address} failed: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

/// Probe tuning.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Upper bound on a single connect attempt.
    pub timeout: Duration,
    /// SO_LINGER applied before closing the probe socket.
    pub linger: Duration,
    /// Latency → tier mapping.
    pub tiers: TierTable,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            linger: Duration::ZERO,
            tiers: TierTable::default(),
        }
    }
}

/// Active TCP health checker.
#[derive(Debug, Clone, Default)]
pub struct HealthProbe {
    config: ProbeConfig,
}

impl HealthProbe {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Open and immediately close a TCP connection to `address`.
    ///
    /// Returns the latency tier of the connect. On failure the caller
    /// keeps whatever tier it had before. Dropping the returned future
    /// aborts the probe and releases any half-open connection.
    pub async fn health_check(&self, address: &str) -> Result<Tier, ProbeError> {
        let start = Instant::now();
        let stream = match tokio::time::timeout(self.config.timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ProbeError::Connect {
                    address: address.to_string(),
                    source,
                });
            }
            Err(_) => {
                return Err(ProbeError::Timeout {
                    address: address.to_string(),
                    timeout: self.config.timeout,
                });
            }
        };
        let elapsed = start.elapsed();

        // Short linger so frequent probing doesn't pile up TIME_WAIT sockets.
        if let Err(e) = set_linger(&stream, self.config.linger) {
            trace!(%address, error = %e, "failed to set linger on probe socket");
        }
        drop(stream);

        let tier = self.config.tiers.tier_for(elapsed);
        trace!(%address, ?elapsed, %tier, "health probe succeeded");
        Ok(tier)
    }
}

#[allow(deprecated)]
fn set_linger(stream: &TcpStream, linger: Duration) -> io::Result<()> {
    stream.set_linger(Some(linger))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_six_tiers() {
        let table = TierTable::default();
        assert_eq!(table.tier_for(Duration::from_micros(50)), Tier(0));
        assert_eq!(table.tier_for(Duration::from_micros(500)), Tier(1));
        assert_eq!(table.tier_for(Duration::from_millis(5)), Tier(2));
        assert_eq!(table.tier_for(Duration::from_millis(50)), Tier(3));
        assert_eq!(table.tier_for(Duration::from_millis(500)), Tier(4));
        assert_eq!(table.tier_for(Duration::from_secs(3)), Tier(5));
        assert_eq!(table.worst(), Tier(5));
    }

    #[test]
    fn boundary_value_falls_into_next_tier() {
        let table = TierTable::default();
        assert_eq!(table.tier_for(Duration::from_micros(100)), Tier(1));
    }

    #[test]
    fn custom_boundaries_are_sorted() {
        let table = TierTable::from_micros(&[10_000, 1_000]);
        assert_eq!(table.tier_for(Duration::from_micros(1)), Tier(0));
        assert_eq!(table.tier_for(Duration::from_millis(5)), Tier(1));
        assert_eq!(table.tier_for(Duration::from_millis(50)), Tier(2));
    }

    #[test]
    fn step_towards_moves_one_tier() {
        assert_eq!(Tier(4).step_towards(Tier(0)), Tier(3));
        assert_eq!(Tier(1).step_towards(Tier(3)), Tier(2));
        assert_eq!(Tier(2).step_towards(Tier(2)), Tier(2));
    }

    #[test]
    fn probe_targets_compare_by_address() {
        assert_eq!(ProbeTarget::new("10.0.0.1:80"), ProbeTarget::new("10.0.0.1:80".to_string()));
        assert_ne!(ProbeTarget::new("10.0.0.1:80"), ProbeTarget::new("10.0.0.1:81"));
    }

    #[tokio::test]
    async fn probe_to_listening_port_succeeds() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let probe = HealthProbe::default();
        let tier = probe.health_check(&addr).await.unwrap();
        assert!(tier <= probe.config().tiers.worst());
    }

    #[tokio::test]
    async fn probe_to_closed_port_fails() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let probe = HealthProbe::new(ProbeConfig {
            timeout: Duration::from_millis(200),
            ..ProbeConfig::default()
        });
        assert!(probe.health_check(&addr).await.is_err());
    }
}
