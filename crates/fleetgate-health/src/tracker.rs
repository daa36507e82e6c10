//! Per-backend tier and membership tracking.

use tracing::{debug, warn};

use crate::checker::{ProbeError, Tier};

/// Tracks probe results for a single backend.
///
/// The tier is a soft preference and survives failed probes. Membership
/// (`healthy`) is the coarse signal: a backend drops out after
/// `unhealthy_threshold` consecutive failures and is readmitted by a
/// single success.
#[derive(Debug, Clone)]
pub struct TierTracker {
    /// Last known tier; `None` until the first successful probe.
    tier: Option<Tier>,
    healthy: bool,
    consecutive_failures: u32,
    unhealthy_threshold: u32,
}

impl TierTracker {
    pub fn new(unhealthy_threshold: u32) -> Self {
        Self {
            tier: None,
            healthy: true,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    /// Record a probe outcome.
    pub fn record(&mut self, result: &Result<Tier, ProbeError>) {
        match result {
            Ok(measured) => self.record_success(*measured),
            Err(_) => self.record_failure(),
        }
    }

    /// A successful probe that measured `measured`.
    ///
    /// The first success adopts the measured tier; later ones move one
    /// step towards it, so a single outlier doesn't swing preference.
    pub fn record_success(&mut self, measured: Tier) {
        self.consecutive_failures = 0;
        if !self.healthy {
            debug!(tier = %measured, "backend recovered");
        }
        self.healthy = true;
        self.tier = Some(match self.tier {
            None => measured,
            Some(current) => current.step_towards(measured),
        });
    }

    /// A failed probe or dial. The tier is preserved.
    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.healthy && self.consecutive_failures >= self.unhealthy_threshold {
            warn!(
                failures = self.consecutive_failures,
                threshold = self.unhealthy_threshold,
                "backend marked unhealthy"
            );
            self.healthy = false;
        }
    }

    pub fn tier(&self) -> Option<Tier> {
        self.tier
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn failure() -> Result<Tier, ProbeError> {
        Err(ProbeError::Timeout {
            address: "10.0.0.1:80".to_string(),
            timeout: Duration::from_secs(1),
        })
    }

    #[test]
    fn starts_unknown_and_healthy() {
        let tracker = TierTracker::new(3);
        assert_eq!(tracker.tier(), None);
        assert!(tracker.is_healthy());
    }

    #[test]
    fn first_success_adopts_measured_tier() {
        let mut tracker = TierTracker::new(3);
        tracker.record(&Ok(Tier(3)));
        assert_eq!(tracker.tier(), Some(Tier(3)));
    }

    #[test]
    fn repeated_fast_probes_converge_to_best() {
        let mut tracker = TierTracker::new(3);
        tracker.record(&Ok(Tier(5)));
        for _ in 0..10 {
            tracker.record(&Ok(Tier::BEST));
        }
        assert_eq!(tracker.tier(), Some(Tier::BEST));
    }

    #[test]
    fn failure_preserves_tier() {
        let mut tracker = TierTracker::new(3);
        tracker.record(&Ok(Tier(1)));
        tracker.record(&failure());
        assert_eq!(tracker.tier(), Some(Tier(1)));
        assert!(tracker.is_healthy());
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn failure_before_any_success_stays_unknown() {
        let mut tracker = TierTracker::new(3);
        tracker.record(&failure());
        assert_eq!(tracker.tier(), None);
    }

    #[test]
    fn threshold_failures_mark_unhealthy_and_success_recovers() {
        let mut tracker = TierTracker::new(2);
        tracker.record(&Ok(Tier(0)));
        tracker.record(&failure());
        assert!(tracker.is_healthy());
        tracker.record(&failure());
        assert!(!tracker.is_healthy());
        assert_eq!(tracker.tier(), Some(Tier(0)));

        tracker.record(&Ok(Tier(2)));
        assert!(tracker.is_healthy());
        assert_eq!(tracker.consecutive_failures(), 0);
        assert_eq!(tracker.tier(), Some(Tier(1)));
    }
}
