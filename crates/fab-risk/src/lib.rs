//! fab-risk
//!
//! The safety plane's circuit breaker (spec §4.7): a sticky kill switch
//! that trips on consecutive or hourly-windowed failures and stays tripped
//! until an operator manually resets it, plus a margin monitor that gates
//! new entries without itself being able to trip the switch (spec §3
//! invariant 6 — margin pressure alone never halts the bot, it only blocks
//! opening further exposure).

use std::collections::BTreeMap;

use fab_schemas::VenueName;

const FAILURE_WINDOW_MS: i64 = 3_600_000;

#[derive(Clone, Debug, PartialEq)]
pub struct KillSwitchConfig {
    pub max_consecutive_failures: u32,
    pub max_failures_per_hour: u32,
}

/// Sticky circuit breaker. Once tripped, only `reset` clears it — nothing
/// in the normal failure/success recording path can untrip it.
#[derive(Clone, Debug)]
pub struct KillSwitch {
    config: KillSwitchConfig,
    consecutive_failures: u32,
    failure_timestamps_ms: Vec<i64>,
    is_tripped: bool,
    trip_reason: Option<String>,
}

impl KillSwitch {
    pub fn new(config: KillSwitchConfig) -> Self {
        Self {
            config,
            consecutive_failures: 0,
            failure_timestamps_ms: Vec::new(),
            is_tripped: false,
            trip_reason: None,
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.is_tripped
    }

    pub fn trip_reason(&self) -> Option<&str> {
        self.trip_reason.as_deref()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Reset the consecutive-failure counter. Does not affect the hourly
    /// window or an existing trip.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    /// Record a failure and evaluate both trip conditions. Returns `true`
    /// if this call tripped the switch (including if it was already
    /// tripped).
    pub fn record_failure(&mut self, reason: &str, now_ms: i64) -> bool {
        self.consecutive_failures += 1;
        self.failure_timestamps_ms.push(now_ms);

        let cutoff = now_ms - FAILURE_WINDOW_MS;
        self.failure_timestamps_ms.retain(|&ts| ts > cutoff);

        if self.consecutive_failures >= self.config.max_consecutive_failures {
            self.trip(format!("consecutive failures: {} ({reason})", self.consecutive_failures));
            return true;
        }

        if self.failure_timestamps_ms.len() as u32 >= self.config.max_failures_per_hour {
            self.trip(format!("too many failures in 1h: {}", self.failure_timestamps_ms.len()));
            return true;
        }

        self.is_tripped
    }

    pub fn trip(&mut self, reason: String) {
        self.is_tripped = true;
        tracing::error!(reason = %reason, "kill_switch_tripped");
        self.trip_reason = Some(reason);
    }

    /// Manual reset. An operator action — never called from the automatic
    /// failure-recording path.
    pub fn reset(&mut self) {
        self.is_tripped = false;
        self.trip_reason = None;
        self.consecutive_failures = 0;
        tracing::warn!("kill_switch_reset");
    }
}

/// Per-venue margin utilization health — not itself part of the kill switch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MarginStatus {
    Normal,
    High,
    Critical,
}

impl MarginStatus {
    pub fn is_critical(self) -> bool {
        matches!(self, MarginStatus::Critical)
    }
}

/// Tracks margin utilization per venue and classifies it against a
/// configured buffer. Advisory only: callers use `Critical` to block new
/// entries, never to trip the kill switch.
#[derive(Clone, Debug)]
pub struct MarginMonitor {
    margin_buffer_ratio: f64,
    utilization: BTreeMap<VenueName, f64>,
}

impl MarginMonitor {
    pub fn new(margin_buffer_ratio: f64) -> Self {
        Self {
            margin_buffer_ratio,
            utilization: BTreeMap::new(),
        }
    }

    /// Record `utilization` (0.0-1.0) for `venue` and classify it.
    /// `Critical` once utilization exceeds `1 - margin_buffer_ratio`;
    /// `High` above a fixed 0.75 informational threshold; `Normal`
    /// otherwise.
    pub fn update_margin_usage(&mut self, venue: VenueName, utilization: f64) -> MarginStatus {
        self.utilization.insert(venue, utilization);

        if utilization > (1.0 - self.margin_buffer_ratio) {
            tracing::error!(venue = %venue, utilization, buffer = self.margin_buffer_ratio, "margin_critical");
            return MarginStatus::Critical;
        }

        if utilization > 0.75 {
            tracing::warn!(venue = %venue, utilization, "margin_high");
            return MarginStatus::High;
        }

        MarginStatus::Normal
    }

    pub fn utilization_for(&self, venue: VenueName) -> Option<f64> {
        self.utilization.get(&venue).copied()
    }

    /// True when any tracked venue's last-reported utilization is
    /// `Critical`. The controller consults this as an additional halt
    /// input alongside the Kill Switch (spec §3 invariant 6): margin
    /// pressure alone gates new entries for the tick but never trips the
    /// sticky kill switch.
    pub fn any_critical(&self) -> bool {
        self.utilization.values().any(|&u| u > (1.0 - self.margin_buffer_ratio))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_consecutive: u32, max_per_hour: u32) -> KillSwitchConfig {
        KillSwitchConfig {
            max_consecutive_failures: max_consecutive,
            max_failures_per_hour: max_per_hour,
        }
    }

    #[test]
    fn trips_after_consecutive_failures_matches_spec_example() {
        let mut ks = KillSwitch::new(config(3, 10));
        assert!(!ks.record_failure("timeout", 0));
        assert!(!ks.record_failure("timeout", 1_000));
        assert!(ks.record_failure("timeout", 2_000));
        assert!(ks.is_tripped());
    }

    #[test]
    fn success_resets_consecutive_counter() {
        let mut ks = KillSwitch::new(config(3, 10));
        ks.record_failure("a", 0);
        ks.record_failure("b", 1_000);
        ks.record_success();
        assert_eq!(ks.consecutive_failures(), 0);
        assert!(!ks.record_failure("c", 2_000));
        assert!(!ks.is_tripped());
    }

    #[test]
    fn trips_on_hourly_window_even_with_successes_between() {
        let mut ks = KillSwitch::new(config(100, 3));
        for i in 0..3 {
            ks.record_failure("intermittent", i * 1_000);
            if i < 2 {
                ks.record_success();
            }
        }
        assert!(ks.is_tripped());
    }

    #[test]
    fn old_failures_age_out_of_the_hourly_window() {
        let mut ks = KillSwitch::new(config(100, 2));
        ks.record_failure("a", 0);
        // More than an hour later: the first failure should have aged out,
        // so this single new failure shouldn't trip a 2-per-hour limit.
        assert!(!ks.record_failure("b", 3_700_000));
    }

    #[test]
    fn reset_clears_trip_and_counters() {
        let mut ks = KillSwitch::new(config(1, 10));
        ks.record_failure("fatal", 0);
        assert!(ks.is_tripped());
        ks.reset();
        assert!(!ks.is_tripped());
        assert_eq!(ks.consecutive_failures(), 0);
        assert!(ks.trip_reason().is_none());
    }

    #[test]
    fn margin_monitor_classifies_thresholds() {
        let mut monitor = MarginMonitor::new(0.2);
        assert_eq!(monitor.update_margin_usage(VenueName::Primary, 0.5), MarginStatus::Normal);
        assert_eq!(monitor.update_margin_usage(VenueName::Primary, 0.8), MarginStatus::High);
        assert_eq!(monitor.update_margin_usage(VenueName::Primary, 0.85), MarginStatus::Critical);
        assert!(monitor.update_margin_usage(VenueName::Primary, 0.85).is_critical());
    }

    #[test]
    fn margin_monitor_tracks_venues_independently() {
        let mut monitor = MarginMonitor::new(0.2);
        monitor.update_margin_usage(VenueName::Primary, 0.9);
        monitor.update_margin_usage(VenueName::Hedge, 0.1);
        assert_eq!(monitor.utilization_for(VenueName::Primary), Some(0.9));
        assert_eq!(monitor.utilization_for(VenueName::Hedge), Some(0.1));
    }
}
