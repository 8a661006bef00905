// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Top-N slow-trace selection.
//!
//! Within one harvest window the aggregator keeps at most one full trace: the
//! slowest one whose name still has (or already holds) one of the `top_n`
//! diversity slots. Synthetic-monitoring traces skip the competition entirely
//! and ride a separate capped list. Until the first five traces have been
//! reported, every threshold-passing trace wins, so fresh installs see traces
//! immediately regardless of the diversity rules.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::{debug, warn};

use apm_trace::{IgnorePolicy, Transaction};

/// Synthetics traces kept per harvest window, first come first served.
pub const SYNTHETICS_TRACE_CAP: usize = 20;

/// Consecutive empty harvests after which the diversity map is dropped, so
/// stale names cannot hold capacity slots forever.
const EMPTY_HARVESTS_BEFORE_RESET: u32 = 5;

/// Lifetime reported-trace count below which the diversity rules are waived.
const FIRST_TRACES_GUARANTEE: u64 = 5;

/// Cutoff below which a transaction is not slow enough to trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TraceThreshold {
    /// Four times the transaction's apdex-T. The default.
    ApdexF,
    /// Explicit cutoff in milliseconds.
    Millis(f64),
}

impl TraceThreshold {
    /// Resolves the cutoff in milliseconds for a transaction whose apdex-T is
    /// `apdex_t` seconds.
    pub fn resolve_ms(&self, apdex_t: f64) -> f64 {
        match self {
            TraceThreshold::ApdexF => 4.0 * apdex_t * 1000.0,
            TraceThreshold::Millis(ms) => *ms,
        }
    }
}

/// Live tracer settings, re-read from configuration on every offer.
#[derive(Debug, Clone)]
pub struct TracerSettings {
    /// Transaction tracing on at all (tracer enabled and trace collection
    /// allowed by the server).
    pub enabled: bool,
    /// Diversity slot count. Zero keeps only the single globally slowest
    /// trace per window.
    pub top_n: usize,
    pub threshold: TraceThreshold,
}

impl Default for TracerSettings {
    fn default() -> Self {
        TracerSettings {
            enabled: true,
            top_n: 20,
            threshold: TraceThreshold::ApdexF,
        }
    }
}

/// The data copied out of a finished transaction for harvesting.
///
/// Aggregators never retain the live [`Transaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestTrace {
    pub name: String,
    pub duration_ms: f64,
    pub start_ms: u64,
    pub synthetics: bool,
    pub exceeded_segment_limit: bool,
    pub tree: Value,
}

impl HarvestTrace {
    fn from_transaction(tx: &Transaction, duration_ms: f64) -> Self {
        HarvestTrace {
            name: tx.name().to_string(),
            duration_ms,
            start_ms: tx.start_ms(),
            synthetics: tx.synthetics().is_some(),
            exceeded_segment_limit: tx.trace().exceeded_segment_limit(),
            tree: tx.trace().to_payload(),
        }
    }

    /// Wire form: `[startTime, duration, name, tree]`.
    pub fn to_wire(&self) -> Value {
        json!([self.start_ms, self.duration_ms, self.name, self.tree])
    }
}

/// Per-window slow trace selection state. One per running agent.
#[derive(Debug, Default)]
pub struct TraceAggregator {
    trace: Option<HarvestTrace>,
    request_times: HashMap<String, f64>,
    synthetics_traces: Vec<HarvestTrace>,
    reported: u64,
    no_trace_submitted: u32,
}

impl TraceAggregator {
    pub fn new() -> Self {
        TraceAggregator::default()
    }

    /// Offers a finished transaction to the selector.
    pub fn add(&mut self, tx: &Transaction, settings: &TracerSettings) {
        if !settings.enabled {
            return;
        }
        if tx.ignore_policy() != IgnorePolicy::Observe {
            return;
        }
        // A transaction without metrics has no apdex-T to judge against.
        let Some(apdex_t) = tx.apdex_t() else {
            return;
        };
        let Some(duration_ms) = tx.duration_ms() else {
            return;
        };

        if tx.synthetics().is_some() {
            if self.synthetics_traces.len() < SYNTHETICS_TRACE_CAP {
                self.synthetics_traces
                    .push(HarvestTrace::from_transaction(tx, duration_ms));
            }
            return;
        }

        if self.is_better(tx.name(), duration_ms, apdex_t, settings) {
            self.trace = Some(HarvestTrace::from_transaction(tx, duration_ms));
            if settings.top_n > 0 {
                self.request_times.insert(tx.name().to_string(), duration_ms);
            }
        }
    }

    /// Whether a candidate beats the currently retained trace.
    fn is_better(
        &self,
        name: &str,
        duration_ms: f64,
        apdex_t: f64,
        settings: &TracerSettings,
    ) -> bool {
        if duration_ms < settings.threshold.resolve_ms(apdex_t) {
            return false;
        }
        if let Some(best) = &self.trace {
            if duration_ms <= best.duration_ms {
                return false;
            }
        }
        // First-five guarantee: early runs report traces regardless of the
        // diversity rules below.
        if self.reported < FIRST_TRACES_GUARANTEE {
            return true;
        }
        if settings.top_n == 0 {
            return true;
        }
        match self.request_times.get(name) {
            Some(&recorded) => recorded < duration_ms,
            None => self.request_times.len() < settings.top_n,
        }
    }

    /// Collects the window's traces for one harvest attempt.
    ///
    /// An empty window (no full trace retained) counts toward the diversity
    /// map reset; synthetics do not keep a window from being "empty".
    pub fn harvest(&mut self) -> Vec<HarvestTrace> {
        let mut traces = self.synthetics_traces.clone();
        match &self.trace {
            Some(trace) => {
                if trace.exceeded_segment_limit {
                    warn!(
                        "trace for {} exceeded the segment cap; only the first segments were kept",
                        trace.name
                    );
                }
                traces.push(trace.clone());
            }
            None => {
                self.no_trace_submitted += 1;
                if self.no_trace_submitted >= EMPTY_HARVESTS_BEFORE_RESET {
                    debug!(
                        "no trace submitted for {EMPTY_HARVESTS_BEFORE_RESET} harvests, \
                         resetting name diversity map"
                    );
                    self.request_times.clear();
                    self.no_trace_submitted = 0;
                }
            }
        }
        traces
    }

    /// Restores a batch the collector told us to retain. Bounded: synthetics
    /// refill only up to the cap, the main trace re-competes on duration.
    pub fn merge_retained(&mut self, traces: Vec<HarvestTrace>) {
        for trace in traces {
            if trace.synthetics {
                if self.synthetics_traces.len() < SYNTHETICS_TRACE_CAP {
                    self.synthetics_traces.push(trace);
                }
            } else {
                let better = self
                    .trace
                    .as_ref()
                    .map_or(true, |current| trace.duration_ms > current.duration_ms);
                if better {
                    self.trace = Some(trace);
                }
            }
        }
    }

    /// Bumps the lifetime count of successfully reported traces.
    pub fn record_reported(&mut self, count: u64) {
        self.reported += count;
    }

    pub fn reported(&self) -> u64 {
        self.reported
    }

    /// Drops per-window state. Runs once per harvest attempt regardless of
    /// outcome; the diversity map and the reported count survive.
    pub fn clear(&mut self) {
        self.trace = None;
        self.synthetics_traces.clear();
    }

    #[cfg(test)]
    fn tracked_names(&self) -> usize {
        self.request_times.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apm_trace::SyntheticsData;

    fn finished_tx(name: &str, duration_ms: f64, apdex_t: f64) -> Transaction {
        let mut tx = Transaction::new(name, 100);
        tx.set_apdex_t(apdex_t);
        tx.end();
        tx.trace_mut().set_duration_ms(duration_ms);
        tx
    }

    fn settings() -> TracerSettings {
        TracerSettings::default()
    }

    /// An aggregator past the first-five guarantee.
    fn seasoned() -> TraceAggregator {
        let mut aggregator = TraceAggregator::new();
        aggregator.record_reported(5);
        aggregator
    }

    #[test]
    fn test_threshold_defaults_to_four_apdex_t() {
        // apdexT 0.007s -> cutoff 28ms
        let mut aggregator = seasoned();
        aggregator.add(&finished_tx("WebTransaction/a", 27.0, 0.007), &settings());
        assert!(aggregator.harvest().is_empty());

        aggregator.add(&finished_tx("WebTransaction/a", 29.0, 0.007), &settings());
        assert_eq!(aggregator.harvest().len(), 1);
    }

    #[test]
    fn test_explicit_threshold_overrides_apdex() {
        let mut aggregator = seasoned();
        let settings = TracerSettings {
            threshold: TraceThreshold::Millis(500.0),
            ..TracerSettings::default()
        };
        aggregator.add(&finished_tx("WebTransaction/a", 400.0, 0.007), &settings);
        assert!(aggregator.harvest().is_empty());
        aggregator.add(&finished_tx("WebTransaction/a", 600.0, 0.007), &settings);
        assert_eq!(aggregator.harvest().len(), 1);
    }

    #[test]
    fn test_only_strictly_slower_replaces() {
        let mut aggregator = seasoned();
        aggregator.add(&finished_tx("WebTransaction/a", 100.0, 0.01), &settings());
        aggregator.add(&finished_tx("WebTransaction/b", 100.0, 0.01), &settings());
        let traces = aggregator.harvest();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].name, "WebTransaction/a");

        aggregator.add(&finished_tx("WebTransaction/b", 100.5, 0.01), &settings());
        let traces = aggregator.harvest();
        assert_eq!(traces[0].name, "WebTransaction/b");
    }

    #[test]
    fn test_first_five_guarantee_ignores_capacity() {
        let mut aggregator = TraceAggregator::new();
        let settings = TracerSettings {
            top_n: 1,
            ..TracerSettings::default()
        };
        aggregator.add(&finished_tx("WebTransaction/a", 100.0, 0.01), &settings);
        // Map is at capacity and the name is new, but reported < 5.
        aggregator.add(&finished_tx("WebTransaction/b", 150.0, 0.01), &settings);
        let traces = aggregator.harvest();
        assert_eq!(traces[0].name, "WebTransaction/b");
    }

    #[test]
    fn test_capacity_blocks_new_names_after_guarantee() {
        let mut aggregator = seasoned();
        let settings = TracerSettings {
            top_n: 1,
            ..TracerSettings::default()
        };
        aggregator.add(&finished_tx("WebTransaction/a", 100.0, 0.01), &settings);
        // Slot taken by "a"; a slower trace under a new name is rejected.
        aggregator.add(&finished_tx("WebTransaction/b", 150.0, 0.01), &settings);
        assert_eq!(aggregator.harvest()[0].name, "WebTransaction/a");

        // The name holding the slot can still beat its own record.
        aggregator.add(&finished_tx("WebTransaction/a", 200.0, 0.01), &settings);
        assert_eq!(aggregator.harvest()[0].duration_ms, 200.0);
    }

    #[test]
    fn test_recorded_name_must_beat_own_time() {
        let mut aggregator = seasoned();
        aggregator.add(&finished_tx("WebTransaction/a", 200.0, 0.01), &settings());
        aggregator.clear();
        // New window: same name, slower than nothing but not slower than its
        // recorded 200ms.
        aggregator.add(&finished_tx("WebTransaction/a", 150.0, 0.01), &settings());
        assert!(aggregator.harvest().is_empty());
        aggregator.add(&finished_tx("WebTransaction/a", 250.0, 0.01), &settings());
        assert_eq!(aggregator.harvest().len(), 1);
    }

    #[test]
    fn test_top_n_zero_keeps_single_slowest() {
        let mut aggregator = seasoned();
        let settings = TracerSettings {
            top_n: 0,
            ..TracerSettings::default()
        };
        aggregator.add(&finished_tx("WebTransaction/a", 100.0, 0.01), &settings);
        aggregator.add(&finished_tx("WebTransaction/b", 150.0, 0.01), &settings);
        aggregator.add(&finished_tx("WebTransaction/c", 120.0, 0.01), &settings);
        let traces = aggregator.harvest();
        assert_eq!(traces[0].name, "WebTransaction/b");
        assert_eq!(aggregator.tracked_names(), 0);
    }

    #[test]
    fn test_synthetics_bypass_competition() {
        let mut aggregator = seasoned();
        let mut tx = finished_tx("WebTransaction/synthetic", 1.0, 0.5);
        tx.set_synthetics(SyntheticsData {
            resource_id: "r".into(),
            job_id: "j".into(),
            monitor_id: "m".into(),
        });
        // Far below threshold, still kept.
        aggregator.add(&tx, &settings());
        let traces = aggregator.harvest();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].synthetics);
    }

    #[test]
    fn test_synthetics_cap_is_twenty() {
        let mut aggregator = seasoned();
        for i in 0..25 {
            let mut tx = finished_tx(&format!("WebTransaction/s{i}"), 1.0, 0.5);
            tx.set_synthetics(SyntheticsData {
                resource_id: "r".into(),
                job_id: "j".into(),
                monitor_id: "m".into(),
            });
            aggregator.add(&tx, &settings());
        }
        assert_eq!(aggregator.harvest().len(), SYNTHETICS_TRACE_CAP);
    }

    #[test]
    fn test_disabled_or_metricless_transactions_are_skipped() {
        let mut aggregator = seasoned();
        let disabled = TracerSettings {
            enabled: false,
            ..TracerSettings::default()
        };
        aggregator.add(&finished_tx("WebTransaction/a", 500.0, 0.01), &disabled);
        assert!(aggregator.harvest().is_empty());

        let mut no_metrics = Transaction::new("WebTransaction/b", 10);
        no_metrics.end();
        no_metrics.trace_mut().set_duration_ms(500.0);
        aggregator.add(&no_metrics, &settings());
        assert!(aggregator.harvest().is_empty());
    }

    #[test]
    fn test_ignored_transactions_are_skipped() {
        let mut aggregator = seasoned();
        let mut tx = finished_tx("WebTransaction/a", 500.0, 0.01);
        tx.set_ignore_policy(IgnorePolicy::ForceIgnore);
        aggregator.add(&tx, &settings());
        assert!(aggregator.harvest().is_empty());
    }

    #[test]
    fn test_five_empty_harvests_reset_diversity_map() {
        let mut aggregator = seasoned();
        let settings = TracerSettings {
            top_n: 1,
            ..TracerSettings::default()
        };
        aggregator.add(&finished_tx("WebTransaction/stale", 100.0, 0.01), &settings);
        aggregator.harvest();
        aggregator.clear();
        assert_eq!(aggregator.tracked_names(), 1);

        for _ in 0..5 {
            assert!(aggregator.harvest().is_empty());
            aggregator.clear();
        }
        assert_eq!(aggregator.tracked_names(), 0);

        // The freed slot is usable by a new name again.
        aggregator.add(&finished_tx("WebTransaction/new", 50.0, 0.01), &settings);
        assert_eq!(aggregator.harvest()[0].name, "WebTransaction/new");
    }

    #[test]
    fn test_clear_preserves_request_times_and_reported() {
        let mut aggregator = seasoned();
        aggregator.add(&finished_tx("WebTransaction/a", 100.0, 0.01), &settings());
        aggregator.clear();
        assert!(aggregator.harvest().is_empty());
        assert_eq!(aggregator.tracked_names(), 1);
        assert_eq!(aggregator.reported(), 5);
    }

    #[test]
    fn test_merge_retained_recompetes() {
        let mut aggregator = seasoned();
        let batch = vec![HarvestTrace {
            name: "WebTransaction/retained".into(),
            duration_ms: 100.0,
            start_ms: 0,
            synthetics: false,
            exceeded_segment_limit: false,
            tree: json!({}),
        }];
        // New window already holds something slower; the retained trace loses.
        aggregator.add(&finished_tx("WebTransaction/fresh", 150.0, 0.01), &settings());
        aggregator.merge_retained(batch.clone());
        assert_eq!(aggregator.harvest()[0].name, "WebTransaction/fresh");

        // Empty window: the retained trace comes back.
        aggregator.clear();
        aggregator.merge_retained(batch);
        assert_eq!(aggregator.harvest()[0].name, "WebTransaction/retained");
    }

    #[test]
    fn test_wire_shape() {
        let trace = HarvestTrace {
            name: "WebTransaction/a".into(),
            duration_ms: 42.0,
            start_ms: 1000,
            synthetics: false,
            exceeded_segment_limit: false,
            tree: json!({"root": {}}),
        };
        assert_eq!(
            trace.to_wire(),
            json!([1000, 42.0, "WebTransaction/a", {"root": {}}])
        );
    }
}
