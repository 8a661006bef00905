// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Transactions are the unit of work the pipeline samples and harvests.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tracing::debug;

use crate::trace::Trace;

/// Whether a transaction should be dropped instead of harvested.
///
/// `Ignore` can still be cleared by later instrumentation; `ForceIgnore` is
/// final and wins over any other disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IgnorePolicy {
    #[default]
    Observe,
    Ignore,
    ForceIgnore,
}

/// Identifiers carried by traffic generated from synthetic monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntheticsData {
    pub resource_id: String,
    pub job_id: String,
    pub monitor_id: String,
}

/// One logical unit of work, e.g. one handled request.
///
/// A transaction is owned exclusively by the work that created it. Once
/// [`Transaction::end`] has run and the transaction is offered to the
/// aggregators, they copy out what they need; nothing retains the live value.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    name: String,
    name_frozen: bool,
    start_ms: u64,
    started: Instant,
    priority: f64,
    sampled: bool,
    ignore: IgnorePolicy,
    duration_ms: Option<f64>,
    apdex_t: Option<f64>,
    synthetics: Option<SyntheticsData>,
    trace: Trace,
}

impl Transaction {
    /// Creates a transaction with a random id and a random priority roll in
    /// `[0, 1)`.
    pub fn new(name: &str, max_segments: usize) -> Self {
        let mut rng = rand::rng();
        let priority = rng.random::<f64>();
        Self::with_priority(name, max_segments, priority)
    }

    /// Creates a transaction with an externally assigned priority, as when
    /// distributed tracing propagates one from upstream.
    pub fn with_priority(name: &str, max_segments: usize, priority: f64) -> Self {
        let mut rng = rand::rng();
        let start_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Transaction {
            id: rng.random::<u64>(),
            name: name.to_string(),
            name_frozen: false,
            start_ms,
            started: Instant::now(),
            priority,
            sampled: false,
            ignore: IgnorePolicy::Observe,
            duration_ms: None,
            apdex_t: None,
            synthetics: None,
            trace: Trace::new(name, max_segments),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Renames the transaction. The name is provisional until frozen; renames
    /// after that are dropped.
    pub fn set_name(&mut self, name: &str) {
        if self.name_frozen {
            debug!("ignoring rename of finalized transaction to {name}");
            return;
        }
        self.name = name.to_string();
    }

    /// Finalizes the name; further renames are no-ops.
    pub fn freeze_name(&mut self) {
        self.name_frozen = true;
    }

    pub fn start_ms(&self) -> u64 {
        self.start_ms
    }

    pub fn priority(&self) -> f64 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: f64) {
        self.priority = priority;
    }

    /// Whether the sampler admitted this transaction for full trace capture.
    pub fn sampled(&self) -> bool {
        self.sampled
    }

    pub fn set_sampled(&mut self, sampled: bool) {
        self.sampled = sampled;
    }

    pub fn ignore_policy(&self) -> IgnorePolicy {
        self.ignore
    }

    pub fn set_ignore_policy(&mut self, policy: IgnorePolicy) {
        if self.ignore == IgnorePolicy::ForceIgnore {
            return;
        }
        self.ignore = policy;
    }

    /// Apdex threshold attributed by the metrics interface, in seconds.
    pub fn apdex_t(&self) -> Option<f64> {
        self.apdex_t
    }

    pub fn set_apdex_t(&mut self, apdex_t: f64) {
        self.apdex_t = Some(apdex_t);
    }

    pub fn synthetics(&self) -> Option<&SyntheticsData> {
        self.synthetics.as_ref()
    }

    pub fn set_synthetics(&mut self, data: SyntheticsData) {
        self.synthetics = Some(data);
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn trace_mut(&mut self) -> &mut Trace {
        &mut self.trace
    }

    /// Finalizes the transaction: freezes the name and fixes the duration.
    ///
    /// The finalize callback contract is exactly-once; a second call is a
    /// logged no-op so a racing instrumentation bug cannot corrupt the
    /// recorded duration.
    pub fn end(&mut self) {
        if self.duration_ms.is_some() {
            debug!("transaction {} ended twice", self.id);
            return;
        }
        self.freeze_name();
        self.duration_ms = Some(self.started.elapsed().as_secs_f64() * 1000.0);
    }

    pub fn is_ended(&self) -> bool {
        self.duration_ms.is_some()
    }

    /// Total elapsed duration in milliseconds.
    ///
    /// Prefers an explicitly set trace duration, for traces finalized
    /// asynchronously; otherwise the wall-clock duration fixed by `end()`.
    pub fn duration_ms(&self) -> Option<f64> {
        self.trace.duration_ms().or(self.duration_ms)
    }
}
