// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Adaptive sampling of transactions.
//!
//! The sampler holds the number of fully traced transactions per sampling
//! period near a configured target, whatever the throughput. Admission is a
//! single comparison against a maintained threshold so the decision stays O(1)
//! on the transaction-start path.

use std::time::Duration;

use tracing::debug;

/// Initial sampler settings.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Desired number of sampled transactions per period.
    pub target: u64,
    /// Length of one sampling period.
    pub period: Duration,
    /// Serverless mode: no timers run between invocations, so period rollover
    /// is detected from transaction start times instead.
    pub serverless: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        SamplerConfig {
            target: 10,
            period: Duration::from_secs(60),
            serverless: false,
        }
    }
}

/// Admission control for full trace capture.
///
/// One instance exists per running agent and is handed to every call site;
/// the caller serializes access (see the concurrency notes on the services
/// layer).
#[derive(Debug)]
pub struct AdaptiveSampler {
    serverless: bool,
    period: Duration,
    target: u64,
    max_samples: u64,
    threshold: f64,
    seen: u64,
    sampled: u64,
    reset_count: u64,
    window_start_ms: Option<u64>,
}

impl AdaptiveSampler {
    pub fn new(config: SamplerConfig) -> Self {
        let mut sampler = AdaptiveSampler {
            serverless: config.serverless,
            period: config.period,
            target: 0,
            max_samples: 0,
            threshold: 0.0,
            seen: 0,
            sampled: 0,
            reset_count: 0,
            window_start_ms: None,
        };
        sampler.set_sampling_target(config.target);
        sampler
    }

    /// Decides whether the transaction holding `roll` as its priority should
    /// be fully traced.
    pub fn should_sample(&mut self, roll: f64) -> bool {
        self.seen += 1;
        if roll >= self.threshold {
            self.increment_sampled();
            return true;
        }
        false
    }

    fn increment_sampled(&mut self) {
        self.sampled += 1;
        if self.sampled < self.target {
            return;
        }
        if self.reset_count == 0 {
            // Cold start: the first period takes the first `target`
            // transactions seen and nothing more.
            self.threshold = 1.0;
        } else {
            // Past the target, admission decays smoothly instead of cutting
            // off, so mid-period traffic shifts don't bias which transactions
            // get traced. The exact curve is load-bearing; tests pin it.
            let target = self.target as f64;
            let ratio = target / self.sampled as f64;
            let max_ratio = target / self.max_samples as f64;
            let adjusted = target.powf(ratio) - target.powf(max_ratio);
            self.adjust_stats(adjusted);
        }
    }

    fn adjust_stats(&mut self, target: f64) {
        if self.seen > 0 {
            self.threshold = 1.0 - (target / self.seen as f64).min(1.0);
        }
    }

    /// Closes the current sampling period and opens the next one.
    ///
    /// The new period's threshold derives from how much traffic the closing
    /// period saw: admission probability becomes `target / seen`, clamped to
    /// `[0, 1]`.
    pub fn reset(&mut self) {
        self.adjust_stats(self.target as f64);
        self.reset_count += 1;
        self.seen = 0;
        self.sampled = 0;
    }

    /// Serverless period detection, fed with each transaction's start time.
    ///
    /// Opens a window when none exists, or when a transaction starts at least
    /// one period past the current window start; either way the counters
    /// reset. Returns whether the window changed.
    pub fn maybe_update_window(&mut self, tx_start_ms: u64) -> bool {
        let period_ms = self.period.as_millis() as u64;
        let stale = match self.window_start_ms {
            None => true,
            Some(start) => tx_start_ms.saturating_sub(start) >= period_ms,
        };
        if stale {
            self.window_start_ms = Some(tx_start_ms);
            self.reset();
        }
        stale
    }

    /// Changes the per-period target and re-derives the threshold immediately.
    pub fn set_sampling_target(&mut self, target: u64) {
        self.target = target;
        self.max_samples = 2 * target;
        self.adjust_stats(target as f64);
    }

    /// Changes the period length.
    ///
    /// The reset timer reads the period on its next tick; in serverless mode
    /// only window detection consults it.
    pub fn set_sampling_period(&mut self, period: Duration) {
        debug!("sampling period set to {:?}", period);
        self.period = period;
    }

    pub fn sampling_target(&self) -> u64 {
        self.target
    }

    pub fn sampling_period(&self) -> Duration {
        self.period
    }

    pub fn serverless(&self) -> bool {
        self.serverless
    }

    pub fn sampling_threshold(&self) -> f64 {
        self.threshold
    }

    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn sampled(&self) -> u64 {
        self.sampled
    }

    pub fn reset_count(&self) -> u64 {
        self.reset_count
    }

    pub fn max_samples(&self) -> u64 {
        self.max_samples
    }
}
