// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Fixed backoff schedule for connection attempts.

use std::time::Duration;

/// Delays between handshake attempts, in seconds. The final entry repeats for
/// every attempt past the end of the schedule; attempts are unbounded.
pub const CONNECT_BACKOFF_SECS: [u64; 6] = [15, 15, 30, 60, 120, 300];

/// Attempt index at which the connection starts warning instead of quietly
/// retrying.
const WARN_ATTEMPT_INDEX: usize = 3;

/// One step of the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStep {
    pub delay: Duration,
    /// Whether this attempt has failed long enough to warrant a warning.
    pub warn: bool,
}

/// Iterator over the connect backoff schedule.
#[derive(Debug, Default)]
pub struct ConnectBackoff {
    attempt: usize,
}

impl ConnectBackoff {
    pub fn new() -> Self {
        ConnectBackoff { attempt: 0 }
    }

    /// Number of failed attempts so far.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Returns the delay to wait before the next attempt.
    pub fn next_step(&mut self) -> BackoffStep {
        let index = self.attempt.min(CONNECT_BACKOFF_SECS.len() - 1);
        self.attempt += 1;
        BackoffStep {
            delay: Duration::from_secs(CONNECT_BACKOFF_SECS[index]),
            warn: index >= WARN_ATTEMPT_INDEX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_and_clamp() {
        let mut backoff = ConnectBackoff::new();
        let delays: Vec<u64> = (0..9).map(|_| backoff.next_step().delay.as_secs()).collect();
        assert_eq!(delays, vec![15, 15, 30, 60, 120, 300, 300, 300, 300]);
    }

    #[test]
    fn test_warn_starts_at_fourth_attempt() {
        let mut backoff = ConnectBackoff::new();
        let warns: Vec<bool> = (0..7).map(|_| backoff.next_step().warn).collect();
        assert_eq!(warns, vec![false, false, false, true, true, true, true]);
    }

    #[test]
    fn test_attempt_counter_is_unbounded() {
        let mut backoff = ConnectBackoff::new();
        for _ in 0..1000 {
            backoff.next_step();
        }
        assert_eq!(backoff.attempt(), 1000);
        assert_eq!(backoff.next_step().delay.as_secs(), 300);
    }
}
