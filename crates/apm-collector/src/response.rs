// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! The closed taxonomy of collector outcomes.
//!
//! Every data send resolves to one of five outcomes: success, retry (keep the
//! batch), discard (drop the batch), reconnect (re-run the handshake), or
//! fatal (stop the agent run for good). The mapping from HTTP status to
//! outcome is product policy and must not drift: "payload too large"
//! discards rather than retries so an oversized batch is never resent forever.

use serde_json::Value;
use tracing::error;

/// What a response asks the agent to do with its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDisposition {
    /// Keep the current agent run.
    Preserve,
    /// Re-run the handshake (preconnect + connect) before sending more data.
    Restart,
    /// Stop the agent entirely; no retry is permitted.
    Shutdown,
}

/// Immutable outcome of one collector call.
///
/// Constructed only through the named factories so that only valid
/// combinations of retention, retry delay and run disposition exist.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectorResponse {
    retain_data: bool,
    retry_after_ms: u64,
    run: RunDisposition,
    payload: Option<Value>,
}

impl CollectorResponse {
    /// The call worked; the payload is usable.
    pub fn success(payload: Option<Value>) -> Self {
        CollectorResponse {
            retain_data: false,
            retry_after_ms: 0,
            run: RunDisposition::Preserve,
            payload,
        }
    }

    /// The call failed transiently; keep the data for the next harvest.
    pub fn error(payload: Option<Value>) -> Self {
        CollectorResponse {
            retain_data: true,
            retry_after_ms: 0,
            run: RunDisposition::Preserve,
            payload,
        }
    }

    /// The collector ordered a permanent stop of this agent run.
    pub fn fatal(payload: Option<Value>) -> Self {
        CollectorResponse {
            retain_data: false,
            retry_after_ms: 0,
            run: RunDisposition::Shutdown,
            payload,
        }
    }

    /// Keep the data and try again after the given delay.
    pub fn retry(retry_after_ms: u64, payload: Option<Value>) -> Self {
        CollectorResponse {
            retain_data: true,
            retry_after_ms,
            run: RunDisposition::Preserve,
            payload,
        }
    }

    /// Keep the data and re-run the handshake before sending again.
    pub fn reconnect(retry_after_ms: u64, payload: Option<Value>) -> Self {
        CollectorResponse {
            retain_data: true,
            retry_after_ms,
            run: RunDisposition::Restart,
            payload,
        }
    }

    /// Drop the batch and move on; otherwise business as usual.
    pub fn discard(payload: Option<Value>) -> Self {
        CollectorResponse {
            retain_data: false,
            retry_after_ms: 0,
            run: RunDisposition::Preserve,
            payload,
        }
    }

    /// Classifies a transport status code.
    ///
    /// The table encodes deliberate product policy; reproduce it exactly.
    pub fn from_status(status: u16, payload: Option<Value>) -> Self {
        match status {
            200 | 202 => Self::success(payload),
            401 | 409 => Self::reconnect(0, payload),
            400 | 403 | 404 | 405 | 407 | 411 | 413 | 414 | 415 | 417 | 431 => {
                Self::discard(payload)
            }
            408 | 429 | 500 | 503 => Self::retry(0, payload),
            410 => Self::fatal(payload),
            unexpected => {
                error!("unexpected collector status code {unexpected}, discarding data");
                Self::discard(payload)
            }
        }
    }

    pub fn retain_data(&self) -> bool {
        self.retain_data
    }

    pub fn retry_after_ms(&self) -> u64 {
        self.retry_after_ms
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<Value> {
        self.payload
    }

    pub fn should_preserve_run(&self) -> bool {
        self.run == RunDisposition::Preserve
    }

    pub fn should_restart_run(&self) -> bool {
        self.run == RunDisposition::Restart
    }

    pub fn should_shutdown_run(&self) -> bool {
        self.run == RunDisposition::Shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_factories_are_mutually_exclusive_on_run() {
        let payload = Some(json!({"ok": true}));
        assert!(CollectorResponse::success(payload.clone()).should_preserve_run());
        assert!(!CollectorResponse::success(payload.clone()).should_restart_run());
        assert!(!CollectorResponse::success(payload.clone()).should_shutdown_run());

        assert!(CollectorResponse::fatal(None).should_shutdown_run());
        assert!(!CollectorResponse::fatal(None).should_preserve_run());

        assert!(CollectorResponse::reconnect(0, None).should_restart_run());
        assert!(!CollectorResponse::reconnect(0, None).should_shutdown_run());

        assert!(CollectorResponse::error(None).should_preserve_run());
        assert!(CollectorResponse::retry(250, None).should_preserve_run());
        assert!(CollectorResponse::discard(None).should_preserve_run());
    }

    #[test]
    fn test_retention_per_factory() {
        assert!(!CollectorResponse::success(None).retain_data());
        assert!(CollectorResponse::error(None).retain_data());
        assert!(CollectorResponse::retry(0, None).retain_data());
        assert!(CollectorResponse::reconnect(0, None).retain_data());
        assert!(!CollectorResponse::discard(None).retain_data());
        assert!(!CollectorResponse::fatal(None).retain_data());
    }

    #[test]
    fn test_status_table_success() {
        for status in [200, 202] {
            let response = CollectorResponse::from_status(status, Some(json!(1)));
            assert!(response.should_preserve_run(), "status {status}");
            assert!(!response.retain_data(), "status {status}");
            assert_eq!(response.payload(), Some(&json!(1)));
        }
    }

    #[test]
    fn test_status_table_reconnect() {
        for status in [401, 409] {
            let response = CollectorResponse::from_status(status, None);
            assert!(response.should_restart_run(), "status {status}");
            assert!(response.retain_data(), "status {status}");
        }
    }

    #[test]
    fn test_status_table_discard() {
        for status in [400, 403, 404, 405, 407, 411, 413, 414, 415, 417, 431] {
            let response = CollectorResponse::from_status(status, None);
            assert!(response.should_preserve_run(), "status {status}");
            assert!(!response.retain_data(), "status {status}");
        }
    }

    #[test]
    fn test_status_table_retain() {
        for status in [408, 429, 500, 503] {
            let response = CollectorResponse::from_status(status, None);
            assert!(response.should_preserve_run(), "status {status}");
            assert!(response.retain_data(), "status {status}");
        }
    }

    #[test]
    fn test_status_table_fatal() {
        let response = CollectorResponse::from_status(410, None);
        assert!(response.should_shutdown_run());
        assert!(!response.retain_data());
    }

    #[test]
    fn test_unexpected_status_discards() {
        for status in [302, 418, 502, 599] {
            let response = CollectorResponse::from_status(status, None);
            assert!(response.should_preserve_run(), "status {status}");
            assert!(!response.retain_data(), "status {status}");
        }
    }
}
