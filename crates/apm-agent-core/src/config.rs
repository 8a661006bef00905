// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration.
//!
//! Static facts (license key, collector endpoint, proxy) are read from the
//! environment once. The dynamic subset the collector may override at connect
//! time lives behind a [`SettingsHandle`], whose observers run synchronously
//! after every mutation so the sampler is reconfigured before the next
//! admission check.

use std::env;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, warn};

use apm_collector::{CollectorEndpoint, ConnectionConfig, ProxyConfig};
use apm_harvest::{TraceThreshold, TracerSettings};

use crate::error::AgentError;

const DEFAULT_COLLECTOR_PORT: u16 = 8091;
const DEFAULT_HARVEST_INTERVAL_SECS: u64 = 60;
const DEFAULT_SAMPLING_TARGET: u64 = 10;
const DEFAULT_SAMPLING_PERIOD_SECS: u64 = 60;
const DEFAULT_APDEX_T: f64 = 0.5;
const DEFAULT_TOP_N: usize = 20;
const DEFAULT_MAX_ERROR_EVENTS: usize = 100;
const DEFAULT_MAX_CUSTOM_EVENTS: usize = 1000;
const DEFAULT_MAX_METRIC_BATCHES: usize = 1000;
const DEFAULT_MAX_TRACE_SEGMENTS: usize = 3000;

/// Full agent configuration snapshot.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub app_name: String,
    pub license_key: String,
    pub collector_host: String,
    pub collector_port: u16,
    pub collector_use_tls: bool,
    /// Full proxy url; authoritative when present.
    pub proxy: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: Option<u16>,
    pub high_security: bool,
    pub security_policies_token: Option<String>,
    pub log_level: String,
    pub harvest_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub sampling_target: u64,
    pub sampling_target_period_in_seconds: u64,
    pub serverless_mode_enabled: bool,
    pub collect_traces: bool,
    pub collect_errors: bool,
    pub collect_custom_events: bool,
    pub collect_metrics: bool,
    pub transaction_tracer_enabled: bool,
    pub transaction_tracer_top_n: usize,
    pub transaction_tracer_threshold: TraceThreshold,
    /// Apdex threshold in seconds, attributed to transactions at creation.
    pub apdex_t: f64,
    pub max_error_events: usize,
    pub max_custom_events: usize,
    pub max_metric_batches: usize,
    pub max_trace_segments: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            app_name: "unnamed-application".to_string(),
            license_key: String::new(),
            collector_host: "localhost".to_string(),
            collector_port: DEFAULT_COLLECTOR_PORT,
            collector_use_tls: true,
            proxy: None,
            proxy_host: None,
            proxy_port: None,
            high_security: false,
            security_policies_token: None,
            log_level: "info".to_string(),
            harvest_interval_secs: DEFAULT_HARVEST_INTERVAL_SECS,
            request_timeout_secs: 30,
            sampling_target: DEFAULT_SAMPLING_TARGET,
            sampling_target_period_in_seconds: DEFAULT_SAMPLING_PERIOD_SECS,
            serverless_mode_enabled: false,
            collect_traces: true,
            collect_errors: true,
            collect_custom_events: true,
            collect_metrics: true,
            transaction_tracer_enabled: true,
            transaction_tracer_top_n: DEFAULT_TOP_N,
            transaction_tracer_threshold: TraceThreshold::ApdexF,
            apdex_t: DEFAULT_APDEX_T,
            max_error_events: DEFAULT_MAX_ERROR_EVENTS,
            max_custom_events: DEFAULT_MAX_CUSTOM_EVENTS,
            max_metric_batches: DEFAULT_MAX_METRIC_BATCHES,
            max_trace_segments: DEFAULT_MAX_TRACE_SEGMENTS,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|val| val.to_lowercase() != "false")
        .unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.parse::<T>().ok())
        .unwrap_or(default)
}

impl AgentConfig {
    /// Reads the configuration from `APM_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let license_key = env::var("APM_LICENSE_KEY")
            .map_err(|_| anyhow::anyhow!("APM_LICENSE_KEY environment variable is not set"))?;

        let defaults = AgentConfig::default();
        let threshold = match env::var("APM_TRANSACTION_TRACER_THRESHOLD") {
            Ok(raw) if raw.eq_ignore_ascii_case("apdex_f") => TraceThreshold::ApdexF,
            Ok(raw) => match raw.parse::<f64>() {
                Ok(ms) => TraceThreshold::Millis(ms),
                Err(_) => {
                    warn!("unparseable APM_TRANSACTION_TRACER_THRESHOLD {raw:?}, using apdex_f");
                    TraceThreshold::ApdexF
                }
            },
            Err(_) => TraceThreshold::ApdexF,
        };

        let config = AgentConfig {
            app_name: env::var("APM_APP_NAME").unwrap_or(defaults.app_name),
            license_key,
            collector_host: env::var("APM_COLLECTOR_HOST").unwrap_or(defaults.collector_host),
            collector_port: env_parse("APM_COLLECTOR_PORT", defaults.collector_port),
            collector_use_tls: env_bool("APM_COLLECTOR_USE_TLS", defaults.collector_use_tls),
            proxy: env::var("APM_PROXY")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
            proxy_host: env::var("APM_PROXY_HOST").ok(),
            proxy_port: env::var("APM_PROXY_PORT")
                .ok()
                .and_then(|port| port.parse::<u16>().ok()),
            high_security: env_bool("APM_HIGH_SECURITY", false),
            security_policies_token: env::var("APM_SECURITY_POLICIES_TOKEN").ok(),
            log_level: env::var("APM_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
            harvest_interval_secs: env_parse(
                "APM_HARVEST_INTERVAL_SECS",
                defaults.harvest_interval_secs,
            ),
            request_timeout_secs: env_parse(
                "APM_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout_secs,
            ),
            sampling_target: env_parse("APM_SAMPLING_TARGET", defaults.sampling_target),
            sampling_target_period_in_seconds: env_parse(
                "APM_SAMPLING_TARGET_PERIOD_IN_SECONDS",
                defaults.sampling_target_period_in_seconds,
            ),
            serverless_mode_enabled: env_bool("APM_SERVERLESS_MODE_ENABLED", false),
            collect_traces: env_bool("APM_COLLECT_TRACES", true),
            collect_errors: env_bool("APM_COLLECT_ERRORS", true),
            collect_custom_events: env_bool("APM_COLLECT_CUSTOM_EVENTS", true),
            collect_metrics: env_bool("APM_COLLECT_METRICS", true),
            transaction_tracer_enabled: env_bool("APM_TRANSACTION_TRACER_ENABLED", true),
            transaction_tracer_top_n: env_parse(
                "APM_TRANSACTION_TRACER_TOP_N",
                defaults.transaction_tracer_top_n,
            ),
            transaction_tracer_threshold: threshold,
            apdex_t: env_parse("APM_APDEX_T", defaults.apdex_t),
            max_error_events: defaults.max_error_events,
            max_custom_events: defaults.max_custom_events,
            max_metric_batches: defaults.max_metric_batches,
            max_trace_segments: defaults.max_trace_segments,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.license_key.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "license key cannot be empty".to_string(),
            ));
        }
        if self.collector_host.trim().is_empty() {
            return Err(AgentError::InvalidConfig(
                "collector host cannot be empty".to_string(),
            ));
        }
        if self.harvest_interval_secs == 0 {
            return Err(AgentError::InvalidConfig(
                "harvest interval must be greater than 0".to_string(),
            ));
        }
        if self.sampling_target_period_in_seconds == 0 {
            return Err(AgentError::InvalidConfig(
                "sampling period must be greater than 0".to_string(),
            ));
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(AgentError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn collector_endpoint(&self) -> CollectorEndpoint {
        CollectorEndpoint::new(
            self.collector_host.clone(),
            self.collector_port,
            self.collector_use_tls,
        )
    }

    /// The local settings snapshot pushed to the collector after connect.
    pub fn local_settings_payload(&self) -> Value {
        json!({
            "sampling_target": self.sampling_target,
            "sampling_target_period_in_seconds": self.sampling_target_period_in_seconds,
            "harvest_interval_secs": self.harvest_interval_secs,
            "collect_traces": self.collect_traces,
            "collect_errors": self.collect_errors,
            "transaction_tracer": {
                "enabled": self.transaction_tracer_enabled,
                "top_n": self.transaction_tracer_top_n,
            },
            "serverless_mode": { "enabled": self.serverless_mode_enabled },
        })
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            endpoint: self.collector_endpoint(),
            license_key: self.license_key.clone(),
            app_name: self.app_name.clone(),
            high_security: self.high_security,
            security_policies_token: self.security_policies_token.clone(),
            proxy: ProxyConfig {
                url: self.proxy.clone(),
                host: self.proxy_host.clone(),
                port: self.proxy_port,
            },
            local_settings: self.local_settings_payload(),
        }
    }
}

/// The dynamic settings the collector changed at connect time.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SettingsDelta {
    pub sampling_target: Option<u64>,
    pub sampling_period: Option<Duration>,
    pub apdex_t: Option<f64>,
    pub collect_traces: Option<bool>,
}

impl SettingsDelta {
    fn is_empty(&self) -> bool {
        *self == SettingsDelta::default()
    }
}

pub type SettingsObserver = Box<dyn Fn(&SettingsDelta) + Send + Sync>;

/// Shared live configuration with synchronous change observers.
///
/// Observers run on the thread that applies the mutation, after it completes,
/// so a changed sampling target is in force before the next admission check.
pub struct SettingsHandle {
    config: RwLock<AgentConfig>,
    observers: Mutex<Vec<SettingsObserver>>,
}

#[allow(clippy::expect_used)]
impl SettingsHandle {
    pub fn new(config: AgentConfig) -> Self {
        SettingsHandle {
            config: RwLock::new(config),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn snapshot(&self) -> AgentConfig {
        self.config.read().expect("lock poisoned").clone()
    }

    /// Reads one value out of the live configuration.
    pub fn with<R>(&self, f: impl FnOnce(&AgentConfig) -> R) -> R {
        f(&self.config.read().expect("lock poisoned"))
    }

    /// The tracer settings the trace selector consults on every offer.
    pub fn tracer_settings(&self) -> TracerSettings {
        let config = self.config.read().expect("lock poisoned");
        TracerSettings {
            enabled: config.transaction_tracer_enabled && config.collect_traces,
            top_n: config.transaction_tracer_top_n,
            threshold: config.transaction_tracer_threshold,
        }
    }

    pub fn on_change(&self, observer: SettingsObserver) {
        self.observers.lock().expect("lock poisoned").push(observer);
    }

    /// Applies the recognized keys of a connect payload and notifies
    /// observers of what actually changed.
    pub fn apply_server_settings(&self, payload: &Value) {
        let mut delta = SettingsDelta::default();
        {
            let mut config = self.config.write().expect("lock poisoned");
            if let Some(target) = payload.get("sampling_target").and_then(Value::as_u64) {
                if target != config.sampling_target {
                    config.sampling_target = target;
                    delta.sampling_target = Some(target);
                }
            }
            if let Some(period) = payload
                .get("sampling_target_period_in_seconds")
                .and_then(Value::as_u64)
            {
                if period != config.sampling_target_period_in_seconds && period > 0 {
                    config.sampling_target_period_in_seconds = period;
                    delta.sampling_period = Some(Duration::from_secs(period));
                }
            }
            if let Some(apdex_t) = payload.get("apdex_t").and_then(Value::as_f64) {
                if apdex_t != config.apdex_t {
                    config.apdex_t = apdex_t;
                    delta.apdex_t = Some(apdex_t);
                }
            }
            if let Some(collect) = payload.get("collect_traces").and_then(Value::as_bool) {
                if collect != config.collect_traces {
                    config.collect_traces = collect;
                    delta.collect_traces = Some(collect);
                }
            }
        }
        if delta.is_empty() {
            return;
        }
        debug!("applying server-side settings: {delta:?}");
        for observer in self.observers.lock().expect("lock poisoned").iter() {
            observer(&delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    #[test]
    #[serial]
    fn test_error_if_no_license_key() {
        env::remove_var("APM_LICENSE_KEY");
        let config = AgentConfig::from_env();
        assert!(config.is_err());
        assert_eq!(
            config.unwrap_err().to_string(),
            "APM_LICENSE_KEY environment variable is not set"
        );
    }

    #[test]
    #[serial]
    fn test_defaults() {
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.collector_host, "localhost");
        assert_eq!(config.collector_port, 8091);
        assert_eq!(config.sampling_target, 10);
        assert_eq!(config.sampling_target_period_in_seconds, 60);
        assert_eq!(config.transaction_tracer_top_n, 20);
        assert_eq!(config.transaction_tracer_threshold, TraceThreshold::ApdexF);
        assert!(config.collect_traces);
        assert!(!config.serverless_mode_enabled);
        env::remove_var("APM_LICENSE_KEY");
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        env::set_var("APM_COLLECTOR_HOST", "collector.internal");
        env::set_var("APM_COLLECTOR_PORT", "9999");
        env::set_var("APM_SAMPLING_TARGET", "25");
        env::set_var("APM_TRANSACTION_TRACER_THRESHOLD", "150");
        env::set_var("APM_COLLECT_TRACES", "false");
        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.collector_host, "collector.internal");
        assert_eq!(config.collector_port, 9999);
        assert_eq!(config.sampling_target, 25);
        assert_eq!(
            config.transaction_tracer_threshold,
            TraceThreshold::Millis(150.0)
        );
        assert!(!config.collect_traces);
        for var in [
            "APM_LICENSE_KEY",
            "APM_COLLECTOR_HOST",
            "APM_COLLECTOR_PORT",
            "APM_SAMPLING_TARGET",
            "APM_TRANSACTION_TRACER_THRESHOLD",
            "APM_COLLECT_TRACES",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_unparseable_threshold_falls_back_to_apdex_f() {
        env::set_var("APM_LICENSE_KEY", "_not_a_real_key_");
        env::set_var("APM_TRANSACTION_TRACER_THRESHOLD", "not-a-number");
        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.transaction_tracer_threshold, TraceThreshold::ApdexF);
        env::remove_var("APM_LICENSE_KEY");
        env::remove_var("APM_TRANSACTION_TRACER_THRESHOLD");
    }

    #[test]
    fn test_validate_rejects_zero_harvest_interval() {
        let config = AgentConfig {
            license_key: "key".into(),
            harvest_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_log_level() {
        let config = AgentConfig {
            license_key: "key".into(),
            log_level: "verbose".into(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_apply_server_settings_notifies_observers_synchronously() {
        let handle = SettingsHandle::new(AgentConfig {
            license_key: "key".into(),
            ..Default::default()
        });
        let seen_target = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&seen_target);
        handle.on_change(Box::new(move |delta| {
            if let Some(target) = delta.sampling_target {
                seen.store(target, Ordering::SeqCst);
            }
        }));

        handle.apply_server_settings(&json!({
            "agent_run_id": 42,
            "sampling_target": 25,
            "apdex_t": 0.25,
        }));

        // Observer ran before apply returned.
        assert_eq!(seen_target.load(Ordering::SeqCst), 25);
        assert_eq!(handle.snapshot().sampling_target, 25);
        assert_eq!(handle.snapshot().apdex_t, 0.25);
    }

    #[test]
    fn test_apply_server_settings_ignores_unchanged_values() {
        let handle = SettingsHandle::new(AgentConfig {
            license_key: "key".into(),
            ..Default::default()
        });
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        handle.on_change(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        handle.apply_server_settings(&json!({"sampling_target": 10}));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_tracer_settings_combine_enabled_flags() {
        let handle = SettingsHandle::new(AgentConfig {
            license_key: "key".into(),
            ..Default::default()
        });
        assert!(handle.tracer_settings().enabled);
        handle.apply_server_settings(&json!({"collect_traces": false}));
        assert!(!handle.tracer_settings().enabled);
    }
}
