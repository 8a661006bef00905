// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Wiring for the running agent.
//!
//! `AgentServices::start` builds the sampler, the aggregators, the collector
//! connection and one harvest loop per data kind, and hands back an
//! [`AgentHandle`] for lifecycle control plus a cloneable [`TelemetryHandle`]
//! for instrumentation. Everything stops through one `CancellationToken`, so
//! a forced disconnect and a user-requested stop travel the same path and no
//! pending reconnect timer outlives the agent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use apm_collector::{CollectorConnection, ConnectError, HttpTransport};
use apm_harvest::{EventBuffer, EventHarvest, HarvestCycle, TraceAggregator, TraceHarvest};
use apm_trace::{AdaptiveSampler, SamplerConfig, Transaction};

use crate::config::{AgentConfig, SettingsHandle};
use crate::error::AgentError;

/// Builds and launches the agent's background services.
pub struct AgentServices {
    config: AgentConfig,
}

impl AgentServices {
    pub fn new(config: AgentConfig) -> Self {
        AgentServices { config }
    }

    pub async fn start(self) -> Result<AgentHandle, AgentError> {
        let config = self.config;
        config.validate()?;
        info!("starting apm agent for {}", config.app_name);

        let settings = Arc::new(SettingsHandle::new(config.clone()));

        let sampler = Arc::new(Mutex::new(AdaptiveSampler::new(SamplerConfig {
            target: config.sampling_target,
            period: Duration::from_secs(config.sampling_target_period_in_seconds),
            serverless: config.serverless_mode_enabled,
        })));
        {
            // Server-side settings changes must reach the sampler before the
            // next admission check; the observer runs synchronously.
            let sampler = Arc::clone(&sampler);
            settings.on_change(Box::new(move |delta| {
                if let Ok(mut sampler) = sampler.lock() {
                    if let Some(target) = delta.sampling_target {
                        sampler.set_sampling_target(target);
                    }
                    if let Some(period) = delta.sampling_period {
                        sampler.set_sampling_period(period);
                    }
                }
            }));
        }

        let aggregator = Arc::new(Mutex::new(TraceAggregator::new()));
        let errors = Arc::new(Mutex::new(EventBuffer::new(config.max_error_events)));
        let custom_events = Arc::new(Mutex::new(EventBuffer::new(config.max_custom_events)));
        let metrics = Arc::new(Mutex::new(EventBuffer::new(config.max_metric_batches)));

        let transport = HttpTransport::new(
            config.proxy.as_deref(),
            Duration::from_secs(config.request_timeout_secs),
        )
        .map_err(|e| AgentError::Transport(e.to_string()))?;
        let connection = Arc::new(TokioMutex::new(CollectorConnection::new(
            transport,
            config.connection_config(),
        )));

        let cancel = CancellationToken::new();
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        // Initial handshake; server settings from connect are applied once it
        // lands.
        {
            let connection = Arc::clone(&connection);
            let settings = Arc::clone(&settings);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut guard = connection.lock().await;
                match guard.establish(&cancel).await {
                    Ok(()) => {
                        if let Some(server_settings) = guard.server_settings() {
                            settings.apply_server_settings(server_settings);
                        }
                    }
                    Err(ConnectError::Shutdown) => {
                        error!("collector refused the agent permanently, stopping");
                        cancel.cancel();
                    }
                    Err(ConnectError::Cancelled) => {}
                }
            }));
        }

        // Sampling period timer. Serverless mode has no timers; the window
        // rolls off transaction start times instead.
        if !config.serverless_mode_enabled {
            let sampler = Arc::clone(&sampler);
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let period = sampler
                        .lock()
                        .map(|s| s.sampling_period())
                        .unwrap_or(Duration::from_secs(60));
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(period) => {
                            if let Ok(mut sampler) = sampler.lock() {
                                sampler.reset();
                            }
                        }
                    }
                }
            }));
        }

        let harvest_interval = Duration::from_secs(config.harvest_interval_secs);

        let traces_enabled = {
            let settings = Arc::clone(&settings);
            move || settings.tracer_settings().enabled
        };
        tasks.push(tokio::spawn(
            HarvestCycle::new(
                TraceHarvest::new(Arc::clone(&aggregator), traces_enabled),
                Arc::clone(&connection),
                harvest_interval,
                cancel.clone(),
            )
            .run(),
        ));

        let errors_enabled = {
            let settings = Arc::clone(&settings);
            move || settings.with(|c| c.collect_errors)
        };
        tasks.push(tokio::spawn(
            HarvestCycle::new(
                EventHarvest::new("errors", "error_data", Arc::clone(&errors), errors_enabled),
                Arc::clone(&connection),
                harvest_interval,
                cancel.clone(),
            )
            .run(),
        ));

        let events_enabled = {
            let settings = Arc::clone(&settings);
            move || settings.with(|c| c.collect_custom_events)
        };
        tasks.push(tokio::spawn(
            HarvestCycle::new(
                EventHarvest::new(
                    "custom events",
                    "custom_event_data",
                    Arc::clone(&custom_events),
                    events_enabled,
                ),
                Arc::clone(&connection),
                harvest_interval,
                cancel.clone(),
            )
            .run(),
        ));

        let metrics_enabled = {
            let settings = Arc::clone(&settings);
            move || settings.with(|c| c.collect_metrics)
        };
        tasks.push(tokio::spawn(
            HarvestCycle::new(
                EventHarvest::new("metrics", "metric_data", Arc::clone(&metrics), metrics_enabled),
                Arc::clone(&connection),
                harvest_interval,
                cancel.clone(),
            )
            .run(),
        ));

        Ok(AgentHandle {
            cancel,
            settings,
            sampler,
            aggregator,
            errors,
            custom_events,
            metrics,
            connection,
            tasks,
        })
    }
}

/// Control handle for the running agent.
pub struct AgentHandle {
    cancel: CancellationToken,
    settings: Arc<SettingsHandle>,
    sampler: Arc<Mutex<AdaptiveSampler>>,
    aggregator: Arc<Mutex<TraceAggregator>>,
    errors: Arc<Mutex<EventBuffer>>,
    custom_events: Arc<Mutex<EventBuffer>>,
    metrics: Arc<Mutex<EventBuffer>>,
    connection: Arc<TokioMutex<CollectorConnection<HttpTransport>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl AgentHandle {
    /// The interface instrumentation talks to.
    pub fn telemetry(&self) -> TelemetryHandle {
        TelemetryHandle {
            settings: Arc::clone(&self.settings),
            sampler: Arc::clone(&self.sampler),
            aggregator: Arc::clone(&self.aggregator),
            errors: Arc::clone(&self.errors),
            custom_events: Arc::clone(&self.custom_events),
            metrics: Arc::clone(&self.metrics),
        }
    }

    /// Whether the agent has stopped (or was told to by the collector).
    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the agent stops for any reason, including a forced
    /// disconnect from the collector.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await;
    }

    /// Stops all services: cancels timers and loops, waits for the final
    /// flushes, and tells the collector the run is over. Idempotent.
    pub async fn stop(self) -> Result<(), AgentError> {
        info!("stopping agent services");
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        self.connection.lock().await.send_shutdown_notice().await;
        Ok(())
    }
}

/// Cloneable handle handed to instrumentation.
#[derive(Clone)]
pub struct TelemetryHandle {
    settings: Arc<SettingsHandle>,
    sampler: Arc<Mutex<AdaptiveSampler>>,
    aggregator: Arc<Mutex<TraceAggregator>>,
    errors: Arc<Mutex<EventBuffer>>,
    custom_events: Arc<Mutex<EventBuffer>>,
    metrics: Arc<Mutex<EventBuffer>>,
}

impl TelemetryHandle {
    /// Creates a transaction with the current apdex-T attributed and the
    /// sampling decision already made.
    pub fn start_transaction(&self, name: &str) -> Transaction {
        let config = self.settings.snapshot();
        let mut tx = Transaction::new(name, config.max_trace_segments);
        tx.set_apdex_t(config.apdex_t);
        let sampled = self.should_sample_at(tx.priority(), tx.start_ms());
        tx.set_sampled(sampled);
        tx
    }

    /// Raw admission check, for callers that manage their own transactions.
    pub fn should_sample(&self, priority: f64) -> bool {
        let start_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.should_sample_at(priority, start_ms)
    }

    fn should_sample_at(&self, priority: f64, start_ms: u64) -> bool {
        match self.sampler.lock() {
            Ok(mut sampler) => {
                if sampler.serverless() {
                    sampler.maybe_update_window(start_ms);
                }
                sampler.should_sample(priority)
            }
            Err(_) => false,
        }
    }

    /// Offers a finished transaction to the trace selector. The transaction
    /// is only read; the caller remains free to drop it.
    pub fn transaction_finished(&self, tx: &Transaction) {
        let tracer = self.settings.tracer_settings();
        if let Ok(mut aggregator) = self.aggregator.lock() {
            aggregator.add(tx, &tracer);
        }
    }

    pub fn record_error(&self, error: Value) {
        if let Ok(mut buffer) = self.errors.lock() {
            buffer.push(error);
        }
    }

    pub fn record_custom_event(&self, event: Value) {
        if let Ok(mut buffer) = self.custom_events.lock() {
            buffer.push(event);
        }
    }

    pub fn record_metric(&self, metric: Value) {
        if let Ok(mut buffer) = self.metrics.lock() {
            buffer.push(metric);
        }
    }
}
