// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! The generic harvest loop every data kind shares.
//!
//! On a timer: serialize the kind's buffered items, send them through the
//! shared collector connection, then always reset the kind's per-window state
//! once per attempt and act on the response: clear on success, merge the
//! batch back on retain, re-run the handshake on reconnect, stop the agent on
//! a forced disconnect. One loop per kind means one kind's sends never
//! overlap each other.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use apm_collector::{CollectorConnection, ConnectError, Transport};

use crate::event_buffer::EventBuffer;
use crate::trace_aggregator::{HarvestTrace, TraceAggregator};

/// One harvestable data kind.
///
/// Implementations are synchronous; all I/O stays in [`HarvestCycle`].
pub trait HarvestKind: Send {
    /// What the batch looks like between take and merge-back.
    type Batch: Send;

    /// Human-readable name for logs.
    fn name(&self) -> &'static str;

    /// Collector method receiving this kind's payload.
    fn endpoint(&self) -> &'static str;

    /// Evaluated against live settings at every tick.
    fn enabled(&self) -> bool;

    /// Takes the buffered items for one send, or `None` when there is nothing
    /// worth sending this window.
    fn take_batch(&mut self) -> Option<Self::Batch>;

    /// Wire arguments for the batch (the run id is prepended by the
    /// connection).
    fn serialize(&self, batch: &Self::Batch) -> Vec<Value>;

    /// Restores a batch the collector told us to keep for the next cycle.
    fn merge_retained(&mut self, batch: Self::Batch);

    /// Bookkeeping after a confirmed send.
    fn on_success(&mut self, batch: &Self::Batch);

    /// Drops per-window state. Runs exactly once per harvest attempt,
    /// whatever the outcome, so a rejected batch can never wedge the kind.
    fn clear(&mut self);
}

/// Transaction traces, backed by the top-N aggregator.
pub struct TraceHarvest<E> {
    aggregator: Arc<Mutex<TraceAggregator>>,
    enabled: E,
}

impl<E> TraceHarvest<E> {
    pub fn new(aggregator: Arc<Mutex<TraceAggregator>>, enabled: E) -> Self {
        TraceHarvest {
            aggregator,
            enabled,
        }
    }
}

#[allow(clippy::expect_used)]
impl<E: Fn() -> bool + Send> HarvestKind for TraceHarvest<E> {
    type Batch = Vec<HarvestTrace>;

    fn name(&self) -> &'static str {
        "transaction traces"
    }

    fn endpoint(&self) -> &'static str {
        "transaction_sample_data"
    }

    fn enabled(&self) -> bool {
        (self.enabled)()
    }

    fn take_batch(&mut self) -> Option<Self::Batch> {
        let traces = self
            .aggregator
            .lock()
            .expect("lock poisoned")
            .harvest();
        if traces.is_empty() {
            None
        } else {
            Some(traces)
        }
    }

    fn serialize(&self, batch: &Self::Batch) -> Vec<Value> {
        vec![Value::Array(batch.iter().map(HarvestTrace::to_wire).collect())]
    }

    fn merge_retained(&mut self, batch: Self::Batch) {
        self.aggregator
            .lock()
            .expect("lock poisoned")
            .merge_retained(batch);
    }

    fn on_success(&mut self, batch: &Self::Batch) {
        self.aggregator
            .lock()
            .expect("lock poisoned")
            .record_reported(batch.len() as u64);
    }

    fn clear(&mut self) {
        self.aggregator.lock().expect("lock poisoned").clear();
    }
}

/// Simple buffered kinds: errors, custom events, metric batches.
///
/// The buffer carries data across windows, so `clear()` is a no-op here;
/// items that arrived during a send must survive it.
pub struct EventHarvest<E> {
    name: &'static str,
    endpoint: &'static str,
    buffer: Arc<Mutex<EventBuffer>>,
    enabled: E,
}

impl<E> EventHarvest<E> {
    pub fn new(
        name: &'static str,
        endpoint: &'static str,
        buffer: Arc<Mutex<EventBuffer>>,
        enabled: E,
    ) -> Self {
        EventHarvest {
            name,
            endpoint,
            buffer,
            enabled,
        }
    }
}

#[allow(clippy::expect_used)]
impl<E: Fn() -> bool + Send> HarvestKind for EventHarvest<E> {
    type Batch = Vec<Value>;

    fn name(&self) -> &'static str {
        self.name
    }

    fn endpoint(&self) -> &'static str {
        self.endpoint
    }

    fn enabled(&self) -> bool {
        (self.enabled)()
    }

    fn take_batch(&mut self) -> Option<Self::Batch> {
        let items = self.buffer.lock().expect("lock poisoned").drain();
        if items.is_empty() {
            None
        } else {
            Some(items)
        }
    }

    fn serialize(&self, batch: &Self::Batch) -> Vec<Value> {
        vec![Value::Array(batch.clone())]
    }

    fn merge_retained(&mut self, batch: Self::Batch) {
        self.buffer.lock().expect("lock poisoned").merge(batch);
    }

    fn on_success(&mut self, _batch: &Self::Batch) {}

    fn clear(&mut self) {}
}

/// Drives one data kind's harvest loop against the shared connection.
pub struct HarvestCycle<K, T> {
    kind: K,
    connection: Arc<TokioMutex<CollectorConnection<T>>>,
    interval: Duration,
    cancel: CancellationToken,
}

impl<K: HarvestKind, T: Transport> HarvestCycle<K, T> {
    pub fn new(
        kind: K,
        connection: Arc<TokioMutex<CollectorConnection<T>>>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        HarvestCycle {
            kind,
            connection,
            interval,
            cancel,
        }
    }

    /// Runs until cancelled, harvesting every `interval`. A still-connected
    /// agent gets one final flush on the way out.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await; // discard the immediate first tick
        loop {
            tokio::select! {
                _ = ticker.tick() => self.harvest_once().await,
                _ = self.cancel.cancelled() => {
                    if self.connection.lock().await.is_connected() {
                        debug!("final {} flush", self.kind.name());
                        self.harvest_once().await;
                    }
                    break;
                }
            }
        }
    }

    /// One harvest attempt: take, send, clear, act on the response.
    pub async fn harvest_once(&mut self) {
        if !self.kind.enabled() {
            debug!("{} harvest disabled, skipping", self.kind.name());
            return;
        }
        let Some(batch) = self.kind.take_batch() else {
            self.kind.clear();
            return;
        };
        let args = self.kind.serialize(&batch);

        let (result, run_id) = {
            let connection = self.connection.lock().await;
            if !connection.is_connected() {
                drop(connection);
                self.kind.clear();
                self.kind.merge_retained(batch);
                debug!("{}: not connected, batch retained", self.kind.name());
                return;
            }
            let run_id = connection.run_id();
            (connection.invoke(self.kind.endpoint(), args).await, run_id)
        };
        self.kind.clear();

        match result {
            Err(err) => {
                // Transport errors are never fatal by themselves.
                debug!(
                    "{} harvest transport failure: {err}; batch retained",
                    self.kind.name()
                );
                self.kind.merge_retained(batch);
            }
            Ok(response) if response.should_shutdown_run() => {
                error!(
                    "collector issued a forced disconnect on {}",
                    self.kind.endpoint()
                );
                self.connection.lock().await.mark_disconnected();
                self.cancel.cancel();
            }
            Ok(response) if response.should_restart_run() => {
                warn!(
                    "collector requested a reconnect during {}",
                    self.kind.endpoint()
                );
                if response.retain_data() {
                    self.kind.merge_retained(batch);
                }
                self.reestablish(run_id).await;
            }
            Ok(response) if response.retain_data() => {
                debug!("{}: batch retained for next harvest", self.kind.name());
                self.kind.merge_retained(batch);
            }
            Ok(_) => self.kind.on_success(&batch),
        }
    }

    async fn reestablish(&self, stale_run_id: Option<i64>) {
        let mut connection = self.connection.lock().await;
        // Another kind may have already re-run the handshake while this one
        // waited on the lock.
        if connection.is_connected() && connection.run_id() != stale_run_id {
            return;
        }
        match connection.establish(&self.cancel).await {
            Ok(()) => {}
            Err(ConnectError::Shutdown) => self.cancel.cancel(),
            Err(ConnectError::Cancelled) => {}
        }
    }
}
