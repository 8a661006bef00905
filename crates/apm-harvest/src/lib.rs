// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Buffering and periodic shipping of telemetry to the collector.
//!
//! Every data kind follows the same loop: buffer between harvests, serialize
//! on the harvest tick, send through the shared collector connection, and let
//! the response decide whether the batch is cleared, retained for the next
//! cycle, or whether the whole agent reconnects or stops. The slow-trace
//! selection logic lives in [`trace_aggregator::TraceAggregator`]; everything
//! else buffers through [`event_buffer::EventBuffer`].

pub mod event_buffer;
pub mod harvest;
pub mod trace_aggregator;

pub use event_buffer::EventBuffer;
pub use harvest::{EventHarvest, HarvestCycle, HarvestKind, TraceHarvest};
pub use trace_aggregator::{HarvestTrace, TraceAggregator, TraceThreshold, TracerSettings};
