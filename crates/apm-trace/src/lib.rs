// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Trace model and adaptive sampling for the APM agent.
//!
//! A [`transaction::Transaction`] is one logical unit of work. It owns exactly
//! one [`trace::Trace`], a tree of [`segment::Segment`]s stored in an arena and
//! addressed by index. The [`sampler::AdaptiveSampler`] decides at transaction
//! start whether the full segment tree is worth recording, holding a target
//! capture rate steady under varying load.

pub mod sampler;
pub mod segment;
pub mod trace;
pub mod transaction;

pub use sampler::{AdaptiveSampler, SamplerConfig};
pub use segment::{Segment, SegmentId};
pub use trace::Trace;
pub use transaction::{IgnorePolicy, SyntheticsData, Transaction};
