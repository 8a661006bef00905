// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration and service wiring for the APM agent.
//!
//! [`config::AgentConfig`] is the env-driven configuration surface,
//! [`services::AgentServices`] launches the telemetry pipeline (sampler,
//! aggregators, collector connection, harvest loops) and returns the handles
//! the host application keeps.

pub mod config;
pub mod error;
pub mod services;

pub use config::{AgentConfig, SettingsDelta, SettingsHandle};
pub use error::AgentError;
pub use services::{AgentHandle, AgentServices, TelemetryHandle};
