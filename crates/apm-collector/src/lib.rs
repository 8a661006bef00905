// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Collector protocol client for the APM agent.
//!
//! The collector conversation is fragile by design: endpoints redirect,
//! responses carry exact retry/discard/shutdown semantics, and the agent must
//! keep retrying a handshake for as long as it is allowed to. This crate owns
//! that conversation: the [`response::CollectorResponse`] taxonomy, the
//! [`connection::CollectorConnection`] handshake state machine with its
//! backoff schedule, and the [`transport::Transport`] seam the decision logic
//! sits on.

pub mod backoff;
pub mod connection;
pub mod response;
pub mod transport;

pub use connection::{
    CollectorConnection, CollectorEndpoint, ConnectError, ConnectionConfig, ConnectionState,
    ProxyConfig,
};
pub use response::{CollectorResponse, RunDisposition};
pub use transport::{HttpTransport, Transport, TransportError, TransportErrorKind, TransportReply};
