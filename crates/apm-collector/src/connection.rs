// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! Handshake state machine for the collector conversation.
//!
//! `preconnect` negotiates the endpoint (and optionally security policies),
//! `connect` logs the agent in and yields the run id, and `agent_settings`
//! pushes the local settings snapshot. Failures short of an explicit shutdown
//! are retried on a fixed backoff schedule, forever.

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::ConnectBackoff;
use crate::response::CollectorResponse;
use crate::transport::{Transport, TransportError, TransportReply};

/// Lifecycle of one collector connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started, or stopped on request.
    Stopped,
    /// Handshake in progress.
    Connecting,
    /// Logged in; data methods may be invoked.
    Connected,
    /// Last handshake attempt failed; a retry is pending.
    Errored,
    /// The collector ordered a permanent stop (forced disconnect).
    Disconnected,
}

/// Where the collector lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
}

impl CollectorEndpoint {
    pub fn new(host: impl Into<String>, port: u16, use_tls: bool) -> Self {
        CollectorEndpoint {
            host: host.into(),
            port,
            use_tls,
        }
    }

    fn method_url(&self, method: &str, license_key: &str) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!(
            "{scheme}://{host}:{port}/agent_listener/invoke_raw_method?method={method}&license_key={license_key}&marshal_format=json&protocol_version=17",
            host = self.host,
            port = self.port,
        )
    }
}

/// Proxy settings as the user supplied them.
///
/// A full `url` is authoritative. `host`/`port` alone are remembered only to
/// recognize the misconfiguration where traffic is expected to tunnel but no
/// proxy url was ever assembled.
#[derive(Debug, Clone, Default)]
pub struct ProxyConfig {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

impl ProxyConfig {
    fn misconfigured(&self) -> bool {
        self.url.is_none() && (self.host.is_some() || self.port.is_some())
    }
}

/// Static facts the handshake needs.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub endpoint: CollectorEndpoint,
    pub license_key: String,
    pub app_name: String,
    pub high_security: bool,
    pub security_policies_token: Option<String>,
    pub proxy: ProxyConfig,
    /// Local settings snapshot pushed via `agent_settings` after login.
    pub local_settings: Value,
}

/// Terminal outcomes of [`CollectorConnection::establish`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("collector requested permanent shutdown")]
    Shutdown,
    #[error("connection attempt cancelled")]
    Cancelled,
}

enum HandshakeFailure {
    Fatal(String),
    Retry(String),
}

/// Owns the handshake state machine and the active endpoint.
pub struct CollectorConnection<T> {
    transport: T,
    config: ConnectionConfig,
    state: ConnectionState,
    redirect: Option<CollectorEndpoint>,
    run_id: Option<i64>,
    security_policies: Option<Value>,
    server_settings: Option<Value>,
}

impl<T: Transport> CollectorConnection<T> {
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        CollectorConnection {
            transport,
            config,
            state: ConnectionState::Stopped,
            redirect: None,
            run_id: None,
            security_policies: None,
            server_settings: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn run_id(&self) -> Option<i64> {
        self.run_id
    }

    /// Settings the collector returned from `connect`, for the caller to
    /// apply to its live configuration.
    pub fn server_settings(&self) -> Option<&Value> {
        self.server_settings.as_ref()
    }

    /// The endpoint data methods go to: the redirect if one was issued,
    /// otherwise the configured endpoint.
    pub fn active_endpoint(&self) -> &CollectorEndpoint {
        self.redirect.as_ref().unwrap_or(&self.config.endpoint)
    }

    /// Runs the handshake until it succeeds, the collector orders a shutdown,
    /// or the token is cancelled. Retries follow the fixed backoff schedule
    /// with an unbounded attempt count.
    pub async fn establish(&mut self, cancel: &CancellationToken) -> Result<(), ConnectError> {
        let mut backoff = ConnectBackoff::new();
        loop {
            self.state = ConnectionState::Connecting;
            match self.try_handshake().await {
                Ok(()) => {
                    self.state = ConnectionState::Connected;
                    if let Some(run_id) = self.run_id {
                        info!("collector handshake complete, agent run id {run_id}");
                    }
                    return Ok(());
                }
                Err(HandshakeFailure::Fatal(reason)) => {
                    error!("collector ordered shutdown: {reason}");
                    self.state = ConnectionState::Disconnected;
                    return Err(ConnectError::Shutdown);
                }
                Err(HandshakeFailure::Retry(reason)) => {
                    self.state = ConnectionState::Errored;
                    let step = backoff.next_step();
                    if step.warn {
                        warn!(
                            "collector handshake failed ({reason}); retrying in {}s",
                            step.delay.as_secs()
                        );
                    } else {
                        info!(
                            "collector handshake failed ({reason}); retrying in {}s",
                            step.delay.as_secs()
                        );
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            self.state = ConnectionState::Stopped;
                            return Err(ConnectError::Cancelled);
                        }
                        _ = tokio::time::sleep(step.delay) => {}
                    }
                }
            }
        }
    }

    async fn try_handshake(&mut self) -> Result<(), HandshakeFailure> {
        self.run_id = None;
        self.redirect = None;

        // Preconnect always targets the configured endpoint, never a prior
        // redirect, so a bad redirect cannot loop.
        let mut policy_envelope = json!({ "high_security": self.config.high_security });
        if let Some(token) = &self.config.security_policies_token {
            policy_envelope["security_policies_token"] = json!(token);
        }
        let origin = self.config.endpoint.clone();
        let reply = self
            .post(&origin, "preconnect", &json!([policy_envelope]))
            .await
            .map_err(|e| HandshakeFailure::Retry(format!("preconnect transport failure: {e}")))?;
        if reply.status == 401 {
            warn!("collector rejected the license key during preconnect");
        }
        let response = CollectorResponse::from_status(reply.status, parse_return_value(&reply.body));
        if response.should_shutdown_run() {
            return Err(HandshakeFailure::Fatal(format!(
                "preconnect answered {}",
                reply.status
            )));
        }
        if !matches!(reply.status, 200 | 202) {
            return Err(HandshakeFailure::Retry(format!(
                "preconnect failed with status {}",
                reply.status
            )));
        }
        let payload = response.into_payload().unwrap_or(Value::Null);
        if let Some(redirect) = payload.get("redirect_host").and_then(Value::as_str) {
            self.redirect = parse_redirect_host(redirect, &self.config.endpoint);
        }
        self.security_policies = payload
            .get("security_policies")
            .filter(|v| !v.is_null())
            .cloned();

        // Login on the (possibly redirected) endpoint.
        let mut connect_facts = json!({
            "app_name": [self.config.app_name],
            "high_security": self.config.high_security,
        });
        if let Some(policies) = &self.security_policies {
            info!("applying security policies negotiated during preconnect");
            connect_facts["security_policies"] = policies.clone();
        }
        let endpoint = self.active_endpoint().clone();
        let reply = self
            .post(&endpoint, "connect", &json!([connect_facts]))
            .await
            .map_err(|e| HandshakeFailure::Retry(format!("connect transport failure: {e}")))?;
        let response = CollectorResponse::from_status(reply.status, parse_return_value(&reply.body));
        if response.should_shutdown_run() {
            return Err(HandshakeFailure::Fatal(format!(
                "connect answered {}",
                reply.status
            )));
        }
        if !matches!(reply.status, 200 | 202) {
            return Err(HandshakeFailure::Retry(format!(
                "connect failed with status {}",
                reply.status
            )));
        }
        let payload = response.into_payload().unwrap_or(Value::Null);
        let Some(run_id) = payload.get("agent_run_id").and_then(Value::as_i64) else {
            return Err(HandshakeFailure::Retry(
                "connect response did not contain agent_run_id".to_string(),
            ));
        };
        self.run_id = Some(run_id);
        self.server_settings = Some(payload);

        // Push the local settings snapshot. A failure here is a protocol
        // nuisance, not a reason to tear the run down.
        match self
            .post(&endpoint, "agent_settings", &json!([run_id, self.config.local_settings]))
            .await
        {
            Ok(reply) if matches!(reply.status, 200 | 202) => {}
            Ok(reply) => warn!("agent_settings push failed with status {}", reply.status),
            Err(e) => warn!("agent_settings push failed: {e}"),
        }
        Ok(())
    }

    /// Invokes a data method as `[agentRunId, ...args]` against the active
    /// endpoint and classifies the status code.
    pub async fn invoke(
        &self,
        method: &str,
        args: Vec<Value>,
    ) -> Result<CollectorResponse, TransportError> {
        let mut request = Vec::with_capacity(args.len() + 1);
        if let Some(run_id) = self.run_id {
            request.push(json!(run_id));
        }
        request.extend(args);
        let endpoint = self.active_endpoint().clone();
        let reply = self.post(&endpoint, method, &Value::Array(request)).await?;
        Ok(CollectorResponse::from_status(
            reply.status,
            parse_return_value(&reply.body),
        ))
    }

    /// Tells the collector the run is over, then forgets it.
    pub async fn send_shutdown_notice(&mut self) {
        if let Some(run_id) = self.run_id {
            let endpoint = self.active_endpoint().clone();
            match self.post(&endpoint, "shutdown", &json!([run_id])).await {
                Ok(_) => debug!("shutdown notice delivered"),
                Err(e) => debug!("shutdown notice failed: {e}"),
            }
        }
        self.state = ConnectionState::Stopped;
        self.run_id = None;
    }

    /// Marks the run permanently dead after a fatal data-send response.
    pub fn mark_disconnected(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.run_id = None;
    }

    async fn post(
        &self,
        endpoint: &CollectorEndpoint,
        method: &str,
        body: &Value,
    ) -> Result<TransportReply, TransportError> {
        let url = endpoint.method_url(method, &self.config.license_key);
        let bytes = serde_json::to_vec(body).map_err(|e| {
            TransportError::new(
                crate::transport::TransportErrorKind::Other,
                format!("failed to serialize {method} request: {e}"),
            )
        })?;
        match self.transport.post(&url, bytes).await {
            Ok(reply) => Ok(reply),
            Err(err) => {
                if err.is_proxy_suspect() && self.config.proxy.misconfigured() {
                    warn!(
                        "collector request {method} failed ({err}); proxy_host/proxy_port are set \
                         without a full proxy url, verify the proxy configuration"
                    );
                } else {
                    debug!("collector request {method} failed: {err}");
                }
                Err(err)
            }
        }
    }
}

fn parse_return_value(body: &[u8]) -> Option<Value> {
    let envelope: Value = serde_json::from_slice(body).ok()?;
    envelope.get("return_value").cloned()
}

/// Parses a `host[:port]` redirect. A malformed value is logged and ignored,
/// keeping the originally configured endpoint.
fn parse_redirect_host(redirect: &str, origin: &CollectorEndpoint) -> Option<CollectorEndpoint> {
    let (host, port) = match redirect.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => {
                warn!("malformed redirect host {redirect:?}, keeping configured endpoint");
                return None;
            }
        },
        None => (redirect, origin.port),
    };
    if host.is_empty() {
        warn!("malformed redirect host {redirect:?}, keeping configured endpoint");
        return None;
    }
    Some(CollectorEndpoint::new(host, port, origin.use_tls))
}
