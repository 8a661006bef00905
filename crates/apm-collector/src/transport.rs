// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

//! The transport seam the connection logic sits on.
//!
//! Everything above this trait reasons in terms of "send bytes, get a status
//! code back". TLS and proxy tunneling details stay inside the reqwest-backed
//! implementation.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;

/// Coarse classification of a transport failure.
///
/// `ConnectionReset` and `Protocol` matter to the connection layer: combined
/// with a partially configured proxy they indicate the classic
/// proxy-misconfiguration failure mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    ConnectionRefused,
    ConnectionReset,
    Protocol,
    Timeout,
    Other,
}

/// A failed transport round trip. Always retryable by itself.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        TransportError {
            kind,
            message: message.into(),
        }
    }

    /// Whether this failure looks like traffic hitting a proxy that was never
    /// told to be one.
    pub fn is_proxy_suspect(&self) -> bool {
        matches!(
            self.kind,
            TransportErrorKind::ConnectionReset | TransportErrorKind::Protocol
        )
    }
}

/// Raw result of one POST: a status code and the response body.
#[derive(Debug, Clone)]
pub struct TransportReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Sends one request to the collector.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<TransportReply, TransportError>;
}

/// Production transport backed by reqwest, with optional HTTPS proxy support.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(proxy_url: Option<&str>, timeout: Duration) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(proxy) = proxy_url {
            let proxy = reqwest::Proxy::all(proxy).map_err(|e| {
                TransportError::new(
                    TransportErrorKind::Other,
                    format!("invalid proxy url: {e}"),
                )
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| {
            TransportError::new(
                TransportErrorKind::Other,
                format!("failed to build http client: {e}"),
            )
        })?;
        Ok(HttpTransport { client, timeout })
    }

    fn classify(error: &reqwest::Error) -> TransportErrorKind {
        if error.is_timeout() {
            return TransportErrorKind::Timeout;
        }
        // Walk the source chain for the underlying io error; reqwest does not
        // expose it directly.
        let mut source: Option<&(dyn StdError + 'static)> = error.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                return match io.kind() {
                    std::io::ErrorKind::ConnectionReset => TransportErrorKind::ConnectionReset,
                    std::io::ErrorKind::ConnectionRefused => TransportErrorKind::ConnectionRefused,
                    std::io::ErrorKind::InvalidData => TransportErrorKind::Protocol,
                    _ => TransportErrorKind::Other,
                };
            }
            source = cause.source();
        }
        if error.is_connect() {
            return TransportErrorKind::ConnectionRefused;
        }
        TransportErrorKind::Other
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<TransportReply, TransportError> {
        let response = self
            .client
            .post(url)
            .timeout(self.timeout)
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| TransportError::new(Self::classify(&e), e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::new(Self::classify(&e), e.to_string()))?;
        Ok(TransportReply {
            status,
            body: body.to_vec(),
        })
    }
}
