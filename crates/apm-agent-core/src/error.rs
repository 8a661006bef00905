// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

/// Errors surfaced by the agent services.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to initialize transport: {0}")]
    Transport(String),

    #[error("Collector ordered a permanent shutdown")]
    ForcedDisconnect,

    #[error("Agent services are not running")]
    NotRunning,

    #[error("Runtime error: {0}")]
    Runtime(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AgentError::InvalidConfig("missing license key".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: missing license key"
        );
    }

    #[test]
    fn test_all_error_variants() {
        let _e1 = AgentError::InvalidConfig("test".into());
        let _e2 = AgentError::Transport("test".into());
        let _e3 = AgentError::ForcedDisconnect;
        let _e4 = AgentError::NotRunning;
        let _e5 = AgentError::Runtime("test".into());
    }
}
