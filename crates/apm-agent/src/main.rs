// Copyright 2024-Present the apm-agent authors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use apm_agent_core::{AgentConfig, AgentServices};

#[tokio::main]
pub async fn main() {
    let log_level = env::var("APM_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("hyper=off,reqwest=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Error creating config on agent startup: {e}");
            return;
        }
    };

    let handle = match AgentServices::new(config).start().await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Error starting agent services: {e}");
            return;
        }
    };
    info!("apm agent started");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
        }
        _ = handle.stopped() => {
            info!("agent run ended by the collector");
        }
    }

    if let Err(e) = handle.stop().await {
        error!("Error during shutdown: {e}");
    }
}
