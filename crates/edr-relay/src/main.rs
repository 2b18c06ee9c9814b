// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use edr_manager::{Manager, ManagerConfig};

#[tokio::main]
pub async fn main() {
    let config = match ManagerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            // logging is not set up yet
            eprintln!("Invalid manager configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("Failed to set up logging: {e:#}");
        std::process::exit(1);
    }
    debug!("Logging subsystem enabled");

    if let Err(e) = run(config).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(log_level).context("could not parse log level in configuration")?,
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

async fn run(config: ManagerConfig) -> anyhow::Result<()> {
    let endpoints = config.endpoints.len();
    let manager = Manager::new(config).context("failed to create manager")?;
    if endpoints == 0 {
        info!("No endpoint registered, set EDR_MANAGER_ENDPOINTS to accept forwarders");
    }

    let addr = manager.run().await.context("failed to start manager")?;
    info!("EDR relay ready on {} with {} endpoints", addr, endpoints);

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");
    manager.shutdown().await;
    Ok(())
}
