//! Process bootstrap for the overlay-network control-plane core: tracing
//! init, configuration load, `ClusterCore` construction, and a
//! signal-driven run loop. The router/handlers that would sit in front of
//! `ClusterCore` are an external collaborator and live outside this crate.

mod config;
mod core;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};

use crate::config::RootConfig;
use crate::core::ClusterCore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("lxdovn=info".parse()?),
        )
        .json()
        .init();

    info!("starting lxdovn control-plane core");

    let config = RootConfig::load()?;

    let core = match ClusterCore::new(config).await {
        Ok(core) => {
            info!("cluster core initialized successfully");
            core
        }
        Err(e) => {
            error!("failed to initialize cluster core: {e}");
            return Err(e);
        }
    };

    if let Err(e) = core.start().await {
        error!("failed to start cluster core: {e}");
        return Err(e);
    }

    info!("cluster core started successfully");

    match signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal, stopping cluster core..."),
        Err(err) => error!("unable to listen for shutdown signal: {err}"),
    }

    if let Err(e) = core.stop().await {
        error!("error during cluster core shutdown: {e}");
        return Err(e);
    }

    info!("cluster core stopped successfully");
    Ok(())
}
