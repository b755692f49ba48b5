use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_agent::{
    runtime, telemetry, AgentConfig, Cli, Dispatcher, HostCapability, HostIdentity, IdentitySource,
};
use clap::Parser;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init()?;
    let config = AgentConfig::try_from(Cli::parse())?;

    let identity = Arc::new(HostIdentity::with_fingerprint(config.fingerprint.clone()));
    let capability = Arc::new(
        HostCapability::new(config.download_dir.clone()).context("failed to build http client")?,
    );
    let dispatcher = Arc::new(Dispatcher::standard(identity.clone(), capability));
    info!(
        controller = %config.controller_addr,
        fingerprint = %identity.basic().fingerprint,
        transform = config.transform.name(),
        "starting beacon-agent"
    );

    tokio::select! {
        _ = runtime::run(config, dispatcher) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            info!("beacon-agent stopped");
        }
    }
    Ok(())
}
