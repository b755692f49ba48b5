use std::sync::Arc;

use anyhow::{Context, Result};
use beacon_controller::{
    listener, telemetry, Cli, Console, ControllerConfig, ListenerConfig, Registry,
};
use clap::Parser;
use tokio::io::BufReader;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ControllerConfig::try_from(cli)?;
    telemetry::init(config.metrics_addr)?;
    info!(
        listen_addr = %config.listen_addr,
        transform = config.transform.name(),
        probe_interval_secs = config.probe_interval.as_secs(),
        "starting beacon-controller"
    );

    let registry = Arc::new(Registry::new());
    let tcp = listener::bind(config.listen_addr).await?;
    let accept = tokio::spawn(listener::serve(
        tcp,
        Arc::clone(&registry),
        ListenerConfig::from(&config),
    ));

    if config.console {
        let console = Console::new(Arc::clone(&registry));
        tokio::select! {
            result = console.run(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
                result.context("console i/o failed")?;
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
            }
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for ctrl-c")?;
    }

    accept.abort();
    let online = registry.online_entries();
    for client in &online {
        client.session.retire();
    }
    info!(retired = online.len(), "beacon-controller stopped");
    Ok(())
}
