use std::net::SocketAddr;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const METRIC_HANDSHAKES: &str = "beacon_handshakes_total";
pub const METRIC_CLIENTS_ONLINE: &str = "beacon_clients_online";
pub const METRIC_PROBE_FAILURES: &str = "beacon_probe_failures_total";
pub const METRIC_SESSIONS_RETIRED: &str = "beacon_sessions_retired_total";

/// Installs the tracing subscriber and, when requested, the Prometheus exporter.
///
/// Must be called from inside the Tokio runtime when `metrics_addr` is set.
pub fn init(metrics_addr: Option<SocketAddr>) -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init()
        .context("failed to initialise tracing subscriber")?;

    if let Some(addr) = metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(metrics_addr = %addr, "prometheus exporter listening");
    }
    Ok(())
}
