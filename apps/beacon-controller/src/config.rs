use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use beacon_wire::{transform_for, FrameTransform};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "beacon-controller",
    author,
    version,
    about = "Accepts beacon agents and runs commands on them"
)]
pub struct Cli {
    /// Address agents connect to.
    #[arg(long, env = "BEACON_LISTEN_ADDR", default_value = "0.0.0.0:4422")]
    pub listen_addr: String,

    /// Seconds between liveness probes of each connected agent.
    #[arg(long, env = "BEACON_PROBE_INTERVAL_SECS", default_value_t = 5)]
    pub probe_interval_secs: u64,

    /// Upper bound on one request/response round trip.
    #[arg(long, env = "BEACON_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Time a new connection has to report its identity.
    #[arg(long, env = "BEACON_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Shared passphrase; when set every frame is sealed with ChaCha20-Poly1305.
    #[arg(long, env = "BEACON_SHARED_KEY", hide_env_values = true)]
    pub shared_key: Option<String>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, env = "BEACON_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// Run without the interactive console on stdin.
    #[arg(long, env = "BEACON_NO_CONSOLE", default_value_t = false)]
    pub no_console: bool,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    pub probe_interval: Duration,
    pub request_timeout: Duration,
    pub handshake_timeout: Duration,
    pub transform: Arc<dyn FrameTransform>,
    pub metrics_addr: Option<SocketAddr>,
    pub console: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 4422)),
            probe_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            transform: transform_for(None),
            metrics_addr: None,
            console: true,
        }
    }
}

impl TryFrom<Cli> for ControllerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        let metrics_addr = cli
            .metrics_addr
            .as_deref()
            .map(|addr| {
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address: {addr}"))
            })
            .transpose()?;
        for (flag, value) in [
            ("--probe-interval-secs", cli.probe_interval_secs),
            ("--request-timeout-secs", cli.request_timeout_secs),
            ("--handshake-timeout-secs", cli.handshake_timeout_secs),
        ] {
            if value == 0 {
                bail!("{flag} must be greater than zero");
            }
        }
        Ok(ControllerConfig {
            listen_addr,
            probe_interval: Duration::from_secs(cli.probe_interval_secs),
            request_timeout: Duration::from_secs(cli.request_timeout_secs),
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            transform: transform_for(cli.shared_key.as_deref()),
            metrics_addr,
            console: !cli.no_console,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["beacon-controller"]);
        let config = ControllerConfig::try_from(cli).expect("config");
        assert_eq!(config.listen_addr.port(), 4422);
        assert_eq!(config.probe_interval, Duration::from_secs(5));
        assert_eq!(config.transform.name(), "plaintext");
        assert!(config.console);
    }

    #[test]
    fn shared_key_selects_sealed_transform() {
        let cli = Cli::parse_from(["beacon-controller", "--shared-key", "k", "--no-console"]);
        let config = ControllerConfig::try_from(cli).expect("config");
        assert_eq!(config.transform.name(), "chacha20poly1305");
        assert!(!config.console);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let cli = Cli::parse_from(["beacon-controller", "--probe-interval-secs", "0"]);
        assert!(ControllerConfig::try_from(cli).is_err());
    }

    #[test]
    fn bad_addresses_are_rejected() {
        let cli = Cli::parse_from(["beacon-controller", "--listen-addr", "nowhere"]);
        assert!(ControllerConfig::try_from(cli).is_err());
    }
}
