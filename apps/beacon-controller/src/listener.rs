use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_wire::{FrameTransform, Session, SessionConfig, SessionError, SessionStream};
use metrics::counter;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::ControllerConfig;
use crate::registry::{Installed, Registry, RegistryError};
use crate::supervisor::spawn_supervisor;
use crate::telemetry::{METRIC_HANDSHAKES, METRIC_SESSIONS_RETIRED};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub handshake_timeout: Duration,
    pub request_timeout: Duration,
    pub probe_interval: Duration,
    pub transform: Arc<dyn FrameTransform>,
}

impl From<&ControllerConfig> for ListenerConfig {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            handshake_timeout: config.handshake_timeout,
            request_timeout: config.request_timeout,
            probe_interval: config.probe_interval,
            transform: Arc::clone(&config.transform),
        }
    }
}

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no identity within {0:?}")]
    TimedOut(Duration),
    #[error("identity request failed: {0}")]
    Session(#[from] SessionError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl HandshakeError {
    fn outcome(&self) -> &'static str {
        match self {
            HandshakeError::TimedOut(_) => "timeout",
            HandshakeError::Session(_) => "failed",
            HandshakeError::Registry(RegistryError::DuplicateSession { .. }) => "duplicate",
            HandshakeError::Registry(_) => "rejected",
        }
    }
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))
}

/// Accepts connections forever, handshaking each on its own task.
pub async fn serve(listener: TcpListener, registry: Arc<Registry>, config: ListenerConfig) {
    match listener.local_addr() {
        Ok(addr) => info!(listen_addr = %addr, "accepting agents"),
        Err(err) => warn!(error = %err, "listener has no local address"),
    }
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY");
                }
                let registry = Arc::clone(&registry);
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(err) =
                        handle_connection(stream, peer.to_string(), registry, &config).await
                    {
                        warn!(peer = %peer, error = %err, "handshake rejected");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

/// Identifies a fresh connection and installs it in the registry.
///
/// A connection that fails here is dropped before any lookup can see it.
pub async fn handle_connection<S: SessionStream>(
    stream: S,
    peer: String,
    registry: Arc<Registry>,
    config: &ListenerConfig,
) -> Result<Installed, HandshakeError> {
    let session = Arc::new(Session::new(
        stream,
        peer,
        SessionConfig {
            request_timeout: config.request_timeout,
            transform: Arc::clone(&config.transform),
        },
    ));

    let result = handshake(&session, &registry, config.handshake_timeout).await;
    match &result {
        Ok(installed) => {
            counter!(METRIC_HANDSHAKES, "outcome" => "accepted").increment(1);
            info!(
                handle = installed.handle(),
                peer = %session.peer(),
                session_id = %session.id(),
                "agent connected"
            );
            spawn_supervisor(
                registry,
                installed.handle(),
                Arc::clone(&session),
                config.probe_interval,
            );
        }
        Err(err) => {
            counter!(METRIC_HANDSHAKES, "outcome" => err.outcome()).increment(1);
            if session.retire() {
                counter!(METRIC_SESSIONS_RETIRED, "reason" => "handshake").increment(1);
            }
        }
    }
    result
}

async fn handshake(
    session: &Arc<Session>,
    registry: &Registry,
    handshake_timeout: Duration,
) -> Result<Installed, HandshakeError> {
    let identity = timeout(handshake_timeout, session.basic_identity())
        .await
        .map_err(|_| HandshakeError::TimedOut(handshake_timeout))??;
    debug!(
        peer = %session.peer(),
        fingerprint = %identity.fingerprint,
        name = %identity.display_name(),
        "identity received"
    );
    Ok(registry.install(identity, Arc::clone(session))?)
}
