use std::sync::Arc;
use std::time::Duration;

use beacon_wire::Session;
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::registry::{Handle, Registry};
use crate::telemetry::{METRIC_PROBE_FAILURES, METRIC_SESSIONS_RETIRED};

/// Probes one installed session until it fails or stops being current.
///
/// The task exits quietly when the registry has moved on (the entry was
/// forgotten, disconnected or taken over by a reconnect). Otherwise a failed
/// probe marks the entry offline and retires the session.
pub fn spawn_supervisor(
    registry: Arc<Registry>,
    handle: Handle,
    session: Arc<Session>,
    probe_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        supervise(&registry, handle, &session, probe_interval).await;
    })
}

async fn supervise(
    registry: &Registry,
    handle: Handle,
    session: &Arc<Session>,
    probe_interval: Duration,
) {
    loop {
        tokio::time::sleep(probe_interval).await;

        if !registry.is_current(handle, session) {
            debug!(handle, session_id = %session.id(), "supervisor exiting, session replaced");
            return;
        }

        let reason = if session.is_alive() {
            match session.ping().await {
                Ok(rtt) => {
                    debug!(handle, rtt_ms = rtt.as_millis() as u64, "probe ok");
                    continue;
                }
                Err(err) => {
                    warn!(handle, session_id = %session.id(), error = %err, "probe failed");
                    err.reason()
                }
            }
        } else {
            // Retired by a failed operator command between probes.
            "retired"
        };

        counter!(METRIC_PROBE_FAILURES).increment(1);
        if registry.mark_offline(handle, session) {
            counter!(METRIC_SESSIONS_RETIRED, "reason" => reason).increment(1);
        }
        session.retire();
        return;
    }
}
