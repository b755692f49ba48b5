use std::sync::Arc;
use std::time::Duration;

use beacon_agent::{run, AgentConfig, Dispatcher, HostCapability, HostIdentity};
use beacon_wire::{Session, SessionConfig};
use tokio::net::TcpListener;

fn agent(addr: String) -> (AgentConfig, Arc<Dispatcher>) {
    let mut config = AgentConfig::new(addr);
    config.reconnect_delay = Duration::from_millis(50);
    config.connect_timeout = Duration::from_secs(1);
    config.fingerprint = Some("reconnect-test".into());
    let identity = Arc::new(HostIdentity::with_fingerprint(config.fingerprint.clone()));
    let capability =
        Arc::new(HostCapability::new(std::env::temp_dir()).expect("http client"));
    (config, Arc::new(Dispatcher::standard(identity, capability)))
}

#[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread")]
async fn agent_redials_after_the_controller_drops_it() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let (config, dispatcher) = agent(listener.local_addr().expect("addr").to_string());
    let agent = tokio::spawn(run(config, dispatcher));

    let (stream, _) = listener.accept().await.expect("first accept");
    let session = Session::new(stream, "agent", SessionConfig::default());
    let identity = session.basic_identity().await.expect("identity");
    assert_eq!(identity.fingerprint, "reconnect-test");
    session.retire();
    drop(session);

    let (stream, _) = listener.accept().await.expect("second accept");
    let session = Session::new(stream, "agent", SessionConfig::default());
    session.ping().await.expect("ping after redial");

    agent.abort();
}

#[cfg(unix)]
#[test_timeout::tokio_timeout_test(secs = 10, flavor = "multi_thread")]
async fn full_system_info_reports_host_facts() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let (config, dispatcher) = agent(listener.local_addr().expect("addr").to_string());
    let agent = tokio::spawn(run(config, dispatcher));

    let (stream, _) = listener.accept().await.expect("accept");
    let session = Session::new(stream, "agent", SessionConfig::default());
    let info = session.system_info().await.expect("system info");
    assert_eq!(info.identity.fingerprint, "reconnect-test");
    assert_eq!(info.architecture, std::env::consts::ARCH);
    assert!(info.logical_cores > 0);
    assert!(!info.agent_version.is_empty());

    agent.abort();
}
