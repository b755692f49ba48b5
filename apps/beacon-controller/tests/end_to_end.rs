use std::sync::Arc;
use std::time::Duration;

use beacon_agent::{serve_connection, Dispatcher, HostCapability, HostIdentity};
use beacon_controller::{serve, ListenerConfig, Registry};
use beacon_wire::{transform_for, FrameTransform, Plaintext};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const PROBE_INTERVAL: Duration = Duration::from_millis(100);

struct Controller {
    addr: String,
    registry: Arc<Registry>,
    accept: JoinHandle<()>,
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn controller(transform: Arc<dyn FrameTransform>) -> Controller {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    let registry = Arc::new(Registry::new());
    let config = ListenerConfig {
        handshake_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(5),
        probe_interval: PROBE_INTERVAL,
        transform,
    };
    let accept = tokio::spawn(serve(listener, Arc::clone(&registry), config));
    Controller {
        addr,
        registry,
        accept,
    }
}

/// One agent connection, served until the returned task is aborted.
async fn connect_agent(
    addr: &str,
    fingerprint: &str,
    transform: Arc<dyn FrameTransform>,
) -> JoinHandle<()> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    let identity = Arc::new(HostIdentity::with_fingerprint(Some(fingerprint.into())));
    let capability = Arc::new(HostCapability::new(std::env::temp_dir()).expect("http client"));
    let dispatcher = Dispatcher::standard(identity, capability);
    tokio::spawn(async move {
        let _ = serve_connection(
            &mut stream,
            &dispatcher,
            transform.as_ref(),
            Duration::from_secs(30),
        )
        .await;
    })
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn dropped_agent_reconnects_to_the_same_handle() {
    let controller = controller(Arc::new(Plaintext)).await;
    let registry = Arc::clone(&controller.registry);

    let agent = connect_agent(&controller.addr, "m1", Arc::new(Plaintext)).await;
    wait_for("m1 online", || {
        registry
            .lookup_by_handle(1)
            .is_some_and(|client| client.connected && client.fingerprint() == "m1")
    })
    .await;

    agent.abort();
    let _ = agent.await;
    wait_for("m1 offline", || {
        registry.lookup_by_handle(1).is_some_and(|client| !client.connected)
    })
    .await;

    let agent = connect_agent(&controller.addr, "m1", Arc::new(Plaintext)).await;
    wait_for("m1 back online", || registry.online_entries().len() == 1).await;
    let entries = registry.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].handle, 1);
    assert_eq!(entries[0].fingerprint(), "m1");
    agent.abort();
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn duplicate_fingerprint_keeps_the_first_agent() {
    let controller = controller(Arc::new(Plaintext)).await;
    let registry = Arc::clone(&controller.registry);

    let first = connect_agent(&controller.addr, "m1", Arc::new(Plaintext)).await;
    wait_for("first online", || registry.online_entries().len() == 1).await;
    let active = registry.lookup_by_handle(1).expect("entry").session;

    let second = connect_agent(&controller.addr, "m1", Arc::new(Plaintext)).await;
    tokio::time::sleep(PROBE_INTERVAL * 3).await;
    assert_eq!(registry.entries().len(), 1);
    assert!(registry.is_current(1, &active));
    active.ping().await.expect("first agent still answers");

    first.abort();
    second.abort();
}

#[cfg(unix)]
#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn run_command_round_trips_over_sealed_transport() {
    let controller = controller(transform_for(Some("shared secret"))).await;
    let registry = Arc::clone(&controller.registry);

    let agent = connect_agent(&controller.addr, "m1", transform_for(Some("shared secret"))).await;
    wait_for("m1 online", || registry.online_entries().len() == 1).await;

    let client = registry.lookup_by_handle(1).expect("client");
    let result = client
        .session
        .run_command("echo hi", false)
        .await
        .expect("run command");
    assert!(result.success);
    assert_eq!(result.output, "hi\n");
    agent.abort();
}

#[test_timeout::tokio_timeout_test(secs = 20, flavor = "multi_thread")]
async fn mismatched_keys_never_register() {
    let controller = controller(transform_for(Some("controller key"))).await;
    let registry = Arc::clone(&controller.registry);

    let agent = connect_agent(&controller.addr, "m1", transform_for(Some("agent key"))).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry.is_empty());
    agent.abort();
}
