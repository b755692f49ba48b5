//! Registry of connected and recently connected agents.
//!
//! Every entry owns a small positive handle that operators use to address the
//! agent. Handles are allocated lowest-free first and survive a reconnect: an
//! agent whose entry is offline gets its old handle back when it returns with
//! the same fingerprint. Entries are removed only by [`Registry::forget`].
//!
//! All state lives behind one lock, which is never held across an `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use beacon_wire::{BasicIdentity, Session};
use metrics::gauge;
use parking_lot::Mutex;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::telemetry::METRIC_CLIENTS_ONLINE;

pub type Handle = u32;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("fingerprint {fingerprint} is already connected as handle {handle}")]
    DuplicateSession { fingerprint: String, handle: Handle },
    #[error("no client with handle {0}")]
    UnknownHandle(Handle),
}

/// Outcome of a successful [`Registry::install`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Installed {
    New(Handle),
    /// An offline entry with the same fingerprint took the new session.
    Reconnected(Handle),
}

impl Installed {
    pub fn handle(self) -> Handle {
        match self {
            Installed::New(handle) | Installed::Reconnected(handle) => handle,
        }
    }
}

/// Point-in-time copy of one entry, safe to use after the lock is released.
#[derive(Debug, Clone)]
pub struct ClientView {
    pub handle: Handle,
    pub identity: BasicIdentity,
    pub session: Arc<Session>,
    pub connected: bool,
    pub connected_at: OffsetDateTime,
}

impl ClientView {
    pub fn fingerprint(&self) -> &str {
        &self.identity.fingerprint
    }
}

struct Entry {
    identity: BasicIdentity,
    session: Arc<Session>,
    connected: bool,
    connected_at: OffsetDateTime,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<Handle, Entry>,
    by_fingerprint: HashMap<String, Handle>,
}

impl Inner {
    /// Smallest positive integer not currently allocated.
    fn next_handle(&self) -> Handle {
        let mut candidate: Handle = 1;
        for &handle in self.entries.keys() {
            if handle != candidate {
                break;
            }
            candidate += 1;
        }
        candidate
    }

    fn view(&self, handle: Handle) -> Option<ClientView> {
        self.entries.get(&handle).map(|entry| view(handle, entry))
    }

    fn online(&self) -> usize {
        self.entries.values().filter(|entry| entry.connected).count()
    }
}

fn view(handle: Handle, entry: &Entry) -> ClientView {
    ClientView {
        handle,
        identity: entry.identity.clone(),
        session: Arc::clone(&entry.session),
        connected: entry.connected,
        connected_at: entry.connected_at,
    }
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(
        &self,
        identity: BasicIdentity,
        session: Arc<Session>,
    ) -> Result<Installed, RegistryError> {
        let mut inner = self.inner.lock();
        let fingerprint = identity.fingerprint.clone();

        let installed = if let Some(&handle) = inner.by_fingerprint.get(&fingerprint) {
            let entry = inner
                .entries
                .get_mut(&handle)
                .ok_or(RegistryError::UnknownHandle(handle))?;
            if entry.connected {
                return Err(RegistryError::DuplicateSession {
                    fingerprint,
                    handle,
                });
            }
            entry.identity = identity;
            entry.session = session;
            entry.connected = true;
            entry.connected_at = OffsetDateTime::now_utc();
            Installed::Reconnected(handle)
        } else {
            let handle = inner.next_handle();
            inner.entries.insert(
                handle,
                Entry {
                    identity,
                    session,
                    connected: true,
                    connected_at: OffsetDateTime::now_utc(),
                },
            );
            inner.by_fingerprint.insert(fingerprint.clone(), handle);
            Installed::New(handle)
        };

        gauge!(METRIC_CLIENTS_ONLINE).set(inner.online() as f64);
        drop(inner);
        info!(
            handle = installed.handle(),
            fingerprint = %fingerprint,
            reconnected = matches!(installed, Installed::Reconnected(_)),
            "client installed"
        );
        Ok(installed)
    }

    pub fn lookup_by_handle(&self, handle: Handle) -> Option<ClientView> {
        self.inner.lock().view(handle)
    }

    pub fn lookup_by_fingerprint(&self, fingerprint: &str) -> Option<ClientView> {
        let inner = self.inner.lock();
        let handle = *inner.by_fingerprint.get(fingerprint)?;
        inner.view(handle)
    }

    /// Connected entries ordered by handle.
    pub fn online_entries(&self) -> Vec<ClientView> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.connected)
            .map(|(&handle, entry)| view(handle, entry))
            .collect()
    }

    /// All entries, offline ones included, ordered by handle.
    pub fn entries(&self) -> Vec<ClientView> {
        let inner = self.inner.lock();
        inner
            .entries
            .iter()
            .map(|(&handle, entry)| view(handle, entry))
            .collect()
    }

    /// Whether `handle` is connected and still holds `session`.
    pub fn is_current(&self, handle: Handle, session: &Arc<Session>) -> bool {
        self.inner
            .lock()
            .entries
            .get(&handle)
            .is_some_and(|entry| entry.connected && Arc::ptr_eq(&entry.session, session))
    }

    /// Marks the entry offline if it still holds `session`.
    ///
    /// A supervisor whose session was already replaced by a reconnect must not
    /// knock the new session offline, so a stale session is a no-op.
    pub fn mark_offline(&self, handle: Handle, session: &Arc<Session>) -> bool {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&handle) else {
            return false;
        };
        if !entry.connected || !Arc::ptr_eq(&entry.session, session) {
            return false;
        }
        entry.connected = false;
        let fingerprint = entry.identity.fingerprint.clone();
        gauge!(METRIC_CLIENTS_ONLINE).set(inner.online() as f64);
        drop(inner);
        info!(handle, fingerprint = %fingerprint, "client offline");
        true
    }

    /// Operator disconnect: marks the entry offline and retires its session.
    pub fn disconnect(&self, handle: Handle) -> Result<ClientView, RegistryError> {
        let view = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .get_mut(&handle)
                .ok_or(RegistryError::UnknownHandle(handle))?;
            entry.connected = false;
            let view = view(handle, entry);
            gauge!(METRIC_CLIENTS_ONLINE).set(inner.online() as f64);
            view
        };
        view.session.retire();
        info!(handle, fingerprint = %view.fingerprint(), "client disconnected by operator");
        Ok(view)
    }

    /// Removes the entry, retires its session and frees the handle.
    pub fn forget(&self, handle: Handle) -> Result<ClientView, RegistryError> {
        let view = {
            let mut inner = self.inner.lock();
            let entry = inner
                .entries
                .remove(&handle)
                .ok_or(RegistryError::UnknownHandle(handle))?;
            if inner.by_fingerprint.get(&entry.identity.fingerprint) == Some(&handle) {
                inner.by_fingerprint.remove(&entry.identity.fingerprint);
            }
            gauge!(METRIC_CLIENTS_ONLINE).set(inner.online() as f64);
            view(handle, &entry)
        };
        view.session.retire();
        debug!(handle, fingerprint = %view.fingerprint(), "client forgotten");
        Ok(view)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_wire::SessionConfig;

    fn identity(fingerprint: &str) -> BasicIdentity {
        BasicIdentity {
            fingerprint: fingerprint.into(),
            hostname: format!("{fingerprint}-host"),
            os: "linux".into(),
            username: "ops".into(),
            administrator: false,
            language: "C".into(),
            started_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    fn session() -> Arc<Session> {
        let (local, _peer) = tokio::io::duplex(64);
        Arc::new(Session::new(local, "test", SessionConfig::default()))
    }

    #[test]
    fn handles_are_lowest_free() {
        let registry = Registry::new();
        let handles: Vec<Handle> = ["a", "b", "c"]
            .iter()
            .map(|fp| registry.install(identity(fp), session()).expect("install").handle())
            .collect();
        assert_eq!(handles, vec![1, 2, 3]);

        registry.forget(2).expect("forget");
        let reused = registry.install(identity("d"), session()).expect("install");
        assert_eq!(reused, Installed::New(2));
        let next = registry.install(identity("e"), session()).expect("install");
        assert_eq!(next, Installed::New(4));
    }

    #[test]
    fn reconnect_keeps_handle() {
        let registry = Registry::new();
        let first = session();
        let handle = registry
            .install(identity("m1"), Arc::clone(&first))
            .expect("install")
            .handle();
        assert!(registry.mark_offline(handle, &first));
        assert!(registry.online_entries().is_empty());

        let second = session();
        let installed = registry
            .install(identity("m1"), Arc::clone(&second))
            .expect("reinstall");
        assert_eq!(installed, Installed::Reconnected(handle));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_current(handle, &second));
        assert!(!registry.is_current(handle, &first));
    }

    #[test]
    fn connected_duplicate_is_rejected() {
        let registry = Registry::new();
        let active = session();
        registry
            .install(identity("m1"), Arc::clone(&active))
            .expect("install");

        let err = registry.install(identity("m1"), session()).unwrap_err();
        assert_eq!(
            err,
            RegistryError::DuplicateSession {
                fingerprint: "m1".into(),
                handle: 1
            }
        );
        assert!(registry.is_current(1, &active));
    }

    #[test]
    fn stale_session_cannot_mark_offline() {
        let registry = Registry::new();
        let old = session();
        registry.install(identity("m1"), Arc::clone(&old)).expect("install");
        registry.mark_offline(1, &old);
        let new = session();
        registry.install(identity("m1"), Arc::clone(&new)).expect("reinstall");

        assert!(!registry.mark_offline(1, &old));
        assert!(registry.is_current(1, &new));
    }

    #[test]
    fn disconnect_retires_and_keeps_entry() {
        let registry = Registry::new();
        let active = session();
        registry.install(identity("m1"), Arc::clone(&active)).expect("install");

        registry.disconnect(1).expect("disconnect");
        assert!(!active.is_alive());
        let entry = registry.lookup_by_fingerprint("m1").expect("entry kept");
        assert!(!entry.connected);
        assert_eq!(registry.disconnect(9).unwrap_err(), RegistryError::UnknownHandle(9));
    }

    #[test]
    fn forget_frees_fingerprint() {
        let registry = Registry::new();
        registry.install(identity("m1"), session()).expect("install");
        registry.forget(1).expect("forget");
        assert!(registry.lookup_by_fingerprint("m1").is_none());
        assert!(registry.lookup_by_handle(1).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn online_gauge_reaches_prometheus() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let registry = Registry::new();
        metrics::with_local_recorder(&recorder, || {
            registry.install(identity("m1"), session()).expect("install");
            registry.install(identity("m2"), session()).expect("install");
        });
        let rendered = handle.render();
        assert!(
            rendered.contains("beacon_clients_online 2"),
            "rendered: {rendered}"
        );

        metrics::with_local_recorder(&recorder, || {
            registry.disconnect(1).expect("disconnect");
        });
        assert!(handle.render().contains("beacon_clients_online 1"));
    }

    #[test_timeout::timeout(secs = 10)]
    fn concurrent_installs_keep_one_entry_per_fingerprint() {
        let registry = Arc::new(Registry::new());
        let threads: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.install(identity("m1"), session()).is_ok())
            })
            .collect();
        let accepted = threads
            .into_iter()
            .map(|thread| thread.join().expect("join"))
            .filter(|ok| *ok)
            .count();

        assert_eq!(accepted, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.online_entries().len(), 1);
    }
}
