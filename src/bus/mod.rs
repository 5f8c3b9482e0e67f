//! Bus (§3 "Bus", §4.8, component C8).
//!
//! A `Bus` is a named exchange inside one [`crate::domain::Domain`]: it owns
//! the strictly-increasing connection/message id counters, the default
//! endpoint plus any custom ones, the name registry (C4) and bus-level
//! policy (C5), and the connection table the router (C10) consults to
//! resolve id-addressed sends and broadcast fan-out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::connection::{Connection, Credentials};
use crate::domain::Domain;
use crate::endpoint::{Endpoint, DEFAULT_ENDPOINT_NAME};
use crate::error::{BusError, Result};
use crate::name_registry::{NameEvent, NameRegistry};
use crate::policy::Policy;
use crate::wire::Message;

pub struct Bus {
    id: u64,
    name: String,
    domain: Weak<Domain>,
    flags: u64,
    #[allow(dead_code)]
    mode: u32,
    #[allow(dead_code)]
    uid: u32,
    #[allow(dead_code)]
    gid: u32,
    next_connection_id: AtomicU64,
    next_message_id: AtomicU64,
    endpoints: RwLock<HashMap<String, Arc<Endpoint>>>,
    connections: RwLock<HashMap<u64, Arc<Connection>>>,
    name_registry: NameRegistry,
    policy: Mutex<Policy>,
    disconnected: Mutex<bool>,
}

impl Bus {
    pub(crate) fn new(
        id: u64,
        name: String,
        domain: Weak<Domain>,
        flags: u64,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Arc<Self> {
        let mut endpoints = HashMap::new();
        let default = Arc::new(Endpoint::default_for_bus());
        endpoints.insert(DEFAULT_ENDPOINT_NAME.to_string(), default);

        Arc::new(Self {
            id,
            name,
            domain,
            flags,
            mode,
            uid,
            gid,
            next_connection_id: AtomicU64::new(1),
            next_message_id: AtomicU64::new(1),
            endpoints: RwLock::new(endpoints),
            connections: RwLock::new(HashMap::new()),
            name_registry: NameRegistry::new(),
            policy: Mutex::new(Policy::default()),
            disconnected: Mutex::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> u64 {
        self.flags
    }

    pub fn domain(&self) -> Result<Arc<Domain>> {
        self.domain.upgrade().ok_or(BusError::Disconnected)
    }

    pub fn is_disconnected(&self) -> bool {
        *self.disconnected.lock()
    }

    pub fn name_registry(&self) -> &NameRegistry {
        &self.name_registry
    }

    pub fn set_policy(&self, policy: Policy) {
        *self.policy.lock() = policy;
    }

    pub fn policy(&self) -> Policy {
        self.policy.lock().clone()
    }

    /// Creates a custom endpoint layering `endpoint_policy` on top of the
    /// bus's own. Fails if the name is already taken -- the default
    /// endpoint's name `"bus"` is reserved.
    pub fn make_endpoint(&self, name: impl Into<String>, endpoint_policy: Policy) -> Result<Arc<Endpoint>> {
        let name = name.into();
        let mut endpoints = self.endpoints.write();
        if endpoints.contains_key(&name) {
            return Err(BusError::MalformedHeader(format!(
                "endpoint `{name}` already exists"
            )));
        }
        let endpoint = Arc::new(Endpoint::custom(name.clone(), endpoint_policy));
        endpoints.insert(name, endpoint.clone());
        Ok(endpoint)
    }

    pub fn endpoint(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints.read().get(name).cloned()
    }

    pub fn default_endpoint(&self) -> Arc<Endpoint> {
        self.endpoint(DEFAULT_ENDPOINT_NAME)
            .expect("default endpoint always exists")
    }

    pub fn destroy_endpoint(&self, name: &str) {
        if name == DEFAULT_ENDPOINT_NAME {
            return;
        }
        if let Some(endpoint) = self.endpoints.write().remove(name) {
            for id in endpoint.connection_ids() {
                self.terminate_connection(id);
            }
        }
    }

    /// Opens a new connection on `endpoint` in the *unconnected* state
    /// (§4.6): the id is not allocated until [`Bus::hello`] is called on it.
    pub fn open_connection(&self, endpoint: &Arc<Endpoint>, pool_capacity: u64, credentials: Credentials) -> Arc<Connection> {
        Arc::new(Connection::new_unconnected(endpoint.clone(), pool_capacity, credentials))
    }

    /// Completes HELLO: allocates the next connection id (strictly
    /// increasing, §3's Bus invariant) and publishes the connection in the
    /// bus's id table so SEND/broadcast can reach it.
    pub fn hello(&self, conn: &Arc<Connection>) -> Result<u64> {
        if self.is_disconnected() {
            return Err(BusError::Disconnected);
        }
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        conn.activate(id)?;
        self.connections.write().insert(id, conn.clone());
        conn.endpoint().add_connection(id);
        Ok(id)
    }

    pub fn next_message_id(&self) -> u64 {
        self.next_message_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn connection(&self, id: u64) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    /// Snapshot of every live connection id, for broadcast fan-out. Taken
    /// and released before any per-connection lock is touched, per the
    /// lock-ordering rule in SPEC_FULL.md §5.
    pub fn connection_ids(&self) -> Vec<u64> {
        self.connections.read().keys().copied().collect()
    }

    /// Tears down one connection: removes it from the id table and its
    /// endpoint, marks it disconnected, and releases every name it owned or
    /// was queued for. Returns the resulting [`NameEvent`]s so the caller
    /// (normally [`crate::router::Router`]) can turn them into synthetic
    /// notifications -- plain bus bookkeeping has no way to deliver a
    /// message itself.
    pub fn terminate_connection(&self, id: u64) -> Vec<NameEvent> {
        let conn = self.connections.write().remove(&id);
        match conn {
            Some(conn) => {
                conn.endpoint().remove_connection(id);
                conn.disconnect();
                self.name_registry.remove_connection(id)
            }
            None => Vec::new(),
        }
    }

    /// Disconnects every endpoint and connection on this bus and marks it
    /// disconnected, waking any blocked receivers. Idempotent.
    pub fn disconnect(&self) {
        let mut disconnected = self.disconnected.lock();
        if *disconnected {
            return;
        }
        *disconnected = true;
        drop(disconnected);

        let ids: Vec<u64> = self.connections.read().keys().copied().collect();
        for id in ids {
            self.terminate_connection(id);
        }
        self.endpoints.write().clear();
    }

    /// Delivers `msg` to every connection whose installed mask admits the
    /// broadcast's bloom filter and that `policy_admits` accepts, skipping
    /// the sender itself only if it doesn't subscribe to its own filter
    /// (self-broadcast is not special cased -- a sender that also matches
    /// its own mask does receive a copy, same as any other recipient, per
    /// §4.10's "send to self is allowed"). `policy_admits` is the
    /// per-recipient TALK_TO/SEE check (§4.10d); it lives in the caller
    /// ([`crate::router::Router`]) since it needs the sender's endpoint and
    /// credentials, neither of which this method has.
    pub fn broadcast(
        &self,
        msg: &Message,
        filter: &crate::bloom::Bloom,
        mut policy_admits: impl FnMut(&Arc<Connection>) -> bool,
    ) -> Vec<(u64, Result<()>)> {
        let ids = self.connection_ids();
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(conn) = self.connection(id) else {
                continue;
            };
            if !conn.admits_broadcast(filter) {
                continue;
            }
            if !policy_admits(&conn) {
                continue;
            }
            let result = conn.deliver(msg.clone());
            if let Err(e) = &result {
                conn.mark_lossy();
                tracing::warn!(connection = id, error = %e, "broadcast delivery failed, marking lossy");
            }
            results.push((id, result));
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;

    fn make_bus() -> Arc<Bus> {
        Domain::root().make_bus("test", 0, 0o666, 0, 0).unwrap()
    }

    #[test]
    fn connection_ids_are_strictly_increasing() {
        let bus = make_bus();
        let ep = bus.default_endpoint();
        let a = bus.open_connection(&ep, 4096, Credentials::default());
        let b = bus.open_connection(&ep, 4096, Credentials::default());

        let id_a = bus.hello(&a).unwrap();
        let id_b = bus.hello(&b).unwrap();
        assert_eq!(id_a, 1);
        assert_eq!(id_b, 2);
        assert!(bus.connection(id_a).is_some());
    }

    #[test]
    fn terminate_connection_releases_owned_names() {
        let bus = make_bus();
        let ep = bus.default_endpoint();
        let conn = bus.open_connection(&ep, 4096, Credentials::default());
        let id = bus.hello(&conn).unwrap();

        bus.name_registry().request_name("org.example.Foo", id, Default::default());
        assert_eq!(bus.name_registry().lookup("org.example.Foo"), Some(id));

        bus.terminate_connection(id);
        assert_eq!(bus.name_registry().lookup("org.example.Foo"), None);
        assert!(bus.connection(id).is_none());
    }

    #[test]
    fn disconnect_terminates_all_connections() {
        let bus = make_bus();
        let ep = bus.default_endpoint();
        let a = bus.open_connection(&ep, 4096, Credentials::default());
        let id = bus.hello(&a).unwrap();

        bus.disconnect();
        assert!(bus.is_disconnected());
        assert!(bus.connection(id).is_none());
    }
}
