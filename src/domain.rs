//! Domain (§3 "Domain", §4.9, component C9).
//!
//! A `Domain` is a named container of child buses and sub-domains and the
//! isolation boundary between them: two domains that are not ancestor and
//! descendant of each other share nothing, not even name visibility. The
//! root domain is created once by [`crate::subsystem::Subsystem::start`] and
//! is never destroyed for the process's lifetime; every other domain is
//! created through a [`crate::control::ControlHandle`] and destroyed when
//! that handle closes (cascading into every bus and sub-domain it contains).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::bus::Bus;
use crate::error::{BusError, Result};

pub const ROOT_DOMAIN_NAME: &str = "/";

struct Inner {
    name: String,
    parent: Option<Weak<Domain>>,
    next_bus_id: Mutex<u64>,
    buses: Mutex<HashMap<String, Arc<Bus>>>,
    domains: Mutex<HashMap<String, Arc<Domain>>>,
    disconnected: Mutex<bool>,
}

/// A namespace of buses and sub-domains.
///
/// Downward edges (`buses`, `domains`) are owning `Arc`s; the upward edge
/// (`parent`) is a non-owning `Weak`, matching the cyclic-reference rule in
/// SPEC_FULL.md §9: dereferencing a stale upward handle once the parent has
/// disconnected behaves as [`BusError::Disconnected`], not a panic.
pub struct Domain(Inner);

impl Domain {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self(Inner {
            name: ROOT_DOMAIN_NAME.to_string(),
            parent: None,
            next_bus_id: Mutex::new(1),
            buses: Mutex::new(HashMap::new()),
            domains: Mutex::new(HashMap::new()),
            disconnected: Mutex::new(false),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn is_disconnected(&self) -> bool {
        *self.0.disconnected.lock()
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_disconnected() {
            Err(BusError::Disconnected)
        } else {
            Ok(())
        }
    }

    /// Creates a child bus. Fails `USAGE` (as a malformed-request style
    /// error) if a bus or sub-domain of that name already exists among this
    /// domain's children -- names are unique among siblings per the data
    /// model, across both child tables since a control handle's object tree
    /// path doesn't distinguish the two kinds.
    pub fn make_bus(
        self: &Arc<Self>,
        name: impl Into<String>,
        flags: u64,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<Arc<Bus>> {
        self.require_connected()?;
        let name = name.into();

        let mut buses = self.0.buses.lock();
        let domains = self.0.domains.lock();
        if buses.contains_key(&name) || domains.contains_key(&name) {
            return Err(BusError::MalformedHeader(format!(
                "name `{name}` already in use among this domain's children"
            )));
        }
        drop(domains);

        let id = {
            let mut next = self.0.next_bus_id.lock();
            let id = *next;
            *next += 1;
            id
        };

        let bus = Bus::new(id, name.clone(), Arc::downgrade(self), flags, mode, uid, gid);
        buses.insert(name, bus.clone());
        Ok(bus)
    }

    /// Creates a sub-domain, isolated from every sibling of this domain and
    /// of its own siblings.
    pub fn make_domain(self: &Arc<Self>, name: impl Into<String>) -> Result<Arc<Domain>> {
        self.require_connected()?;
        let name = name.into();

        let mut domains = self.0.domains.lock();
        let buses = self.0.buses.lock();
        if domains.contains_key(&name) || buses.contains_key(&name) {
            return Err(BusError::MalformedHeader(format!(
                "name `{name}` already in use among this domain's children"
            )));
        }
        drop(buses);

        let child = Arc::new(Domain(Inner {
            name: name.clone(),
            parent: Some(Arc::downgrade(self)),
            next_bus_id: Mutex::new(1),
            buses: Mutex::new(HashMap::new()),
            domains: Mutex::new(HashMap::new()),
            disconnected: Mutex::new(false),
        }));
        domains.insert(name, child.clone());
        Ok(child)
    }

    pub fn bus(&self, name: &str) -> Option<Arc<Bus>> {
        self.0.buses.lock().get(name).cloned()
    }

    pub fn sub_domain(&self, name: &str) -> Option<Arc<Domain>> {
        self.0.domains.lock().get(name).cloned()
    }

    pub fn bus_names(&self) -> Vec<String> {
        self.0.buses.lock().keys().cloned().collect()
    }

    fn remove_bus(&self, name: &str) {
        self.0.buses.lock().remove(name);
    }

    fn remove_domain(&self, name: &str) {
        self.0.domains.lock().remove(name);
    }

    /// Destroys this domain: every bus and sub-domain it (transitively)
    /// contains is disconnected first, then this domain is marked
    /// disconnected and unlinked from its parent's child table. Invoked when
    /// the creator's control handle closes, or cascaded from an ancestor's
    /// own `disconnect`.
    pub fn disconnect(self: &Arc<Self>) {
        let mut disconnected = self.0.disconnected.lock();
        if *disconnected {
            return;
        }
        *disconnected = true;
        drop(disconnected);

        for bus in self.0.buses.lock().values() {
            bus.disconnect();
        }
        self.0.buses.lock().clear();

        for child in self.0.domains.lock().values() {
            child.disconnect();
        }
        self.0.domains.lock().clear();

        if let Some(parent) = self.0.parent.as_ref().and_then(Weak::upgrade) {
            parent.remove_domain(&self.0.name);
        }
    }

    /// Tears down a single child bus created through this domain, as if its
    /// creator's control handle had closed -- used by
    /// [`crate::control::ControlHandle`]'s close path.
    pub fn destroy_bus(&self, name: &str) {
        if let Some(bus) = self.0.buses.lock().get(name).cloned() {
            bus.disconnect();
        }
        self.remove_bus(name);
    }

    pub fn destroy_sub_domain(&self, name: &str) {
        if let Some(domain) = self.0.domains.lock().get(name).cloned() {
            domain.disconnect();
        }
        self.remove_domain(name);
    }
}
