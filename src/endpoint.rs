//! Endpoint (§3 "Endpoint", component C7).
//!
//! An endpoint is a named attachment point on a bus. Every bus has one
//! default, unrestricted endpoint; a bus may additionally open custom
//! endpoints that layer a narrower [`Policy`] on top of the bus policy and,
//! unlike the default endpoint, enforce [`Verb::See`] so a restricted
//! client can be kept from even discovering names it isn't allowed to talk
//! to.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::policy::{EndpointPolicy, Policy, Principal, Verb};

pub const DEFAULT_ENDPOINT_NAME: &str = "bus";

pub struct Endpoint {
    name: String,
    policy: RwLock<EndpointPolicy>,
    connections: RwLock<HashSet<u64>>,
}

impl Endpoint {
    /// The always-present endpoint every bus is created with: nothing
    /// narrows the bus policy further. Does not snapshot the bus policy --
    /// every check consults it live, via [`EndpointPolicy::check`].
    pub fn default_for_bus() -> Self {
        Self {
            name: DEFAULT_ENDPOINT_NAME.to_string(),
            policy: RwLock::new(EndpointPolicy::unrestricted()),
            connections: RwLock::new(HashSet::new()),
        }
    }

    pub fn custom(name: impl Into<String>, endpoint_policy: Policy) -> Self {
        Self {
            name: name.into(),
            policy: RwLock::new(EndpointPolicy::with_endpoint(endpoint_policy)),
            connections: RwLock::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> EndpointPolicy {
        self.policy.read().clone()
    }

    /// `EP_POLICY_SET` (§6): replaces this endpoint's policy overlay wholesale.
    /// Connections already open through this endpoint see the new overlay on
    /// their very next check -- [`EndpointPolicy`] is always consulted live,
    /// never cached per-connection, the same reasoning that keeps
    /// [`EndpointPolicy::check`] taking the bus policy as a parameter instead
    /// of a snapshot.
    pub fn set_policy(&self, endpoint_policy: Policy) {
        *self.policy.write() = EndpointPolicy::with_endpoint(endpoint_policy);
    }

    pub fn add_connection(&self, id: u64) {
        self.connections.write().insert(id);
    }

    pub fn remove_connection(&self, id: u64) {
        self.connections.write().remove(&id);
    }

    pub fn connection_ids(&self) -> Vec<u64> {
        self.connections.read().iter().copied().collect()
    }

    pub fn owns_connection(&self, id: u64) -> bool {
        self.connections.read().contains(&id)
    }

    /// Whether a name is visible through this endpoint to `principal`.
    /// Only custom endpoints enforce SEE; the default endpoint always
    /// returns `true`. `bus_policy` is the bus's current policy, passed in
    /// live rather than cached on the endpoint.
    pub fn name_visible(&self, bus_policy: &Policy, principal: Principal<'_>, name: &str) -> bool {
        let policy = self.policy.read();
        !policy.enforces_see() || policy.check(bus_policy, principal, Verb::See, name).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Decision, Object, Rule, Subject};

    #[test]
    fn default_endpoint_does_not_enforce_see() {
        let endpoint = Endpoint::default_for_bus();
        assert!(endpoint.name_visible(&Policy::default(), Principal::default(), "org.example.Foo"));
    }

    #[test]
    fn custom_endpoint_hides_names_denied_see() {
        let bus_policy = Policy::new(vec![Rule::new(
            Subject::World,
            Verb::TalkTo,
            Object::Name("org.example.Foo".into()),
            Decision::Allow,
        )]);
        let endpoint_policy = Policy::default();
        let endpoint = Endpoint::custom("restricted", endpoint_policy);
        assert!(!endpoint.name_visible(&bus_policy, Principal::default(), "org.example.Foo"));
    }

    #[test]
    fn set_policy_replaces_the_overlay_in_place() {
        let bus_policy = Policy::new(vec![Rule::new(
            Subject::World,
            Verb::See,
            Object::Name("org.example.Foo".into()),
            Decision::Allow,
        )]);
        let endpoint = Endpoint::custom("restricted", Policy::default());
        assert!(!endpoint.name_visible(&bus_policy, Principal::default(), "org.example.Foo"));

        endpoint.set_policy(Policy::new(vec![Rule::new(
            Subject::World,
            Verb::See,
            Object::Name("org.example.Foo".into()),
            Decision::Allow,
        )]));
        assert!(endpoint.name_visible(&bus_policy, Principal::default(), "org.example.Foo"));
    }

    #[test]
    fn connection_membership_tracks_add_remove() {
        let endpoint = Endpoint::default_for_bus();
        endpoint.add_connection(1);
        assert!(endpoint.owns_connection(1));
        endpoint.remove_connection(1);
        assert!(!endpoint.owns_connection(1));
    }
}
