//! Name and verb policy engine (§4.5, component C5).
//!
//! A [`Policy`] is an ordered list of [`Rule`]s, evaluated first-match-wins
//! with a default-deny fallback -- the same shape the teacher's XML
//! `busconfig` policy used, minus the XML and minus the `Context`/`Group`
//! subject varieties this core doesn't need. `Verb::See` is never consulted
//! by the default (kernel) endpoint; only a custom endpoint that opted into
//! name visibility filtering checks it, per §4.5's note that SEE exists to
//! let a restricted endpoint hide names from `list`/broadcast visibility
//! without touching OWN/TALK_TO.

use crate::error::{BusError, Result};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Verb {
    Own,
    TalkTo,
    See,
}

/// Who a rule applies to. `World` always matches; `Uid`/`Gid` match a
/// connection's credentials when those are known (an unknown credential
/// never matches a non-`World` subject, it just isn't a candidate rule).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Subject {
    Uid(u32),
    Gid(u32),
    World,
}

impl Subject {
    fn matches(&self, uid: Option<u32>, gids: &[u32]) -> bool {
        match self {
            Subject::World => true,
            Subject::Uid(want) => uid == Some(*want),
            Subject::Gid(want) => gids.contains(want),
        }
    }
}

/// What a rule applies to: an exact well-known name, or a wildcard like
/// `a.b.*` which matches `a.b` itself and any name one or more labels below
/// it, by stripping the trailing `.*` and comparing prefixes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Object {
    Name(String),
    Wildcard(String),
}

impl Object {
    pub fn wildcard(prefix: impl Into<String>) -> Self {
        Object::Wildcard(prefix.into())
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Object::Name(n) => n == name,
            Object::Wildcard(prefix) => name == prefix || name.starts_with(&format!("{prefix}.")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Clone, Debug)]
pub struct Rule {
    pub subject: Subject,
    pub verb: Verb,
    pub object: Object,
    pub decision: Decision,
}

impl Rule {
    pub fn new(subject: Subject, verb: Verb, object: Object, decision: Decision) -> Self {
        Self {
            subject,
            verb,
            object,
            decision,
        }
    }
}

/// Credentials relevant to a policy decision. A subset of the full
/// [`crate::connection::Credentials`] record -- policy only ever looks at
/// identity, never at the richer audit fields.
#[derive(Clone, Copy, Debug, Default)]
pub struct Principal<'a> {
    pub uid: Option<u32>,
    pub gids: &'a [u32],
}

/// An ordered rule set, evaluated first-match-wins with default deny.
#[derive(Clone, Debug, Default)]
pub struct Policy {
    rules: Vec<Rule>,
}

impl Policy {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn push(&mut self, rule: Rule) {
        self.rules.push(rule);
    }

    pub fn decide(&self, principal: Principal<'_>, verb: Verb, object: &str) -> Decision {
        self.rules
            .iter()
            .find(|r| r.verb == verb && r.subject.matches(principal.uid, principal.gids) && r.object.matches(object))
            .map(|r| r.decision)
            .unwrap_or(Decision::Deny)
    }

    pub fn check(&self, principal: Principal<'_>, verb: Verb, object: &str) -> Result<()> {
        match self.decide(principal, verb, object) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(BusError::PolicyDenied {
                verb,
                object: object.to_string(),
            }),
        }
    }
}

/// An endpoint's policy overlay. Deliberately does **not** carry its own
/// copy of the bus policy -- the bus's [`Policy`] can change after an
/// endpoint is created (an owner may tighten or loosen it at any time), so
/// every check takes the *current* bus policy as a parameter rather than a
/// snapshot taken at endpoint-creation time. Per §4.5, an endpoint may only
/// narrow what the bus allows: this is enforced structurally, by running
/// the bus check first and letting either check veto, never by letting the
/// endpoint grant something the bus denied.
#[derive(Clone, Debug, Default)]
pub struct EndpointPolicy {
    endpoint: Option<Policy>,
}

impl EndpointPolicy {
    /// The default endpoint: no additional narrowing beyond the bus policy.
    pub fn unrestricted() -> Self {
        Self { endpoint: None }
    }

    pub fn with_endpoint(endpoint: Policy) -> Self {
        Self {
            endpoint: Some(endpoint),
        }
    }

    pub fn check(&self, bus: &Policy, principal: Principal<'_>, verb: Verb, object: &str) -> Result<()> {
        bus.check(principal, verb, object)?;
        if let Some(endpoint) = &self.endpoint {
            endpoint.check(principal, verb, object)?;
        }
        Ok(())
    }

    /// Whether this endpoint enforces [`Verb::See`] at all; the default
    /// (kernel) endpoint does not, so names are globally visible through it
    /// regardless of OWN/TALK_TO restrictions.
    pub fn enforces_see(&self) -> bool {
        self.endpoint.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn world_allow(verb: Verb, object: Object) -> Rule {
        Rule::new(Subject::World, verb, object, Decision::Allow)
    }

    #[test]
    fn default_is_deny() {
        let policy = Policy::default();
        let decision = policy.decide(Principal::default(), Verb::Own, "org.example.Foo");
        assert_eq!(decision, Decision::Deny);
    }

    #[test]
    fn first_match_wins() {
        let policy = Policy::new(vec![
            Rule::new(
                Subject::Uid(1000),
                Verb::Own,
                Object::Name("org.example.Foo".into()),
                Decision::Deny,
            ),
            world_allow(Verb::Own, Object::Name("org.example.Foo".into())),
        ]);

        let principal = Principal {
            uid: Some(1000),
            gids: &[],
        };
        assert_eq!(
            policy.decide(principal, Verb::Own, "org.example.Foo"),
            Decision::Deny
        );
    }

    #[test]
    fn wildcard_matches_descendants_not_siblings() {
        let policy = Policy::new(vec![world_allow(Verb::TalkTo, Object::wildcard("org.example"))]);

        assert_eq!(
            policy.decide(Principal::default(), Verb::TalkTo, "org.example.Foo"),
            Decision::Allow
        );
        assert_eq!(
            policy.decide(Principal::default(), Verb::TalkTo, "org.example"),
            Decision::Allow
        );
        assert_eq!(
            policy.decide(Principal::default(), Verb::TalkTo, "org.examplesuffix"),
            Decision::Deny
        );
    }

    #[test]
    fn endpoint_can_only_narrow_bus_allow() {
        let bus = Policy::new(vec![world_allow(Verb::Own, Object::Name("org.example.Foo".into()))]);
        let endpoint = Policy::new(vec![Rule::new(
            Subject::World,
            Verb::Own,
            Object::Name("org.example.Foo".into()),
            Decision::Deny,
        )]);
        let combined = EndpointPolicy::with_endpoint(endpoint);
        let err = combined
            .check(&bus, Principal::default(), Verb::Own, "org.example.Foo")
            .unwrap_err();
        assert!(matches!(err, BusError::PolicyDenied { .. }));
    }

    #[test]
    fn endpoint_cannot_grant_what_bus_denies() {
        let bus = Policy::default();
        let endpoint = Policy::new(vec![world_allow(Verb::Own, Object::Name("org.example.Foo".into()))]);
        let combined = EndpointPolicy::with_endpoint(endpoint);
        let err = combined
            .check(&bus, Principal::default(), Verb::Own, "org.example.Foo")
            .unwrap_err();
        assert!(matches!(err, BusError::PolicyDenied { .. }));
    }
}
