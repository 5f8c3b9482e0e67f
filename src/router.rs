//! Message router (§4.10, component C10).
//!
//! [`Router::send`] is the one place every SEND passes through, whichever
//! connection (or the kernel itself, for synthetic messages) originates it:
//! stamp the source, resolve the destination, check policy, materialize the
//! payload into the destination's pool, and wake it. [`Router::send`] never
//! blocks; every failure path returns to the caller rather than buffering or
//! dropping silently, per SPEC_FULL.md §4.10/§7.

use std::sync::Arc;
use std::time::Duration;

use crate::bloom::Bloom;
use crate::bus::Bus;
use crate::connection::Connection;
use crate::error::{BusError, Result};
use crate::name_registry::NameEvent;
use crate::policy::Verb;
use crate::wire::{Header, Message, Record, DST_BROADCAST, DST_RESOLVE_BY_NAME, SRC_KERNEL};

/// Stateless-but-for-the-bus entry point for SEND. One `Router` is created
/// per bus (in practice just a thin wrapper -- all the actual state lives on
/// [`Bus`], [`crate::name_registry::NameRegistry`] and [`Connection`]).
pub struct Router {
    bus: Arc<Bus>,
}

impl Router {
    pub fn new(bus: Arc<Bus>) -> Self {
        Self { bus }
    }

    /// Handles one SEND. `sender` is `None` for kernel-synthesized messages
    /// (name-acquired/lost, peer-gone, timeout notices), which bypass policy
    /// entirely but still go through destination resolution and payload
    /// materialization like any other message.
    pub fn send(&self, sender: Option<&Arc<Connection>>, mut msg: Message) -> Result<()> {
        let src_id = sender.map(|c| c.id()).unwrap_or(SRC_KERNEL);
        msg.header.src_id = src_id;
        let _message_id = self.bus.next_message_id();

        if msg.header.is_reply() {
            if let Some(orphan_err) = self.check_reply_orphan(&msg)? {
                if let Some(sender) = sender {
                    sender.deliver_synthetic(synthetic_reply_orphan(msg.header.cookie_reply));
                }
                return Err(orphan_err);
            }
        }

        if let Some(sender) = sender {
            if msg.header.timeout_ns != 0 && !msg.header.is_reply() {
                sender
                    .pending_replies()
                    .register(msg.header.cookie, Duration::from_nanos(msg.header.timeout_ns));
            }
        }

        if msg.header.is_broadcast() {
            return self.send_broadcast(sender, msg);
        }

        let dest = self.resolve_destination(sender, &msg)?;
        self.check_talk_to(sender, &dest)?;
        self.materialize_and_deliver(sender, &dest, msg)
    }

    /// Per §4.10(c): a reply (`cookie_reply != 0`) is orphaned when the
    /// *destination* (the original caller) has no matching pending-reply
    /// registration. Returns `Ok(Some(err))` rather than delivering.
    fn check_reply_orphan(&self, msg: &Message) -> Result<Option<BusError>> {
        let dest = match self.try_resolve_destination_id(msg) {
            Some(id) => id,
            None => return Ok(Some(BusError::ReplyOrphan(msg.header.cookie_reply))),
        };
        let Some(dest_conn) = self.bus.connection(dest) else {
            return Ok(Some(BusError::ReplyOrphan(msg.header.cookie_reply)));
        };
        if dest_conn.pending_replies().resolve(msg.header.cookie_reply) {
            Ok(None)
        } else {
            Ok(Some(BusError::ReplyOrphan(msg.header.cookie_reply)))
        }
    }

    fn try_resolve_destination_id(&self, msg: &Message) -> Option<u64> {
        match msg.header.dst_id {
            DST_RESOLVE_BY_NAME => {
                let name = msg.name_record()?;
                self.bus.name_registry().lookup(name).or_else(|| {
                    self.bus
                        .name_registry()
                        .list_matching_wildcard(strip_last_label(name))
                        .first()
                        .and_then(|n| self.bus.name_registry().lookup(n))
                })
            }
            DST_BROADCAST => None,
            id => Some(id),
        }
    }

    fn resolve_destination(&self, sender: Option<&Arc<Connection>>, msg: &Message) -> Result<Arc<Connection>> {
        match msg.header.dst_id {
            DST_RESOLVE_BY_NAME => {
                let name = msg
                    .name_record()
                    .ok_or_else(|| BusError::MalformedHeader("dst_id 0 requires a Name record".into()))?;
                crate::name_registry::NameRegistry::check_name_valid(name)?;

                if let Some(endpoint) = sender.map(|c| c.endpoint()) {
                    let bus_policy = self.bus.policy();
                    if !endpoint.name_visible(&bus_policy, sender.unwrap().credentials().principal(), name) {
                        return Err(BusError::NameNotFound(name.to_string()));
                    }
                }

                let owner = self
                    .bus
                    .name_registry()
                    .lookup(name)
                    .or_else(|| {
                        self.bus
                            .name_registry()
                            .list_matching_wildcard(strip_last_label(name))
                            .first()
                            .and_then(|n| self.bus.name_registry().lookup(n))
                    })
                    .ok_or_else(|| BusError::NameNotFound(name.to_string()))?;

                self.bus.connection(owner).ok_or_else(|| BusError::NameNotFound(name.to_string()))
            }
            id => self.bus.connection(id).ok_or(BusError::NoDest(id)),
        }
    }

    /// TALK_TO is checked against the sender's own endpoint policy (the
    /// endpoint the sender connected through governs what it may reach),
    /// keyed by every well-known name the destination owns plus, if the
    /// original send addressed a name directly, that name itself.
    fn check_talk_to(&self, sender: Option<&Arc<Connection>>, dest: &Arc<Connection>) -> Result<()> {
        let Some(sender) = sender else {
            // Kernel-synthesized messages bypass policy (§7).
            return Ok(());
        };
        let endpoint = sender.endpoint();
        let principal = sender.credentials().principal();
        let bus_policy = self.bus.policy();

        let mut objects = dest.owned_names();
        if objects.is_empty() {
            // No well-known name owned: policy is still evaluated against
            // the bare numeric id, stringified, so a rule set that names
            // unique ids explicitly still applies.
            objects.push(dest.id().to_string());
        }

        for object in &objects {
            endpoint.policy().check(&bus_policy, principal, Verb::TalkTo, object)?;
        }
        Ok(())
    }

    fn materialize_and_deliver(&self, sender: Option<&Arc<Connection>>, dest: &Arc<Connection>, mut msg: Message) -> Result<()> {
        for record in &mut msg.records {
            match record {
                Record::MemFd(r) => {
                    if let Some(sender) = sender {
                        if let Some(object) = sender.lookup_object(r.object_id) {
                            dest.attach_object(object);
                        }
                    }
                }
                Record::Fd(index) => {
                    if let Some(sender) = sender {
                        let fd = sender.dup_fd_at(*index)?;
                        *index = dest.attach_fd(fd)?;
                    }
                }
                _ => {}
            }
        }

        dest.deliver(msg)
    }

    /// The per-recipient broadcast policy check (§4.10d): TALK_TO against
    /// every name the candidate owns (or its bare id if it owns none),
    /// exactly `check_talk_to`'s unicast rule, plus a SEE filter on custom
    /// endpoints so a broadcast can't hand a sender a recipient's identity
    /// through an endpoint that would have hidden it from a targeted send.
    fn broadcast_admits(&self, sender: Option<&Arc<Connection>>, dest: &Arc<Connection>) -> bool {
        if self.check_talk_to(sender, dest).is_err() {
            return false;
        }
        let Some(sender) = sender else {
            return true;
        };
        let endpoint = sender.endpoint();
        let bus_policy = self.bus.policy();
        let principal = sender.credentials().principal();

        let mut objects = dest.owned_names();
        if objects.is_empty() {
            objects.push(dest.id().to_string());
        }
        objects.iter().all(|object| endpoint.name_visible(&bus_policy, principal, object))
    }

    fn send_broadcast(&self, sender: Option<&Arc<Connection>>, msg: Message) -> Result<()> {
        let filter = msg
            .records
            .iter()
            .find_map(|r| match r {
                Record::Bloom { bits, .. } => Bloom::from_le_bytes(bits).ok(),
                _ => None,
            })
            .unwrap_or_default();

        for (id, result) in self.bus.broadcast(&msg, &filter, |dest| self.broadcast_admits(sender, dest)) {
            if let Err(err) = result {
                if let Some(sender) = sender {
                    tracing::debug!(
                        sender = sender.id(),
                        recipient = id,
                        error = %err,
                        "broadcast recipient could not accept delivery"
                    );
                }
            }
        }
        Ok(())
    }

    /// Tears down a connection and publishes the resulting name-ownership
    /// notifications, the way an application-visible disconnect (socket
    /// close, explicit close request) should always go through the router
    /// rather than calling [`Bus::terminate_connection`] directly.
    pub fn terminate_connection(&self, id: u64) {
        let events = self.bus.terminate_connection(id);
        self.publish_name_events(events);
    }

    /// Turns [`NameEvent`]s from a name-registry mutation into synthetic
    /// kernel-sourced notifications: the connection that lost the name (if
    /// still connected) gets a name-lost message, the connection that
    /// gained it (if any) gets a name-acquired message. Used by
    /// [`crate::control`]'s REQUEST_NAME/RELEASE_NAME handling and by
    /// [`Bus::terminate_connection`]'s disconnect cleanup.
    pub fn publish_name_events(&self, events: Vec<NameEvent>) {
        for NameEvent::OwnerChanged { name, old, new } in events {
            if let Some(old_id) = old {
                if let Some(conn) = self.bus.connection(old_id) {
                    conn.deliver_synthetic(name_event_message(&name, false));
                }
            }
            if let Some(new_id) = new {
                if let Some(conn) = self.bus.connection(new_id) {
                    conn.deliver_synthetic(name_event_message(&name, true));
                }
            }
        }
    }

    /// Sweeps every connection on the bus for expired reply deadlines and
    /// emits a synthetic timeout message to each sender that missed one.
    /// Intended to be driven by a periodic background task (see
    /// [`crate::subsystem::Subsystem`]).
    pub fn sweep_timeouts(&self) {
        for id in self.bus.connection_ids() {
            let Some(conn) = self.bus.connection(id) else {
                continue;
            };
            for cookie in conn.pending_replies().sweep_expired() {
                conn.deliver_synthetic(synthetic_timeout(cookie));
            }
        }
    }
}

fn strip_last_label(name: &str) -> &str {
    match name.rfind('.') {
        Some(idx) => &name[..idx],
        None => name,
    }
}

fn synthetic_reply_orphan(cookie: u64) -> Message {
    Message {
        header: Header {
            src_id: SRC_KERNEL,
            cookie_reply: cookie,
            ..Default::default()
        },
        records: vec![Record::Inline(b"REPLY_ORPHAN".to_vec())],
    }
}

fn name_event_message(name: &str, acquired: bool) -> Message {
    Message {
        header: Header {
            src_id: SRC_KERNEL,
            ..Default::default()
        },
        records: vec![
            Record::Inline(if acquired { b"NAME_ACQUIRED".to_vec() } else { b"NAME_LOST".to_vec() }),
            Record::Name(name.to_string()),
        ],
    }
}

fn synthetic_timeout(cookie: u64) -> Message {
    Message {
        header: Header {
            src_id: SRC_KERNEL,
            cookie_reply: cookie,
            ..Default::default()
        },
        records: vec![Record::Inline(b"TIMEOUT".to_vec())],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Credentials;
    use crate::domain::Domain;
    use crate::policy::{Decision, Object, Policy, Rule, Subject};
    use crate::wire::PAYLOAD_TYPE_DBUS;

    fn setup() -> (Arc<Bus>, Router) {
        let bus = Domain::root().make_bus("test", 0, 0o666, 0, 0).unwrap();
        let router = Router::new(bus.clone());
        (bus, router)
    }

    fn hello(bus: &Arc<Bus>) -> Arc<Connection> {
        let ep = bus.default_endpoint();
        let conn = bus.open_connection(&ep, 4096, Credentials::default());
        bus.hello(&conn).unwrap();
        conn
    }

    /// Grants `World` TALK_TO on every object named, on top of whatever
    /// policy the bus already carries -- tests build the narrow allow-list
    /// they need rather than relying on an implicit default-allow, since
    /// the engine's default is deny (§4.5).
    fn allow_talk_to(bus: &Arc<Bus>, objects: &[String]) {
        let mut policy = bus.policy();
        for object in objects {
            policy.push(Rule::new(
                Subject::World,
                Verb::TalkTo,
                Object::Name(object.clone()),
                Decision::Allow,
            ));
        }
        bus.set_policy(policy);
    }

    fn inline_msg(dst: u64, bytes: &[u8]) -> Message {
        Message {
            header: Header {
                dst_id: dst,
                payload_type: PAYLOAD_TYPE_DBUS,
                ..Default::default()
            },
            records: vec![Record::Inline(bytes.to_vec())],
        }
    }

    #[test]
    fn unicast_by_id_delivers_and_stamps_source() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        allow_talk_to(&bus, &[b.id().to_string()]);

        router.send(Some(&a), inline_msg(b.id(), b"hi")).unwrap();

        let received = b.try_recv().unwrap();
        assert_eq!(received.header.src_id, a.id());
        match &received.records[0] {
            Record::Inline(bytes) => assert_eq!(bytes, b"hi"),
            _ => panic!("wrong record"),
        }
    }

    #[test]
    fn send_to_missing_id_fails_no_dest() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let err = router.send(Some(&a), inline_msg(999, b"hi")).unwrap_err();
        assert!(matches!(err, BusError::NoDest(999)));
    }

    #[test]
    fn send_without_policy_grant_is_denied() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        let err = router.send(Some(&a), inline_msg(b.id(), b"hi")).unwrap_err();
        assert!(matches!(err, BusError::PolicyDenied { .. }));
    }

    #[test]
    fn send_by_name_resolves_current_owner() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        bus.name_registry().request_name("org.example.Foo", b.id(), Default::default());
        allow_talk_to(&bus, &["org.example.Foo".to_string()]);

        let mut msg = inline_msg(0, b"hi");
        msg.records.push(Record::Name("org.example.Foo".into()));
        router.send(Some(&a), msg).unwrap();

        let received = b.try_recv().unwrap();
        assert_eq!(received.header.src_id, a.id());
    }

    #[test]
    fn send_by_unknown_name_fails_name_not_found() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let mut msg = inline_msg(0, b"hi");
        msg.records.push(Record::Name("org.example.Missing".into()));
        let err = router.send(Some(&a), msg).unwrap_err();
        assert!(matches!(err, BusError::NameNotFound(_)));
    }

    #[test]
    fn broadcast_reaches_only_subscribed_connections() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        let c = hello(&bus);

        let mut bloom = Bloom::new();
        bloom.set_bit(3);
        b.install_mask(1, bloom.clone()).unwrap();

        let mut c_bloom = Bloom::new();
        c_bloom.set_bit(5);
        c.install_mask(1, c_bloom).unwrap();

        allow_talk_to(&bus, &[b.id().to_string(), c.id().to_string()]);

        let msg = Message {
            header: Header {
                dst_id: DST_BROADCAST,
                ..Default::default()
            },
            records: vec![Record::Bloom {
                generation: 1,
                bits: bloom.to_le_bytes(),
            }],
        };

        router.send(Some(&a), msg).unwrap();

        assert!(b.try_recv().is_some());
        assert!(c.try_recv().is_none());
    }

    #[test]
    fn broadcast_skips_recipients_denied_talk_to() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);

        let mut bloom = Bloom::new();
        bloom.set_bit(3);
        b.install_mask(1, bloom.clone()).unwrap();
        // No allow_talk_to grant for b: default-deny means the mask match
        // alone must not be enough to deliver.

        let msg = Message {
            header: Header {
                dst_id: DST_BROADCAST,
                ..Default::default()
            },
            records: vec![Record::Bloom {
                generation: 1,
                bits: bloom.to_le_bytes(),
            }],
        };
        router.send(Some(&a), msg).unwrap();

        assert!(b.try_recv().is_none());
    }

    #[test]
    fn reply_without_pending_caller_is_orphaned() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        allow_talk_to(&bus, &[a.id().to_string()]);

        let mut msg = inline_msg(a.id(), b"reply");
        msg.header.cookie_reply = 42;
        let err = router.send(Some(&b), msg).unwrap_err();
        assert!(matches!(err, BusError::ReplyOrphan(42)));
    }

    #[test]
    fn reply_matching_pending_caller_is_delivered() {
        let (bus, router) = setup();
        let a = hello(&bus);
        let b = hello(&bus);
        allow_talk_to(&bus, &[a.id().to_string(), b.id().to_string()]);

        let mut call = inline_msg(b.id(), b"call");
        call.header.cookie = 7;
        call.header.timeout_ns = 1_000_000_000;
        router.send(Some(&a), call).unwrap();
        b.try_recv();

        let mut reply = inline_msg(a.id(), b"reply");
        reply.header.cookie_reply = 7;
        router.send(Some(&b), reply).unwrap();

        assert!(a.try_recv().is_some());
    }
}
