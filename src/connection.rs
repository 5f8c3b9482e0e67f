//! Connection (§3 "Connection", §4.6, component C6).
//!
//! A `Connection` is one client's handle onto an endpoint: its receive
//! pool, its subscription mask, its mailbox, and the credentials the kernel
//! captured at connect time. Mailbox delivery never blocks the deliverer --
//! [`Connection::deliver`] copies into the pool and returns; only the
//! receiving side's [`Connection::recv`] suspends, and it does so on an
//! [`event_listener::Event`] rather than a `tokio::sync` primitive, the one
//! genuine async suspension point called out in the design (everything else
//! here is a `parking_lot` critical section, matching how this codebase
//! guards `name_registry`/`peers` state).

use std::collections::{HashMap, VecDeque};
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use event_listener::Event;
use parking_lot::Mutex;

use crate::bloom::{Bloom, Mask};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::memfd::MemoryObject;
use crate::policy::Principal;
use crate::pool::Pool;
use crate::wire::Message;

/// Received-fd table entries a single connection may hold at once, across
/// every message still sitting in its mailbox. 253 is `SCM_MAX_FD`, the
/// kernel's own per-`sendmsg` fd-passing ceiling; reusing it here bounds how
/// many kernel fds a peer that stops calling RECV can pin on our behalf.
const MAX_RECEIVED_FDS: usize = 253;

/// A connection's lifecycle. `Unconnected` is pre-HELLO: the only frame
/// accepted is HELLO itself. `Active` is the steady state after HELLO
/// assigns a unique id. `Monitoring` is `Active` plus "receives everything
/// regardless of mask, sends nothing" (the monitor role from §4.6).
/// `Disconnected` is terminal; once reached, the connection's id is never
/// reused and all further operations fail with [`BusError::Disconnected`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Unconnected,
    Active,
    Monitoring,
    Disconnected,
}

/// Best-effort process credentials captured at connect time (SPEC_FULL.md
/// §3.1). Every field beyond `uid` is `None`/empty when the platform or
/// process doesn't make it available -- callers must not treat absence as
/// "zero" or "anonymous".
#[derive(Clone, Debug, Default)]
pub struct Credentials {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub gids: Vec<u32>,
    pub pid: Option<u32>,
    pub cgroup_path: Option<String>,
    pub executable_path: Option<String>,
    pub command_line: Option<Vec<String>>,
    pub connected_at_unix_ns: Option<u64>,
    pub audit_session_id: Option<u64>,
    pub security_label: Option<Vec<u8>>,
    /// Raw capability bitset (as in `capget(2)`'s effective set), not
    /// decoded into named capabilities -- policy only ever needs "does this
    /// connection have CAP_FOO", not an enumeration.
    pub capabilities: Option<u64>,
}

impl Credentials {
    pub fn principal(&self) -> Principal<'_> {
        Principal {
            uid: self.uid,
            gids: &self.gids,
        }
    }
}

/// Cookies this connection is waiting on a reply for, each with the
/// deadline it was registered with. Consulted by [`crate::router::Router`]
/// to tell a genuine reply from a [`BusError::ReplyOrphan`], and swept
/// periodically to turn an expired entry into a synthetic timeout message.
#[derive(Default)]
pub struct PendingReplies(Mutex<HashMap<u64, Instant>>);

impl PendingReplies {
    pub fn register(&self, cookie: u64, timeout: Duration) {
        self.0.lock().insert(cookie, Instant::now() + timeout);
    }

    /// Consumes the pending entry for `cookie` if one exists and hasn't
    /// already expired. Returns whether a match was found.
    pub fn resolve(&self, cookie: u64) -> bool {
        let mut pending = self.0.lock();
        match pending.remove(&cookie) {
            Some(deadline) => Instant::now() <= deadline,
            None => false,
        }
    }

    /// Removes and returns every cookie whose deadline has passed.
    pub fn sweep_expired(&self) -> Vec<u64> {
        let mut pending = self.0.lock();
        let now = Instant::now();
        let expired: Vec<u64> = pending
            .iter()
            .filter(|(_, &deadline)| now > deadline)
            .map(|(&cookie, _)| cookie)
            .collect();
        for cookie in &expired {
            pending.remove(cookie);
        }
        expired
    }
}

struct Mailbox {
    queue: VecDeque<(u64, Message)>,
    ready: Event,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            ready: Event::new(),
        }
    }
}

/// One connection to an endpoint.
pub struct Connection {
    /// `0` until [`Connection::activate`] assigns the bus-allocated id at
    /// HELLO time; never consulted while `state()` is `Unconnected`.
    id: Mutex<u64>,
    endpoint: Arc<Endpoint>,
    state: Mutex<ConnectionState>,
    pool: Mutex<Pool>,
    mask: Mutex<Mask>,
    mailbox: Mutex<Mailbox>,
    credentials: Credentials,
    owned_names: Mutex<Vec<String>>,
    /// Sealed memory objects this connection has either created or had
    /// attached to it by an incoming MEMFD record, keyed by object id.
    attached_objects: Mutex<HashMap<u64, MemoryObject>>,
    /// File descriptors received via FD records, indexed by position --
    /// the index a record's `Fd` variant refers to is local to each
    /// connection, not global.
    received_fds: Mutex<Vec<OwnedFd>>,
    /// Set when a synthetic message could not be delivered because the
    /// pool was full (§4.6: synthetic messages obey pool capacity like any
    /// other). Sticky until the application notices it via
    /// [`Connection::take_overflow`].
    lossy: Mutex<bool>,
    /// Outstanding SEND cookies this connection expects a reply to.
    pending_replies: PendingReplies,
}

impl Connection {
    /// Constructs a connection in the pre-HELLO state. `id` is assigned
    /// later, by [`Connection::activate`], once the owning bus allocates
    /// one -- mirroring `crate::bus::Bus::hello`'s role as the only source
    /// of connection ids.
    pub fn new_unconnected(endpoint: Arc<Endpoint>, pool_capacity: u64, credentials: Credentials) -> Self {
        Self {
            id: Mutex::new(0),
            endpoint,
            state: Mutex::new(ConnectionState::Unconnected),
            pool: Mutex::new(Pool::new(pool_capacity)),
            mask: Mutex::new(Mask::default()),
            mailbox: Mutex::new(Mailbox::new()),
            credentials,
            owned_names: Mutex::new(Vec::new()),
            attached_objects: Mutex::new(HashMap::new()),
            received_fds: Mutex::new(Vec::new()),
            lossy: Mutex::new(false),
            pending_replies: PendingReplies::default(),
        }
    }

    pub fn pending_replies(&self) -> &PendingReplies {
        &self.pending_replies
    }

    #[cfg(test)]
    pub fn new(id: u64, pool_capacity: u64, credentials: Credentials) -> Self {
        let endpoint = Arc::new(Endpoint::default_for_bus());
        let conn = Self::new_unconnected(endpoint, pool_capacity, credentials);
        *conn.id.get_mut() = id;
        conn
    }

    pub fn endpoint(&self) -> Arc<Endpoint> {
        self.endpoint.clone()
    }

    /// Registers a sealed-memory-object handle as reachable from this
    /// connection, whether because it created the object itself or because
    /// the router attached it from an incoming MEMFD record. Cloning the
    /// `MemoryObject` bumps its reference count, which is what makes
    /// [`MemoryObject::unseal`]'s "sole owner" check meaningful across
    /// connections.
    pub fn attach_object(&self, object: MemoryObject) {
        self.attached_objects.lock().insert(object.id(), object);
    }

    pub fn lookup_object(&self, object_id: u64) -> Option<MemoryObject> {
        self.attached_objects.lock().get(&object_id).cloned()
    }

    pub fn forget_object(&self, object_id: u64) {
        self.attached_objects.lock().remove(&object_id);
    }

    /// Stores `fd` at the next free slot and returns its index, for
    /// rewriting a `Record::Fd` before delivery.
    ///
    /// Capped at [`MAX_RECEIVED_FDS`] per connection: a receiver that never
    /// calls `recv` (so never drops a delivered `Fd` record's table entry)
    /// would otherwise let a hostile or stuck peer pin an unbounded number
    /// of kernel fds on its behalf. Rejects with [`BusError::FdTableFull`].
    pub fn attach_fd(&self, fd: OwnedFd) -> Result<u32> {
        let mut fds = self.received_fds.lock();
        if fds.len() >= MAX_RECEIVED_FDS {
            return Err(BusError::FdTableFull);
        }
        fds.push(fd);
        Ok((fds.len() - 1) as u32)
    }

    /// Dup's the fd at `index` so the router can hand the duplicate to
    /// another connection without disturbing this connection's own table.
    pub fn dup_fd_at(&self, index: u32) -> Result<OwnedFd> {
        let fds = self.received_fds.lock();
        let fd = fds
            .get(index as usize)
            .ok_or_else(|| BusError::MalformedHeader(format!("no fd at index {index}")))?;
        Ok(nix::unistd::dup(fd)?)
    }

    pub fn id(&self) -> u64 {
        *self.id.lock()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn require_state(&self, expected: ConnectionState) -> Result<()> {
        let state = self.state();
        if state == expected {
            Ok(())
        } else if state == ConnectionState::Disconnected {
            Err(BusError::Disconnected)
        } else {
            Err(BusError::WrongState(state))
        }
    }

    /// Completes HELLO: assigns the bus-allocated `id` and transitions
    /// `Unconnected` -> `Active`. Called exactly once, from
    /// [`crate::bus::Bus::hello`].
    pub fn activate(&self, id: u64) -> Result<()> {
        let mut state = self.state.lock();
        if *state != ConnectionState::Unconnected {
            return Err(BusError::AlreadyGreeted);
        }
        *self.id.lock() = id;
        *state = ConnectionState::Active;
        Ok(())
    }

    pub fn become_monitor(&self) -> Result<()> {
        let mut state = self.state.lock();
        match *state {
            ConnectionState::Active => {
                *state = ConnectionState::Monitoring;
                Ok(())
            }
            ConnectionState::Disconnected => Err(BusError::Disconnected),
            other => Err(BusError::WrongState(other)),
        }
    }

    pub fn is_monitor(&self) -> bool {
        *self.state.lock() == ConnectionState::Monitoring
    }

    pub fn disconnect(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        // Wake any blocked receiver so it observes the new state instead of
        // waiting for a message that will never come.
        self.mailbox.lock().ready.notify(usize::MAX);
    }

    pub fn install_mask(&self, generation: u32, bloom: Bloom) -> Result<()> {
        self.mask.lock().install(generation, bloom)
    }

    pub fn admits_broadcast(&self, filter: &Bloom) -> bool {
        self.mask.lock().admits(filter)
    }

    pub fn note_owned_name(&self, name: String) {
        self.owned_names.lock().push(name);
    }

    pub fn forget_owned_name(&self, name: &str) {
        self.owned_names.lock().retain(|n| n != name);
    }

    pub fn owned_names(&self) -> Vec<String> {
        self.owned_names.lock().clone()
    }

    /// Copies `msg`'s payload bytes into this connection's pool and enqueues
    /// it for delivery. Never blocks; returns [`BusError::PoolFull`] if the
    /// pool can't accommodate it rather than waiting for space.
    pub fn deliver(&self, msg: Message) -> Result<()> {
        if self.state() == ConnectionState::Disconnected {
            return Err(BusError::Disconnected);
        }

        let len = msg.copy_len() as u64;
        let offset = {
            let mut pool = self.pool.lock();
            let offset = pool.reserve(len)?;
            pool.commit(crate::pool::Region { offset, len })?;
            offset
        };

        let mut mailbox = self.mailbox.lock();
        mailbox.queue.push_back((offset, msg));
        mailbox.ready.notify(1);
        Ok(())
    }

    /// Removes and returns the oldest undelivered message, if any, without
    /// blocking.
    pub fn try_recv(&self) -> Option<Message> {
        let mut mailbox = self.mailbox.lock();
        mailbox.queue.pop_front().map(|(offset, msg)| {
            self.pool.lock().free(offset);
            msg
        })
    }

    /// Waits until a message is available (or the connection is
    /// disconnected) and returns it. This is the one place in the crate
    /// that suspends the calling task; everywhere else is a short
    /// `parking_lot` critical section.
    ///
    /// Distinguishes the two disconnect-flavored failures §5/§7 call out:
    /// calling `recv` on a connection that is *already* disconnected fails
    /// [`BusError::Disconnected`] immediately (nothing was in flight to
    /// cancel); a `recv` that was already suspended when the connection's
    /// handle closed underneath it fails [`BusError::Canceled`] instead --
    /// "closing the file handle backing a connection is the cancellation
    /// primitive" for any RECV blocked on it.
    pub async fn recv(&self) -> Result<Message> {
        if let Some(msg) = self.try_recv() {
            return Ok(msg);
        }
        if self.state() == ConnectionState::Disconnected {
            return Err(BusError::Disconnected);
        }

        loop {
            let listener = self.mailbox.lock().ready.listen();
            // Re-check after registering the listener to avoid the
            // classic missed-wakeup race against a concurrent `deliver`.
            if let Some(msg) = self.try_recv() {
                return Ok(msg);
            }
            if self.state() == ConnectionState::Disconnected {
                return Err(BusError::Canceled);
            }
            listener.await;
            if let Some(msg) = self.try_recv() {
                return Ok(msg);
            }
            if self.state() == ConnectionState::Disconnected {
                return Err(BusError::Canceled);
            }
        }
    }

    pub fn pool_in_use(&self) -> u64 {
        self.pool.lock().in_use()
    }

    /// Raises this connection's overflow indicator (§4.6: a synthetic
    /// message that couldn't be delivered marks the connection lossy rather
    /// than being silently dropped or reported to an unrelated sender).
    pub fn mark_lossy(&self) {
        *self.lossy.lock() = true;
    }

    /// Reads and clears the overflow indicator.
    pub fn take_overflow(&self) -> bool {
        std::mem::take(&mut *self.lossy.lock())
    }

    /// Delivers a synthetic (kernel-sourced) message. Identical to
    /// [`Connection::deliver`] except a pool-full failure marks the
    /// connection lossy instead of propagating to a caller -- there is no
    /// caller to propagate to, since the kernel is the sender.
    pub fn deliver_synthetic(&self, msg: Message) {
        if self.deliver(msg).is_err() {
            self.mark_lossy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Header;

    fn msg(dst: u64) -> Message {
        Message {
            header: Header {
                dst_id: dst,
                ..Default::default()
            },
            records: vec![],
        }
    }

    #[test]
    fn activate_then_double_activate_fails() {
        let conn = Connection::new(1, 4096, Credentials::default());
        conn.activate(1).unwrap();
        let err = conn.activate(1).unwrap_err();
        assert!(matches!(err, BusError::AlreadyGreeted));
    }

    #[test]
    fn deliver_then_try_recv_round_trips() {
        let conn = Connection::new_unconnected(Arc::new(crate::endpoint::Endpoint::default_for_bus()), 4096, Credentials::default());
        conn.activate(1).unwrap();
        conn.deliver(msg(1)).unwrap();
        let received = conn.try_recv().unwrap();
        assert_eq!(received.header.dst_id, 1);
        assert!(conn.try_recv().is_none());
    }

    #[test]
    fn disconnect_is_terminal() {
        let conn = Connection::new_unconnected(Arc::new(crate::endpoint::Endpoint::default_for_bus()), 4096, Credentials::default());
        conn.activate(1).unwrap();
        conn.disconnect();
        let err = conn.deliver(msg(1)).unwrap_err();
        assert!(matches!(err, BusError::Disconnected));
    }

    #[test]
    fn attach_fd_rejects_once_the_received_table_is_full() {
        let conn = Connection::new_unconnected(Arc::new(crate::endpoint::Endpoint::default_for_bus()), 4096, Credentials::default());
        conn.activate(1).unwrap();

        let open_null = || -> OwnedFd { std::fs::File::open("/dev/null").unwrap().into() };
        for _ in 0..MAX_RECEIVED_FDS {
            conn.attach_fd(open_null()).unwrap();
        }
        let err = conn.attach_fd(open_null()).unwrap_err();
        assert!(matches!(err, BusError::FdTableFull));
    }

    #[tokio::test]
    async fn recv_wakes_on_deliver() {
        let conn = std::sync::Arc::new(Connection::new_unconnected(Arc::new(crate::endpoint::Endpoint::default_for_bus()), 4096, Credentials::default()));
        conn.activate(1).unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.recv().await })
        };

        // Give the waiter a chance to register before delivering.
        tokio::task::yield_now().await;
        conn.deliver(msg(9)).unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received.header.dst_id, 9);
    }

    #[tokio::test]
    async fn recv_blocked_when_disconnected_is_canceled_not_disconnected() {
        let conn = std::sync::Arc::new(Connection::new_unconnected(Arc::new(crate::endpoint::Endpoint::default_for_bus()), 4096, Credentials::default()));
        conn.activate(1).unwrap();

        let waiter = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.recv().await })
        };

        tokio::task::yield_now().await;
        conn.disconnect();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, BusError::Canceled));
    }

    #[tokio::test]
    async fn recv_on_already_disconnected_connection_is_disconnected() {
        let conn = Connection::new_unconnected(Arc::new(crate::endpoint::Endpoint::default_for_bus()), 4096, Credentials::default());
        conn.activate(1).unwrap();
        conn.disconnect();

        let err = conn.recv().await.unwrap_err();
        assert!(matches!(err, BusError::Disconnected));
    }
}
