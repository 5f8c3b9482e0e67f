//! The kernel-side control surface (component C11), addressed the way
//! kdbus addresses its kernel-handled requests: `dst_id == 0` (no peer
//! resolution) plus `payload_type == PAYLOAD_TYPE_CONTROL`. Everything a
//! connection can ask the bus itself to do -- say hello, own a name,
//! install a subscription mask, become a monitor -- goes through here
//! instead of the router's normal destination-resolution path.
//!
//! This plays the role the teacher's `fdo::DBus` struct (the
//! `org.freedesktop.DBus` interface implementation) played there: one type
//! that owns the bus-wide side effects of each request and hands back a
//! reply. The dispatch mechanism is different (our own tagged byte
//! encoding inside one `Record::Inline`, not a D-Bus method call), because
//! §6's wire format is our own, but the shape -- validate state, mutate
//! shared bus state under its locks, build a reply -- is the same.

use std::sync::Arc;

use enumflags2::BitFlags;
use parking_lot::Mutex;

use crate::bloom::Bloom;
use crate::bus::Bus;
use crate::connection::Connection;
use crate::domain::Domain;
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::memfd::MemoryObject;
use crate::name_registry::{NameFlags, ReleaseNameReply, RequestNameReply};
use crate::policy::Policy;
use crate::router::Router;
use crate::wire::Record;

#[derive(Clone, Debug, PartialEq)]
pub enum ControlRequest {
    Hello,
    RequestName { name: String, flags: BitFlags<NameFlags> },
    ReleaseName { name: String },
    ListNames,
    ListQueuedOwners { name: String },
    GetNameOwner { name: String },
    InstallMask { generation: u32, bloom: Bloom },
    BecomeMonitor,
    MakeBus { name: String, flags: u64, mode: u32, uid: u32, gid: u32 },
    MakeDomain { name: String },
    MemfdNew { len: u64 },
    MemfdSeal { object_id: u64 },
    MemfdUnseal { object_id: u64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum ControlReply {
    Hello { assigned_id: u64 },
    RequestName(RequestNameReply),
    ReleaseName(ReleaseNameReply),
    Names(Vec<String>),
    QueuedOwners(Vec<u64>),
    NameOwner(Option<u64>),
    MaskInstalled,
    BecameMonitor,
    BusMade { bus_id: u64 },
    DomainMade,
    /// `fd_index` indexes into this connection's received-fd table (the
    /// same index space [`Record::Fd`] uses) -- [`crate::session`]'s
    /// `handle_control` rides it out as a `Record::Fd` alongside this
    /// reply's `Record::Inline` so the client actually receives the memfd,
    /// not just its id.
    MemfdNew { object_id: u64, fd_index: u32 },
    MemfdSealed,
    MemfdUnsealed,
}

// Opcodes for the one-byte tag prefixing the encoded body. Stable once
// shipped, same as the record kind tags in `wire.rs`.
const OP_HELLO: u8 = 1;
const OP_REQUEST_NAME: u8 = 2;
const OP_RELEASE_NAME: u8 = 3;
const OP_LIST_NAMES: u8 = 4;
const OP_LIST_QUEUED_OWNERS: u8 = 5;
const OP_GET_NAME_OWNER: u8 = 6;
const OP_INSTALL_MASK: u8 = 7;
const OP_BECOME_MONITOR: u8 = 8;
const OP_MAKE_BUS: u8 = 9;
const OP_MAKE_DOMAIN: u8 = 10;
const OP_MEMFD_NEW: u8 = 11;
const OP_MEMFD_SEAL: u8 = 12;
const OP_MEMFD_UNSEAL: u8 = 13;

fn put_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn take_string(buf: &[u8], offset: &mut usize) -> Result<String> {
    if buf.len() < *offset + 4 {
        return Err(BusError::MalformedHeader("control: truncated string length".into()));
    }
    let len = u32::from_le_bytes(buf[*offset..*offset + 4].try_into().unwrap()) as usize;
    *offset += 4;
    if buf.len() < *offset + len {
        return Err(BusError::MalformedHeader("control: truncated string body".into()));
    }
    let s = String::from_utf8(buf[*offset..*offset + len].to_vec())
        .map_err(|e| BusError::MalformedHeader(format!("control: string not utf8: {e}")))?;
    *offset += len;
    Ok(s)
}

impl ControlRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ControlRequest::Hello => buf.push(OP_HELLO),
            ControlRequest::RequestName { name, flags } => {
                buf.push(OP_REQUEST_NAME);
                buf.push(flags.bits());
                put_string(&mut buf, name);
            }
            ControlRequest::ReleaseName { name } => {
                buf.push(OP_RELEASE_NAME);
                put_string(&mut buf, name);
            }
            ControlRequest::ListNames => buf.push(OP_LIST_NAMES),
            ControlRequest::ListQueuedOwners { name } => {
                buf.push(OP_LIST_QUEUED_OWNERS);
                put_string(&mut buf, name);
            }
            ControlRequest::GetNameOwner { name } => {
                buf.push(OP_GET_NAME_OWNER);
                put_string(&mut buf, name);
            }
            ControlRequest::InstallMask { generation, bloom } => {
                buf.push(OP_INSTALL_MASK);
                buf.extend_from_slice(&generation.to_le_bytes());
                buf.extend_from_slice(&bloom.to_le_bytes());
            }
            ControlRequest::BecomeMonitor => buf.push(OP_BECOME_MONITOR),
            ControlRequest::MakeBus { name, flags, mode, uid, gid } => {
                buf.push(OP_MAKE_BUS);
                buf.extend_from_slice(&flags.to_le_bytes());
                buf.extend_from_slice(&mode.to_le_bytes());
                buf.extend_from_slice(&uid.to_le_bytes());
                buf.extend_from_slice(&gid.to_le_bytes());
                put_string(&mut buf, name);
            }
            ControlRequest::MakeDomain { name } => {
                buf.push(OP_MAKE_DOMAIN);
                put_string(&mut buf, name);
            }
            ControlRequest::MemfdNew { len } => {
                buf.push(OP_MEMFD_NEW);
                buf.extend_from_slice(&len.to_le_bytes());
            }
            ControlRequest::MemfdSeal { object_id } => {
                buf.push(OP_MEMFD_SEAL);
                buf.extend_from_slice(&object_id.to_le_bytes());
            }
            ControlRequest::MemfdUnseal { object_id } => {
                buf.push(OP_MEMFD_UNSEAL);
                buf.extend_from_slice(&object_id.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let &[op, ref rest @ ..] = buf else {
            return Err(BusError::MalformedHeader("empty control request".into()));
        };
        let mut offset = 0usize;
        Ok(match op {
            OP_HELLO => ControlRequest::Hello,
            OP_REQUEST_NAME => {
                let &[flag_bits, ref rest @ ..] = rest else {
                    return Err(BusError::MalformedHeader("control: missing flags".into()));
                };
                let flags = BitFlags::<NameFlags>::from_bits(flag_bits)
                    .map_err(|_| BusError::MalformedHeader("control: bad name flags".into()))?;
                let name = take_string(rest, &mut offset)?;
                ControlRequest::RequestName { name, flags }
            }
            OP_RELEASE_NAME => ControlRequest::ReleaseName {
                name: take_string(rest, &mut offset)?,
            },
            OP_LIST_NAMES => ControlRequest::ListNames,
            OP_LIST_QUEUED_OWNERS => ControlRequest::ListQueuedOwners {
                name: take_string(rest, &mut offset)?,
            },
            OP_GET_NAME_OWNER => ControlRequest::GetNameOwner {
                name: take_string(rest, &mut offset)?,
            },
            OP_INSTALL_MASK => {
                if rest.len() < 4 {
                    return Err(BusError::MalformedHeader("control: truncated generation".into()));
                }
                let generation = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let bloom = Bloom::from_le_bytes(&rest[4..])?;
                ControlRequest::InstallMask { generation, bloom }
            }
            OP_BECOME_MONITOR => ControlRequest::BecomeMonitor,
            OP_MAKE_BUS => {
                if rest.len() < 16 {
                    return Err(BusError::MalformedHeader("control: truncated MAKE_BUS header".into()));
                }
                let flags = u64::from_le_bytes(rest[0..8].try_into().unwrap());
                let mode = u32::from_le_bytes(rest[8..12].try_into().unwrap());
                let uid = u32::from_le_bytes(rest[12..16].try_into().unwrap());
                offset = 16;
                if rest.len() < offset + 4 {
                    return Err(BusError::MalformedHeader("control: truncated MAKE_BUS gid".into()));
                }
                let gid = u32::from_le_bytes(rest[offset..offset + 4].try_into().unwrap());
                offset += 4;
                let name = take_string(rest, &mut offset)?;
                ControlRequest::MakeBus { name, flags, mode, uid, gid }
            }
            OP_MAKE_DOMAIN => ControlRequest::MakeDomain {
                name: take_string(rest, &mut offset)?,
            },
            OP_MEMFD_NEW => {
                if rest.len() < 8 {
                    return Err(BusError::MalformedHeader("control: truncated MEMFD_NEW length".into()));
                }
                ControlRequest::MemfdNew {
                    len: u64::from_le_bytes(rest[0..8].try_into().unwrap()),
                }
            }
            OP_MEMFD_SEAL => {
                if rest.len() < 8 {
                    return Err(BusError::MalformedHeader("control: truncated MEMFD_SEAL object id".into()));
                }
                ControlRequest::MemfdSeal {
                    object_id: u64::from_le_bytes(rest[0..8].try_into().unwrap()),
                }
            }
            OP_MEMFD_UNSEAL => {
                if rest.len() < 8 {
                    return Err(BusError::MalformedHeader("control: truncated MEMFD_UNSEAL object id".into()));
                }
                ControlRequest::MemfdUnseal {
                    object_id: u64::from_le_bytes(rest[0..8].try_into().unwrap()),
                }
            }
            other => return Err(BusError::MalformedHeader(format!("control: unknown opcode {other}"))),
        })
    }
}

impl ControlReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            ControlReply::Hello { assigned_id } => {
                buf.push(OP_HELLO);
                buf.extend_from_slice(&assigned_id.to_le_bytes());
            }
            ControlReply::RequestName(r) => {
                buf.push(OP_REQUEST_NAME);
                buf.push(*r as u8);
            }
            ControlReply::ReleaseName(r) => {
                buf.push(OP_RELEASE_NAME);
                buf.push(*r as u8);
            }
            ControlReply::Names(names) => {
                buf.push(OP_LIST_NAMES);
                buf.extend_from_slice(&(names.len() as u32).to_le_bytes());
                for name in names {
                    put_string(&mut buf, name);
                }
            }
            ControlReply::QueuedOwners(ids) => {
                buf.push(OP_LIST_QUEUED_OWNERS);
                buf.extend_from_slice(&(ids.len() as u32).to_le_bytes());
                for id in ids {
                    buf.extend_from_slice(&id.to_le_bytes());
                }
            }
            ControlReply::NameOwner(owner) => {
                buf.push(OP_GET_NAME_OWNER);
                buf.extend_from_slice(&owner.unwrap_or(0).to_le_bytes());
                buf.push(owner.is_some() as u8);
            }
            ControlReply::MaskInstalled => buf.push(OP_INSTALL_MASK),
            ControlReply::BecameMonitor => buf.push(OP_BECOME_MONITOR),
            ControlReply::BusMade { bus_id } => {
                buf.push(OP_MAKE_BUS);
                buf.extend_from_slice(&bus_id.to_le_bytes());
            }
            ControlReply::DomainMade => buf.push(OP_MAKE_DOMAIN),
            ControlReply::MemfdNew { object_id, fd_index } => {
                buf.push(OP_MEMFD_NEW);
                buf.extend_from_slice(&object_id.to_le_bytes());
                buf.extend_from_slice(&fd_index.to_le_bytes());
            }
            ControlReply::MemfdSealed => buf.push(OP_MEMFD_SEAL),
            ControlReply::MemfdUnsealed => buf.push(OP_MEMFD_UNSEAL),
        }
        buf
    }

    /// The out-of-band `Record::Fd` this reply must be delivered alongside,
    /// if any. Only [`ControlReply::MemfdNew`] carries one -- the new
    /// object's fd, already registered in the replying connection's
    /// received-fd table by [`dispatch`], so the ordinary `Record::Fd`
    /// renumber-and-`SCM_RIGHTS` path in [`crate::session::write_frame`]
    /// carries it out to the client unchanged.
    pub fn extra_fd_record(&self) -> Option<Record> {
        match self {
            ControlReply::MemfdNew { fd_index, .. } => Some(Record::Fd(*fd_index)),
            _ => None,
        }
    }
}

/// Dispatches one decoded control request against live bus/connection
/// state and returns the reply to encode back to the caller. `router`
/// drives anything that must turn into a delivered message as a side
/// effect (name-ownership notifications); requests that only read or
/// mutate bus-owned tables go straight through `bus`/`conn`.
///
/// `MAKE_BUS`/`MAKE_DOMAIN` are handled separately, via [`ControlHandle`],
/// since they don't operate on an existing bus connection at all -- they
/// are how one comes to exist in the first place.
pub fn dispatch(router: &Router, bus: &Arc<Bus>, conn: &Arc<Connection>, req: ControlRequest) -> Result<ControlReply> {
    match req {
        ControlRequest::Hello => {
            let assigned_id = bus.hello(conn)?;
            Ok(ControlReply::Hello { assigned_id })
        }
        ControlRequest::RequestName { name, flags } => {
            crate::name_registry::NameRegistry::check_name_valid(&name)?;
            conn.require_state(crate::connection::ConnectionState::Active)?;
            conn.endpoint()
                .policy()
                .check(&bus.policy(), conn.credentials().principal(), crate::policy::Verb::Own, &name)?;
            let (reply, events) = bus.name_registry().request_name(&name, conn.id(), flags);
            if matches!(reply, RequestNameReply::PrimaryOwner) {
                conn.note_owned_name(name);
            }
            router.publish_name_events(events);
            Ok(ControlReply::RequestName(reply))
        }
        ControlRequest::ReleaseName { name } => {
            conn.require_state(crate::connection::ConnectionState::Active)?;
            let (reply, events) = bus.name_registry().release_name(&name, conn.id());
            if matches!(reply, ReleaseNameReply::Released) {
                conn.forget_owned_name(&name);
            }
            router.publish_name_events(events);
            Ok(ControlReply::ReleaseName(reply))
        }
        ControlRequest::ListNames => Ok(ControlReply::Names(bus.name_registry().list())),
        ControlRequest::ListQueuedOwners { name } => {
            Ok(ControlReply::QueuedOwners(bus.name_registry().list_queued_owners(&name)))
        }
        ControlRequest::GetNameOwner { name } => Ok(ControlReply::NameOwner(bus.name_registry().lookup(&name))),
        ControlRequest::InstallMask { generation, bloom } => {
            conn.require_state(crate::connection::ConnectionState::Active)?;
            conn.install_mask(generation, bloom)?;
            Ok(ControlReply::MaskInstalled)
        }
        ControlRequest::BecomeMonitor => {
            conn.become_monitor()?;
            Ok(ControlReply::BecameMonitor)
        }
        ControlRequest::MakeBus { .. } | ControlRequest::MakeDomain { .. } => Err(BusError::MalformedHeader(
            "MAKE_BUS/MAKE_DOMAIN must go through a control handle, not a bus connection".into(),
        )),
        ControlRequest::MemfdNew { len } => {
            conn.require_state(crate::connection::ConnectionState::Active)?;
            let object = MemoryObject::create(len)?;
            let fd = object.dup_fd()?;
            let object_id = object.id();
            conn.attach_object(object);
            let fd_index = conn.attach_fd(fd)?;
            Ok(ControlReply::MemfdNew { object_id, fd_index })
        }
        ControlRequest::MemfdSeal { object_id } => {
            conn.require_state(crate::connection::ConnectionState::Active)?;
            conn.lookup_object(object_id)
                .ok_or_else(|| BusError::MalformedHeader(format!("unknown sealed-memory object id {object_id}")))?
                .seal()?;
            Ok(ControlReply::MemfdSealed)
        }
        ControlRequest::MemfdUnseal { object_id } => {
            conn.require_state(crate::connection::ConnectionState::Active)?;
            conn.lookup_object(object_id)
                .ok_or_else(|| BusError::MalformedHeader(format!("unknown sealed-memory object id {object_id}")))?
                .unseal()?;
            Ok(ControlReply::MemfdUnsealed)
        }
    }
}

/// What a [`ControlHandle`] has created, if anything. A handle is usable
/// to create exactly one thing; every subsequent `make_*` call fails with
/// [`BusError::HandleAlreadyUsed`] once this leaves `Undefined` (§4.11/§9
/// "UNDEFINED -> one of {CONTROL, NS_OWNER, BUS_OWNER, EP}, one-time
/// transition").
enum HandleState {
    Undefined,
    NsOwner(Arc<Domain>),
    BusOwner(Arc<Bus>),
    Endpoint { bus: Arc<Bus>, name: String },
    Closed,
}

impl HandleState {
    fn label(&self) -> &'static str {
        match self {
            HandleState::Undefined => "nothing",
            HandleState::NsOwner(_) => "a sub-domain",
            HandleState::BusOwner(_) => "a bus",
            HandleState::Endpoint { .. } => "an endpoint",
            HandleState::Closed => "nothing (handle is closed)",
        }
    }
}

/// A one-shot handle for bringing a bus, sub-domain, or custom endpoint
/// into existence. Obtained by opening the kernel's control node within a
/// domain; usable to create exactly one child, after which it is inert
/// except for [`ControlHandle::close`], which tears down whatever it
/// created.
pub struct ControlHandle {
    parent: Arc<Domain>,
    state: Mutex<HandleState>,
}

impl ControlHandle {
    pub fn new(parent: Arc<Domain>) -> Self {
        Self {
            parent,
            state: Mutex::new(HandleState::Undefined),
        }
    }

    fn claim(&self) -> Result<()> {
        let state = self.state.lock();
        match &*state {
            HandleState::Undefined => Ok(()),
            other => Err(BusError::HandleAlreadyUsed(other.label())),
        }
    }

    pub fn make_bus(&self, name: impl Into<String>, flags: u64, mode: u32, uid: u32, gid: u32) -> Result<Arc<Bus>> {
        self.claim()?;
        let bus = self.parent.make_bus(name, flags, mode, uid, gid)?;
        *self.state.lock() = HandleState::BusOwner(bus.clone());
        Ok(bus)
    }

    pub fn make_domain(&self, name: impl Into<String>) -> Result<Arc<Domain>> {
        self.claim()?;
        let domain = self.parent.make_domain(name)?;
        *self.state.lock() = HandleState::NsOwner(domain.clone());
        Ok(domain)
    }

    /// Creates a custom endpoint on an *already existing* bus within this
    /// handle's domain -- the one `make_*` flavor that doesn't create a new
    /// child of `parent` itself, since endpoints belong to a bus, not a
    /// domain.
    pub fn make_endpoint(&self, bus: &Arc<Bus>, name: impl Into<String>, endpoint_policy: Policy) -> Result<Arc<Endpoint>> {
        self.claim()?;
        let name = name.into();
        let endpoint = bus.make_endpoint(name.clone(), endpoint_policy)?;
        *self.state.lock() = HandleState::Endpoint {
            bus: bus.clone(),
            name,
        };
        Ok(endpoint)
    }

    /// `EP_POLICY_SET` (§6): replaces the policy overlay of the custom
    /// endpoint this handle created. Mirrors kdbus's own
    /// `KDBUS_CMD_ENDPOINT_UPDATE`: the fd that made the endpoint
    /// (`KDBUS_CMD_ENDPOINT_MAKE`) is the same one later used to update its
    /// policy, so this does not consume the handle the way `make_*` does --
    /// a handle in `Endpoint` state may call this any number of times until
    /// [`ControlHandle::close`] tears the endpoint down.
    pub fn set_endpoint_policy(&self, endpoint_policy: Policy) -> Result<()> {
        match &*self.state.lock() {
            HandleState::Endpoint { bus, name } => {
                let endpoint = bus
                    .endpoint(name)
                    .ok_or_else(|| BusError::MalformedHeader(format!("endpoint `{name}` no longer exists")))?;
                endpoint.set_policy(endpoint_policy);
                Ok(())
            }
            other => Err(BusError::HandleNotEndpoint(other.label())),
        }
    }

    /// Destroys whatever this handle created, if anything, and marks the
    /// handle closed. Idempotent: closing an already-closed or never-used
    /// handle is a no-op rather than an error, matching "close" semantics
    /// elsewhere in this crate (`Bus::disconnect`, `Domain::disconnect`).
    pub fn close(&self) {
        let mut state = self.state.lock();
        match &*state {
            HandleState::Undefined | HandleState::Closed => {}
            HandleState::NsOwner(domain) => domain.disconnect(),
            HandleState::BusOwner(bus) => bus.disconnect(),
            HandleState::Endpoint { bus, name } => bus.destroy_endpoint(name),
        }
        *state = HandleState::Closed;
    }
}
