//! Session (the async transport glue between a Unix domain socket and one
//! [`Connection`]).
//!
//! This is the layer SPEC_FULL.md §1 calls "surrounding OS glue": the wire
//! codec (§6 / C13, [`crate::wire`]) is pure and I/O-free, and the router
//! (C10) and control surface (C11) only know about in-process
//! [`Connection`] handles. Something has to read framed bytes plus
//! SCM_RIGHTS ancillary data off an actual socket, turn them into
//! [`Message`]s, and turn queued replies back into bytes going the other
//! way -- that something is this module, the same role the teacher's
//! `bus.rs` accept loop and `peer.rs`/`MessageStream` plumbing played for
//! its D-Bus wire format.

use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::sys::socket::{
    getsockopt, recvmsg, sendmsg, sockopt::PeerCredentials, ControlMessage, ControlMessageOwned, MsgFlags,
};
use std::io::{IoSlice, IoSliceMut};
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::bus::Bus;
use crate::connection::{Connection, ConnectionState, Credentials};
use crate::control::{self, ControlRequest};
use crate::endpoint::Endpoint;
use crate::error::{BusError, Result};
use crate::router::Router;
use crate::wire::{Header, Message, Record, HEADER_SIZE, PAYLOAD_TYPE_CONTROL};

/// Ceiling on how many file descriptors a single `recvmsg` call is allowed
/// to hand us, bounding the ancillary-data buffer. A connection that needs
/// to pass more does so across several SEND records/messages.
const MAX_FDS_PER_RECVMSG: usize = 16;

/// Accepts connections on a Unix domain socket at `path` forever, opening
/// one [`Connection`] per accepted stream through `endpoint` and spawning
/// [`serve`] to drive it. Mirrors the teacher's `Bus::run` accept loop,
/// generalized from one hardcoded D-Bus peer type to this crate's
/// bus/endpoint/connection graph.
pub async fn listen(path: impl AsRef<Path>, bus: Arc<Bus>, endpoint: Arc<Endpoint>, router: Arc<Router>, pool_capacity: u64) -> Result<()> {
    let listener = UnixListener::bind(path)?;
    loop {
        let (stream, _addr) = listener.accept().await?;
        let bus = bus.clone();
        let endpoint = endpoint.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, bus, endpoint, router, pool_capacity).await {
                warn!(error = %e, "connection session ended with an error");
            }
        });
    }
}

/// Drives one accepted socket end to end: captures credentials, opens the
/// connection, then runs the read loop (decoding frames, dispatching
/// control requests, routing SEND) and the write loop (draining the
/// connection's mailbox back onto the wire) concurrently until either side
/// ends.
pub async fn serve(stream: UnixStream, bus: Arc<Bus>, endpoint: Arc<Endpoint>, router: Arc<Router>, pool_capacity: u64) -> Result<()> {
    let credentials = peer_credentials(&stream)?;
    let conn = bus.open_connection(&endpoint, pool_capacity, credentials);
    debug!(endpoint = endpoint.name(), "accepted connection, awaiting HELLO");

    let stream = Arc::new(stream);
    let writer = tokio::spawn(write_loop(stream.clone(), conn.clone()));

    let result = read_loop(&stream, &bus, &router, &conn).await;

    router.terminate_connection(conn.id());
    conn.disconnect();
    writer.abort();

    result
}

/// Reads frames until EOF or a fatal decode error, dispatching each one.
async fn read_loop(stream: &UnixStream, bus: &Arc<Bus>, router: &Arc<Router>, conn: &Arc<Connection>) -> Result<()> {
    loop {
        let Some(bytes) = read_frame(stream, conn).await? else {
            return Ok(());
        };
        let msg = match Message::decode(&bytes) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "dropping malformed frame");
                continue;
            }
        };

        if msg.header.payload_type == PAYLOAD_TYPE_CONTROL {
            handle_control(bus, router, conn, msg);
        } else if let Err(e) = router.send(Some(conn), msg) {
            debug!(connection = conn.id(), error = %e, "SEND rejected");
        }

        if conn.state() == ConnectionState::Disconnected {
            return Ok(());
        }
    }
}

/// Decodes and dispatches one control-tagged message, delivering the
/// encoded reply back to the same connection's own mailbox so it goes out
/// through the ordinary write loop like any other message.
fn handle_control(bus: &Arc<Bus>, router: &Arc<Router>, conn: &Arc<Connection>, msg: Message) {
    let body = msg.records.iter().find_map(|r| match r {
        Record::Inline(b) => Some(b.as_slice()),
        _ => None,
    });
    let Some(body) = body else {
        warn!("control message carried no Inline record");
        return;
    };

    let reply = match ControlRequest::decode(body).and_then(|req| control::dispatch(router, bus, conn, req)) {
        Ok(reply) => reply,
        Err(e) => {
            warn!(error = %e, "control request failed");
            return;
        }
    };

    let mut records = vec![Record::Inline(reply.encode())];
    records.extend(reply.extra_fd_record());

    let out = Message {
        header: Header {
            dst_id: conn.id(),
            payload_type: PAYLOAD_TYPE_CONTROL,
            cookie_reply: msg.header.cookie,
            ..Default::default()
        },
        records,
    };
    conn.deliver_synthetic(out);
}

/// Drains `conn`'s mailbox for as long as it stays connected, writing each
/// message out as a framed, SCM_RIGHTS-bearing socket write.
async fn write_loop(stream: Arc<UnixStream>, conn: Arc<Connection>) {
    loop {
        let msg = match conn.recv().await {
            Ok(msg) => msg,
            Err(_) => return,
        };
        if let Err(e) = write_frame(&stream, &conn, msg).await {
            warn!(connection = conn.id(), error = %e, "failed to write frame, ending session");
            return;
        }
    }
}

/// Reads one full [`Message`] frame (header, then its declared total size)
/// off `stream`, attaching any fds received via SCM_RIGHTS along the way to
/// `conn`'s received-fd table. Returns `Ok(None)` on a clean EOF before any
/// bytes of a new frame arrive.
async fn read_frame(stream: &UnixStream, conn: &Connection) -> Result<Option<Vec<u8>>> {
    let mut buf = vec![0u8; HEADER_SIZE];
    let mut filled = recv_fill(stream, conn, &mut buf, 0).await?;
    if filled == 0 {
        return Ok(None);
    }
    while filled < HEADER_SIZE {
        filled = recv_fill(stream, conn, &mut buf, filled).await?;
        if filled == 0 {
            return Err(BusError::MalformedHeader("connection closed mid-header".into()));
        }
    }

    let header = Header::decode(&buf)?;
    let total = header.size as usize;
    if total < HEADER_SIZE {
        return Err(BusError::MalformedHeader(format!("declared size {total} shorter than header")));
    }
    buf.resize(total, 0);
    while filled < total {
        filled = recv_fill(stream, conn, &mut buf, filled).await?;
        if filled == 0 {
            return Err(BusError::MalformedHeader("connection closed mid-frame".into()));
        }
    }
    Ok(Some(buf))
}

/// Reads at least one more byte into `buf[filled..]`, waiting for
/// readiness first. Returns the new `filled` value; `filled == old filled`
/// signals EOF.
async fn recv_fill(stream: &UnixStream, conn: &Connection, buf: &mut [u8], filled: usize) -> Result<usize> {
    if filled == buf.len() {
        return Ok(filled);
    }
    loop {
        stream.readable().await?;
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_PER_RECVMSG]);
        let raw_fd = stream.as_raw_fd();
        let result = stream.try_io(Interest::READABLE, || {
            let mut iov = [IoSliceMut::new(&mut buf[filled..])];
            recvmsg::<()>(raw_fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty()).map_err(std::io::Error::from)
        });
        match result {
            Ok(received) => {
                for cmsg in received.cmsgs().map_err(std::io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(fds) = cmsg {
                        for fd in fds {
                            conn.attach_fd(unsafe { OwnedFd::from_raw_fd(fd) })?;
                        }
                    }
                }
                return Ok(filled + received.bytes);
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(BusError::Io(e)),
        }
    }
}

/// Encodes `msg` and writes it out, passing along any records' fds as
/// SCM_RIGHTS ancillary data on the first `sendmsg` of the frame. A
/// `Record::Fd` is renumbered from `conn`'s persistent received-fd table
/// index to a position in this one write's fd array -- the array a peer
/// receives alongside one frame, not a standing table, mirrors how
/// kdbus-style fd passing is actually consumed downstream. A `Record::MemFd`
/// carries no index of its own (its identity is the sealed object's id, not
/// a table slot), so its fd simply takes the next free slot in the same
/// array, in record order -- this is what actually gets the zero-copy
/// payload path's fd to a real out-of-process receiver, rather than only
/// ever being reachable by a same-process `conn.lookup_object` call.
async fn write_frame(stream: &UnixStream, conn: &Connection, mut msg: Message) -> Result<()> {
    let mut fds = Vec::new();
    for record in &mut msg.records {
        match record {
            Record::Fd(index) => {
                let fd = conn.dup_fd_at(*index)?;
                *index = fds.len() as u32;
                fds.push(fd);
            }
            Record::MemFd(r) => {
                if let Some(object) = conn.lookup_object(r.object_id) {
                    fds.push(object.dup_fd()?);
                }
            }
            _ => {}
        }
    }
    let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
    let bytes = msg.encode();

    let mut offset = 0;
    let mut first = true;
    while offset < bytes.len() {
        stream.writable().await?;
        let raw_fd = stream.as_raw_fd();
        let cmsgs: Vec<ControlMessage> = if first && !raw_fds.is_empty() {
            vec![ControlMessage::ScmRights(&raw_fds)]
        } else {
            Vec::new()
        };
        let result = stream.try_io(Interest::WRITABLE, || {
            let iov = [IoSlice::new(&bytes[offset..])];
            sendmsg::<()>(raw_fd, &iov, &cmsgs, MsgFlags::empty(), None).map_err(std::io::Error::from)
        });
        match result {
            Ok(written) => {
                offset += written;
                first = false;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(BusError::Io(e)),
        }
    }
    Ok(())
}

/// Captures `SO_PEERCRED`-equivalent credentials at accept time. Only
/// `uid`/`gid`/`pid` are populated -- everything else in [`Credentials`] is
/// best-effort metadata this crate has no portable syscall for, matching
/// SPEC_FULL.md §3.1's "only uid/gid/pid are populated unconditionally".
fn peer_credentials(stream: &UnixStream) -> Result<Credentials> {
    let fd = unsafe { BorrowedFd::borrow_raw(stream.as_raw_fd()) };
    let creds = getsockopt(&fd, PeerCredentials).map_err(std::io::Error::from)?;
    let connected_at_unix_ns = SystemTime::now().duration_since(UNIX_EPOCH).ok().map(|d| d.as_nanos() as u64);

    Ok(Credentials {
        uid: Some(creds.uid()),
        gid: Some(creds.gid()),
        gids: Vec::new(),
        pid: Some(creds.pid() as u32),
        connected_at_unix_ns,
        ..Default::default()
    })
}
