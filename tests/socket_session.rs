//! End-to-end coverage of S1-S3 driven over real `UnixStream` sockets
//! through [`kbusd::session::serve`], the same way a separate client
//! process would talk to the bus -- as opposed to the in-process
//! `Router::send` unit tests in `src/router.rs`, which never touch the
//! wire codec or the socket transport at all.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use enumflags2::BitFlags;
use kbusd::bloom::Bloom;
use kbusd::control::ControlRequest;
use kbusd::policy::{Decision, Object, Rule, Subject, Verb};
use kbusd::router::Router;
use kbusd::subsystem::Subsystem;
use kbusd::wire::{Header, MemFdRef, Message, Record, DST_BROADCAST, HEADER_SIZE, PAYLOAD_TYPE_CONTROL, PAYLOAD_TYPE_DBUS};
use memmap2::MmapOptions;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use tokio::io::Interest;
use tokio::net::UnixStream;

async fn write_frame(stream: &UnixStream, msg: &Message) {
    let bytes = msg.encode();
    let mut offset = 0;
    while offset < bytes.len() {
        stream.writable().await.unwrap();
        match stream.try_write(&bytes[offset..]) {
            Ok(n) => offset += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("write failed: {e}"),
        }
    }
}

async fn read_frame(stream: &UnixStream) -> Message {
    let mut header_buf = [0u8; HEADER_SIZE];
    read_exact(stream, &mut header_buf).await;
    let header = Header::decode(&header_buf).unwrap();
    let mut buf = vec![0u8; header.size as usize];
    buf[..HEADER_SIZE].copy_from_slice(&header_buf);
    read_exact(stream, &mut buf[HEADER_SIZE..]).await;
    Message::decode(&buf).unwrap()
}

async fn read_exact(stream: &UnixStream, buf: &mut [u8]) {
    let mut filled = 0;
    while filled < buf.len() {
        stream.readable().await.unwrap();
        match stream.try_read(&mut buf[filled..]) {
            Ok(0) => panic!("unexpected eof"),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

/// Ceiling on fds a single test `recvmsg` accepts, mirroring
/// `session::MAX_FDS_PER_RECVMSG`.
const MAX_FDS_PER_RECVMSG: usize = 16;

/// Like [`read_frame`], but also captures any fds handed over as SCM_RIGHTS
/// ancillary data -- a plain `try_read` would silently let the kernel close
/// them, the same trap a receiving client process would have to avoid.
async fn read_frame_with_fds(stream: &UnixStream) -> (Message, Vec<OwnedFd>) {
    let mut fds = Vec::new();
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = recv_fill_with_fds(stream, &mut header_buf, 0, &mut fds).await;
    while filled < HEADER_SIZE {
        filled = recv_fill_with_fds(stream, &mut header_buf, filled, &mut fds).await;
    }
    let header = Header::decode(&header_buf).unwrap();
    let mut buf = vec![0u8; header.size as usize];
    buf[..HEADER_SIZE].copy_from_slice(&header_buf);
    let mut filled = filled;
    while filled < buf.len() {
        filled = recv_fill_with_fds(stream, &mut buf, filled, &mut fds).await;
    }
    (Message::decode(&buf).unwrap(), fds)
}

async fn recv_fill_with_fds(stream: &UnixStream, buf: &mut [u8], filled: usize, fds: &mut Vec<OwnedFd>) -> usize {
    loop {
        stream.readable().await.unwrap();
        let mut cmsg_buffer = nix::cmsg_space!([RawFd; MAX_FDS_PER_RECVMSG]);
        let raw_fd = stream.as_raw_fd();
        let result = stream.try_io(Interest::READABLE, || {
            let mut iov = [std::io::IoSliceMut::new(&mut buf[filled..])];
            recvmsg::<()>(raw_fd, &mut iov, Some(&mut cmsg_buffer), MsgFlags::empty()).map_err(std::io::Error::from)
        });
        match result {
            Ok(received) => {
                for cmsg in received.cmsgs().unwrap() {
                    if let ControlMessageOwned::ScmRights(raw) = cmsg {
                        for fd in raw {
                            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                return filled + received.bytes;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => panic!("read failed: {e}"),
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unicast_broadcast_and_name_resolution_over_real_sockets() {
    let subsystem = Subsystem::start();
    let bus = subsystem.open_control().make_bus("test", 0, 0o666, 0, 0).unwrap();
    let endpoint = bus.default_endpoint();
    let router = Arc::new(Router::new(bus.clone()));

    let (client_a, server_a) = UnixStream::pair().unwrap();
    let (client_b, server_b) = UnixStream::pair().unwrap();
    let session_a = tokio::spawn(kbusd::session::serve(server_a, bus.clone(), endpoint.clone(), router.clone(), 64 * 1024));
    let session_b = tokio::spawn(kbusd::session::serve(server_b, bus.clone(), endpoint.clone(), router.clone(), 64 * 1024));

    let a_id = hello_raw(&client_a, 1).await;
    let b_id = hello_raw(&client_b, 1).await;

    let mut policy = bus.policy();
    policy.push(Rule::new(Subject::World, Verb::TalkTo, Object::Name(b_id.to_string()), Decision::Allow));
    policy.push(Rule::new(Subject::World, Verb::TalkTo, Object::Name("org.example.Echo".into()), Decision::Allow));
    bus.set_policy(policy);

    // S1: unicast by numeric id.
    write_frame(
        &client_a,
        &Message {
            header: Header {
                dst_id: b_id,
                payload_type: PAYLOAD_TYPE_DBUS,
                cookie: 2,
                ..Default::default()
            },
            records: vec![Record::Inline(b"hi".to_vec())],
        },
    )
    .await;
    let received = read_frame(&client_b).await;
    assert_eq!(received.header.src_id, a_id);
    assert_eq!(received.records[0], Record::Inline(b"hi".to_vec()));

    // S2: B claims a well-known name, A addresses it by name.
    request_name_raw(&client_b, "org.example.Echo").await;
    write_frame(
        &client_a,
        &Message {
            header: Header {
                dst_id: 0,
                payload_type: PAYLOAD_TYPE_DBUS,
                cookie: 3,
                ..Default::default()
            },
            records: vec![Record::Inline(b"by name".to_vec()), Record::Name("org.example.Echo".into())],
        },
    )
    .await;
    let received = read_frame(&client_b).await;
    assert_eq!(received.records[0], Record::Inline(b"by name".to_vec()));

    // S3: B installs a subscription mask; A broadcasts a matching filter.
    let mut mask = Bloom::new();
    mask.set_bit(3);
    install_mask_raw(&client_b, 1, mask.clone()).await;

    write_frame(
        &client_a,
        &Message {
            header: Header {
                dst_id: DST_BROADCAST,
                payload_type: PAYLOAD_TYPE_DBUS,
                cookie: 4,
                ..Default::default()
            },
            records: vec![Record::Bloom {
                generation: 1,
                bits: mask.to_le_bytes(),
            }],
        },
    )
    .await;
    let received = read_frame(&client_b).await;
    assert!(matches!(&received.records[0], Record::Bloom { .. }));

    drop(client_a);
    drop(client_b);
    let _ = tokio::time::timeout(Duration::from_secs(1), session_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), session_b).await;
}

async fn hello_raw(stream: &UnixStream, cookie: u64) -> u64 {
    write_frame(
        stream,
        &Message {
            header: Header {
                payload_type: PAYLOAD_TYPE_CONTROL,
                cookie,
                ..Default::default()
            },
            records: vec![Record::Inline(ControlRequest::Hello.encode())],
        },
    )
    .await;
    let reply = read_frame(stream).await;
    let Record::Inline(body) = &reply.records[0] else {
        panic!("expected inline control reply body");
    };
    // HELLO's reply tag is a fixed single byte followed by the assigned id
    // as a little-endian u64 -- see `ControlReply::encode`'s `Hello` arm.
    assert_eq!(body[0], 1);
    u64::from_le_bytes(body[1..9].try_into().unwrap())
}

async fn request_name_raw(stream: &UnixStream, name: &str) {
    write_frame(
        stream,
        &Message {
            header: Header {
                payload_type: PAYLOAD_TYPE_CONTROL,
                cookie: 10,
                ..Default::default()
            },
            records: vec![Record::Inline(
                ControlRequest::RequestName {
                    name: name.to_string(),
                    flags: BitFlags::empty(),
                }
                .encode(),
            )],
        },
    )
    .await;
    read_frame(stream).await;
}

async fn install_mask_raw(stream: &UnixStream, generation: u32, bloom: Bloom) {
    write_frame(
        stream,
        &Message {
            header: Header {
                payload_type: PAYLOAD_TYPE_CONTROL,
                cookie: 11,
                ..Default::default()
            },
            records: vec![Record::Inline(ControlRequest::InstallMask { generation, bloom }.encode())],
        },
    )
    .await;
    read_frame(stream).await;
}

async fn memfd_new_raw(stream: &UnixStream, len: u64) -> (u64, OwnedFd) {
    write_frame(
        stream,
        &Message {
            header: Header {
                payload_type: PAYLOAD_TYPE_CONTROL,
                cookie: 20,
                ..Default::default()
            },
            records: vec![Record::Inline(ControlRequest::MemfdNew { len }.encode())],
        },
    )
    .await;
    let (reply, mut fds) = read_frame_with_fds(stream).await;
    let Record::Inline(body) = &reply.records[0] else {
        panic!("expected inline control reply body");
    };
    // MEMFD_NEW's reply tag is a fixed single byte, followed by the object
    // id and fd index as little-endian integers -- see `ControlReply::encode`'s
    // `MemfdNew` arm.
    assert_eq!(body[0], 11);
    let object_id = u64::from_le_bytes(body[1..9].try_into().unwrap());
    let fd = fds.pop().expect("MemfdNew reply should carry its object's fd via SCM_RIGHTS");
    (object_id, fd)
}

async fn memfd_seal_raw(stream: &UnixStream, object_id: u64) {
    write_frame(
        stream,
        &Message {
            header: Header {
                payload_type: PAYLOAD_TYPE_CONTROL,
                cookie: 21,
                ..Default::default()
            },
            records: vec![Record::Inline(ControlRequest::MemfdSeal { object_id }.encode())],
        },
    )
    .await;
    read_frame(stream).await;
}

/// S6 over real sockets, closing the gap the in-process
/// `memfd_transfer.rs` test can't reach: a `Record::MemFd` must actually
/// carry its object's fd as SCM_RIGHTS ancillary data to a genuine
/// out-of-process receiver, not just be visible via a same-process
/// `lookup_object` call.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sealed_memfd_payload_is_delivered_as_scm_rights_to_a_real_peer() {
    let subsystem = Subsystem::start();
    let bus = subsystem.open_control().make_bus("test", 0, 0o666, 0, 0).unwrap();
    let endpoint = bus.default_endpoint();
    let router = Arc::new(Router::new(bus.clone()));

    let (client_a, server_a) = UnixStream::pair().unwrap();
    let (client_b, server_b) = UnixStream::pair().unwrap();
    let session_a = tokio::spawn(kbusd::session::serve(server_a, bus.clone(), endpoint.clone(), router.clone(), 64 * 1024));
    let session_b = tokio::spawn(kbusd::session::serve(server_b, bus.clone(), endpoint.clone(), router.clone(), 64 * 1024));

    let a_id = hello_raw(&client_a, 1).await;
    let b_id = hello_raw(&client_b, 1).await;
    let _ = a_id;

    let mut policy = bus.policy();
    policy.push(Rule::new(Subject::World, Verb::TalkTo, Object::Name(b_id.to_string()), Decision::Allow));
    bus.set_policy(policy);

    let (object_id, fd) = memfd_new_raw(&client_a, 4096).await;
    let payload = b"payload via real SCM_RIGHTS";
    {
        // SAFETY: this is the sole mapping of the fd right now, and the
        // object is still unsealed.
        let mut map = unsafe { MmapOptions::new().len(4096).map_mut(&fd).unwrap() };
        map[..payload.len()].copy_from_slice(payload);
    }
    memfd_seal_raw(&client_a, object_id).await;

    write_frame(
        &client_a,
        &Message {
            header: Header {
                dst_id: b_id,
                payload_type: PAYLOAD_TYPE_DBUS,
                cookie: 30,
                ..Default::default()
            },
            records: vec![Record::MemFd(MemFdRef {
                object_id,
                offset: 0,
                length: 4096,
            })],
        },
    )
    .await;

    let (received, mut fds) = read_frame_with_fds(&client_b).await;
    let Record::MemFd(r) = &received.records[0] else {
        panic!("expected a MemFd record");
    };
    assert_eq!(r.object_id, object_id);
    let peer_fd = fds.pop().expect("the MemFd record's object should ride along as SCM_RIGHTS ancillary data");
    // SAFETY: read-only mapping of a sealed memfd.
    let peer_map = unsafe { MmapOptions::new().len(4096).map(&peer_fd).unwrap() };
    assert_eq!(&peer_map[..payload.len()], payload);

    drop(client_a);
    drop(client_b);
    let _ = tokio::time::timeout(Duration::from_secs(1), session_a).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), session_b).await;
}
