//! Sealed memory objects (§3 "Sealed memory object", component C1).
//!
//! A [`MemoryObject`] wraps a `memfd`-backed mapping that starts out
//! writable by its creator and can be sealed exactly once, after which it is
//! immutable and safe to hand to other connections by fd, never by copy.
//! Unsealing is only permitted while the object has a single owner, which is
//! how the receive side of the router tells "private scratch buffer" apart
//! from "payload another connection might still be reading".

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::unistd::ftruncate;
use parking_lot::Mutex;
use std::os::fd::{AsFd, OwnedFd};

use crate::error::{BusError, Result};

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

enum State {
    Mutable(OwnedFd, memmap2::MmapMut),
    Sealed(OwnedFd, memmap2::Mmap),
}

struct Inner {
    id: u64,
    len: u64,
    // `Option` only so `seal`/`unseal` can move the fd+mapping out of the
    // old variant and into the new one without a placeholder value.
    state: Mutex<Option<State>>,
}

/// A handle to a sealed-memory-object. Cloning shares the same underlying
/// `memfd` and mapping; [`MemoryObject::ref_count`] reports how many handles
/// currently exist, which is what [`MemoryObject::unseal`] consults.
#[derive(Clone)]
pub struct MemoryObject {
    inner: Arc<Inner>,
}

impl MemoryObject {
    /// Creates a new, writable memory object of `len` bytes.
    pub fn create(len: u64) -> Result<Self> {
        let (fd, map) = new_mutable_mapping(len)?;

        Ok(Self {
            inner: Arc::new(Inner {
                id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
                len,
                state: Mutex::new(Some(State::Mutable(fd, map))),
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Handles to this object currently outstanding, including `self`.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.inner.state.lock().as_ref(), Some(State::Sealed(..)))
    }

    /// Writes `data` at `offset`. Rejected once the object is sealed, per
    /// the one-way mutable-to-sealed transition.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        match state.as_mut().expect("state is only None mid-transition") {
            State::Sealed(..) => Err(BusError::WriteOnSealed),
            State::Mutable(_, map) => {
                let start = offset as usize;
                let end = start
                    .checked_add(data.len())
                    .filter(|&end| end <= map.len())
                    .ok_or_else(|| {
                        BusError::MalformedHeader(format!(
                            "write of {} bytes at offset {offset} exceeds object of length {}",
                            data.len(),
                            map.len()
                        ))
                    })?;
                map[start..end].copy_from_slice(data);
                Ok(())
            }
        }
    }

    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let state = self.inner.state.lock();
        let bytes: &[u8] = match state.as_ref().expect("state is only None mid-transition") {
            State::Mutable(_, map) => map,
            State::Sealed(_, map) => map,
        };
        let start = offset as usize;
        let end = start.checked_add(len as usize).filter(|&e| e <= bytes.len());
        let end = end.ok_or_else(|| {
            BusError::MalformedHeader(format!(
                "read of {len} bytes at offset {offset} exceeds object of length {}",
                bytes.len()
            ))
        })?;
        Ok(bytes[start..end].to_vec())
    }

    /// Dup's the underlying fd, for attaching a MEMFD record to an outgoing
    /// message without giving the receiver a handle into this process's
    /// `MemoryObject` bookkeeping.
    pub fn dup_fd(&self) -> Result<OwnedFd> {
        let state = self.inner.state.lock();
        let fd = match state.as_ref().expect("state is only None mid-transition") {
            State::Mutable(fd, _) | State::Sealed(fd, _) => fd,
        };
        Ok(fd.try_clone()?)
    }

    /// Seals the object: `F_SEAL_SEAL | F_SEAL_GROW | F_SEAL_SHRINK |
    /// F_SEAL_WRITE`. Acts as a release barrier -- every write that happened
    /// before this call is visible to every connection that later maps the
    /// same fd, without any further synchronization.
    pub fn seal(&self) -> Result<()> {
        use nix::fcntl::{fcntl, FcntlArg, SealFlag};

        let mut state = self.inner.state.lock();
        if matches!(state.as_ref().unwrap(), State::Sealed(..)) {
            return Ok(());
        }
        let Some(State::Mutable(fd, _)) = state.take() else {
            unreachable!()
        };

        fcntl(
            fd.as_fd(),
            FcntlArg::F_ADD_SEALS(
                SealFlag::F_SEAL_SEAL
                    | SealFlag::F_SEAL_GROW
                    | SealFlag::F_SEAL_SHRINK
                    | SealFlag::F_SEAL_WRITE,
            ),
        )?;

        let map_len = self.inner.len.max(1) as usize;
        let sealed = unsafe { memmap2::MmapOptions::new().len(map_len).map(&fd)? };
        *state = Some(State::Sealed(fd, sealed));
        Ok(())
    }

    /// Real `memfd` seals cannot be removed once added -- once `F_SEAL_WRITE`
    /// is set there is no way back on that fd. So "unsealing" here means
    /// replacing this object's backing `memfd` with a fresh, writable one,
    /// which is only safe while this is the only handle to the object: with
    /// more than one reference outstanding some other connection may still
    /// hold (and be reading through) the sealed fd this call would discard.
    pub fn unseal(&self) -> Result<()> {
        if self.ref_count() != 1 {
            return Err(BusError::UnsealShared);
        }

        let mut state = self.inner.state.lock();
        if matches!(state.as_ref().unwrap(), State::Mutable(..)) {
            return Ok(());
        }

        let (fd, map) = new_mutable_mapping(self.inner.len)?;
        *state = Some(State::Mutable(fd, map));
        Ok(())
    }
}

fn new_mutable_mapping(len: u64) -> Result<(OwnedFd, memmap2::MmapMut)> {
    let fd = memfd_create(c"kbusd-payload", MFdFlags::MFD_ALLOW_SEALING)?;
    ftruncate(fd.as_fd(), len as i64)?;

    let map = if len == 0 {
        // mmap rejects zero-length mappings; model the empty object as a
        // one-byte mutable buffer that seals trivially and is never read.
        unsafe { memmap2::MmapOptions::new().len(1).map_mut(&fd)? }
    } else {
        unsafe { memmap2::MmapOptions::new().len(len as usize).map_mut(&fd)? }
    };

    Ok((fd, map))
}

impl From<nix::Error> for BusError {
    fn from(e: nix::Error) -> Self {
        BusError::Io(std::io::Error::from(e))
    }
}
