//! Per-connection receive pool (§4.2, component C2).
//!
//! Every connection owns one pool: a fixed-size byte arena the router copies
//! delivered payloads into. `reserve`/`commit`/`free` is a simple bump
//! allocator with reclamation, modeled closely on the arena allocators in
//! this codebase's other fixed-capacity structures -- it never blocks and
//! never silently drops a message; it either fits or the caller gets
//! [`BusError::PoolFull`].

use std::collections::BTreeMap;

use crate::error::{BusError, Result};

/// A single reserved-and-committed region of the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub len: u64,
}

/// A fixed-capacity arena for one connection's incoming message payloads.
///
/// Allocation is a bump pointer that wraps to the start of the buffer once
/// it would run past the end, skipping over any still-committed regions;
/// this is the same amortized-`O(1)` "ring of live regions" shape used
/// elsewhere in this crate for fixed-size pools, just specialized to byte
/// ranges instead of fixed-size slots.
pub struct Pool {
    capacity: u64,
    /// Next offset the allocator will try. Always < capacity (or 0 if
    /// capacity is 0, which is never actually constructed).
    cursor: u64,
    /// Committed or reserved-but-not-yet-committed regions, keyed by start
    /// offset, so free-space search can binary search for overlaps.
    live: BTreeMap<u64, u64>,
}

impl Pool {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            cursor: 0,
            live: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn in_use(&self) -> u64 {
        self.live.values().sum()
    }

    /// Reserves `len` bytes and returns the offset of the new region. The
    /// caller must not read that region until a matching [`Pool::commit`];
    /// reservation exists so the router can compute an offset before it has
    /// fully materialized the payload.
    pub fn reserve(&mut self, len: u64) -> Result<u64> {
        if len > self.capacity {
            return Err(BusError::PoolFull);
        }

        // Try starting at the cursor first, then wrap to 0, each time
        // checking for any overlap with a still-live region.
        for start in [self.cursor, 0] {
            if let Some(offset) = self.find_free_run(start, len) {
                self.live.insert(offset, len);
                self.cursor = (offset + len) % self.capacity.max(1);
                return Ok(offset);
            }
        }

        Err(BusError::PoolFull)
    }

    fn find_free_run(&self, start: u64, len: u64) -> Option<u64> {
        if start + len > self.capacity {
            return None;
        }
        let end = start + len;
        let overlaps = self
            .live
            .range(..end)
            .next_back()
            .map(|(&o, &l)| o + l > start)
            .unwrap_or(false);
        if overlaps {
            None
        } else {
            Some(start)
        }
    }

    /// Marks a previously reserved region as committed. A no-op on the
    /// allocator's bookkeeping today (reserve already marks it live); kept
    /// as a distinct call so the router has a point at which "the bytes at
    /// this offset are now valid" is explicit, matching the reserve/commit
    /// split called out in the design.
    pub fn commit(&mut self, region: Region) -> Result<()> {
        match self.live.get(&region.offset) {
            Some(&len) if len == region.len => Ok(()),
            _ => Err(BusError::MailboxOverflow),
        }
    }

    /// Releases a region back to the pool once its message has been
    /// consumed by the application.
    pub fn free(&mut self, offset: u64) {
        self.live.remove(&offset);
    }
}
