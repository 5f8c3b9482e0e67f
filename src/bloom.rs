//! Versioned Bloom-filter broadcast subscription engine (§4.3, component C3).
//!
//! Each connection advertises the signals it wants by OR-ing hashed
//! subscription strings into a fixed-size [`Bloom`] filter. Each broadcast
//! message carries its own `Bloom` (the emitter's filter over the signal's
//! interface/member/path), and a connection receives it iff the message's
//! filter is a subset of the connection's mask: `(filter & !mask) == 0`.
//! False positives (an uninterested connection occasionally receives a
//! broadcast) are acceptable; false negatives (a subscribed connection
//! misses one) are not, which is exactly what the subset check guarantees.
//!
//! Masks are installed in strictly increasing *generations*, and each new
//! generation's bit set must be a superset of the last one's -- bits are
//! only ever added as more match rules accumulate, never removed, until the
//! whole mask is rebuilt from scratch under a fresh generation.

use crate::error::{BusError, Result};

/// Bits in a filter. 512 matches the `KDBUS_MSG_MAX_BLOOM_SIZE`-class
/// budgets this subsystem is modeled on: generous enough that unrelated
/// match rules rarely collide into one bit, and small enough that OR-ing
/// filters together is a handful of word operations.
pub const BLOOM_BITS: usize = 512;
const BLOOM_WORDS: usize = BLOOM_BITS / 64;

/// A fixed-size bit array used both as a broadcaster's per-message filter
/// and as a connection's subscription mask.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bloom {
    words: [u64; BLOOM_WORDS],
}

impl Bloom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hashes `data` under `hash_count` independent seeds and sets the
    /// resulting bits. Two base hashes are combined (Kirsch-Mitzenmacher
    /// double hashing) rather than computing `hash_count` fully independent
    /// hashes, which is the usual way to cheaply derive many bit positions
    /// from one string.
    pub fn add(&mut self, data: &[u8], hash_count: u32) {
        let (h1, h2) = double_hash(data);
        for i in 0..hash_count {
            let bit = h1.wrapping_add((i as u64).wrapping_mul(h2)) as usize % BLOOM_BITS;
            self.set_bit(bit);
        }
    }

    pub fn set_bit(&mut self, bit: usize) {
        self.words[bit / 64] |= 1u64 << (bit % 64);
    }

    pub fn is_bit_set(&self, bit: usize) -> bool {
        self.words[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    pub fn union(&mut self, other: &Bloom) {
        for (a, b) in self.words.iter_mut().zip(other.words.iter()) {
            *a |= b;
        }
    }

    /// True iff every bit set in `self` is also set in `other`, i.e. `self`
    /// is a subset of `other`.
    pub fn is_subset_of(&self, other: &Bloom) -> bool {
        self.words
            .iter()
            .zip(other.words.iter())
            .all(|(&a, &b)| a & !b == 0)
    }

    /// The core match test: does `mask` (a connection's subscription) admit
    /// `self` (a broadcast's filter)?
    pub fn matches(&self, mask: &Bloom) -> bool {
        self.is_subset_of(mask)
    }

    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != BLOOM_WORDS * 8 {
            return Err(BusError::MalformedHeader(format!(
                "bloom filter must be {} bytes, got {}",
                BLOOM_WORDS * 8,
                bytes.len()
            )));
        }
        let mut words = [0u64; BLOOM_WORDS];
        for (i, word) in words.iter_mut().enumerate() {
            *word = u64::from_le_bytes(bytes[i * 8..i * 8 + 8].try_into().unwrap());
        }
        Ok(Self { words })
    }
}

fn double_hash(data: &[u8]) -> (u64, u64) {
    (siphash(data, 0x5eed_0000_0000_0001), siphash(data, 0x5eed_0000_0000_0002))
}

/// A small non-cryptographic mix, not an actual SipHash -- the property we
/// need is "spreads input bits across the output", not collision
/// resistance against an adversary, since at worst a bad actor only earns
/// themselves extra false positives on their own subscription.
fn siphash(data: &[u8], seed: u64) -> u64 {
    let mut h = seed;
    for &b in data {
        h ^= b as u64;
        h = h.wrapping_mul(0x100000001b3);
        h ^= h >> 33;
    }
    h
}

/// A connection's subscription mask plus the generation it was installed
/// under. The generation lets the engine reject an out-of-order install
/// (§9 resolved open question: a generation that isn't strictly newer, or
/// whose bits aren't a superset of the current mask, is a USAGE error
/// rather than silently accepted or silently ignored).
#[derive(Clone, Debug, Default)]
pub struct Mask {
    generation: u32,
    bloom: Bloom,
}

impl Mask {
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn bloom(&self) -> &Bloom {
        &self.bloom
    }

    /// Installs a new generation. The first install (from the zero-value
    /// `Mask`) is always accepted; after that, `generation` must be
    /// strictly greater than the current one and `bloom` must be a
    /// superset of the current bloom.
    pub fn install(&mut self, generation: u32, bloom: Bloom) -> Result<()> {
        if self.generation != 0 || self.bloom != Bloom::default() {
            if generation <= self.generation {
                return Err(BusError::OutOfOrderGeneration {
                    installed: self.generation,
                    attempted: generation,
                });
            }
            if !self.bloom.is_subset_of(&bloom) {
                return Err(BusError::OutOfOrderGeneration {
                    installed: self.generation,
                    attempted: generation,
                });
            }
        }
        self.generation = generation;
        self.bloom = bloom;
        Ok(())
    }

    pub fn admits(&self, filter: &Bloom) -> bool {
        filter.matches(&self.bloom)
    }
}
