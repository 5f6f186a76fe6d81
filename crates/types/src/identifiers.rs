//! Domain-specific identifier types.

use crate::Digest;
use sbor::prelude::*;
use std::fmt;

/// Block number (height in the chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct BlockNum(pub u32);

impl BlockNum {
    /// Genesis block number.
    pub const GENESIS: Self = BlockNum(0);

    /// Get the next block number.
    pub fn next(self) -> Self {
        BlockNum(self.0 + 1)
    }

    /// Get the previous block number (returns None if at genesis).
    pub fn prev(self) -> Option<Self> {
        if self.0 > 0 {
            Some(BlockNum(self.0 - 1))
        } else {
            None
        }
    }
}

impl Default for BlockNum {
    fn default() -> Self {
        BlockNum::GENESIS
    }
}

impl fmt::Display for BlockNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({})", self.0)
    }
}

/// A block identifier.
///
/// The first four bytes, big-endian, carry the block number so that the
/// number can be recovered from the id alone; the remaining 28 bytes come
/// from the header digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct BlockId(Digest);

impl BlockId {
    /// The zero id (used as the parent of the first block).
    pub const ZERO: Self = BlockId(Digest::ZERO);

    /// Build a block id from a block number and a header digest.
    pub fn new(num: BlockNum, header_digest: &Digest) -> Self {
        let mut bytes = header_digest.to_bytes();
        bytes[..4].copy_from_slice(&num.0.to_be_bytes());
        BlockId(Digest::from_raw(bytes))
    }

    /// Recover the block number embedded in the id.
    pub fn number(&self) -> BlockNum {
        let bytes = self.0.as_bytes();
        BlockNum(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// The underlying digest.
    pub fn as_digest(&self) -> &Digest {
        &self.0
    }

    /// Check if this is the zero id.
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId(#{} {})", self.number().0, self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Block producer identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, BasicSbor)]
#[sbor(transparent)]
pub struct ProducerId(pub u64);

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Producer({})", self.0)
    }
}

/// Block timestamp, measured in production slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct BlockTimestamp(pub u64);

impl BlockTimestamp {
    /// The timestamp of the next production slot.
    pub fn next(self) -> Self {
        BlockTimestamp(self.0 + 1)
    }

    /// The slot index.
    pub fn slot(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlockTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slot({})", self.0)
    }
}

/// Protocol round identifier: a block height paired with a phase counter,
/// ordered lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, BasicSbor)]
pub struct ViewNumber {
    /// Height of the block this round is about.
    pub block_num: BlockNum,
    /// Phase counter within the height (bumped on round timeout).
    pub phase_counter: u8,
}

impl ViewNumber {
    /// Create a new view number.
    pub fn new(block_num: BlockNum, phase_counter: u8) -> Self {
        Self {
            block_num,
            phase_counter,
        }
    }

    /// A dense ordering key: `(block_num << 32) | phase_counter`.
    pub fn key(&self) -> u64 {
        (u64::from(self.block_num.0) << 32) | u64::from(self.phase_counter)
    }

    /// The view reached by bumping the phase counter (round timeout).
    pub fn next_phase(self) -> Self {
        Self {
            block_num: self.block_num,
            phase_counter: self.phase_counter.wrapping_add(1),
        }
    }
}

impl fmt::Display for ViewNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.block_num.0, self.phase_counter)
    }
}
