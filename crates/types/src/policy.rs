//! Finalizer and proposer policies.
//!
//! The finalizer policy is the voting committee: an ordered sequence of
//! weighted BLS keys plus the strong-quorum threshold. Committee order is
//! canonical - it defines the bit position each finalizer occupies in vote
//! bitsets. The proposer policy is the production schedule used to map a
//! timestamp slot to the producer entitled to it.

use crate::{BlockTimestamp, BlsPublicKey, ProducerId};
use sbor::prelude::*;

/// A single committee member: key, weight, and a human-readable label.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalizerAuthority {
    /// Operator-chosen description (not consensus-relevant).
    pub description: String,
    /// Voting weight.
    pub weight: u64,
    /// BLS public key identifying the finalizer.
    pub public_key: BlsPublicKey,
}

/// The active finalizer committee.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct FinalizerPolicy {
    /// Monotone policy generation; incremented each time a block proposes
    /// a replacement policy.
    pub generation: u32,
    /// Weight threshold for a strong quorum.
    pub threshold: u64,
    /// Committee members in canonical (bitset) order.
    pub finalizers: Vec<FinalizerAuthority>,
}

impl FinalizerPolicy {
    /// Number of committee members.
    pub fn num_finalizers(&self) -> usize {
        self.finalizers.len()
    }

    /// Sum of all committee weights.
    pub fn total_weight(&self) -> u64 {
        self.finalizers.iter().map(|f| f.weight).sum()
    }

    /// The largest weak-vote weight that still leaves a strong quorum
    /// reachable. Once the weak sum exceeds this, even every remaining
    /// finalizer voting strong cannot reach `threshold`.
    pub fn max_weak_sum_before_weak_final(&self) -> u64 {
        self.total_weight().saturating_sub(self.threshold)
    }

    /// Canonical bitset position of a key, if it is in the committee.
    pub fn index_of(&self, key: &BlsPublicKey) -> Option<usize> {
        self.finalizers.iter().position(|f| &f.public_key == key)
    }

    /// Committee member at a canonical position.
    pub fn authority(&self, index: usize) -> Option<&FinalizerAuthority> {
        self.finalizers.get(index)
    }
}

/// The active producer schedule.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ProposerPolicy {
    /// Version of the schedule, carried into block headers.
    pub schedule_version: u32,
    /// Producers in slot-rotation order.
    pub proposer_schedule: Vec<ProducerId>,
}

impl ProposerPolicy {
    /// The producer entitled to the slot at `timestamp`.
    ///
    /// The schedule rotates one producer per slot.
    pub fn scheduled_producer(&self, timestamp: BlockTimestamp) -> Option<ProducerId> {
        if self.proposer_schedule.is_empty() {
            return None;
        }
        let idx = (timestamp.slot() % self.proposer_schedule.len() as u64) as usize;
        Some(self.proposer_schedule[idx])
    }
}
