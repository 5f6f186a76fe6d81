//! Consensus protocol messages.
//!
//! Four message kinds travel between nodes: proposals, votes, new-view
//! hand-offs, and new-block announcements. Votes are BLS signatures over a
//! proposal digest; quorum certificates travel in wire form
//! ([`QcMessage`]) with bitsets encoded as little-endian packed 32-bit
//! words.

use crate::{BlockId, BlockNum, BlsPublicKey, BlsSignature, Digest, ViewNumber};
use sbor::prelude::*;

/// Compute the digest a finalizer signs when voting on a proposal.
///
/// `SHA256(SHA256(block_id || phase_counter) || final_on_qc)`
pub fn proposal_digest(block_id: &BlockId, phase_counter: u8, final_on_qc: &Digest) -> Digest {
    let h1 = Digest::hash_parts(&[block_id.as_digest().as_bytes(), &[phase_counter]]);
    Digest::hash_parts(&[h1.as_bytes(), final_on_qc.as_bytes()])
}

/// Wire form of a quorum certificate.
///
/// Bitset words follow canonical committee order; an empty `proposal_id`
/// (zero digest) marks the absence of a certificate (genesis).
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct QcMessage {
    /// The proposal this certificate endorses.
    pub proposal_id: Digest,
    /// Strong-vote bitset words (may be empty).
    pub strong_votes: Vec<u32>,
    /// Weak-vote bitset words (non-empty implies the QC is weak).
    pub weak_votes: Vec<u32>,
    /// Aggregated signature over the proposal digest.
    pub active_agg_sig: BlsSignature,
}

impl QcMessage {
    /// A placeholder certificate for rounds with no justification yet.
    pub fn none() -> Self {
        Self {
            proposal_id: Digest::ZERO,
            strong_votes: vec![],
            weak_votes: vec![],
            active_agg_sig: BlsSignature::zero(),
        }
    }

    /// Whether this carries an actual certificate.
    pub fn is_present(&self) -> bool {
        !self.proposal_id.is_zero()
    }
}

/// A finalizer's vote on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct VoteMessage {
    /// The proposal being voted on.
    pub proposal_id: Digest,
    /// Vote flavor; weak votes count toward quorum but not toward strong
    /// finality.
    pub strong: bool,
    /// Key of the voting finalizer.
    pub finalizer_key: BlsPublicKey,
    /// BLS signature over the proposal digest.
    pub sig: BlsSignature,
}

/// A round proposal.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct ProposalMessage {
    /// Identifier of this proposal (its own digest).
    pub proposal_id: Digest,
    /// The block this proposal is about.
    pub block_id: BlockId,
    /// The proposal this one extends (zero digest for the first).
    pub parent_id: Digest,
    /// The proposal that becomes final if this one earns a QC.
    pub final_on_qc: Digest,
    /// Justification: the QC this proposal builds on.
    pub justify: QcMessage,
    /// Phase counter of the round.
    pub phase_counter: u8,
}

impl ProposalMessage {
    /// The digest finalizers sign when voting on this proposal.
    pub fn digest(&self) -> Digest {
        proposal_digest(&self.block_id, self.phase_counter, &self.final_on_qc)
    }

    /// The block number this proposal is about.
    pub fn block_num(&self) -> BlockNum {
        self.block_id.number()
    }

    /// The round this proposal belongs to.
    pub fn view_number(&self) -> ViewNumber {
        ViewNumber::new(self.block_id.number(), self.phase_counter)
    }
}

/// Round hand-off: carries the sender's high QC to the next leader.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewViewMessage {
    /// The highest QC known to the sender.
    pub high_qc: QcMessage,
}

/// Announcement of a newly produced block and the QC that justifies it.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct NewBlockMessage {
    /// The new block.
    pub block_id: BlockId,
    /// Justification carried along with the block.
    pub justify: QcMessage,
}

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub enum HsMessage {
    /// A finalizer vote.
    Vote(VoteMessage),
    /// A round proposal.
    Proposal(ProposalMessage),
    /// A round hand-off.
    NewView(NewViewMessage),
    /// A new-block announcement.
    NewBlock(NewBlockMessage),
}

/// Classification for dropped messages. Logged, never surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HsMessageWarning {
    /// Default code for dropped messages (irrelevant, redundant, ...).
    Discarded,
    /// Same message signature already seen.
    DuplicateSignature,
    /// Invalid message signature.
    InvalidSignature,
    /// Invalid message (other reason).
    Invalid,
}

/// Per-vote processing result, returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteStatus {
    /// Vote accepted and tallied.
    Success,
    /// This finalizer already voted with this flavor.
    Duplicate,
    /// The key is not in the committee.
    UnknownPublicKey,
    /// The signature does not verify over the proposal digest.
    InvalidSignature,
    /// The proposal being voted on is not known.
    UnknownBlock,
}
