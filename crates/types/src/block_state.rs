//! Block header state: a block id bound to its finality-ladder snapshot,
//! active policies, and Merkle accumulators.
//!
//! A state is immutable once constructed; the fork database and the
//! pacemaker share it by reference counting. `next()` is the header
//! validation transition: it derives the child state from a parent state
//! plus the inputs extracted from a building block.

use crate::{
    BlockHeader, BlockId, BlockNum, BlockTimestamp, BlockValidateError, Digest, FinalityCore,
    FinalizerPolicy, IncrementalMerkle, InstantFinalityExtension, ProducerId, ProposerPolicy,
    QcInfo, QuorumCertificate,
};
use sbor::prelude::*;

/// Inputs for building the next header state, extracted from a building
/// block.
#[derive(Debug, Clone)]
pub struct BlockHeaderStateInput {
    /// Id of the parent block.
    pub parent_id: BlockId,
    /// Production slot of the new block.
    pub timestamp: BlockTimestamp,
    /// Producer of the new block.
    pub producer: ProducerId,
    /// Merkle root over the block's transactions.
    pub transaction_mroot: Digest,
    /// Merkle root over the block's action receipts.
    pub action_mroot: Digest,
    /// Replacement proposer policy proposed by this block.
    pub new_proposer_policy: Option<ProposerPolicy>,
    /// Replacement finalizer policy proposed by this block.
    pub new_finalizer_policy: Option<FinalizerPolicy>,
    /// The QC embedded by this block, described.
    pub qc_info: Option<QcInfo>,
}

/// Immutable consensus state derived from a validated block header.
#[derive(Debug, Clone, PartialEq, Eq, BasicSbor)]
pub struct BlockHeaderState {
    /// Id of the block this state belongs to.
    pub id: BlockId,
    /// The validated header.
    pub header: BlockHeader,
    /// The finality ladder as of this block.
    pub core: FinalityCore,
    /// Append-only accumulator over proposal digests.
    pub proposal_mtree: IncrementalMerkle,
    /// Append-only accumulator over finality digests.
    pub finality_mtree: IncrementalMerkle,
    /// Finalizer committee active at this block.
    pub finalizer_policy: FinalizerPolicy,
    /// Producer schedule active at this block.
    pub proposer_policy: ProposerPolicy,
}

impl BlockHeaderState {
    /// The block number of this state.
    pub fn block_num(&self) -> BlockNum {
        self.header.block_num()
    }

    /// Production slot of this block.
    pub fn timestamp(&self) -> BlockTimestamp {
        self.header.timestamp
    }

    /// Producer of this block.
    pub fn producer(&self) -> ProducerId {
        self.header.producer
    }

    /// Id of the parent block.
    pub fn previous(&self) -> BlockId {
        self.header.previous
    }

    /// The producer entitled to the slot at `timestamp` under the active
    /// schedule.
    pub fn get_scheduled_producer(&self, timestamp: BlockTimestamp) -> Option<ProducerId> {
        self.proposer_policy.scheduled_producer(timestamp)
    }

    /// Blocks descending from this one need the provided QC in their
    /// header extension iff it is newer than the ladder's last QC.
    pub fn is_needed(&self, qc: &QuorumCertificate) -> bool {
        match self.core.last_qc_block_num {
            None => true,
            Some(last_qc) => qc.block_num > last_qc,
        }
    }

    /// Digest folded into the finality accumulator for this block.
    pub fn compute_finalizer_digest(&self) -> Digest {
        Digest::hash_parts(&[
            self.id.as_digest().as_bytes(),
            &self.core.last_final_block_num.0.to_le_bytes(),
            &self.finalizer_policy.generation.to_le_bytes(),
        ])
    }

    /// Derive the child state for a building block.
    ///
    /// Advances the finality ladder when `qc_info` is present; otherwise
    /// the ladder is carried over and the parent's `qc_info` is copied
    /// into the child's extension. A proposed finalizer policy gets
    /// `generation = parent generation + 1` and becomes active in the
    /// child, as does a proposed proposer policy.
    pub fn next(&self, input: BlockHeaderStateInput) -> Result<BlockHeaderState, BlockValidateError> {
        let core = match input.qc_info {
            Some(qc_info) => self
                .core
                .next(qc_info.last_qc_block_num, qc_info.is_last_qc_strong)?,
            None => self.core,
        };

        let new_finalizer_policy = input.new_finalizer_policy.map(|mut policy| {
            policy.generation = self.finalizer_policy.generation + 1;
            policy
        });

        let finalizer_policy = new_finalizer_policy
            .clone()
            .unwrap_or_else(|| self.finalizer_policy.clone());
        let proposer_policy = input
            .new_proposer_policy
            .clone()
            .unwrap_or_else(|| self.proposer_policy.clone());

        // A block that embeds no QC restates the parent's.
        let qc_info = match input.qc_info {
            Some(info) => Some(info),
            None => self
                .header
                .finality_extension()
                .ok()
                .flatten()
                .and_then(|ext| ext.qc_info),
        };

        let mut header = BlockHeader {
            timestamp: input.timestamp,
            producer: input.producer,
            previous: input.parent_id,
            transaction_mroot: input.transaction_mroot,
            action_mroot: input.action_mroot,
            schedule_version: proposer_policy.schedule_version,
            header_extensions: vec![],
        };
        header.emplace_finality_extension(&InstantFinalityExtension {
            qc_info,
            new_finalizer_policy,
            new_proposer_policy: input.new_proposer_policy,
        });

        let id = header.calculate_id();

        let mut proposal_mtree = self.proposal_mtree.clone();
        proposal_mtree.append(*id.as_digest());

        let core = FinalityCore {
            finalizer_policy_generation: finalizer_policy.generation,
            ..core
        };

        let mut result = BlockHeaderState {
            id,
            header,
            core,
            proposal_mtree,
            finality_mtree: self.finality_mtree.clone(),
            finalizer_policy,
            proposer_policy,
        };
        result.finality_mtree.append(result.compute_finalizer_digest());

        Ok(result)
    }
}
