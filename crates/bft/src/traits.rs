//! Seams to the surrounding node.
//!
//! The consensus core neither executes transactions nor touches the wire.
//! It reads chain state through [`ChainController`] and hands outbound
//! messages to a [`MessageSink`]; the node wires both to its block
//! production pipeline and network layer.

use instafin_types::{
    BlockHeaderState, FinalizerPolicy, NewBlockMessage, NewViewMessage, ProposalMessage,
    VoteMessage,
};
use std::sync::Arc;

/// Read access to the chain the consensus core runs on.
pub trait ChainController: Send + Sync {
    /// The current head block state.
    fn head_block_state(&self) -> Arc<BlockHeaderState>;

    /// The finalizer committee in effect for the head block.
    fn active_finalizer_policy(&self) -> Arc<FinalizerPolicy>;
}

/// Outbound message primitives.
///
/// Implementations typically enqueue onto the node's broadcast path; the
/// consensus core never blocks on delivery.
pub trait MessageSink: Send + Sync {
    /// Send a round proposal.
    fn send_proposal_msg(&self, msg: ProposalMessage);

    /// Send a finalizer vote (addressed to the round leader).
    fn send_vote_msg(&self, msg: VoteMessage);

    /// Send a round hand-off to the next leader.
    fn send_new_view_msg(&self, msg: NewViewMessage);

    /// Announce a newly produced block.
    fn send_new_block_msg(&self, msg: NewBlockMessage);
}

/// Chain-state snapshot handed to the QC chain on each entry.
///
/// The pacemaker implements this over its mutex-protected head snapshot so
/// that the QC chain reads one consistent view per entry point.
pub trait PacemakerView {
    /// Producer of the head block (the proposer of the current slot).
    fn proposer(&self) -> instafin_types::ProducerId;

    /// The round coordinator that aggregates votes.
    fn leader(&self) -> instafin_types::ProducerId;

    /// Leader of the next slot.
    fn next_leader(&self) -> instafin_types::ProducerId;

    /// The active finalizer committee.
    fn finalizers(&self) -> Arc<FinalizerPolicy>;

    /// Id of the current head block.
    fn current_block_id(&self) -> instafin_types::BlockId;

    /// Weight threshold for a strong quorum.
    fn quorum_threshold(&self) -> u64;
}
